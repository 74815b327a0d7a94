//! Shared scripted-server harness for the integration tests under `tests/`.
//!
//! Mirrors the teacher's `tests/chaos_engineering.rs` shape (an in-process
//! fault-injecting peer driving the crate under test) but scripts a real
//! KNXnet/IP secure-session peer instead of a cluster of coordinator nodes.

#![allow(dead_code)]

use knx_ip_secure_core::codec::{Header, ServiceType};
use knx_ip_secure_core::crypto::{cbc_mac, ctr_xor, mac_security_info, Key16, KeyAgreement};
use knx_ip_secure_core::secure::wrapper;
use rand::rngs::OsRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// An in-process KNXnet/IP peer the crate under test connects to.
pub struct ScriptedServer {
    listener: TcpListener,
}

impl ScriptedServer {
    /// Binds to an ephemeral local port.
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accepts the single inbound connection the test client makes.
    pub async fn accept(&self) -> TcpStream {
        let (stream, _) = self.listener.accept().await.unwrap();
        stream.set_nodelay(true).ok();
        stream
    }
}

/// Reads one full KNXnet/IP frame (header + body) off `stream`.
pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await.unwrap();
    let total_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut frame = header.to_vec();
    let mut body = vec![0u8; total_len - 6];
    stream.read_exact(&mut body).await.unwrap();
    frame.append(&mut body);
    frame
}

pub async fn write_frame(stream: &mut TcpStream, frame: &[u8]) {
    stream.write_all(frame).await.unwrap();
    stream.flush().await.unwrap();
}

/// Server-side half of the secure-session handshake (`spec.md` §4.4): reads
/// the client's `SessionRequest`, replies with a `SessionResponse` bound to
/// `session_id` (device-authentication MAC left as all-zero — only valid
/// against a client constructed with no device auth key), reads (and
/// discards) the client's wrapped `SessionAuth`, then sends a wrapped
/// `SessionStatus(AuthSuccess)`. Returns the session id and the derived
/// session key so the caller can script further wrapped traffic.
pub async fn run_handshake(stream: &mut TcpStream, session_id: u16, serial: [u8; 6]) -> (u16, Key16) {
    let request = read_frame(stream).await;
    let client_pub: [u8; 32] = request[14..46].try_into().unwrap();

    let agreement = KeyAgreement::generate(OsRng);
    let server_pub = agreement.public_key_bytes();
    let session_key = agreement.derive_session_key(&client_pub);

    let mut response_body = Vec::with_capacity(2 + 32 + 16);
    response_body.extend_from_slice(&session_id.to_be_bytes());
    response_body.extend_from_slice(&server_pub);
    response_body.extend_from_slice(&[0u8; 16]);
    let header = Header::new(ServiceType::SessionResponse, response_body.len() as u16);
    let mut response = header.serialize().to_vec();
    response.extend_from_slice(&response_body);
    write_frame(stream, &response).await;

    let _session_auth = read_frame(stream).await;

    let status_header = Header::new(ServiceType::SessionStatus, 1);
    let mut status_plain = status_header.serialize().to_vec();
    status_plain.push(0);
    let wrapped = wrapper::wrap(&status_plain, session_id, 0, serial, 0, &session_key);
    write_frame(stream, &wrapped).await;

    (session_id, session_key)
}

/// The handshake-phase MAC's associated data, mirroring
/// `secure::session::handshake_associated_data` (`spec.md` §4.4 step 2):
/// `16B zeros ‖ 2B msgLen=6+2+32 ‖ header ‖ field(2B) ‖ xoredKeys(32B)`.
fn handshake_associated_data(header_bytes: &[u8; 6], field: u16, xored: &[u8]) -> Vec<u8> {
    let msg_len = (6 + 2 + 32) as u16;
    let mut buf = Vec::with_capacity(16 + 2 + 6 + 2 + 32);
    buf.extend_from_slice(&[0u8; 16]);
    buf.extend_from_slice(&msg_len.to_be_bytes());
    buf.extend_from_slice(header_bytes);
    buf.extend_from_slice(&field.to_be_bytes());
    buf.extend_from_slice(xored);
    buf
}

/// Server-side handshake variant that computes a real device-authentication
/// MAC under `device_auth_key` (`spec.md` §4.4 step 2), rather than the
/// all-zero MAC `run_handshake` sends for the skip-verification path. When
/// `corrupt_mac` is set, a bit of the encrypted MAC is flipped before
/// sending, so a client holding the same `device_auth_key` must reject the
/// handshake with `AuthenticationFailed` instead of reaching `Authenticated`.
///
/// Returns `None` when `corrupt_mac` is set: the client never gets far
/// enough to send `SessionAuth`, so there is nothing further to script.
pub async fn run_handshake_with_device_auth(
    stream: &mut TcpStream,
    session_id: u16,
    serial: [u8; 6],
    device_auth_key: &Key16,
    corrupt_mac: bool,
) -> Option<(u16, Key16)> {
    let request = read_frame(stream).await;
    let client_pub: [u8; 32] = request[14..46].try_into().unwrap();

    let agreement = KeyAgreement::generate(OsRng);
    let server_pub = agreement.public_key_bytes();
    let session_key = agreement.derive_session_key(&client_pub);

    let xored: Vec<u8> = server_pub.iter().zip(client_pub.iter()).map(|(a, b)| a ^ b).collect();

    let response_header = Header::new(ServiceType::SessionResponse, 2 + 32 + 16);
    let response_header_bytes = response_header.serialize();
    let ad = handshake_associated_data(&response_header_bytes, session_id, &xored);
    let mut mac = cbc_mac(device_auth_key, &ad);
    let mac_info = mac_security_info(&[0u8; 6], 0, 0);
    ctr_xor(device_auth_key, mac_info, &mut mac);
    if corrupt_mac {
        mac[0] ^= 0x01;
    }

    let mut response = response_header_bytes.to_vec();
    response.extend_from_slice(&session_id.to_be_bytes());
    response.extend_from_slice(&server_pub);
    response.extend_from_slice(&mac);
    write_frame(stream, &response).await;

    if corrupt_mac {
        return None;
    }

    let _session_auth = read_frame(stream).await;

    let status_header = Header::new(ServiceType::SessionStatus, 1);
    let mut status_plain = status_header.serialize().to_vec();
    status_plain.push(0);
    let wrapped = wrapper::wrap(&status_plain, session_id, 0, serial, 0, &session_key);
    write_frame(stream, &wrapped).await;

    Some((session_id, session_key))
}

/// Wraps and writes a `TunnelingRequest` carrying `channel` at body byte 1,
/// the layout `spec.md` §6.1 specifies for this service type.
pub async fn send_wrapped_tunneling_request(
    stream: &mut TcpStream,
    session_id: u16,
    seq: u64,
    serial: [u8; 6],
    key: &Key16,
    channel: u8,
) {
    let inner_header = Header::new(ServiceType::TunnelingRequest, 2);
    let mut plain = inner_header.serialize().to_vec();
    plain.push(4); // sub-header length, arbitrary for this harness
    plain.push(channel);
    let wrapped = wrapper::wrap(&plain, session_id, seq, serial, 0, key);
    write_frame(stream, &wrapped).await;
}
