//! Secure session state machine: handshake, steady-state keep-alive,
//! sequence-number enforcement, and close (`spec.md` §4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::codec::{Header, Hpai, ServiceType};
use crate::config::SessionConfig;
use crate::crypto::{self, Key16, KeyAgreement};
use crate::decoder::FrameDecoder;
use crate::error::{Error, Result};
use crate::secure::wrapper;
use crate::transport::connection::Inner;
use crate::transport::subconnection::{Registry, SubConnection};
use crate::types::{SerialNumber, UserId};

/// Lifecycle of a secure session (`spec.md` §3, §4.4). `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Unauthenticated,
    Authenticated,
    Closed,
}

/// An authenticated, encrypted channel to a KNXnet/IP server, multiplexing
/// its own secured sub-connections.
pub struct SecureSession {
    connection: Weak<Inner>,
    config: SessionConfig,
    user: UserId,
    user_key: Key16,
    device_auth_key: Option<Key16>,
    serial: SerialNumber,

    state: Mutex<SessionState>,
    session_id: Mutex<Option<u16>>,
    session_key: Mutex<Option<Key16>>,
    handshake_secret: Mutex<Option<(KeyAgreement, [u8; 32])>>,

    send_seq: AtomicU64,
    rcv_seq: AtomicU64,

    write_lock: tokio::sync::Mutex<()>,
    keep_alive: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    close_notify: Arc<tokio::sync::Notify>,

    session_response_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    session_status_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,

    subs: Registry,
}

impl SecureSession {
    pub(crate) fn new(
        connection: Weak<Inner>,
        config: SessionConfig,
        user: UserId,
        user_key: Key16,
        device_auth_key: Option<Key16>,
        serial: SerialNumber,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            config,
            user,
            user_key,
            device_auth_key,
            serial,
            state: Mutex::new(SessionState::Idle),
            session_id: Mutex::new(None),
            session_key: Mutex::new(None),
            handshake_secret: Mutex::new(None),
            send_seq: AtomicU64::new(0),
            rcv_seq: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            keep_alive: tokio::sync::Mutex::new(None),
            close_notify: Arc::new(tokio::sync::Notify::new()),
            session_response_tx: Mutex::new(None),
            session_status_tx: Mutex::new(None),
            subs: Registry::new(),
        })
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn session_id(&self) -> Option<u16> {
        *self.session_id.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.state.lock() == SessionState::Authenticated
    }

    /// Opens a new secured sub-connection, queued Pending on this session's
    /// FIFO (`spec.md` §4.6).
    pub fn open_sub_connection(
        self: &Arc<Self>,
        decoder: Option<Arc<dyn FrameDecoder>>,
    ) -> (Arc<SubConnection>, tokio::sync::mpsc::UnboundedReceiver<crate::decoder::DecodedFrame>) {
        let (sub, rx) = SubConnection::new(decoder);
        self.subs.register_pending(sub.clone());
        (sub, rx)
    }

    fn next_send_seq(&self) -> u64 {
        self.send_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Establishes the session if not already authenticated; idempotent
    /// (`spec.md` §6.2 `ensureOpen`). Drives the two-half handshake under
    /// the connection's `sessionRequestLock` (`spec.md` §4.4, §5).
    pub async fn ensure_open(self: &Arc<Self>) -> Result<()> {
        if *self.state.lock() == SessionState::Authenticated {
            return Ok(());
        }

        let conn = self.connection.upgrade().ok_or_else(closed_connection_error)?;
        let _guard = conn.session_request_lock().lock().await;

        if *self.state.lock() == SessionState::Authenticated {
            return Ok(());
        }

        let agreement = KeyAgreement::generate(OsRng);
        let client_pub = agreement.public_key_bytes();
        *self.handshake_secret.lock() = Some((agreement, client_pub));

        conn.bind_pending_session(self.clone());

        let (resp_tx, resp_rx) = oneshot::channel();
        *self.session_response_tx.lock() = Some(resp_tx);

        let half_deadline = self.config.handshake_half_deadline;
        let request_body = build_session_request_body(client_pub);
        let header = Header::new(ServiceType::SessionRequest, request_body.len() as u16);
        let mut frame = header.serialize().to_vec();
        frame.extend_from_slice(&request_body);

        if let Err(e) = conn.write_frame(&frame).await {
            conn.clear_pending_session();
            *self.session_response_tx.lock() = None;
            return Err(e);
        }

        match tokio::time::timeout(half_deadline, resp_rx).await {
            Err(_elapsed) => {
                conn.clear_pending_session();
                *self.session_response_tx.lock() = None;
                *self.state.lock() = SessionState::Idle;
                return Err(Error::SessionTimeout {
                    stage: "session_request",
                    elapsed_ms: half_deadline.as_millis() as u64,
                });
            }
            Ok(Err(_canceled)) => {
                *self.state.lock() = SessionState::Idle;
                return Err(Error::Interrupted {
                    operation: "awaiting session response",
                });
            }
            Ok(Ok(Err(e))) => {
                *self.state.lock() = SessionState::Idle;
                return Err(e);
            }
            Ok(Ok(Ok(()))) => {}
        }

        let (status_tx, status_rx) = oneshot::channel();
        *self.session_status_tx.lock() = Some(status_tx);

        match tokio::time::timeout(half_deadline, status_rx).await {
            Err(_elapsed) => {
                *self.state.lock() = SessionState::Idle;
                Err(Error::SessionTimeout {
                    stage: "session_auth",
                    elapsed_ms: half_deadline.as_millis() as u64,
                })
            }
            Ok(Err(_canceled)) => {
                *self.state.lock() = SessionState::Idle;
                Err(Error::Interrupted {
                    operation: "awaiting session status",
                })
            }
            Ok(Ok(result)) => result,
        }
    }

    /// Sends `plain` wrapped under this session's key, establishing it first
    /// if necessary. `spec.md` §5 recommends serializing wrap-then-write per
    /// session under `write_lock` so on-wire ordering stays monotone.
    pub async fn send(self: &Arc<Self>, plain: &[u8]) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.write_lock.lock().await;
        let key = self
            .session_key
            .lock()
            .clone()
            .ok_or_else(|| Error::AuthenticationFailed {
                reason: "session has no bound key",
            })?;
        let session_id = self.session_id.lock().ok_or_else(|| Error::AuthenticationFailed {
            reason: "session has no bound id",
        })?;
        let seq = self.next_send_seq();
        let wrapped = wrapper::wrap(plain, session_id, seq, self.serial.0, 0, &key);
        let conn = self.connection.upgrade().ok_or_else(closed_connection_error)?;
        conn.write_frame(&wrapped).await
    }

    /// Handles a plaintext `SessionResponse` frame delivered by the
    /// connection's receive loop (`spec.md` §4.4 step 2).
    pub(crate) async fn on_session_response(self: &Arc<Self>, header_bytes: [u8; 6], body: &[u8]) {
        let result = self.handle_session_response(header_bytes, body).await;
        if let Some(tx) = self.session_response_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    async fn handle_session_response(self: &Arc<Self>, header_bytes: [u8; 6], body: &[u8]) -> Result<()> {
        if body.len() < 2 + 32 + 16 {
            return Err(Error::FrameMalformed {
                reason: "session response shorter than 50 bytes",
            });
        }
        let session_id = u16::from_be_bytes([body[0], body[1]]);
        if session_id == 0 {
            return Err(Error::AuthenticationFailed {
                reason: "server reports no sessions available",
            });
        }
        let mut server_pub = [0u8; 32];
        server_pub.copy_from_slice(&body[2..34]);
        let mut mac_ct: [u8; 16] = body[34..50].try_into().unwrap();

        let (agreement, client_pub) = self
            .handshake_secret
            .lock()
            .take()
            .ok_or_else(|| Error::AuthenticationFailed {
                reason: "session response arrived without a pending handshake",
            })?;
        let session_key = agreement.derive_session_key(&server_pub);

        let xored: Vec<u8> = server_pub.iter().zip(client_pub.iter()).map(|(a, b)| a ^ b).collect();

        if let Some(dev_key) = &self.device_auth_key {
            let mac_info = handshake_mac_info_block();
            crypto::ctr_xor(dev_key, mac_info, &mut mac_ct);
            let ad = handshake_associated_data(&header_bytes, session_id, &xored);
            let expected = crypto::cbc_mac(dev_key, &ad);
            if !crypto::mac_eq(&expected, &mac_ct) {
                return Err(Error::AuthenticationFailed {
                    reason: "device authentication MAC mismatch",
                });
            }
        } else {
            warn!("device authentication key is zero; skipping device MAC verification");
        }

        *self.session_id.lock() = Some(session_id);
        *self.session_key.lock() = Some(session_key.clone());

        let conn = self.connection.upgrade().ok_or_else(closed_connection_error)?;
        conn.register_session(session_id, self.clone());
        conn.clear_pending_session();

        let auth_header = Header::new(ServiceType::SessionAuth, 2 + 16);
        let auth_header_bytes = auth_header.serialize();
        let ad = handshake_associated_data(&auth_header_bytes, self.user.get() as u16, &xored);
        let mut auth_mac = crypto::cbc_mac(&self.user_key, &ad);
        crypto::ctr_xor(&self.user_key, handshake_mac_info_block(), &mut auth_mac);

        let mut plain = Vec::with_capacity(6 + 2 + 16);
        plain.extend_from_slice(&auth_header_bytes);
        plain.extend_from_slice(&(self.user.get() as u16).to_be_bytes());
        plain.extend_from_slice(&auth_mac);

        *self.state.lock() = SessionState::Unauthenticated;

        let seq = self.next_send_seq();
        let wrapped = wrapper::wrap(&plain, session_id, seq, self.serial.0, 0, &session_key);
        conn.write_frame(&wrapped).await?;

        Ok(())
    }

    /// Handles an inbound `SecureWrapper` frame (`spec.md` §4.3, §4.4 steady state).
    pub(crate) async fn on_wrapped_frame(self: &Arc<Self>, frame: &[u8]) {
        let key = self.session_key.lock().clone();
        let Some(key) = key else {
            warn!("secure wrapper received before a session key is bound, dropping");
            return;
        };
        match wrapper::unwrap(frame, &key) {
            Ok(unwrapped) => self.handle_unwrapped(unwrapped).await,
            Err(e) => {
                warn!(error = %e, "secure wrapper failed to unwrap");
                if matches!(e, Error::AuthenticationFailed { .. }) {
                    self.close().await;
                }
            }
        }
    }

    async fn handle_unwrapped(self: &Arc<Self>, unwrapped: wrapper::Unwrapped) {
        let bound = *self.session_id.lock();
        if bound != Some(unwrapped.session_id) {
            let err = Error::SessionMismatch {
                frame_session_id: unwrapped.session_id,
                bound_session_id: bound.unwrap_or(0),
            };
            warn!(%err, "dropping frame addressed to a foreign session id");
            return;
        }

        let expected = self.rcv_seq.load(Ordering::SeqCst);
        if unwrapped.seq < expected {
            let err = Error::ReplayDetected {
                session_id: unwrapped.session_id,
                got: unwrapped.seq,
                expected,
            };
            warn!(%err, "closing session");
            self.close().await;
            return;
        }
        self.rcv_seq.store(unwrapped.seq + 1, Ordering::SeqCst);

        if unwrapped.tag != 0 {
            warn!(tag = unwrapped.tag, "non-zero message tag, dropping frame");
            return;
        }

        let inner_header = match Header::parse(&unwrapped.plaintext) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "malformed inner frame inside secure wrapper");
                return;
            }
        };
        if inner_header.total_length as usize > unwrapped.plaintext.len() {
            warn!(
                total_length = inner_header.total_length,
                plaintext_len = unwrapped.plaintext.len(),
                "inner frame declares a total_length longer than the decrypted plaintext, dropping"
            );
            return;
        }
        let inner_body = &unwrapped.plaintext[6..inner_header.total_length as usize];

        match inner_header.service_type() {
            Some(ServiceType::SessionStatus) => self.on_session_status(inner_body).await,
            Some(service_type) => self.subs.dispatch(service_type, inner_header.service_type_raw, inner_body).await,
            None => {
                let err = Error::UnsupportedService {
                    service_type: inner_header.service_type_raw,
                };
                warn!(%err);
            }
        }
    }

    async fn on_session_status(self: &Arc<Self>, body: &[u8]) {
        let Some(&code) = body.first() else {
            warn!("empty session status body");
            return;
        };
        let state = *self.state.lock();

        match (code, state) {
            (0, SessionState::Unauthenticated) => {
                *self.state.lock() = SessionState::Authenticated;
                self.start_keep_alive().await;
                if let Some(tx) = self.session_status_tx.lock().take() {
                    let _ = tx.send(Ok(()));
                }
            }
            (1, SessionState::Unauthenticated) | (2, SessionState::Unauthenticated) => {
                let reason = if code == 1 {
                    "server rejected authentication"
                } else {
                    "user unauthorized"
                };
                if let Some(tx) = self.session_status_tx.lock().take() {
                    let _ = tx.send(Err(Error::AuthenticationFailed { reason }));
                }
                self.close().await;
            }
            (2, SessionState::Authenticated) | (3, _) => {
                debug!(code, "server closed session (timeout/unauthenticated)");
                self.close().await;
            }
            (5, _) => {
                debug!("peer requested session close");
                self.close().await;
            }
            (4, _) => {
                debug!("keep-alive received from peer");
            }
            _ => warn!(code, ?state, "unexpected session status in this state"),
        }
    }

    async fn start_keep_alive(self: &Arc<Self>) {
        let session = self.clone();
        let interval = self.config.keep_alive_interval;
        let notify = self.close_notify.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let header = Header::new(ServiceType::SessionStatus, 1);
                        let mut plain = header.serialize().to_vec();
                        plain.push(4);
                        if let Err(e) = session.send_keep_alive(&plain).await {
                            warn!(error = %e, "keep-alive send failed, closing session and its parent connection");
                            session.close().await;
                            if let Some(conn) = session.connection.upgrade() {
                                conn.close().await;
                            }
                            break;
                        }
                    }
                    _ = notify.notified() => break,
                }
            }
        });
        *self.keep_alive.lock().await = Some(handle);
    }

    async fn send_keep_alive(self: &Arc<Self>, plain: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = self
            .session_key
            .lock()
            .clone()
            .ok_or_else(|| Error::AuthenticationFailed {
                reason: "session has no bound key",
            })?;
        let session_id = self.session_id.lock().ok_or_else(|| Error::AuthenticationFailed {
            reason: "session has no bound id",
        })?;
        let seq = self.next_send_seq();
        let wrapped = wrapper::wrap(plain, session_id, seq, self.serial.0, 0, &key);
        let conn = self.connection.upgrade().ok_or_else(closed_connection_error)?;
        conn.write_frame(&wrapped).await
    }

    /// Closes the session: best-effort `SessionStatus(Close)`, keep-alive
    /// cancellation, closing secured sub-connections, and removal from the
    /// parent connection (`spec.md` §4.4 Close).
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.close_notify.notify_waiters();
        if let Some(handle) = self.keep_alive.lock().await.take() {
            handle.abort();
        }

        let session_id = *self.session_id.lock();
        let key = self.session_key.lock().clone();
        if let (Some(session_id), Some(key)) = (session_id, key) {
            if let Some(conn) = self.connection.upgrade() {
                if conn.is_open() {
                    let header = Header::new(ServiceType::SessionStatus, 1);
                    let mut plain = header.serialize().to_vec();
                    plain.push(5);
                    let seq = self.next_send_seq();
                    let wrapped = wrapper::wrap(&plain, session_id, seq, self.serial.0, 0, &key);
                    let _ = conn.write_frame(&wrapped).await;
                }
                conn.remove_session(session_id);
            }
        }

        self.subs.close_all();
    }
}

/// Builds the `SessionRequest` body: `HPAI.Tcp ‖ clientPublicKey(32B)` (`spec.md` §4.4 step 1).
fn build_session_request_body(client_pub: [u8; 32]) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + 32);
    body.extend_from_slice(&Hpai::TCP.serialize());
    body.extend_from_slice(&client_pub);
    body
}

/// The handshake-phase MAC's associated data: `16B zeros ‖ 2B msgLen=6+2+32 ‖
/// header ‖ field(2B) ‖ xoredKeys(32B)` (`spec.md` §4.4 steps 2 and 2's SessionAuth note).
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

/// Security-info block used for the handshake-phase MAC encryptions, which
/// have no real `SecureWrapper` frame context yet: all-zero serial, zero tag,
/// zero frame length, `0xff00` counter variant (`spec.md` §4.4, §4.1).
fn handshake_mac_info_block() -> [u8; 16] {
    crypto::mac_security_info(&[0u8; 6], 0, 0)
}

fn closed_connection_error() -> Error {
    Error::TransportFailed {
        message: "owning connection has been dropped".to_string(),
        peer: None,
    }
}
