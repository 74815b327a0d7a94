//! Secure-wrapper framing: `wrap`/`unwrap` over a bound session key
//! (`spec.md` §4.3, §6.1).
//!
//! Scope of `spec.md` §8's bit-flip invariant ("flipping any single bit of a
//! wrapped frame … causes `unwrap` to return AuthenticationFailed"): this
//! holds for every byte from the session id field onward (byte 6 and later —
//! session id, seq, serial, tag, ciphertext, MAC), all of which are covered
//! by the CBC-MAC. It does not hold for the leading 6-byte header's
//! structure-length, protocol-version, or service-type bytes (0-3; length
//! bytes 4-5 are excluded by the spec's own wording): those are validated
//! before a MAC is ever computed, by necessity — `unwrap` has to know it is
//! looking at a `SecureWrapper` frame of plausible length before it can even
//! locate the ciphertext and MAC to check, the same structural validation
//! `transport::connection::next_frame` applies to the outer frame. Corrupting
//! one of those bytes is surfaced as `FrameMalformed`, not
//! `AuthenticationFailed`.

use crate::codec::{Header, ServiceType};
use crate::crypto::{self, Key16};
use crate::error::Error;

/// Minimum valid secure-wrapper frame length (`spec.md` §3, §6.1).
pub const MIN_WRAPPER_LEN: usize = 44;

/// A decoded secure-wrapper frame.
pub struct Unwrapped {
    pub session_id: u16,
    pub seq: u64,
    pub serial: [u8; 6],
    pub tag: u16,
    pub plaintext: Vec<u8>,
}

/// Builds the associated-data buffer MAC'd over: `16B zeros ‖ 2B msgLen ‖
/// header ‖ sessionId ‖ plain` (`spec.md` §4.3 step 2). `msg_len` covers only
/// the associated data (header + sessionId + plain), not the zeros/length
/// prefix itself.
fn associated_data(header_bytes: &[u8; 6], session_id: u16, plain: &[u8]) -> Vec<u8> {
    let msg_len = (6 + 2 + plain.len()) as u16;
    let mut buf = Vec::with_capacity(16 + 2 + 6 + 2 + plain.len());
    buf.extend_from_slice(&[0u8; 16]);
    buf.extend_from_slice(&msg_len.to_be_bytes());
    buf.extend_from_slice(header_bytes);
    buf.extend_from_slice(&session_id.to_be_bytes());
    buf.extend_from_slice(plain);
    buf
}

/// Wraps `plain` for transmission under `key`, bound to `session_id`, with
/// outbound sequence number `seq`, local serial number `serial`, and message
/// tag `tag` (`spec.md` §4.3, always `0` per this core — `spec.md` §6.1).
pub fn wrap(
    plain: &[u8],
    session_id: u16,
    seq: u64,
    serial: [u8; 6],
    tag: u16,
    key: &Key16,
) -> Vec<u8> {
    let body_len = 2 + 6 + 6 + 2 + plain.len() + 16;
    let header = Header::new(ServiceType::SecureWrapper, body_len as u16);
    let header_bytes = header.serialize();
    let frame_len = header.total_length;

    let mac = crypto::cbc_mac(key, &associated_data(&header_bytes, session_id, plain));

    let mut ciphertext = plain.to_vec();
    let info = crypto::security_info(seq, &serial, tag, frame_len);
    crypto::ctr_xor(key, info, &mut ciphertext);

    let mut mac_ct = mac;
    let mac_info = crypto::mac_security_info(&serial, tag, frame_len);
    crypto::ctr_xor(key, mac_info, &mut mac_ct);

    let mut out = Vec::with_capacity(6 + body_len);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&session_id.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes()[2..8]);
    out.extend_from_slice(&serial);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&mac_ct);
    out
}

/// Unwraps a secure-wrapper frame under `key`, verifying its MAC
/// (`spec.md` §4.3). `frame` must include the 6-byte header. Structural
/// corruption of the header (bytes 0-3) is rejected as `FrameMalformed`
/// before the MAC is checked; see the module-level scoping note for the
/// bit-flip invariant this implies.
pub fn unwrap(frame: &[u8], key: &Key16) -> Result<Unwrapped, Error> {
    let header = Header::parse(frame)?;
    if !header.is_secure() || header.service_type() != Some(ServiceType::SecureWrapper) {
        return Err(Error::FrameMalformed {
            reason: "not a secure wrapper frame",
        });
    }
    if (frame.len() as u16) < header.total_length || header.total_length as usize < MIN_WRAPPER_LEN {
        return Err(Error::FrameMalformed {
            reason: "secure wrapper shorter than minimum length",
        });
    }
    let frame = &frame[..header.total_length as usize];

    let session_id = u16::from_be_bytes([frame[6], frame[7]]);
    let mut seq_bytes = [0u8; 8];
    seq_bytes[2..8].copy_from_slice(&frame[8..14]);
    let seq = u64::from_be_bytes(seq_bytes);
    let mut serial = [0u8; 6];
    serial.copy_from_slice(&frame[14..20]);
    let tag = u16::from_be_bytes([frame[20], frame[21]]);

    let ciphertext_start = 22;
    let ciphertext_end = frame.len() - 16;
    let mut ciphertext = frame[ciphertext_start..ciphertext_end].to_vec();
    let mut mac_ct: [u8; 16] = frame[ciphertext_end..].try_into().unwrap();

    let frame_len = header.total_length;
    let mac_info = crypto::mac_security_info(&serial, tag, frame_len);
    crypto::ctr_xor(key, mac_info, &mut mac_ct);
    let received_mac = mac_ct;

    let info = crypto::security_info(seq, &serial, tag, frame_len);
    crypto::ctr_xor(key, info, &mut ciphertext);
    let plaintext = ciphertext;

    let header_bytes = header.serialize();
    let expected_mac = crypto::cbc_mac(key, &associated_data(&header_bytes, session_id, &plaintext));
    if !crypto::mac_eq(&expected_mac, &received_mac) {
        return Err(Error::AuthenticationFailed {
            reason: "secure wrapper MAC mismatch",
        });
    }

    Ok(Unwrapped {
        session_id,
        seq,
        serial,
        tag,
        plaintext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn key() -> Key16 {
        Zeroizing::new([0x42u8; 16])
    }

    #[test]
    fn wrap_unwrap_round_trips() {
        let key = key();
        let plain = b"this is a tunneling request body".to_vec();
        let wrapped = wrap(&plain, 0x1234, 17, [1, 2, 3, 4, 5, 6], 0, &key);
        let unwrapped = unwrap(&wrapped, &key).unwrap();
        assert_eq!(unwrapped.session_id, 0x1234);
        assert_eq!(unwrapped.seq, 17);
        assert_eq!(unwrapped.plaintext, plain);
    }

    #[test]
    fn bit_flip_is_detected() {
        let key = key();
        let plain = b"tunneling body".to_vec();
        let mut wrapped = wrap(&plain, 1, 0, [0; 6], 0, &key);
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(matches!(
            unwrap(&wrapped, &key),
            Err(Error::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn short_frame_is_rejected_without_decrypting() {
        let key = key();
        let short = vec![0x06, 0x10, 0x09, 0x50, 0x00, 0x0a, 0, 0, 0, 0];
        assert!(matches!(
            unwrap(&short, &key),
            Err(Error::FrameMalformed { .. })
        ));
    }
}
