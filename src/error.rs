//! Error taxonomy for the KNXnet/IP secure transport core.

use thiserror::Error;

/// Errors surfaced by the transport, session, and keystore layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket I/O or connect-timeout failure. The owning connection is closed.
    #[error("transport failed: {message}")]
    TransportFailed {
        message: String,
        peer: Option<std::net::SocketAddr>,
    },

    /// A handshake step exceeded its deadline; the session returns to Idle.
    #[error("session setup timed out after {elapsed_ms}ms in stage {stage}")]
    SessionTimeout { stage: &'static str, elapsed_ms: u64 },

    /// MAC mismatch, signature mismatch, or server-rejected user. Fatal to the session.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: &'static str },

    /// Inbound sequence number below the session's expected floor.
    #[error("replay detected: session {session_id:#06x} got seq {got}, expected >= {expected}")]
    ReplayDetected {
        session_id: u16,
        got: u64,
        expected: u64,
    },

    /// Inbound wrapper's session id does not match the bound session.
    #[error("session mismatch: frame carries {frame_session_id:#06x}, bound to {bound_session_id:#06x}")]
    SessionMismatch {
        frame_session_id: u16,
        bound_session_id: u16,
    },

    /// Header/length/structure invalid; the frame is dropped and the receive loop continues.
    #[error("malformed frame: {reason}")]
    FrameMalformed { reason: &'static str },

    /// `useKeyring` called with the wrong password or a tampered keyring.
    #[error("keyring signature verification failed")]
    KeyringSignatureMismatch,

    /// Secure service code not recognized by this core.
    #[error("unsupported secure service: {service_type:#06x}")]
    UnsupportedService { service_type: u16 },

    /// Cooperative cancellation during a blocking wait; the connection is closed.
    #[error("interrupted during {operation}")]
    Interrupted { operation: &'static str },

    /// A construction-time argument violated an invariant (user id range, key length, ...).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
