//! The optional sub-protocol decoder seam (`spec.md` §4.8, §9).
//!
//! The original implementation loads an optional ObjectServer/BAOS decoder via
//! runtime reflection. This core models that as a constructor-injected,
//! optional trait object instead — no runtime class loading.

use serde::Serialize;

use crate::error::{Error, Result};

/// A decoded application-layer frame handed to a sub-connection's caller.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedFrame {
    pub service_type_raw: u16,
    pub body: Vec<u8>,
}

impl DecodedFrame {
    /// Renders this frame as a JSON object (`service_type_raw`, `body` as a
    /// byte array), for callers bridging into JSON-based tooling or logs.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidArgument {
            reason: format!("failed to serialize decoded frame: {}", e),
        })
    }
}

/// Decodes an application-layer sub-protocol body into a caller-facing shape.
/// Supplied by the caller at sub-connection construction time; absent by
/// default, in which case the raw service body is surfaced unmodified.
#[async_trait::async_trait]
pub trait FrameDecoder: Send + Sync {
    /// Decodes one frame body for the service type it arrived under.
    async fn decode(&self, service_type_raw: u16, body: &[u8]) -> Result<DecodedFrame>;
}
