//! Address and identifier types shared across the transport, secure session,
//! and keystore layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A KNX individual address (`area.line.device`), the 16-bit device identifier
/// used both on the bus and as a keyring device/interface key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndividualAddress(pub u16);

impl IndividualAddress {
    /// Builds an address from its three dotted components.
    pub fn new(area: u8, line: u8, device: u8) -> Self {
        debug_assert!(area <= 0x0f && line <= 0x0f);
        Self(((area as u16 & 0x0f) << 12) | ((line as u16 & 0x0f) << 8) | device as u16)
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            (self.0 >> 12) & 0x0f,
            (self.0 >> 8) & 0x0f,
            self.0 & 0xff
        )
    }
}

impl From<u16> for IndividualAddress {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

/// A KNX group address (`main/middle/sub`), the 16-bit datapoint identifier
/// used as a keyring group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupAddress(pub u16);

impl GroupAddress {
    /// Builds an address from its three-level components.
    pub fn new(main: u8, middle: u8, sub: u8) -> Self {
        debug_assert!(main <= 0x1f && middle <= 0x07);
        Self(((main as u16 & 0x1f) << 11) | ((middle as u16 & 0x07) << 8) | sub as u16)
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            (self.0 >> 11) & 0x1f,
            (self.0 >> 8) & 0x07,
            self.0 & 0xff
        )
    }
}

impl From<u16> for GroupAddress {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

/// A 6-byte secure-endpoint serial number (`spec.md` §GLOSSARY "Serial number").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialNumber(pub [u8; 6]);

impl SerialNumber {
    /// The all-zero serial number used when no concrete NIC-derived value is available.
    pub const ZERO: Self = Self([0u8; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// An 8-bit sub-connection (tunneling / device-config / object-server) channel
/// identifier, assigned by the server on `ConnectResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// A secure-session id assigned by the server in `SessionResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{:#06x}", self.0)
    }
}

/// A secure-session user id, constrained to `[1, 127]` (`spec.md` §3, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(u8);

impl UserId {
    /// Validates and wraps a raw user id. `0` and values `>= 128` are rejected.
    pub fn new(raw: u8) -> crate::error::Result<Self> {
        if raw == 0 || raw >= 128 {
            return Err(crate::error::Error::InvalidArgument {
                reason: format!("user id {} outside [1, 127]", raw),
            });
        }
        Ok(Self(raw))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}
