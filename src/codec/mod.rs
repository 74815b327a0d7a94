//! KNXnet/IP wire codec: header, HPAI, and the service-type table consumed by
//! this core (`spec.md` §4.2, §6.1).

use crate::error::Error;

/// KNXnet/IP service types this core parses or emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceType {
    SearchResponse = 0x0202,
    DescriptionResponse = 0x0204,
    ConnectResponse = 0x0206,
    ConnectionStateResponse = 0x0208,
    DisconnectResponse = 0x020a,
    DeviceConfigurationRequest = 0x0310,
    TunnelingRequest = 0x0420,
    TunnelingFeatureResponse = 0x0424,
    TunnelingFeatureInfo = 0x0425,
    SecureWrapper = 0x0950,
    SessionRequest = 0x0951,
    SessionResponse = 0x0952,
    SessionAuth = 0x0953,
    SessionStatus = 0x0954,
    ObjectServerRequest = 0xf080,
    ObjectServerAck = 0xf082,
}

impl ServiceType {
    fn from_u16(raw: u16) -> Option<Self> {
        use ServiceType::*;
        Some(match raw {
            0x0202 => SearchResponse,
            0x0204 => DescriptionResponse,
            0x0206 => ConnectResponse,
            0x0208 => ConnectionStateResponse,
            0x020a => DisconnectResponse,
            0x0310 => DeviceConfigurationRequest,
            0x0420 => TunnelingRequest,
            0x0424 => TunnelingFeatureResponse,
            0x0425 => TunnelingFeatureInfo,
            0x0950 => SecureWrapper,
            0x0951 => SessionRequest,
            0x0952 => SessionResponse,
            0x0953 => SessionAuth,
            0x0954 => SessionStatus,
            0xf080 => ObjectServerRequest,
            0xf082 => ObjectServerAck,
            _ => return None,
        })
    }

    /// Whether demultiplexing this service's body reads the channel id at
    /// byte 1 instead of byte 0 (a leading sub-header length byte precedes
    /// it) — `spec.md` §6.1.
    pub fn channel_id_at_byte_one(self) -> bool {
        matches!(
            self,
            ServiceType::TunnelingRequest
                | ServiceType::DeviceConfigurationRequest
                | ServiceType::TunnelingFeatureResponse
                | ServiceType::TunnelingFeatureInfo
                | ServiceType::ObjectServerRequest
                | ServiceType::ObjectServerAck
        )
    }

    /// Whether `spec.md` §4.5 step 5 broadcasts this service to every
    /// registered sub-connection instead of demultiplexing it.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            ServiceType::SearchResponse | ServiceType::DescriptionResponse
        )
    }
}

/// Protocol version carried by every header.
pub const PROTOCOL_VERSION: u8 = 0x10;

/// Fixed structure length of the 6-byte header.
pub const HEADER_LENGTH: u8 = 0x06;

/// Parsed 6-byte KNXnet/IP header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub service_type_raw: u16,
    pub total_length: u16,
}

impl Header {
    /// Builds a header for a frame whose body is `body_len` bytes long.
    pub fn new(service_type: ServiceType, body_len: u16) -> Self {
        Self {
            service_type_raw: service_type as u16,
            total_length: 6 + body_len,
        }
    }

    /// Parses the 6-byte header at the front of `buf`. Rejects bad structure
    /// length or protocol version (`spec.md` §7 `FrameMalformed`).
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 6 {
            return Err(Error::FrameMalformed {
                reason: "buffer shorter than header",
            });
        }
        if buf[0] != HEADER_LENGTH {
            return Err(Error::FrameMalformed {
                reason: "unexpected structure length",
            });
        }
        if buf[1] != PROTOCOL_VERSION {
            return Err(Error::FrameMalformed {
                reason: "unsupported protocol version",
            });
        }
        let service_type_raw = u16::from_be_bytes([buf[2], buf[3]]);
        let total_length = u16::from_be_bytes([buf[4], buf[5]]);
        if total_length < 6 {
            return Err(Error::FrameMalformed {
                reason: "total length shorter than header",
            });
        }
        Ok(Self {
            service_type_raw,
            total_length,
        })
    }

    pub fn serialize(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0] = HEADER_LENGTH;
        out[1] = PROTOCOL_VERSION;
        out[2..4].copy_from_slice(&self.service_type_raw.to_be_bytes());
        out[4..6].copy_from_slice(&self.total_length.to_be_bytes());
        out
    }

    pub fn service_type(&self) -> Option<ServiceType> {
        ServiceType::from_u16(self.service_type_raw)
    }

    /// True iff the service type is one of the four secure services
    /// (`spec.md` §4.2).
    pub fn is_secure(&self) -> bool {
        matches!(
            self.service_type(),
            Some(
                ServiceType::SecureWrapper
                    | ServiceType::SessionResponse
                    | ServiceType::SessionAuth
                    | ServiceType::SessionStatus
            )
        )
    }

    pub fn body_len(&self) -> usize {
        self.total_length as usize - 6
    }
}

/// HPAI protocol families carried in the 8-byte endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HpaiProtocol {
    Udp = 0x01,
    Tcp = 0x02,
}

/// Host Protocol Address Information: an 8-byte endpoint descriptor
/// (`spec.md` §4.2).
#[derive(Debug, Clone, Copy)]
pub struct Hpai {
    pub protocol: HpaiProtocol,
    pub address: [u8; 4],
    pub port: u16,
}

impl Hpai {
    /// The placeholder HPAI used in secure handshakes carried over TCP:
    /// length=8, protocol=Tcp, address=0.0.0.0, port=0.
    pub const TCP: Hpai = Hpai {
        protocol: HpaiProtocol::Tcp,
        address: [0, 0, 0, 0],
        port: 0,
    };

    pub fn serialize(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = 8;
        out[1] = self.protocol as u8;
        out[2..6].copy_from_slice(&self.address);
        out[6..8].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 8 || buf[0] != 8 {
            return Err(Error::FrameMalformed {
                reason: "malformed HPAI",
            });
        }
        let protocol = match buf[1] {
            0x01 => HpaiProtocol::Udp,
            0x02 => HpaiProtocol::Tcp,
            _ => {
                return Err(Error::FrameMalformed {
                    reason: "unknown HPAI protocol",
                })
            }
        };
        let mut address = [0u8; 4];
        address.copy_from_slice(&buf[2..6]);
        let port = u16::from_be_bytes([buf[6], buf[7]]);
        Ok(Self {
            protocol,
            address,
            port,
        })
    }
}
