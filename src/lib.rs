//! # KNX/IP Secure Transport Core
//!
//! A client-side implementation of the KNXnet/IP secure transport suite over
//! TCP: a multiplexed connection to a single KNXnet/IP server, authenticated
//! and encrypted secure sessions layered on that connection, dispatch of
//! framed service messages to tunneling / device-configuration /
//! object-server sub-connections, and an application-layer keystore that
//! binds KNX device and group addresses to cryptographic keys consumed from
//! a verified keyring.
//!
//! ## Layout
//!
//! - [`crypto`] — X25519 key agreement, AES-CBC-MAC, AES-CTR: pure functions.
//! - [`codec`] — the 6-byte KNXnet/IP header and 8-byte HPAI endpoint descriptor.
//! - [`secure`] — the secure-wrapper frame (`secure::wrapper`) and the session
//!   state machine (`secure::SecureSession`) built on top of it.
//! - [`transport`] — [`transport::TcpConnection`], the one-socket-per-server
//!   multiplexer that frames the TCP stream and dispatches to sessions and
//!   sub-connections.
//! - [`keystore`] — [`keystore::Security`], the device-tool-key /
//!   group-key / sender-topology store populated by ingesting a keyring.
//! - [`decoder`] — the optional application-layer sub-protocol decoder seam.
//!
//! ## Quick start
//!
//! ```no_run
//! use knx_ip_secure_core::config::Config;
//! use knx_ip_secure_core::transport::TcpConnection;
//! use knx_ip_secure_core::types::{SerialNumber, UserId};
//! use zeroize::Zeroizing;
//!
//! # #[tokio::main]
//! # async fn main() -> knx_ip_secure_core::error::Result<()> {
//! let server = "10.0.0.5:3671".parse().unwrap();
//! let connection = TcpConnection::new(server, SerialNumber::ZERO, Config::default());
//! connection.connect().await?;
//!
//! let user = UserId::new(2)?;
//! let user_key = Zeroizing::new([0x11u8; 16]);
//! let session = connection.new_secure_session(user, user_key, None);
//! session.ensure_open().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Out of scope
//!
//! Bus-medium link layers, cEMI/EMI frame codecs, keyring XML parsing and
//! signature verification, datapoint translators, and application CLI/
//! packaging are external collaborators; this crate only consumes their
//! interface contracts (see [`keystore::KeyringSource`], [`decoder::FrameDecoder`]).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod codec;
pub mod config;
pub mod crypto;
pub mod decoder;
pub mod error;
pub mod keystore;
pub mod secure;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use keystore::Security;
pub use secure::SecureSession;
pub use transport::TcpConnection;
pub use types::*;
