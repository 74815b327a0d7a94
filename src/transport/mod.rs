//! TCP connection multiplexing and sub-connection dispatch (`spec.md` §4.5, §4.6).

pub mod connection;
pub mod subconnection;

pub use connection::TcpConnection;
pub use subconnection::{Registry, SubConnection, SubState};
