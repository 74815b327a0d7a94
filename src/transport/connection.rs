//! One multiplexed TCP connection to a KNXnet/IP server: receive-loop
//! framing, secure-session/channel-id dispatch, and connection lifecycle
//! (`spec.md` §4.5).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{Header, ServiceType};
use crate::config::Config;
use crate::crypto::Key16;
use crate::decoder::{DecodedFrame, FrameDecoder};
use crate::error::{Error, Result};
use crate::secure::SecureSession;
use crate::transport::subconnection::{Registry, SubConnection};
use crate::types::{SerialNumber, UserId};

fn io_err(server: SocketAddr, e: std::io::Error) -> Error {
    Error::TransportFailed {
        message: e.to_string(),
        peer: Some(server),
    }
}

/// The shared, internally-mutable state behind a [`TcpConnection`] handle.
/// [`SecureSession`] holds a non-owning [`Weak`] reference back to this —
/// the connection owns its sessions, not the reverse (`spec.md` §3, §9).
pub(crate) struct Inner {
    server: SocketAddr,
    local: Mutex<Option<SocketAddr>>,
    pub(crate) config: Config,
    serial: SerialNumber,
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pub(crate) sessions: DashMap<u16, Arc<SecureSession>>,
    pub(crate) unsecured: Registry,
    pending_session: Mutex<Option<Arc<SecureSession>>>,
    session_request_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    closed: AtomicBool,
    receive_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn session_request_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.session_request_lock
    }

    pub(crate) fn bind_pending_session(&self, session: Arc<SecureSession>) {
        *self.pending_session.lock() = Some(session);
    }

    pub(crate) fn clear_pending_session(&self) {
        *self.pending_session.lock() = None;
    }

    pub(crate) fn register_session(&self, session_id: u16, session: Arc<SecureSession>) {
        self.sessions.insert(session_id, session);
    }

    pub(crate) fn remove_session(&self, session_id: u16) {
        self.sessions.remove(&session_id);
    }

    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let Some(w) = guard.as_mut() else {
            return Err(Error::TransportFailed {
                message: "connection not open".to_string(),
                peer: Some(self.server),
            });
        };
        w.write_all(frame).await.map_err(|e| io_err(self.server, e))?;
        w.flush().await.map_err(|e| io_err(self.server, e))
    }

    async fn receive_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let buffer_size = self.config.transport.receive_buffer_size;
        let mut buf = vec![0u8; buffer_size];
        let mut offset = 0usize;

        'outer: loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let n = match read_half.read(&mut buf[offset..]).await {
                Ok(0) => {
                    debug!("peer closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "receive loop I/O error");
                    break;
                }
            };
            offset += n;

            loop {
                match next_frame(&buf[..offset], buffer_size) {
                    FrameStep::NeedMore => break,
                    FrameStep::Malformed => {
                        warn!("malformed frame header, dropping accumulated buffer");
                        offset = 0;
                        break;
                    }
                    FrameStep::Skip(total) => {
                        warn!(total_length = total, buffer_size, "oversized frame, skipping");
                        let to_discard = total.saturating_sub(offset);
                        if discard(&mut read_half, to_discard).await.is_err() {
                            break 'outer;
                        }
                        offset = 0;
                        break;
                    }
                    FrameStep::Frame(total) => {
                        let frame = buf[..total].to_vec();
                        let remaining = offset - total;
                        buf.copy_within(total..offset, 0);
                        offset = remaining;
                        self.clone().dispatch(frame).await;
                    }
                }
            }
        }

        self.teardown_on_receive_exit().await;
    }

    async fn dispatch(self: Arc<Self>, frame: Vec<u8>) {
        let header = match Header::parse(&frame) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "dropping frame that failed to re-parse");
                return;
            }
        };
        let body = &frame[6..header.total_length as usize];

        if header.is_secure() {
            if body.len() < 2 {
                warn!("secure frame too short to carry a session id");
                return;
            }
            let session_id = u16::from_be_bytes([body[0], body[1]]);

            if let Some(session) = self.sessions.get(&session_id).map(|r| r.clone()) {
                match header.service_type() {
                    Some(ServiceType::SecureWrapper) => session.on_wrapped_frame(&frame).await,
                    _ => debug!(session_id, "ignoring unexpected secure service on bound session"),
                }
                return;
            }

            if header.service_type() == Some(ServiceType::SessionResponse) {
                let pending = self.pending_session.lock().clone();
                if let Some(session) = pending {
                    session.on_session_response(header.serialize(), body).await;
                    return;
                }
            }

            warn!(session_id, "no session bound for secure frame, dropping");
            return;
        }

        let Some(service_type) = header.service_type() else {
            let err = Error::UnsupportedService {
                service_type: header.service_type_raw,
            };
            warn!(%err);
            return;
        };
        self.unsecured.dispatch(service_type, header.service_type_raw, body).await;
    }

    async fn teardown_on_receive_exit(&self) {
        let closes: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(closes.iter().map(|s| s.close())).await;
        self.sessions.clear();
        self.unsecured.close_all();
    }

    /// Tears down every session and sub-connection, the receive task, and
    /// the socket. Idempotent. This is the one teardown path shared by
    /// [`TcpConnection::close`] and a [`crate::secure::SecureSession`]
    /// reacting to `spec.md` §4.4's "IO failure while Authenticated and the
    /// socket still open → close session and its parent connection" —
    /// a session only holds a `Weak<Inner>`, so this is the hook it calls
    /// through rather than duplicating `TcpConnection`'s teardown logic.
    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let closes: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(closes.iter().map(|s| s.close())).await;
        self.sessions.clear();
        self.unsecured.close_all();

        if let Some(handle) = self.receive_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut w) = self.write_half.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }
}

enum FrameStep {
    NeedMore,
    Malformed,
    Skip(usize),
    Frame(usize),
}

/// Decides what the receive loop should do with its current accumulator
/// contents (`spec.md` §4.5 steps 1–3).
fn next_frame(buf: &[u8], buffer_size: usize) -> FrameStep {
    if buf.len() < 6 {
        return FrameStep::NeedMore;
    }
    let header = match Header::parse(buf) {
        Ok(h) => h,
        Err(_) => return FrameStep::Malformed,
    };
    let total = header.total_length as usize;
    if total > buffer_size {
        return FrameStep::Skip(total);
    }
    if total <= buf.len() {
        FrameStep::Frame(total)
    } else {
        FrameStep::NeedMore
    }
}

async fn discard(read_half: &mut OwnedReadHalf, mut remaining: usize) -> std::io::Result<()> {
    let mut scratch = [0u8; 512];
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        let n = read_half.read(&mut scratch[..take]).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        remaining -= n;
    }
    Ok(())
}

/// One multiplexed TCP connection to a KNXnet/IP server (`spec.md` §3, §4.5).
/// Cheaply cloneable; every clone shares the same underlying socket and
/// registries.
#[derive(Clone)]
pub struct TcpConnection(Arc<Inner>);

impl TcpConnection {
    /// Builds a connection that binds no particular local address.
    pub fn new(server: SocketAddr, serial: SerialNumber, config: Config) -> Self {
        Self::with_local(None, server, serial, config)
    }

    /// Builds a connection bound to a specific local address before connecting.
    pub fn new_with_local(
        local: SocketAddr,
        server: SocketAddr,
        serial: SerialNumber,
        config: Config,
    ) -> Self {
        Self::with_local(Some(local), server, serial, config)
    }

    fn with_local(local: Option<SocketAddr>, server: SocketAddr, serial: SerialNumber, config: Config) -> Self {
        Self(Arc::new(Inner {
            server,
            local: Mutex::new(local),
            config,
            serial,
            write_half: tokio::sync::Mutex::new(None),
            sessions: DashMap::new(),
            unsecured: Registry::new(),
            pending_session: Mutex::new(None),
            session_request_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            receive_task: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn server(&self) -> SocketAddr {
        self.0.server
    }

    pub fn local(&self) -> Option<SocketAddr> {
        *self.0.local.lock()
    }

    /// The configuration this connection was built with, e.g. for a caller
    /// to size a [`crate::transport::SubConnection::response_for`] budget
    /// off `config().session.dev_mgmt_response_timeout`.
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Connects to the server, idempotently (`spec.md` §4.5): the first call
    /// performs `socket.connect()` under the configured timeout and spawns
    /// the receive task; subsequent calls while connected are no-ops.
    pub async fn connect(&self) -> Result<()> {
        if self.0.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let requested_local = *self.0.local.lock();
        let server = self.0.server;
        let connect_timeout = self.0.config.transport.connect_timeout;

        let connect_fut = async move {
            if let Some(local) = requested_local {
                let socket = if local.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(|e| io_err(server, e))?;
                socket.bind(local).map_err(|e| io_err(server, e))?;
                socket.connect(server).await.map_err(|e| io_err(server, e))
            } else {
                TcpStream::connect(server).await.map_err(|e| io_err(server, e))
            }
        };

        let stream = tokio::time::timeout(connect_timeout, connect_fut)
            .await
            .map_err(|_| Error::TransportFailed {
                message: "connect timed out".to_string(),
                peer: Some(server),
            })??;

        let _ = stream.set_nodelay(true);
        *self.0.local.lock() = stream.local_addr().ok();

        let (read_half, write_half) = stream.into_split();
        *self.0.write_half.lock().await = Some(write_half);

        let inner = self.0.clone();
        let handle = tokio::spawn(async move { inner.receive_loop(read_half).await });
        *self.0.receive_task.lock().await = Some(handle);

        Ok(())
    }

    /// Sends a caller-framed plain (non-secure) service frame, e.g. a
    /// `ConnectRequest`.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        self.0.write_frame(frame).await
    }

    /// Opens a new unsecured sub-connection, queued Pending on this
    /// connection's FIFO (`spec.md` §4.6).
    pub fn open_sub_connection(
        &self,
        decoder: Option<Arc<dyn FrameDecoder>>,
    ) -> (Arc<SubConnection>, mpsc::UnboundedReceiver<DecodedFrame>) {
        let (sub, rx) = SubConnection::new(decoder);
        self.0.unsecured.register_pending(sub.clone());
        (sub, rx)
    }

    /// Creates a new secure session on this connection (`spec.md` §6.2).
    /// `device_auth_key` of `None` is the "skip device authentication"
    /// sentinel (`spec.md` §8 boundary: zero-length key).
    pub fn new_secure_session(
        &self,
        user: UserId,
        user_key: Key16,
        device_auth_key: Option<Key16>,
    ) -> Arc<SecureSession> {
        SecureSession::new(
            Arc::downgrade(&self.0),
            self.0.config.session.clone(),
            user,
            user_key,
            device_auth_key,
            self.0.serial,
        )
    }

    /// Closes the connection: all sessions, all sub-connections, the receive
    /// task, then the socket. Idempotent (`spec.md` §8) — the second call is
    /// a no-op.
    pub async fn close(&self) {
        self.0.close().await;
    }
}
