//! Sub-connection registry: channel-id demultiplexing shared by a
//! [`crate::transport::TcpConnection`] (unsecured channels) and a
//! [`crate::secure::SecureSession`] (secured channels) — `spec.md` §4.6.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::codec::ServiceType;
use crate::decoder::{DecodedFrame, FrameDecoder};
use crate::error::{Error, Result};
use crate::types::ChannelId;

/// Single-slot "most recent device-management response" correlator
/// (`spec.md` §5, §9: "the `devMgmt` inbox in link-layer consumers uses a
/// single-slot protocol with wait/notify-style signalling"). Only the latest
/// delivered frame is retained; a caller blocked in [`DevMgmtInbox::wait`]
/// wakes as soon as one lands, or times out.
struct DevMgmtInbox {
    slot: Mutex<Option<DecodedFrame>>,
    notify: tokio::sync::Notify,
}

impl DevMgmtInbox {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn fill(&self, frame: DecodedFrame) {
        *self.slot.lock() = Some(frame);
        self.notify.notify_waiters();
    }

    /// Blocks up to `timeout` for the next device-management response
    /// (`spec.md` §5 `responseFor(...)`, 1 s default budget).
    async fn wait(&self, timeout: Duration) -> Result<DecodedFrame> {
        // `notified()` must be created before the slot is re-checked: it
        // snapshots the waiter list at creation time, so a `fill()` landing
        // between the check and the `.await` below still wakes it. Checking
        // first and creating the future after would lose that notification.
        let notified = self.notify.notified();
        if let Some(frame) = self.slot.lock().take() {
            return Ok(frame);
        }
        match tokio::time::timeout(timeout, notified).await {
            Ok(_) => self.slot.lock().take().ok_or(Error::SessionTimeout {
                stage: "dev_mgmt_response",
                elapsed_ms: timeout.as_millis() as u64,
            }),
            Err(_elapsed) => Err(Error::SessionTimeout {
                stage: "dev_mgmt_response",
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Lifecycle of a single sub-connection (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Pending,
    Ok,
    Closed,
}

/// A tunneling / device-configuration / object-server logical conversation.
pub struct SubConnection {
    channel_id: Mutex<Option<ChannelId>>,
    state: Mutex<SubState>,
    decoder: Option<Arc<dyn FrameDecoder>>,
    inbox: mpsc::UnboundedSender<DecodedFrame>,
    dev_mgmt: DevMgmtInbox,
}

impl SubConnection {
    /// Creates a new sub-connection in `Pending` state and the receiver end
    /// of its frame inbox.
    pub fn new(decoder: Option<Arc<dyn FrameDecoder>>) -> (Arc<Self>, mpsc::UnboundedReceiver<DecodedFrame>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let sub = Arc::new(Self {
            channel_id: Mutex::new(None),
            state: Mutex::new(SubState::Pending),
            decoder,
            inbox,
            dev_mgmt: DevMgmtInbox::new(),
        });
        (sub, rx)
    }

    /// Blocks the caller up to `timeout` for the next delivered frame,
    /// independent of the `mpsc` inbox returned by [`SubConnection::new`]
    /// (`spec.md` §5 `responseFor(...)`, used by device-management
    /// request/response callers that want a single correlated reply rather
    /// than draining the general frame stream).
    pub async fn response_for(&self, timeout: Duration) -> Result<DecodedFrame> {
        self.dev_mgmt.wait(timeout).await
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        *self.channel_id.lock()
    }

    pub fn state(&self) -> SubState {
        *self.state.lock()
    }

    pub(crate) fn bind(&self, channel_id: ChannelId) {
        *self.channel_id.lock() = Some(channel_id);
        *self.state.lock() = SubState::Ok;
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = SubState::Closed;
    }

    pub(crate) async fn deliver(&self, service_type_raw: u16, body: &[u8]) {
        let decoded = match &self.decoder {
            Some(decoder) => match decoder.decode(service_type_raw, body).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%e, service_type_raw, "frame decoder rejected body");
                    return;
                }
            },
            None => DecodedFrame {
                service_type_raw,
                body: body.to_vec(),
            },
        };
        self.dev_mgmt.fill(decoded.clone());
        let _ = self.inbox.send(decoded);
    }
}

/// A channel-id keyed map of sub-connections plus the FIFO of connect
/// requests awaiting a channel-id binding (`spec.md` §4.6, §9).
pub struct Registry {
    subs: DashMap<u8, Arc<SubConnection>>,
    pending: SegQueue<Arc<SubConnection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            subs: DashMap::new(),
            pending: SegQueue::new(),
        }
    }

    /// Enqueues a freshly created sub-connection awaiting its channel-id
    /// binding on the next positive `ConnectResponse`.
    pub fn register_pending(&self, sub: Arc<SubConnection>) {
        self.pending.push(sub);
    }

    pub fn get(&self, channel: u8) -> Option<Arc<SubConnection>> {
        self.subs.get(&channel).map(|entry| entry.clone())
    }

    pub fn remove(&self, channel: u8) {
        if let Some((_, sub)) = self.subs.remove(&channel) {
            sub.close();
        }
    }

    /// Dispatches one received service body, honoring the broadcast services
    /// and the FIFO-bind-on-first-response rule (`spec.md` §4.5 step 5, §4.6).
    pub async fn dispatch(&self, service_type: ServiceType, service_type_raw: u16, body: &[u8]) {
        if service_type.is_broadcast() {
            for entry in self.subs.iter() {
                entry.value().deliver(service_type_raw, body).await;
            }
            return;
        }

        let offset = if service_type.channel_id_at_byte_one() { 1 } else { 0 };
        if body.len() <= offset {
            warn!(?service_type, "body too short to carry a channel id");
            return;
        }
        let channel = body[offset];

        if let Some(sub) = self.get(channel) {
            sub.deliver(service_type_raw, body).await;
            if service_type == ServiceType::DisconnectResponse {
                self.remove(channel);
            }
            return;
        }

        if service_type == ServiceType::ConnectResponse && body.len() >= 2 && body[1] == 0 {
            if let Some(sub) = self.pending.pop() {
                sub.bind(ChannelId(channel));
                self.subs.insert(channel, sub.clone());
                sub.deliver(service_type_raw, body).await;
                return;
            }
        }

        if service_type == ServiceType::DisconnectResponse {
            return;
        }

        warn!(channel, ?service_type, "no sub-connection registered for channel");
    }

    /// Closes every registered and pending sub-connection (`spec.md` §4.5
    /// connection-close, §4.4 session-close).
    pub fn close_all(&self) {
        for entry in self.subs.iter() {
            entry.value().close();
        }
        self.subs.clear();
        while let Some(sub) = self.pending.pop() {
            sub.close();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
