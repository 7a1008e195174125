//! The account's single connection slot: buffering before a transport exists,
//! live afterwards.
//!
//! Swapping Buffering -> Live replays the recorded operations while the slot
//! lock is held, so every concurrent call lands either in the buffer (and is
//! replayed) or on the live connection after the replay.

mod buffering;
mod live;
mod protocol;

pub use buffering::{BufferedOperation, BufferingConnection};
pub use live::{stanza_error, LiveConnection};
pub use protocol::message_stanza;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ConnectionError, RequestError, RequestTimeoutError};
use crate::registry::{HandlerFilter, HandlerId, HandlerOutcome, HandlerRegistry, Registration};
use crate::stanza::Element;
use crate::transport::Transport;

pub(crate) type Reply = Result<Element, RequestError>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Give `stanza` a correlation id unless it already carries one.
pub(crate) fn ensure_id(stanza: &mut Element) -> String {
    if let Some(id) = stanza.get_attr("id") {
        return id.to_string();
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    stanza.set_attr("id", id.clone());
    id
}

pub(crate) struct RequestGuard {
    registry: Weak<HandlerRegistry>,
    handler: HandlerId,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.handler);
        }
    }
}

/// A request waiting for its response.
///
/// Dropping it before completion unregisters the correlation handler.
pub struct PendingRequest {
    id: String,
    rx: oneshot::Receiver<Reply>,
    timeout: Option<Duration>,
    guard: Option<RequestGuard>,
}

impl PendingRequest {
    pub(crate) fn new(
        id: String,
        rx: oneshot::Receiver<Reply>,
        timeout: Option<Duration>,
        guard: Option<RequestGuard>,
    ) -> Self {
        Self { id, rx, timeout, guard }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<Element, RequestError> {
        let PendingRequest { id, rx, timeout, guard } = self;
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    drop(guard);
                    return Err(RequestTimeoutError { id, timeout }.into());
                }
            },
            None => rx.await,
        };
        drop(guard);
        received.unwrap_or_else(|_| Err(ConnectionError::closed().into()))
    }
}

pub enum Connection {
    Buffering(BufferingConnection),
    Live(LiveConnection),
}

fn replay(live: &LiveConnection, operations: Vec<BufferedOperation>) {
    for op in operations {
        match op {
            BufferedOperation::Send(stanza) => {
                if let Err(e) = live.send(stanza) {
                    warn!(error = %e, "Failed to replay buffered stanza");
                }
            }
            BufferedOperation::Request { reply, .. } if reply.is_closed() => {
                debug!("Dropping buffered request its caller gave up on");
            }
            BufferedOperation::Request { stanza, reply } => match live.send_request(stanza) {
                Ok(pending) => {
                    tokio::spawn(async move {
                        let _ = reply.send(pending.wait().await);
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            BufferedOperation::RegisterHandler(registration) => {
                live.register_handler(registration);
            }
        }
    }
}

pub struct ConnectionSlot {
    inner: Mutex<Connection>,
    request_timeout: Duration,
}

impl ConnectionSlot {
    pub fn new() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Slot whose buffered requests fail after `request_timeout` counted from submission.
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Connection::Buffering(BufferingConnection::new())),
            request_timeout,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(&*self.inner.lock(), Connection::Live(_))
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        match &*self.inner.lock() {
            Connection::Live(live) => Some(live.transport().clone()),
            Connection::Buffering(_) => None,
        }
    }

    pub fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        match &mut *self.inner.lock() {
            Connection::Buffering(buffer) => buffer.send(stanza),
            Connection::Live(live) => live.send(stanza),
        }
    }

    pub fn send_request(&self, stanza: Element) -> Result<PendingRequest, ConnectionError> {
        match &mut *self.inner.lock() {
            Connection::Buffering(buffer) => buffer.send_request(stanza, self.request_timeout),
            Connection::Live(live) => live.send_request(stanza),
        }
    }

    /// Send and wait for the response. The slot is not locked while waiting.
    pub async fn request(&self, stanza: Element) -> Result<Element, RequestError> {
        let pending = self.send_request(stanza)?;
        pending.wait().await
    }

    pub fn register_handler<F>(&self, filter: HandlerFilter, callback: F) -> Result<HandlerId, ConnectionError>
    where
        F: Fn(&Element) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        let registration = Registration::new(filter, callback);
        match &mut *self.inner.lock() {
            Connection::Buffering(buffer) => buffer.register_handler(registration),
            Connection::Live(live) => Ok(live.register_handler(registration)),
        }
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        match &mut *self.inner.lock() {
            Connection::Buffering(buffer) => buffer.unregister_handler(id),
            Connection::Live(live) => live.unregister_handler(id),
        }
    }

    /// Replay whatever the current connection holds onto `live` and install it.
    /// Returns the number of replayed operations.
    pub fn go_live(&self, live: LiveConnection) -> usize {
        let mut slot = self.inner.lock();
        let operations = match &mut *slot {
            Connection::Buffering(buffer) => {
                if let Some(parked) = buffer.parked.take() {
                    let migrated = parked.take_handlers();
                    parked.close();
                    let mut operations: Vec<_> =
                        migrated.into_iter().map(BufferedOperation::RegisterHandler).collect();
                    operations.extend(buffer.take_operations());
                    operations
                } else {
                    buffer.take_operations()
                }
            }
            Connection::Live(previous) => {
                warn!("Replacing a live connection");
                let migrated = previous.take_handlers();
                previous.close();
                migrated.into_iter().map(BufferedOperation::RegisterHandler).collect()
            }
        };
        let replayed = operations.len();
        replay(&live, operations);
        debug!(replayed, "Connection is live");
        *slot = Connection::Live(live);
        replayed
    }

    /// Transport lost: move every surviving handler into a fresh buffer and close
    /// the live connection. Returns false when already buffering.
    pub fn go_buffering(&self) -> bool {
        let mut slot = self.inner.lock();
        let Connection::Live(live) = &*slot else {
            return false;
        };
        let handlers = live.take_handlers();
        live.close();
        debug!(handlers = handlers.len(), "Connection is buffering");
        *slot = Connection::Buffering(BufferingConnection::with_handlers(handlers));
        true
    }

    /// Buffer new calls while keeping the live connection open.
    pub fn pause(&self) -> bool {
        let mut slot = self.inner.lock();
        if !matches!(&*slot, Connection::Live(_)) {
            return false;
        }
        let placeholder = Connection::Buffering(BufferingConnection::new());
        if let Connection::Live(live) = std::mem::replace(&mut *slot, placeholder) {
            *slot = Connection::Buffering(BufferingConnection::paused(live));
        }
        true
    }

    /// Undo [`pause`](Self::pause), replaying what was buffered meanwhile.
    pub fn resume(&self) -> bool {
        let mut slot = self.inner.lock();
        let Connection::Buffering(buffer) = &mut *slot else {
            return false;
        };
        let Some(live) = buffer.parked.take() else {
            return false;
        };
        let operations = buffer.take_operations();
        replay(&live, operations);
        *slot = Connection::Live(live);
        true
    }

    /// Close whatever is installed. Later calls fail with a closed-connection error.
    pub fn close(&self) {
        let mut slot = self.inner.lock();
        match &mut *slot {
            Connection::Buffering(buffer) => buffer.close(),
            Connection::Live(live) => live.close(),
        }
        let mut closed = BufferingConnection::new();
        closed.close();
        *slot = Connection::Buffering(closed);
    }

    /// Inspect the buffer, if the slot is buffering.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&BufferingConnection) -> R) -> Option<R> {
        match &*self.inner.lock() {
            Connection::Buffering(buffer) => Some(f(buffer)),
            Connection::Live(_) => None,
        }
    }
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        Self::new()
    }
}
