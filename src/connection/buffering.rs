use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::{ensure_id, LiveConnection, PendingRequest, Reply};
use crate::error::ConnectionError;
use crate::registry::{HandlerId, Registration};
use crate::stanza::Element;

/// A call recorded while no transport is available.
pub enum BufferedOperation {
    Send(Element),
    Request { stanza: Element, reply: oneshot::Sender<Reply> },
    RegisterHandler(Registration),
}

impl std::fmt::Debug for BufferedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send(stanza) => f.debug_tuple("Send").field(&stanza.to_xml()).finish(),
            Self::Request { stanza, .. } => f.debug_tuple("Request").field(&stanza.to_xml()).finish(),
            Self::RegisterHandler(registration) => f.debug_tuple("RegisterHandler").field(registration).finish(),
        }
    }
}

/// Records operations in arrival order until a live connection replays them.
///
/// Once the operations are taken for replay the buffer is sealed and rejects
/// every further call.
#[derive(Default)]
pub struct BufferingConnection {
    operations: Vec<BufferedOperation>,
    sealed: bool,
    pub(super) parked: Option<LiveConnection>,
}

impl BufferingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that starts out carrying handlers migrated from a previous connection.
    pub fn with_handlers(registrations: Vec<Registration>) -> Self {
        Self {
            operations: registrations.into_iter().map(BufferedOperation::RegisterHandler).collect(),
            ..Self::default()
        }
    }

    pub(super) fn paused(live: LiveConnection) -> Self {
        Self {
            parked: Some(live),
            ..Self::default()
        }
    }

    fn check_open(&self) -> Result<(), ConnectionError> {
        if self.sealed {
            return Err(ConnectionError::closed());
        }
        Ok(())
    }

    pub fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        self.check_open()?;
        debug!(name = stanza.name(), "Buffering stanza");
        self.operations.push(BufferedOperation::Send(stanza));
        Ok(())
    }

    /// The returned request resolves once the stanza is replayed and answered.
    /// `timeout` runs from now, so time spent buffered counts against it.
    pub fn send_request(&mut self, mut stanza: Element, timeout: Duration) -> Result<PendingRequest, ConnectionError> {
        self.check_open()?;
        let id = ensure_id(&mut stanza);
        let (reply, rx) = oneshot::channel();
        self.operations.push(BufferedOperation::Request { stanza, reply });
        Ok(PendingRequest::new(id, rx, Some(timeout), None))
    }

    pub fn register_handler(&mut self, registration: Registration) -> Result<HandlerId, ConnectionError> {
        self.check_open()?;
        let id = registration.id();
        self.operations.push(BufferedOperation::RegisterHandler(registration));
        Ok(id)
    }

    pub fn unregister_handler(&mut self, id: HandlerId) -> bool {
        let position = self
            .operations
            .iter()
            .position(|op| matches!(op, BufferedOperation::RegisterHandler(r) if r.id() == id));
        match position {
            Some(position) => {
                if let BufferedOperation::RegisterHandler(registration) = self.operations.remove(position) {
                    registration.kill();
                }
                true
            }
            None => false,
        }
    }

    pub fn recorded_operations(&self) -> &[BufferedOperation] {
        &self.operations
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Drain for replay and seal.
    pub fn take_operations(&mut self) -> Vec<BufferedOperation> {
        self.sealed = true;
        std::mem::take(&mut self.operations)
    }

    /// Discard everything. Pending requests fail with a closed-connection error.
    pub fn close(&mut self) {
        for op in self.operations.drain(..) {
            if let BufferedOperation::RegisterHandler(registration) = op {
                registration.kill();
            }
        }
        self.sealed = true;
        if let Some(live) = self.parked.take() {
            live.close();
        }
    }
}
