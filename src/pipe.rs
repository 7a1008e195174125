//! Named, priority-ordered chains of async message processors.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::contact::Contact;
use crate::error::SessionError;
use crate::message::Message;
use crate::stanza::Element;

type Processor<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

struct Entry<T> {
    name: String,
    priority: i32,
    processor: Processor<T>,
}

/// Each processor receives the current value and returns the value for the
/// next one. Lower priority runs first; equal priorities keep insertion order.
pub struct Pipe<T> {
    name: &'static str,
    processors: Mutex<Vec<Entry<T>>>,
}

impl<T: Send + 'static> Pipe<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            processors: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add_processor<F, Fut>(&self, name: impl Into<String>, priority: i32, processor: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let entry = Entry {
            name: name.into(),
            priority,
            processor: Arc::new(move |value| -> BoxFuture<'static, anyhow::Result<T>> {
                Box::pin(processor(value))
            }),
        };
        let mut processors = self.processors.lock();
        let position = processors
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(processors.len());
        processors.insert(position, entry);
    }

    pub fn remove_processor(&self, name: &str) -> bool {
        let mut processors = self.processors.lock();
        let before = processors.len();
        processors.retain(|e| e.name != name);
        processors.len() != before
    }

    pub fn len(&self) -> usize {
        self.processors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the chain. The first error stops it.
    pub async fn run(&self, value: T) -> Result<T, SessionError> {
        let chain: Vec<(String, Processor<T>)> = self
            .processors
            .lock()
            .iter()
            .map(|e| (e.name.clone(), e.processor.clone()))
            .collect();

        let mut value = value;
        for (name, processor) in chain {
            debug!(pipe = self.name, processor = %name, "Running processor");
            value = processor(value).await.map_err(|e| {
                warn!(pipe = self.name, processor = %name, error = %format!("{:#}", e), "Processor stopped the pipe");
                SessionError::Pipeline {
                    pipe: self.name,
                    reason: format!("{}: {:#}", name, e),
                }
            })?;
        }
        Ok(value)
    }
}

/// Argument of the `pre-send` pipe.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: Message,
    pub stanza: Element,
}

/// Argument of the `after-receive` pipe.
#[derive(Clone)]
pub struct IncomingMessage {
    pub contact: Arc<Contact>,
    pub message: Message,
    pub stanza: Element,
}

pub struct Pipes {
    pub pre_send: Pipe<OutgoingMessage>,
    pub after_receive: Pipe<IncomingMessage>,
}

impl Pipes {
    pub fn new() -> Self {
        Self {
            pre_send: Pipe::new("pre-send"),
            after_receive: Pipe::new("after-receive"),
        }
    }
}

impl Default for Pipes {
    fn default() -> Self {
        Self::new()
    }
}
