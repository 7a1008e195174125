use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ensure_id, PendingRequest, Reply, RequestGuard};
use crate::connector::{ConnectionStatus, Established};
use crate::error::{ConnectionError, RequestError, StanzaError};
use crate::registry::{HandlerFilter, HandlerId, HandlerOutcome, HandlerRegistry, Registration};
use crate::stanza::Element;
use crate::transport::negotiate::stanza_error_condition;
use crate::transport::Transport;

/// Parse the `<error/>` payload of a failed response.
pub fn stanza_error(response: &Element) -> StanzaError {
    let error = response.find("error", None);
    StanzaError {
        error_type: error
            .and_then(|e| e.get_attr("type"))
            .unwrap_or("cancel")
            .to_string(),
        condition: stanza_error_condition(response),
        text: error.and_then(|e| e.child_text("text")),
        stanza: response.clone(),
    }
}

/// An established transport with its handler registry and dispatch task.
pub struct LiveConnection {
    status: ConnectionStatus,
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    dispatcher: JoinHandle<()>,
    request_timeout: Duration,
}

impl LiveConnection {
    /// Spawns the task that dispatches inbound stanzas one at a time.
    pub fn new(established: Established, request_timeout: Duration) -> Self {
        let Established {
            status,
            transport,
            mut inbound,
        } = established;
        let registry = Arc::new(HandlerRegistry::new());

        let dispatcher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                while let Some(stanza) = inbound.recv().await {
                    if registry.dispatch(&stanza) == 0 {
                        debug!(name = stanza.name(), "Unhandled stanza");
                    }
                }
                debug!("Inbound stanza stream ended");
            })
        };

        Self {
            status,
            transport,
            registry,
            dispatcher,
            request_timeout,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        self.transport.send(stanza)
    }

    /// Send `stanza` and correlate the response by id.
    pub fn send_request(&self, mut stanza: Element) -> Result<PendingRequest, ConnectionError> {
        let id = ensure_id(&mut stanza);
        let (tx, rx) = oneshot::channel::<Reply>();
        let tx = Mutex::new(Some(tx));

        let filter = HandlerFilter::new().name(stanza.name()).id(id.clone());
        let handler = self.registry.insert(Registration::transient(filter, move |response| {
            let reply = match response.get_attr("type") {
                Some("result") => Ok(response.clone()),
                Some("error") => Err(RequestError::Remote(stanza_error(response))),
                _ => return Ok(HandlerOutcome::Preserve),
            };
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reply);
            }
            Ok(HandlerOutcome::Remove)
        }));

        if let Err(e) = self.transport.send(stanza) {
            self.registry.unregister(handler);
            return Err(e);
        }

        let guard = RequestGuard {
            registry: Arc::downgrade(&self.registry),
            handler,
        };
        Ok(PendingRequest::new(id, rx, Some(self.request_timeout), Some(guard)))
    }

    pub fn register_handler(&self, registration: Registration) -> HandlerId {
        self.registry.insert(registration)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.registry.unregister(id)
    }

    /// Take the handlers that outlive this connection. Request correlations are
    /// dropped, failing their waiters.
    pub(super) fn take_handlers(&self) -> Vec<Registration> {
        let (transient, kept): (Vec<_>, Vec<_>) = self.registry.drain().into_iter().partition(Registration::is_transient);
        for registration in transient {
            registration.kill();
        }
        kept
    }

    /// Unregister every handler, stop dispatching and shut the transport down.
    pub fn close(&self) {
        info!(handlers = self.registry.len(), "Closing live connection");
        self.registry.clear();
        self.dispatcher.abort();
        self.transport.disconnect(None);
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use crate::stanza::iq;
    use crate::transport::mock::{MockTransport, Script};
    use tokio::sync::mpsc;

    fn live(script: Script) -> (LiveConnection, Arc<MockTransport>) {
        let (tx, inbound) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::new(tx, Arc::new(Mutex::new(script))));
        let established = Established {
            status: ConnectionStatus::Connected,
            transport: transport.clone(),
            inbound,
        };
        (LiveConnection::new(established, Duration::from_secs(5)), transport)
    }

    #[tokio::test]
    async fn test_request_resolves_with_result() {
        let (live, transport) = live(Script {
            respond: true,
            ..Script::default()
        });
        let pending = live.send_request(iq("get").attr("to", "example.com")).unwrap();
        let id = pending.id().to_string();
        let response = pending.wait().await.unwrap();

        assert_eq!(response.get_attr("id"), Some(id.as_str()));
        assert_eq!(transport.sent()[0].get_attr("id"), Some(id.as_str()));
        assert!(live.registry().is_empty());
    }

    #[tokio::test]
    async fn test_request_rejects_with_stanza_error() {
        let (live, transport) = live(Script::default());
        let pending = live.send_request(iq("get").attr("id", "q1")).unwrap();
        transport.deliver(
            Element::parse(
                r#"<iq type="error" id="q1"><error type="cancel"><item-not-found xmlns="urn:ietf:params:xml:ns:xmpp-stanzas"/><text xmlns="urn:ietf:params:xml:ns:xmpp-stanzas">gone</text></error></iq>"#,
            )
            .unwrap(),
        );

        match pending.wait().await {
            Err(RequestError::Remote(e)) => {
                assert_eq!(e.condition, "item-not-found");
                assert_eq!(e.error_type, "cancel");
                assert_eq!(e.text.as_deref(), Some("gone"));
            }
            other => panic!("unexpected outcome: {:?}", other.map(|e| e.to_xml())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_empties_registry() {
        let (live, _transport) = live(Script::default());
        let pending = live.send_request(iq("get")).unwrap();
        assert_eq!(live.registry().len(), 1);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, RequestError::Timeout(ref t) if t.timeout == Duration::from_secs(5)));
        assert!(live.registry().is_empty());
    }

    #[tokio::test]
    async fn test_take_handlers_drops_requests() {
        let (live, _transport) = live(Script::default());
        let pending = live.send_request(iq("get")).unwrap();
        live.register_handler(Registration::new(HandlerFilter::new().name("message"), |_| {
            Ok(HandlerOutcome::Preserve)
        }));

        let kept = live.take_handlers();
        assert_eq!(kept.len(), 1);
        assert!(!kept[0].is_transient());
        assert!(matches!(pending.wait().await, Err(RequestError::Connection(_))));
    }

    #[tokio::test]
    async fn test_close_stops_transport() {
        let (live, transport) = live(Script::default());
        live.register_handler(Registration::new(HandlerFilter::new(), |_| Ok(HandlerOutcome::Preserve)));
        live.close();
        assert!(live.registry().is_empty());
        assert!(transport.send(iq("get")).is_err());
    }
}
