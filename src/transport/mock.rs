//! Scripted in-process transport for connection and account tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{SessionToken, StatusCallback, Transport, TransportFactory};
use crate::connector::ConnectionStatus;
use crate::error::ConnectionError;
use crate::jid::Jid;
use crate::namespace as ns;
use crate::stanza::{iq_result_for, Element};

#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub fail_auth: bool,
    pub fail_connection: bool,
    /// Report `Connecting` and never finish the handshake.
    pub stall: bool,
    /// Answer iq get/set requests automatically.
    pub respond: bool,
    /// (jid, name, subscription)
    pub roster: Vec<(String, Option<String>, String)>,
    pub roster_version: Option<String>,
}

pub(crate) struct MockTransport {
    inbound: mpsc::UnboundedSender<Element>,
    script: Arc<Mutex<Script>>,
    sent: Mutex<Vec<Element>>,
    status: Mutex<Option<StatusCallback>>,
    token: Mutex<Option<SessionToken>>,
    jid: Mutex<Option<Jid>>,
    closed: Mutex<bool>,
    disconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new(inbound: mpsc::UnboundedSender<Element>, script: Arc<Mutex<Script>>) -> Self {
        Self {
            inbound,
            script,
            sent: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            token: Mutex::new(None),
            jid: Mutex::new(None),
            closed: Mutex::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> Vec<Element> {
        self.sent.lock().clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<Element> {
        self.sent.lock().iter().filter(|e| e.name() == name).cloned().collect()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn roster_requests(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.get_attr("type") == Some("get") && e.has_child("query", Some(ns::ROSTER)))
            .count()
    }

    /// Push a stanza as if it came from the server.
    pub fn deliver(&self, stanza: Element) {
        let _ = self.inbound.send(stanza);
    }

    /// Simulate transport loss.
    pub fn drop_connection(&self) {
        let status = self.status.lock().clone();
        if let Some(status) = status {
            status(ConnectionStatus::Disconnected, Some("connection lost".to_string()));
        }
    }

    fn report(&self, status: ConnectionStatus, condition: Option<String>) {
        let callback = self.status.lock().clone();
        if let Some(callback) = callback {
            callback(status, condition);
        }
    }

    fn answer(&self, request: &Element) -> Option<Element> {
        let script = self.script.lock();
        if !script.respond || request.name() != "iq" {
            return None;
        }
        if !matches!(request.get_attr("type"), Some("get") | Some("set")) {
            return None;
        }

        let reply = iq_result_for(request);
        let Some(query) = request.find("query", Some(ns::ROSTER)) else {
            return Some(reply);
        };
        if request.get_attr("type") != Some("get") {
            return Some(reply);
        }

        let known = query.get_attr("ver");
        if known.is_some() && known == script.roster_version.as_deref() {
            return Some(reply);
        }
        let mut result = Element::with_ns("query", ns::ROSTER).attr_opt("ver", script.roster_version.clone());
        for (jid, name, subscription) in &script.roster {
            result.append(
                Element::new("item")
                    .attr("jid", jid.clone())
                    .attr_opt("name", name.clone())
                    .attr("subscription", subscription.clone()),
            );
        }
        Some(reply.child(result))
    }
}

impl Transport for MockTransport {
    fn connect(&self, jid: &Jid, _password: &str, status: StatusCallback) {
        *self.status.lock() = Some(status);
        *self.jid.lock() = Some(jid.with_resource("mock"));
        let script = self.script.lock().clone();
        self.report(ConnectionStatus::Connecting, None);
        if script.stall {
            return;
        }
        if script.fail_connection {
            self.report(ConnectionStatus::ConnectionFailed, Some("remote-connection-failed".to_string()));
        } else if script.fail_auth {
            self.report(ConnectionStatus::AuthenticationFailed, Some("not-authorized".to_string()));
        } else {
            *self.token.lock() = Some(SessionToken {
                sid: "mock-sid".to_string(),
                rid: 1,
            });
            self.report(ConnectionStatus::Connected, None);
        }
    }

    fn attach(&self, jid: &Jid, sid: &str, rid: u64, status: StatusCallback) {
        *self.status.lock() = Some(status);
        *self.jid.lock() = Some(jid.clone());
        *self.token.lock() = Some(SessionToken {
            sid: sid.to_string(),
            rid,
        });
        let failing = self.script.lock().fail_connection;
        if failing {
            self.report(ConnectionStatus::ConnectionFailed, Some("item-not-found".to_string()));
        } else {
            self.report(ConnectionStatus::Attached, None);
        }
    }

    fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        if *self.closed.lock() {
            return Err(ConnectionError::closed());
        }
        let reply = self.answer(&stanza);
        self.sent.lock().push(stanza);
        if let Some(reply) = reply {
            self.deliver(reply);
        }
        Ok(())
    }

    fn disconnect(&self, _reason: Option<&str>) {
        *self.closed.lock() = true;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn session_token(&self) -> Option<SessionToken> {
        self.token.lock().clone()
    }

    fn bound_jid(&self) -> Option<Jid> {
        self.jid.lock().clone()
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    pub script: Arc<Mutex<Script>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    creations: AtomicUsize,
}

impl MockFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            created: Mutex::new(Vec::new()),
            creations: AtomicUsize::new(0),
        }
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        _url: &str,
        inbound: mpsc::UnboundedSender<Element>,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        let transport = Arc::new(MockTransport::new(inbound, self.script.clone()));
        self.created.lock().push(transport.clone());
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}
