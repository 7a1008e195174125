//! Login and attach handshakes, and the connection-status state machine.
//!
//! The transport reports raw status changes through its callback. The connector
//! feeds them into a [`StateMachine`], which rejects illegal edges, and resolves
//! the pending connection exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{AuthenticationError, ConnectionError, InvalidParameterError, SessionError};
use crate::hooks::Hook;
use crate::jid::Jid;
use crate::stanza::Element;
use crate::transport::{StatusCallback, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Establishing,
    Connected,
    Attached,
    ConnectionFailed,
    AuthenticationFailed,
}

impl ConnectionStatus {
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Attached)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::AuthenticationFailed)
    }

    fn allows(self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, to) {
            (Disconnected | ConnectionFailed | AuthenticationFailed, Establishing) => true,
            (Establishing, Connecting | Attached) => true,
            (Establishing | Connecting, Connected | ConnectionFailed | AuthenticationFailed | Disconnected) => true,
            (Connecting, Attached) => true,
            (Connected | Attached, Disconnected | ConnectionFailed) => true,
            (ConnectionFailed | AuthenticationFailed, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Establishing => "establishing",
            Self::Connected => "connected",
            Self::Attached => "attached",
            Self::ConnectionFailed => "connection failed",
            Self::AuthenticationFailed => "authentication failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub condition: Option<String>,
}

/// The only place a connection status changes.
pub struct StateMachine {
    status: Mutex<ConnectionStatus>,
    generation: AtomicU64,
    changed: Hook<StatusChange>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(ConnectionStatus::Disconnected),
            generation: AtomicU64::new(0),
            changed: Hook::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn on_change(&self) -> &Hook<StatusChange> {
        &self.changed
    }

    /// Apply a transition. Illegal edges are logged and leave the status untouched.
    pub fn transition(&self, to: ConnectionStatus, condition: Option<String>) -> bool {
        let from = {
            let mut status = self.status.lock();
            let from = *status;
            if from == to {
                return false;
            }
            if !from.allows(to) {
                warn!(from = %from, to = %to, condition = ?condition, "Rejected connection status transition");
                return false;
            }
            *status = to;
            from
        };
        debug!(from = %from, to = %to, condition = ?condition, "Connection status changed");
        self.changed.emit(&StatusChange { from, to, condition });
        true
    }

    /// Start a new attempt. Reports tagged with an older generation are ignored.
    pub fn begin_attempt(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn transition_for(&self, generation: u64, to: ConnectionStatus, condition: Option<String>) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, to = %to, "Ignoring status from a stale transport");
            return false;
        }
        self.transition(to, condition)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectParams {
    Login {
        url: String,
        jid: Jid,
        password: String,
    },
    Attach {
        url: String,
        jid: Jid,
        sid: String,
        rid: u64,
    },
}

fn require_url(url: &str) -> Result<String, InvalidParameterError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(InvalidParameterError::new("missing server url"));
    }
    Ok(url.to_string())
}

fn require_jid(jid: &str) -> Result<Jid, InvalidParameterError> {
    if jid.trim().is_empty() {
        return Err(InvalidParameterError::new("missing address"));
    }
    Jid::parse(jid.trim()).map_err(|e| InvalidParameterError::new(e.to_string()))
}

impl ConnectParams {
    pub fn login(url: &str, jid: &str, password: &str) -> Result<Self, InvalidParameterError> {
        Ok(Self::Login {
            url: require_url(url)?,
            jid: require_jid(jid)?,
            password: password.to_string(),
        })
    }

    pub fn attach(url: &str, jid: &str, sid: &str, rid: u64) -> Result<Self, InvalidParameterError> {
        let url = require_url(url)?;
        let jid = require_jid(jid)?;
        if sid.trim().is_empty() {
            return Err(InvalidParameterError::new("missing session id"));
        }
        Ok(Self::Attach {
            url,
            jid,
            sid: sid.to_string(),
            rid,
        })
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Login { url, .. } | Self::Attach { url, .. } => url,
        }
    }

    pub fn jid(&self) -> &Jid {
        match self {
            Self::Login { jid, .. } | Self::Attach { jid, .. } => jid,
        }
    }

    pub fn is_attach(&self) -> bool {
        matches!(self, Self::Attach { .. })
    }
}

/// A transport that completed its handshake.
pub struct Established {
    pub status: ConnectionStatus,
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<Element>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established").field("status", &self.status).finish_non_exhaustive()
    }
}

type Outcome = Result<ConnectionStatus, SessionError>;

pub struct Connector {
    factory: Arc<dyn TransportFactory>,
    timeout: Duration,
}

impl Connector {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &SessionConfig) -> Self {
        Self {
            factory,
            timeout: config.tcp_connect_timeout + config.request_timeout,
        }
    }

    /// Run one handshake. Resolves exactly once with the established transport or the
    /// first failure it reports.
    pub async fn connect(&self, params: &ConnectParams, machine: &Arc<StateMachine>) -> Result<Established, SessionError> {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let transport = self.factory.create(params.url(), inbound_tx)?;

        let generation = machine.begin_attempt();
        machine.transition_for(generation, ConnectionStatus::Establishing, None);

        let (done_tx, done_rx) = oneshot::channel::<Outcome>();
        let pending = Arc::new(Mutex::new(Some(done_tx)));
        let callback: StatusCallback = {
            let machine = machine.clone();
            Arc::new(move |status, condition| {
                machine.transition_for(generation, status, condition.clone());
                let outcome: Option<Outcome> = match status {
                    ConnectionStatus::Connected | ConnectionStatus::Attached => Some(Ok(status)),
                    ConnectionStatus::ConnectionFailed => Some(Err(ConnectionError::new(
                        condition.unwrap_or_else(|| "connection-failed".to_string()),
                    )
                    .into())),
                    ConnectionStatus::AuthenticationFailed => Some(Err(AuthenticationError::new(
                        condition.unwrap_or_else(|| "not-authorized".to_string()),
                    )
                    .into())),
                    ConnectionStatus::Disconnected => Some(Err(ConnectionError::new(
                        condition.unwrap_or_else(|| "disconnected".to_string()),
                    )
                    .into())),
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    if let Some(tx) = pending.lock().take() {
                        let _ = tx.send(outcome);
                    }
                }
            })
        };

        match params {
            ConnectParams::Login { jid, password, .. } => {
                info!(jid = %jid, url = params.url(), "Logging in");
                transport.connect(jid, password, callback);
            }
            ConnectParams::Attach { jid, sid, rid, .. } => {
                info!(jid = %jid, url = params.url(), sid = %sid, rid, "Attaching to session");
                transport.attach(jid, sid, *rid, callback);
            }
        }

        let outcome = match tokio::time::timeout(self.timeout, done_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectionError::closed().into()),
            Err(_) => {
                warn!(jid = %params.jid(), timeout_ms = self.timeout.as_millis() as u64, "Handshake timed out");
                machine.transition_for(generation, ConnectionStatus::ConnectionFailed, Some("timeout".to_string()));
                Err(ConnectionError::new("connection timed out").into())
            }
        };

        match outcome {
            Ok(status) => Ok(Established {
                status,
                transport,
                inbound,
            }),
            Err(e) => {
                transport.disconnect(None);
                Err(e)
            }
        }
    }
}
