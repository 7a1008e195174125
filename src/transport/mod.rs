//! Byte-level transports carrying the XMPP stream.
//!
//! A transport is started with [`Transport::connect`] or [`Transport::attach`] and
//! reports progress through the status callback. Inbound stanzas go to the channel
//! handed to the factory; outbound stanzas are queued with [`Transport::send`].

pub mod bosh;
pub mod dns;
pub mod negotiate;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::connector::ConnectionStatus;
use crate::error::ConnectionError;
use crate::jid::Jid;
use crate::stanza::Element;

/// Invoked on every transport state change, with an optional condition string.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus, Option<String>) + Send + Sync>;

/// Identifies a resumable transport-level session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub sid: String,
    /// Next request id to use.
    pub rid: u64,
}

pub trait Transport: Send + Sync {
    /// Open a stream and authenticate. Progress is reported through `status`.
    fn connect(&self, jid: &Jid, password: &str, status: StatusCallback);

    /// Resume an existing session without authenticating.
    fn attach(&self, jid: &Jid, sid: &str, rid: u64, status: StatusCallback);

    /// Queue a stanza for transmission.
    fn send(&self, stanza: Element) -> Result<(), ConnectionError>;

    fn disconnect(&self, reason: Option<&str>);

    /// Session identifiers, when the transport supports resumption.
    fn session_token(&self) -> Option<SessionToken>;

    /// Full address bound by the server, once known.
    fn bound_jid(&self) -> Option<Jid>;
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        url: &str,
        inbound: mpsc::UnboundedSender<Element>,
    ) -> Result<Arc<dyn Transport>, ConnectionError>;
}

/// BOSH for `http(s)://` urls, TCP/TLS for everything else.
pub struct DefaultTransportFactory {
    config: SessionConfig,
}

impl DefaultTransportFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        url: &str,
        inbound: mpsc::UnboundedSender<Element>,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        let url = url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            let transport = bosh::BoshTransport::new(url, inbound, &self.config)?;
            Ok(Arc::new(transport))
        } else {
            Ok(Arc::new(tcp::TcpTransport::new(url, inbound, &self.config)))
        }
    }
}

/// Raw traffic goes to its own target; enabled with `--verbose=xmpp`.
pub(crate) fn log_traffic(direction: &str, data: &str) {
    tracing::debug!(target: "fluux_session::xmpp", "{} {}", direction, data);
}
