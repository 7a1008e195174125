//! XMPP over BOSH (XEP-0124/XEP-0206) with reqwest.
//!
//! Each HTTP request carries a `<body/>` wrapper with a strictly increasing `rid`.
//! The server holds one request open; a second one may be in flight to push
//! outbound stanzas. `sid` and the next `rid` form the [`SessionToken`] that lets a
//! later process attach to the same session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{log_traffic, negotiate, SessionToken, StatusCallback, Transport};
use crate::config::SessionConfig;
use crate::connector::ConnectionStatus;
use crate::error::{AuthenticationError, ConnectionError};
use crate::jid::Jid;
use crate::namespace as ns;
use crate::stanza::Element;

/// Seconds the server may hold a request open.
const WAIT_SECS: u64 = 60;

/// Attempts per request before the session is considered lost.
const MAX_RETRIES: u32 = 3;

#[derive(Default)]
struct Shared {
    token: Mutex<Option<SessionToken>>,
    bound: Mutex<Option<Jid>>,
}

struct Exchange {
    rid: u64,
    body: String,
    attempt: u32,
    result: Result<Element, ConnectionError>,
}

async fn post(client: reqwest::Client, url: Arc<str>, rid: u64, body: String, attempt: u32) -> Exchange {
    log_traffic(">", &body);
    let result = async {
        let response = client
            .post(url.as_ref())
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body.clone())
            .timeout(Duration::from_secs(WAIT_SECS + 10))
            .send()
            .await
            .map_err(|e| ConnectionError::new(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::new(format!("HTTP {}", status.as_u16())));
        }
        let text = response
            .text()
            .await
            .map_err(|e| ConnectionError::new(format!("HTTP body read failed: {}", e)))?;
        log_traffic("<", &text);
        Element::parse(&text).map_err(|e| ConnectionError::new(e.to_string()))
    }
    .await;

    Exchange {
        rid,
        body,
        attempt,
        result,
    }
}

fn terminate_condition(body: &Element) -> Option<String> {
    (body.get_attr("type") == Some("terminate"))
        .then(|| body.get_attr("condition").unwrap_or("remote-connection-failed").to_string())
}

/// One BOSH session, owned by the transport task.
struct Session {
    client: reqwest::Client,
    url: Arc<str>,
    domain: String,
    sid: String,
    rid: u64,
    requests: usize,
    backlog: VecDeque<Element>,
    shared: Arc<Shared>,
}

impl Session {
    fn new(client: reqwest::Client, url: Arc<str>, domain: &str, shared: Arc<Shared>) -> Self {
        // Large enough to be unpredictable, small enough to never wrap.
        let rid = rand::thread_rng().gen_range(1_000_000u64..4_000_000_000u64);
        Self {
            client,
            url,
            domain: domain.to_string(),
            sid: String::new(),
            rid,
            requests: 2,
            backlog: VecDeque::new(),
            shared,
        }
    }

    fn resume(client: reqwest::Client, url: Arc<str>, domain: &str, sid: &str, rid: u64, shared: Arc<Shared>) -> Self {
        let mut session = Self::new(client, url, domain, shared);
        session.sid = sid.to_string();
        session.rid = rid;
        session.publish_token();
        session
    }

    fn publish_token(&self) {
        *self.shared.token.lock() = Some(SessionToken {
            sid: self.sid.clone(),
            rid: self.rid,
        });
    }

    fn take_rid(&mut self) -> u64 {
        let rid = self.rid;
        self.rid += 1;
        self.publish_token();
        rid
    }

    fn body(&mut self, payload: impl IntoIterator<Item = Element>) -> (u64, Element) {
        let rid = self.take_rid();
        let mut body = Element::with_ns("body", ns::HTTPBIND)
            .attr("rid", rid.to_string())
            .attr("sid", self.sid.clone());
        for element in payload {
            body.append(element);
        }
        (rid, body)
    }

    /// Synchronous request used while negotiating.
    async fn exchange(&mut self, rid: u64, body: Element) -> Result<Element, ConnectionError> {
        let exchange = post(self.client.clone(), self.url.clone(), rid, body.to_xml(), 0).await;
        let response = exchange.result?;
        if let Some(condition) = terminate_condition(&response) {
            return Err(ConnectionError::new(condition));
        }
        self.backlog.extend(response.children().cloned());
        Ok(response)
    }

    async fn create(&mut self) -> Result<(), ConnectionError> {
        let rid = self.take_rid();
        let body = Element::with_ns("body", ns::HTTPBIND)
            .attr("content", "text/xml; charset=utf-8")
            .attr("hold", "1")
            .attr("rid", rid.to_string())
            .attr("to", self.domain.clone())
            .attr("ver", "1.6")
            .attr("wait", WAIT_SECS.to_string())
            .attr("xml:lang", "en")
            .attr("xmpp:version", "1.0")
            .attr("xmlns:xmpp", ns::XBOSH);
        let response = self.exchange(rid, body).await?;

        self.sid = response
            .get_attr("sid")
            .ok_or_else(|| ConnectionError::new("session creation response without sid"))?
            .to_string();
        if let Some(requests) = response.get_attr("requests").and_then(|r| r.parse().ok()) {
            self.requests = requests;
        }
        self.publish_token();
        info!(sid = %self.sid, requests = self.requests, "BOSH session created");
        Ok(())
    }

    async fn send(&mut self, payload: Element) -> Result<(), ConnectionError> {
        let (rid, body) = self.body([payload]);
        self.exchange(rid, body).await.map(|_| ())
    }

    /// Next element from the server, polling with empty bodies as needed.
    async fn next(&mut self) -> Result<Element, ConnectionError> {
        loop {
            if let Some(element) = self.backlog.pop_front() {
                return Ok(element);
            }
            let (rid, body) = self.body(std::iter::empty());
            self.exchange(rid, body).await?;
        }
    }

    async fn features(&mut self) -> Result<Element, ConnectionError> {
        loop {
            let element = self.next().await?;
            if element.local_name() == "features" {
                return Ok(element);
            }
            debug!(name = element.name(), "Skipping element while waiting for features");
        }
    }

    async fn restart(&mut self) -> Result<Element, ConnectionError> {
        let (rid, body) = self.body(std::iter::empty());
        let body = body
            .attr("to", self.domain.clone())
            .attr("xml:lang", "en")
            .attr("xmpp:restart", "true")
            .attr("xmlns:xmpp", ns::XBOSH);
        self.exchange(rid, body).await?;
        self.features().await
    }

    async fn response_to(&mut self, id: &str) -> Result<Element, ConnectionError> {
        loop {
            let element = self.next().await?;
            if element.name() == "iq" && element.get_attr("id") == Some(id) {
                return Ok(element);
            }
        }
    }

    async fn login(&mut self, jid: &Jid, password: &str) -> Result<Jid, NegotiationError> {
        self.create().await?;
        let features = self.features().await?;
        self.send(negotiate::start_auth(&features, jid, password)?).await?;
        negotiate::auth_outcome(&self.next().await?)?;
        info!(jid = %jid.bare(), "Authenticated");

        let features = self.restart().await?;
        if !negotiate::offers_bind(&features) {
            return Err(ConnectionError::new("server does not offer resource binding").into());
        }
        self.send(negotiate::bind_request("bind-1", jid.resource())).await?;
        let bound = negotiate::bound_jid(&self.response_to("bind-1").await?)?;

        if negotiate::requires_session(&features) {
            self.send(negotiate::session_request("session-1")).await?;
            let answer = self.response_to("session-1").await?;
            if answer.get_attr("type") == Some("error") {
                return Err(ConnectionError::new(negotiate::stanza_error_condition(&answer)).into());
            }
        }
        Ok(bound)
    }

    /// Keep requests flowing until the session ends. Returns the end condition.
    async fn run(
        mut self,
        inbound: mpsc::UnboundedSender<Element>,
        mut outgoing: mpsc::UnboundedReceiver<Element>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<String> {
        for element in self.backlog.drain(..) {
            let _ = inbound.send(element);
        }

        let mut queue: Vec<Element> = Vec::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.requests.max(1) && (!queue.is_empty() || in_flight.is_empty()) {
                let (rid, body) = self.body(queue.drain(..));
                in_flight.push(post(self.client.clone(), self.url.clone(), rid, body.to_xml(), 0));
            }

            tokio::select! {
                Some(exchange) = in_flight.next() => match exchange.result {
                    Ok(body) => {
                        if let Some(condition) = terminate_condition(&body) {
                            warn!(sid = %self.sid, condition = %condition, "BOSH session terminated by server");
                            return Some(condition);
                        }
                        for element in body.children() {
                            let _ = inbound.send(element.clone());
                        }
                    }
                    Err(e) if exchange.attempt + 1 < MAX_RETRIES => {
                        warn!(rid = exchange.rid, attempt = exchange.attempt + 1, error = %e, "Retrying BOSH request");
                        in_flight.push(post(
                            self.client.clone(),
                            self.url.clone(),
                            exchange.rid,
                            exchange.body,
                            exchange.attempt + 1,
                        ));
                    }
                    Err(e) => {
                        warn!(rid = exchange.rid, error = %e, "BOSH request failed");
                        return Some(e.condition);
                    }
                },
                msg = outgoing.recv() => match msg {
                    Some(element) => queue.push(element),
                    None => return None,
                },
                _ = shutdown.changed() => {
                    let (rid, body) = self.body(queue.drain(..));
                    let body = body.attr("type", "terminate");
                    let _ = post(self.client.clone(), self.url.clone(), rid, body.to_xml(), 0).await;
                    return None;
                }
            }
        }
    }
}

enum NegotiationError {
    Connection(ConnectionError),
    Authentication(AuthenticationError),
}

impl From<ConnectionError> for NegotiationError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<AuthenticationError> for NegotiationError {
    fn from(e: AuthenticationError) -> Self {
        Self::Authentication(e)
    }
}

struct BoshState {
    outgoing: Option<mpsc::UnboundedSender<Element>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

pub struct BoshTransport {
    url: Arc<str>,
    client: reqwest::Client,
    inbound: mpsc::UnboundedSender<Element>,
    shared: Arc<Shared>,
    state: Mutex<BoshState>,
}

impl BoshTransport {
    pub fn new(url: &str, inbound: mpsc::UnboundedSender<Element>, config: &SessionConfig) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.tcp_connect_timeout)
            .danger_accept_invalid_certs(config.dangerous_insecure_tls)
            .build()
            .map_err(|e| ConnectionError::new(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: Arc::from(url),
            client,
            inbound,
            shared: Arc::new(Shared::default()),
            state: Mutex::new(BoshState {
                outgoing: None,
                shutdown: None,
                task: None,
            }),
        })
    }

    /// Start the session task and keep its handles.
    fn spawn<F, Fut>(&self, start: F)
    where
        F: FnOnce(mpsc::UnboundedSender<Element>, mpsc::UnboundedReceiver<Element>, watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(start(self.inbound.clone(), outgoing_rx, shutdown_rx));

        let mut state = self.state.lock();
        if let Some(previous) = state.task.replace(task) {
            previous.abort();
        }
        state.outgoing = Some(outgoing_tx);
        state.shutdown = Some(shutdown_tx);
    }
}

impl Transport for BoshTransport {
    fn connect(&self, jid: &Jid, password: &str, status: StatusCallback) {
        let mut session = Session::new(self.client.clone(), self.url.clone(), jid.domain(), self.shared.clone());
        let jid = jid.clone();
        let password = password.to_string();
        let shared = self.shared.clone();

        self.spawn(move |inbound, outgoing, shutdown| async move {
            status(ConnectionStatus::Connecting, None);
            match session.login(&jid, &password).await {
                Ok(bound) => {
                    info!(jid = %bound, sid = %session.sid, "Resource bound");
                    *shared.bound.lock() = Some(bound);
                }
                Err(NegotiationError::Authentication(e)) => {
                    warn!(jid = %jid.bare(), condition = %e.condition, "Authentication failed");
                    status(ConnectionStatus::AuthenticationFailed, Some(e.condition));
                    return;
                }
                Err(NegotiationError::Connection(e)) => {
                    warn!(jid = %jid.bare(), condition = %e.condition, "Connection failed");
                    status(ConnectionStatus::ConnectionFailed, Some(e.condition));
                    return;
                }
            }
            status(ConnectionStatus::Connected, None);
            let condition = session.run(inbound, outgoing, shutdown).await;
            status(ConnectionStatus::Disconnected, condition);
        });
    }

    fn attach(&self, jid: &Jid, sid: &str, rid: u64, status: StatusCallback) {
        let session = Session::resume(self.client.clone(), self.url.clone(), jid.domain(), sid, rid, self.shared.clone());
        *self.shared.bound.lock() = Some(jid.clone());
        info!(jid = %jid, sid, rid, "Attaching to BOSH session");

        self.spawn(move |inbound, outgoing, shutdown| async move {
            status(ConnectionStatus::Attached, None);
            let condition = session.run(inbound, outgoing, shutdown).await;
            status(ConnectionStatus::Disconnected, condition);
        });
    }

    fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        let state = self.state.lock();
        let outgoing = state.outgoing.as_ref().ok_or_else(ConnectionError::closed)?;
        outgoing.send(stanza).map_err(|_| ConnectionError::closed())
    }

    fn disconnect(&self, reason: Option<&str>) {
        info!(reason = reason.unwrap_or("none"), "Disconnecting BOSH session");
        let mut state = self.state.lock();
        state.outgoing = None;
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }

    fn session_token(&self) -> Option<SessionToken> {
        self.shared.token.lock().clone()
    }

    fn bound_jid(&self) -> Option<Jid> {
        self.shared.bound.lock().clone()
    }
}

impl Drop for BoshTransport {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}
