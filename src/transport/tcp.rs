//! XMPP over TCP: direct TLS or STARTTLS, SASL PLAIN and resource binding.
//!
//! Once the stream is negotiated, a reader task extracts stanzas from the TLS
//! stream and forwards them to the inbound channel, a writer task drains the
//! outbound queue, and a watchdog closes the stream after prolonged silence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::dns::{endpoints_for, ConnectionMode, Endpoint};
use super::{log_traffic, negotiate, SessionToken, StatusCallback, Transport};
use crate::config::SessionConfig;
use crate::connector::ConnectionStatus;
use crate::error::{AuthenticationError, ConnectionError};
use crate::jid::Jid;
use crate::namespace as ns;
use crate::stanza::framing::{stream_header, Frame, FrameBuffer};
use crate::stanza::{iq, Element};

/// Bound on each read while negotiating the stream.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the watchdog checks for inactivity.
const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const STREAM_CLOSE: &str = "</stream:stream>";

type Tls = TlsStream<TcpStream>;

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Install the rustls crypto provider once per process.
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any certificate. Only used with `dangerous_insecure_tls`.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn create_tls_connector(insecure: bool) -> Result<TlsConnector, ConnectionError> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(ConnectionError::new(
            "No system root certificates found. Ensure CA certificates are installed.",
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ConnectionError::new(format!("Failed to add cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn upgrade_to_tls(tcp_stream: TcpStream, host: &str, insecure: bool) -> Result<Tls, ConnectionError> {
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ConnectionError::new(format!("Invalid server name: {}", e)))?;

    connector.connect(server_name, tcp_stream).await.map_err(|e| {
        let detail = e.to_string();
        let classification = if detail.contains("ertificate") {
            "certificate_error"
        } else if detail.contains("timed out") || detail.contains("timeout") {
            "timeout"
        } else if detail.contains("refused") || detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(host, error = %e, error_class = classification, "TLS handshake failed");
        ConnectionError::new(format!("TLS handshake failed with {} ({}): {}", host, classification, e))
    })
}

/// Settings copied out of [`SessionConfig`].
#[derive(Debug, Clone)]
struct TcpSettings {
    connect_timeout: Duration,
    inactivity_timeout: Duration,
    ping_interval: Duration,
    max_buffer: usize,
    insecure_tls: bool,
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

/// Frame-level reads and writes on a stream being negotiated.
struct StreamIo<S> {
    stream: S,
    frames: FrameBuffer,
    pending: std::collections::VecDeque<Frame>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> StreamIo<S> {
    fn new(stream: S, max_buffer: usize) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(max_buffer),
            pending: Default::default(),
        }
    }

    async fn write(&mut self, data: &str) -> Result<(), ConnectionError> {
        log_traffic(">", data);
        self.stream
            .write_all(data.as_bytes())
            .await
            .map_err(|e| ConnectionError::new(format!("write failed: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ConnectionError::new(format!("flush failed: {}", e)))
    }

    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        let mut read_buf = [0u8; 8192];
        let deadline = tokio::time::Instant::now() + NEGOTIATION_TIMEOUT;
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut read_buf))
                .await
                .map_err(|_| ConnectionError::new("timeout waiting for server"))?
                .map_err(|e| ConnectionError::new(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(ConnectionError::new("server closed the connection during negotiation"));
            }
            let frames = self
                .frames
                .push(&read_buf[..n])
                .map_err(|e| ConnectionError::new(format!("stanza buffer exceeded {} bytes", e.limit)))?;
            self.pending.extend(frames);
        }
    }

    async fn next_element(&mut self) -> Result<Element, ConnectionError> {
        loop {
            match self.next_frame().await? {
                Frame::Stanza(xml) => {
                    log_traffic("<", &xml);
                    let element = Element::parse(&xml).map_err(|e| ConnectionError::new(e.to_string()))?;
                    if element.name() == "stream:error" {
                        return Err(ConnectionError::new(stream_error_condition(&element)));
                    }
                    return Ok(element);
                }
                Frame::StreamOpen(_) => debug!("Ignoring unexpected stream header"),
                Frame::StreamClose => return Err(ConnectionError::new("stream closed by server")),
            }
        }
    }

    /// Send a stream header and read the server's header and features.
    async fn open(&mut self, domain: &str) -> Result<Element, ConnectionError> {
        self.write(&stream_header(domain)).await?;
        match self.next_frame().await? {
            Frame::StreamOpen(_) => {}
            other => {
                return Err(ConnectionError::new(format!(
                    "expected stream header, got {:?}",
                    other
                )))
            }
        }
        let features = self.next_element().await?;
        if features.local_name() != "features" {
            return Err(ConnectionError::new(format!(
                "expected stream features, got <{}/>",
                features.name()
            )));
        }
        Ok(features)
    }

    /// Wait for the iq answering `id`, skipping anything else.
    async fn response_to(&mut self, id: &str) -> Result<Element, ConnectionError> {
        loop {
            let element = self.next_element().await?;
            if element.name() == "iq" && element.get_attr("id") == Some(id) {
                return Ok(element);
            }
            debug!(name = element.name(), "Skipping stanza during negotiation");
        }
    }

    fn into_parts(self) -> (S, FrameBuffer, std::collections::VecDeque<Frame>) {
        (self.stream, self.frames, self.pending)
    }
}

fn stream_error_condition(element: &Element) -> String {
    element
        .children()
        .find(|c| c.local_name() != "text")
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "stream-error".to_string())
}

async fn tcp_connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let mode = match endpoint.mode {
        ConnectionMode::StartTls => "starttls",
        ConnectionMode::DirectTls => "direct_tls",
    };
    tokio::time::timeout(timeout, TcpStream::connect((endpoint.host.as_str(), endpoint.port)))
        .await
        .map_err(|_| {
            error!(host = %endpoint.host, port = endpoint.port, mode,
                timeout_secs = timeout.as_secs(), "TCP connect timed out");
            ConnectionError::new(format!(
                "TCP connect timed out after {}s to {}:{}",
                timeout.as_secs(),
                endpoint.host,
                endpoint.port
            ))
        })?
        .map_err(|e| {
            error!(host = %endpoint.host, port = endpoint.port, mode,
                error = %e, error_kind = ?e.kind(), "TCP connect failed");
            ConnectionError::new(format!(
                "Failed to connect to {}:{} ({}): {}",
                endpoint.host, endpoint.port, mode, e
            ))
        })
}

/// Negotiate STARTTLS on a plain connection and upgrade it.
async fn perform_starttls(tcp_stream: TcpStream, domain: &str, settings: &TcpSettings) -> Result<Tls, ConnectionError> {
    let mut io = StreamIo::new(tcp_stream, settings.max_buffer);
    let features = io.open(domain).await?;
    if !negotiate::offers_starttls(&features) {
        return Err(ConnectionError::new("server does not offer STARTTLS"));
    }

    io.write(&Element::with_ns("starttls", ns::TLS).to_xml()).await?;
    let answer = io.next_element().await?;
    match answer.local_name() {
        "proceed" => {}
        "failure" => return Err(ConnectionError::new("server rejected STARTTLS")),
        other => {
            return Err(ConnectionError::new(format!(
                "unexpected <{}/> (expected <proceed/>)",
                other
            )))
        }
    }
    info!(domain, "STARTTLS: received <proceed/>, upgrading to TLS");

    let (tcp_stream, _, _) = io.into_parts();
    upgrade_to_tls(tcp_stream, domain, settings.insecure_tls).await
}

async fn connect_endpoint(endpoint: &Endpoint, settings: &TcpSettings) -> Result<Tls, ConnectionError> {
    let tcp_stream = tcp_connect(endpoint, settings.connect_timeout).await?;
    match endpoint.mode {
        ConnectionMode::StartTls => perform_starttls(tcp_stream, endpoint.tls_name(), settings).await,
        ConnectionMode::DirectTls => upgrade_to_tls(tcp_stream, endpoint.tls_name(), settings.insecure_tls).await,
    }
}

/// Try each candidate endpoint in order until one yields a TLS stream.
async fn connect_upstream_tls(server: &str, domain: &str, settings: &TcpSettings) -> Result<Tls, ConnectionError> {
    let started = Instant::now();
    let endpoints = endpoints_for(server, domain).await?;
    let mut last_error = ConnectionError::new("no endpoint to connect to");

    for endpoint in &endpoints {
        info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
            tls_name = endpoint.tls_name(), "Connecting");
        match connect_endpoint(endpoint, settings).await {
            Ok(stream) => {
                info!(host = %endpoint.host, port = endpoint.port,
                    connect_ms = started.elapsed().as_millis() as u64, "TLS established");
                return Ok(stream);
            }
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %e, "Endpoint failed");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// TLS, authentication, stream restart and binding.
async fn establish(
    server: &str,
    jid: &Jid,
    password: &str,
    settings: &TcpSettings,
) -> Result<(StreamIo<Tls>, Jid), NegotiationError> {
    let tls = connect_upstream_tls(server, jid.domain(), settings).await?;
    let mut io = StreamIo::new(tls, settings.max_buffer);

    let features = io.open(jid.domain()).await?;
    let auth = negotiate::start_auth(&features, jid, password)?;
    io.write(&auth.to_xml()).await?;
    negotiate::auth_outcome(&io.next_element().await?)?;
    info!(jid = %jid.bare(), "Authenticated");

    let features = io.open(jid.domain()).await?;
    if !negotiate::offers_bind(&features) {
        return Err(ConnectionError::new("server does not offer resource binding").into());
    }
    io.write(&negotiate::bind_request("bind-1", jid.resource()).to_xml()).await?;
    let bound = negotiate::bound_jid(&io.response_to("bind-1").await?)?;

    if negotiate::requires_session(&features) {
        io.write(&negotiate::session_request("session-1").to_xml()).await?;
        let answer = io.response_to("session-1").await?;
        if answer.get_attr("type") == Some("error") {
            return Err(ConnectionError::new(negotiate::stanza_error_condition(&answer)).into());
        }
    }

    info!(jid = %bound, "Resource bound");
    Ok((io, bound))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEndReason {
    ClosedByServer,
    ReadError,
    BufferOverflow,
    WriteError,
    WatchdogTimeout,
    Shutdown,
}

/// Run the established stream until it ends. Returns why it ended.
async fn pump(
    io: StreamIo<Tls>,
    inbound: mpsc::UnboundedSender<Element>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
    settings: TcpSettings,
) -> StreamEndReason {
    let (tls, mut frames, pending) = io.into_parts();
    let (mut tls_read, mut tls_write) = tokio::io::split(tls);
    let last_activity = Arc::new(AtomicU64::new(now_millis()));

    let deliver = move |frame: Frame, inbound: &mpsc::UnboundedSender<Element>| -> Option<StreamEndReason> {
        match frame {
            Frame::Stanza(xml) => {
                log_traffic("<", &xml);
                match Element::parse(&xml) {
                    Ok(element) if element.name() == "stream:error" => {
                        warn!(condition = %stream_error_condition(&element), "Stream error from server");
                        Some(StreamEndReason::ClosedByServer)
                    }
                    Ok(element) => {
                        let _ = inbound.send(element);
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping unparsable stanza");
                        None
                    }
                }
            }
            Frame::StreamClose => Some(StreamEndReason::ClosedByServer),
            Frame::StreamOpen(_) => None,
        }
    };

    // Stanzas that arrived together with the bind result.
    for frame in pending {
        if let Some(reason) = deliver(frame, &inbound) {
            return reason;
        }
    }

    let activity_read = last_activity.clone();
    let reader_inbound = inbound.clone();
    let mut reader = tokio::spawn(async move {
        let mut read_buf = [0u8; 8192];
        loop {
            match tls_read.read(&mut read_buf).await {
                Ok(0) => {
                    info!("TLS connection closed");
                    return StreamEndReason::ClosedByServer;
                }
                Ok(n) => {
                    activity_read.store(now_millis(), Ordering::Relaxed);
                    let batch = match frames.push(&read_buf[..n]) {
                        Ok(batch) => batch,
                        Err(overflow) => {
                            error!(buffer_bytes = overflow.buffered, limit = overflow.limit,
                                "Stanza buffer exceeded size limit, closing connection");
                            return StreamEndReason::BufferOverflow;
                        }
                    };
                    for frame in batch {
                        if let Some(reason) = deliver(frame, &reader_inbound) {
                            return reason;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "TLS read error");
                    return StreamEndReason::ReadError;
                }
            }
        }
    });

    let activity_write = last_activity.clone();
    let ping_interval = settings.ping_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval.max(Duration::from_secs(1)));
        ping.tick().await;
        let mut ping_seq: u64 = 0;
        loop {
            let data = tokio::select! {
                msg = outgoing.recv() => match msg {
                    Some(data) => data,
                    None => return StreamEndReason::Shutdown,
                },
                _ = ping.tick(), if !ping_interval.is_zero() => {
                    ping_seq += 1;
                    iq("get")
                        .attr("id", format!("ping-{}", ping_seq))
                        .child(Element::with_ns("ping", ns::PING))
                        .to_xml()
                }
                _ = shutdown.changed() => {
                    log_traffic(">", STREAM_CLOSE);
                    let _ = tls_write.write_all(STREAM_CLOSE.as_bytes()).await;
                    let _ = tls_write.flush().await;
                    return StreamEndReason::Shutdown;
                }
            };
            log_traffic(">", &data);
            if let Err(e) = tls_write.write_all(data.as_bytes()).await {
                error!(error = %e, "TLS write error");
                return StreamEndReason::WriteError;
            }
            if let Err(e) = tls_write.flush().await {
                error!(error = %e, "TLS flush error");
                return StreamEndReason::WriteError;
            }
            activity_write.store(now_millis(), Ordering::Relaxed);
        }
    });

    let inactivity_timeout = settings.inactivity_timeout;
    let watchdog = async move {
        loop {
            tokio::time::sleep(WATCHDOG_CHECK_INTERVAL).await;
            let elapsed_ms = now_millis().saturating_sub(last_activity.load(Ordering::Relaxed));
            if elapsed_ms > inactivity_timeout.as_millis() as u64 {
                warn!(elapsed_secs = elapsed_ms / 1000, timeout_secs = inactivity_timeout.as_secs(),
                    "Inactivity watchdog triggered, closing connection");
                break;
            }
        }
    };

    let reason = tokio::select! {
        result = &mut reader => result.unwrap_or(StreamEndReason::ReadError),
        result = &mut writer => result.unwrap_or(StreamEndReason::WriteError),
        _ = watchdog => StreamEndReason::WatchdogTimeout,
    };

    reader.abort();
    writer.abort();
    reason
}

struct TcpState {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

pub struct TcpTransport {
    server: String,
    inbound: mpsc::UnboundedSender<Element>,
    settings: TcpSettings,
    state: Mutex<TcpState>,
    bound: Arc<Mutex<Option<Jid>>>,
}

impl TcpTransport {
    pub fn new(server: &str, inbound: mpsc::UnboundedSender<Element>, config: &SessionConfig) -> Self {
        Self {
            server: server.to_string(),
            inbound,
            settings: TcpSettings {
                connect_timeout: config.tcp_connect_timeout,
                inactivity_timeout: config.inactivity_timeout,
                ping_interval: config.ping_interval,
                max_buffer: config.max_stanza_buffer,
                insecure_tls: config.dangerous_insecure_tls,
            },
            state: Mutex::new(TcpState {
                outgoing: None,
                shutdown: None,
                task: None,
            }),
            bound: Arc::new(Mutex::new(None)),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, jid: &Jid, password: &str, status: StatusCallback) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = self.server.clone();
        let jid = jid.clone();
        let password = password.to_string();
        let settings = self.settings.clone();
        let inbound = self.inbound.clone();
        let bound = self.bound.clone();

        let task = tokio::spawn(async move {
            status(ConnectionStatus::Connecting, None);
            let (io, bound_jid) = match establish(&server, &jid, &password, &settings).await {
                Ok(established) => established,
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
            };
            *bound.lock() = Some(bound_jid);
            status(ConnectionStatus::Connected, None);

            let reason = pump(io, inbound, outgoing_rx, shutdown_rx, settings).await;
            info!(reason = ?reason, "Stream ended");
            let condition = match reason {
                StreamEndReason::Shutdown => None,
                other => Some(format!("{:?}", other)),
            };
            status(ConnectionStatus::Disconnected, condition);
        });

        let mut state = self.state.lock();
        if let Some(previous) = state.task.replace(task) {
            previous.abort();
        }
        state.outgoing = Some(outgoing_tx);
        state.shutdown = Some(shutdown_tx);
    }

    fn attach(&self, jid: &Jid, _sid: &str, _rid: u64, status: StatusCallback) {
        warn!(jid = %jid, "Attach requested on a stream transport");
        status(
            ConnectionStatus::ConnectionFailed,
            Some("attach is not supported over a stream connection".to_string()),
        );
    }

    fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        let state = self.state.lock();
        let outgoing = state.outgoing.as_ref().ok_or_else(ConnectionError::closed)?;
        outgoing.send(stanza.to_xml()).map_err(|_| ConnectionError::closed())
    }

    fn disconnect(&self, reason: Option<&str>) {
        info!(reason = reason.unwrap_or("none"), "Disconnecting");
        let mut state = self.state.lock();
        state.outgoing = None;
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }

    fn session_token(&self) -> Option<SessionToken> {
        None
    }

    fn bound_jid(&self) -> Option<Jid> {
        self.bound.lock().clone()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}
