//! Server address parsing and SRV lookup for stream transports.
//!
//! Turns a server string (bare domain, `tls://host:port`, ...) into the ordered list
//! of endpoints to try. SRV records are sorted by priority, then weight (RFC 2782).

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP upgraded with STARTTLS.
    StartTls,
    /// TLS from the first byte.
    DirectTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain for SNI and the stream `to`, when it differs from `host`.
    pub domain: Option<String>,
}

impl Endpoint {
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    Direct(Endpoint),
    /// Needs SRV resolution.
    Domain(String),
}

/// `?domain=` suffix on explicit endpoints.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn explicit(rest: &str, default_port: u16, mode: ConnectionMode) -> ServerTarget {
    let (host_port, domain) = split_domain_param(rest);
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (host_port, default_port),
        },
        None => (host_port, default_port),
    };
    ServerTarget::Direct(Endpoint {
        host: host.to_string(),
        port,
        mode,
        domain,
    })
}

/// Parse a server string.
///
/// - `tls://host[:port][?domain=d]`: direct TLS, port 5223 by default
/// - `tcp://host[:port][?domain=d]`: STARTTLS, port 5222 by default
/// - `host:port`: direct TLS on 5223, STARTTLS otherwise
/// - `domain`: SRV resolution
pub fn parse_server(input: &str) -> ServerTarget {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        return explicit(rest, 5223, ConnectionMode::DirectTls);
    }
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        return explicit(rest, 5222, ConnectionMode::StartTls);
    }

    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let mode = if port == 5223 {
                ConnectionMode::DirectTls
            } else {
                ConnectionMode::StartTls
            };
            return ServerTarget::Direct(Endpoint {
                host: host.to_string(),
                port,
                mode,
                domain: None,
            });
        }
    }

    ServerTarget::Domain(trimmed.to_string())
}

async fn srv_endpoints(
    resolver: &TokioAsyncResolver,
    domain: &str,
    service: &str,
    mode: ConnectionMode,
) -> Vec<Endpoint> {
    let name = format!("{}.{}", service, domain);
    let started = Instant::now();
    let lookup = match resolver.srv_lookup(&name).await {
        Ok(lookup) => lookup,
        Err(e) => {
            info!(domain, srv = %name, lookup_ms = started.elapsed().as_millis() as u64,
                error = %e, "SRV lookup failed");
            return Vec::new();
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    records.sort_by(|a, b| a.priority().cmp(&b.priority()).then(b.weight().cmp(&a.weight())));

    records
        .into_iter()
        .filter_map(|r| {
            let target = r.target().to_string().trim_end_matches('.').to_string();
            // "." means the service is explicitly unavailable.
            if target.is_empty() {
                return None;
            }
            info!(domain, host = %target, port = r.port(), priority = r.priority(),
                weight = r.weight(), mode = ?mode, "SRV record");
            Some(Endpoint {
                host: target,
                port: r.port(),
                mode,
                domain: Some(domain.to_string()),
            })
        })
        .collect()
}

/// Candidate endpoints for `domain`, in connection order: direct TLS records, then
/// STARTTLS records, then `domain:5222` when there are no records at all.
pub async fn resolve(domain: &str) -> Vec<Endpoint> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints =
        srv_endpoints(&resolver, domain, "_xmpps-client._tcp", ConnectionMode::DirectTls).await;
    endpoints.extend(srv_endpoints(&resolver, domain, "_xmpp-client._tcp", ConnectionMode::StartTls).await);

    if endpoints.is_empty() {
        warn!(domain, resolve_ms = started.elapsed().as_millis() as u64,
            "No SRV records found, falling back to port 5222");
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: 5222,
            mode: ConnectionMode::StartTls,
            domain: None,
        });
    } else {
        info!(domain, total = endpoints.len(), resolve_ms = started.elapsed().as_millis() as u64,
            "SRV resolution complete");
    }
    endpoints
}

/// Endpoints for a server string; an empty string resolves the account domain.
pub async fn endpoints_for(server: &str, account_domain: &str) -> Result<Vec<Endpoint>, ConnectionError> {
    let server = if server.trim().is_empty() { account_domain } else { server };
    match parse_server(server) {
        ServerTarget::Direct(endpoint) => Ok(vec![endpoint]),
        ServerTarget::Domain(domain) if domain.is_empty() => {
            Err(ConnectionError::new("no server to connect to"))
        }
        ServerTarget::Domain(domain) => Ok(resolve(&domain).await),
    }
}
