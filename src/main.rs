use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fluux_session::{
    AccountMode, Contact, ContactPresence, MemoryStorage, Presence, ReceivedMessage, SessionConfig, SessionContext,
    StatusChange,
};

#[derive(Parser, Debug)]
#[command(name = "fluux-session", version = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("GIT_HASH"), ")"))]
#[command(about = "Keep an XMPP session alive and print roster and message traffic")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. FLUUX_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr. `--verbose=xmpp` includes stanza traffic.
    #[arg(short, long, global = true, num_args = 0..=1, default_missing_value = "default")]
    verbose: Option<String>,

    /// Log directory (default: platform log dir).
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Disable TLS certificate verification (INSECURE!)
    #[arg(long, global = true)]
    dangerous_insecure_tls: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with a password.
    Login {
        /// `https://host/http-bind`, `tls://host:port`, `host:port` or a bare domain
        url: String,
        jid: String,
        #[arg(long)]
        password: String,
    },
    /// Resume an existing BOSH session.
    Attach {
        url: String,
        jid: String,
        sid: String,
        rid: u64,
    },
}

impl Command {
    fn into_mode(self) -> AccountMode {
        match self {
            Command::Login { url, jid, password } => AccountMode::Login { url, jid, password },
            Command::Attach { url, jid, sid, rid } => AccountMode::Attach { url, jid, sid, rid },
        }
    }
}

/// Platform log directory:
///   macOS:   ~/Library/Logs/io.fluux.session/
///   Linux:   ~/.local/share/io.fluux.session/logs/  (or $XDG_DATA_HOME)
///   Windows: %APPDATA%\io.fluux.session\logs\
fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("io.fluux.session").join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join("io.fluux.session"))
        .unwrap_or(dir);

    dir
}

/// File layer always, stderr layer with `--verbose` or `RUST_LOG`. The returned
/// guard flushes the file writer when dropped.
fn init_logging(cli: &Cli) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_log_dir);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_session=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-session.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if cli.verbose.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if cli.verbose.as_deref() == Some("xmpp") {
            EnvFilter::new("fluux_session=debug,fluux_session::xmpp=debug,info")
        } else {
            EnvFilter::new("fluux_session=info,fluux_session::xmpp=off,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    eprintln!("Log file: {}", log_dir.display());
    guard
}

fn print_contact(contact: &Contact) {
    println!(
        "  {:<32} {:<24} {:<6} {}",
        contact.id(),
        contact.name(),
        contact.subscription().as_str(),
        contact.presence()
    );
}

fn load_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::from_env()?,
    };
    if cli.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
        config.dangerous_insecure_tls = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli);
    let config = load_config(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        os = std::env::consts::OS,
        "Starting"
    );

    let context = SessionContext::new(config, Arc::new(MemoryStorage::new()));
    let account = context.create_account(cli.command.into_mode())?;

    let hooks = account.hooks();
    hooks.connection_status.subscribe(|change: &StatusChange| match &change.condition {
        Some(condition) => println!("* {} -> {} ({})", change.from, change.to, condition),
        None => println!("* {} -> {}", change.from, change.to),
    });
    hooks.contact_added.subscribe(|contact: &Arc<Contact>| {
        print!("+");
        print_contact(contact);
    });
    hooks.contact_removed.subscribe(|contact: &Arc<Contact>| println!("- {}", contact.id()));
    hooks.presence_changed.subscribe(|change: &ContactPresence| {
        println!("~ {} is {} (was {})", change.contact.id(), change.presence, change.previous);
    });
    hooks.subscription_request.subscribe(|jid: &fluux_session::Jid| {
        println!("? {} wants to see your presence", jid);
    });
    hooks.message_received.subscribe(|received: &ReceivedMessage| {
        println!(
            "[{}] {}: {}",
            received.message.stamp().format("%H:%M:%S"),
            received.contact.name(),
            received.message.plaintext()
        );
    });

    context.presence().set_target(Presence::Online);
    account.connect().await.context("session setup failed")?;

    println!("Roster of {} (session {}):", account.uid(), account.session_id());
    for contact in account.contacts() {
        print_contact(&contact);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, going offline");
    if let Some(token) = account.connection().transport().and_then(|t| t.session_token()) {
        println!("Session {} next rid {}", token.sid, token.rid);
    }
    context.set_presence(Presence::Offline);
    if !account.is_destroyed() {
        warn!(jid = %account.uid(), "Account still alive after going offline");
    }
    Ok(())
}
