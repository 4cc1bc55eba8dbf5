//! media-jail server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use media_jail::{load_patterns, router, Config, Proxy};

/// Signed-URL media proxy
#[derive(Parser)]
#[command(name = "media-jail")]
#[command(version)]
struct Args {
    /// TOML configuration file. Flags override its values.
    #[arg(short, long, env = "MEDIA_JAIL_CONFIG")]
    config: Option<PathBuf>,

    /// HMAC key for token signatures
    #[arg(short = 'k', long, env = "MEDIA_JAIL_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Listen address
    #[arg(short, long, env = "MEDIA_JAIL_LISTEN")]
    listen: Option<SocketAddr>,

    /// Maximum response size in bytes (0 = unlimited)
    #[arg(long)]
    max_size: Option<u64>,

    /// Upstream deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Maximum redirects to follow
    #[arg(long)]
    max_redirects: Option<u32>,

    /// Server name for the Server and User-Agent headers
    #[arg(long)]
    server_name: Option<String>,

    /// Allow video/* content types
    #[arg(long)]
    allow_content_video: bool,

    /// Allow user:pass@ in target URLs
    #[arg(long)]
    allow_credential_urls: bool,

    /// Forward X-Forwarded-For with the caller appended
    #[arg(long)]
    enable_xfwd_for: bool,

    /// Disable address range filtering (testing only)
    #[arg(long)]
    no_ip_filtering: bool,

    /// File of allowed host patterns, one per line
    #[arg(long)]
    allow_list: Option<PathBuf>,

    /// File of denied host patterns, one per line
    #[arg(long)]
    deny_list: Option<PathBuf>,

    /// Extra response header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(key) = self.key {
            config.hmac_key = key;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(max_size) = self.max_size {
            config.max_size = max_size;
        }
        if let Some(ms) = self.timeout_ms {
            config.request_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(max) = self.max_redirects {
            config.max_redirects = max;
        }
        if let Some(name) = self.server_name {
            config.server_name = name;
        }
        config.allow_content_video |= self.allow_content_video;
        config.allow_credential_urls |= self.allow_credential_urls;
        config.enable_xfwd_for |= self.enable_xfwd_for;
        config.no_ip_filtering |= self.no_ip_filtering;

        if let Some(path) = &self.allow_list {
            config.allow_list.extend(
                load_patterns(path)
                    .with_context(|| format!("reading allow list {}", path.display()))?,
            );
        }
        if let Some(path) = &self.deny_list {
            config.deny_list.extend(
                load_patterns(path)
                    .with_context(|| format!("reading deny list {}", path.display()))?,
            );
        }
        config.add_headers.extend(self.headers);

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, args.json_logs);

    let config = args.into_config()?;
    let listen = config.listen;
    info!(?config, "starting");

    let proxy = Arc::new(Proxy::new(config).context("building proxy")?);
    let app = router(proxy).context("building router")?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("listening on {}", listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}
