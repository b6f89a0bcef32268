use super::ServerContext;
use crate::cache::manager;
use crate::config::Config;
use crate::error::ProxyError;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: Option<String>,
}

/// Proxy lifecycle: init logging → load config → build state → start cache
/// managers → accept loop → drain on signal.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = Config::load(&args.config_path)
        .map_err(|e| anyhow::Error::new(ProxyError::Config(format!("{e:#}"))))?;
    let ctx = ServerContext::build(&config)
        .map_err(|e| anyhow::Error::new(ProxyError::Config(format!("{e:#}"))))?;

    let shutdown = Arc::new(Notify::new());
    let mut managers = Vec::new();
    for zone in ctx.caches.values() {
        managers.push(manager::spawn(zone.clone(), shutdown.clone()));
    }

    let listen = args.listen.unwrap_or_else(|| config.listen.clone());
    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(
        "server: listening on {}, locations={}, upstreams={}, cache_zones={}",
        listen,
        config.location.len(),
        config.upstream.len(),
        ctx.caches.len()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            super::handle_connection(ctx, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("server: accept failed: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("server: shutdown signal received");
                break;
            }
        }
    }

    shutdown.notify_waiters();
    for handle in managers {
        let _ = handle.await;
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (tests, embedding) is not an error worth failing on.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
