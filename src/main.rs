#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use talaria::error::ProxyError;
use talaria::server;

#[derive(Parser)]
#[command(name = "talaria", about = "HTTP reverse proxy with disk-backed response caching")]
struct Cli {
    /// Path to the proxy config file
    #[arg(short, long, default_value = "talaria.toml")]
    config: PathBuf,

    /// Listen address override (takes precedence over the config file)
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let config_error = e
                .chain()
                .any(|c| matches!(c.downcast_ref::<ProxyError>(), Some(ProxyError::Config(_))));
            eprintln!("talaria: {e:#}");
            if config_error {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let worker_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
    }))
}
