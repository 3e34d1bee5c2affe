mod args;
mod config;
mod dispatcher;
mod filter;
mod link;
mod peer;
mod reachability;
mod route;
mod supervisor;
mod tun_device;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;

use args::Args;
use filter::FilterChain;
use link::ClassifyMode;
use supervisor::Supervisor;

const HARDENED_ANNOUNCEMENT_MAX_LEN: usize = 256;

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let cfg = config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config))?;

    let classify = if args.compat_unsafe_classify {
        tracing::warn!("running with unconditioned announcement classification (--compat-unsafe-classify)");
        ClassifyMode::Unconditioned
    } else {
        ClassifyMode::Hardened {
            max_len: HARDENED_ANNOUNCEMENT_MAX_LEN,
        }
    };

    let supervisor = Supervisor::build(cfg, FilterChain::default(), classify)
        .await
        .context("failed to initialize supervisor")?;

    supervisor.run().await
}
