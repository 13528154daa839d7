//! token-ra - registration-authority engine for smart-card tokens

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use token_ra::{
    backend::BackendKind,
    config::Args,
    context::{crypto_self_test, RaContext},
    diagnostics::{spawn_flush_task, BufferedLogFile, Diagnostics, FileSink, TracingSink},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "token_ra=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match args.snapshot() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let keys = args.key_store()?;

    info!("======================================");
    info!("  token-ra registration authority");
    info!("======================================");
    info!(
        "Session keys: {}",
        if config.local_diversification { "local diversification" } else { "TKS" }
    );
    info!("TKS pool: {} connection(s)", config.tks_urls.len());
    info!("CA pool: {} connection(s)", config.ca_urls.len());
    info!("DRM pool: {} connection(s)", config.drm_urls.len());
    info!(
        "Log levels: debug={} error={}",
        config.debug_log_level.as_number(),
        config.error_log_level.as_number()
    );
    info!("Card manager AID: {}", config.applet.card_manager_aid);
    info!("======================================");

    crypto_self_test()?;
    info!("Crypto self-test passed");

    // Buffered diagnostics file (optional)
    let mut diagnostics = Diagnostics::new(
        Arc::new(TracingSink),
        config.debug_log_level,
        config.error_log_level,
    );
    let flush_task = match &args.debug_log_file {
        Some(path) => {
            let file = Arc::new(BufferedLogFile::open(path, args.log_buffer_size)?);
            diagnostics = diagnostics.with_sink(Arc::new(FileSink::new(file.clone())));
            Some(spawn_flush_task(file, args.log_flush_interval()))
        }
        None => None,
    };

    let ctx = RaContext::connect(config, keys, diagnostics)?;
    if ctx.config().drm_urls.is_empty() {
        warn!("No DRM configured; key archival and recovery will fail");
    }
    for kind in BackendKind::ALL {
        let pool = ctx.pools().pool(kind);
        for (i, endpoint) in pool.endpoints().iter().enumerate() {
            info!("  {}-{}: {}", kind, i, endpoint);
        }
    }

    info!("RA engine ready; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(handle) = flush_task {
        handle.shutdown().await;
    }

    Ok(())
}
