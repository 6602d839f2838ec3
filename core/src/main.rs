/// ChatSync server - Main entry point
use chatsync_core::messenger_api::start_messenger_api;
use chatsync_core::{Config, Messenger};
use std::env;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let messenger = Messenger::open(&config)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    info!("Starting ChatSync");
    info!("   Data dir: {:?}", config.data_dir);
    info!("   API: http://{}", config.api_addr);

    // Serve until Ctrl+C / SIGTERM
    tokio::select! {
        result = start_messenger_api(messenger, config.api_addr) => {
            result.map_err(|e| anyhow::anyhow!("Messenger API error: {}", e))?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping");
        }
    }

    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}
