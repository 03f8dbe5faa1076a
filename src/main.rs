//! SOCKS5 proxy server binary

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use socks5_server_r::config::{AppConfig, CliArgs};
use socks5_server_r::logger::{self, log, LogBuffer};
use socks5_server_r::App;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    let config = AppConfig::load(&cli)?;

    let logs = LogBuffer::new(config.log_capacity);
    logger::init_logger(&config.log_mode, &logs)?;

    log::info!(
        socks5 = %format!("{}:{}", config.server.host, config.server.port),
        admin = %format!("{}:{}", config.admin.host, config.admin.port),
        auth_methods = ?config.server.auth_methods,
        max_connections = config.server.max_connections,
        "Starting SOCKS5 server"
    );

    let app = App::start(config, logs).await?;

    wait_for_signal().await?;
    app.shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}
