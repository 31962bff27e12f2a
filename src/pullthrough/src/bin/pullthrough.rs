use pullthrough::{start_server, CommandCopier, Config};
use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Optional TOML file as the first argument; environment always wins
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("image re-pull min interval: {:?}", config.pull.repull_interval);
    tracing::info!("image pull timeout: {:?}", config.pull.pull_timeout);
    tracing::info!("image copy mode: {}", config.pull.copy_mode);
    tracing::info!(
        "dockerhub mirror: {}",
        config.pull.mirror.as_deref().unwrap_or("")
    );
    tracing::info!(
        "backend registry: {} (copy target port from {})",
        config.server.backend_url(),
        config.server.registry_address
    );

    let copier = CommandCopier::new(&config.copier);
    let server = match start_server(config, copier).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Listening on {}. Press Ctrl+C to stop.", server.local_addr);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        }
        result = server.handle => {
            if let Err(e) = result {
                tracing::error!("Server task failed: {:?}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
