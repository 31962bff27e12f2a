//! Pull-through front in async mode with a Docker Hub mirror
//!
//! Forwards to a registry on `:5000` and copies `library/*` images from the
//! mirror without holding requests back.
//!
//! Run with:
//! ```bash
//! cargo run --example async_mirror
//! ```

use pullthrough::{start_server, CommandCopier, Config, CopyMode};
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    config.server.listen_address = "127.0.0.1:5001".to_string();
    config.pull.copy_mode = CopyMode::Async;
    config.pull.mirror = Some("docker.m.daocloud.io".to_string());
    config.pull.repull_interval = Duration::from_secs(30 * 60);

    tracing::info!("Starting pull-through server...");
    tracing::info!("  Listen: {}", config.server.listen_address);
    tracing::info!("  Backend: {}", config.server.backend_url());
    tracing::info!("  Press Ctrl+C to stop");

    let copier = CommandCopier::new(&config.copier);
    let _server = start_server(config, copier).await?;

    signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    Ok(())
}
