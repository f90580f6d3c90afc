//! regtrack daemon entry point

use tracing::info;

type MainResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> MainResult {
    // Initialize environment (load .env, etc.)
    regtrack_common::initialize_environment();
    regtrack_common::init_tracing("info,sqlx=warn");

    info!("Starting regtrack daemon...");

    let config = regtrack_config::ApplicationConfig::from_env();
    let app = regtrack::start(config).await?;

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("interrupt received");

    app.shutdown().await;
    Ok(())
}
