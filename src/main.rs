use anyhow::Result;
use tracing::info;

use booking_agent::{AgentApp, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let config = Config::load()?;
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration validation failed: {e}");
    }

    // Signal handling lives inside run(): the agent stops on Ctrl+C or
    // SIGTERM after draining the API server.
    let app = AgentApp::new(config).await?;
    app.run().await?;

    info!("Booking agent stopped");
    Ok(())
}
