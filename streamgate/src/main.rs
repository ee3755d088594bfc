mod server;

use anyhow::Result;

use streamgate_core::{logging, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = Config::load()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Streamgate starting...");
    if !config.egress.global_proxies.is_empty() {
        info!("Loaded {} global proxies", config.egress.global_proxies.len());
    }
    if !config.egress.routes.is_empty() {
        info!("Loaded {} transport rules", config.egress.routes.len());
    }
    info!("MPD mode: {:?}", config.mpd.mode);
    if config.auth.enabled() {
        info!("API password auth enabled");
    }

    // 3. Run the HTTP server until shutdown
    server::run(config).await
}
