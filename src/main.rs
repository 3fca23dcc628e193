use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::{error, info};

use streamrelay::{AppConfig, Logger, RelayApplicationServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards are kept alive to flush logs and keep sentry connected
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger and env prepped, binding relay...");

    let server = match RelayApplicationServer::bind(config.clone()).await {
        Ok(server) => server,
        Err(e) => {
            // nothing to relay through, report it and get out without a panic
            error!("relay unavailable: {}", e);
            return Err(anyhow::anyhow!(e)).context("relay failed to start");
        }
    };

    info!(
        "relay bound on {}, playlist links go out as {}/playlist",
        server.local_addr(),
        server.public_base()
    );

    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server failed")?;

    Ok(())
}
