use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use hush_relay::{security::check_public_bind_allowed, spawn_hub, AppState, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = RelayConfig::parse();
    hush_common::init_tracing_with_default(&config.log_level);

    check_public_bind_allowed(config.listen, config.allow_public_bind)?;

    let (hub, hub_task) = spawn_hub(config.hub_queue_capacity);
    let state = AppState {
        hub,
        limits: config.limits(),
    };

    let listener = TcpListener::bind(config.listen).await?;
    info!("relay listening on ws://{}/ws", listener.local_addr()?);

    hush_relay::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;

    hub_task.abort();
    Ok(())
}
