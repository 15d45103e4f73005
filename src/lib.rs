pub mod config;
pub mod relay;
pub mod server;
pub mod tls;

use std::sync::Arc;

use service::topology::Topology;

use self::{config::Config, relay::Relay};

/// Start the relay and park until interrupted.
///
/// Kept separate from `main` so integration setups can launch a relay in
/// process with a hand-built configuration.
pub async fn relay_main(config: Arc<Config>) -> anyhow::Result<()> {
    anyhow::ensure!(config.nodes >= 2, "an overlay needs at least two relays");
    anyhow::ensure!(
        (config.id as usize) < config.nodes,
        "relay id {} is outside an overlay of {} nodes",
        config.id,
        config.nodes
    );

    let topology = Topology::new(config.nodes);
    log::info!(
        "overlay position: id={}, nodes={}, neighbors={:?}",
        config.id,
        config.nodes,
        topology.neighbors(config.id)
    );

    let relay = Arc::new(Relay::new(config.id, config.nodes));
    server::run(config, relay).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("relay shutting down");
    Ok(())
}
