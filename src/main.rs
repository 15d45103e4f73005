#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;
use trellis_relay::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load());
    simple_logger::init_with_level(config.log_level.as_level())?;
    trellis_relay::relay_main(config).await
}
