//! CodeRoom sync server — relays edits between members of a room.
//!
//! Configured through the environment (`CODEROOM_BIND_ADDR`, `PORT`,
//! `CODEROOM_BROADCAST_CAPACITY`, `CODEROOM_HEARTBEAT_SECS`,
//! `CODEROOM_AUTHORITATIVE_BUFFER`); log verbosity through `RUST_LOG`.

use coderoom_collab::server::{ServerConfig, SyncServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting CodeRoom server on {} (queue capacity {}, heartbeat {}s, authoritative buffer {})",
        config.bind_addr,
        config.broadcast_capacity,
        config.heartbeat_interval_secs,
        if config.authoritative_buffer { "on" } else { "off" },
    );

    SyncServer::new(config).run().await?;
    Ok(())
}
