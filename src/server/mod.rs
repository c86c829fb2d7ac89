// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod context;
mod initialization;
mod listener;
mod spawner;

pub use context::ServerContext;
pub use initialization::setup;
pub use listener::handshake;
pub use spawner::spawn_all;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Load collaborators, build the sequencer, bind the listener.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn the killer, event loop, notifier and timer tasks.
    spawner::spawn_all(&mut server_context)?;

    // 3. Accept connections until shutdown.
    listener::run(server_context).await;

    Ok(())
}
