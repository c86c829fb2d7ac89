// src/server/initialization.rs

//! Handles the complete server initialization process: loading the
//! collaborators, building the sequencer and binding the listener socket.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::auth::{AuthResolver, FileAuthResolver};
use crate::core::motd;
use crate::core::registry::{HttpRegistry, Registry};
use crate::core::scripting::{LuaScriptHost, ScriptHost};
use crate::core::sequencer::Sequencer;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all server components before starting the accept loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    let motd = match &config.server.motd_file {
        Some(path) => {
            let lines = motd::load(Path::new(path))
                .with_context(|| format!("failed to read motd file '{path}'"))?;
            info!("loaded {} motd line(s) from {path}", lines.len());
            lines
        }
        None => Vec::new(),
    };

    let auth: Option<Arc<dyn AuthResolver>> = config.server.auth_file.as_ref().map(|path| {
        Arc::new(FileAuthResolver::open(Some(Path::new(path)))) as Arc<dyn AuthResolver>
    });

    let script: Option<Arc<dyn ScriptHost>> = match &config.game.script_file {
        Some(path) => {
            let host = LuaScriptHost::load(Path::new(path))
                .with_context(|| format!("failed to load script '{path}'"))?;
            Some(Arc::new(host) as Arc<dyn ScriptHost>)
        }
        None => None,
    };

    let registry: Option<Arc<dyn Registry>> = match (&config.api.endpoint, &config.api.key) {
        (Some(endpoint), Some(key)) => {
            info!("advertising to registry at {endpoint}");
            Some(Arc::new(HttpRegistry::new(endpoint.clone(), key.clone())) as Arc<dyn Registry>)
        }
        _ => {
            info!("no registry configured, running unadvertised");
            None
        }
    };

    let bind_addr = (config.server.ip.as_str(), config.server.port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}:{}", config.server.ip, config.server.port))?;
    info!(
        "server '{}' listening on {}",
        config.server.name,
        listener.local_addr()?
    );

    let init = Sequencer::new(config, motd, auth, script);
    let (shutdown_tx, _) = broadcast::channel(1);

    Ok(ServerContext {
        sequencer: init.sequencer,
        kill_rx: Some(init.kill_rx),
        event_rx: Some(init.event_rx),
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        registry,
    })
}
