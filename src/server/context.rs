// src/server/context.rs

use crate::core::client::Client;
use crate::core::events::EventReceiver;
use crate::core::registry::Registry;
use crate::core::sequencer::Sequencer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the server's main loop.
/// The channel receivers are taken by the spawner when the background tasks
/// start.
pub struct ServerContext {
    pub sequencer: Arc<Sequencer>,
    pub kill_rx: Option<mpsc::UnboundedReceiver<Client>>,
    pub event_rx: Option<EventReceiver>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<()>,
    pub registry: Option<Arc<dyn Registry>>,
}
