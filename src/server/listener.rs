// src/server/listener.rs

//! The accept loop and the per-connection handshake, plus graceful
//! shutdown of the whole server.

use super::context::ServerContext;
use crate::core::RelayError;
use crate::core::protocol::{
    self, Credentials, Frame, MessageType, PROTOCOL_VERSION, SERVER_UID,
};
use crate::core::sequencer::Sequencer;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Budget for the whole pre-admission handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits for a shutdown signal based on the operating system.
/// On Unix it listens for SIGINT and SIGTERM, on Windows for Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// The main accept loop. Runs until a shutdown signal arrives or a critical
/// background task dies; anything that goes wrong on a single connection is
/// contained to that connection.
pub async fn run(mut ctx: ServerContext) {
    let mut handshake_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased; // Prioritize shutdown over new connections.

            _ = await_shutdown_signal() => {
                break;
            }

            // A background task exiting early means sessions would leak;
            // treat it as fatal.
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(()) => error!("CRITICAL: a background task exited unexpectedly, shutting down"),
                    Err(e) => error!("CRITICAL: a background task panicked: {e:?}, shutting down"),
                }
                break;
            }

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        info!("accepted new connection from {addr}");
                        let sequencer = ctx.sequencer.clone();
                        handshake_tasks.spawn(async move {
                            match handshake(sequencer, socket, addr).await {
                                Ok(uid) => debug!(uid, "handshake complete for {addr}"),
                                Err(e) => info!("handshake with {addr} failed: {e}"),
                            }
                        });
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                }
            }

            // Reap completed handshake tasks.
            Some(res) = handshake_tasks.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("a handshake task panicked: {e:?}");
                    }
                }
            }
        }
    }

    // --- Graceful Shutdown Sequence ---
    info!("closing. disconnecting clients ...");
    ctx.sequencer
        .broadcast_shutdown("server shutting down (try to reconnect later!)");
    if let Some(registry) = &ctx.registry {
        if let Err(e) = registry.unregister().await {
            warn!("could not unregister from registry: {e}");
        }
    }
    // Give the broadcasters a moment to flush the shutdown notice.
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("all clients notified. exiting.");

    if ctx.shutdown_tx.send(()).is_err() {
        error!("failed to send shutdown signal; some tasks may not terminate gracefully");
    }
    handshake_tasks.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly");
    }
    info!("server shutdown complete");
}

/// Performs the version and credential exchange, then hands the socket to
/// the sequencer for admission.
///
/// Handshake: client `Hello` (version), client `UserCredentials`
/// (username, unique id, password digest), then admission replies
/// `Welcome` with the colour. Mismatches get a dedicated control frame
/// before the socket closes.
pub async fn handshake(
    sequencer: Arc<Sequencer>,
    mut socket: TcpStream,
    addr: SocketAddr,
) -> Result<u32, RelayError> {
    let credentials = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        read_credentials(&sequencer, &mut socket),
    )
    .await
    {
        Ok(Ok(credentials)) => credentials,
        Ok(Err(e)) => {
            reject(&mut socket, &e).await;
            return Err(e);
        }
        Err(_) => {
            debug!("handshake with {addr} timed out");
            return Err(RelayError::BadHandshake("handshake timed out".into()));
        }
    };
    sequencer.admit(socket, credentials).await
}

/// Reads and validates the two client handshake frames.
async fn read_credentials(
    sequencer: &Sequencer,
    socket: &mut TcpStream,
) -> Result<Credentials, RelayError> {
    let hello = protocol::read_frame(socket).await?;
    if hello.message_type() != Some(MessageType::Hello) {
        return Err(RelayError::BadHandshake(format!(
            "expected version handshake, got message type {}",
            hello.ty
        )));
    }
    let version = String::from_utf8_lossy(&hello.payload);
    let version = version.trim_end_matches('\0');
    if version != PROTOCOL_VERSION {
        return Err(RelayError::BadHandshake(format!(
            "wrong protocol version '{version}'"
        )));
    }

    let creds_frame = protocol::read_frame(socket).await?;
    if creds_frame.message_type() != Some(MessageType::UserCredentials) {
        return Err(RelayError::BadHandshake(format!(
            "expected credentials, got message type {}",
            creds_frame.ty
        )));
    }
    let credentials = Credentials::decode(creds_frame.payload)?;

    if let Some(password) = &sequencer.server_password() {
        let expected = hex::encode(Sha1::digest(password.as_bytes()));
        if !credentials.password.eq_ignore_ascii_case(&expected) {
            return Err(RelayError::WrongPassword);
        }
    }
    Ok(credentials)
}

/// Sends the control frame matching a handshake failure, best effort.
async fn reject(socket: &mut TcpStream, error: &RelayError) {
    let ty = match error {
        RelayError::WrongPassword => MessageType::WrongPassword,
        RelayError::BadHandshake(_) => MessageType::WrongVersion,
        _ => return,
    };
    let frame = Frame::new(ty, SERVER_UID, 0, Bytes::new());
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        protocol::write_frame(socket, &frame),
    )
    .await;
}
