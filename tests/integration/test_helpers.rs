// tests/integration/test_helpers.rs

//! Test helpers: an in-process server instance and a raw protocol client.

use bytes::Bytes;
use convoyd::config::Config;
use convoyd::core::auth::{AuthResolver, FileAuthResolver};
use convoyd::core::protocol::{
    Credentials, Frame, MessageType, PROTOCOL_VERSION, read_frame, write_frame,
};
use convoyd::core::sequencer::{Killer, Sequencer, run_event_loop};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A complete in-process server: sequencer, killer, event loop and accept
/// loop on an ephemeral port.
pub struct TestServer {
    pub sequencer: Arc<Sequencer>,
    pub addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(mut config: Config) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();

        // Tests never want to pick up files from the working directory.
        if config.server.motd_file.as_deref() == Some("motd.txt") {
            config.server.motd_file = None;
        }
        let motd = match &config.server.motd_file {
            Some(path) => convoyd::core::motd::load(Path::new(path)).unwrap(),
            None => Vec::new(),
        };

        let auth: Option<Arc<dyn AuthResolver>> = config.server.auth_file.as_ref().map(|path| {
            Arc::new(FileAuthResolver::open(Some(Path::new(path)))) as Arc<dyn AuthResolver>
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let init = Sequencer::new(config, motd, auth, None);
        let sequencer = init.sequencer;
        let (shutdown_tx, _) = broadcast::channel(1);

        let killer = Killer::new(sequencer.clone(), init.kill_rx);
        tokio::spawn(killer.run(shutdown_tx.subscribe()));
        tokio::spawn(run_event_loop(
            sequencer.clone(),
            init.event_rx,
            shutdown_tx.subscribe(),
        ));

        let accept_sequencer = sequencer.clone();
        let mut accept_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.recv() => break,
                    res = listener.accept() => {
                        let Ok((socket, peer)) = res else { break };
                        let sequencer = accept_sequencer.clone();
                        tokio::spawn(async move {
                            let _ = convoyd::server::handshake(sequencer, socket, peer).await;
                        });
                    }
                }
            }
        });

        Self {
            sequencer,
            addr,
            shutdown_tx,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A raw protocol client speaking frames over a plain socket.
pub struct TestClient {
    stream: TcpStream,
    pub uid: u32,
    pub colour: u32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            uid: 0,
            colour: 0,
        }
    }

    /// Joins the server and returns once admitted: sends the version and
    /// credential frames and waits for `Welcome`.
    pub async fn join(addr: SocketAddr, username: &str, unique_id: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send_hello().await;
        client.send_credentials(username, unique_id, "").await;
        let welcome = client.recv_type(MessageType::Welcome).await;
        assert_eq!(welcome.payload.len(), 4);
        client.colour = u32::from_le_bytes(welcome.payload[..4].try_into().unwrap());
        // Our own join broadcast carries the assigned uid.
        let join = client.recv_type(MessageType::UserJoin).await;
        client.uid = join.source_uid;
        client
    }

    /// Joins and immediately completes the flow handshake.
    pub async fn join_flowing(addr: SocketAddr, username: &str, unique_id: &str) -> Self {
        let mut client = Self::join(addr, username, unique_id).await;
        client.enable_flow().await;
        client
    }

    pub async fn send_hello(&mut self) {
        self.send_raw(
            MessageType::Hello,
            0,
            Bytes::copy_from_slice(PROTOCOL_VERSION.as_bytes()),
        )
        .await;
    }

    pub async fn send_credentials(&mut self, username: &str, unique_id: &str, password: &str) {
        let payload = Credentials {
            username: username.to_string(),
            unique_id: unique_id.to_string(),
            password: password.to_string(),
        }
        .encode();
        self.send_raw(MessageType::UserCredentials, 0, payload).await;
    }

    pub async fn enable_flow(&mut self) {
        self.send_raw(MessageType::EnableFlow, 0, Bytes::new()).await;
    }

    pub async fn send_raw(&mut self, ty: MessageType, stream_id: u32, payload: Bytes) {
        let frame = Frame::new(ty, self.uid, stream_id, payload);
        write_frame(&mut self.stream, &frame).await.unwrap();
    }

    pub async fn chat(&mut self, msg: &str) {
        self.send_raw(MessageType::Chat, 0, Bytes::copy_from_slice(msg.as_bytes()))
            .await;
    }

    /// Receives the next frame, failing the test after a timeout.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(RECV_TIMEOUT, read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a frame")
            .expect("connection failed while waiting for a frame")
    }

    /// Skips frames until one of the wanted type arrives.
    pub async fn recv_type(&mut self, ty: MessageType) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.message_type() == Some(ty) {
                return frame;
            }
        }
    }

    /// Waits for a chat line and returns its text.
    pub async fn recv_chat(&mut self) -> String {
        let frame = self.recv_type(MessageType::Chat).await;
        String::from_utf8_lossy(&frame.payload).into_owned()
    }

    /// Asserts that no frame of the given type arrives within `window`.
    pub async fn assert_silent(&mut self, ty: MessageType, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, read_frame(&mut self.stream)).await {
                Err(_) => return,
                Ok(Ok(frame)) => {
                    assert_ne!(
                        frame.message_type(),
                        Some(ty),
                        "expected silence but received {frame:?}"
                    );
                }
                Ok(Err(_)) => return,
            }
        }
    }

    /// Waits until the server closes this connection.
    pub async fn expect_close(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            assert!(!remaining.is_zero(), "server did not close the connection");
            match tokio::time::timeout(remaining, read_frame(&mut self.stream)).await {
                Ok(Err(_)) => return,
                Ok(Ok(_)) => continue,
                Err(_) => panic!("server did not close the connection"),
            }
        }
    }
}
