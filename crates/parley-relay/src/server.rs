//! Relay server: accept loop and per-session handlers.

use crate::error::RelayError;
use crate::registry::Registry;
use crate::router::{Delivery, Router};
use parley_core::{
    BROADCAST, DEFAULT_MAX_PAYLOAD, Error, Frame, RELAY_SENDER, Session, SessionReader,
    fallback_name, sanitize_file_name,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Pause after a failed `accept` so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Session id used for frames announced by the relay operator; no session has it.
const OPERATOR_ID: u64 = 0;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Largest accepted stream frame payload in bytes
    pub max_payload: u64,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// State shared by the accept loop, handlers, and handles
struct Shared {
    registry: Arc<Registry>,
    router: Router,
    config: RelayServerConfig,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

/// Bound relay endpoint, consumed by [`run`](RelayServer::run)
pub struct RelayServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

/// Cloneable control handle for a running relay
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Bind a relay server with default configuration
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] if the port cannot be bound. This is not
    /// retried.
    pub async fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        Self::bind_with_config(addr, RelayServerConfig::default()).await
    }

    /// Bind a relay server with custom configuration
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] if the port cannot be bound.
    pub async fn bind_with_config(
        addr: SocketAddr,
        config: RelayServerConfig,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;

        let registry = Arc::new(Registry::new());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                router: Router::new(Arc::clone(&registry)),
                registry,
                config,
                local_addr,
                shutdown,
            }),
        })
    }

    /// Address the relay is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Control handle usable from other tasks
    #[must_use]
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the accept loop until [`RelayHandle::stop`] is called.
    ///
    /// Each connection gets its own handler task; the loop never waits on a
    /// handler. The listening socket is closed when this returns.
    ///
    /// # Errors
    ///
    /// Currently never fails once bound; accept errors are logged.
    pub async fn run(self) -> Result<(), RelayError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        tracing::info!("Relay listening on {}", self.shared.local_addr);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!("Accepted connection from {}", remote);
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            handle_connection(shared, stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Error accepting client: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Relay on {} stopped", self.shared.local_addr);
        Ok(())
    }
}

impl RelayHandle {
    /// Address the relay is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Returns true until [`stop`](Self::stop) is called
    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.shared.shutdown.borrow()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Sorted names of registered sessions
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.shared.registry.names()
    }

    /// Send text from the relay operator to every registered session.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be encoded.
    pub async fn announce_text(&self, text: &str) -> Result<usize, RelayError> {
        let frame = Frame::Text {
            peer: RELAY_SENDER.to_string(),
            text: text.to_string(),
        };
        let recipients = self.broadcast(&frame).await?;
        tracing::info!("{} -> {}: {}", RELAY_SENDER, BROADCAST, text);
        Ok(recipients)
    }

    /// Send a file from the relay operator to every registered session.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or encoded.
    pub async fn announce_file(&self, path: &Path) -> Result<usize, RelayError> {
        let data = tokio::fs::read(path).await.map_err(|source| RelayError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let name = sanitize_file_name(&path.to_string_lossy());
        let frame = Frame::File {
            peer: RELAY_SENDER.to_string(),
            name: name.clone(),
            data,
        };
        let recipients = self.broadcast(&frame).await?;
        tracing::info!("File sent to {}: {}", BROADCAST, name);
        Ok(recipients)
    }

    async fn broadcast(&self, frame: &Frame) -> Result<usize, RelayError> {
        match self.shared.router.route(OPERATOR_ID, BROADCAST, frame).await? {
            Delivery::Broadcast { recipients } => Ok(recipients),
            Delivery::Unicast | Delivery::Dropped => Ok(0),
        }
    }

    /// Stop accepting, close every session, and clear the registry.
    pub async fn stop(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        for session in self.shared.registry.drain() {
            session.close().await;
        }
        tracing::info!("Relay stopped");
    }
}

/// Handshake, register, and serve one connection until it ends.
async fn handle_connection(shared: Arc<Shared>, stream: TcpStream) {
    let (session, mut reader) = match Session::from_tcp(stream, shared.config.max_payload) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::debug!("Dropping connection before handshake: {}", e);
            return;
        }
    };

    let Some(requested) = handshake(&session, &mut reader).await else {
        // Probes and early closes are never registered or reported.
        session.close().await;
        return;
    };

    if !is_running(&shared) {
        session.close().await;
        return;
    }

    let name = shared.registry.register(&requested, &session).await;
    tracing::info!("{} connected from {}", name, session.remote());

    let reason = serve(&shared, &session, &name, &mut reader).await;

    if shared.registry.unregister(&session).await {
        tracing::info!("{} disconnected", name);
    }
    if reason.is_connection_error() {
        tracing::debug!("Session {} closed: {}", name, reason);
    } else {
        tracing::warn!("Session {} ended: {}", name, reason);
    }
    session.close().await;
}

fn is_running(shared: &Shared) -> bool {
    !*shared.shutdown.borrow()
}

/// Ask for the display name. Returns `None` if the connection ends first.
async fn handshake(session: &Session, reader: &mut SessionReader) -> Option<String> {
    if let Err(e) = session.send(&Frame::NameRequest).await {
        tracing::debug!("Name request to {} failed: {}", session.remote(), e);
        return None;
    }

    match reader.read_string().await {
        Ok(reply) => {
            let name = reply.trim();
            if name.is_empty() {
                Some(fallback_name(session.remote().port()))
            } else {
                Some(name.to_string())
            }
        }
        Err(e) => {
            tracing::debug!("No name from {}: {}", session.remote(), e);
            None
        }
    }
}

/// Read and route frames until the session fails; returns the cause.
async fn serve(shared: &Shared, session: &Session, name: &str, reader: &mut SessionReader) -> Error {
    loop {
        let (frame, dialect) = match reader.read_frame().await {
            Ok(read) => read,
            Err(e) => {
                if let Error::TruncatedTransfer { expected, received } = &e {
                    tracing::warn!(
                        "Transfer from {} aborted after {} of {} bytes",
                        name,
                        received,
                        expected
                    );
                }
                return e;
            }
        };

        let (target, outbound) = match frame {
            Frame::Text { peer: target, text } => {
                tracing::info!("{} -> {}: {}", name, target, text);
                let outbound = Frame::Text {
                    peer: name.to_string(),
                    text,
                };
                (target, outbound)
            }
            Frame::File {
                peer: target,
                name: file_name,
                data,
            } => {
                tracing::info!(
                    "{} sent file to {}: {} ({} bytes)",
                    name,
                    target,
                    file_name,
                    data.len()
                );
                let outbound = Frame::File {
                    peer: name.to_string(),
                    name: file_name,
                    data,
                };
                (target, outbound)
            }
            other => {
                return Error::violation(format!(
                    "{} frame is not accepted from peers",
                    other.frame_type()
                ));
            }
        };

        session.set_dialect(dialect);

        match shared.router.route(session.id(), &target, &outbound).await {
            Ok(Delivery::Dropped) => {
                tracing::debug!("{} addressed unknown peer {}", name, target);
            }
            Ok(_) => {}
            Err(e) => return e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{Dialect, FrameReader, encode_frame, write_utf};
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct RawPeer {
        reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl RawPeer {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (r, w) = stream.into_split();
            Self {
                reader: FrameReader::new(r),
                writer: w,
            }
        }

        async fn join(addr: SocketAddr, name: &str) -> Self {
            let mut peer = Self::connect(addr).await;
            let (first, _) = peer.reader.read_frame().await.unwrap();
            assert_eq!(first, Frame::NameRequest);
            let mut buf = Vec::new();
            write_utf(&mut buf, name).unwrap();
            peer.writer.write_all(&buf).await.unwrap();
            peer
        }

        async fn send(&mut self, frame: &Frame, dialect: Dialect) {
            let bytes = encode_frame(frame, dialect).unwrap();
            self.writer.write_all(&bytes).await.unwrap();
        }

        /// Next non-roster frame
        async fn next_message(&mut self) -> Frame {
            loop {
                let (frame, _) = self.reader.read_frame().await.unwrap();
                if !matches!(frame, Frame::Roster(_)) {
                    return frame;
                }
            }
        }

        /// Read rosters until one matches `expected`
        async fn await_roster(&mut self, expected: &[&str]) {
            loop {
                let (frame, _) = self.reader.read_frame().await.unwrap();
                if let Frame::Roster(names) = frame {
                    if names == expected {
                        return;
                    }
                }
            }
        }
    }

    async fn start() -> (RelayHandle, tokio::task::JoinHandle<()>) {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        (handle, task)
    }

    #[tokio::test]
    async fn test_relay_server_creation() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await;
        assert!(server.is_ok());
        assert_eq!(server.unwrap().handle().client_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = RelayServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let second = RelayServer::bind(first.local_addr()).await;
        assert!(matches!(second, Err(RelayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_join_broadcasts_roster() {
        let (handle, _task) = start().await;
        let addr = handle.local_addr();

        let mut ana = RawPeer::join(addr, "ana").await;
        ana.await_roster(&["ana"]).await;

        let mut bob = RawPeer::join(addr, "bob").await;
        bob.await_roster(&["ana", "bob"]).await;
        ana.await_roster(&["ana", "bob"]).await;

        drop(bob);
        ana.await_roster(&["ana"]).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_empty_name_gets_fallback() {
        let (handle, _task) = start().await;
        let mut anon = RawPeer::join(handle.local_addr(), "   ").await;
        let port = anon.writer.local_addr().unwrap().port();
        let expected = fallback_name(port);
        anon.await_roster(&[expected.as_str()]).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_probe_not_registered() {
        let (handle, _task) = start().await;
        let addr = handle.local_addr();

        // Connect and hang up without answering, like a liveness probe.
        drop(TcpStream::connect(addr).await.unwrap());

        let mut ana = RawPeer::join(addr, "ana").await;
        ana.await_roster(&["ana"]).await;
        assert_eq!(handle.names(), vec!["ana"]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_legacy_unicast_and_broadcast() {
        let (handle, _task) = start().await;
        let addr = handle.local_addr();

        let mut ana = RawPeer::join(addr, "ana").await;
        ana.await_roster(&["ana"]).await;
        let mut bob = RawPeer::join(addr, "bob").await;
        bob.await_roster(&["ana", "bob"]).await;
        ana.await_roster(&["ana", "bob"]).await;

        let direct = Frame::Text {
            peer: "bob".to_string(),
            text: "psst: hi".to_string(),
        };
        ana.send(&direct, Dialect::Legacy).await;
        assert_eq!(
            bob.next_message().await,
            Frame::Text {
                peer: "ana".to_string(),
                text: "psst: hi".to_string(),
            }
        );

        let file = Frame::File {
            peer: "Todos".to_string(),
            name: "r.bin".to_string(),
            data: vec![9u8; 3000],
        };
        bob.send(&file, Dialect::Framed).await;
        assert_eq!(
            ana.next_message().await,
            Frame::File {
                peer: "bob".to_string(),
                name: "r.bin".to_string(),
                data: vec![9u8; 3000],
            }
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_operator_announce() {
        let (handle, _task) = start().await;
        let mut ana = RawPeer::join(handle.local_addr(), "ana").await;
        ana.await_roster(&["ana"]).await;

        assert_eq!(handle.announce_text("maintenance").await.unwrap(), 1);
        assert_eq!(
            ana.next_message().await,
            Frame::Text {
                peer: RELAY_SENDER.to_string(),
                text: "maintenance".to_string(),
            }
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd.txt");
        std::fs::write(&path, b"welcome").unwrap();
        assert_eq!(handle.announce_file(&path).await.unwrap(), 1);
        assert_eq!(
            ana.next_message().await,
            Frame::File {
                peer: RELAY_SENDER.to_string(),
                name: "motd.txt".to_string(),
                data: b"welcome".to_vec(),
            }
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_sessions_and_port() {
        let (handle, task) = start().await;
        let addr = handle.local_addr();
        let mut ana = RawPeer::join(addr, "ana").await;
        ana.await_roster(&["ana"]).await;

        handle.stop().await;
        assert!(!handle.is_running());
        task.await.unwrap();

        // Session sees end-of-stream and the port no longer accepts.
        assert!(ana.reader.read_frame().await.is_err());
        assert!(TcpStream::connect(addr).await.is_err());
        assert_eq!(handle.client_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_token_drops_connection() {
        let (handle, _task) = start().await;
        let addr = handle.local_addr();
        let mut rogue = RawPeer::join(addr, "rogue").await;
        rogue.await_roster(&["rogue"]).await;

        let mut buf = Vec::new();
        write_utf(&mut buf, "PING").unwrap();
        rogue.writer.write_all(&buf).await.unwrap();

        let mut ana = RawPeer::join(addr, "ana").await;
        ana.await_roster(&["ana"]).await;
        handle.stop().await;
    }
}
