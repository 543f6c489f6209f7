//! Peer handle, retry loop, and listening loop.
//!
//! [`Peer::connect`] runs the retry loop in the caller's task and, once a
//! candidate answers the handshake, spawns one background task that reads
//! frames. When that read fails for any reason other than a manual
//! disconnect, the same task re-enters the retry loop in quiet mode and
//! carries on with the new session.

use crate::dialer::{Dialer, TcpDialer};
use crate::error::PeerError;
use crate::name::{NameCache, NameSource};
use crate::state::{Phase, ReconnectState};
use parley_core::{
    BROADCAST, DEFAULT_MAX_PAYLOAD, Dialect, DownloadStore, Error, Frame, PortSpec, Session,
    SessionReader, sanitize_file_name,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Relay host
    pub host: String,
    /// Candidate relay ports
    pub ports: PortSpec,
    /// Passes over the candidates before giving up
    pub max_attempts: u32,
    /// Sleep between passes
    pub retry_delay: Duration,
    /// Per-candidate connect timeout, also used to wait for the name request
    pub connect_timeout: Duration,
    /// Wire generation used for outgoing text and files
    pub dialect: Dialect,
    /// Largest accepted incoming file
    pub max_payload: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            ports: PortSpec::single(5000),
            max_attempts: 5,
            retry_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(4),
            dialect: Dialect::Framed,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl PeerConfig {
    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidConfig`] for an empty candidate list, an
    /// empty host, or zero attempts.
    pub fn validate(&self) -> Result<(), PeerError> {
        if self.host.trim().is_empty() {
            return Err(PeerError::InvalidConfig("host is empty".to_string()));
        }
        if self.ports.is_empty() {
            return Err(PeerError::InvalidConfig("no candidate ports".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(PeerError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Events for the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Human-readable status line
    Status(String),
    /// Selectable targets: `Todos` first, own name excluded
    Roster(Vec<String>),
    /// Incoming text
    Message {
        /// Sender name
        from: String,
        /// Message body
        text: String,
    },
    /// Incoming file, already stored
    FileReceived {
        /// Sender name
        from: String,
        /// Where the file was written
        path: PathBuf,
    },
}

/// Roster as shown to the user: the broadcast sentinel first, then every
/// other non-empty name except `own`.
#[must_use]
pub fn visible_roster(names: &[String], own: Option<&str>) -> Vec<String> {
    std::iter::once(BROADCAST.to_string())
        .chain(
            names
                .iter()
                .filter(|name| !name.is_empty() && name.as_str() != BROADCAST)
                .filter(|name| Some(name.as_str()) != own)
                .cloned(),
        )
        .collect()
}

/// A live session plus what the handshake left over
struct Link {
    session: Arc<Session>,
    reader: SessionReader,
    /// First frame, if it was not the name request
    pending: Option<Frame>,
}

struct Inner<D> {
    config: PeerConfig,
    dialer: D,
    name: NameCache,
    downloads: DownloadStore,
    state: Mutex<ReconnectState>,
    session: Mutex<Option<Arc<Session>>>,
    target: Mutex<String>,
    roster: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    stop: watch::Sender<bool>,
}

/// Handle to a connecting peer
pub struct Peer<D = TcpDialer> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for Peer<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Peer<TcpDialer> {
    /// Peer that dials over plain TCP
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidConfig`] if the configuration is rejected.
    pub fn tcp(
        config: PeerConfig,
        names: Arc<dyn NameSource>,
        downloads: DownloadStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        Self::new(config, TcpDialer, names, downloads)
    }
}

impl<D: Dialer> Peer<D> {
    /// Create a disconnected peer and its event stream
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidConfig`] if the configuration is rejected.
    pub fn new(
        config: PeerConfig,
        dialer: D,
        names: Arc<dyn NameSource>,
        downloads: DownloadStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        config.validate()?;

        let (events, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);

        let inner = Inner {
            state: Mutex::new(ReconnectState::new(config.ports.candidates())),
            config,
            dialer,
            name: NameCache::new(names),
            downloads,
            session: Mutex::new(None),
            target: Mutex::new(BROADCAST.to_string()),
            roster: Mutex::new(vec![BROADCAST.to_string()]),
            events,
            stop,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    /// Connect, retrying up to the configured number of attempts.
    ///
    /// Returns once a session is established and its listener is running.
    /// Does nothing if a session or retry loop is already active.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Exhausted`] after the last failed attempt
    /// - [`PeerError::Cancelled`] if [`disconnect`](Self::disconnect) interrupts
    pub async fn connect(&self) -> Result<(), PeerError> {
        let Some(epoch) = self.inner.state.lock().await.begin_connect() else {
            tracing::debug!("Connect ignored: already active");
            return Ok(());
        };
        self.inner.stop.send_replace(false);

        let ports = self.inner.config.ports.to_string();
        self.inner.status(format!(
            "Connecting to {} on port(s) {}...",
            self.inner.config.host, ports
        ));

        let link = self.inner.establish(false, epoch).await?;
        tokio::spawn(run(Arc::clone(&self.inner), link, epoch));
        Ok(())
    }

    /// Manual disconnect.
    ///
    /// Stops any retry loop at its next iteration boundary, closes the
    /// session (unblocking the listener), and disables automatic reconnect
    /// until the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let previous = self.inner.state.lock().await.stop();
        self.inner.stop.send_replace(true);

        if let Some(session) = self.inner.session.lock().await.take() {
            session.close().await;
        }
        *self.inner.roster.lock().await = vec![BROADCAST.to_string()];

        if previous != Phase::Disconnected {
            self.inner.status("Disconnected".to_string());
        }
    }

    /// Send text to the current target.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NotConnected`] without a session, or the write error.
    pub async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        let target = self.target().await;
        let frame = Frame::Text {
            peer: target,
            text: text.to_string(),
        };
        self.inner.send(&frame).await
    }

    /// Send a file to the current target.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ReadFile`] if the file cannot be read,
    /// [`PeerError::NotConnected`] without a session, or the write error.
    pub async fn send_file(&self, path: &Path) -> Result<(), PeerError> {
        let data = tokio::fs::read(path).await.map_err(|source| PeerError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let name = sanitize_file_name(&path.to_string_lossy());
        let target = self.target().await;
        let size = data.len();

        let frame = Frame::File {
            peer: target.clone(),
            name: name.clone(),
            data,
        };
        self.inner.send(&frame).await?;
        self.inner
            .status(format!("Sent {name} ({size} bytes) to {target}"));
        Ok(())
    }

    /// Change the target for later sends; blank selects `Todos`
    pub async fn set_target(&self, target: &str) {
        let target = target.trim();
        *self.inner.target.lock().await = if target.is_empty() {
            BROADCAST.to_string()
        } else {
            target.to_string()
        };
    }

    /// Current send target
    pub async fn target(&self) -> String {
        self.inner.target.lock().await.clone()
    }

    /// Last roster as shown to the user
    pub async fn roster(&self) -> Vec<String> {
        self.inner.roster.lock().await.clone()
    }

    /// Current connection phase
    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase()
    }

    /// Display name, once resolved by a handshake
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.get()
    }
}

impl<D: Dialer> Inner<D> {
    fn status(&self, line: String) {
        tracing::info!("{}", line);
        let _ = self.events.send(PeerEvent::Status(line));
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, frame: &Frame) -> Result<(), PeerError> {
        let session = self
            .session
            .lock()
            .await
            .clone()
            .filter(|session| !session.is_closed());

        let Some(session) = session else {
            self.status("Not connected".to_string());
            return Err(PeerError::NotConnected);
        };

        let bytes = parley_core::encode_frame(frame, self.config.dialect)?;
        session.send_encoded(&bytes).await?;
        Ok(())
    }

    /// Sleep for `delay` unless a manual stop arrives first.
    ///
    /// Returns false if stopped.
    async fn pause(&self, delay: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = stop.wait_for(|stopped| *stopped) => false,
        }
    }

    async fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().await.is_current(epoch)
    }

    /// Retry loop: one attempt is one pass over every candidate.
    ///
    /// Ends with [`PeerError::Cancelled`] as soon as `epoch` is over.
    async fn establish(&self, quiet: bool, epoch: u64) -> Result<Link, PeerError> {
        let max = self.config.max_attempts;

        loop {
            let order = self.state.lock().await.order();

            for (index, port) in order {
                if !self.is_current(epoch).await {
                    return Err(PeerError::Cancelled);
                }

                let link = match self.try_candidate(port).await {
                    Ok(link) => link,
                    Err(e) => {
                        tracing::debug!(port, "Candidate failed: {}", e);
                        continue;
                    }
                };

                // The session is published under the state lock, so a
                // disconnect either sees it or makes the success fail.
                let accepted = {
                    let mut state = self.state.lock().await;
                    let accepted = state.record_success(index, epoch);
                    if accepted {
                        *self.session.lock().await = Some(Arc::clone(&link.session));
                    }
                    accepted
                };
                if !accepted {
                    link.session.close().await;
                    return Err(PeerError::Cancelled);
                }

                let name = link.session.name().unwrap_or_default();
                self.status(format!(
                    "Connected to {}:{} as {}",
                    self.config.host, port, name
                ));
                return Ok(link);
            }

            let attempts = {
                let mut state = self.state.lock().await;
                if !state.is_current(epoch) {
                    return Err(PeerError::Cancelled);
                }
                let attempts = state.record_failure();
                if attempts >= max {
                    state.give_up();
                }
                attempts
            };

            if attempts >= max {
                self.status(format!(
                    "Could not connect to {} after {} attempts",
                    self.config.host, attempts
                ));
                return Err(PeerError::Exhausted { attempts });
            }

            if !quiet {
                self.status(format!(
                    "Attempt {}/{} failed, retrying in {}s",
                    attempts,
                    max,
                    self.config.retry_delay.as_secs()
                ));
            }
            tracing::debug!(attempt = attempts, "Retry pass failed");

            if !self.pause(self.config.retry_delay).await {
                return Err(PeerError::Cancelled);
            }
        }
    }

    /// Dial one candidate and complete the name handshake
    async fn try_candidate(&self, port: u16) -> Result<Link, Error> {
        let conn = self
            .dialer
            .dial(&self.config.host, port, self.config.connect_timeout)
            .await?;
        let (session, mut reader) =
            Session::new(conn.reader, conn.writer, conn.remote, self.config.max_payload);

        match self.handshake(&session, &mut reader, port).await {
            Ok(pending) => Ok(Link {
                session,
                reader,
                pending,
            }),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Answer the name request, or send the name unprompted to relays that
    /// never ask. Returns the first frame if it was something else.
    ///
    /// The first read is never abandoned halfway: when the wait for a
    /// request runs out, the name goes out and the same read carries on.
    async fn handshake(
        &self,
        session: &Session,
        reader: &mut SessionReader,
        port: u16,
    ) -> Result<Option<Frame>, Error> {
        let wait = self.config.connect_timeout;
        let first = reader.read_frame();
        tokio::pin!(first);

        let mut named = false;
        let first = tokio::select! {
            result = &mut first => result,
            () = tokio::time::sleep(wait) => {
                self.send_name(session, port).await?;
                named = true;
                match tokio::time::timeout(wait, &mut first).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "relay sent nothing after the name",
                    ))),
                }
            }
        };
        let (frame, _) = first?;

        if !named {
            self.send_name(session, port).await?;
        }
        Ok(match frame {
            Frame::NameRequest => None,
            other => Some(other),
        })
    }

    async fn send_name(&self, session: &Session, port: u16) -> Result<(), Error> {
        let name = self.name.resolve(port).await;
        session.send_string(&name).await?;
        session.set_name(name);
        Ok(())
    }

    /// Read frames until the session fails; returns the cause
    async fn listen(&self, link: &mut Link) -> Error {
        if let Some(frame) = link.pending.take() {
            if let Err(e) = self.dispatch(&link.session, frame).await {
                return e;
            }
        }

        loop {
            let frame = match link.reader.read_frame().await {
                Ok((frame, _)) => frame,
                Err(e) => return e,
            };
            if let Err(e) = self.dispatch(&link.session, frame).await {
                return e;
            }
        }
    }

    async fn dispatch(&self, session: &Session, frame: Frame) -> Result<(), Error> {
        match frame {
            Frame::NameRequest => {
                let name = session.name().unwrap_or_default().to_string();
                session.send_string(&name).await?;
            }
            Frame::Roster(names) => {
                let roster = visible_roster(&names, session.name());
                *self.roster.lock().await = roster.clone();
                self.emit(PeerEvent::Roster(roster));
            }
            Frame::Text { peer, text } => {
                self.emit(PeerEvent::Message { from: peer, text });
            }
            Frame::File { peer, name, data } => match self.downloads.save(&name, &data).await {
                Ok(path) => {
                    self.status(format!("Received {} from {}", name, peer));
                    self.emit(PeerEvent::FileReceived { from: peer, path });
                }
                Err(e) => {
                    self.status(format!("Could not save {} from {}: {}", name, peer, e));
                }
            },
        }
        Ok(())
    }

    /// Forget `session` if it is still the current one
    async fn release(&self, session: &Session) {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|current| current.id() == session.id()) {
            *slot = None;
        }
    }
}

/// Listening loop with automatic reconnect, owned by connect epoch `epoch`
async fn run<D: Dialer>(inner: Arc<Inner<D>>, mut link: Link, epoch: u64) {
    loop {
        inner.state.lock().await.mark_listening(epoch);

        let cause = inner.listen(&mut link).await;
        link.session.close().await;
        inner.release(&link.session).await;

        if !cause.is_connection_error() {
            tracing::warn!("Session ended: {}", cause);
        }

        if !inner.state.lock().await.begin_reconnect(epoch) {
            tracing::debug!("Listener exiting: {}", cause);
            return;
        }

        if let Error::TruncatedTransfer { expected, received } = &cause {
            inner.status(format!(
                "Transfer interrupted after {received} of {expected} bytes"
            ));
        }
        inner.status("Connection lost, reconnecting...".to_string());

        link = match inner.establish(true, epoch).await {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!("Reconnect ended: {}", e);
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::Connection;
    use crate::name::FixedName;
    use parley_core::{FrameReader, encode_frame};
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    /// Refuses every dial and counts them
    #[derive(Default)]
    struct RefusingDialer {
        calls: AtomicU32,
        dialed: Notify,
    }

    impl Dialer for Arc<RefusingDialer> {
        async fn dial(
            &self,
            host: &str,
            port: u16,
            _timeout: Duration,
        ) -> parley_core::Result<Connection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.dialed.notify_one();
            Err(Error::ConnectFailure {
                addr: format!("{host}:{port}"),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            })
        }
    }

    /// Hands out in-memory connections and keeps the relay end for the test
    #[derive(Default)]
    struct PipeDialer {
        relay_end: std::sync::Mutex<Option<DuplexStream>>,
        dialed: Notify,
    }

    impl PipeDialer {
        fn take_relay_end(&self) -> DuplexStream {
            self.relay_end.lock().unwrap().take().unwrap()
        }
    }

    impl Dialer for Arc<PipeDialer> {
        async fn dial(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> parley_core::Result<Connection> {
            let (local, remote) = duplex(4096);
            let (reader, writer) = tokio::io::split(local);
            *self.relay_end.lock().unwrap() = Some(remote);
            self.dialed.notify_one();
            Ok(Connection {
                reader: Box::new(reader),
                writer: Box::new(writer),
                remote: "127.0.0.1:5999".parse().unwrap(),
            })
        }
    }

    fn config(max_attempts: u32, retry_delay: Duration) -> PeerConfig {
        PeerConfig {
            host: "127.0.0.1".to_string(),
            ports: PortSpec::single(5999),
            max_attempts,
            retry_delay,
            connect_timeout: Duration::from_secs(1),
            ..PeerConfig::default()
        }
    }

    fn store() -> (tempfile::TempDir, DownloadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DownloadStore::new(dir.path(), "recv_");
        (dir, store)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::Status(line) = event {
                lines.push(line);
            }
        }
        lines
    }

    #[test]
    fn test_visible_roster() {
        let names = vec![
            "ana".to_string(),
            String::new(),
            "bob".to_string(),
            "Todos".to_string(),
        ];
        assert_eq!(visible_roster(&names, Some("ana")), vec!["Todos", "bob"]);
        assert_eq!(visible_roster(&[], None), vec!["Todos"]);
    }

    #[test]
    fn test_config_validation() {
        assert!(PeerConfig::default().validate().is_ok());
        assert!(config(0, Duration::ZERO).validate().is_err());

        let empty = PeerConfig {
            ports: PortSpec::List(Vec::new()),
            ..PeerConfig::default()
        };
        assert!(matches!(empty.validate(), Err(PeerError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_max_attempts_then_terminal_status() {
        let dialer = Arc::new(RefusingDialer::default());
        let (_dir, store) = store();
        let (peer, mut rx) = Peer::new(
            config(3, Duration::from_secs(3)),
            Arc::clone(&dialer),
            Arc::new(FixedName::new("ana")),
            store,
        )
        .unwrap();

        let result = peer.connect().await;
        assert!(matches!(result, Err(PeerError::Exhausted { attempts: 3 })));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(peer.phase().await, Phase::Disconnected);

        // No further automatic attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 3);

        let lines = drain(&mut rx);
        let terminal: Vec<_> = lines
            .iter()
            .filter(|line| line.starts_with("Could not connect"))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(lines.last().map(String::as_str), Some(terminal[0].as_str()));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_retry_sleep() {
        let dialer = Arc::new(RefusingDialer::default());
        let (_dir, store) = store();
        let (peer, _rx) = Peer::new(
            config(100, Duration::from_secs(3600)),
            Arc::clone(&dialer),
            Arc::new(FixedName::new("ana")),
            store,
        )
        .unwrap();

        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };

        dialer.dialed.notified().await;
        peer.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .expect("retry loop did not observe the stop")
            .unwrap();
        assert!(matches!(result, Err(PeerError::Cancelled)));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.phase().await, Phase::Disconnected);
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let (_dir, store) = store();
        let (peer, mut rx) = Peer::new(
            config(1, Duration::ZERO),
            Arc::new(RefusingDialer::default()),
            Arc::new(FixedName::new("ana")),
            store,
        )
        .unwrap();

        assert!(matches!(
            peer.send_text("hola").await,
            Err(PeerError::NotConnected)
        ));
        assert_eq!(drain(&mut rx), vec!["Not connected"]);
    }

    #[tokio::test]
    async fn test_target_defaults_to_broadcast() {
        let (_dir, store) = store();
        let (peer, _rx) = Peer::new(
            config(1, Duration::ZERO),
            Arc::new(RefusingDialer::default()),
            Arc::new(FixedName::new("ana")),
            store,
        )
        .unwrap();

        assert_eq!(peer.target().await, "Todos");
        peer.set_target("bob").await;
        assert_eq!(peer.target().await, "bob");
        peer.set_target("  ").await;
        assert_eq!(peer.target().await, "Todos");
    }

    /// Accepts one connection and plays the relay side of a short session
    #[tokio::test]
    async fn test_handshake_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut reader = FrameReader::new(r);

            w.write_all(&encode_frame(&Frame::NameRequest, Dialect::Legacy).unwrap())
                .await
                .unwrap();
            let name = reader.read_string().await.unwrap();

            let roster = Frame::Roster(vec!["ana".to_string(), "bob".to_string()]);
            w.write_all(&encode_frame(&roster, Dialect::Legacy).unwrap())
                .await
                .unwrap();
            let text = Frame::Text {
                peer: "bob".to_string(),
                text: "hi: there".to_string(),
            };
            w.write_all(&encode_frame(&text, Dialect::Legacy).unwrap())
                .await
                .unwrap();
            let file = Frame::File {
                peer: "bob".to_string(),
                name: "report.txt".to_string(),
                data: b"quarterly".to_vec(),
            };
            w.write_all(&encode_frame(&file, Dialect::Framed).unwrap())
                .await
                .unwrap();

            let (outgoing, dialect) = reader.read_frame().await.unwrap();
            (name, outgoing, dialect)
        });

        let (dir, store) = store();
        let cfg = PeerConfig {
            ports: PortSpec::single(port),
            ..config(1, Duration::ZERO)
        };
        let (peer, mut rx) = Peer::tcp(cfg, Arc::new(FixedName::new("ana")), store).unwrap();

        peer.connect().await.unwrap();
        assert_eq!(peer.name(), Some("ana"));

        let mut roster = None;
        let mut message = None;
        let mut received = None;
        while received.is_none() {
            match rx.recv().await.unwrap() {
                PeerEvent::Roster(names) => roster = Some(names),
                PeerEvent::Message { from, text } => message = Some((from, text)),
                PeerEvent::FileReceived { from, path } => received = Some((from, path)),
                PeerEvent::Status(_) => {}
            }
        }

        assert_eq!(roster.unwrap(), vec!["Todos", "bob"]);
        assert_eq!(
            message.unwrap(),
            ("bob".to_string(), "hi: there".to_string())
        );
        let (from, path) = received.unwrap();
        assert_eq!(from, "bob");
        assert_eq!(path, dir.path().join("recv_report.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"quarterly");

        peer.set_target("bob").await;
        peer.send_text("back at you").await.unwrap();

        let (name, outgoing, dialect) = relay.await.unwrap();
        assert_eq!(name, "ana");
        assert_eq!(
            outgoing,
            Frame::Text {
                peer: "bob".to_string(),
                text: "back at you".to_string(),
            }
        );
        assert_eq!(dialect, Dialect::Framed);

        peer.disconnect().await;
    }

    #[tokio::test]
    async fn test_name_sent_without_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A relay that never asks but immediately pushes a roster.
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let roster = Frame::Roster(vec!["zoe".to_string()]);
            w.write_all(&encode_frame(&roster, Dialect::Legacy).unwrap())
                .await
                .unwrap();
            let mut reader = FrameReader::new(r);
            let name = reader.read_string().await.unwrap();
            (name, w)
        });

        let (_dir, store) = store();
        let cfg = PeerConfig {
            ports: PortSpec::single(port),
            ..config(1, Duration::ZERO)
        };
        let (peer, mut rx) = Peer::tcp(cfg, Arc::new(FixedName::fallback()), store).unwrap();
        peer.connect().await.unwrap();

        let (name, _writer) = relay.await.unwrap();
        assert_eq!(name, format!("Cliente{port}"));

        // The roster that arrived first is still delivered.
        loop {
            if let PeerEvent::Roster(names) = rx.recv().await.unwrap() {
                assert_eq!(names, vec!["Todos", "zoe"]);
                break;
            }
        }
        peer.disconnect().await;
    }

    #[tokio::test]
    async fn test_late_name_request_answered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut reader = FrameReader::new(r);
            let request = encode_frame(&Frame::NameRequest, Dialect::Legacy).unwrap();

            w.write_all(&request).await.unwrap();
            let first = reader.read_string().await.unwrap();
            w.write_all(&request).await.unwrap();
            let second = reader.read_string().await.unwrap();
            (first, second, w)
        });

        let (_dir, store) = store();
        let cfg = PeerConfig {
            ports: PortSpec::single(port),
            ..config(1, Duration::ZERO)
        };
        let (peer, _rx) = Peer::tcp(cfg, Arc::new(FixedName::new("eva")), store).unwrap();
        peer.connect().await.unwrap();

        let (first, second, _writer) = relay.await.unwrap();
        assert_eq!(first, "eva");
        assert_eq!(second, "eva");
        peer.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_leaves_peer_disconnected() {
        let dialer = Arc::new(PipeDialer::default());
        let (_dir, store) = store();
        let (peer, _rx) = Peer::new(
            config(3, Duration::from_millis(10)),
            Arc::clone(&dialer),
            Arc::new(FixedName::new("ana")),
            store,
        )
        .unwrap();

        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };

        // The relay holds back its name request until the peer has been
        // told to disconnect.
        dialer.dialed.notified().await;
        let relay_end = dialer.take_relay_end();
        peer.disconnect().await;

        let (r, mut w) = tokio::io::split(relay_end);
        w.write_all(&encode_frame(&Frame::NameRequest, Dialect::Legacy).unwrap())
            .await
            .unwrap();
        let mut reader = FrameReader::new(r);
        assert_eq!(reader.read_string().await.unwrap(), "ana");

        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .expect("handshake did not finish")
            .unwrap();
        assert!(matches!(result, Err(PeerError::Cancelled)));
        assert_eq!(peer.phase().await, Phase::Disconnected);
        assert!(matches!(
            peer.send_text("hola").await,
            Err(PeerError::NotConnected)
        ));

        // The abandoned session is closed, not left listening.
        let end = tokio::time::timeout(Duration::from_secs(5), reader.read_frame())
            .await
            .expect("session was left open");
        assert!(end.is_err());
    }

    #[tokio::test]
    async fn test_first_frame_split_across_name_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A slow relay: half a roster, a pause longer than the connect
        // timeout, then the other half.
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let roster = encode_frame(&Frame::Roster(vec!["zoe".to_string()]), Dialect::Legacy)
                .unwrap();
            let (head, tail) = roster.split_at(roster.len() / 2);

            w.write_all(head).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1500)).await;
            w.write_all(tail).await.unwrap();

            let mut reader = FrameReader::new(r);
            let name = reader.read_string().await.unwrap();
            (name, w)
        });

        let (_dir, store) = store();
        let cfg = PeerConfig {
            ports: PortSpec::single(port),
            ..config(1, Duration::ZERO)
        };
        let (peer, mut rx) = Peer::tcp(cfg, Arc::new(FixedName::new("ana")), store).unwrap();
        peer.connect().await.unwrap();

        let (name, _writer) = relay.await.unwrap();
        assert_eq!(name, "ana");
        loop {
            if let PeerEvent::Roster(names) = rx.recv().await.unwrap() {
                assert_eq!(names, vec!["Todos", "zoe"]);
                break;
            }
        }
        assert_eq!(peer.phase().await, Phase::Listening);
        peer.disconnect().await;
    }
}
