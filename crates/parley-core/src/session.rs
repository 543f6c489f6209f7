//! Sessions: one live connection with serialized writes.
//!
//! A [`Session`] is split in two halves. The write half is shared (behind an
//! `Arc`) by every task that may send to the connection. Frames go through a
//! bounded per-session queue drained by one writer task, so concurrent
//! broadcasts and forwards never interleave bytes and keep their order.
//!
//! [`Session::send`] and [`Session::send_encoded`] wait until the frame is
//! written. [`Session::post`] only queues it: a fan-out never waits on a slow
//! receiver, and a receiver whose queue fills up is closed instead.
//!
//! The read half, [`SessionReader`], is owned by exactly one task. Calling
//! [`Session::close`] wakes that task even while it is blocked waiting for
//! data.

use crate::error::{Error, Result};
use crate::frame::{Dialect, Frame, FrameReader, encode_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Boxed read half of a connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long `close` lets the writer flush queued frames before dropping the
/// write half.
const CLOSE_WRITE_GRACE: Duration = Duration::from_millis(500);

/// Frames that may wait for the writer task before `post` gives up on the
/// receiver.
pub const OUTBOX_FRAMES: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One queued frame, with an optional write acknowledgement
struct Outgoing {
    bytes: Arc<[u8]>,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// Write half and identity of a connection
pub struct Session {
    id: u64,
    remote: SocketAddr,
    name: OnceLock<String>,
    outbox: mpsc::Sender<Outgoing>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    framed: AtomicBool,
    closed: Arc<watch::Sender<bool>>,
}

/// Read half of a connection, owned by a single task
pub struct SessionReader {
    frames: FrameReader<BoxedReader>,
    closed: watch::Receiver<bool>,
}

impl Session {
    /// Build a session from arbitrary stream halves.
    ///
    /// Spawns the writer task, so this must run inside a Tokio runtime.
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        remote: SocketAddr,
        max_payload: u64,
    ) -> (Arc<Self>, SessionReader) {
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);
        let (outbox, queue) = mpsc::channel(OUTBOX_FRAMES);
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        let writer_task = tokio::spawn(write_loop(id, writer, queue, Arc::clone(&closed)));

        let session = Arc::new(Self {
            id,
            remote,
            name: OnceLock::new(),
            outbox,
            writer_task: Mutex::new(Some(writer_task)),
            framed: AtomicBool::new(false),
            closed,
        });

        let reader = SessionReader {
            frames: FrameReader::with_max_payload(reader, max_payload),
            closed: closed_rx,
        };

        (session, reader)
    }

    /// Build a session from an accepted or connected TCP stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be read.
    pub fn from_tcp(stream: TcpStream, max_payload: u64) -> Result<(Arc<Self>, SessionReader)> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(
            Box::new(read_half),
            Box::new(write_half),
            remote,
            max_payload,
        ))
    }

    /// Process-unique session identifier
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint address
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Display name, once the handshake has assigned one
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    /// Assign the display name. Returns false if a name was already set.
    pub fn set_name(&self, name: String) -> bool {
        self.name.set(name).is_ok()
    }

    /// Protocol generation used when writing to this session
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        if self.framed.load(Ordering::Acquire) {
            Dialect::Framed
        } else {
            Dialect::Legacy
        }
    }

    /// Switch the protocol generation used when writing to this session
    pub fn set_dialect(&self, dialect: Dialect) {
        self.framed
            .store(dialect == Dialect::Framed, Ordering::Release);
    }

    /// Returns true once the session is closed, locally or by a failed write
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Encode and send one frame in this session's dialect.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails, the session is closed, or the
    /// write fails.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = encode_frame(frame, self.dialect())?;
        self.send_encoded(&bytes).await
    }

    /// Send one already-encoded frame and wait until it is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session is closed before the
    /// frame goes out, or the I/O error of the write.
    pub async fn send_encoded(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let (done, written) = oneshot::channel();
        let outgoing = Outgoing {
            bytes: Arc::from(bytes),
            done: Some(done),
        };

        let mut closed = self.closed.subscribe();
        tokio::select! {
            queued = self.outbox.send(outgoing) => {
                if queued.is_err() {
                    return Err(Error::SessionClosed);
                }
            }
            () = wait_closed(&mut closed) => return Err(Error::SessionClosed),
        }

        written.await.unwrap_or(Err(Error::SessionClosed))
    }

    /// Queue one already-encoded frame without waiting for the write.
    ///
    /// If the queue is full the receiver is not keeping up: the session is
    /// closed, which wakes its reader so the owner can clean up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session is (or just got) closed.
    pub fn post(&self, bytes: Arc<[u8]>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        match self.outbox.try_send(Outgoing { bytes, done: None }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Session {} is not reading ({} frames queued); closing",
                    self.id,
                    OUTBOX_FRAMES
                );
                self.closed.send_replace(true);
                Err(Error::SessionClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::SessionClosed),
        }
    }

    /// Send a bare string (the handshake name reply).
    ///
    /// # Errors
    ///
    /// Same as [`send_encoded`](Self::send_encoded).
    pub async fn send_string(&self, s: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(s.len() + 2);
        crate::frame::write_utf(&mut buf, s)?;
        self.send_encoded(&buf).await
    }

    /// Close the session.
    ///
    /// Wakes the task blocked on the [`SessionReader`], lets the writer flush
    /// what is already queued for a short grace period, then shuts down the
    /// write half so the remote observes end-of-stream. Idempotent.
    pub async fn close(&self) {
        self.closed.send_replace(true);

        let Some(mut task) = self.writer_task.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_WRITE_GRACE, &mut task).await.is_err() {
            tracing::debug!(
                "Session {} still writing after close; dropping write half",
                self.id
            );
            task.abort();
        }
    }
}

/// Drain the queue until the session closes or a write fails.
///
/// Frames already queued are written before a close is honoured.
async fn write_loop(
    id: u64,
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Outgoing>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closing = closed.subscribe();

    loop {
        let next = tokio::select! {
            biased;
            next = queue.recv() => next,
            () = wait_closed(&mut closing) => None,
        };
        let Some(outgoing) = next else {
            break;
        };

        let result = write_frame(&mut writer, &outgoing.bytes).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            tracing::debug!("Write to session {} failed: {}", id, e);
        }
        if let Some(done) = outgoing.done {
            let _ = done.send(result);
        }
        if failed {
            closed.send_replace(true);
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Shutdown of session {} failed: {}", id, e);
    }
}

async fn write_frame(writer: &mut BoxedWriter, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionReader {
    /// Read the next frame, or fail with [`Error::SessionClosed`] as soon as
    /// the session is closed.
    ///
    /// # Errors
    ///
    /// See [`FrameReader::read_frame`].
    pub async fn read_frame(&mut self) -> Result<(Frame, Dialect)> {
        tokio::select! {
            result = self.frames.read_frame() => result,
            () = wait_closed(&mut self.closed) => Err(Error::SessionClosed),
        }
    }

    /// Read one bare string (the handshake name reply).
    ///
    /// # Errors
    ///
    /// See [`FrameReader::read_string`].
    pub async fn read_string(&mut self) -> Result<String> {
        tokio::select! {
            result = self.frames.read_string() => result,
            () = wait_closed(&mut self.closed) => Err(Error::SessionClosed),
        }
    }
}

/// Resolve once the close flag is set or the session is dropped.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}
