//! Broadcast and unicast routing of text and files.
//!
//! A frame addressed to the broadcast sentinel (`Todos`) or with an empty
//! target goes to every registered session except the sender. A frame
//! addressed to a name goes only to that session. Unknown targets (and a
//! sender addressing itself) are dropped silently; the sender gets no error.

use crate::registry::Registry;
use parley_core::{BROADCAST, Dialect, Frame, Session, encode_frame};
use std::sync::Arc;

/// Outcome of routing one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to every other registered session
    Broadcast {
        /// Number of sessions the frame was queued on
        recipients: usize,
    },
    /// Sent to the named target
    Unicast,
    /// Target unknown; nothing sent
    Dropped,
}

/// Routes frames between registered sessions
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

/// Lazily encodes a frame once per dialect
struct EncodedFrame<'a> {
    frame: &'a Frame,
    legacy: Option<Arc<[u8]>>,
    framed: Option<Arc<[u8]>>,
}

impl<'a> EncodedFrame<'a> {
    fn new(frame: &'a Frame) -> Self {
        Self {
            frame,
            legacy: None,
            framed: None,
        }
    }

    fn bytes(&mut self, dialect: Dialect) -> parley_core::Result<Arc<[u8]>> {
        let slot = match dialect {
            Dialect::Legacy => &mut self.legacy,
            Dialect::Framed => &mut self.framed,
        };
        match slot {
            Some(bytes) => Ok(Arc::clone(bytes)),
            None => {
                let bytes: Arc<[u8]> = encode_frame(self.frame, dialect)?.into();
                *slot = Some(Arc::clone(&bytes));
                Ok(bytes)
            }
        }
    }
}

/// Returns true if `target` addresses every session
#[must_use]
pub fn is_broadcast(target: &str) -> bool {
    target.is_empty() || target == BROADCAST
}

impl Router {
    /// Create a router over `registry`
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Route `frame` from the session with id `sender_id` to `target`.
    ///
    /// `frame` must already carry the sender's name in its `peer` field.
    /// Frames are queued on each recipient without waiting for the write.
    /// Failures on individual recipients are logged and skipped; the
    /// recipient's own handler notices the dead connection.
    ///
    /// # Errors
    ///
    /// Returns an error only if the frame cannot be encoded.
    pub async fn route(
        &self,
        sender_id: u64,
        target: &str,
        frame: &Frame,
    ) -> parley_core::Result<Delivery> {
        let mut encoded = EncodedFrame::new(frame);

        if is_broadcast(target) {
            let mut recipients = 0;
            for session in self.registry.snapshot() {
                if session.id() == sender_id {
                    continue;
                }
                deliver(&session, &mut encoded)?;
                recipients += 1;
            }
            return Ok(Delivery::Broadcast { recipients });
        }

        match self.registry.get(target) {
            Some(session) if session.id() != sender_id => {
                deliver(&session, &mut encoded)?;
                Ok(Delivery::Unicast)
            }
            _ => {
                tracing::debug!("Dropping {} for unknown target {}", frame.frame_type(), target);
                Ok(Delivery::Dropped)
            }
        }
    }
}

fn deliver(session: &Session, encoded: &mut EncodedFrame<'_>) -> parley_core::Result<()> {
    let bytes = encoded.bytes(session.dialect())?;
    if let Err(e) = session.post(bytes) {
        tracing::debug!(
            "Forward to {} failed: {}",
            session.name().unwrap_or("?"),
            e
        );
    }
    Ok(())
}
