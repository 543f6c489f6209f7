//! Name-keyed session registry.
//!
//! Sessions are stored in a concurrent `DashMap` keyed by display name. A name
//! is present exactly while its session is open and handshake-complete.
//! Every insert and remove is followed by a roster broadcast to all sessions
//! still registered.
//!
//! The map is changed without any registry-wide lock. A separate mutex only
//! orders roster broadcasts: each one snapshots the map under it and queues
//! the roster on every session without waiting for the writes, so a peer that
//! stops reading can never hold up joins or evictions.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_core::{BROADCAST, Dialect, Frame, Session, encode_frame};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Live mapping of display name to session
#[derive(Default)]
pub struct Registry {
    /// Registered sessions (name -> session)
    sessions: DashMap<String, Arc<Session>>,
    /// Orders roster snapshots so every session sees them in sequence
    roster_lock: Mutex<()>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handshake-complete session under a unique name.
    ///
    /// If `requested` is taken (or is the broadcast sentinel), the first free
    /// `requested(n)` is used instead. The assigned name is stored on the
    /// session and returned. The updated roster is broadcast to every
    /// registered session, including the new one.
    pub async fn register(&self, requested: &str, session: &Arc<Session>) -> String {
        let mut n: u32 = if requested == BROADCAST { 1 } else { 0 };
        let name = loop {
            let candidate = if n == 0 {
                requested.to_string()
            } else {
                format!("{requested}({n})")
            };
            match self.sessions.entry(candidate.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(session));
                    break candidate;
                }
                Entry::Occupied(_) => n += 1,
            }
        };

        if !session.set_name(name.clone()) {
            tracing::warn!("Session {} registered twice", session.id());
        }

        self.broadcast_roster().await;
        name
    }

    /// Remove a session and broadcast the updated roster.
    ///
    /// Only removes the entry if it still belongs to `session`. Sessions that
    /// never completed the handshake have no name and are ignored. Returns
    /// true if an entry was removed.
    pub async fn unregister(&self, session: &Session) -> bool {
        let Some(name) = session.name() else {
            return false;
        };

        let removed = self
            .sessions
            .remove_if(name, |_, registered| registered.id() == session.id())
            .is_some();

        if removed {
            self.broadcast_roster().await;
        }
        removed
    }

    /// Look up a session by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered session
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sorted snapshot of registered names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session without broadcasting (relay shutdown).
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let entries: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        entries
            .into_iter()
            .filter_map(|(name, session)| {
                self.sessions
                    .remove_if(&name, |_, registered| registered.id() == session.id())
                    .map(|(_, removed)| removed)
            })
            .collect()
    }

    /// Queue the current roster on every registered session.
    async fn broadcast_roster(&self) {
        let _order = self.roster_lock.lock().await;

        let frame = Frame::Roster(self.names());
        // Roster encoding is identical in both dialects.
        let bytes: Arc<[u8]> = match encode_frame(&frame, Dialect::Legacy) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                tracing::error!("Roster too large to encode: {}", e);
                return;
            }
        };

        for session in self.snapshot() {
            if let Err(e) = session.post(Arc::clone(&bytes)) {
                tracing::debug!(
                    "Roster to {} failed: {}",
                    session.name().unwrap_or("?"),
                    e
                );
            }
        }
    }
}
