//! Shared roster of connected sessions.
//!
//! One async mutex covers the whole roster. Every mutation and every
//! fan-out traversal holds it for its full duration, so a session is
//! visible from the moment `add` returns until `remove` and is never seen
//! half-built. Relay sends happen under the lock as well: a peer whose
//! socket buffer is full stalls everyone sending through the roster.

use crate::session::{ChatMode, Session, SessionInfo};
use crate::uid::{Uid, INVALID_UID};
use slab::Slab;
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Roster errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// All slots are taken.
    Full { capacity: usize },
    /// A live session already holds this uid.
    DuplicateUid(Uid),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Full { capacity } => {
                write!(f, "Roster full ({} sessions)", capacity)
            }
            RegistryError::DuplicateUid(uid) => write!(f, "Uid {} already registered", uid),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Reasons a private pairing cannot be made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairError {
    /// A session cannot pair with itself.
    SelfPair,
    /// No live session holds this uid.
    UnknownSession(Uid),
}

impl std::fmt::Display for PairError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairError::SelfPair => write!(f, "Cannot pair a session with itself"),
            PairError::UnknownSession(uid) => write!(f, "No such session: {}", uid),
        }
    }
}

impl std::error::Error for PairError {}

/// Result of leaving private mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unpaired {
    /// The peer the session was paired with.
    pub former_peer: Uid,
    /// Whether that peer still pointed back and was returned to COMMON.
    pub peer_released: bool,
}

/// Slab of sessions with a uid index. Only reachable through the lock.
#[derive(Default)]
pub struct Roster {
    sessions: Slab<Session>,
    by_uid: HashMap<Uid, usize>,
}

impl Roster {
    pub fn get(&self, uid: Uid) -> Option<&Session> {
        self.by_uid.get(&uid).and_then(|&key| self.sessions.get(key))
    }

    pub fn get_mut(&mut self, uid: Uid) -> Option<&mut Session> {
        let key = *self.by_uid.get(&uid)?;
        self.sessions.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().map(|(_, s)| s)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut().map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    fn set_peer(&mut self, uid: Uid, peer_uid: Uid, mode: ChatMode) -> bool {
        match self.get_mut(uid) {
            Some(session) => {
                session.mode = mode;
                session.peer_uid = peer_uid;
                true
            }
            None => false,
        }
    }

    /// Clear `uid`'s pairing; also clear its peer if the peer points back.
    pub(crate) fn unpair(&mut self, uid: Uid) -> Option<Unpaired> {
        let session = self.get(uid)?;
        if session.mode != ChatMode::Private {
            return None;
        }
        let former_peer = session.peer_uid;
        self.set_peer(uid, INVALID_UID, ChatMode::Common);

        let peer_released = self
            .get(former_peer)
            .is_some_and(|p| p.mode == ChatMode::Private && p.peer_uid == uid);
        if peer_released {
            self.set_peer(former_peer, INVALID_UID, ChatMode::Common);
        }

        Some(Unpaired {
            former_peer,
            peer_released,
        })
    }

    /// See [`Registry::pair`].
    pub(crate) fn pair(&mut self, a: Uid, b: Uid) -> Result<Vec<Uid>, PairError> {
        if a == b {
            return Err(PairError::SelfPair);
        }
        for uid in [a, b] {
            if self.get(uid).is_none() {
                return Err(PairError::UnknownSession(uid));
            }
        }

        let mut displaced = Vec::new();
        for (uid, partner) in [(a, b), (b, a)] {
            let Some(session) = self.get(uid) else {
                continue;
            };
            if session.mode == ChatMode::Private && session.peer_uid != partner {
                if let Some(unpaired) = self.unpair(uid) {
                    if unpaired.peer_released {
                        displaced.push(unpaired.former_peer);
                    }
                }
            }
        }

        self.set_peer(a, b, ChatMode::Private);
        self.set_peer(b, a, ChatMode::Private);
        debug!(a, b, ?displaced, "Sessions paired");
        Ok(displaced)
    }

    /// Drop the session holding `uid` from the slab and the index.
    pub(crate) fn remove(&mut self, uid: Uid) -> Option<Session> {
        let key = self.by_uid.remove(&uid)?;
        let session = self.sessions.try_remove(key);
        trace!(uid, slot = key, "Session removed");
        session
    }
}

/// Capacity-bounded, lock-protected roster shared by all connections.
pub struct Registry {
    roster: Mutex<Roster>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            roster: Mutex::new(Roster {
                sessions: Slab::with_capacity(capacity),
                by_uid: HashMap::with_capacity(capacity),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the roster lock. Used by the relay primitives and by callers
    /// that must read, mutate and send as one step.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock().await
    }

    /// Insert a session. On failure the session is handed back so the
    /// caller can still talk to the rejected connection.
    pub async fn add(&self, session: Session) -> Result<(), (RegistryError, Session)> {
        let mut roster = self.roster.lock().await;

        if roster.len() >= self.capacity {
            return Err((
                RegistryError::Full {
                    capacity: self.capacity,
                },
                session,
            ));
        }
        if roster.by_uid.contains_key(&session.uid) {
            return Err((RegistryError::DuplicateUid(session.uid), session));
        }

        let uid = session.uid;
        let key = roster.sessions.insert(session);
        roster.by_uid.insert(uid, key);
        trace!(uid, slot = key, "Session registered");
        Ok(())
    }

    /// Remove and return the session holding `uid`.
    pub async fn remove(&self, uid: Uid) -> Option<Session> {
        self.roster.lock().await.remove(uid)
    }

    /// Overwrite `uid`'s mode and peer. Returns `false` if `uid` is gone.
    pub async fn set_peer(&self, uid: Uid, peer_uid: Uid, mode: ChatMode) -> bool {
        self.roster.lock().await.set_peer(uid, peer_uid, mode)
    }

    /// Put `a` and `b` into private mode with each other in one step.
    ///
    /// Returns the uids of third sessions that were paired with `a` or `b`
    /// and have been returned to COMMON.
    pub async fn pair(&self, a: Uid, b: Uid) -> Result<Vec<Uid>, PairError> {
        self.roster.lock().await.pair(a, b)
    }

    /// Return `uid` to COMMON, releasing its peer if the peer points back.
    /// `None` if `uid` was not in private mode.
    pub async fn unpair(&self, uid: Uid) -> Option<Unpaired> {
        self.roster.lock().await.unpair(uid)
    }

    /// Rename `uid`, returning the previous name.
    pub async fn rename(&self, uid: Uid, name: String) -> Option<String> {
        let mut roster = self.roster.lock().await;
        let session = roster.get_mut(uid)?;
        Some(std::mem::replace(&mut session.name, name))
    }

    /// Run `f` against the session holding `uid`.
    pub async fn find<R>(&self, uid: Uid, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.roster.lock().await.get(uid).map(f)
    }

    /// Snapshot of the session holding `uid`.
    pub async fn info(&self, uid: Uid) -> Option<SessionInfo> {
        self.find(uid, Session::info).await
    }

    /// Visit every session in slot order.
    pub async fn for_each(&self, mut f: impl FnMut(&Session)) {
        let roster = self.roster.lock().await;
        for session in roster.iter() {
            f(session);
        }
    }

    /// Visit every session except the one holding `uid`.
    pub async fn for_each_except(&self, uid: Uid, mut f: impl FnMut(&Session)) {
        let roster = self.roster.lock().await;
        for session in roster.iter().filter(|s| s.uid != uid) {
            f(session);
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.roster.lock().await.len()
    }
}
