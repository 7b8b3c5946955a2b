//! Per-connection session record.

use crate::uid::{Uid, INVALID_UID};
use std::net::SocketAddr;
use tokio::io::AsyncWrite;

/// Longest display name kept, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Write side of a client connection.
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Relay mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// Chat lines go to everyone else.
    Common,
    /// Chat lines go only to the paired peer.
    Private,
}

/// One connected client as seen by the roster.
pub struct Session {
    pub uid: Uid,
    pub addr: SocketAddr,
    pub name: String,
    pub mode: ChatMode,
    pub peer_uid: Uid,
    pub(crate) writer: SessionWriter,
}

impl Session {
    /// New session in COMMON mode, named after its uid.
    pub fn new(uid: Uid, addr: SocketAddr, writer: SessionWriter) -> Self {
        Self {
            uid,
            addr,
            name: uid.to_string(),
            mode: ChatMode::Common,
            peer_uid: INVALID_UID,
            writer,
        }
    }

    /// Copy of the fields other sessions are allowed to observe.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            uid: self.uid,
            addr: self.addr,
            name: self.name.clone(),
            mode: self.mode,
            peer_uid: self.peer_uid,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("addr", &self.addr)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("peer_uid", &self.peer_uid)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a session without its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub uid: Uid,
    pub addr: SocketAddr,
    pub name: String,
    pub mode: ChatMode,
    pub peer_uid: Uid,
}

/// Clamp a requested display name to `MAX_NAME_LEN` characters.
pub fn clamp_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let session = Session::new(12, addr, Box::new(tokio::io::sink()));
        let info = session.info();

        assert_eq!(info.name, "12");
        assert_eq!(info.mode, ChatMode::Common);
        assert_eq!(info.peer_uid, INVALID_UID);
        assert_eq!(info.addr, addr);
    }

    #[test]
    fn test_clamp_name() {
        assert_eq!(clamp_name("bob"), "bob");
        let long = "x".repeat(40);
        assert_eq!(clamp_name(&long).chars().count(), MAX_NAME_LEN);
        assert_eq!(clamp_name("ééé"), "ééé");
    }
}
