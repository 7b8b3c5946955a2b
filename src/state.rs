//! Process-wide chat state shared by every connection handler.

use crate::registry::Registry;
use crate::uid::UidAllocator;
use tokio::sync::Mutex;

/// Longest room name kept, in characters.
pub const MAX_ROOM_NAME_LEN: usize = 1024;

/// The shared room name ("topic"). Empty means unset.
#[derive(Default)]
pub struct RoomName {
    name: Mutex<String>,
}

impl RoomName {
    /// Replace the room name, returning what was stored.
    pub async fn set(&self, name: &str) -> String {
        let name: String = name.chars().take(MAX_ROOM_NAME_LEN).collect();
        let mut current = self.name.lock().await;
        current.clone_from(&name);
        name
    }

    /// Current room name, if one has been set.
    pub async fn get(&self) -> Option<String> {
        let current = self.name.lock().await;
        (!current.is_empty()).then(|| current.clone())
    }
}

/// Roster, identifier space and room name, owned by the server and handed
/// to each connection.
pub struct ChatState {
    pub registry: Registry,
    pub uids: UidAllocator,
    pub room: RoomName,
}

impl ChatState {
    pub fn new(max_clients: usize) -> Self {
        Self {
            registry: Registry::new(max_clients),
            uids: UidAllocator::new(),
            room: RoomName::default(),
        }
    }
}
