//! Who is connected to the live channel right now.
//!
//! A user counts as online while at least one WebSocket of theirs is open;
//! several browser tabs share one entry.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::auth::Visibility;
use super::lifecycle::timestamp;
use super::models::{PresenceEntry, User};

#[derive(Default)]
pub struct PresenceRegistry {
    online: Mutex<HashMap<i64, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `true` when the user just came online.
    pub fn join(&self, user: &User, now: DateTime<Utc>) -> bool {
        let mut online = self.online.lock().unwrap_or_else(|e| e.into_inner());
        match online.get_mut(&user.id) {
            Some(entry) => {
                entry.connections += 1;
                false
            }
            None => {
                online.insert(
                    user.id,
                    PresenceEntry {
                        user_id: user.id,
                        name: user.name.clone(),
                        sector_id: user.sector_id,
                        connections: 1,
                        since: timestamp(now),
                    },
                );
                true
            }
        }
    }

    /// Drop a connection. Returns `true` when the user's last one closed.
    pub fn leave(&self, user_id: i64) -> bool {
        let mut online = self.online.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = online.get_mut(&user_id) else {
            return false;
        };
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            online.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Online users, sorted by name.
    pub fn list(&self) -> Vec<PresenceEntry> {
        let online = self.online.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<PresenceEntry> = online.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        entries
    }

    /// Online users the viewer may see: their own sector plus sectorless users.
    pub fn visible_to(&self, viewer: &Visibility) -> Vec<PresenceEntry> {
        self.list()
            .into_iter()
            .filter(|entry| viewer.sees_sector(entry.sector_id))
            .collect()
    }

    #[cfg(test)]
    pub fn is_online(&self, user_id: i64) -> bool {
        let online = self.online.lock().unwrap_or_else(|e| e.into_inner());
        online.contains_key(&user_id)
    }
}
