//! Who is in which voice channel, as last reported by the gateway.
//!
//! Discord has no REST endpoint for voice occupancy, so the gateway reader
//! keeps this map current and updates it before handing the event on. A
//! handler that re-reads occupancy therefore sees every move the gateway has
//! delivered so far, including ones that arrived after its own event.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

#[derive(Default)]
pub struct VoiceStateCache {
    by_user: RwLock<HashMap<String, String>>,
}

impl VoiceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache with the `voice_states` array from `GUILD_CREATE`.
    pub fn seed(&self, voice_states: &[Value]) {
        let mut next = HashMap::new();
        for state in voice_states {
            let user = state.get("user_id").and_then(Value::as_str);
            let channel = state.get("channel_id").and_then(Value::as_str);
            if let (Some(user), Some(channel)) = (user, channel) {
                next.insert(user.to_string(), channel.to_string());
            }
        }
        *self.by_user.write() = next;
    }

    /// Records the user's new channel (`None` = disconnected) and returns the
    /// channel they were in before.
    pub fn apply(&self, user_id: &str, channel_id: Option<&str>) -> Option<String> {
        let mut map = self.by_user.write();
        match channel_id {
            Some(channel) => map.insert(user_id.to_string(), channel.to_string()),
            None => map.remove(user_id),
        }
    }

    pub fn channel_of(&self, user_id: &str) -> Option<String> {
        self.by_user.read().get(user_id).cloned()
    }

    pub fn occupants(&self, channel_id: &str) -> usize {
        self.by_user
            .read()
            .values()
            .filter(|c| c.as_str() == channel_id)
            .count()
    }
}
