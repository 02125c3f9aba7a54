use serde::{Deserialize, Serialize};

/// An identity moved between voice contexts (joined, left, or switched).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub actor_id: String,
    /// Display name used for room names and announcements.
    #[serde(default)]
    pub actor_name: Option<String>,
    pub from_context: Option<String>,
    pub to_context: Option<String>,
    #[serde(default)]
    pub is_system: bool,
}

impl MembershipChange {
    /// True when the actor ended up somewhere it was not before.
    pub fn entered(&self) -> Option<&str> {
        match (&self.from_context, &self.to_context) {
            (from, Some(to)) if from.as_deref() != Some(to.as_str()) => Some(to.as_str()),
            _ => None,
        }
    }

    /// True when the actor is no longer in the context it was in.
    pub fn departed(&self) -> Option<&str> {
        match (&self.from_context, &self.to_context) {
            (Some(from), to) if to.as_deref() != Some(from.as_str()) => Some(from.as_str()),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.actor_name.as_deref().unwrap_or(&self.actor_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    Raised,
    Withdrawn,
}

/// A reaction added to or removed from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub direction: SignalDirection,
    pub context_id: String,
    pub trigger_id: String,
    pub signal_key: String,
    pub actor_id: String,
    #[serde(default)]
    pub actor_is_system: bool,
}
