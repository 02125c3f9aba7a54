use thiserror::Error;

/// Failure reported by a remote platform call.
///
/// Implementations classify their own failures; the core only cares whether
/// another attempt could plausibly succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeout, rate limit, 5xx, connection reset.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Permission denied, unknown entity, malformed request.
    #[error("remote failure: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    TaskJoin(String),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{owner_id} does not own a room")]
    NotOwner { owner_id: String },

    #[error("room {resource_id} no longer exists")]
    ResourceMissing { resource_id: String },

    #[error("{field} must be between {min} and {max}, got {value}")]
    InvalidRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },

    #[error("no binding for {signal_key} on message {trigger_id} in {context_id}")]
    BindingNotFound {
        context_id: String,
        trigger_id: String,
        signal_key: String,
    },

    #[error("invalid link: {0}")]
    InvalidLink(String),

    #[error("transient remote failure during {op}: {detail}")]
    RemoteTransient { op: &'static str, detail: String },

    #[error("remote failure during {op}: {detail}")]
    RemoteFatal { op: &'static str, detail: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn remote(op: &'static str, err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(detail) => CoreError::RemoteTransient { op, detail },
            RemoteError::Fatal(detail) => CoreError::RemoteFatal { op, detail },
        }
    }

    /// Stable code for structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotOwner { .. } => "NOT_OWNER",
            CoreError::ResourceMissing { .. } => "RESOURCE_MISSING",
            CoreError::InvalidRange { .. } => "INVALID_RANGE",
            CoreError::BindingNotFound { .. } => "BINDING_NOT_FOUND",
            CoreError::InvalidLink(_) => "INVALID_LINK",
            CoreError::RemoteTransient { .. } => "REMOTE_TRANSIENT",
            CoreError::RemoteFatal { .. } => "REMOTE_FATAL",
            CoreError::Store(_) => "STORE",
        }
    }

    /// Short actionable text for the person who ran the command.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::NotOwner { .. } => {
                "⚠️ You don't have a room. Join the lobby channel to get one.".to_string()
            }
            CoreError::ResourceMissing { .. } => {
                "⚠️ Your room no longer exists. Rejoin the lobby channel to get a new one."
                    .to_string()
            }
            CoreError::InvalidRange { min, max, .. } => {
                format!("⚠️ Pick a number from {min} to {max}.")
            }
            CoreError::BindingNotFound { .. } => {
                "⚠️ There is no binding for that emoji on that message.".to_string()
            }
            CoreError::InvalidLink(_) => "❌ That is not a valid jam link!".to_string(),
            CoreError::RemoteTransient { .. } => {
                "⚠️ Discord didn't answer in time. Try again in a moment.".to_string()
            }
            CoreError::RemoteFatal { .. } => {
                "⚠️ Discord refused that change. Check my permissions.".to_string()
            }
            CoreError::Store(_) => "⚠️ Could not save that change.".to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_maps_to_matching_core_variant() {
        let transient = CoreError::remote("create_resource", RemoteError::Transient("503".into()));
        assert!(matches!(
            transient,
            CoreError::RemoteTransient { op: "create_resource", .. }
        ));

        let fatal = CoreError::remote("delete_resource", RemoteError::Fatal("403".into()));
        assert_eq!(fatal.code(), "REMOTE_FATAL");
    }

    #[test]
    fn invalid_range_message_names_bounds() {
        let err = CoreError::InvalidRange {
            field: "limit",
            min: 0,
            max: 99,
            value: 150,
        };
        assert_eq!(err.to_string(), "limit must be between 0 and 99, got 150");
        assert!(err.user_message().contains("0 to 99"));
    }
}
