//! Remote control surface the core drives, and the timeout/retry wrappers
//! every call goes through.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(15);

/// What an allow-list entry lets the grantee do in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// See and connect.
    Join,
    /// Join plus move/mute members and edit the room.
    Manage,
}

#[async_trait]
pub trait RoomControl: Send + Sync {
    /// Creates a room under `parent_id` with `owner_id` holding manage rights.
    async fn create_room(
        &self,
        parent_id: Option<&str>,
        name: &str,
        owner_id: &str,
    ) -> RemoteResult<String>;
    async fn delete_room(&self, room_id: &str) -> RemoteResult<()>;
    async fn move_member(&self, actor_id: &str, room_id: &str) -> RemoteResult<()>;
    /// Live occupant count, `None` when the room no longer resolves.
    async fn occupant_count(&self, room_id: &str) -> RemoteResult<Option<usize>>;
    async fn room_exists(&self, room_id: &str) -> RemoteResult<bool>;
    async fn set_default_access(&self, room_id: &str, visible: bool) -> RemoteResult<()>;
    async fn set_allowlist_entry(
        &self,
        room_id: &str,
        identity_id: &str,
        access: AccessLevel,
    ) -> RemoteResult<()>;
    /// `0` clears the limit.
    async fn set_capacity(&self, room_id: &str, limit: u8) -> RemoteResult<()>;
}

#[async_trait]
pub trait SignalControl: Send + Sync {
    async fn register_signal(
        &self,
        context_id: &str,
        trigger_id: &str,
        signal_key: &str,
    ) -> RemoteResult<()>;
    async fn unregister_signal(
        &self,
        context_id: &str,
        trigger_id: &str,
        signal_key: &str,
    ) -> RemoteResult<()>;
    async fn apply_effect(&self, actor_id: &str, effect_id: &str) -> RemoteResult<()>;
    async fn revoke_effect(&self, actor_id: &str, effect_id: &str) -> RemoteResult<()>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn sink_exists(&self, sink_id: &str) -> RemoteResult<bool>;
    async fn send_item(&self, sink_id: &str, content: &str) -> RemoteResult<()>;
}

/// Runs `fut` under `limit`; an elapsed timer counts as a transient failure.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transient(format!(
            "timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Retries an idempotent call on transient failure with doubling backoff.
pub async fn retry_transient<T, F, Fut>(
    attempts: u32,
    limit: Duration,
    mut op: F,
) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match bounded(limit, op()).await {
            Err(err) if err.is_transient() && attempt < attempts => {
                debug!(attempt, error = %err, "retrying transient remote failure");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn bounded_turns_timeout_into_transient() {
        let result: RemoteResult<()> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_success() {
        let calls = &AtomicU32::new(0);
        let result = retry_transient(3, Duration::from_secs(1), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RemoteError::Transient("503".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_never_repeats_fatal() {
        let calls = &AtomicU32::new(0);
        let result: RemoteResult<()> = retry_transient(3, Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Fatal("403".into()))
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_attempts() {
        let calls = &AtomicU32::new(0);
        let result: RemoteResult<()> = retry_transient(3, Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transient("429".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
