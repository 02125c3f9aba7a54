//! Voice-join announcements and jam-link sharing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::events::MembershipChange;
use crate::remote::{bounded, MessageSink, DEFAULT_REMOTE_TIMEOUT};

#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    /// Where join announcements go. `None` turns them off.
    pub sink_id: Option<String>,
    /// Joins into this context are not announced (the member is about to be
    /// moved into a fresh room, which gets announced instead).
    pub quiet_context_id: Option<String>,
    /// Substring a shared link must contain.
    pub link_host: String,
    pub remote_timeout: Duration,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            sink_id: None,
            quiet_context_id: None,
            link_host: "spotify.link".to_string(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

pub struct Announcer {
    config: AnnounceConfig,
    sink: Arc<dyn MessageSink>,
}

impl Announcer {
    pub fn new(config: AnnounceConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self { config, sink }
    }

    /// Best-effort; returns whether an announcement went out.
    pub async fn on_membership_changed(&self, change: &MembershipChange) -> bool {
        let Some(sink_id) = self.config.sink_id.as_deref() else {
            return false;
        };
        let Some(entered) = change.entered() else {
            return false;
        };
        if change.is_system || self.config.quiet_context_id.as_deref() == Some(entered) {
            return false;
        }

        let content = format!(
            "<@{}> joined <#{}> 🎧\nShare your jam link with `!jam <link>`.",
            change.actor_id, entered
        );
        match bounded(self.config.remote_timeout, self.sink.send_item(sink_id, &content)).await {
            Ok(()) => {
                debug!(actor_id = %change.actor_id, context_id = entered, "join announced");
                true
            }
            Err(err) => {
                warn!(
                    actor_id = %change.actor_id,
                    context_id = entered,
                    sink_id,
                    "join announcement failed: {err}"
                );
                false
            }
        }
    }

    /// Validates and posts a jam link to `reply_sink`.
    pub async fn share_link(&self, actor_id: &str, link: &str, reply_sink: &str) -> CoreResult<()> {
        let link = link.trim();
        if link.is_empty() || !link.contains(self.config.link_host.as_str()) {
            return Err(CoreError::InvalidLink(link.to_string()));
        }
        let content = format!("<@{actor_id}> started a jam 🎶\n{link}");
        bounded(self.config.remote_timeout, self.sink.send_item(reply_sink, &content))
            .await
            .map_err(|err| CoreError::remote("send_item", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, RemoteResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn sink_exists(&self, _sink_id: &str) -> RemoteResult<bool> {
            Ok(true)
        }

        async fn send_item(&self, sink_id: &str, content: &str) -> RemoteResult<()> {
            if self.fail {
                return Err(RemoteError::Fatal("Missing Access".into()));
            }
            self.sent
                .lock()
                .push((sink_id.to_string(), content.to_string()));
            Ok(())
        }
    }

    fn announcer(sink: Arc<RecordingSink>) -> Announcer {
        Announcer::new(
            AnnounceConfig {
                sink_id: Some("jam-links".into()),
                quiet_context_id: Some("lobby".into()),
                ..AnnounceConfig::default()
            },
            sink,
        )
    }

    fn join(to: &str) -> MembershipChange {
        MembershipChange {
            actor_id: "alice".into(),
            actor_name: None,
            from_context: None,
            to_context: Some(to.into()),
            is_system: false,
        }
    }

    #[tokio::test]
    async fn announces_new_joins() {
        let sink = Arc::new(RecordingSink::default());
        let a = announcer(sink.clone());

        assert!(a.on_membership_changed(&join("music")).await);

        let sent = sink.sent.lock();
        assert_eq!(sent[0].0, "jam-links");
        assert!(sent[0].1.starts_with("<@alice> joined <#music>"));
    }

    #[tokio::test]
    async fn skips_bots_quiet_context_and_non_moves() {
        let sink = Arc::new(RecordingSink::default());
        let a = announcer(sink.clone());
        let mut bot = join("music");
        bot.is_system = true;
        let mut stay = join("music");
        stay.from_context = Some("music".into());

        assert!(!a.on_membership_changed(&bot).await);
        assert!(!a.on_membership_changed(&join("lobby")).await);
        assert!(!a.on_membership_changed(&stay).await);
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn announcement_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        assert!(!announcer(sink).on_membership_changed(&join("music")).await);
    }

    #[tokio::test]
    async fn disabled_without_sink() {
        let sink = Arc::new(RecordingSink::default());
        let a = Announcer::new(AnnounceConfig::default(), sink.clone());
        assert!(!a.on_membership_changed(&join("music")).await);
    }

    #[tokio::test]
    async fn share_link_rejects_foreign_links_without_sending() {
        let sink = Arc::new(RecordingSink::default());
        let a = announcer(sink.clone());

        let err = a
            .share_link("alice", "https://example.com/x", "general")
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidLink(_)));
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn share_link_posts_to_reply_channel() {
        let sink = Arc::new(RecordingSink::default());
        let a = announcer(sink.clone());

        a.share_link("alice", " https://spotify.link/abc ", "general")
            .await
            .unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent[0].0, "general");
        assert!(sent[0].1.ends_with("https://spotify.link/abc"));
    }
}
