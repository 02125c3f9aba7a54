//! Discord REST client.
//!
//! Implements the core's remote control traits on top of the v10 HTTP API.
//! Status codes are classified so the core can tell a retryable hiccup
//! (429, 5xx, network) from a permanent refusal (403, 404, other 4xx).
//! Messages are split into 2000-character chunks (Unicode-aware) to comply
//! with Discord's limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::{AccessLevel, MessageSink, RemoteError, RemoteResult, RoomControl, SignalControl};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Value};
use tracing::debug;

use crate::voice::VoiceStateCache;

/// Discord's maximum message length for regular messages.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;
pub const DISCORD_API: &str = "https://discord.com/api/v10";

const CHANNEL_TYPE_VOICE: u8 = 2;
const OVERWRITE_ROLE: u8 = 0;
const OVERWRITE_MEMBER: u8 = 1;

pub mod permissions {
    pub const MANAGE_CHANNELS: u64 = 1 << 4;
    pub const VIEW_CHANNEL: u64 = 1 << 10;
    pub const CONNECT: u64 = 1 << 20;
    pub const SPEAK: u64 = 1 << 21;
    pub const MUTE_MEMBERS: u64 = 1 << 22;
    pub const MOVE_MEMBERS: u64 = 1 << 24;

    pub const JOIN: u64 = VIEW_CHANNEL | CONNECT | SPEAK;
    pub const MANAGE: u64 = JOIN | MANAGE_CHANNELS | MUTE_MEMBERS | MOVE_MEMBERS;
}

pub fn access_bits(access: AccessLevel) -> u64 {
    match access {
        AccessLevel::Join => permissions::JOIN,
        AccessLevel::Manage => permissions::MANAGE,
    }
}

// ---------------------------------------------------------------------------
// Message splitting
// ---------------------------------------------------------------------------

/// Split a message into chunks that respect Discord's 2000-character limit.
/// Tries to split at newline > space > hard boundary.
pub fn split_message(message: &str) -> Vec<String> {
    if message.chars().count() <= DISCORD_MAX_MESSAGE_LENGTH {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        let hard_split = remaining
            .char_indices()
            .nth(DISCORD_MAX_MESSAGE_LENGTH)
            .map_or(remaining.len(), |(idx, _)| idx);

        let chunk_end = if hard_split == remaining.len() {
            hard_split
        } else {
            let search_area = &remaining[..hard_split];
            if let Some(pos) = search_area.rfind('\n') {
                if search_area[..pos].chars().count() >= DISCORD_MAX_MESSAGE_LENGTH / 2 {
                    pos + 1
                } else {
                    search_area.rfind(' ').map_or(hard_split, |s| s + 1)
                }
            } else if let Some(pos) = search_area.rfind(' ') {
                pos + 1
            } else {
                hard_split
            }
        };

        chunks.push(remaining[..chunk_end].to_string());
        remaining = &remaining[chunk_end..];
    }

    chunks
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let detail = format!("Discord {status}: {}", body.chars().take(300).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RemoteError::Transient(detail)
    } else {
        RemoteError::Fatal(detail)
    }
}

fn network_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(format!("Discord request failed: {err}"))
}

// ---------------------------------------------------------------------------
// DiscordRest
// ---------------------------------------------------------------------------

pub struct DiscordRest {
    client: Client,
    bot_token: String,
    guild_id: String,
    api_base: String,
    voice: Arc<VoiceStateCache>,
}

impl DiscordRest {
    pub fn new(
        bot_token: String,
        guild_id: String,
        voice: Arc<VoiceStateCache>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            bot_token,
            guild_id,
            api_base: DISCORD_API.to_string(),
            voice,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    fn url(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| RemoteError::Fatal(format!("bad api base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Fatal("api base cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends one request. `Ok(None)` for 204/empty bodies.
    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> RemoteResult<Option<Value>> {
        let url = self.url(segments)?;
        debug!(%method, path = url.path(), "discord request");
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", self.auth_header());
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await.map_err(network_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| RemoteError::Fatal(format!("unexpected Discord payload: {e}")))
    }

    /// `false` on 404, the error otherwise.
    async fn channel_exists(&self, channel_id: &str) -> RemoteResult<bool> {
        match self.call(Method::GET, &["channels", channel_id], None).await {
            Ok(_) => Ok(true),
            Err(RemoteError::Fatal(detail)) if detail.starts_with("Discord 404") => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.call(Method::GET, &["users", "@me"], None).await.is_ok()
    }
}

#[async_trait]
impl RoomControl for DiscordRest {
    async fn create_room(
        &self,
        parent_id: Option<&str>,
        name: &str,
        owner_id: &str,
    ) -> RemoteResult<String> {
        let mut body = json!({
            "name": name,
            "type": CHANNEL_TYPE_VOICE,
            "permission_overwrites": [{
                "id": owner_id,
                "type": OVERWRITE_MEMBER,
                "allow": permissions::MANAGE.to_string(),
                "deny": "0",
            }],
        });
        if let Some(parent) = parent_id {
            body["parent_id"] = json!(parent);
        }
        let created = self
            .call(
                Method::POST,
                &["guilds", &self.guild_id, "channels"],
                Some(body),
            )
            .await?;
        created
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Fatal("channel create returned no id".to_string()))
    }

    async fn delete_room(&self, room_id: &str) -> RemoteResult<()> {
        self.call(Method::DELETE, &["channels", room_id], None)
            .await
            .map(|_| ())
    }

    async fn move_member(&self, actor_id: &str, room_id: &str) -> RemoteResult<()> {
        self.call(
            Method::PATCH,
            &["guilds", &self.guild_id, "members", actor_id],
            Some(json!({ "channel_id": room_id })),
        )
        .await
        .map(|_| ())
    }

    async fn occupant_count(&self, room_id: &str) -> RemoteResult<Option<usize>> {
        if !self.channel_exists(room_id).await? {
            return Ok(None);
        }
        Ok(Some(self.voice.occupants(room_id)))
    }

    async fn room_exists(&self, room_id: &str) -> RemoteResult<bool> {
        self.channel_exists(room_id).await
    }

    async fn set_default_access(&self, room_id: &str, visible: bool) -> RemoteResult<()> {
        let (allow, deny) = if visible {
            (permissions::VIEW_CHANNEL, 0)
        } else {
            (0, permissions::VIEW_CHANNEL)
        };
        // @everyone's role id is the guild id
        self.call(
            Method::PUT,
            &["channels", room_id, "permissions", &self.guild_id],
            Some(json!({
                "type": OVERWRITE_ROLE,
                "allow": allow.to_string(),
                "deny": deny.to_string(),
            })),
        )
        .await
        .map(|_| ())
    }

    async fn set_allowlist_entry(
        &self,
        room_id: &str,
        identity_id: &str,
        access: AccessLevel,
    ) -> RemoteResult<()> {
        self.call(
            Method::PUT,
            &["channels", room_id, "permissions", identity_id],
            Some(json!({
                "type": OVERWRITE_MEMBER,
                "allow": access_bits(access).to_string(),
                "deny": "0",
            })),
        )
        .await
        .map(|_| ())
    }

    async fn set_capacity(&self, room_id: &str, limit: u8) -> RemoteResult<()> {
        self.call(
            Method::PATCH,
            &["channels", room_id],
            Some(json!({ "user_limit": limit })),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SignalControl for DiscordRest {
    async fn register_signal(
        &self,
        context_id: &str,
        trigger_id: &str,
        signal_key: &str,
    ) -> RemoteResult<()> {
        self.call(
            Method::PUT,
            &[
                "channels", context_id, "messages", trigger_id, "reactions", signal_key, "@me",
            ],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn unregister_signal(
        &self,
        context_id: &str,
        trigger_id: &str,
        signal_key: &str,
    ) -> RemoteResult<()> {
        self.call(
            Method::DELETE,
            &[
                "channels", context_id, "messages", trigger_id, "reactions", signal_key, "@me",
            ],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn apply_effect(&self, actor_id: &str, effect_id: &str) -> RemoteResult<()> {
        self.call(
            Method::PUT,
            &["guilds", &self.guild_id, "members", actor_id, "roles", effect_id],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn revoke_effect(&self, actor_id: &str, effect_id: &str) -> RemoteResult<()> {
        self.call(
            Method::DELETE,
            &["guilds", &self.guild_id, "members", actor_id, "roles", effect_id],
            None,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl MessageSink for DiscordRest {
    async fn sink_exists(&self, sink_id: &str) -> RemoteResult<bool> {
        self.channel_exists(sink_id).await
    }

    async fn send_item(&self, sink_id: &str, content: &str) -> RemoteResult<()> {
        let chunks = split_message(content);
        for (i, chunk) in chunks.iter().enumerate() {
            self.call(
                Method::POST,
                &["channels", sink_id, "messages"],
                Some(json!({ "content": chunk, "allowed_mentions": { "parse": ["users"] } })),
            )
            .await?;

            // Small inter-chunk delay to avoid rate limiting
            if i < chunks.len() - 1 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rest() -> DiscordRest {
        DiscordRest::new(
            "fake".into(),
            "guild-1".into(),
            Arc::new(VoiceStateCache::new()),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    // ── Error classification ──────────────────────────────────────────────

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
    }

    #[test]
    fn client_errors_are_fatal() {
        let err = classify_status(StatusCode::NOT_FOUND, r#"{"message":"Unknown Channel"}"#);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Discord 404"));
        assert!(!classify_status(StatusCode::FORBIDDEN, "").is_transient());
    }

    // ── URL building ──────────────────────────────────────────────────────

    #[test]
    fn reaction_path_percent_encodes_unicode_emoji() {
        let url = rest()
            .url(&["channels", "c1", "messages", "m1", "reactions", "🎮", "@me"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://discord.com/api/v10/channels/c1/messages/m1/reactions/%F0%9F%8E%AE/@me"
        );
    }

    #[test]
    fn custom_emoji_keeps_name_id_form() {
        let url = rest()
            .url(&["channels", "c1", "messages", "m1", "reactions", "party:123", "@me"])
            .unwrap();
        assert!(url.path().ends_with("/reactions/party:123/@me"));
    }

    #[test]
    fn api_base_can_be_overridden() {
        let url = rest()
            .with_api_base("http://127.0.0.1:9/api/")
            .url(&["users", "@me"])
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9/api/users/@me");
    }

    // ── Permissions ───────────────────────────────────────────────────────

    #[test]
    fn manage_includes_join() {
        assert_eq!(access_bits(AccessLevel::Manage) & permissions::JOIN, permissions::JOIN);
        assert_eq!(access_bits(AccessLevel::Join) & permissions::MOVE_MEMBERS, 0);
    }

    // ── Message splitting ─────────────────────────────────────────────────

    #[test]
    fn split_short_message() {
        assert_eq!(split_message("Hello!"), vec!["Hello!".to_string()]);
    }

    #[test]
    fn split_just_over_limit() {
        let msg = "a".repeat(DISCORD_MAX_MESSAGE_LENGTH + 1);
        let chunks = split_message(&msg);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), DISCORD_MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn split_prefers_newline_break() {
        let msg = format!("{}\n{}", "a".repeat(1500), "b".repeat(500));
        let chunks = split_message(&msg);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('\n'));
    }

    #[test]
    fn split_unicode_preserves_content() {
        let msg = "🎶 jam ".repeat(500);
        let chunks = split_message(&msg);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= DISCORD_MAX_MESSAGE_LENGTH);
        }
        assert_eq!(chunks.concat(), msg);
    }
}
