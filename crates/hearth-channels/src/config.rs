//! Configuration for the hearth Discord adapter.
//!
//! Everything is read from `HEARTH_*` environment variables.
//! `ChannelsConfig::from_env()` returns `Err` only when a required value
//! (bot token, guild id) is missing or a numeric value does not parse.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use hearth_core::{AnnounceConfig, FeedConfig, RoomConfig};

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct ChannelsConfig {
    pub discord: DiscordConfig,
    pub rooms: RoomsSection,
    pub announce: AnnounceSection,
    pub feed: Option<FeedSection>,
    /// Users allowed to run admin commands. Empty denies everyone.
    pub admin_users: Vec<String>,
    pub remote_timeout: Duration,
    /// Directory holding the durable key/value records.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub guild_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct RoomsSection {
    /// The "join to create" voice channel.
    pub spawn_channel_id: Option<String>,
    pub category_id: Option<String>,
    pub name_template: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceSection {
    pub channel_id: Option<String>,
    pub jam_link_host: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedSection {
    pub url: String,
    pub channel_id: String,
    pub kinds: Vec<String>,
    pub interval: Duration,
    pub max_backlog: usize,
}

/// Parse a comma-separated allowed_users string into a Vec.
/// `"*"` is kept as-is; leading/trailing whitespace is stripped per item.
pub fn parse_allowed_users(raw: &str) -> Vec<String> {
    if raw.trim() == "*" {
        return vec!["*".to_string()];
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Comma-separated item kinds. `"*"` (or an empty value) means every kind,
/// which `FeedConfig` spells as an empty list.
pub fn parse_feed_kinds(raw: &str) -> Vec<String> {
    let kinds: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if kinds.iter().any(|k| k == "*") {
        return Vec::new();
    }
    kinds
}

/// Returns `true` if `user` is permitted based on `allowed_users`.
pub fn is_user_allowed(user: &str, allowed_users: &[String]) -> bool {
    if allowed_users.is_empty() {
        return false; // deny-by-default when list is empty
    }
    allowed_users.iter().any(|a| a == "*" || a == user)
}

/// `~/.local/share/hearth` (or the platform equivalent).
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".hearth"))
        .join("hearth")
}

impl ChannelsConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let Some(bot_token) = get("HEARTH_DISCORD_BOT_TOKEN") else {
            bail!("HEARTH_DISCORD_BOT_TOKEN is not set");
        };
        let Some(guild_id) = get("HEARTH_GUILD_ID") else {
            bail!("HEARTH_GUILD_ID is not set");
        };

        let remote_timeout = Duration::from_secs(parse_or(
            get("HEARTH_REMOTE_TIMEOUT_SECS"),
            "HEARTH_REMOTE_TIMEOUT_SECS",
            15u64,
        )?);

        let feed = match (get("HEARTH_FEED_URL"), get("HEARTH_FEED_CHANNEL_ID")) {
            (Some(url), Some(channel_id)) => Some(FeedSection {
                url,
                channel_id,
                kinds: get("HEARTH_FEED_KINDS")
                    .map(|s| parse_feed_kinds(&s))
                    .unwrap_or_else(|| vec!["video".to_string()]),
                interval: feed_interval(get("HEARTH_FEED_INTERVAL_SECS"))?,
                max_backlog: parse_or(
                    get("HEARTH_FEED_MAX_BACKLOG"),
                    "HEARTH_FEED_MAX_BACKLOG",
                    10usize,
                )?,
            }),
            (Some(_), None) => bail!("HEARTH_FEED_URL is set but HEARTH_FEED_CHANNEL_ID is not"),
            _ => None,
        };

        Ok(Self {
            discord: DiscordConfig {
                bot_token,
                guild_id,
            },
            rooms: RoomsSection {
                spawn_channel_id: get("HEARTH_SPAWN_CHANNEL_ID"),
                category_id: get("HEARTH_ROOM_CATEGORY_ID"),
                name_template: get("HEARTH_ROOM_NAME_TEMPLATE"),
            },
            announce: AnnounceSection {
                channel_id: get("HEARTH_ANNOUNCE_CHANNEL_ID"),
                jam_link_host: get("HEARTH_JAM_LINK_HOST"),
            },
            feed,
            admin_users: get("HEARTH_ADMIN_USERS")
                .map(|s| parse_allowed_users(&s))
                .unwrap_or_default(),
            remote_timeout,
            state_dir: get("HEARTH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_dir),
        })
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        is_user_allowed(user_id, &self.admin_users)
    }

    pub fn to_room_config(&self) -> RoomConfig {
        let mut config = RoomConfig {
            spawn_context_id: self.rooms.spawn_channel_id.clone(),
            parent_id: self.rooms.category_id.clone(),
            remote_timeout: self.remote_timeout,
            ..RoomConfig::default()
        };
        if let Some(template) = &self.rooms.name_template {
            config.name_template = template.clone();
        }
        config
    }

    pub fn to_announce_config(&self) -> AnnounceConfig {
        let mut config = AnnounceConfig {
            sink_id: self.announce.channel_id.clone(),
            quiet_context_id: self.rooms.spawn_channel_id.clone(),
            remote_timeout: self.remote_timeout,
            ..AnnounceConfig::default()
        };
        if let Some(host) = &self.announce.jam_link_host {
            config.link_host = host.clone();
        }
        config
    }

    pub fn to_feed_config(&self) -> Option<FeedConfig> {
        let feed = self.feed.as_ref()?;
        Some(FeedConfig {
            sink_id: feed.channel_id.clone(),
            eligible_kinds: feed.kinds.clone(),
            interval: feed.interval,
            max_backlog: feed.max_backlog,
            remote_timeout: self.remote_timeout,
            ..FeedConfig::default()
        })
    }
}

/// `tokio::time::interval` panics on a zero period, so zero is refused here.
fn feed_interval(raw: Option<String>) -> anyhow::Result<Duration> {
    let secs = parse_or(raw, "HEARTH_FEED_INTERVAL_SECS", 1800u64)?;
    if secs == 0 {
        bail!("HEARTH_FEED_INTERVAL_SECS must be at least 1");
    }
    Ok(Duration::from_secs(secs))
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number, got {value:?}")),
        None => Ok(default),
    }
}
