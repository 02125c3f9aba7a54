//! Discord Gateway reader.
//!
//! Connects to the Gateway WebSocket, sends an Identify payload, maintains a
//! heartbeat loop, and turns the dispatches hearth cares about into
//! [`GatewayEvent`]s. Voice state is written to the shared
//! [`VoiceStateCache`] before the matching event is sent on, so handlers
//! always see occupancy at least as fresh as their own event.

use std::sync::Arc;
use std::time::Duration;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use hearth_core::{MembershipChange, SignalDirection, SignalEvent};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::discord::DISCORD_API;
use crate::voice::VoiceStateCache;

/// GUILDS | GUILD_VOICE_STATES | GUILD_MESSAGES | GUILD_MESSAGE_REACTIONS | MESSAGE_CONTENT
pub const GATEWAY_INTENTS: u64 = 1 | (1 << 7) | (1 << 9) | (1 << 10) | (1 << 15);

/// Prefix that marks a chat message as a bot command.
pub const COMMAND_PREFIX: char = '!';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub author_id: String,
    pub channel_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Membership(MembershipChange),
    Signal(SignalEvent),
    Command(CommandMessage),
}

// ---------------------------------------------------------------------------
// Token parsing
// ---------------------------------------------------------------------------

/// Bot tokens carry the id segment unpadded, but padded input is accepted too.
const TOKEN_SEGMENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn base64_decode(input: &str) -> Option<String> {
    let bytes = TOKEN_SEGMENT.decode(input).ok()?;
    String::from_utf8(bytes).ok()
}

/// The first segment of a bot token is the bot's user id in base64.
pub fn bot_user_id_from_token(token: &str) -> Option<String> {
    let part = token.split('.').next()?;
    base64_decode(part).filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

// ---------------------------------------------------------------------------
// Dispatch translation
// ---------------------------------------------------------------------------

/// `name` for unicode emoji, `name:id` for custom ones (the form the reaction
/// endpoints accept).
pub fn emoji_key(emoji: &Value) -> Option<String> {
    let name = emoji.get("name").and_then(Value::as_str)?;
    match emoji.get("id").and_then(Value::as_str) {
        Some(id) => Some(format!("{name}:{id}")),
        None => Some(name.to_string()),
    }
}

fn display_name(member: &Value) -> Option<String> {
    member
        .get("nick")
        .and_then(Value::as_str)
        .or_else(|| member["user"]["global_name"].as_str())
        .or_else(|| member["user"]["username"].as_str())
        .map(str::to_string)
}

pub struct Gateway {
    bot_token: String,
    guild_id: String,
    self_id: String,
    voice: Arc<VoiceStateCache>,
}

impl Gateway {
    pub fn new(bot_token: String, guild_id: String, voice: Arc<VoiceStateCache>) -> Self {
        let self_id = bot_user_id_from_token(&bot_token).unwrap_or_default();
        Self {
            bot_token,
            guild_id,
            self_id,
            voice,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn in_guild(&self, d: &Value) -> bool {
        d.get("guild_id").and_then(Value::as_str) == Some(self.guild_id.as_str())
    }

    /// Applies a dispatch (`op` 0) to local state and returns the event it
    /// produces, if any.
    pub fn translate_dispatch(&self, t: &str, d: &Value) -> Option<GatewayEvent> {
        match t {
            "GUILD_CREATE" => {
                if d.get("id").and_then(Value::as_str) == Some(self.guild_id.as_str()) {
                    let states = d
                        .get("voice_states")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    self.voice.seed(states);
                    info!(voice_states = states.len(), "Discord: guild state seeded");
                }
                None
            }
            "VOICE_STATE_UPDATE" => {
                if !self.in_guild(d) {
                    return None;
                }
                let actor_id = d.get("user_id").and_then(Value::as_str)?;
                let to_context = d.get("channel_id").and_then(Value::as_str);
                let from_context = self.voice.apply(actor_id, to_context);
                // mute/deafen/stream toggles keep the channel
                if from_context.as_deref() == to_context {
                    return None;
                }
                let member = d.get("member").unwrap_or(&Value::Null);
                Some(GatewayEvent::Membership(MembershipChange {
                    actor_id: actor_id.to_string(),
                    actor_name: display_name(member),
                    from_context,
                    to_context: to_context.map(str::to_string),
                    is_system: member["user"]["bot"].as_bool().unwrap_or(false)
                        || actor_id == self.self_id,
                }))
            }
            "MESSAGE_REACTION_ADD" | "MESSAGE_REACTION_REMOVE" => {
                if !self.in_guild(d) {
                    return None;
                }
                let direction = if t == "MESSAGE_REACTION_ADD" {
                    SignalDirection::Raised
                } else {
                    SignalDirection::Withdrawn
                };
                let actor_id = d.get("user_id").and_then(Value::as_str)?;
                Some(GatewayEvent::Signal(SignalEvent {
                    direction,
                    context_id: d.get("channel_id").and_then(Value::as_str)?.to_string(),
                    trigger_id: d.get("message_id").and_then(Value::as_str)?.to_string(),
                    signal_key: emoji_key(d.get("emoji")?)?,
                    actor_id: actor_id.to_string(),
                    // removals carry no member object
                    actor_is_system: d["member"]["user"]["bot"].as_bool().unwrap_or(false)
                        || actor_id == self.self_id,
                }))
            }
            "MESSAGE_CREATE" => {
                if !self.in_guild(d) || d["author"]["bot"].as_bool().unwrap_or(false) {
                    return None;
                }
                let author_id = d["author"]["id"].as_str()?;
                if author_id == self.self_id {
                    return None;
                }
                let content = d["content"].as_str()?.trim();
                if !content.starts_with(COMMAND_PREFIX) {
                    return None;
                }
                Some(GatewayEvent::Command(CommandMessage {
                    author_id: author_id.to_string(),
                    channel_id: d["channel_id"].as_str()?.to_string(),
                    content: content.to_string(),
                }))
            }
            _ => None,
        }
    }

    fn http_client(&self) -> anyhow::Result<Client> {
        Ok(Client::builder().timeout(Duration::from_secs(15)).build()?)
    }

    /// Runs one gateway session. Returns `Ok` when Discord closes or asks for a
    /// reconnect; the caller restarts it.
    #[allow(clippy::too_many_lines)]
    pub async fn listen(&self, tx: mpsc::Sender<GatewayEvent>) -> anyhow::Result<()> {
        // Fetch gateway URL
        let gw_resp: Value = self
            .http_client()?
            .get(format!("{DISCORD_API}/gateway/bot"))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let gw_url = gw_resp
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("wss://gateway.discord.gg");

        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        info!("Discord: connecting to gateway {ws_url}");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Read Hello (op 10)
        let hello = read
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("Discord: no Hello received"))??;
        let hello_data: Value = serde_json::from_str(&hello.to_string())?;
        let heartbeat_interval = hello_data
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(Value::as_u64)
            .unwrap_or(41_250);

        let identify = json!({
            "op": 2,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "hearth",
                    "device": "hearth"
                }
            }
        });
        write.send(Message::Text(identify.to_string())).await?;
        info!("Discord: identified, heartbeat every {heartbeat_interval}ms");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sequence: Option<i64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = json!({"op": 1, "d": sequence});
                    if write.send(Message::Text(hb.to_string())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(frame))) => {
                            warn!("Discord: gateway closed: {frame:?}");
                            break;
                        }
                        None => break,
                        Some(Err(err)) => return Err(err.into()),
                        _ => continue,
                    };

                    let Ok(event) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };

                    if let Some(s) = event.get("s").and_then(Value::as_i64) {
                        sequence = Some(s);
                    }

                    match event.get("op").and_then(Value::as_u64).unwrap_or(0) {
                        0 => {}
                        1 => {
                            // Server requests immediate heartbeat
                            let hb = json!({"op": 1, "d": sequence});
                            if write.send(Message::Text(hb.to_string())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        7 => {
                            warn!("Discord: Reconnect (op 7), restarting");
                            break;
                        }
                        9 => {
                            warn!("Discord: Invalid Session (op 9), restarting");
                            break;
                        }
                        _ => continue,
                    }

                    let t = event.get("t").and_then(Value::as_str).unwrap_or("");
                    let Some(d) = event.get("d") else { continue };
                    let Some(gateway_event) = self.translate_dispatch(t, d) else {
                        continue;
                    };
                    debug!(dispatch = t, "Discord: forwarding event");
                    if tx.send(gateway_event).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
