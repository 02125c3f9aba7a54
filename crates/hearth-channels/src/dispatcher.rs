//! Event dispatcher: routes gateway events into the reconciliation core.
//!
//! Every gateway event is handled on its own task, so a slow remote call in
//! one handler never holds up the gateway reader. Ordering between handlers
//! that touch the same owner or binding is the core's job (keyed locks).
//!
//! ## Commands
//!
//! `!room show|hide`, `!room grant`, `!room limit`, `!jam`, `!help`, and the
//! admin-only `!bind`, `!unbind`, `!feed preview`.

use std::sync::Arc;
use std::time::Duration;

use hearth_core::{
    bounded, Announcer, BindingSynchronizer, CoreError, CreateOutcome, FeedPoller, InMemoryOwnership,
    JsonFileStore, KvStore, MembershipChange, MessageSink, RoomManager, RunMode, SignalOutcome,
    TeardownOutcome, spawn_feed_loop,
};
use hearth_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::commands::{parse_command, BotCommand, HELP_TEXT};
use crate::config::{is_user_allowed, ChannelsConfig};
use crate::discord::DiscordRest;
use crate::feed_http::JsonFeedSource;
use crate::gateway::{CommandMessage, Gateway, GatewayEvent};
use crate::voice::VoiceStateCache;

pub struct Engine {
    rooms: RoomManager,
    bindings: BindingSynchronizer,
    announcer: Announcer,
    feed: Option<Arc<FeedPoller>>,
    replies: Arc<dyn MessageSink>,
    admin_users: Vec<String>,
    remote_timeout: Duration,
}

impl Engine {
    pub fn new(
        rooms: RoomManager,
        bindings: BindingSynchronizer,
        announcer: Announcer,
        replies: Arc<dyn MessageSink>,
        admin_users: Vec<String>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            rooms,
            bindings,
            announcer,
            feed: None,
            replies,
            admin_users,
            remote_timeout,
        }
    }

    pub fn with_feed(mut self, feed: Arc<FeedPoller>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn feed(&self) -> Option<&Arc<FeedPoller>> {
        self.feed.as_ref()
    }

    pub async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Membership(change) => self.on_membership(&change).await,
            GatewayEvent::Signal(signal) => match self.bindings.on_signal(&signal).await {
                Ok(SignalOutcome::Applied { effect_id } | SignalOutcome::Revoked { effect_id }) => {
                    info!(
                        actor_id = %signal.actor_id,
                        trigger_id = %signal.trigger_id,
                        effect_id = %effect_id,
                        direction = ?signal.direction,
                        "binding signal handled"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(
                    actor_id = %signal.actor_id,
                    context_id = %signal.context_id,
                    trigger_id = %signal.trigger_id,
                    signal_key = %signal.signal_key,
                    code = err.code(),
                    "binding signal failed: {err}"
                ),
            },
            GatewayEvent::Command(msg) => {
                let Some(reply) = self.handle_command(&msg).await else {
                    return;
                };
                if let Err(err) = bounded(
                    self.remote_timeout,
                    self.replies.send_item(&msg.channel_id, &reply),
                )
                .await
                {
                    warn!(context_id = %msg.channel_id, "command reply failed: {err}");
                }
            }
        }
    }

    async fn on_membership(&self, change: &MembershipChange) {
        let outcome = self.rooms.on_membership_changed(change).await;

        if let Some(Ok(TeardownOutcome::Deleted { owner_id } | TeardownOutcome::AlreadyGone { owner_id })) =
            &outcome.teardown
        {
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "room.torn_down",
                    component: "rooms",
                    actor_id: Some(owner_id),
                    resource_id: change.departed(),
                    status: Some("ok"),
                    ..Default::default()
                },
            );
        }
        match &outcome.create {
            Some(Ok(CreateOutcome::Created { room_id, moved })) => emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "room.created",
                    component: "rooms",
                    actor_id: Some(&change.actor_id),
                    resource_id: Some(room_id),
                    status: Some(if *moved { "ok" } else { "not_moved" }),
                    ..Default::default()
                },
            ),
            Some(Err(err)) => emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "room.create_failed",
                    component: "rooms",
                    actor_id: Some(&change.actor_id),
                    context_id: change.entered(),
                    status: Some("failed"),
                    error_code: Some(err.code()),
                    ..Default::default()
                },
            ),
            _ => {}
        }

        self.announcer.on_membership_changed(change).await;
    }

    /// Runs a `!` command and returns the reply text. `None` for anything
    /// that is not one of ours.
    pub async fn handle_command(&self, msg: &CommandMessage) -> Option<String> {
        let command = parse_command(&msg.content)?;
        if command.is_admin_only() && !is_user_allowed(&msg.author_id, &self.admin_users) {
            warn!(actor_id = %msg.author_id, "admin command refused");
            return Some("⛔ That command is for admins only.".to_string());
        }
        let actor = msg.author_id.as_str();

        let reply = match command {
            BotCommand::Help => HELP_TEXT.to_string(),
            BotCommand::Usage(usage) => format!("Usage: {usage}"),
            BotCommand::RoomVisibility { visible } => {
                match self.rooms.set_visibility(actor, visible).await {
                    Ok(_) if visible => "👀 Your room is visible again.".to_string(),
                    Ok(_) => "🙈 Your room is hidden.".to_string(),
                    Err(err) => failure_reply(actor, &err),
                }
            }
            BotCommand::RoomGrant { grantees, access } => {
                match self.rooms.grant_access(actor, &grantees, access).await {
                    Ok(granted) if granted.is_empty() => {
                        "Nobody new to let in.".to_string()
                    }
                    Ok(granted) => {
                        let names: Vec<String> =
                            granted.iter().map(|id| format!("<@{id}>")).collect();
                        format!("✅ Let {} into your room.", names.join(", "))
                    }
                    Err(err) => failure_reply(actor, &err),
                }
            }
            BotCommand::RoomLimit { limit } => match self.rooms.set_capacity(actor, limit).await {
                Ok(_) if limit == 0 => "✅ Your room has no member cap.".to_string(),
                Ok(_) => format!("✅ Your room is capped at {limit}."),
                Err(err) => failure_reply(actor, &err),
            },
            BotCommand::Jam { link } => {
                match self.announcer.share_link(actor, &link, &msg.channel_id).await {
                    Ok(()) => {
                        emit_event(
                            Level::INFO,
                            ProcessKind::Engine,
                            ObservabilityEvent {
                                event: "jam.shared",
                                component: "announce",
                                actor_id: Some(actor),
                                context_id: Some(&msg.channel_id),
                                detail: Some(&redact_text(&link)),
                                ..Default::default()
                            },
                        );
                        // the shared link is the reply
                        return None;
                    }
                    Err(err) => failure_reply(actor, &err),
                }
            }
            BotCommand::Bind {
                context_id,
                trigger_id,
                signal_key,
                effect_id,
            } => match self
                .bindings
                .add_binding(&context_id, &trigger_id, &signal_key, &effect_id)
                .await
            {
                Ok(outcome) => {
                    emit_event(
                        Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "binding.added",
                            component: "bindings",
                            actor_id: Some(actor),
                            resource_id: Some(&effect_id),
                            context_id: Some(&context_id),
                            status: Some(if outcome.registration_error.is_some() {
                                "unregistered"
                            } else {
                                "ok"
                            }),
                            ..Default::default()
                        },
                    );
                    let mut reply = format!("✅ Reacting with {signal_key} now grants <@&{effect_id}>.");
                    if let Some(previous) = outcome.replaced {
                        reply.push_str(&format!(" (was <@&{previous}>)"));
                    }
                    if outcome.registration_error.is_some() {
                        reply.push_str("\n⚠️ I couldn't add the reaction myself; add it by hand.");
                    }
                    reply
                }
                Err(err) => failure_reply(actor, &err),
            },
            BotCommand::Unbind {
                context_id,
                trigger_id,
                signal_key,
            } => match self
                .bindings
                .remove_binding(&context_id, &trigger_id, &signal_key)
                .await
            {
                Ok(effect_id) => {
                    emit_event(
                        Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "binding.removed",
                            component: "bindings",
                            actor_id: Some(actor),
                            resource_id: Some(&effect_id),
                            context_id: Some(&context_id),
                            status: Some("ok"),
                            ..Default::default()
                        },
                    );
                    format!("🗑️ {signal_key} no longer grants <@&{effect_id}>.")
                }
                Err(err) => failure_reply(actor, &err),
            },
            BotCommand::FeedPreview => match &self.feed {
                None => "Feed polling is not configured.".to_string(),
                Some(feed) => match feed.run_cycle(RunMode::Preview).await {
                    Ok(report) if report.delivered.is_empty() && report.failed.is_empty() => {
                        "Nothing in the feed to preview.".to_string()
                    }
                    Ok(report) => format!(
                        "👀 Previewed {} item(s); the feed position was not changed.",
                        report.delivered.len()
                    ),
                    Err(err) => failure_reply(actor, &err),
                },
            },
        };
        Some(reply)
    }
}

fn failure_reply(actor_id: &str, err: &CoreError) -> String {
    match err {
        CoreError::Store(_) | CoreError::RemoteFatal { .. } | CoreError::RemoteTransient { .. } => {
            error!(actor_id, code = err.code(), "command failed: {err}");
        }
        _ => {}
    }
    err.user_message()
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Builds the feed poller when a feed is configured.
pub fn build_feed_poller(
    config: &ChannelsConfig,
    store: Arc<dyn KvStore>,
    sink: Arc<dyn MessageSink>,
) -> anyhow::Result<Option<Arc<FeedPoller>>> {
    let (Some(section), Some(feed_config)) = (config.feed.as_ref(), config.to_feed_config()) else {
        return Ok(None);
    };
    let source = JsonFeedSource::new(&section.url, config.remote_timeout)?;
    Ok(Some(Arc::new(FeedPoller::new(
        feed_config,
        Arc::new(source),
        sink,
        store,
    ))))
}

/// Wires the core to Discord and starts the gateway supervisor and the feed
/// loop. Returns a `JoinSet` that ends once `cancel` fires.
pub async fn start_engine(
    config: ChannelsConfig,
    cancel: CancellationToken,
) -> anyhow::Result<JoinSet<()>> {
    let voice = Arc::new(VoiceStateCache::new());
    let rest = Arc::new(DiscordRest::new(
        config.discord.bot_token.clone(),
        config.discord.guild_id.clone(),
        voice.clone(),
        config.remote_timeout,
    )?);
    let gateway = Arc::new(Gateway::new(
        config.discord.bot_token.clone(),
        config.discord.guild_id.clone(),
        voice,
    ));
    if gateway.self_id().is_empty() {
        warn!("could not read the bot id from the token; own reactions will not be filtered by id");
    }

    let store: Arc<dyn KvStore> = Arc::new(JsonFileStore::new(&config.state_dir).await?);
    info!(state_dir = %config.state_dir.display(), "state store opened");

    let rooms = RoomManager::new(
        config.to_room_config(),
        rest.clone(),
        Arc::new(InMemoryOwnership::new()),
    );
    let bindings = BindingSynchronizer::load(store.clone(), rest.clone(), gateway.self_id())
        .await?
        .with_remote_timeout(config.remote_timeout);
    let announcer = Announcer::new(config.to_announce_config(), rest.clone());

    let mut engine = Engine::new(
        rooms,
        bindings,
        announcer,
        rest.clone(),
        config.admin_users.clone(),
        config.remote_timeout,
    );
    if let Some(poller) = build_feed_poller(&config, store, rest.clone())? {
        engine = engine.with_feed(poller);
    }
    let engine = Arc::new(engine);

    let mut set = JoinSet::new();
    if let Some(poller) = engine.feed().cloned() {
        info!(feed_id = poller.feed_id(), interval_secs = poller.interval().as_secs(), "feed loop started");
        let handle = spawn_feed_loop(poller, cancel.clone());
        set.spawn(async move {
            if let Err(e) = handle.await {
                error!("feed loop panicked: {e}");
            }
        });
    }
    set.spawn(supervise(gateway, rest, engine, cancel));
    info!("hearth: Discord listener started");

    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "engine.started",
            component: "dispatcher",
            context_id: Some(&config.discord.guild_id),
            status: Some("ok"),
            ..Default::default()
        },
    );
    Ok(set)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Runs the gateway listener with exponential-backoff restart on failure.
async fn supervise(
    gateway: Arc<Gateway>,
    rest: Arc<DiscordRest>,
    engine: Arc<Engine>,
    cancel: CancellationToken,
) {
    let mut backoff_secs: u64 = 1;
    loop {
        let (tx, mut rx) = mpsc::channel::<GatewayEvent>(256);

        let gateway_listen = gateway.clone();
        let listen_handle = tokio::spawn(async move {
            if let Err(e) = gateway_listen.listen(tx).await {
                error!("gateway listener error: {e}");
            }
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    listen_handle.abort();
                    info!("hearth: Discord listener stopped");
                    return;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        engine.handle_event(event).await;
                    });
                }
            }
        }

        listen_handle.abort();

        if rest.health_check().await {
            backoff_secs = 1;
        } else {
            warn!("Discord unhealthy, reconnecting in {backoff_secs}s");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(60);
        }
    }
}
