use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hearth_channels::config::ChannelsConfig;
use hearth_channels::discord::DiscordRest;
use hearth_channels::dispatcher::{build_feed_poller, start_engine};
use hearth_channels::voice::VoiceStateCache;
use hearth_core::{JsonFileStore, KvStore, MessageSink, RemoteResult, RunMode};
use hearth_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hearth-engine")]
#[command(about = "Voice rooms, reaction roles and feed announcements for one Discord guild")]
struct Cli {
    /// Overrides HEARTH_STATE_DIR.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = 14)]
    log_retention_days: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to Discord and run until interrupted.
    Serve,
    /// Run one Preview feed cycle and print the report. Never moves the cursor.
    PreviewFeed {
        /// Print rendered items here instead of posting them to Discord.
        #[arg(long, default_value_t = false)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ChannelsConfig::from_env().context("loading HEARTH_* configuration")?;
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    match cli.command {
        Command::Serve => {
            let logs_dir = canonical_logs_dir_from_root(&config.state_dir);
            let (_log_guard, log_setup) =
                init_process_logging(ProcessKind::Engine, &logs_dir, cli.log_retention_days)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("engine logging initialized: {:?}", log_setup);
            serve(config).await?;
        }
        Command::PreviewFeed { print } => {
            let logs_dir = canonical_logs_dir_from_root(&config.state_dir);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Preview, &logs_dir, cli.log_retention_days)?;
            preview_feed(config, print).await?;
        }
    }

    Ok(())
}

async fn serve(config: ChannelsConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let mut tasks = start_engine(config, cancel.clone()).await?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            info!("shutdown requested");
        }
        Some(res) = tasks.join_next() => {
            if let Err(e) = res {
                warn!("engine task ended unexpectedly: {e}");
            }
        }
    }

    cancel.cancel();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("tasks still running after 10s, aborting");
        tasks.abort_all();
    }

    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "engine.stopped",
            component: "engine.main",
            status: Some("ok"),
            ..Default::default()
        },
    );
    Ok(())
}

/// Writes rendered items to stdout.
struct StdoutSink;

#[async_trait]
impl MessageSink for StdoutSink {
    async fn sink_exists(&self, _sink_id: &str) -> RemoteResult<bool> {
        Ok(true)
    }

    async fn send_item(&self, sink_id: &str, content: &str) -> RemoteResult<()> {
        println!("--- to {sink_id} ---\n{content}");
        Ok(())
    }
}

async fn preview_feed(config: ChannelsConfig, print: bool) -> anyhow::Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(JsonFileStore::new(&config.state_dir).await?);
    let sink: Arc<dyn MessageSink> = if print {
        Arc::new(StdoutSink)
    } else {
        Arc::new(DiscordRest::new(
            config.discord.bot_token.clone(),
            config.discord.guild_id.clone(),
            Arc::new(VoiceStateCache::new()),
            config.remote_timeout,
        )?)
    };
    let Some(poller) = build_feed_poller(&config, store, sink)? else {
        bail!("no feed configured: set HEARTH_FEED_URL and HEARTH_FEED_CHANNEL_ID");
    };

    let report = poller
        .run_cycle(RunMode::Preview)
        .await
        .map_err(|err| anyhow::anyhow!("preview cycle failed ({}): {err}", err.code()))?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Preview,
        ObservabilityEvent {
            event: "feed.previewed",
            component: "engine.main",
            feed_id: Some(&report.feed_id),
            status: Some(if report.failed.is_empty() { "ok" } else { "partial" }),
            ..Default::default()
        },
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
