//! Logging setup and lifecycle milestones for hearth processes.
//!
//! Each process writes compact lines to the console and JSON lines to
//! `<logs>/hearth.<process>.YYYY-MM-DD.jsonl`, rotated daily. Milestones go
//! through [`emit_event`] on the `hearth.obs` target so they can be grepped
//! out of the file without a schema.

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILE_STEM: &str = "hearth";
const FILE_EXT: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// The long-running gateway service.
    Engine,
    /// One-shot `preview-feed` runs.
    Preview,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Preview => "preview",
        }
    }

    /// `hearth.<process>`, shared by every daily file of this process.
    pub fn file_prefix(self) -> String {
        format!("{FILE_STEM}.{}", self.as_str())
    }
}

/// What [`init_process_logging`] set up, logged once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct LogSetup {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    /// 0 keeps files forever.
    pub retention_days: u64,
    /// Expired files deleted before the appender opened today's file.
    pub pruned_files: usize,
}

/// A lifecycle milestone worth a structured line in the JSONL log.
///
/// Entity ids are optional; fill in whichever ones the event touches so the
/// line can be correlated without replaying the gateway stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub actor_id: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub context_id: Option<&'a str>,
    pub feed_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replaces user-supplied text (links, message bodies) with its length and
/// a hash, enough to match repeats across lines.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// `tracing` needs the level as a constant, so the field list is spelled
// once here and stamped out per level.
macro_rules! obs_event {
    ($level:expr, $process:expr, $ev:expr) => {
        tracing::event!(
            target: "hearth.obs",
            $level,
            process = $process.as_str(),
            component = $ev.component,
            event = $ev.event,
            actor_id = $ev.actor_id.unwrap_or(""),
            resource_id = $ev.resource_id.unwrap_or(""),
            context_id = $ev.context_id.unwrap_or(""),
            feed_id = $ev.feed_id.unwrap_or(""),
            status = $ev.status.unwrap_or(""),
            error_code = $ev.error_code.unwrap_or(""),
            detail = $ev.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

/// Levels below INFO are logged at INFO; milestones are never debug noise.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_event!(Level::ERROR, process, event),
        Level::WARN => obs_event!(Level::WARN, process, event),
        _ => obs_event!(Level::INFO, process, event),
    }
}

/// Installs the global subscriber. A second call in the same process keeps
/// the first subscriber; the returned guard must live until shutdown or the
/// tail of the file log is lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LogSetup)> {
    fs::create_dir_all(logs_dir)?;
    let today = Utc::now().date_naive();
    let pruned_files = prune_expired_logs(logs_dir, process, retention_days, today)?;

    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(process.file_prefix())
        .filename_suffix(FILE_EXT)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init();

    Ok((
        guard,
        LogSetup {
            process,
            logs_dir: logs_dir.to_path_buf(),
            retention_days,
            pruned_files,
        },
    ))
}

/// Day stamped into a rolled file name, if `name` belongs to `process`.
fn log_file_date(name: &str, process: ProcessKind) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(&process.file_prefix())?
        .strip_prefix('.')?
        .strip_suffix(FILE_EXT)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

/// Deletes this process's daily files older than `retention_days` before
/// `today`. Files of other processes and unparseable names are left alone.
fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    // chrono panics on out-of-range durations; a century is "forever" here.
    let days = retention_days.min(36_500) as i64;
    let Some(oldest_kept) = today.checked_sub_signed(Duration::days(days)) else {
        return Ok(0);
    };

    let mut pruned = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| log_file_date(name, process))
            .is_some_and(|date| date < oldest_kept);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
