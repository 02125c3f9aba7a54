//! Reaction-role bindings.
//!
//! A binding ties `(channel, message, emoji)` to a role. The table is cached
//! in memory and written through to the durable store on every change; the
//! cache is only replaced after the write succeeds, so a failed write leaves
//! both copies on the previous state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::keyed_lock::KeyedLocks;
use crate::remote::{bounded, retry_transient, SignalControl, DEFAULT_REMOTE_TIMEOUT};
use crate::events::{SignalDirection, SignalEvent};
use crate::store::{read_record, write_record, KvStore};

pub const BINDINGS_KEY: &str = "bindings";
const BINDINGS_RECORD_VERSION: u32 = 1;
const REGISTER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    pub context_id: String,
    pub trigger_id: String,
    pub signal_key: String,
}

impl BindingKey {
    pub fn new(
        context_id: impl Into<String>,
        trigger_id: impl Into<String>,
        signal_key: impl Into<String>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            trigger_id: trigger_id.into(),
            signal_key: signal_key.into(),
        }
    }

    fn lock_key(&self) -> String {
        format!("{}/{}/{}", self.context_id, self.trigger_id, self.signal_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingEntry {
    pub context_id: String,
    pub trigger_id: String,
    pub signal_key: String,
    pub effect_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl BindingEntry {
    pub fn key(&self) -> BindingKey {
        BindingKey::new(&self.context_id, &self.trigger_id, &self.signal_key)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BindingTableRecord {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    bindings: Vec<BindingEntry>,
}

#[derive(Debug)]
pub struct AddBindingOutcome {
    /// Effect that was bound to the same key before, if any.
    pub replaced: Option<String>,
    /// Set when the reaction could not be placed on the message. The binding
    /// is stored regardless.
    pub registration_error: Option<CoreError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Our own reaction, or another bot's.
    Ignored,
    Unbound,
    Applied { effect_id: String },
    Revoked { effect_id: String },
}

type BindingTable = BTreeMap<BindingKey, BindingEntry>;

pub struct BindingSynchronizer {
    store: Arc<dyn KvStore>,
    control: Arc<dyn SignalControl>,
    self_id: String,
    remote_timeout: Duration,
    table: Mutex<BindingTable>,
    locks: KeyedLocks,
}

impl BindingSynchronizer {
    /// Loads the persisted table. `self_id` is the bot's own user id; its
    /// reactions are never treated as user signals.
    pub async fn load(
        store: Arc<dyn KvStore>,
        control: Arc<dyn SignalControl>,
        self_id: impl Into<String>,
    ) -> CoreResult<Self> {
        let record: BindingTableRecord = read_record(store.as_ref(), BINDINGS_KEY)
            .await?
            .unwrap_or_default();
        let table: BindingTable = record
            .bindings
            .into_iter()
            .map(|entry| (entry.key(), entry))
            .collect();
        info!(count = table.len(), "loaded signal bindings");
        Ok(Self {
            store,
            control,
            self_id: self_id.into(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            table: Mutex::new(table),
            locks: KeyedLocks::new(),
        })
    }

    pub fn with_remote_timeout(mut self, remote_timeout: Duration) -> Self {
        self.remote_timeout = remote_timeout;
        self
    }

    pub async fn bindings(&self) -> Vec<BindingEntry> {
        self.table.lock().await.values().cloned().collect()
    }

    pub async fn lookup(&self, key: &BindingKey) -> Option<String> {
        self.table
            .lock()
            .await
            .get(key)
            .map(|entry| entry.effect_id.clone())
    }

    pub async fn add_binding(
        &self,
        context_id: &str,
        trigger_id: &str,
        signal_key: &str,
        effect_id: &str,
    ) -> CoreResult<AddBindingOutcome> {
        let key = BindingKey::new(context_id, trigger_id, signal_key);
        let _guard = self.locks.lock(&key.lock_key()).await;

        let control = self.control.clone();
        let registration = retry_transient(REGISTER_ATTEMPTS, self.remote_timeout, || {
            let control = control.clone();
            async move {
                control
                    .register_signal(context_id, trigger_id, signal_key)
                    .await
            }
        })
        .await
        .err()
        .map(|err| {
            warn!(
                context_id,
                trigger_id, signal_key, "could not place reaction for binding: {err}"
            );
            CoreError::remote("register_signal", err)
        });

        let entry = BindingEntry {
            context_id: context_id.to_string(),
            trigger_id: trigger_id.to_string(),
            signal_key: signal_key.to_string(),
            effect_id: effect_id.to_string(),
            created_at: Some(Utc::now()),
        };

        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let replaced = next.insert(key, entry).map(|prev| prev.effect_id);
        self.persist(&next).await?;
        *table = next;

        info!(
            context_id,
            trigger_id,
            signal_key,
            effect_id,
            replaced = replaced.as_deref().unwrap_or(""),
            "binding saved"
        );
        Ok(AddBindingOutcome {
            replaced,
            registration_error: registration,
        })
    }

    /// Returns the effect that was unbound.
    pub async fn remove_binding(
        &self,
        context_id: &str,
        trigger_id: &str,
        signal_key: &str,
    ) -> CoreResult<String> {
        let key = BindingKey::new(context_id, trigger_id, signal_key);
        let _guard = self.locks.lock(&key.lock_key()).await;

        if !self.table.lock().await.contains_key(&key) {
            return Err(CoreError::BindingNotFound {
                context_id: context_id.to_string(),
                trigger_id: trigger_id.to_string(),
                signal_key: signal_key.to_string(),
            });
        }

        let removed = {
            let mut table = self.table.lock().await;
            let mut next = table.clone();
            let removed = next
                .remove(&key)
                .map(|entry| entry.effect_id)
                .unwrap_or_default();
            self.persist(&next).await?;
            *table = next;
            removed
        };

        // The stored table is authoritative; a leftover reaction is harmless.
        if let Err(err) = bounded(
            self.remote_timeout,
            self.control
                .unregister_signal(context_id, trigger_id, signal_key),
        )
        .await
        {
            warn!(
                context_id,
                trigger_id, signal_key, "could not remove reaction for binding: {err}"
            );
        }

        info!(context_id, trigger_id, signal_key, effect_id = %removed, "binding removed");
        Ok(removed)
    }

    pub async fn on_signal(&self, event: &SignalEvent) -> CoreResult<SignalOutcome> {
        if event.actor_id == self.self_id || event.actor_is_system {
            return Ok(SignalOutcome::Ignored);
        }

        let key = BindingKey::new(&event.context_id, &event.trigger_id, &event.signal_key);
        let Some(effect_id) = self.lookup(&key).await else {
            debug!(
                context_id = %event.context_id,
                trigger_id = %event.trigger_id,
                signal_key = %event.signal_key,
                "signal has no binding"
            );
            return Ok(SignalOutcome::Unbound);
        };

        match event.direction {
            SignalDirection::Raised => {
                bounded(
                    self.remote_timeout,
                    self.control.apply_effect(&event.actor_id, &effect_id),
                )
                .await
                .map_err(|err| CoreError::remote("apply_effect", err))?;
                info!(actor_id = %event.actor_id, effect_id = %effect_id, "effect applied");
                Ok(SignalOutcome::Applied { effect_id })
            }
            SignalDirection::Withdrawn => {
                bounded(
                    self.remote_timeout,
                    self.control.revoke_effect(&event.actor_id, &effect_id),
                )
                .await
                .map_err(|err| CoreError::remote("revoke_effect", err))?;
                info!(actor_id = %event.actor_id, effect_id = %effect_id, "effect revoked");
                Ok(SignalOutcome::Revoked { effect_id })
            }
        }
    }

    async fn persist(&self, table: &BindingTable) -> CoreResult<()> {
        let record = BindingTableRecord {
            version: BINDINGS_RECORD_VERSION,
            bindings: table.values().cloned().collect(),
        };
        write_record(self.store.as_ref(), BINDINGS_KEY, &record).await?;
        Ok(())
    }
}
