//! Ephemeral per-user voice rooms.
//!
//! Joining the spawn channel gives the member a room of their own; the room
//! is deleted once the last occupant leaves. Every step that reads the
//! owner→room mapping and then awaits a remote call runs under the owner's
//! key lock, and teardown re-reads live occupancy right before deleting, so
//! duplicate or interleaved gateway events cannot double-create or delete a
//! room somebody just walked into.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult, RemoteError};
use crate::events::MembershipChange;
use crate::keyed_lock::KeyedLocks;
use crate::remote::{bounded, AccessLevel, RoomControl, DEFAULT_REMOTE_TIMEOUT};

pub const MAX_ROOM_CAPACITY: i64 = 99;
const MAX_ROOM_NAME_CHARS: usize = 100;

/// Owner→room mapping. At most one room per owner, and a room id appears at
/// most once.
pub trait OwnershipStore: Send + Sync {
    fn get(&self, owner_id: &str) -> Option<String>;
    fn owner_of(&self, room_id: &str) -> Option<String>;
    /// Returns `false` without changing anything if either side is taken.
    fn put_if_absent(&self, owner_id: &str, room_id: &str) -> bool;
    /// Removes the entry only if it still maps `owner_id` to `room_id`.
    fn remove_if(&self, owner_id: &str, room_id: &str) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct OwnershipMaps {
    by_owner: HashMap<String, String>,
    by_room: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryOwnership {
    maps: RwLock<OwnershipMaps>,
}

impl InMemoryOwnership {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnershipStore for InMemoryOwnership {
    fn get(&self, owner_id: &str) -> Option<String> {
        self.maps.read().by_owner.get(owner_id).cloned()
    }

    fn owner_of(&self, room_id: &str) -> Option<String> {
        self.maps.read().by_room.get(room_id).cloned()
    }

    fn put_if_absent(&self, owner_id: &str, room_id: &str) -> bool {
        let mut maps = self.maps.write();
        if maps.by_owner.contains_key(owner_id) || maps.by_room.contains_key(room_id) {
            return false;
        }
        maps.by_owner
            .insert(owner_id.to_string(), room_id.to_string());
        maps.by_room.insert(room_id.to_string(), owner_id.to_string());
        true
    }

    fn remove_if(&self, owner_id: &str, room_id: &str) -> bool {
        let mut maps = self.maps.write();
        if maps.by_owner.get(owner_id).map(String::as_str) != Some(room_id) {
            return false;
        }
        maps.by_owner.remove(owner_id);
        maps.by_room.remove(room_id);
        true
    }

    fn len(&self) -> usize {
        self.maps.read().by_owner.len()
    }
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Joining this context spawns a room. `None` disables spawning.
    pub spawn_context_id: Option<String>,
    /// Category the rooms are created under.
    pub parent_id: Option<String>,
    /// `{owner}` is replaced by the owner's display name.
    pub name_template: String,
    pub remote_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            spawn_context_id: None,
            parent_id: None,
            name_template: "{owner}'s room".to_string(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    AlreadyOwned { room_id: String },
    Created { room_id: String, moved: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Not a room this manager tracks (or the mapping moved on meanwhile).
    Untracked,
    /// Someone is still inside at re-check time.
    Occupied { occupants: usize },
    Deleted { owner_id: String },
    /// The room vanished remotely; the mapping was cleared.
    AlreadyGone { owner_id: String },
}

#[derive(Debug, Default)]
pub struct MembershipOutcome {
    pub teardown: Option<CoreResult<TeardownOutcome>>,
    pub create: Option<CoreResult<CreateOutcome>>,
}

pub struct RoomManager {
    config: RoomConfig,
    control: Arc<dyn RoomControl>,
    ownership: Arc<dyn OwnershipStore>,
    locks: KeyedLocks,
}

impl RoomManager {
    pub fn new(
        config: RoomConfig,
        control: Arc<dyn RoomControl>,
        ownership: Arc<dyn OwnershipStore>,
    ) -> Self {
        Self {
            config,
            control,
            ownership,
            locks: KeyedLocks::new(),
        }
    }

    pub fn room_of(&self, owner_id: &str) -> Option<String> {
        self.ownership.get(owner_id)
    }

    pub fn tracked_rooms(&self) -> usize {
        self.ownership.len()
    }

    /// Reacts to a voice move. A room the actor left is torn down first (if
    /// empty), then a room is created if they entered the spawn channel.
    pub async fn on_membership_changed(&self, change: &MembershipChange) -> MembershipOutcome {
        let mut outcome = MembershipOutcome::default();

        if let Some(from) = change.departed() {
            if self.ownership.owner_of(from).is_some() {
                let result = self.teardown_if_empty(from).await;
                if let Err(err) = &result {
                    warn!(
                        resource_id = from,
                        actor_id = %change.actor_id,
                        code = err.code(),
                        "room teardown failed: {err}"
                    );
                }
                outcome.teardown = Some(result);
            }
        }

        let entered_spawn = match (change.entered(), &self.config.spawn_context_id) {
            (Some(to), Some(spawn)) => to == spawn,
            _ => false,
        };
        if entered_spawn && !change.is_system {
            let result = self
                .create_if_absent(&change.actor_id, change.display_name())
                .await;
            if let Err(err) = &result {
                warn!(
                    owner_id = %change.actor_id,
                    code = err.code(),
                    "room creation failed: {err}"
                );
            }
            outcome.create = Some(result);
        }

        outcome
    }

    pub async fn create_if_absent(
        &self,
        owner_id: &str,
        display_name: &str,
    ) -> CoreResult<CreateOutcome> {
        let _guard = self.locks.lock(owner_id).await;

        if let Some(room_id) = self.ownership.get(owner_id) {
            return Ok(CreateOutcome::AlreadyOwned { room_id });
        }

        let name = self.room_name(display_name);
        let room_id = bounded(
            self.config.remote_timeout,
            self.control
                .create_room(self.config.parent_id.as_deref(), &name, owner_id),
        )
        .await
        .map_err(|err| CoreError::remote("create_room", err))?;

        if !self.ownership.put_if_absent(owner_id, &room_id) {
            // Only reachable if the platform handed back an id we already
            // track; leave the remote room alone rather than guess.
            warn!(owner_id, resource_id = %room_id, "room id already mapped, not recording");
            return Ok(CreateOutcome::AlreadyOwned { room_id });
        }
        info!(owner_id, resource_id = %room_id, name = %name, "room created");

        let moved = match bounded(
            self.config.remote_timeout,
            self.control.move_member(owner_id, &room_id),
        )
        .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    owner_id,
                    resource_id = %room_id,
                    "could not move owner into new room: {err}"
                );
                false
            }
        };

        Ok(CreateOutcome::Created { room_id, moved })
    }

    pub async fn teardown_if_empty(&self, room_id: &str) -> CoreResult<TeardownOutcome> {
        let Some(owner_id) = self.ownership.owner_of(room_id) else {
            return Ok(TeardownOutcome::Untracked);
        };
        let _guard = self.locks.lock(&owner_id).await;

        // The mapping may have changed while we waited for the lock.
        if self.ownership.get(&owner_id).as_deref() != Some(room_id) {
            return Ok(TeardownOutcome::Untracked);
        }

        let live = bounded(
            self.config.remote_timeout,
            self.control.occupant_count(room_id),
        )
        .await
        .map_err(|err| CoreError::remote("occupant_count", err))?;

        match live {
            Some(0) => {}
            Some(occupants) => return Ok(TeardownOutcome::Occupied { occupants }),
            None => {
                self.ownership.remove_if(&owner_id, room_id);
                info!(owner_id = %owner_id, resource_id = room_id, "room already gone, mapping cleared");
                return Ok(TeardownOutcome::AlreadyGone { owner_id });
            }
        }

        match bounded(self.config.remote_timeout, self.control.delete_room(room_id)).await {
            Ok(()) => {
                self.ownership.remove_if(&owner_id, room_id);
                info!(owner_id = %owner_id, resource_id = room_id, "empty room deleted");
                Ok(TeardownOutcome::Deleted { owner_id })
            }
            Err(RemoteError::Fatal(detail)) => {
                // Nothing more we can do with it; stop tracking.
                self.ownership.remove_if(&owner_id, room_id);
                Err(CoreError::RemoteFatal {
                    op: "delete_room",
                    detail,
                })
            }
            Err(err) => Err(CoreError::remote("delete_room", err)),
        }
    }

    pub async fn set_visibility(&self, owner_id: &str, visible: bool) -> CoreResult<String> {
        let _guard = self.locks.lock(owner_id).await;
        let room_id = self.owned_room(owner_id).await?;
        bounded(
            self.config.remote_timeout,
            self.control.set_default_access(&room_id, visible),
        )
        .await
        .map_err(|err| CoreError::remote("set_default_access", err))?;
        info!(owner_id, resource_id = %room_id, visible, "room visibility changed");
        Ok(room_id)
    }

    /// Adds every grantee to the room's allow-list. Re-granting is harmless.
    pub async fn grant_access(
        &self,
        owner_id: &str,
        grantee_ids: &[String],
        access: AccessLevel,
    ) -> CoreResult<Vec<String>> {
        let _guard = self.locks.lock(owner_id).await;
        let room_id = self.owned_room(owner_id).await?;

        let grantees: BTreeSet<&str> = grantee_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.is_empty() && *id != owner_id)
            .collect();

        let mut granted = Vec::with_capacity(grantees.len());
        for grantee in grantees {
            bounded(
                self.config.remote_timeout,
                self.control.set_allowlist_entry(&room_id, grantee, access),
            )
            .await
            .map_err(|err| CoreError::remote("set_allowlist_entry", err))?;
            granted.push(grantee.to_string());
        }
        info!(owner_id, resource_id = %room_id, count = granted.len(), "room access granted");
        Ok(granted)
    }

    pub async fn set_capacity(&self, owner_id: &str, limit: i64) -> CoreResult<String> {
        if !(0..=MAX_ROOM_CAPACITY).contains(&limit) {
            return Err(CoreError::InvalidRange {
                field: "limit",
                min: 0,
                max: MAX_ROOM_CAPACITY,
                value: limit,
            });
        }
        let _guard = self.locks.lock(owner_id).await;
        let room_id = self.owned_room(owner_id).await?;
        bounded(
            self.config.remote_timeout,
            self.control.set_capacity(&room_id, limit as u8),
        )
        .await
        .map_err(|err| CoreError::remote("set_capacity", err))?;
        info!(owner_id, resource_id = %room_id, limit, "room capacity changed");
        Ok(room_id)
    }

    /// Caller must hold the owner's key lock.
    async fn owned_room(&self, owner_id: &str) -> CoreResult<String> {
        let room_id = self
            .ownership
            .get(owner_id)
            .ok_or_else(|| CoreError::NotOwner {
                owner_id: owner_id.to_string(),
            })?;
        let exists = bounded(
            self.config.remote_timeout,
            self.control.room_exists(&room_id),
        )
        .await
        .map_err(|err| CoreError::remote("room_exists", err))?;
        if !exists {
            // Left in place; the next teardown check reconciles it.
            return Err(CoreError::ResourceMissing {
                resource_id: room_id,
            });
        }
        Ok(room_id)
    }

    fn room_name(&self, display_name: &str) -> String {
        self.config
            .name_template
            .replace("{owner}", display_name)
            .chars()
            .take(MAX_ROOM_NAME_CHARS)
            .collect()
    }
}
