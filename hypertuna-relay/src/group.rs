//! Per-group projection of the signed-event stream.
//!
//! Each group (keyed by its public identifier) folds events into a
//! single consistent snapshot: metadata, admins, an ADDS/REMOVES
//! membership ledger, invites, join requests and the message log.
//! Application is idempotent (`seen` ids), snapshot kinds are monotone
//! by `created_at`, and the effective member set is
//! `{p | ADDS[p].ts > REMOVES[p].ts}` with no ordering sensitivity
//! beyond timestamps.
//!
//! Membership-change notifications are debounced: a change marks the
//! group dirty and a notification fires only after a quiescence window
//! with no further changes, and only when the new member set differs
//! from the last one emitted.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use hypertuna_sdk::crypto;
use hypertuna_sdk::event::{
    Event, KIND_GROUP_ADD_USER_9000, KIND_GROUP_ADMINS_39001, KIND_GROUP_CREATE_9007,
    KIND_GROUP_EDIT_METADATA_9002, KIND_GROUP_INVITE_9009, KIND_GROUP_JOIN_REQUEST_9021,
    KIND_GROUP_MEMBERS_39002, KIND_GROUP_METADATA_39000, KIND_GROUP_REMOVE_USER_9001,
    KIND_TEXT_NOTE_1, Role,
};
use hypertuna_sdk::events::{EventBus, GroupEvent};
use hypertuna_sdk::Keys;

use crate::auth::AuthTokenStore;

/// Default quiescence window before a members-changed notification.
pub const MEMBER_NOTIFY_DEBOUNCE: Duration = Duration::from_millis(300);

/// Group attributes carried by metadata snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMetadata {
    pub name: String,
    pub about: String,
    pub is_public: bool,
    pub is_open: bool,
    pub file_sharing: bool,
    pub swarm_id: Option<String>,
    pub transport_url: Option<String>,
    /// Timestamp of the snapshot this metadata came from. Monotone:
    /// older snapshots are dropped.
    pub created_at: u64,
}

/// A decrypted invite envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub group_id: String,
    pub inviter: String,
    pub transport_url: String,
    pub token: String,
    pub relay_id: String,
    pub is_public: bool,
    pub received_at: u64,
}

/// Invite envelope payload as carried in kind-9009 `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub transport_url: String,
    pub token: String,
    pub relay_id: String,
    #[serde(default)]
    pub is_public: bool,
}

/// One entry in the ADDS ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AddRecord {
    ts: u64,
    roles: Vec<Role>,
    /// Seeded from a 39002 snapshot rather than a targeted 9000. A
    /// targeted add at the same timestamp overwrites a snapshot seed,
    /// never vice versa.
    snapshot_seeded: bool,
}

impl AddRecord {
    /// Whether `other` should replace `self`.
    fn loses_to(&self, other: &AddRecord) -> bool {
        other.ts > self.ts
            || (other.ts == self.ts && self.snapshot_seeded && !other.snapshot_seeded)
    }
}

/// The projection state of one group.
#[derive(Debug, Default)]
pub struct GroupState {
    pub metadata: GroupMetadata,
    admins: HashMap<String, Vec<Role>>,
    adds: HashMap<String, AddRecord>,
    removes: HashMap<String, u64>,
    invites: HashMap<String, Invite>,
    join_requests: HashMap<String, Event>,
    messages: Vec<Event>,
    seen: HashSet<String>,
    admins_snapshot_ts: u64,
    members_snapshot_ts: u64,
}

impl GroupState {
    /// Effective member set: live adds, deduplicated, sorted.
    pub fn members(&self) -> Vec<String> {
        self.member_set().into_iter().collect()
    }

    fn member_set(&self) -> BTreeSet<String> {
        self.adds
            .iter()
            .filter(|(pubkey, add)| match self.removes.get(*pubkey) {
                Some(removed_ts) => add.ts > *removed_ts,
                None => true,
            })
            .map(|(pubkey, _)| pubkey.clone())
            .collect()
    }

    pub fn is_member(&self, pubkey: &str) -> bool {
        self.adds
            .get(pubkey)
            .is_some_and(|add| match self.removes.get(pubkey) {
                Some(removed_ts) => add.ts > *removed_ts,
                None => true,
            })
    }

    pub fn is_admin(&self, pubkey: &str) -> bool {
        self.admins.contains_key(pubkey)
    }

    /// Union of roles across the live add entry and the admin snapshot.
    pub fn roles_of(&self, pubkey: &str) -> Vec<Role> {
        let mut roles: BTreeSet<Role> = BTreeSet::new();
        if self.is_member(pubkey) {
            if let Some(add) = self.adds.get(pubkey) {
                roles.extend(add.roles.iter().copied());
            }
        }
        if let Some(admin_roles) = self.admins.get(pubkey) {
            roles.extend(admin_roles.iter().copied());
        }
        roles.into_iter().collect()
    }

    pub fn admins(&self) -> Vec<String> {
        let mut out: Vec<String> = self.admins.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn invites(&self) -> Vec<Invite> {
        self.invites.values().cloned().collect()
    }

    pub fn join_requests(&self) -> Vec<&Event> {
        self.join_requests.values().collect()
    }

    /// Messages ordered by `(created_at, id)` ascending.
    pub fn messages(&self) -> &[Event] {
        &self.messages
    }

    fn upsert_add(&mut self, pubkey: &str, record: AddRecord) {
        match self.adds.get(pubkey) {
            Some(existing) if !existing.loses_to(&record) => {}
            _ => {
                self.adds.insert(pubkey.to_string(), record);
            }
        }
    }

    fn insert_message(&mut self, event: Event) {
        let key = (event.created_at, event.id.clone());
        let pos = self
            .messages
            .partition_point(|e| (e.created_at, e.id.clone()) <= key);
        self.messages.insert(pos, event);
    }
}

struct NotifyState {
    version: u64,
    task_running: bool,
}

struct GroupsInner {
    local_keys: Keys,
    auth: Arc<AuthTokenStore>,
    bus: EventBus,
    debounce: Duration,
    groups: RwLock<HashMap<String, GroupState>>,
    notify: Mutex<HashMap<String, NotifyState>>,
    last_members: Mutex<HashMap<String, BTreeSet<String>>>,
}

/// Handle to the per-group projections. Cloning shares the state.
#[derive(Clone)]
pub struct Groups {
    inner: Arc<GroupsInner>,
}

impl Groups {
    pub fn new(local_keys: Keys, auth: Arc<AuthTokenStore>, bus: EventBus) -> Self {
        Self::with_debounce(local_keys, auth, bus, MEMBER_NOTIFY_DEBOUNCE)
    }

    pub fn with_debounce(
        local_keys: Keys,
        auth: Arc<AuthTokenStore>,
        bus: EventBus,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GroupsInner {
                local_keys,
                auth,
                bus,
                debounce,
                groups: RwLock::new(HashMap::new()),
                notify: Mutex::new(HashMap::new()),
                last_members: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Read access to one group's state.
    pub fn with_group<R>(&self, group_id: &str, f: impl FnOnce(&GroupState) -> R) -> Option<R> {
        self.inner.groups.read().get(group_id).map(f)
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.inner.groups.read().keys().cloned().collect()
    }

    pub fn members(&self, group_id: &str) -> Vec<String> {
        self.with_group(group_id, |g| g.members()).unwrap_or_default()
    }

    /// Register a group this worker serves (creation or join).
    pub fn ensure_group(&self, group_id: &str, metadata: GroupMetadata) {
        let mut groups = self.inner.groups.write();
        let state = groups.entry(group_id.to_string()).or_default();
        if state.metadata.created_at <= metadata.created_at {
            state.metadata = metadata;
        }
    }

    /// Drop a group's projection entirely (disconnect / deletion).
    pub fn remove_group(&self, group_id: &str) {
        self.inner.groups.write().remove(group_id);
        self.inner.notify.lock().remove(group_id);
        self.inner.last_members.lock().remove(group_id);
    }

    /// Remove an invite once accepted or dismissed.
    pub fn take_invite(&self, group_id: &str, invite_id: &str) -> Option<Invite> {
        self.inner
            .groups
            .write()
            .get_mut(group_id)?
            .invites
            .remove(invite_id)
    }

    /// Reject a pending join request.
    pub fn reject_join_request(&self, group_id: &str, pubkey: &str) -> bool {
        self.inner
            .groups
            .write()
            .get_mut(group_id)
            .and_then(|g| g.join_requests.remove(pubkey))
            .is_some()
    }

    /// Apply one event to its group's projection. Returns whether the
    /// event changed state (`false` for duplicates and non-group kinds).
    ///
    /// The event must already have passed structural validation; this
    /// revalidates as the last line of defence and drops on failure.
    pub fn apply(&self, event: &Event) -> hypertuna_sdk::Result<bool> {
        event.validate()?;
        let Some(group_id) = event.group_id().map(str::to_string) else {
            return Ok(false);
        };

        let local_pubkey = self.inner.local_keys.public_key_hex();
        let mut members_dirty = false;
        let mut emits: Vec<GroupEvent> = Vec::new();
        let mut revocations: Vec<String> = Vec::new();

        {
            let mut groups = self.inner.groups.write();
            let state = groups.entry(group_id.clone()).or_default();
            if !state.seen.insert(event.id.clone()) {
                return Ok(false);
            }

            match event.kind {
                KIND_GROUP_METADATA_39000 => {
                    if event.created_at < state.metadata.created_at {
                        tracing::debug!(
                            group = %group_id,
                            event = %event.id_prefix(),
                            "dropping stale metadata snapshot"
                        );
                    } else {
                        state.metadata = metadata_from_snapshot(event, &state.metadata);
                        emits.push(GroupEvent::MetadataUpdated {
                            group_id: group_id.clone(),
                        });
                    }
                }
                KIND_GROUP_ADMINS_39001 => {
                    if event.created_at >= state.admins_snapshot_ts {
                        state.admins_snapshot_ts = event.created_at;
                        state.admins.clear();
                        for tag in event.tags_named("p") {
                            if let Some(pubkey) = tag.get(1) {
                                let roles = parse_roles(&tag[2..]);
                                state.admins.insert(
                                    pubkey.clone(),
                                    if roles.is_empty() { vec![Role::Admin] } else { roles },
                                );
                            }
                        }
                    }
                }
                KIND_GROUP_MEMBERS_39002 => {
                    if event.created_at >= state.members_snapshot_ts {
                        state.members_snapshot_ts = event.created_at;
                        let listed: HashSet<&str> = event.tag_values("p").collect();
                        // A newer snapshot supersedes older snapshot seeds
                        // (targeted adds are untouched). REMOVES is never
                        // cleared by a snapshot.
                        state
                            .adds
                            .retain(|pk, add| !add.snapshot_seeded || listed.contains(pk.as_str()));
                        for pubkey in &listed {
                            state.upsert_add(
                                pubkey,
                                AddRecord {
                                    ts: event.created_at,
                                    roles: vec![Role::Member],
                                    snapshot_seeded: true,
                                },
                            );
                        }
                        members_dirty = true;
                    }
                }
                KIND_GROUP_CREATE_9007 => {
                    if state.admins.is_empty() {
                        state.admins.insert(event.pubkey.clone(), vec![Role::Admin]);
                    }
                    state.upsert_add(
                        &event.pubkey,
                        AddRecord {
                            ts: event.created_at,
                            roles: vec![Role::Admin, Role::Member],
                            snapshot_seeded: false,
                        },
                    );
                    if let Some(name) = event.tag_value("name") {
                        if state.metadata.created_at == 0 {
                            state.metadata.name = name.to_string();
                        }
                    }
                    members_dirty = true;
                }
                KIND_GROUP_ADD_USER_9000 => {
                    for tag in event.tags_named("p") {
                        let Some(pubkey) = tag.get(1) else { continue };
                        let (roles, token) = parse_roles_and_token(&tag[2..]);
                        if roles.contains(&Role::Admin) {
                            state.admins.insert(pubkey.clone(), vec![Role::Admin]);
                        }
                        state.upsert_add(
                            pubkey,
                            AddRecord {
                                ts: event.created_at,
                                roles: if roles.is_empty() { vec![Role::Member] } else { roles },
                                snapshot_seeded: false,
                            },
                        );
                        state.join_requests.remove(pubkey);
                        if let Some(token) = token {
                            if *pubkey == local_pubkey {
                                self.inner.auth.add_auth(&group_id, pubkey, &token);
                            }
                        }
                    }
                    members_dirty = true;
                }
                KIND_GROUP_REMOVE_USER_9001 => {
                    for pubkey in event.tag_values("p") {
                        let entry = state.removes.entry(pubkey.to_string()).or_insert(0);
                        *entry = (*entry).max(event.created_at);
                        if !state.is_member(pubkey) {
                            state.admins.remove(pubkey);
                            // Token revocation must precede any outbound
                            // notice to the removed pubkey.
                            revocations.push(pubkey.to_string());
                        }
                    }
                    members_dirty = true;
                }
                KIND_GROUP_EDIT_METADATA_9002 => {
                    // The authoring relay answers a 9002 with a companion
                    // 39000 snapshot; the edit itself is not projected.
                    tracing::debug!(
                        group = %group_id,
                        event = %event.id_prefix(),
                        "metadata edit noted, waiting for snapshot"
                    );
                }
                KIND_GROUP_INVITE_9009 => {
                    let addressed_to_local = event.has_tag_value("p", &local_pubkey);
                    if addressed_to_local {
                        match decrypt_invite(&self.inner.local_keys, event) {
                            Ok(payload) => {
                                state.invites.insert(
                                    event.id.clone(),
                                    Invite {
                                        group_id: group_id.clone(),
                                        inviter: event.pubkey.clone(),
                                        transport_url: payload.transport_url,
                                        token: payload.token,
                                        relay_id: payload.relay_id,
                                        is_public: payload.is_public,
                                        received_at: event.created_at,
                                    },
                                );
                                emits.push(GroupEvent::InviteReceived {
                                    group_id: group_id.clone(),
                                    invite_id: event.id.clone(),
                                });
                            }
                            Err(e) => {
                                tracing::warn!(
                                    group = %group_id,
                                    event = %event.id_prefix(),
                                    "invite envelope did not decrypt: {e}"
                                );
                            }
                        }
                    }
                }
                KIND_GROUP_JOIN_REQUEST_9021 => {
                    if !state.is_member(&event.pubkey) {
                        state
                            .join_requests
                            .insert(event.pubkey.clone(), event.clone());
                        emits.push(GroupEvent::JoinRequestReceived {
                            group_id: group_id.clone(),
                            pubkey: event.pubkey.clone(),
                        });
                    }
                }
                KIND_TEXT_NOTE_1 => {
                    state.insert_message(event.clone());
                    emits.push(GroupEvent::Message {
                        group_id: group_id.clone(),
                        event: event.clone(),
                    });
                }
                // Unknown kinds are ignored; validation already bounds
                // the kind set, this arm only covers non-group kinds
                // that happen to carry an h tag.
                _ => return Ok(false),
            }
        }

        for pubkey in revocations {
            self.inner.auth.remove_auth(&group_id, &pubkey);
        }
        for emit in emits {
            self.inner.bus.emit_group(emit);
        }
        if members_dirty {
            self.schedule_members_notify(&group_id);
        }
        Ok(true)
    }

    /// Authorization for a publish into a group (§ gateway rejection
    /// path). Returns the rejection reason on refusal.
    pub fn authorize_publish(
        &self,
        group_id: &str,
        event: &Event,
        relay_pubkey: &str,
    ) -> Result<(), String> {
        let groups = self.inner.groups.read();
        let state = groups.get(group_id);
        let author = event.pubkey.as_str();
        let is_relay = author == relay_pubkey;
        let is_admin = state.is_some_and(|g| g.is_admin(author)) || is_relay;
        let is_member = state.is_some_and(|g| g.is_member(author)) || is_admin;

        match event.kind {
            KIND_TEXT_NOTE_1 => {
                if is_member {
                    Ok(())
                } else {
                    Err("blocked: not a member".into())
                }
            }
            KIND_GROUP_CREATE_9007 => {
                if state.is_none() || is_admin {
                    Ok(())
                } else {
                    Err("blocked: group already exists".into())
                }
            }
            KIND_GROUP_ADD_USER_9000 | KIND_GROUP_EDIT_METADATA_9002 => {
                if is_admin {
                    Ok(())
                } else {
                    Err("blocked: admin only".into())
                }
            }
            KIND_GROUP_REMOVE_USER_9001 => {
                let p_tags: Vec<&str> = event.tag_values("p").collect();
                let self_leave = p_tags.len() == 1 && p_tags[0] == author;
                if is_admin || self_leave {
                    Ok(())
                } else {
                    Err("blocked: admin only".into())
                }
            }
            KIND_GROUP_INVITE_9009 => {
                let open = state.is_some_and(|g| g.metadata.is_open);
                if is_admin || (open && is_member) {
                    Ok(())
                } else {
                    Err("blocked: invites require admin".into())
                }
            }
            KIND_GROUP_JOIN_REQUEST_9021 => {
                if state.is_some_and(|g| g.is_member(author)) {
                    Err("blocked: already a member".into())
                } else {
                    Ok(())
                }
            }
            KIND_GROUP_METADATA_39000 | KIND_GROUP_ADMINS_39001 | KIND_GROUP_MEMBERS_39002 => {
                if is_admin {
                    Ok(())
                } else {
                    Err("blocked: snapshots are relay-authored".into())
                }
            }
            _ => Err("blocked: unsupported kind".into()),
        }
    }

    /// Mark a group's membership dirty; a notification fires after the
    /// quiescence window if the member set actually changed.
    fn schedule_members_notify(&self, group_id: &str) {
        let mut notify = self.inner.notify.lock();
        let entry = notify
            .entry(group_id.to_string())
            .or_insert(NotifyState {
                version: 0,
                task_running: false,
            });
        entry.version += 1;
        if entry.task_running {
            return;
        }
        entry.task_running = true;
        drop(notify);

        let inner = Arc::clone(&self.inner);
        let group_id = group_id.to_string();
        tokio::spawn(async move {
            loop {
                let observed = inner
                    .notify
                    .lock()
                    .get(&group_id)
                    .map(|s| s.version)
                    .unwrap_or(0);
                tokio::time::sleep(inner.debounce).await;
                let current = inner
                    .notify
                    .lock()
                    .get(&group_id)
                    .map(|s| s.version)
                    .unwrap_or(0);
                if current != observed {
                    continue; // still churning, extend the window
                }

                let members: Option<BTreeSet<String>> =
                    inner.groups.read().get(&group_id).map(|g| g.member_set());
                if let Some(members) = members {
                    let changed = {
                        let mut last = inner.last_members.lock();
                        if last.get(&group_id) == Some(&members) {
                            false
                        } else {
                            last.insert(group_id.clone(), members.clone());
                            true
                        }
                    };
                    if changed {
                        inner.bus.emit_group(GroupEvent::MembersChanged {
                            group_id: group_id.clone(),
                            members: members.into_iter().collect(),
                        });
                    }
                }

                let mut notify = inner.notify.lock();
                match notify.get_mut(&group_id) {
                    Some(state) if state.version != current => continue,
                    Some(state) => {
                        state.task_running = false;
                        return;
                    }
                    None => return,
                }
            }
        });
    }
}

fn parse_roles(parts: &[String]) -> Vec<Role> {
    parts.iter().filter_map(|p| Role::parse(p).ok()).collect()
}

/// Split the tail of a `p` tag into roles (closed set) and an optional
/// trailing token (any final element that is not a role).
fn parse_roles_and_token(parts: &[String]) -> (Vec<Role>, Option<String>) {
    let mut roles = Vec::new();
    let mut token = None;
    for (idx, part) in parts.iter().enumerate() {
        match Role::parse(part) {
            Ok(role) => roles.push(role),
            Err(_) if idx == parts.len() - 1 => token = Some(part.clone()),
            Err(_) => {}
        }
    }
    (roles, token)
}

fn metadata_from_snapshot(event: &Event, previous: &GroupMetadata) -> GroupMetadata {
    GroupMetadata {
        name: event
            .tag_value("name")
            .map(str::to_string)
            .unwrap_or_else(|| previous.name.clone()),
        about: event
            .tag_value("about")
            .map(str::to_string)
            .unwrap_or_else(|| previous.about.clone()),
        is_public: event.has_marker("public")
            || (!event.has_marker("private") && previous.is_public),
        is_open: event.has_marker("open") || (!event.has_marker("closed") && previous.is_open),
        file_sharing: event.has_marker("filesharing") || previous.file_sharing,
        swarm_id: event
            .tag_value("swarm")
            .map(str::to_string)
            .or_else(|| previous.swarm_id.clone()),
        transport_url: event
            .tag_value("r")
            .map(str::to_string)
            .or_else(|| previous.transport_url.clone()),
        created_at: event.created_at,
    }
}

fn decrypt_invite(keys: &Keys, event: &Event) -> hypertuna_sdk::Result<InvitePayload> {
    let secret = crypto::shared_secret(keys, &event.pubkey)?;
    let plaintext = crypto::decrypt_payload(&secret, &event.content)?;
    Ok(serde_json::from_str(&plaintext)?)
}

/// Build the encrypted content of a kind-9009 invite envelope.
pub fn encrypt_invite(
    inviter: &Keys,
    invitee_pubkey: &str,
    payload: &InvitePayload,
) -> hypertuna_sdk::Result<String> {
    let secret = crypto::shared_secret(inviter, invitee_pubkey)?;
    let plaintext = serde_json::to_string(payload)?;
    Ok(crypto::encrypt_payload(&secret, &plaintext))
}
