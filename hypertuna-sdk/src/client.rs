//! Top-level client orchestrator.
//!
//! Owns the relay pool, keeps discovery and per-group subscriptions
//! alive, fetches profiles/contacts/relay lists with bounded timeouts,
//! and hands every verified incoming event to a [`GroupSink`] — a
//! one-way handle into the group-state projection, so the projector
//! never needs a reference back into the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::crypto;
use crate::error::Error;
use crate::event::{
    Event, EventBuilder, KIND_CONTACTS_3, KIND_GROUP_ADD_USER_9000, KIND_GROUP_ADMINS_39001,
    KIND_GROUP_INVITE_9009, KIND_GROUP_JOIN_REQUEST_9021, KIND_GROUP_MEMBERS_39002,
    KIND_GROUP_METADATA_39000, KIND_GROUP_REMOVE_USER_9001, KIND_PROFILE_0, KIND_RELAY_LIST_10009,
    KIND_TEXT_NOTE_1,
};
use crate::events::RelayEvent;
use crate::filter::Filter;
use crate::keys::Keys;
use crate::relay_pool::{PublishTarget, RelayPool, RelayPoolConfig, RelayType};
use crate::subscription::{SubscriptionOptions, SubscriptionUpdate};
use crate::Result;

/// One-way handle into the group-state projection. The worker's
/// projector implements this; the client only ever calls forward.
pub trait GroupSink: Send + Sync {
    /// An already-validated event arrived from `relay_url`.
    fn apply_event(&self, relay_url: &str, event: &Event);
}

/// A sink that drops everything (standalone/discovery-only clients).
pub struct NullSink;

impl GroupSink for NullSink {
    fn apply_event(&self, _relay_url: &str, _event: &Event) {}
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Global relays used for profile and relay-list lookup.
    pub discovery_relays: Vec<String>,
    /// Timeout for profile / contact / relay-list fetches.
    pub fetch_timeout: Duration,
    /// How long to wait for a relay to reach `open`.
    pub relay_ready_timeout: Duration,
    pub pool: RelayPoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_relays: Vec::new(),
            fetch_timeout: Duration::from_secs(3),
            relay_ready_timeout: Duration::from_secs(45),
            pool: RelayPoolConfig::default(),
        }
    }
}

/// A `(group id, relay url)` binding discovered from kind-10009 events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListEntry {
    pub group_id: String,
    pub relay_url: String,
}

pub struct HypertunaClient {
    keys: Keys,
    pool: RelayPool,
    config: ClientConfig,
    fetch_counter: AtomicU64,
}

impl HypertunaClient {
    /// Build the client, connect discovery relays, and start pumping
    /// verified events into `sink`.
    pub fn new(keys: Keys, config: ClientConfig, sink: Arc<dyn GroupSink>) -> Result<Self> {
        let pool = RelayPool::new(config.pool.clone());
        for url in &config.discovery_relays {
            pool.add_relay(url, RelayType::Discovery, None)?;
        }

        // Event pump: pool-validated events → projection sink. Errors in
        // the sink are its own problem; a lagged receiver just skips.
        let mut events = pool.bus().relay_events();
        let pump_sink = Arc::clone(&sink);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RelayEvent::GlobalEvent { url, event }) => {
                        pump_sink.apply_event(&url, &event);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("event pump lagged, skipped {missed} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            keys,
            pool,
            config,
            fetch_counter: AtomicU64::new(1),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    // ── Group relays ───────────────────────────────────────────────────

    /// Attach a group relay (URL may carry `?token=…`) and install the
    /// standing subscriptions for that group's state and messages.
    pub fn connect_group_relay(&self, group_id: &str, url_with_token: &str) -> Result<String> {
        let url = self
            .pool
            .add_relay(url_with_token, RelayType::Group, Some(group_id.to_string()))?;

        let state_kinds = [
            KIND_GROUP_METADATA_39000,
            KIND_GROUP_ADMINS_39001,
            KIND_GROUP_MEMBERS_39002,
            KIND_GROUP_ADD_USER_9000,
            KIND_GROUP_REMOVE_USER_9001,
            KIND_GROUP_INVITE_9009,
            KIND_GROUP_JOIN_REQUEST_9021,
        ];
        let _state_rx = self.pool.subscribe(
            &format!("group:{group_id}:state"),
            vec![Filter::new().kinds(state_kinds).tag("d", [group_id]),
                 Filter::new().kinds(state_kinds).tag("h", [group_id])],
            SubscriptionOptions::default(),
        );
        let _msg_rx = self.pool.subscribe(
            &format!("group:{group_id}:messages"),
            vec![Filter::new().kinds([KIND_TEXT_NOTE_1]).tag("h", [group_id])],
            SubscriptionOptions::default(),
        );
        Ok(url)
    }

    /// Detach a group relay and drop its standing subscriptions.
    pub fn disconnect_group_relay(&self, group_id: &str) {
        self.pool.unsubscribe(&format!("group:{group_id}:state"));
        self.pool.unsubscribe(&format!("group:{group_id}:messages"));
        if let Some(url) = self.pool.relay_for_group(group_id) {
            self.pool.remove_relay(&url);
        }
    }

    /// Wait until a relay reaches `open`, bounded by the ready timeout.
    pub async fn wait_relay_ready(&self, url: &str) -> Result<()> {
        use crate::relay_pool::ConnectionStatus;
        if self.pool.status(url) == Some(ConnectionStatus::Open) {
            return Ok(());
        }
        let mut events = self.pool.bus().relay_events();
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(RelayEvent::Connected { url: connected }) if connected == url => return Ok(()),
                    Ok(RelayEvent::AuthFailed { url: failed }) if failed == url => {
                        return Err(Error::AuthFailed {
                            relay_url: url.to_string(),
                        })
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if self.pool.status(url) == Some(ConnectionStatus::Open) {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::Transport("pool shut down".into()))
                    }
                }
            }
        };
        tokio::time::timeout(self.config.relay_ready_timeout, wait)
            .await
            .map_err(|_| Error::Transport(format!("relay {url} not ready in time")))?
    }

    // ── Fetches (bounded, one-shot) ────────────────────────────────────

    /// Open a temporary subscription, collect events until EOSE or the
    /// fetch timeout, then close it. Results are deduplicated by id.
    pub async fn fetch_events(&self, label: &str, filters: Vec<Filter>) -> Vec<Event> {
        let name = format!(
            "fetch:{label}:{}",
            self.fetch_counter.fetch_add(1, Ordering::Relaxed)
        );
        let mut rx = self.pool.subscribe(
            &name,
            filters,
            SubscriptionOptions {
                suppress_global_events: true,
                target_relays: Vec::new(),
            },
        );
        let mut out: Vec<Event> = Vec::new();
        let collect = async {
            loop {
                match rx.recv().await {
                    Ok(SubscriptionUpdate::Event { event, .. }) => {
                        if !out.iter().any(|e| e.id == event.id) {
                            out.push(event);
                        }
                    }
                    Ok(SubscriptionUpdate::Eose { .. }) => break,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        };
        let _ = tokio::time::timeout(self.config.fetch_timeout, collect).await;
        self.pool.unsubscribe(&name);
        out
    }

    /// Latest kind-0 profile for a pubkey.
    pub async fn fetch_profile(&self, pubkey: &str) -> Option<Event> {
        self.fetch_events(
            "profile",
            vec![Filter::new().kinds([KIND_PROFILE_0]).authors([pubkey]).limit(1)],
        )
        .await
        .into_iter()
        .max_by_key(|e| e.created_at)
    }

    /// Latest profiles for several pubkeys in one subscription.
    pub async fn fetch_profiles(&self, pubkeys: &[String]) -> Vec<Event> {
        if pubkeys.is_empty() {
            return Vec::new();
        }
        let events = self
            .fetch_events(
                "profiles",
                vec![Filter::new()
                    .kinds([KIND_PROFILE_0])
                    .authors(pubkeys.iter().map(String::as_str))],
            )
            .await;
        // Keep only the newest profile per author.
        let mut newest: std::collections::HashMap<String, Event> = std::collections::HashMap::new();
        for event in events {
            let entry = newest.entry(event.pubkey.clone());
            match entry {
                std::collections::hash_map::Entry::Occupied(mut o) => {
                    if event.created_at > o.get().created_at {
                        o.insert(event);
                    }
                }
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(event);
                }
            }
        }
        newest.into_values().collect()
    }

    /// Followed pubkeys from the latest kind-3 contact list.
    pub async fn fetch_contacts(&self, pubkey: &str) -> Vec<String> {
        let newest = self
            .fetch_events(
                "contacts",
                vec![Filter::new().kinds([KIND_CONTACTS_3]).authors([pubkey]).limit(1)],
            )
            .await
            .into_iter()
            .max_by_key(|e| e.created_at);
        match newest {
            Some(event) => {
                let mut follows: Vec<String> =
                    event.tag_values("p").map(str::to_string).collect();
                follows.dedup();
                follows
            }
            None => Vec::new(),
        }
    }

    /// Discover `(group, relay url)` bindings from kind-10009 relay
    /// lists published by the given authors.
    pub async fn discover_relay_lists(&self, authors: &[String]) -> Vec<RelayListEntry> {
        if authors.is_empty() {
            return Vec::new();
        }
        let events = self
            .fetch_events(
                "relay-lists",
                vec![Filter::new()
                    .kinds([KIND_RELAY_LIST_10009])
                    .authors(authors.iter().map(String::as_str))],
            )
            .await;
        let mut entries = Vec::new();
        for event in &events {
            for entry in self.parse_relay_list(event) {
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    /// A relay list pairs `group` and `r` tags positionally; an encrypted
    /// list (content envelope, self-addressed) takes precedence when it
    /// decrypts.
    fn parse_relay_list(&self, event: &Event) -> Vec<RelayListEntry> {
        if event.content.contains("?iv=") {
            if let Ok(secret) = crypto::shared_secret(&self.keys, &event.pubkey) {
                if let Ok(plain) = crypto::decrypt_payload(&secret, &event.content) {
                    if let Ok(list) = serde_json::from_str::<Vec<RelayListEntry2>>(&plain) {
                        return list
                            .into_iter()
                            .map(|e| RelayListEntry {
                                group_id: e.group,
                                relay_url: e.url,
                            })
                            .collect();
                    }
                }
            }
        }
        let groups: Vec<&str> = event.tag_values("group").collect();
        let urls: Vec<&str> = event.tag_values("r").collect();
        groups
            .into_iter()
            .zip(urls)
            .map(|(g, r)| RelayListEntry {
                group_id: g.to_string(),
                relay_url: r.to_string(),
            })
            .collect()
    }

    // ── Publishes ──────────────────────────────────────────────────────

    /// Publish our relay list to the discovery relays, content encrypted
    /// to ourselves so only we can recover it.
    pub async fn publish_relay_list(&self, entries: &[RelayListEntry]) -> Result<()> {
        let own_pubkey = self.keys.public_key_hex();
        let secret = crypto::shared_secret(&self.keys, &own_pubkey)?;
        let plain = serde_json::to_string(
            &entries
                .iter()
                .map(|e| RelayListEntry2 {
                    group: e.group_id.clone(),
                    url: e.relay_url.clone(),
                })
                .collect::<Vec<_>>(),
        )?;
        let content = crypto::encrypt_payload(&secret, &plain);
        let event = EventBuilder::relay_list(
            entries
                .iter()
                .map(|e| (e.group_id.as_str(), e.relay_url.as_str())),
            &content,
        )
        .sign(&self.keys)?;
        self.pool.publish(&event, PublishTarget::Discovery).await
    }

    /// Publish a group message to the group's relay and wait for its OK.
    pub async fn publish_group_message(&self, group_id: &str, text: &str) -> Result<Event> {
        let event = EventBuilder::group_message(group_id, text)?.sign(&self.keys)?;
        self.pool
            .publish(&event, PublishTarget::Group(group_id.to_string()))
            .await?;
        Ok(event)
    }

    /// Publish a join request to the group's relay.
    pub async fn send_join_request(&self, group_id: &str, reason: &str) -> Result<Event> {
        let event = EventBuilder::join_request(group_id, reason)?.sign(&self.keys)?;
        self.pool
            .publish(&event, PublishTarget::Group(group_id.to_string()))
            .await?;
        Ok(event)
    }

    /// Publish our kind-0 profile to the discovery relays.
    /// `picture_marker` carries the drive marker of the profile picture.
    pub async fn publish_profile(
        &self,
        content_json: &str,
        picture_marker: Option<&str>,
    ) -> Result<Event> {
        let event = EventBuilder::profile(content_json, picture_marker).sign(&self.keys)?;
        self.pool.publish(&event, PublishTarget::Discovery).await?;
        Ok(event)
    }

    /// Publish our kind-3 contact list to the discovery relays.
    pub async fn publish_contacts(&self, followed: &[String]) -> Result<Event> {
        let event =
            EventBuilder::contacts(followed.iter().map(String::as_str)).sign(&self.keys)?;
        self.pool.publish(&event, PublishTarget::Discovery).await?;
        Ok(event)
    }

    /// Publish a kind-30166 peer record binding a group to its transport
    /// URL and swarm id, so other peers can find the relay.
    pub async fn publish_peer_record(
        &self,
        group_id: &str,
        transport_url: &str,
        swarm_id: &str,
    ) -> Result<Event> {
        let event =
            EventBuilder::peer_record(group_id, transport_url, swarm_id)?.sign(&self.keys)?;
        self.pool.publish(&event, PublishTarget::Discovery).await?;
        Ok(event)
    }

    /// Publish an already-built event wherever the target routes it.
    pub async fn publish(&self, event: &Event, target: PublishTarget) -> Result<()> {
        self.pool.publish(event, target).await
    }

    /// Orderly shutdown of the pool and every subscription.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RelayListEntry2 {
    group: String,
    url: String,
}
