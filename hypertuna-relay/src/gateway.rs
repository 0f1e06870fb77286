//! Gateway bridge: the local WS/HTTP endpoint that terminates client
//! connections and proxies frames to the group relays this worker
//! serves.
//!
//! A client connects to `/{npub}/{relayNameCamelCase}?token=…`. The
//! token is verified against the auth store; without one the connection
//! negotiates an ECDH challenge (see [`hypertuna_sdk::handshake`] for
//! the frame shapes) before a token is minted. After authentication the
//! gateway attaches the client's subscriptions to the group's state,
//! replays stored events, and forwards publishes after validation and
//! authorization — rejecting with `["OK", id, false, reason]`.
//!
//! The optional public-gateway mode registers each served relay with a
//! remote endpoint using an HMAC shared secret and mints short-lived
//! bearer tokens for external sharing. It does not change the
//! authorization policy.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::{broadcast, mpsc};

use hypertuna_sdk::crypto;
use hypertuna_sdk::error::Error;
use hypertuna_sdk::event::{Event, EventBuilder, KIND_GROUP_EDIT_METADATA_9002, KIND_TEXT_NOTE_1};
use hypertuna_sdk::filter::{match_any, Filter};
use hypertuna_sdk::wire::{ClientFrame, RelayFrame, CLOSE_AUTH_FAILED};
use hypertuna_sdk::Keys;

use crate::auth::{AuthTokenStore, ChallengeStore};
use crate::db::Db;
use crate::group::Groups;

/// Events kept per group for REQ replay.
const MAX_HISTORY: usize = 1000;
const FEED_CAPACITY: usize = 256;
/// Lifetime of a minted share token.
const SHARE_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_conns_per_ip: u32,
    /// Public-gateway registration, when enabled.
    pub public: Option<PublicGatewayConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_conns_per_ip: 20,
            public: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublicGatewayConfig {
    pub host: String,
    pub shared_secret: String,
}

/// A relay served by this gateway, addressed by its URL path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayRoute {
    pub npub: String,
    pub relay_name: String,
    pub group_id: String,
}

struct ShareToken {
    group_id: String,
    expires: Instant,
}

pub struct Gateway {
    keys: Keys,
    auth: Arc<AuthTokenStore>,
    challenges: Arc<ChallengeStore>,
    groups: Groups,
    config: GatewayConfig,
    db: Option<Mutex<Db>>,
    /// `"<npub>/<relayName>"` → route.
    routes: Mutex<HashMap<String, RelayRoute>>,
    /// Per-group live feed of accepted events.
    feeds: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    /// Per-group replay history (accepted events, arrival order).
    history: Mutex<HashMap<String, VecDeque<Event>>>,
    ip_connections: Mutex<HashMap<IpAddr, u32>>,
    share_tokens: Mutex<HashMap<String, ShareToken>>,
}

impl Gateway {
    pub fn new(
        keys: Keys,
        auth: Arc<AuthTokenStore>,
        challenges: Arc<ChallengeStore>,
        groups: Groups,
        db: Option<Db>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            keys,
            auth,
            challenges,
            groups,
            config,
            db: db.map(Mutex::new),
            routes: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            ip_connections: Mutex::new(HashMap::new()),
            share_tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn groups(&self) -> &Groups {
        &self.groups
    }

    pub fn auth(&self) -> &Arc<AuthTokenStore> {
        &self.auth
    }

    /// Serve a relay at `/{npub}/{relay_name}`. Returns the path.
    pub fn register_relay(&self, npub: &str, relay_name: &str, group_id: &str) -> String {
        let path = format!("{npub}/{relay_name}");
        self.routes.lock().insert(
            path.clone(),
            RelayRoute {
                npub: npub.to_string(),
                relay_name: relay_name.to_string(),
                group_id: group_id.to_string(),
            },
        );
        tracing::info!(path = %path, group = %group_id, "relay registered");
        path
    }

    pub fn unregister_relay(&self, group_id: &str) {
        self.routes.lock().retain(|_, r| r.group_id != group_id);
        self.feeds.lock().remove(group_id);
        self.history.lock().remove(group_id);
    }

    pub fn routes(&self) -> Vec<RelayRoute> {
        self.routes.lock().values().cloned().collect()
    }

    fn route_for(&self, npub: &str, relay_name: &str) -> Option<RelayRoute> {
        self.routes.lock().get(&format!("{npub}/{relay_name}")).cloned()
    }

    fn feed(&self, group_id: &str) -> broadcast::Sender<Event> {
        self.feeds
            .lock()
            .entry(group_id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn with_db<R>(&self, f: impl FnOnce(&Db) -> rusqlite::Result<R>) -> Option<R> {
        self.db.as_ref().and_then(|db| {
            let db = db.lock();
            match f(&db) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::error!("database error: {e}");
                    None
                }
            }
        })
    }

    /// Validate, authorize and accept a publish into a group, then fan
    /// it out to attached clients. Returns the rejection reason when the
    /// publisher lacks authorization.
    pub fn accept_event(&self, group_id: &str, event: &Event) -> Result<(), String> {
        event
            .validate()
            .map_err(|e| format!("invalid: {e}"))?;
        self.groups
            .authorize_publish(group_id, event, &self.keys.public_key_hex())?;
        match self.groups.apply(event) {
            Ok(_) => {}
            Err(e) => return Err(format!("invalid: {e}")),
        }

        if event.kind == KIND_TEXT_NOTE_1 {
            self.with_db(|db| db.insert_message(group_id, event));
        }
        {
            let mut history = self.history.lock();
            let log = history.entry(group_id.to_string()).or_default();
            log.push_back(event.clone());
            while log.len() > MAX_HISTORY {
                log.pop_front();
            }
        }
        let _ = self.feed(group_id).send(event.clone());

        // A metadata edit is answered by a relay-authored snapshot; the
        // projection only moves on the snapshot.
        if event.kind == KIND_GROUP_EDIT_METADATA_9002 {
            if let Err(e) = self.emit_metadata_snapshot(group_id, event) {
                tracing::warn!(group = %group_id, "companion snapshot failed: {e}");
            }
        }
        Ok(())
    }

    fn emit_metadata_snapshot(&self, group_id: &str, edit: &Event) -> hypertuna_sdk::Result<()> {
        let current = self
            .groups
            .with_group(group_id, |g| g.metadata.clone())
            .unwrap_or_default();
        let name = edit.tag_value("name").unwrap_or(&current.name);
        let about = edit.tag_value("about").unwrap_or(&current.about);
        let snapshot = EventBuilder::group_metadata(
            group_id,
            name,
            about,
            current.is_public,
            current.is_open,
        )?
        .sign(&self.keys)?;
        self.groups.apply(&snapshot)?;
        {
            let mut history = self.history.lock();
            history
                .entry(group_id.to_string())
                .or_default()
                .push_back(snapshot.clone());
        }
        let _ = self.feed(group_id).send(snapshot);
        Ok(())
    }

    /// Stored events matching a filter set, for REQ replay.
    fn replay(&self, group_id: &str, filters: &[Filter]) -> Vec<Event> {
        let history = self.history.lock();
        history
            .get(group_id)
            .map(|log| {
                log.iter()
                    .filter(|e| match_any(filters, e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Persist a group's metadata (logged, never fatal).
    pub fn persist_group(&self, group_id: &str, metadata: &crate::group::GroupMetadata) {
        self.with_db(|db| db.upsert_group(group_id, metadata));
    }

    /// Groups reloaded from the db at startup.
    pub fn load_persisted_groups(&self) -> Vec<(String, crate::group::GroupMetadata)> {
        self.with_db(|db| db.load_groups()).unwrap_or_default()
    }

    /// Recent messages of a group reloaded from the db.
    pub fn load_persisted_messages(&self, group_id: &str) -> Vec<Event> {
        self.with_db(|db| db.load_messages(group_id, MAX_HISTORY))
            .unwrap_or_default()
    }

    /// Seed the replay history (e.g. messages loaded from the db).
    pub fn seed_history(&self, group_id: &str, events: Vec<Event>) {
        let mut history = self.history.lock();
        let log = history.entry(group_id.to_string()).or_default();
        for event in events {
            log.push_back(event);
        }
        while log.len() > MAX_HISTORY {
            log.pop_front();
        }
    }

    /// Mint a short-lived bearer token for external sharing of a group
    /// relay through the public gateway.
    pub fn mint_share_token(&self, group_id: &str) -> String {
        let token = crypto::generate_challenge();
        self.share_tokens.lock().insert(
            token.clone(),
            ShareToken {
                group_id: group_id.to_string(),
                expires: Instant::now() + SHARE_TOKEN_TTL,
            },
        );
        token
    }

    /// Resolve a share token to its group, dropping expired entries.
    pub fn verify_share_token(&self, token: &str) -> Option<String> {
        let mut tokens = self.share_tokens.lock();
        tokens.retain(|_, t| t.expires > Instant::now());
        tokens.get(token).map(|t| t.group_id.clone())
    }

    /// Build the axum router for this gateway.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/api/v1/relays", get(api_relays))
            .route("/{npub}/{relay_name}", get(ws_upgrade))
            .layer(tower_http::cors::CorsLayer::permissive())
            .with_state(Arc::clone(self))
    }
}

// ── HTTP handlers ──────────────────────────────────────────────────────

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "relays": gateway.routes.lock().len(),
        "pubkey": gateway.keys.public_key_hex(),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_relays(State(gateway): State<Arc<Gateway>>) -> Json<Vec<RelayRoute>> {
    Json(gateway.routes())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path((npub, relay_name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
) -> axum::response::Response {
    let Some(route) = gateway.route_for(&npub, &relay_name) else {
        return (StatusCode::NOT_FOUND, "unknown relay").into_response();
    };
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_ws(socket, gateway, route, token, addr.ip()))
}

// ── WebSocket sessions ─────────────────────────────────────────────────

async fn handle_ws(
    socket: WebSocket,
    gateway: Arc<Gateway>,
    route: RelayRoute,
    token: Option<String>,
    ip: IpAddr,
) {
    // Per-IP connection cap, mirrored on the accept path.
    {
        let mut conns = gateway.ip_connections.lock();
        let count = conns.entry(ip).or_insert(0);
        if *count >= gateway.config.max_conns_per_ip {
            tracing::warn!(%ip, "connection rejected: per-IP limit reached");
            return;
        }
        *count += 1;
    }

    if let Err(e) = run_session(socket, &gateway, &route, token).await {
        tracing::debug!(group = %route.group_id, "session ended: {e}");
    }

    let mut conns = gateway.ip_connections.lock();
    if let Some(count) = conns.get_mut(&ip) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            conns.remove(&ip);
        }
    }
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: CLOSE_AUTH_FAILED,
            reason: "authentication failed".into(),
        })))
        .await;
}

async fn run_session(
    mut socket: WebSocket,
    gateway: &Arc<Gateway>,
    route: &RelayRoute,
    token: Option<String>,
) -> hypertuna_sdk::Result<()> {
    let group_id = route.group_id.clone();

    // ── Authentication ─────────────────────────────────────────────────
    let pubkey = match token {
        Some(token) => match gateway.auth.verify_auth(&group_id, &token) {
            Some(pubkey) => pubkey,
            None => {
                tracing::info!(group = %group_id, "rejected stale token");
                close_unauthorized(socket).await;
                return Err(Error::AuthFailed {
                    relay_url: group_id,
                });
            }
        },
        None => match negotiate_challenge(&mut socket, gateway, &group_id).await {
            Ok(pubkey) => pubkey,
            Err(e) => {
                // Surface the reason (expired challenge, attempt budget,
                // bad response) before the 4403 close.
                let _ = socket
                    .send(WsMessage::Text(
                        RelayFrame::Notice {
                            text: e.to_string(),
                        }
                        .to_json()
                        .into(),
                    ))
                    .await;
                close_unauthorized(socket).await;
                return Err(e);
            }
        },
    };
    let client = &pubkey[..pubkey.len().min(8)];
    tracing::info!(group = %group_id, client = %client, "client authenticated");
    let client = client.to_string();

    // ── Attached session ───────────────────────────────────────────────
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut feed = gateway.feed(&group_id).subscribe();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            accepted = feed.recv() => {
                match accepted {
                    Ok(event) => {
                        for (sub_id, filters) in &subs {
                            if match_any(filters, &event) {
                                let frame = RelayFrame::Event {
                                    sub_id: sub_id.clone(),
                                    event: event.clone(),
                                }
                                .to_json();
                                let _ = out_tx.send(frame);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(group = %group_id, "session lagged, skipped {missed} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = source.next() => {
                let Some(Ok(message)) = inbound else { break };
                let text = match message {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                match ClientFrame::parse(text.as_str()) {
                    Ok(ClientFrame::Req { sub_id, filters }) => {
                        for event in gateway.replay(&group_id, &filters) {
                            let frame = RelayFrame::Event {
                                sub_id: sub_id.clone(),
                                event,
                            }
                            .to_json();
                            let _ = out_tx.send(frame);
                        }
                        let _ = out_tx.send(RelayFrame::Eose { sub_id: sub_id.clone() }.to_json());
                        subs.insert(sub_id, filters);
                    }
                    Ok(ClientFrame::Close { sub_id }) => {
                        subs.remove(&sub_id);
                    }
                    Ok(ClientFrame::Event { event }) => {
                        let (success, message) = match gateway.accept_event(&group_id, &event) {
                            Ok(()) => (true, String::new()),
                            Err(reason) => {
                                tracing::info!(
                                    group = %group_id,
                                    event = %event.id_prefix(),
                                    client = %client,
                                    "publish rejected: {reason}"
                                );
                                (false, reason)
                            }
                        };
                        let _ = out_tx.send(
                            RelayFrame::Ok {
                                event_id: event.id.clone(),
                                success,
                                message,
                            }
                            .to_json(),
                        );
                    }
                    Ok(ClientFrame::Auth { .. }) => {
                        // Already authenticated; nothing to negotiate.
                    }
                    Err(e) => {
                        let _ = out_tx.send(
                            RelayFrame::Notice {
                                text: format!("unparseable frame: {e}"),
                            }
                            .to_json(),
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Server side of the ECDH challenge negotiation. Returns the
/// authenticated pubkey once the client proves possession of its key.
async fn negotiate_challenge(
    socket: &mut WebSocket,
    gateway: &Arc<Gateway>,
    group_id: &str,
) -> hypertuna_sdk::Result<String> {
    let relay_pubkey = gateway.keys.public_key_hex();
    while let Some(message) = socket.next().await {
        let message = message.map_err(|e| Error::Transport(format!("read: {e}")))?;
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => {
                return Err(Error::Transport("closed during handshake".into()))
            }
            _ => continue,
        };
        let Ok(ClientFrame::Auth { payload }) = ClientFrame::parse(text.as_str()) else {
            let _ = socket
                .send(WsMessage::Text(
                    RelayFrame::Notice {
                        text: "authenticate first".into(),
                    }
                    .to_json()
                    .into(),
                ))
                .await;
            continue;
        };
        let Some(client_pubkey) = payload.get("pubkey").and_then(|v| v.as_str()) else {
            return Err(Error::BadFrame("AUTH without pubkey".into()));
        };

        match payload.get("response").and_then(|v| v.as_str()) {
            None => {
                // Announce: issue (or refresh) the challenge.
                let challenge =
                    gateway
                        .challenges
                        .issue(client_pubkey, &relay_pubkey, group_id);
                let frame = RelayFrame::Auth {
                    challenge: json!({
                        "challenge": challenge,
                        "relayPubkey": relay_pubkey,
                        "identifier": group_id,
                    }),
                };
                socket
                    .send(WsMessage::Text(frame.to_json().into()))
                    .await
                    .map_err(|e| Error::Transport(format!("send challenge: {e}")))?;
            }
            Some(envelope) => {
                let record = gateway.challenges.for_verify(client_pubkey)?;
                let secret = crypto::shared_secret(&gateway.keys, client_pubkey)?;
                let answer = crypto::decrypt_payload(&secret, envelope)?;
                if answer != record.challenge {
                    tracing::info!(client = %client_pubkey, "challenge response mismatch");
                    return Err(Error::AuthFailed {
                        relay_url: group_id.to_string(),
                    });
                }
                gateway.challenges.complete(client_pubkey);
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let token = crypto::derive_token(&gateway.keys, client_pubkey, now);
                gateway.auth.add_auth(group_id, client_pubkey, &token);
                let frame = RelayFrame::Auth {
                    challenge: json!({ "success": true, "token": token }),
                };
                socket
                    .send(WsMessage::Text(frame.to_json().into()))
                    .await
                    .map_err(|e| Error::Transport(format!("send token: {e}")))?;
                return Ok(client_pubkey.to_string());
            }
        }
    }
    Err(Error::Transport("closed during handshake".into()))
}

// ── Public-gateway registration ────────────────────────────────────────

/// Registers served relays with the public gateway and keeps the
/// registration fresh with a periodic heartbeat.
pub struct PublicRegistrar {
    client: reqwest::Client,
    config: PublicGatewayConfig,
}

impl PublicRegistrar {
    pub fn new(config: PublicGatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn sign(&self, path: &str, ts: u64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.shared_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{path}:{ts}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Register one relay route with the public gateway.
    pub async fn register(&self, route: &RelayRoute) -> hypertuna_sdk::Result<()> {
        let path = format!("{}/{}", route.npub, route.relay_name);
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let url = format!("https://{}/api/v1/relays/register", self.config.host);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "relay": path,
                "groupId": route.group_id,
                "ts": ts,
            }))
            .header("x-hypertuna-signature", self.sign(&path, ts))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("register {path}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "register {path}: {}",
                response.status()
            )));
        }
        tracing::info!(relay = %path, host = %self.config.host, "registered with public gateway");
        Ok(())
    }

    /// Re-register every served relay on an interval, keeping public
    /// routing fresh.
    pub fn spawn_heartbeat(self, gateway: Arc<Gateway>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // skip first immediate tick
            loop {
                interval.tick().await;
                for route in gateway.routes() {
                    if let Err(e) = self.register(&route).await {
                        tracing::warn!("public gateway heartbeat failed: {e}");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypertuna_sdk::events::EventBus;
    use std::time::Duration;

    fn gateway() -> (Arc<Gateway>, Keys, Keys) {
        let relay_keys = Keys::generate();
        let admin = Keys::generate();
        let bus = EventBus::new();
        let auth = Arc::new(AuthTokenStore::new(bus.clone()));
        let challenges = Arc::new(ChallengeStore::new());
        let groups = Groups::with_debounce(
            relay_keys.clone(),
            Arc::clone(&auth),
            bus,
            Duration::from_millis(1),
        );
        let gw = Gateway::new(
            relay_keys.clone(),
            auth,
            challenges,
            groups,
            None,
            GatewayConfig::default(),
        );
        (gw, relay_keys, admin)
    }

    fn bootstrap_group(gw: &Arc<Gateway>, admin: &Keys, group_id: &str) {
        let create = EventBuilder::group_create(group_id, "test group")
            .unwrap()
            .sign_at(admin, 1)
            .unwrap();
        gw.accept_event(group_id, &create).unwrap();
    }

    #[tokio::test]
    async fn accept_event_enforces_authorization() {
        let (gw, _relay, admin) = gateway();
        bootstrap_group(&gw, &admin, "g1");

        let outsider = Keys::generate();
        let message = EventBuilder::group_message("g1", "hello")
            .unwrap()
            .sign_at(&outsider, 2)
            .unwrap();
        let reason = gw.accept_event("g1", &message).unwrap_err();
        assert!(reason.contains("not a member"), "got: {reason}");

        let admin_message = EventBuilder::group_message("g1", "hello")
            .unwrap()
            .sign_at(&admin, 3)
            .unwrap();
        gw.accept_event("g1", &admin_message).unwrap();
    }

    #[tokio::test]
    async fn replay_respects_filters() {
        let (gw, _relay, admin) = gateway();
        bootstrap_group(&gw, &admin, "g1");
        for i in 0..3u64 {
            let message = EventBuilder::group_message("g1", &format!("m{i}"))
                .unwrap()
                .sign_at(&admin, 10 + i)
                .unwrap();
            gw.accept_event("g1", &message).unwrap();
        }
        let all = gw.replay("g1", &[Filter::new().kinds([KIND_TEXT_NOTE_1])]);
        assert_eq!(all.len(), 3);
        let since = gw.replay("g1", &[Filter::new().kinds([KIND_TEXT_NOTE_1]).since(12)]);
        assert_eq!(since.len(), 1);
    }

    #[tokio::test]
    async fn metadata_edit_produces_companion_snapshot() {
        let (gw, _relay, admin) = gateway();
        bootstrap_group(&gw, &admin, "g1");
        let edit = EventBuilder::edit_metadata("g1", "renamed", "new about")
            .unwrap()
            .sign_at(&admin, 5)
            .unwrap();
        gw.accept_event("g1", &edit).unwrap();

        let metadata = gw.groups.with_group("g1", |g| g.metadata.clone()).unwrap();
        assert_eq!(metadata.name, "renamed");
        assert_eq!(metadata.about, "new about");
    }

    #[tokio::test]
    async fn share_tokens_expire_and_resolve() {
        let (gw, _relay, _admin) = gateway();
        let token = gw.mint_share_token("g1");
        assert_eq!(gw.verify_share_token(&token).as_deref(), Some("g1"));
        assert_eq!(gw.verify_share_token("bogus"), None);
    }

    #[test]
    fn registrar_signature_is_stable() {
        let registrar = PublicRegistrar::new(PublicGatewayConfig {
            host: "hypertuna.com".into(),
            shared_secret: "s3cret".into(),
        });
        let a = registrar.sign("npub1x/someRelay", 1000);
        let b = registrar.sign("npub1x/someRelay", 1000);
        let c = registrar.sign("npub1x/someRelay", 1001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
