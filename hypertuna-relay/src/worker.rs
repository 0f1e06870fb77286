//! Worker control channel: newline-delimited JSON messages between the
//! app shell and the relay core.
//!
//! Each inbound message is `{"type": "...", "data": {...}}`; responses
//! are emitted on the same framing. The worker is inert until a
//! `config` message arrives, which builds the core (keys, group
//! projections, gateway listener, drive store) and answers with
//! `status {initialized: true, swarmKey}`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use hypertuna_sdk::event::EventBuilder;
use hypertuna_sdk::events::EventBus;
use hypertuna_sdk::handshake;
use hypertuna_sdk::{Keys, Role};

use crate::auth::{AuthTokenStore, ChallengeStore};
use crate::config::{camel_case_relay_name, WorkerConfig};
use crate::db::Db;
use crate::drive::DriveStore;
use crate::gateway::{Gateway, GatewayConfig, PublicGatewayConfig, PublicRegistrar};
use crate::group::{GroupMetadata, Groups};
use crate::mirror::{DriveMirror, MirrorOptions};

// ── Inbound messages ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ControlMessage {
    Config(ConfigData),
    CreateRelay(CreateRelayData),
    StartJoinFlow(StartJoinFlowData),
    JoinRelay(JoinRelayData),
    DisconnectRelay(DisconnectRelayData),
    UpdateMembers(UpdateMembersData),
    RemoveAuthData(RemoveAuthDataData),
    UploadPfp(UploadPfpData),
    Shutdown,
}

#[derive(Debug, Deserialize)]
pub struct ConfigData {
    #[serde(default)]
    pub nostr_pubkey_hex: String,
    #[serde(default)]
    pub nostr_npub: String,
    pub nostr_nsec: String,
    #[serde(rename = "apiUrl", default)]
    pub api_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelayData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub file_sharing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJoinFlowData {
    pub public_identifier: String,
    #[serde(default)]
    pub file_sharing: bool,
    pub host_peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRelayData {
    pub relay_key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub public_identifier: String,
    pub auth_token: String,
    #[serde(default)]
    pub file_sharing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRelayData {
    pub relay_key: String,
    pub identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMembersData {
    pub relay_key: String,
    pub public_identifier: String,
    pub members: Vec<MemberEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MemberEntry {
    pub pubkey: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAuthDataData {
    pub relay_key: String,
    pub public_identifier: String,
    pub pubkey: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPfpData {
    pub owner: String,
    pub file_hash: String,
    #[serde(default)]
    pub metadata: Value,
    pub buffer: String,
}

// ── The core, built on `config` ────────────────────────────────────────

/// Mirrored subtree for a group's shared files.
fn group_folder(public_identifier: &str) -> String {
    format!("groups/{public_identifier}")
}

struct WorkerCore {
    keys: Keys,
    npub: String,
    auth: Arc<AuthTokenStore>,
    groups: Groups,
    gateway: Arc<Gateway>,
    drives: Arc<DriveStore>,
    mirror: DriveMirror,
    swarm_key: String,
    gateway_addr: std::net::SocketAddr,
    /// relayKey → publicIdentifier for disconnects.
    relay_keys: Mutex<std::collections::HashMap<String, String>>,
    config: WorkerConfig,
    _sweeper: tokio::task::JoinHandle<()>,
    _server: tokio::task::JoinHandle<()>,
}

impl WorkerCore {
    async fn build(config: WorkerConfig, data: ConfigData) -> Result<Arc<Self>> {
        let keys = if !data.nostr_nsec.is_empty() {
            if data.nostr_nsec.starts_with("nsec1") {
                Keys::from_nsec(&data.nostr_nsec)?
            } else {
                Keys::from_secret_hex(&data.nostr_nsec)?
            }
        } else {
            anyhow::bail!("config message carries no nostr_nsec");
        };
        if !data.nostr_pubkey_hex.is_empty() && data.nostr_pubkey_hex != keys.public_key_hex() {
            anyhow::bail!("nostr_pubkey_hex does not match nostr_nsec");
        }
        let npub = keys.npub();

        // The drive root key is derived from the identity so the same
        // user always presents the same writer key to the swarm.
        let swarm_key = {
            let mut hasher = Sha256::new();
            hasher.update(keys.secret_bytes());
            hasher.update(b"hypertuna-drive-v1");
            hex::encode(hasher.finalize())
        };

        let bus = EventBus::new();
        let auth = Arc::new(AuthTokenStore::new(bus.clone()));
        let challenges = Arc::new(ChallengeStore::new());
        let sweeper = challenges.spawn_sweeper();
        let groups = Groups::with_debounce(
            keys.clone(),
            Arc::clone(&auth),
            bus,
            Duration::from_millis(config.member_debounce_ms),
        );

        let db = match config.db_path().as_str() {
            ":memory:" => None,
            path => match Db::open(path) {
                Ok(db) => Some(db),
                Err(e) => {
                    tracing::error!("failed to open {path}: {e}; continuing without persistence");
                    None
                }
            },
        };

        let public = if config.public_register {
            match &config.public_gateway_secret {
                Some(secret) => Some(PublicGatewayConfig {
                    host: config.public_gateway.clone(),
                    shared_secret: secret.clone(),
                }),
                None => {
                    anyhow::bail!("--public-register requires --public-gateway-secret");
                }
            }
        } else {
            None
        };

        let gateway = Gateway::new(
            keys.clone(),
            Arc::clone(&auth),
            challenges,
            groups.clone(),
            db,
            GatewayConfig {
                max_conns_per_ip: config.max_conns_per_ip,
                public: public.clone(),
            },
        );

        // Reload persisted groups and their recent history.
        for (group_id, metadata) in gateway.load_persisted_groups() {
            groups.ensure_group(&group_id, metadata.clone());
            let name = camel_case_relay_name(&metadata.name);
            if !name.is_empty() {
                gateway.register_relay(&npub, &name, &group_id);
            }
            gateway.seed_history(&group_id, gateway.load_persisted_messages(&group_id));
            let _ = auth.load_relay(&group_id, &config.auth_export_path(&group_id));
        }

        let listener = tokio::net::TcpListener::bind(&config.gateway_addr)
            .await
            .with_context(|| format!("bind gateway on {}", config.gateway_addr))?;
        let gateway_addr = listener.local_addr()?;
        tracing::info!("gateway listening on {gateway_addr}");
        let router = gateway.router();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await
            {
                tracing::error!("gateway server error: {e}");
            }
        });

        if let Some(public) = public {
            PublicRegistrar::new(public).spawn_heartbeat(Arc::clone(&gateway));
        }

        let drives = DriveStore::new(swarm_key.clone());
        let mirror = DriveMirror::new(Arc::clone(&drives), MirrorOptions::default());

        Ok(Arc::new(Self {
            keys,
            npub,
            auth,
            groups,
            gateway,
            drives,
            mirror,
            swarm_key,
            gateway_addr,
            relay_keys: Mutex::new(std::collections::HashMap::new()),
            config,
            _sweeper: sweeper,
            _server: server,
        }))
    }

    fn transport_url(&self, relay_name: &str) -> String {
        format!("wss://{}/{}/{}", self.gateway_addr, self.npub, relay_name)
    }

    fn flush(&self) {
        for relay in self.auth.relays() {
            let path = self.config.auth_export_path(&relay);
            if let Err(e) = self.auth.save_relay(&relay, &path) {
                tracing::warn!(relay = %relay, "auth export failed: {e}");
            }
        }
    }
}

// ── The worker loop ────────────────────────────────────────────────────

pub struct Worker {
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Drive the control channel until `shutdown` or EOF.
    pub async fn run<R, W>(self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut core: Option<Arc<WorkerCore>> = None;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message: ControlMessage = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("unparseable control message: {e}");
                    respond(&mut writer, "error", json!({ "message": e.to_string() })).await?;
                    continue;
                }
            };

            match message {
                ControlMessage::Config(data) => {
                    match WorkerCore::build(self.config.clone(), data).await {
                        Ok(built) => {
                            respond(
                                &mut writer,
                                "status",
                                json!({
                                    "initialized": true,
                                    "swarmKey": built.swarm_key,
                                    "gatewayAddr": built.gateway_addr.to_string(),
                                }),
                            )
                            .await?;
                            core = Some(built);
                        }
                        // ConfigInvalid is fatal at startup.
                        Err(e) => {
                            respond(
                                &mut writer,
                                "relay-initialization-failed",
                                json!({ "message": e.to_string() }),
                            )
                            .await?;
                            anyhow::bail!("invalid configuration: {e}");
                        }
                    }
                }
                ControlMessage::Shutdown => {
                    if let Some(core) = &core {
                        core.mirror.stop_all();
                        core.flush();
                    }
                    respond(&mut writer, "status", json!({ "shutdown": true })).await?;
                    break;
                }
                other => {
                    let Some(core) = &core else {
                        respond(
                            &mut writer,
                            "error",
                            json!({ "message": "worker not configured" }),
                        )
                        .await?;
                        continue;
                    };
                    handle_message(core, other, &mut writer).await?;
                }
            }
        }
        Ok(())
    }
}

async fn handle_message<W: AsyncWrite + Unpin>(
    core: &Arc<WorkerCore>,
    message: ControlMessage,
    writer: &mut W,
) -> Result<()> {
    match message {
        ControlMessage::CreateRelay(data) => {
            match create_relay(core, &data) {
                Ok((relay_key, public_identifier)) => {
                    respond(
                        writer,
                        "relay-created",
                        json!({
                            "success": true,
                            "relayKey": relay_key,
                            "publicIdentifier": public_identifier,
                        }),
                    )
                    .await?;
                }
                Err(e) => {
                    respond(
                        writer,
                        "relay-created",
                        json!({ "success": false, "message": e.to_string() }),
                    )
                    .await?;
                }
            }
        }
        ControlMessage::StartJoinFlow(data) => {
            start_join_flow(core, &data, writer).await?;
        }
        ControlMessage::JoinRelay(data) => {
            join_relay(core, &data);
            respond(
                writer,
                "relay-joined",
                json!({ "success": true, "publicIdentifier": data.public_identifier }),
            )
            .await?;
        }
        ControlMessage::DisconnectRelay(data) => {
            let public_identifier = core
                .relay_keys
                .lock()
                .remove(&data.relay_key)
                .unwrap_or_else(|| data.identifier.clone());
            core.mirror
                .stop(&data.relay_key, &group_folder(&public_identifier));
            core.gateway.unregister_relay(&public_identifier);
            core.groups.remove_group(&public_identifier);
            respond(
                writer,
                "relay-disconnected",
                json!({ "publicIdentifier": public_identifier }),
            )
            .await?;
        }
        ControlMessage::UpdateMembers(data) => {
            let count = update_members(core, &data)?;
            respond(
                writer,
                "members-updated",
                json!({ "publicIdentifier": data.public_identifier, "count": count }),
            )
            .await?;
        }
        ControlMessage::RemoveAuthData(data) => {
            let removed = core.auth.remove_auth(&data.public_identifier, &data.pubkey);
            respond(
                writer,
                "auth-removed",
                json!({ "success": removed, "pubkey": data.pubkey }),
            )
            .await?;
        }
        ControlMessage::UploadPfp(data) => match B64.decode(&data.buffer) {
            Ok(bytes) => {
                let key = format!("pfp/{}/{}", data.owner, data.file_hash);
                core.drives.local().put(&key, bytes);
                respond(
                    writer,
                    "upload-pfp-complete",
                    json!({ "owner": data.owner, "fileHash": data.file_hash }),
                )
                .await?;
            }
            Err(e) => {
                respond(
                    writer,
                    "upload-pfp-error",
                    json!({ "owner": data.owner, "message": format!("bad buffer: {e}") }),
                )
                .await?;
            }
        },
        ControlMessage::Config(_) | ControlMessage::Shutdown => unreachable!("handled by caller"),
    }
    Ok(())
}

fn create_relay(core: &Arc<WorkerCore>, data: &CreateRelayData) -> Result<(String, String)> {
    if data.name.trim().is_empty() {
        anyhow::bail!("relay name must be non-empty");
    }
    let now = unix_now();
    let public_identifier = {
        let mut hasher = Sha256::new();
        hasher.update(data.name.as_bytes());
        hasher.update(core.keys.public_key_hex().as_bytes());
        hasher.update(now.to_be_bytes());
        hex::encode(hasher.finalize())
    };
    let relay_key = {
        let mut bytes = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    };
    let relay_name = camel_case_relay_name(&data.name);

    let metadata = GroupMetadata {
        name: data.name.clone(),
        about: data.description.clone(),
        is_public: data.is_public,
        is_open: data.is_open,
        file_sharing: data.file_sharing,
        swarm_id: Some(relay_key.clone()),
        transport_url: Some(core.transport_url(&relay_name)),
        created_at: now,
    };
    core.groups.ensure_group(&public_identifier, metadata.clone());
    core.gateway
        .register_relay(&core.npub, &relay_name, &public_identifier);

    let create = EventBuilder::group_create(&public_identifier, &data.name)?
        .sign_at(&core.keys, now)?;
    core.gateway
        .accept_event(&public_identifier, &create)
        .map_err(|reason| anyhow::anyhow!("create event rejected: {reason}"))?;
    let snapshot = EventBuilder::group_metadata(
        &public_identifier,
        &data.name,
        &data.description,
        data.is_public,
        data.is_open,
    )?
    .sign_at(&core.keys, now)?;
    core.gateway
        .accept_event(&public_identifier, &snapshot)
        .map_err(|reason| anyhow::anyhow!("metadata snapshot rejected: {reason}"))?;

    core.gateway.persist_group(&public_identifier, &metadata);
    core.relay_keys
        .lock()
        .insert(relay_key.clone(), public_identifier.clone());
    Ok((relay_key, public_identifier))
}

async fn start_join_flow<W: AsyncWrite + Unpin>(
    core: &Arc<WorkerCore>,
    data: &StartJoinFlowData,
    writer: &mut W,
) -> Result<()> {
    let mut last_error = String::from("no host peers supplied");
    for peer_url in &data.host_peers {
        if url::Url::parse(peer_url).is_err() {
            last_error = format!("invalid host peer url: {peer_url}");
            tracing::warn!("{last_error}");
            continue;
        }
        respond(
            writer,
            "join-auth-progress",
            json!({
                "publicIdentifier": data.public_identifier,
                "hostPeer": peer_url,
                "stage": "connecting",
            }),
        )
        .await?;

        let mut stages = Vec::new();
        let result = handshake::authenticate(peer_url, &core.keys, |p| {
            stages.push(format!("{p:?}"));
        })
        .await;
        for stage in stages {
            respond(
                writer,
                "join-auth-progress",
                json!({
                    "publicIdentifier": data.public_identifier,
                    "hostPeer": peer_url,
                    "stage": stage,
                }),
            )
            .await?;
        }

        match result {
            Ok(token) => {
                core.auth
                    .add_auth(&data.public_identifier, &core.keys.public_key_hex(), &token);
                respond(
                    writer,
                    "join-auth-success",
                    json!({
                        "publicIdentifier": data.public_identifier,
                        "hostPeer": peer_url,
                        "authToken": token,
                    }),
                )
                .await?;
                return Ok(());
            }
            Err(e) => {
                tracing::info!(peer = %peer_url, "join handshake failed: {e}");
                last_error = e.to_string();
            }
        }
    }
    respond(
        writer,
        "join-auth-error",
        json!({
            "publicIdentifier": data.public_identifier,
            "message": last_error,
        }),
    )
    .await?;
    Ok(())
}

fn join_relay(core: &Arc<WorkerCore>, data: &JoinRelayData) {
    let relay_name = camel_case_relay_name(&data.name);
    core.groups.ensure_group(
        &data.public_identifier,
        GroupMetadata {
            name: data.name.clone(),
            about: data.description.clone(),
            file_sharing: data.file_sharing,
            swarm_id: Some(data.relay_key.clone()),
            transport_url: Some(core.transport_url(&relay_name)),
            ..GroupMetadata::default()
        },
    );
    core.auth.add_auth(
        &data.public_identifier,
        &core.keys.public_key_hex(),
        &data.auth_token,
    );
    core.gateway
        .register_relay(&core.npub, &relay_name, &data.public_identifier);
    core.relay_keys
        .lock()
        .insert(data.relay_key.clone(), data.public_identifier.clone());
    if data.file_sharing {
        core.mirror
            .ensure_remote_mirror(&data.relay_key, &group_folder(&data.public_identifier));
    }
}

fn update_members(core: &Arc<WorkerCore>, data: &UpdateMembersData) -> Result<usize> {
    for member in &data.members {
        if let Some(token) = &member.token {
            core.auth
                .add_auth(&data.public_identifier, &member.pubkey, token);
        }
    }
    let snapshot = EventBuilder::group_members(
        &data.public_identifier,
        data.members.iter().map(|m| m.pubkey.as_str()),
    )?
    .sign(&core.keys)?;
    core.gateway
        .accept_event(&data.public_identifier, &snapshot)
        .map_err(|reason| anyhow::anyhow!("member snapshot rejected: {reason}"))?;

    // Explicit admin roles in the pushed set also refresh the admin list.
    let admins: Vec<(&str, &[Role])> = data
        .members
        .iter()
        .filter(|m| m.roles.iter().any(|r| r == "admin"))
        .map(|m| (m.pubkey.as_str(), &[Role::Admin][..]))
        .collect();
    if !admins.is_empty() {
        let snapshot =
            EventBuilder::group_admins(&data.public_identifier, admins)?.sign(&core.keys)?;
        core.gateway
            .accept_event(&data.public_identifier, &snapshot)
            .map_err(|reason| anyhow::anyhow!("admin snapshot rejected: {reason}"))?;
    }
    Ok(data.members.len())
}

async fn respond<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: &str,
    data: Value,
) -> Result<()> {
    let line = serde_json::to_string(&json!({ "type": message_type, "data": data }))?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
