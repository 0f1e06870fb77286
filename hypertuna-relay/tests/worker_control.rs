//! Control-channel protocol behavior that doesn't need a live peer.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use hypertuna_relay::config::WorkerConfig;
use hypertuna_relay::worker::Worker;
use hypertuna_sdk::Keys;

fn test_config(data_dir: &str) -> WorkerConfig {
    WorkerConfig {
        gateway_addr: "127.0.0.1:0".into(),
        data_dir: data_dir.into(),
        db_path: Some(":memory:".into()),
        control_channel: true,
        public_register: false,
        public_gateway: "hypertuna.com".into(),
        public_gateway_secret: None,
        member_debounce_ms: 10,
        max_conns_per_ip: 20,
    }
}

struct Channel {
    lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

impl Channel {
    async fn send(&mut self, value: Value) {
        let line = serde_json::to_string(&value).unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("response in time")
            .unwrap()
            .expect("channel open");
        serde_json::from_str(&line).unwrap()
    }
}

async fn spawn_worker(config: WorkerConfig) -> Channel {
    let (test_side, worker_side) = tokio::io::duplex(64 * 1024);
    let (worker_read, worker_write) = tokio::io::split(worker_side);
    tokio::spawn(async move {
        let _ = Worker::new(config)
            .run(BufReader::new(worker_read), worker_write)
            .await;
    });
    let (test_read, test_write) = tokio::io::split(test_side);
    Channel {
        lines: BufReader::new(test_read).lines(),
        writer: test_write,
    }
}

fn config_message(keys: &Keys) -> Value {
    json!({
        "type": "config",
        "data": {
            "nostr_pubkey_hex": keys.public_key_hex(),
            "nostr_npub": keys.npub(),
            "nostr_nsec": hex::encode(keys.secret_bytes()),
            "apiUrl": "https://api.test",
        }
    })
}

#[tokio::test]
async fn commands_before_config_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut channel = spawn_worker(test_config(dir.path().to_str().unwrap())).await;
    channel
        .send(json!({
            "type": "create-relay",
            "data": { "name": "Too Early" }
        }))
        .await;
    let response = channel.recv().await;
    assert_eq!(response["type"], "error");
    assert!(response["data"]["message"]
        .as_str()
        .unwrap()
        .contains("not configured"));
}

#[tokio::test]
async fn config_with_mismatched_pubkey_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut channel = spawn_worker(test_config(dir.path().to_str().unwrap())).await;
    let keys = Keys::generate();
    let other = Keys::generate();
    channel
        .send(json!({
            "type": "config",
            "data": {
                "nostr_pubkey_hex": other.public_key_hex(),
                "nostr_nsec": hex::encode(keys.secret_bytes()),
            }
        }))
        .await;
    let response = channel.recv().await;
    assert_eq!(response["type"], "relay-initialization-failed");
}

#[tokio::test]
async fn pfp_upload_roundtrip() {
    use base64::Engine;
    let dir = tempfile::tempdir().unwrap();
    let mut channel = spawn_worker(test_config(dir.path().to_str().unwrap())).await;
    let keys = Keys::generate();
    channel.send(config_message(&keys)).await;
    assert_eq!(channel.recv().await["data"]["initialized"], true);

    let bytes = b"fake png bytes";
    channel
        .send(json!({
            "type": "upload-pfp",
            "data": {
                "owner": keys.public_key_hex(),
                "fileHash": "abc123",
                "metadata": { "mime": "image/png" },
                "buffer": base64::engine::general_purpose::STANDARD.encode(bytes),
            }
        }))
        .await;
    let response = channel.recv().await;
    assert_eq!(response["type"], "upload-pfp-complete");
    assert_eq!(response["data"]["fileHash"], "abc123");

    // A non-base64 buffer errors without killing the worker.
    channel
        .send(json!({
            "type": "upload-pfp",
            "data": {
                "owner": keys.public_key_hex(),
                "fileHash": "def456",
                "buffer": "!!! not base64 !!!",
            }
        }))
        .await;
    let response = channel.recv().await;
    assert_eq!(response["type"], "upload-pfp-error");

    channel.send(json!({ "type": "shutdown" })).await;
    assert_eq!(channel.recv().await["data"]["shutdown"], true);
}

#[tokio::test]
async fn member_update_and_auth_revocation() {
    let dir = tempfile::tempdir().unwrap();
    let mut channel = spawn_worker(test_config(dir.path().to_str().unwrap())).await;
    let keys = Keys::generate();
    channel.send(config_message(&keys)).await;
    assert_eq!(channel.recv().await["data"]["initialized"], true);

    channel
        .send(json!({
            "type": "create-relay",
            "data": { "name": "Members Here", "isPublic": true }
        }))
        .await;
    let created = channel.recv().await;
    let group_id = created["data"]["publicIdentifier"].as_str().unwrap().to_string();
    let relay_key = created["data"]["relayKey"].as_str().unwrap().to_string();

    let member = Keys::generate().public_key_hex();
    channel
        .send(json!({
            "type": "update-members",
            "data": {
                "relayKey": relay_key,
                "publicIdentifier": group_id,
                "members": [
                    { "pubkey": member, "roles": ["member"], "token": "tok-m" },
                ],
            }
        }))
        .await;
    let updated = channel.recv().await;
    assert_eq!(updated["type"], "members-updated");
    assert_eq!(updated["data"]["count"], 1);

    channel
        .send(json!({
            "type": "remove-auth-data",
            "data": {
                "relayKey": relay_key,
                "publicIdentifier": group_id,
                "pubkey": member,
            }
        }))
        .await;
    let removed = channel.recv().await;
    assert_eq!(removed["type"], "auth-removed");
    assert_eq!(removed["data"]["success"], true);

    channel.send(json!({ "type": "shutdown" })).await;
    assert_eq!(channel.recv().await["data"]["shutdown"], true);
}

#[tokio::test]
async fn disconnect_relay_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut channel = spawn_worker(test_config(dir.path().to_str().unwrap())).await;
    let keys = Keys::generate();
    channel.send(config_message(&keys)).await;
    assert_eq!(channel.recv().await["data"]["initialized"], true);

    channel
        .send(json!({
            "type": "create-relay",
            "data": { "name": "Short Lived" }
        }))
        .await;
    let created = channel.recv().await;
    let group_id = created["data"]["publicIdentifier"].as_str().unwrap().to_string();
    let relay_key = created["data"]["relayKey"].as_str().unwrap().to_string();

    channel
        .send(json!({
            "type": "disconnect-relay",
            "data": { "relayKey": relay_key, "identifier": group_id }
        }))
        .await;
    let disconnected = channel.recv().await;
    assert_eq!(disconnected["type"], "relay-disconnected");
    assert_eq!(disconnected["data"]["publicIdentifier"], group_id.as_str());

    channel.send(json!({ "type": "shutdown" })).await;
    assert_eq!(channel.recv().await["data"]["shutdown"], true);
}
