//! Peer substrate: content-addressed drives with watch and topic
//! primitives.
//!
//! The worker requires three capabilities from its peer substrate: a DHT
//! that yields peers for a topic, authenticated append-only logs
//! addressable by 32-byte key, and a content-addressed filesystem with
//! watch and mirror primitives. This module is the in-process reference
//! implementation of the storage half — entries are addressed by key,
//! content-hashed with SHA-256, and every mutation bumps a monotone
//! sequence number and fans out on a watch channel. A DHT-backed
//! implementation plugs in behind the same surface.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

const WATCH_CAPACITY: usize = 1024;

/// Metadata of one drive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEntry {
    pub key: String,
    pub hash: String,
    pub len: u64,
    pub seq: u64,
}

struct StoredEntry {
    hash: String,
    data: Arc<Vec<u8>>,
    seq: u64,
}

struct DriveInner {
    entries: BTreeMap<String, StoredEntry>,
    seq: u64,
}

/// A content-addressed drive. The root id identifies its writer.
pub struct Drive {
    id: String,
    inner: Mutex<DriveInner>,
    watch_tx: broadcast::Sender<String>,
}

impl Drive {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(DriveInner {
                entries: BTreeMap::new(),
                seq: 0,
            }),
            watch_tx: broadcast::channel(WATCH_CAPACITY).0,
        }
    }

    /// The drive's root key (hex).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store bytes at a key. Overwrites; bumps the sequence; notifies
    /// watchers with the changed key.
    pub fn put(&self, key: &str, data: Vec<u8>) -> DriveEntry {
        let hash = hex::encode(Sha256::digest(&data));
        let len = data.len() as u64;
        let seq = {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let seq = inner.seq;
            inner.entries.insert(
                key.to_string(),
                StoredEntry {
                    hash: hash.clone(),
                    data: Arc::new(data),
                    seq,
                },
            );
            seq
        };
        let _ = self.watch_tx.send(key.to_string());
        DriveEntry {
            key: key.to_string(),
            hash,
            len,
            seq,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().entries.get(key).map(|e| Arc::clone(&e.data))
    }

    pub fn entry(&self, key: &str) -> Option<DriveEntry> {
        let inner = self.inner.lock();
        inner.entries.get(key).map(|e| DriveEntry {
            key: key.to_string(),
            hash: e.hash.clone(),
            len: e.data.len() as u64,
            seq: e.seq,
        })
    }

    /// Delete a key. Watchers are notified so mirrors can prune.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.entries.remove(key).is_some();
            if removed {
                inner.seq += 1;
            }
            removed
        };
        if removed {
            let _ = self.watch_tx.send(key.to_string());
        }
        removed
    }

    /// Entries whose key is `prefix` itself or lives under `prefix/`.
    pub fn list_subtree(&self, prefix: &str) -> Vec<DriveEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(key, _)| subtree_matches(prefix, key))
            .map(|(key, e)| DriveEntry {
                key: key.clone(),
                hash: e.hash.clone(),
                len: e.data.len() as u64,
                seq: e.seq,
            })
            .collect()
    }

    /// Current mutation sequence number.
    pub fn version(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Subscribe to changed-key notifications.
    pub fn watch(&self) -> broadcast::Receiver<String> {
        self.watch_tx.subscribe()
    }

    /// Wait for the drive to be current. The in-process substrate is
    /// always current; a networked implementation blocks here until the
    /// first peer round-trip.
    pub async fn update(&self) -> u64 {
        self.version()
    }
}

/// The subtree filter used by mirrors: the folder key itself or
/// anything under it.
pub fn subtree_matches(folder: &str, key: &str) -> bool {
    key == folder || key.starts_with(&format!("{folder}/"))
}

/// Handle for membership in a shared peer topic. Refcounted; `release`
/// leaves the topic once the last handle goes.
pub struct TopicHandle {
    store: Arc<DriveStore>,
    topic: String,
    released: bool,
}

impl TopicHandle {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut topics = self.store.topics.lock();
        if let Some(count) = topics.get_mut(&self.topic) {
            *count -= 1;
            if *count == 0 {
                topics.remove(&self.topic);
                tracing::debug!(topic = %self.topic, "left topic");
            }
        }
    }
}

impl Drop for TopicHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// The worker's view of the substrate: one local drive (sole writer)
/// plus dormant handles to remote peers' drives, keyed by hex root key.
pub struct DriveStore {
    local: Arc<Drive>,
    remotes: Mutex<HashMap<String, Arc<Drive>>>,
    topics: Mutex<HashMap<String, usize>>,
}

impl DriveStore {
    pub fn new(local_key: impl Into<String>) -> Arc<Self> {
        let local_key = local_key.into();
        Arc::new(Self {
            local: Arc::new(Drive::new(local_key)),
            remotes: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
        })
    }

    pub fn local(&self) -> Arc<Drive> {
        Arc::clone(&self.local)
    }

    /// Open (or reuse) a handle to a remote drive by key. Handles stay
    /// dormant between mirrors because the underlying store is shared.
    pub fn open_remote(&self, key: &str) -> Arc<Drive> {
        let mut remotes = self.remotes.lock();
        Arc::clone(
            remotes
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Drive::new(key))),
        )
    }

    /// Install a concrete remote drive (peer replication delivers these;
    /// tests inject them directly).
    pub fn insert_remote(&self, drive: Arc<Drive>) {
        self.remotes.lock().insert(drive.id().to_string(), drive);
    }

    /// Join a shared peer topic. Returns a refcounted handle.
    pub fn join_topic(self: &Arc<Self>, topic: &str) -> TopicHandle {
        let mut topics = self.topics.lock();
        let count = topics.entry(topic.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            tracing::debug!(topic = %topic, "joined topic");
        }
        TopicHandle {
            store: Arc::clone(self),
            topic: topic.to_string(),
            released: false,
        }
    }

    pub fn topic_members(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).copied().unwrap_or(0)
    }
}
