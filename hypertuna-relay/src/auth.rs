//! Token store and challenge store.
//!
//! Tokens are opaque 32-byte values bound to a `(relay, pubkey)` pair.
//! Lookup by token is an exhaustive match within one relay's map — two
//! keys resolve the same token only that way. Challenges live five
//! minutes, allow five verification attempts, and are swept every
//! minute by a background task.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use hypertuna_sdk::error::Error;
use hypertuna_sdk::events::{AuthEvent, EventBus};
use hypertuna_sdk::Result;

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Token store ────────────────────────────────────────────────────────

/// One issued token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRecord {
    pub token: String,
    pub created_at: u64,
    pub last_used: u64,
}

/// Export form: records keyed by pubkey, one file per relay (§ persisted
/// state layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedAuth {
    pub pubkey: String,
    #[serde(flatten)]
    pub record: AuthRecord,
}

/// In-memory `(relay, pubkey) → token` map.
#[derive(Default)]
pub struct AuthTokenStore {
    inner: Mutex<HashMap<String, HashMap<String, AuthRecord>>>,
    bus: EventBus,
}

impl AuthTokenStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn add_auth(&self, relay: &str, pubkey: &str, token: &str) {
        let now = unix_now();
        self.inner
            .lock()
            .entry(relay.to_string())
            .or_default()
            .insert(
                pubkey.to_string(),
                AuthRecord {
                    token: token.to_string(),
                    created_at: now,
                    last_used: now,
                },
            );
        self.bus.emit_auth(AuthEvent::TokenIssued {
            relay_id: relay.to_string(),
            pubkey: pubkey.to_string(),
        });
    }

    /// Resolve a token to its pubkey within one relay. Updates
    /// `last_used` on a hit.
    pub fn verify_auth(&self, relay: &str, token: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let relay_map = inner.get_mut(relay)?;
        for (pubkey, record) in relay_map.iter_mut() {
            if record.token == token {
                record.last_used = unix_now();
                return Some(pubkey.clone());
            }
        }
        None
    }

    pub fn get_auth_by_pubkey(&self, relay: &str, pubkey: &str) -> Option<AuthRecord> {
        self.inner.lock().get(relay)?.get(pubkey).cloned()
    }

    /// Revoke a token. Returns whether one existed. Revocation is
    /// emitted before this returns so outbound notices always follow it.
    pub fn remove_auth(&self, relay: &str, pubkey: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .get_mut(relay)
            .and_then(|m| m.remove(pubkey))
            .is_some();
        if removed {
            self.bus.emit_auth(AuthEvent::TokenRevoked {
                relay_id: relay.to_string(),
                pubkey: pubkey.to_string(),
            });
        }
        removed
    }

    pub fn export_relay(&self, relay: &str) -> Vec<ExportedAuth> {
        let inner = self.inner.lock();
        let mut out: Vec<ExportedAuth> = inner
            .get(relay)
            .map(|m| {
                m.iter()
                    .map(|(pubkey, record)| ExportedAuth {
                        pubkey: pubkey.clone(),
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        out
    }

    pub fn import_relay(&self, relay: &str, records: Vec<ExportedAuth>) {
        let mut inner = self.inner.lock();
        let relay_map = inner.entry(relay.to_string()).or_default();
        for entry in records {
            relay_map.insert(entry.pubkey, entry.record);
        }
    }

    /// Write one relay's records to a JSON export file.
    pub fn save_relay(&self, relay: &str, path: &Path) -> Result<()> {
        let records = self.export_relay(relay);
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(path, json)
            .map_err(|e| Error::ConfigInvalid(format!("auth export {}: {e}", path.display())))
    }

    /// Load one relay's records from a JSON export file, if present.
    pub fn load_relay(&self, relay: &str, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("auth import {}: {e}", path.display())))?;
        let records: Vec<ExportedAuth> = serde_json::from_str(&json)?;
        let count = records.len();
        self.import_relay(relay, records);
        Ok(count)
    }

    pub fn relays(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

// ── Challenge store ────────────────────────────────────────────────────

pub const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);
pub const CHALLENGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const CHALLENGE_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub challenge: String,
    pub relay_pubkey: String,
    pub identifier: String,
    pub issued_at: Instant,
    pub attempts: u32,
}

/// Pending ECDH challenges keyed by client pubkey.
pub struct ChallengeStore {
    inner: Mutex<HashMap<String, ChallengeRecord>>,
    ttl: Duration,
    max_attempts: u32,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::with_ttl(CHALLENGE_TTL, CHALLENGE_MAX_ATTEMPTS)
    }

    pub fn with_ttl(ttl: Duration, max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            max_attempts,
        }
    }

    /// Issue a challenge for a client. Replaces any previous pending
    /// challenge for the same pubkey.
    pub fn issue(&self, pubkey: &str, relay_pubkey: &str, identifier: &str) -> String {
        let challenge = hypertuna_sdk::crypto::generate_challenge();
        self.inner.lock().insert(
            pubkey.to_string(),
            ChallengeRecord {
                challenge: challenge.clone(),
                relay_pubkey: relay_pubkey.to_string(),
                identifier: identifier.to_string(),
                issued_at: Instant::now(),
                attempts: 0,
            },
        );
        challenge
    }

    /// Retrieve the pending challenge for a verification attempt.
    /// Counts the attempt; the record is purged on expiry or when the
    /// attempt budget runs out.
    pub fn for_verify(&self, pubkey: &str) -> Result<ChallengeRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .get_mut(pubkey)
            .ok_or(Error::ChallengeExpired)?;
        if record.issued_at.elapsed() > self.ttl {
            inner.remove(pubkey);
            return Err(Error::ChallengeExpired);
        }
        record.attempts += 1;
        if record.attempts > self.max_attempts {
            inner.remove(pubkey);
            return Err(Error::ChallengeMaxAttempts);
        }
        Ok(record.clone())
    }

    /// Delete the record after a successful verification.
    pub fn complete(&self, pubkey: &str) {
        self.inner.lock().remove(pubkey);
    }

    /// Drop entries past the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, r| r.issued_at.elapsed() <= self.ttl);
        before - inner.len()
    }

    /// Periodic sweep task. Runs until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHALLENGE_SWEEP_INTERVAL);
            interval.tick().await; // skip first immediate tick
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else { return };
                let pruned = store.sweep();
                if pruned > 0 {
                    tracing::info!("Pruned {pruned} expired challenges");
                }
            }
        })
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AuthTokenStore {
        AuthTokenStore::new(EventBus::new())
    }

    #[test]
    fn verify_returns_pubkey_iff_added_after_remove() {
        let auth = store();
        auth.add_auth("relay1", "alice", "tok-a");
        assert_eq!(auth.verify_auth("relay1", "tok-a").as_deref(), Some("alice"));

        auth.remove_auth("relay1", "alice");
        assert_eq!(auth.verify_auth("relay1", "tok-a"), None);

        auth.add_auth("relay1", "alice", "tok-b");
        assert_eq!(auth.verify_auth("relay1", "tok-b").as_deref(), Some("alice"));
        assert_eq!(auth.verify_auth("relay1", "tok-a"), None);
    }

    #[test]
    fn tokens_are_scoped_per_relay() {
        let auth = store();
        auth.add_auth("relay1", "alice", "tok");
        assert_eq!(auth.verify_auth("relay2", "tok"), None);
    }

    #[test]
    fn verify_updates_last_used() {
        let auth = store();
        auth.add_auth("relay1", "alice", "tok");
        let before = auth.get_auth_by_pubkey("relay1", "alice").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        auth.verify_auth("relay1", "tok").unwrap();
        let after = auth.get_auth_by_pubkey("relay1", "alice").unwrap();
        assert!(after.last_used > before.last_used);
    }

    #[test]
    fn export_import_roundtrip() {
        let auth = store();
        auth.add_auth("relay1", "alice", "tok-a");
        auth.add_auth("relay1", "bob", "tok-b");
        let exported = auth.export_relay("relay1");
        assert_eq!(exported.len(), 2);

        let fresh = store();
        fresh.import_relay("relay1", exported);
        assert_eq!(fresh.verify_auth("relay1", "tok-a").as_deref(), Some("alice"));
        assert_eq!(fresh.verify_auth("relay1", "tok-b").as_deref(), Some("bob"));
    }

    #[test]
    fn export_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay1-auth.json");
        let auth = store();
        auth.add_auth("relay1", "alice", "tok-a");
        auth.save_relay("relay1", &path).unwrap();

        let fresh = store();
        assert_eq!(fresh.load_relay("relay1", &path).unwrap(), 1);
        assert_eq!(fresh.verify_auth("relay1", "tok-a").as_deref(), Some("alice"));
    }

    #[test]
    fn challenge_attempts_are_capped() {
        let challenges = ChallengeStore::new();
        challenges.issue("alice", "relaypk", "relay1");
        for _ in 0..CHALLENGE_MAX_ATTEMPTS {
            challenges.for_verify("alice").unwrap();
        }
        assert!(matches!(
            challenges.for_verify("alice"),
            Err(Error::ChallengeMaxAttempts)
        ));
        // Record purged: the next attempt reads as expired/absent.
        assert!(matches!(
            challenges.for_verify("alice"),
            Err(Error::ChallengeExpired)
        ));
    }

    #[test]
    fn challenge_expiry() {
        let challenges = ChallengeStore::with_ttl(Duration::ZERO, 5);
        challenges.issue("alice", "relaypk", "relay1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            challenges.for_verify("alice"),
            Err(Error::ChallengeExpired)
        ));
    }

    #[test]
    fn challenge_completes_on_success() {
        let challenges = ChallengeStore::new();
        let issued = challenges.issue("alice", "relaypk", "relay1");
        let record = challenges.for_verify("alice").unwrap();
        assert_eq!(record.challenge, issued);
        challenges.complete("alice");
        assert!(challenges.for_verify("alice").is_err());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let challenges = ChallengeStore::with_ttl(Duration::from_secs(3600), 5);
        challenges.issue("alice", "relaypk", "relay1");
        assert_eq!(challenges.sweep(), 0);
        let zero_ttl = ChallengeStore::with_ttl(Duration::ZERO, 5);
        zero_ttl.issue("bob", "relaypk", "relay1");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(zero_ttl.sweep(), 1);
    }
}
