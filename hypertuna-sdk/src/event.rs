//! Signed events: canonical serialization, id hashing, signature verify,
//! tag accessors and per-kind builders.
//!
//! An event is an immutable record `{id, pubkey, created_at, kind, tags,
//! content, sig}`. The id is the lowercase-hex SHA-256 of the canonical
//! serialization `[0, pubkey, created_at, kind, tags, content]` (compact
//! JSON, tag order preserved); `sig` is a BIP-340 Schnorr signature over
//! the 32-byte id by `pubkey`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::keys::{verify_signature, Keys};
use crate::Result;

// ── Event kinds consumed and produced by the core ──────────────────────

pub const KIND_PROFILE_0: u16 = 0;
pub const KIND_TEXT_NOTE_1: u16 = 1;
pub const KIND_CONTACTS_3: u16 = 3;
pub const KIND_GROUP_ADD_USER_9000: u16 = 9000;
pub const KIND_GROUP_REMOVE_USER_9001: u16 = 9001;
pub const KIND_GROUP_EDIT_METADATA_9002: u16 = 9002;
pub const KIND_GROUP_CREATE_9007: u16 = 9007;
pub const KIND_GROUP_INVITE_9009: u16 = 9009;
pub const KIND_GROUP_JOIN_REQUEST_9021: u16 = 9021;
pub const KIND_RELAY_LIST_10009: u16 = 10009;
pub const KIND_PEER_RECORD_30166: u16 = 30166;
pub const KIND_GROUP_METADATA_39000: u16 = 39000;
pub const KIND_GROUP_ADMINS_39001: u16 = 39001;
pub const KIND_GROUP_MEMBERS_39002: u16 = 39002;

/// Every kind the core recognises. Events outside this set fail
/// validation and are never projected.
pub const KNOWN_KINDS: &[u16] = &[
    KIND_PROFILE_0,
    KIND_TEXT_NOTE_1,
    KIND_CONTACTS_3,
    KIND_GROUP_ADD_USER_9000,
    KIND_GROUP_REMOVE_USER_9001,
    KIND_GROUP_EDIT_METADATA_9002,
    KIND_GROUP_CREATE_9007,
    KIND_GROUP_INVITE_9009,
    KIND_GROUP_JOIN_REQUEST_9021,
    KIND_RELAY_LIST_10009,
    KIND_PEER_RECORD_30166,
    KIND_GROUP_METADATA_39000,
    KIND_GROUP_ADMINS_39001,
    KIND_GROUP_MEMBERS_39002,
];

/// Role a pubkey can hold inside a group. The set is closed; anything
/// else is rejected at the builder boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(Error::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── The event record ───────────────────────────────────────────────────

/// A signed event. Read-only once created; mutating a field invalidates
/// both the id and the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Canonical serialization used for hashing:
    /// `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
    pub fn canonical(&self) -> String {
        serde_json::to_string(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .expect("canonical form always serializes")
    }

    /// Recompute the id from the canonical form.
    pub fn compute_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical().as_bytes()))
    }

    /// Structural validation performed before an event may enter any
    /// projection: id recomputes, signature verifies, kind is known,
    /// sig has the fixed 64-byte length.
    pub fn validate(&self) -> Result<()> {
        if self.id.len() != 64 || !self.id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::EventMalformed(format!("bad id: {}", &self.id)));
        }
        if self.pubkey.len() != 64 || hex::decode(&self.pubkey).is_err() {
            return Err(Error::EventMalformed("bad pubkey".into()));
        }
        if !KNOWN_KINDS.contains(&self.kind) {
            return Err(Error::EventMalformed(format!("unknown kind {}", self.kind)));
        }
        if self.compute_id() != self.id {
            return Err(Error::EventMalformed("id does not recompute".into()));
        }
        let sig = hex::decode(&self.sig).map_err(|_| Error::EventSignatureInvalid)?;
        if sig.len() != 64 {
            return Err(Error::EventSignatureInvalid);
        }
        let id_bytes = hex::decode(&self.id).expect("validated hex above");
        verify_signature(&self.pubkey, &id_bytes, &sig)
    }

    // ── Tag accessors ──────────────────────────────────────────────────

    /// Value of the first tag named `name`, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    /// All tags named `name`, whole-tag form (for multi-element tags
    /// such as `["p", pubkey, role, token]`).
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .map(|t| t.as_slice())
    }

    /// Whether any tag `name` carries `value`.
    pub fn has_tag_value(&self, name: &str, value: &str) -> bool {
        self.tag_values(name).any(|v| v == value)
    }

    /// Membership predicate for single-tag markers such as `["public"]`.
    pub fn has_marker(&self, name: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.len() == 1 && t[0] == name)
    }

    /// The group id an event addresses, from its `h` tag (messages and
    /// moderation kinds) or `d` tag (39000-series snapshots).
    pub fn group_id(&self) -> Option<&str> {
        match self.kind {
            KIND_GROUP_METADATA_39000 | KIND_GROUP_ADMINS_39001 | KIND_GROUP_MEMBERS_39002 => {
                self.tag_value("d")
            }
            _ => self.tag_value("h"),
        }
    }

    /// Short id prefix used in log context.
    pub fn id_prefix(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

// ── Builder ────────────────────────────────────────────────────────────

/// Composes an event kind by tag accretion, then signs it.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: u16,
    content: String,
    tags: Vec<Vec<String>>,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl EventBuilder {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
        }
    }

    /// Append a tag. Order is preserved into the canonical form.
    pub fn tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    /// Sign with `created_at` = now.
    pub fn sign(self, keys: &Keys) -> Result<Event> {
        self.sign_at(keys, unix_now())
    }

    /// Sign with an explicit timestamp (deterministic tests, replays).
    pub fn sign_at(self, keys: &Keys, created_at: u64) -> Result<Event> {
        let mut event = Event {
            id: String::new(),
            pubkey: keys.public_key_hex(),
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: String::new(),
        };
        event.id = event.compute_id();
        let id_bytes = hex::decode(&event.id).expect("sha256 hex");
        event.sig = hex::encode(keys.sign(&id_bytes));
        Ok(event)
    }

    // ── Kind-specific constructors ─────────────────────────────────────
    //
    // Inputs are validated here so malformed group events cannot be
    // produced locally: names must be non-empty, roles must come from
    // the closed set.

    /// Kind 9007: create a group.
    pub fn group_create(group_id: &str, name: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("name", name)?;
        Ok(Self::new(KIND_GROUP_CREATE_9007, "")
            .tag(["h", group_id])
            .tag(["name", name]))
    }

    /// Kind 39000: authoritative group metadata snapshot.
    pub fn group_metadata(
        group_id: &str,
        name: &str,
        about: &str,
        is_public: bool,
        is_open: bool,
    ) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("name", name)?;
        let mut b = Self::new(KIND_GROUP_METADATA_39000, "")
            .tag(["d", group_id])
            .tag(["name", name]);
        if !about.is_empty() {
            b = b.tag(["about", about]);
        }
        b = b.tag([if is_public { "public" } else { "private" }]);
        b = b.tag([if is_open { "open" } else { "closed" }]);
        Ok(b)
    }

    /// Kind 39001: authoritative admin list snapshot.
    pub fn group_admins<'a>(
        group_id: &str,
        admins: impl IntoIterator<Item = (&'a str, &'a [Role])>,
    ) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        let mut b = Self::new(KIND_GROUP_ADMINS_39001, "").tag(["d", group_id]);
        for (pubkey, roles) in admins {
            let mut tag = vec!["p".to_string(), pubkey.to_string()];
            tag.extend(roles.iter().map(|r| r.as_str().to_string()));
            b.tags.push(tag);
        }
        Ok(b)
    }

    /// Kind 39002: authoritative member list snapshot.
    pub fn group_members<'a>(
        group_id: &str,
        members: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        let mut b = Self::new(KIND_GROUP_MEMBERS_39002, "").tag(["d", group_id]);
        for pubkey in members {
            b = b.tag(["p", pubkey]);
        }
        Ok(b)
    }

    /// Kind 9000: add a user to a group. `token`, when present, is the
    /// relay auth token delivered to the added user.
    pub fn add_user(
        group_id: &str,
        pubkey: &str,
        roles: &[Role],
        token: Option<&str>,
    ) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("pubkey", pubkey)?;
        let mut tag = vec!["p".to_string(), pubkey.to_string()];
        if roles.is_empty() {
            tag.push(Role::Member.as_str().to_string());
        } else {
            tag.extend(roles.iter().map(|r| r.as_str().to_string()));
        }
        if let Some(token) = token {
            tag.push(token.to_string());
        }
        let mut b = Self::new(KIND_GROUP_ADD_USER_9000, "").tag(["h", group_id]);
        b.tags.push(tag);
        Ok(b)
    }

    /// Kind 9001: remove a user from a group.
    pub fn remove_user(group_id: &str, pubkey: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("pubkey", pubkey)?;
        Ok(Self::new(KIND_GROUP_REMOVE_USER_9001, "")
            .tag(["h", group_id])
            .tag(["p", pubkey]))
    }

    /// Kind 9002: edit group metadata. The authoring relay answers with a
    /// companion 39000 snapshot; consumers project only the snapshot.
    pub fn edit_metadata(group_id: &str, name: &str, about: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("name", name)?;
        let mut b = Self::new(KIND_GROUP_EDIT_METADATA_9002, "")
            .tag(["h", group_id])
            .tag(["name", name]);
        if !about.is_empty() {
            b = b.tag(["about", about]);
        }
        Ok(b)
    }

    /// Kind 9009: invite envelope. `content` is the ECDH-encrypted
    /// payload for the invitee (see [`crate::crypto::encrypt_payload`]).
    pub fn invite(group_id: &str, invitee_pubkey: &str, encrypted_content: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("invitee", invitee_pubkey)?;
        Ok(Self::new(KIND_GROUP_INVITE_9009, encrypted_content)
            .tag(["h", group_id])
            .tag(["p", invitee_pubkey]))
    }

    /// Kind 9021: join request.
    pub fn join_request(group_id: &str, reason: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        Ok(Self::new(KIND_GROUP_JOIN_REQUEST_9021, reason).tag(["h", group_id]))
    }

    /// Kind 1 with an `h` tag: a group message.
    pub fn group_message(group_id: &str, text: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        Ok(Self::new(KIND_TEXT_NOTE_1, text).tag(["h", group_id]))
    }

    /// Kind 0: profile metadata. `picture_marker`, when set, carries the
    /// drive marker for the profile picture.
    pub fn profile(content_json: &str, picture_marker: Option<&str>) -> Self {
        let mut b = Self::new(KIND_PROFILE_0, content_json);
        if let Some(marker) = picture_marker {
            b = b.tag(["picture", marker]);
        }
        b
    }

    /// Kind 3: contact list of followed pubkeys.
    pub fn contacts<'a>(followed: impl IntoIterator<Item = &'a str>) -> Self {
        let mut b = Self::new(KIND_CONTACTS_3, "");
        for pubkey in followed {
            b = b.tag(["p", pubkey]);
        }
        b
    }

    /// Kind 10009: the user's relay list. `content`, when non-empty, is
    /// the encrypted form of the same list.
    pub fn relay_list<'a>(
        groups: impl IntoIterator<Item = (&'a str, &'a str)>,
        encrypted_content: &str,
    ) -> Self {
        let mut b = Self::new(KIND_RELAY_LIST_10009, encrypted_content);
        for (group_id, relay_url) in groups {
            b = b.tag(["group", group_id]).tag(["r", relay_url]);
        }
        b
    }

    /// Kind 30166: peer record binding a group id to a transport URL and
    /// a swarm identifier.
    pub fn peer_record(group_id: &str, transport_url: &str, swarm_id: &str) -> Result<Self> {
        require_nonempty("group id", group_id)?;
        require_nonempty("transport url", transport_url)?;
        Ok(Self::new(KIND_PEER_RECORD_30166, "")
            .tag(["d", group_id])
            .tag(["r", transport_url])
            .tag(["swarm", swarm_id]))
    }
}

fn require_nonempty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{what} must be non-empty")));
    }
    Ok(())
}
