//! Client SDK for Hypertuna group relays.
//!
//! The protocol is a Nostr-style signed-event format with a NIP-29-flavoured
//! group layer on top: relays maintain per-group state (metadata, admins,
//! members, invites) projected from the event stream, and clients talk to
//! them over a newline-framed JSON WebSocket protocol.
//!
//! This crate provides everything a client or relay worker needs below the
//! state-projection layer:
//!
//! - [`event`]: signed events — canonical serialization, id hashing,
//!   BIP-340 signature verify, tag accessors, and per-kind builders.
//! - [`keys`]: secp256k1 keypairs with npub/nsec encoding.
//! - [`crypto`]: ECDH handshake secrets, the AES-CBC payload envelope, and
//!   bearer-token derivation.
//! - [`filter`] / [`wire`]: subscription filters and the client↔relay
//!   frame vocabulary (`REQ`/`CLOSE`/`EVENT`/`EOSE`/`NOTICE`/`OK`/`AUTH`).
//! - [`subscription`] / [`relay_pool`]: filter-hash-deduplicated
//!   subscriptions multiplexed over a typed pool of relay connections with
//!   rate-limited sends, OK-tracked publishes and reconnection.
//! - [`client`]: the top-level orchestrator that discovers relays, keeps
//!   per-group subscriptions alive and hands verified events to a
//!   [`client::GroupSink`].

pub mod client;
pub mod crypto;
pub mod error;
pub mod event;
pub mod events;
pub mod filter;
pub mod handshake;
pub mod keys;
pub mod relay_pool;
pub mod subscription;
pub mod wire;

pub use error::Error;
pub use event::{Event, EventBuilder, Role};
pub use filter::Filter;
pub use keys::Keys;

/// Convenience result alias used across the SDK.
pub type Result<T, E = Error> = std::result::Result<T, E>;
