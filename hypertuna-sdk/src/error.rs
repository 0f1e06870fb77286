//! Error taxonomy shared by the SDK and the relay worker.

use thiserror::Error;

/// Errors surfaced by the SDK and the relay worker core.
///
/// Recoverable variants stay local to the component that raised them
/// (reconnect, retry on next watcher event); variants tied to a specific
/// client request propagate to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Event failed structural validation (id mismatch, bad tags, bad kind).
    /// Dropped without propagation past the validation boundary.
    #[error("malformed event: {0}")]
    EventMalformed(String),

    /// Schnorr signature does not verify against the event pubkey.
    #[error("event signature invalid")]
    EventSignatureInvalid,

    /// Relay closed the connection with code 4403. The pool will not
    /// reconnect; the caller must re-handshake for a fresh token.
    #[error("authentication failed for relay {relay_url}")]
    AuthFailed { relay_url: String },

    /// Token known but past its lifetime; treated as absent.
    #[error("authentication token expired")]
    AuthExpired,

    /// Token revoked by the relay (e.g. after a remove-user event).
    #[error("authentication token revoked")]
    AuthRevoked,

    /// No OK frame arrived for a published event within the deadline.
    #[error("publish timed out waiting for OK ({event_id})")]
    PublishTimeout { event_id: String },

    /// Relay acknowledged the publish with `success=false`.
    #[error("publish rejected: {message}")]
    PublishRejected { event_id: String, message: String },

    /// Publish attempted while no connected relay satisfies the routing
    /// predicate for the event.
    #[error("no connected relay available for publish")]
    RelayUnavailable,

    /// Challenge record aged out (5-minute TTL).
    #[error("challenge expired")]
    ChallengeExpired,

    /// Challenge exceeded its verification-attempt budget.
    #[error("challenge exceeded max attempts")]
    ChallengeMaxAttempts,

    /// Key material could not be parsed or used.
    #[error("key error: {0}")]
    Key(String),

    /// ECDH / AES envelope failure (bad framing, padding, or key).
    #[error("envelope error: {0}")]
    Envelope(String),

    /// Fatal at startup: configuration missing or inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Builder input outside its domain (empty name, unknown role, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A wire frame that does not parse as any known shape.
    #[error("unrecognized frame: {0}")]
    BadFrame(String),

    /// WebSocket-level transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
