//! Typed event channels emitted by the core for consumers (worker bridge,
//! UI shells, bots).
//!
//! Per-component callback lists are modelled as `tokio::sync::broadcast`
//! channels: producers push, every consumer pulls its own receiver and
//! lagging consumers drop oldest-first without blocking the core.

use tokio::sync::broadcast;

use crate::event::Event;

/// Capacity of each broadcast channel. Slow consumers past this lag
/// observe `RecvError::Lagged` and resume from the oldest retained event.
const CHANNEL_CAPACITY: usize = 256;

/// Group-state changes produced by the relay projection.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// Effective member set changed (debounced, set-inequality only).
    MembersChanged {
        group_id: String,
        members: Vec<String>,
    },
    /// A newer metadata snapshot was accepted.
    MetadataUpdated { group_id: String },
    /// An invite envelope addressed to the local user was decrypted.
    InviteReceived { group_id: String, invite_id: String },
    /// A join request is pending for the group.
    JoinRequestReceived { group_id: String, pubkey: String },
    /// A group message entered the log.
    Message { group_id: String, event: Event },
}

/// Connection-level changes produced by the relay pool.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connection reached `open` and subscriptions were applied.
    Connected { url: String },
    /// Connection closed; a reconnect may be scheduled.
    Disconnected { url: String },
    /// Relay closed with code 4403; no reconnect will be attempted.
    AuthFailed { url: String },
    /// An event arrived that no subscription claimed (global taps).
    GlobalEvent { url: String, event: Event },
}

/// Authentication lifecycle changes produced by the gateway.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    ChallengeIssued { pubkey: String },
    TokenIssued { relay_id: String, pubkey: String },
    TokenRevoked { relay_id: String, pubkey: String },
}

/// One broadcast sender per event family. Cloning shares the channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    group_tx: broadcast::Sender<GroupEvent>,
    relay_tx: broadcast::Sender<RelayEvent>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            group_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            relay_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            auth_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn group_events(&self) -> broadcast::Receiver<GroupEvent> {
        self.group_tx.subscribe()
    }

    pub fn relay_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.relay_tx.subscribe()
    }

    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    /// Send errors mean "no receivers right now" and are deliberately
    /// ignored: emission must never fail the producing state machine.
    pub fn emit_group(&self, event: GroupEvent) {
        let _ = self.group_tx.send(event);
    }

    pub fn emit_relay(&self, event: RelayEvent) {
        let _ = self.relay_tx.send(event);
    }

    pub fn emit_auth(&self, event: AuthEvent) {
        let _ = self.auth_tx.send(event);
    }
}
