//! Multi-relay connection manager.
//!
//! Every relay in the pool is typed: `discovery` relays serve global
//! profile/relay-list lookups, `group` relays serve exactly one
//! authenticated group. The pool owns one connection task per relay URL,
//! a single paced outbound queue, the subscription registry, and the
//! OK-tracking table for publishes.
//!
//! # Connection lifecycle
//!
//! `connecting → open → closed`. On `open` the task replays queued
//! outbound frames and applies every registered subscription the routing
//! rules select for that relay, then emits [`RelayEvent::Connected`].
//! A close with code 4403 emits [`RelayEvent::AuthFailed`] and suppresses
//! reconnection; any other close schedules a reconnect after a linear
//! 5-second delay, forever, until shutdown.
//!
//! # Outbound pacing
//!
//! All sends funnel through one FIFO queue drained with a minimum
//! inter-send interval (default 50 ms). The queue never reorders; frames
//! for a not-yet-open relay park in that relay's pending list and are
//! re-enqueued on open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::Error;
use crate::event::Event;
use crate::events::{EventBus, RelayEvent};
use crate::subscription::{
    SubscribeOutcome, SubscriptionInfo, SubscriptionOptions, SubscriptionRegistry,
    SubscriptionUpdate,
};
use crate::wire::{ClientFrame, RelayFrame, CLOSE_AUTH_FAILED};
use crate::Filter;
use crate::Result;

/// What a relay is for. Routing of subscriptions and publishes keys off
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayType {
    /// Global Nostr-style relay for profiles, contacts, relay lists.
    Discovery,
    /// The authenticated per-group relay.
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

/// Where a publish should go.
#[derive(Debug, Clone)]
pub enum PublishTarget {
    /// The group relay serving this group id.
    Group(String),
    /// Every open discovery relay.
    Discovery,
    /// One specific relay URL (normalized form).
    Url(String),
}

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct RelayPoolConfig {
    /// Minimum interval between outbound frames.
    pub send_interval: Duration,
    /// Delay before a reconnect attempt.
    pub reconnect_delay: Duration,
    /// How long a publish waits for its OK frame.
    pub publish_timeout: Duration,
}

impl Default for RelayPoolConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

/// Split a relay URL into its normalized form (no `token` query
/// parameter) and the token, if present.
pub fn normalize_url(raw: &str) -> Result<(String, Option<String>)> {
    let mut parsed =
        url::Url::parse(raw).map_err(|e| Error::Transport(format!("bad relay url {raw}: {e}")))?;
    let mut token = None;
    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == "token" {
                token = Some(v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();
    if remaining.is_empty() {
        parsed.set_query(None);
    } else {
        let mut qp = parsed.query_pairs_mut();
        qp.clear();
        for (k, v) in &remaining {
            qp.append_pair(k, v);
        }
        drop(qp);
    }
    Ok((parsed.to_string(), token))
}

/// Decide whether a subscription applies to a relay. Pure function so
/// the §8 quiescence invariant is directly testable.
pub fn routing_applies(
    sub: &SubscriptionInfo,
    url: &str,
    relay_type: RelayType,
    group_id: Option<&str>,
) -> bool {
    if !sub.options.target_relays.is_empty() {
        return sub.options.target_relays.iter().any(|t| t == url);
    }
    match relay_type {
        RelayType::Group => match (sub.group_scope(), group_id) {
            (Some(scope), Some(gid)) => scope == gid,
            _ => false,
        },
        RelayType::Discovery => sub.group_scope().is_none(),
    }
}

struct RelayState {
    relay_type: RelayType,
    group_id: Option<String>,
    token: Option<String>,
    status: ConnectionStatus,
    /// Writer channel of the live connection, present while open.
    socket_tx: Option<mpsc::UnboundedSender<String>>,
    /// Frames submitted while not open, replayed in order on open.
    pending: Vec<String>,
    /// name → short id live on this relay.
    live_subs: HashMap<String, String>,
    prevent_reconnect: bool,
    task: Option<JoinHandle<()>>,
}

struct PoolShared {
    config: RelayPoolConfig,
    subs: SubscriptionRegistry,
    relays: Mutex<HashMap<String, RelayState>>,
    group_relays: Mutex<HashMap<String, String>>,
    pending_oks: Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>,
    bus: EventBus,
    out_tx: mpsc::UnboundedSender<(String, String)>,
    shutdown_tx: watch::Sender<bool>,
}

/// The pool handle. Cloning shares the pool.
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl RelayPool {
    pub fn new(config: RelayPoolConfig) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            config,
            subs: SubscriptionRegistry::new(),
            relays: Mutex::new(HashMap::new()),
            group_relays: Mutex::new(HashMap::new()),
            pending_oks: Mutex::new(HashMap::new()),
            bus: EventBus::new(),
            out_tx,
            shutdown_tx,
        });
        tokio::spawn(pacer_loop(Arc::clone(&shared), out_rx));
        Self { shared }
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Add (or re-key) a relay. The URL may carry `?token=…`; calling
    /// again with a new token for an already-open URL closes the old
    /// connection and opens a fresh one with the new credential.
    pub fn add_relay(
        &self,
        raw_url: &str,
        relay_type: RelayType,
        group_id: Option<String>,
    ) -> Result<String> {
        let (url, token) = normalize_url(raw_url)?;
        let mut relays = self.shared.relays.lock();
        if let Some(state) = relays.get_mut(&url) {
            if state.token == token {
                return Ok(url);
            }
            // Token rotation: retire the old connection quietly.
            tracing::info!(relay = %url, "rotating relay token");
            state.prevent_reconnect = true;
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
        if let Some(gid) = &group_id {
            self.shared
                .group_relays
                .lock()
                .insert(gid.clone(), url.clone());
        }
        let task = tokio::spawn(connection_loop(
            Arc::clone(&self.shared),
            url.clone(),
            token.clone(),
        ));
        relays.insert(
            url.clone(),
            RelayState {
                relay_type,
                group_id,
                token,
                status: ConnectionStatus::Connecting,
                socket_tx: None,
                pending: Vec::new(),
                live_subs: HashMap::new(),
                prevent_reconnect: false,
                task: Some(task),
            },
        );
        Ok(url)
    }

    /// Remove a relay and close its connection without reconnecting.
    pub fn remove_relay(&self, url: &str) {
        let mut relays = self.shared.relays.lock();
        if let Some(mut state) = relays.remove(url) {
            state.prevent_reconnect = true;
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
        self.shared.group_relays.lock().retain(|_, v| v != url);
    }

    /// The group relay URL serving a group, if registered.
    pub fn relay_for_group(&self, group_id: &str) -> Option<String> {
        self.shared.group_relays.lock().get(group_id).cloned()
    }

    pub fn status(&self, url: &str) -> Option<ConnectionStatus> {
        self.shared.relays.lock().get(url).map(|s| s.status)
    }

    /// Register (or attach to) a subscription and apply it to every
    /// relay the routing rules select.
    pub fn subscribe(
        &self,
        name: &str,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> broadcast::Receiver<SubscriptionUpdate> {
        let (outcome, _short_id, rx) = self.shared.subs.subscribe(name, filters, options);
        match outcome {
            SubscribeOutcome::Reused { .. } => {}
            SubscribeOutcome::Created => {
                if let Some(info) = self.shared.subs.get(name) {
                    self.apply_subscription(&info);
                }
            }
            SubscribeOutcome::Replaced { closed_short_id } => {
                self.close_on_relays(&closed_short_id);
                if let Some(info) = self.shared.subs.get(name) {
                    self.apply_subscription(&info);
                }
            }
        }
        rx
    }

    /// Drop one reference to a subscription; CLOSE it on the wire when
    /// the last reference went away.
    pub fn unsubscribe(&self, name: &str) {
        if let Some(short_id) = self.shared.subs.unsubscribe(name) {
            self.close_on_relays(&short_id);
        }
    }

    fn apply_subscription(&self, info: &SubscriptionInfo) {
        let frame = ClientFrame::Req {
            sub_id: info.short_id.clone(),
            filters: info.filters.clone(),
        }
        .to_json();
        let mut relays = self.shared.relays.lock();
        for (url, state) in relays.iter_mut() {
            if routing_applies(info, url, state.relay_type, state.group_id.as_deref()) {
                state
                    .live_subs
                    .insert(info.name.clone(), info.short_id.clone());
                if state.status == ConnectionStatus::Open {
                    let _ = self.shared.out_tx.send((url.clone(), frame.clone()));
                } else {
                    state.pending.push(frame.clone());
                }
            }
        }
    }

    fn close_on_relays(&self, short_id: &str) {
        let frame = ClientFrame::Close {
            sub_id: short_id.to_string(),
        }
        .to_json();
        let mut relays = self.shared.relays.lock();
        for (url, state) in relays.iter_mut() {
            let had = state
                .live_subs
                .iter()
                .any(|(_, sid)| sid == short_id);
            if had {
                state.live_subs.retain(|_, sid| sid != short_id);
                if state.status == ConnectionStatus::Open {
                    let _ = self.shared.out_tx.send((url.clone(), frame.clone()));
                }
            }
        }
    }

    /// Publish an event and wait for its OK acknowledgment.
    pub async fn publish(&self, event: &Event, target: PublishTarget) -> Result<()> {
        let frame = ClientFrame::Event {
            event: event.clone(),
        }
        .to_json();

        let urls: Vec<String> = {
            let relays = self.shared.relays.lock();
            let candidates: Vec<String> = match &target {
                PublishTarget::Group(gid) => self
                    .shared
                    .group_relays
                    .lock()
                    .get(gid)
                    .into_iter()
                    .cloned()
                    .collect(),
                PublishTarget::Discovery => relays
                    .iter()
                    .filter(|(_, s)| s.relay_type == RelayType::Discovery)
                    .map(|(u, _)| u.clone())
                    .collect(),
                PublishTarget::Url(url) => vec![url.clone()],
            };
            candidates
                .into_iter()
                .filter(|u| {
                    relays
                        .get(u)
                        .is_some_and(|s| s.status == ConnectionStatus::Open)
                })
                .collect()
        };
        if urls.is_empty() {
            return Err(Error::RelayUnavailable);
        }

        let (ok_tx, ok_rx) = oneshot::channel();
        self.shared
            .pending_oks
            .lock()
            .insert(event.id.clone(), ok_tx);
        for url in &urls {
            let _ = self.shared.out_tx.send((url.clone(), frame.clone()));
        }

        let result = tokio::time::timeout(self.shared.config.publish_timeout, ok_rx).await;
        match result {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, message))) => Err(Error::PublishRejected {
                event_id: event.id.clone(),
                message,
            }),
            // Sender dropped: pool shut down mid-publish.
            Ok(Err(_)) => Err(Error::Transport("pool shut down".into())),
            Err(_) => {
                self.shared.pending_oks.lock().remove(&event.id);
                Err(Error::PublishTimeout {
                    event_id: event.id.clone(),
                })
            }
        }
    }

    /// Short ids live on one relay at a quiescent moment (§8 invariant).
    pub fn live_short_ids(&self, url: &str) -> Vec<String> {
        self.shared
            .relays
            .lock()
            .get(url)
            .map(|s| {
                let mut ids: Vec<String> = s.live_subs.values().cloned().collect();
                ids.sort();
                ids.dedup();
                ids
            })
            .unwrap_or_default()
    }

    /// Orderly shutdown: cancel reconnects, close sockets, clear tables.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        let mut relays = self.shared.relays.lock();
        for (_, state) in relays.iter_mut() {
            state.prevent_reconnect = true;
            state.status = ConnectionStatus::Closed;
            state.socket_tx = None;
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
        relays.clear();
        self.shared.group_relays.lock().clear();
        self.shared.subs.clear();
        self.shared.pending_oks.lock().clear();
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.shared.subs
    }
}

// ── Background tasks ───────────────────────────────────────────────────

/// Single paced sender: drains the FIFO honoring the minimum inter-send
/// interval, never reordering. Frames for relays that are not open are
/// parked on the relay's pending list.
async fn pacer_loop(
    shared: Arc<PoolShared>,
    mut out_rx: mpsc::UnboundedReceiver<(String, String)>,
) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut last_send: Option<Instant> = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            next = out_rx.recv() => next,
        };
        let Some((url, text)) = next else { return };
        if let Some(last) = last_send {
            let next_slot = last + shared.config.send_interval;
            tokio::time::sleep_until(next_slot).await;
        }
        last_send = Some(Instant::now());
        let mut relays = shared.relays.lock();
        if let Some(state) = relays.get_mut(&url) {
            match (&state.status, &state.socket_tx) {
                (ConnectionStatus::Open, Some(tx)) => {
                    if let Err(unsent) = tx.send(text) {
                        // Writer went away mid-flight; park for the next open.
                        state.pending.push(unsent.0);
                    }
                }
                _ => state.pending.push(text),
            }
        }
    }
}

fn build_connect_url(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}token={token}")
        }
        None => url.to_string(),
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One connection task per relay URL: connect, run, reconnect on a
/// linear delay until told otherwise.
async fn connection_loop(shared: Arc<PoolShared>, url: String, token: Option<String>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            return;
        }
        {
            let mut relays = shared.relays.lock();
            let Some(state) = relays.get_mut(&url) else { return };
            if state.prevent_reconnect {
                return;
            }
            state.status = ConnectionStatus::Connecting;
        }

        let connect_url = build_connect_url(&url, token.as_deref());
        let connected = tokio::select! {
            _ = shutdown.changed() => return,
            r = connect_async(connect_url) => r,
        };
        match connected {
            Ok((stream, _response)) => {
                let auth_failed = run_connection(&shared, &url, stream).await;
                mark_closed(&shared, &url);
                shared.bus.emit_relay(RelayEvent::Disconnected { url: url.clone() });
                if auth_failed {
                    tracing::warn!(relay = %url, "authentication failed (4403), not reconnecting");
                    shared
                        .bus
                        .emit_relay(RelayEvent::AuthFailed { url: url.clone() });
                    let mut relays = shared.relays.lock();
                    if let Some(state) = relays.get_mut(&url) {
                        state.prevent_reconnect = true;
                    }
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(relay = %url, "connect failed: {e}");
                mark_closed(&shared, &url);
            }
        }

        // Linear reconnect delay, cancellable by shutdown.
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
    }
}

fn mark_closed(shared: &PoolShared, url: &str) {
    let mut relays = shared.relays.lock();
    if let Some(state) = relays.get_mut(url) {
        state.status = ConnectionStatus::Closed;
        state.socket_tx = None;
    }
}

/// Drive one live connection until it closes. Returns whether the close
/// was an authentication failure (code 4403).
async fn run_connection(shared: &Arc<PoolShared>, url: &str, stream: WsStream) -> bool {
    let (mut sink, mut source) = stream.split();
    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<String>();

    // Transition to open: install the writer, replay queued frames and
    // subscriptions selected by routing, then announce the connect.
    {
        let mut relays = shared.relays.lock();
        let Some(state) = relays.get_mut(url) else { return false };
        state.status = ConnectionStatus::Open;
        state.socket_tx = Some(socket_tx);
        let pending = std::mem::take(&mut state.pending);
        state.live_subs.clear();
        let relay_type = state.relay_type;
        let group_id = state.group_id.clone();
        for text in pending {
            let _ = shared.out_tx.send((url.to_string(), text));
        }
        for info in shared.subs.all() {
            if routing_applies(&info, url, relay_type, group_id.as_deref()) {
                state
                    .live_subs
                    .insert(info.name.clone(), info.short_id.clone());
                let frame = ClientFrame::Req {
                    sub_id: info.short_id.clone(),
                    filters: info.filters.clone(),
                }
                .to_json();
                let _ = shared.out_tx.send((url.to_string(), frame));
            }
        }
    }
    tracing::info!(relay = %url, "relay connected");
    shared.bus.emit_relay(RelayEvent::Connected {
        url: url.to_string(),
    });

    let mut auth_failed = false;
    loop {
        tokio::select! {
            outbound = socket_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::debug!(relay = %url, "send failed: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_frame(shared, url, &text),
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            let code: u16 = frame.code.into();
                            if code == CLOSE_AUTH_FAILED {
                                auth_failed = true;
                            }
                        }
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(relay = %url, "read failed: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    auth_failed
}

/// Dispatch one inbound relay frame. Subscriber callbacks are isolated
/// by the broadcast channel; a lagging consumer never blocks this path.
fn handle_frame(shared: &Arc<PoolShared>, url: &str, text: &str) {
    match RelayFrame::parse(text) {
        Ok(RelayFrame::Event { sub_id, event }) => {
            if let Err(e) = event.validate() {
                tracing::debug!(relay = %url, sub = %sub_id, "dropping invalid event: {e}");
                return;
            }
            match shared.subs.dispatch_event(&sub_id, url, event.clone()) {
                Some(options) if options.suppress_global_events => {}
                Some(_) => shared.bus.emit_relay(RelayEvent::GlobalEvent {
                    url: url.to_string(),
                    event,
                }),
                None => {
                    tracing::debug!(relay = %url, sub = %sub_id, "event for unknown subscription");
                }
            }
        }
        Ok(RelayFrame::Eose { sub_id }) => shared.subs.dispatch_eose(&sub_id, url),
        Ok(RelayFrame::Ok {
            event_id,
            success,
            message,
        }) => {
            if let Some(waiter) = shared.pending_oks.lock().remove(&event_id) {
                let _ = waiter.send((success, message));
            }
        }
        Ok(RelayFrame::Notice { text }) => {
            tracing::info!(relay = %url, "notice: {text}");
        }
        Ok(RelayFrame::Auth { .. }) => {
            // Challenge negotiation runs over the gateway handshake path,
            // not through pooled connections.
            tracing::debug!(relay = %url, "ignoring AUTH frame on pooled connection");
        }
        Err(e) => {
            tracing::debug!(relay = %url, "unparseable frame: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionRegistry;

    fn info(name: &str, targets: &[&str]) -> SubscriptionInfo {
        let reg = SubscriptionRegistry::new();
        let (_, _, _rx) = reg.subscribe(
            name,
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                suppress_global_events: false,
                target_relays: targets.iter().map(|s| s.to_string()).collect(),
            },
        );
        reg.get(name).unwrap()
    }

    #[test]
    fn normalize_splits_token() {
        let (url, token) = normalize_url("wss://host/npub/relay?token=abc").unwrap();
        assert_eq!(url, "wss://host/npub/relay");
        assert_eq!(token.as_deref(), Some("abc"));

        let (url, token) = normalize_url("wss://host/path?x=1&token=abc").unwrap();
        assert_eq!(url, "wss://host/path?x=1");
        assert_eq!(token.as_deref(), Some("abc"));

        let (url, token) = normalize_url("wss://host/path").unwrap();
        assert_eq!(url, "wss://host/path");
        assert_eq!(token, None);
    }

    #[test]
    fn build_url_reattaches_token() {
        assert_eq!(
            build_connect_url("wss://h/p", Some("t")),
            "wss://h/p?token=t"
        );
        assert_eq!(
            build_connect_url("wss://h/p?x=1", Some("t")),
            "wss://h/p?x=1&token=t"
        );
        assert_eq!(build_connect_url("wss://h/p", None), "wss://h/p");
    }

    #[test]
    fn routing_target_relays_win() {
        let sub = info("group:g1:messages", &["wss://specific/"]);
        assert!(routing_applies(
            &sub,
            "wss://specific/",
            RelayType::Discovery,
            None
        ));
        assert!(!routing_applies(
            &sub,
            "wss://other/",
            RelayType::Group,
            Some("g1")
        ));
    }

    #[test]
    fn routing_group_relay_wants_matching_scope() {
        let sub = info("group:g1:messages", &[]);
        assert!(routing_applies(&sub, "wss://r/", RelayType::Group, Some("g1")));
        assert!(!routing_applies(&sub, "wss://r/", RelayType::Group, Some("g2")));
        assert!(!routing_applies(&sub, "wss://r/", RelayType::Discovery, None));
    }

    #[test]
    fn routing_discovery_relay_wants_unscoped() {
        let sub = info("profiles", &[]);
        assert!(routing_applies(&sub, "wss://r/", RelayType::Discovery, None));
        assert!(!routing_applies(&sub, "wss://r/", RelayType::Group, Some("g1")));
    }
}
