//! Session bookkeeping: the registry, per-token connections and their
//! clients.
//!
//! A [`Connection`] owns every client admitted under one token. All of its
//! membership state sits behind a single async mutex, so admissions,
//! removals, membership broadcasts and routing for one session are strictly
//! serialized. That is what keeps the exclusive-host rule and the id
//! allocator coherent, and what makes membership broadcasts arrive in the
//! order the changes happened. Sends never block under the lock: each client
//! holds the unbounded outbox drained by its own socket's send task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::router::{self, RouteOutcome};
use crate::protocol::packet::{ConnectionUpdate, Packet};
use crate::protocol::{Capability, CapabilitySet, codec};
use crate::token::Token;

/// A client's session-scoped identifier. Id 0 is never allocated; it is the
/// broadcast sentinel in file-packet `id` fields.
pub type ClientId = u8;

/// Highest allocatable client id.
pub const MAX_CLIENT_ID: ClientId = 255;

/// One admitted socket.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub capabilities: CapabilitySet,
    /// Cleared at every liveness sweep, set again by any inbound traffic.
    pub alive: bool,
    pub(crate) outbox: UnboundedSender<Message>,
}

impl Client {
    /// Queue a frame on this client's socket. Best effort: a client whose
    /// send task has already gone away is simply skipped; its membership is
    /// being torn down concurrently.
    fn send(&self, message: Message) {
        let _ = self.outbox.send(message);
    }
}

/// Why an admission attempt failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    /// `terminal:host` is exclusive and already held on this session.
    #[error("terminal:host is already held on this session")]
    HostHeld,

    /// Every id in [1, 255] is occupied.
    #[error("no free client id on this session")]
    IdsExhausted,

    /// The connection emptied and left the registry while this admission
    /// was in flight; resolve the token again.
    #[error("session was released")]
    Released,
}

#[derive(Debug)]
pub(crate) struct ConnState {
    /// Next candidate id. Probing starts here and wraps once through 255.
    pub(crate) next_id: ClientId,
    pub(crate) clients: HashMap<ClientId, Client>,
    pub(crate) terminal_host: Option<ClientId>,
    pub(crate) terminal_viewers: HashSet<ClientId>,
    pub(crate) file_clients: HashSet<ClientId>,
    released: bool,
}

impl ConnState {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            clients: HashMap::new(),
            terminal_host: None,
            terminal_viewers: HashSet::new(),
            file_clients: HashSet::new(),
            released: false,
        }
    }

    fn allocate_id(&mut self) -> Result<ClientId, AdmitError> {
        let mut wrapped = false;
        while self.clients.contains_key(&self.next_id) {
            if self.next_id == MAX_CLIENT_ID {
                if wrapped {
                    return Err(AdmitError::IdsExhausted);
                }
                wrapped = true;
                self.next_id = 1;
            } else {
                self.next_id += 1;
            }
        }
        Ok(self.next_id)
    }

    /// Tell every client who else is on the session: the union of the
    /// *other* clients' capabilities plus the total count. A client is never
    /// told about its own declaration.
    fn broadcast_update(&self) {
        for client in self.clients.values() {
            let mut capabilities = CapabilitySet::EMPTY;
            for other in self.clients.values() {
                if other.id != client.id {
                    capabilities = capabilities.union(other.capabilities);
                }
            }
            let update = Packet::ConnectionUpdate(ConnectionUpdate {
                clients: self.clients.len() as u32,
                capabilities: capabilities.to_vec(),
            });
            match codec::encode(&update) {
                Ok(text) => client.send(Message::Text(Utf8Bytes::from(text))),
                Err(err) => warn!(client = client.id, %err, "could not encode membership update"),
            }
        }
    }
}

/// The per-token aggregate of all currently joined clients.
pub struct Connection {
    token: Token,
    state: Mutex<ConnState>,
}

impl Connection {
    fn new(token: Token) -> Self {
        Self {
            token,
            state: Mutex::new(ConnState::new()),
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Whether the exclusive terminal-host role is currently held. Used for
    /// the pre-upgrade admission check; the authoritative check happens
    /// again inside [`Connection::admit`].
    pub async fn has_terminal_host(&self) -> bool {
        self.state.lock().await.terminal_host.is_some()
    }

    /// Admit a new client, wiring its outbox into the session.
    ///
    /// Enforces host exclusivity, allocates the next free id (wrapping once
    /// through 255), registers the declared capability sets, and, when the
    /// session already had members, broadcasts the new membership.
    pub async fn admit(
        &self,
        capabilities: CapabilitySet,
        outbox: UnboundedSender<Message>,
    ) -> Result<ClientId, AdmitError> {
        let mut state = self.state.lock().await;
        if state.released {
            return Err(AdmitError::Released);
        }
        if capabilities.contains(Capability::TerminalHost) && state.terminal_host.is_some() {
            return Err(AdmitError::HostHeld);
        }

        let id = state.allocate_id()?;
        state.clients.insert(
            id,
            Client {
                id,
                capabilities,
                alive: true,
                outbox,
            },
        );
        if capabilities.contains(Capability::TerminalHost) {
            state.terminal_host = Some(id);
        }
        if capabilities.contains(Capability::TerminalView) {
            state.terminal_viewers.insert(id);
        }
        if capabilities.contains(Capability::FileHost) || capabilities.contains(Capability::FileEdit)
        {
            state.file_clients.insert(id);
        }

        if state.clients.len() > 1 {
            info!(
                token = %self.token,
                clients = state.clients.len(),
                "client {id} joined session"
            );
            state.broadcast_update();
        }
        Ok(id)
    }

    /// Remove a client and rebroadcast membership. Returns true when the
    /// session emptied; the caller must then release the registry entry.
    pub async fn remove(&self, id: ClientId) -> bool {
        let mut state = self.state.lock().await;
        if state.clients.remove(&id).is_none() {
            return false;
        }
        if state.terminal_host == Some(id) {
            state.terminal_host = None;
        }
        state.terminal_viewers.remove(&id);
        state.file_clients.remove(&id);
        state.broadcast_update();

        if state.clients.is_empty() {
            // Marked under the lock so a racing admit re-resolves instead of
            // joining a session the registry is about to forget.
            state.released = true;
            true
        } else {
            false
        }
    }

    /// Record inbound traffic from a client, for the liveness sweep.
    pub async fn mark_alive(&self, id: ClientId) {
        if let Some(client) = self.state.lock().await.clients.get_mut(&id) {
            client.alive = true;
        }
    }

    /// Route one decoded packet from `sender` and deliver it.
    pub async fn handle_packet(&self, sender: ClientId, packet: Packet) {
        let mut state = self.state.lock().await;
        let Some(client) = state.clients.get_mut(&sender) else {
            return;
        };
        client.alive = true;
        let capabilities = client.capabilities;
        let kind = packet.name();

        match router::route(&state, sender, capabilities, packet) {
            RouteOutcome::MarkAlive => {}
            RouteOutcome::Drop(reason) => {
                debug!(token = %self.token, client = sender, kind, %reason, "packet dropped");
            }
            RouteOutcome::Deliver { recipients, packet } => match codec::encode(&packet) {
                Ok(text) => {
                    let text = Utf8Bytes::from(text);
                    for id in recipients {
                        if let Some(recipient) = state.clients.get(&id) {
                            recipient.send(Message::Text(text.clone()));
                        }
                    }
                }
                Err(err) => {
                    warn!(token = %self.token, client = sender, %err, "could not re-encode packet")
                }
            },
        }
    }

    /// One liveness pass: force-close clients that produced no traffic since
    /// the previous sweep, then challenge the rest with a ping. Returns how
    /// many clients were closed.
    pub async fn sweep(&self, ping: &Utf8Bytes) -> usize {
        let mut state = self.state.lock().await;
        let mut dead = Vec::new();
        for client in state.clients.values_mut() {
            if client.alive {
                client.alive = false;
                client.send(Message::Text(ping.clone()));
            } else {
                dead.push(client.id);
            }
        }
        for id in &dead {
            if let Some(client) = state.clients.get(id) {
                warn!(token = %self.token, client = id, "closing unresponsive client");
                client.send(Message::Close(None));
            }
        }
        dead.len()
    }

    #[cfg(test)]
    pub(crate) async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }
}

/// Process-wide map from token to live connection.
///
/// Deliberately a value the server owns and hands to socket tasks and the
/// sweeper, not ambient global state.
#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<Token, Arc<Connection>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The existing connection for `token`, or a fresh empty one.
    ///
    /// The returned connection may have been released concurrently; `admit`
    /// reports that, and the caller resolves again.
    pub fn resolve(&self, token: &Token) -> Arc<Connection> {
        self.connections
            .entry(token.clone())
            .or_insert_with(|| Arc::new(Connection::new(token.clone())))
            .clone()
    }

    /// Look up without creating, for pre-upgrade admission checks.
    pub fn get(&self, token: &Token) -> Option<Arc<Connection>> {
        self.connections.get(token).map(|conn| conn.clone())
    }

    /// Whether the exclusive terminal-host role is held for `token`.
    pub async fn host_already_held(&self, token: &Token) -> bool {
        match self.get(token) {
            Some(connection) => connection.has_terminal_host().await,
            None => false,
        }
    }

    /// Forget an emptied connection. Only call after [`Connection::remove`]
    /// returned true: the emptied connection has marked itself released, so
    /// no new client can have joined it since.
    pub fn release(&self, token: &Token) {
        if self.connections.remove(token).is_some() {
            info!(%token, "session closed");
        }
    }

    /// Snapshot of the live connections, for the liveness sweep.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Packet;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn test_token() -> Token {
        "A".repeat(32).parse().unwrap()
    }

    fn caps(list: &str) -> CapabilitySet {
        CapabilitySet::parse_list(list).unwrap()
    }

    fn outbox() -> (UnboundedSender<Message>, UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn decode_update(message: Message) -> ConnectionUpdate {
        let Message::Text(text) = message else {
            panic!("expected a text frame, got {message:?}");
        };
        match codec::decode(text.as_str()).unwrap() {
            Packet::ConnectionUpdate(update) => update,
            other => panic!("expected ConnectionUpdate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_host_is_exclusive() {
        let connection = Connection::new(test_token());
        let (tx, _rx) = outbox();
        connection.admit(caps("terminal:host"), tx).await.unwrap();

        let (tx, _rx) = outbox();
        assert_eq!(
            connection.admit(caps("terminal:host,file:host"), tx).await,
            Err(AdmitError::HostHeld)
        );

        // A plain viewer is still welcome.
        let (tx, _rx) = outbox();
        assert!(connection.admit(caps("terminal:view"), tx).await.is_ok());
    }

    #[tokio::test]
    async fn host_slot_frees_on_removal() {
        let connection = Connection::new(test_token());
        let (tx, _rx) = outbox();
        let host = connection.admit(caps("terminal:host"), tx).await.unwrap();
        let (tx, _rx) = outbox();
        connection.admit(caps("terminal:view"), tx).await.unwrap();

        connection.remove(host).await;
        let (tx, _rx) = outbox();
        assert!(connection.admit(caps("terminal:host"), tx).await.is_ok());
    }

    #[tokio::test]
    async fn ids_allocate_sequentially_and_reuse_freed_slots() {
        let connection = Connection::new(test_token());
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = outbox();
            receivers.push(rx);
            ids.push(connection.admit(caps("terminal:view"), tx).await.unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3]);

        connection.remove(2).await;
        let (tx, rx) = outbox();
        receivers.push(rx);
        // The allocator probes onward from its last position; freed low
        // slots only come back around after a wrap.
        let next = connection.admit(caps("terminal:view"), tx).await.unwrap();
        assert_eq!(next, 4);
    }

    fn dummy_client(id: ClientId) -> Client {
        let (tx, _rx) = outbox();
        Client {
            id,
            capabilities: caps("file:edit"),
            alive: true,
            outbox: tx,
        }
    }

    #[test]
    fn id_space_exhaustion_is_reported_and_recoverable() {
        let mut state = ConnState::new();
        for id in 1..=MAX_CLIENT_ID {
            let allocated = state.allocate_id().unwrap();
            assert_eq!(allocated, id);
            state.clients.insert(allocated, dummy_client(allocated));
        }

        // A full wrap finds nothing free.
        assert_eq!(state.allocate_id(), Err(AdmitError::IdsExhausted));

        // Freeing any slot makes it allocatable again, reached by wrapping.
        state.clients.remove(&97);
        assert_eq!(state.allocate_id(), Ok(97));
        state.clients.insert(97, dummy_client(97));
        assert_eq!(state.allocate_id(), Err(AdmitError::IdsExhausted));
    }

    #[tokio::test]
    async fn membership_updates_exclude_own_capabilities() {
        let connection = Connection::new(test_token());
        let (host_tx, mut host_rx) = outbox();
        connection.admit(caps("terminal:host"), host_tx).await.unwrap();
        // The first client joins a quiet session: no update yet.
        assert!(host_rx.try_recv().is_err());

        let (view_tx, mut view_rx) = outbox();
        connection
            .admit(caps("terminal:view,file:edit"), view_tx)
            .await
            .unwrap();

        let host_update = decode_update(host_rx.try_recv().unwrap());
        assert_eq!(host_update.clients, 2);
        assert_eq!(
            host_update.capabilities,
            vec![Capability::TerminalView, Capability::FileEdit]
        );

        let view_update = decode_update(view_rx.try_recv().unwrap());
        assert_eq!(view_update.clients, 2);
        assert_eq!(view_update.capabilities, vec![Capability::TerminalHost]);
    }

    #[tokio::test]
    async fn departure_broadcasts_emptied_capabilities() {
        let connection = Connection::new(test_token());
        let (host_tx, mut host_rx) = outbox();
        let host = connection.admit(caps("terminal:host"), host_tx).await.unwrap();
        let (view_tx, _view_rx) = outbox();
        let viewer = connection.admit(caps("terminal:view"), view_tx).await.unwrap();
        let _ = host_rx.try_recv().unwrap();

        assert!(!connection.remove(viewer).await);
        let update = decode_update(host_rx.try_recv().unwrap());
        assert_eq!(update.clients, 1);
        assert_eq!(update.capabilities, Vec::new());

        assert!(connection.remove(host).await);
    }

    #[tokio::test]
    async fn registry_resolves_one_connection_per_token() {
        let registry = SessionRegistry::new();
        let token = test_token();
        let a = registry.resolve(&token);
        let b = registry.resolve(&token);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let other = Token::generate();
        let c = registry.resolve(&other);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn released_connections_leave_the_registry_and_admission_retries() {
        let registry = SessionRegistry::new();
        let token = test_token();

        let connection = registry.resolve(&token);
        let (tx, _rx) = outbox();
        let id = connection.admit(caps("terminal:view"), tx).await.unwrap();
        assert!(connection.remove(id).await);
        registry.release(&token);
        assert!(registry.is_empty());

        // The stale handle refuses further admissions.
        let (tx, _rx) = outbox();
        assert_eq!(
            connection.admit(caps("terminal:view"), tx).await,
            Err(AdmitError::Released)
        );

        // A fresh resolve starts a new session under the same token.
        let fresh = registry.resolve(&token);
        assert!(!Arc::ptr_eq(&connection, &fresh));
        let (tx, _rx) = outbox();
        assert!(fresh.admit(caps("terminal:view"), tx).await.is_ok());
        assert_eq!(fresh.client_count().await, 1);
    }

    #[tokio::test]
    async fn sweep_pings_live_clients_and_closes_silent_ones() {
        let connection = Connection::new(test_token());
        let (a_tx, mut a_rx) = outbox();
        let a = connection.admit(caps("terminal:view"), a_tx).await.unwrap();
        let (b_tx, mut b_rx) = outbox();
        let _b = connection.admit(caps("terminal:view"), b_tx).await.unwrap();
        let _ = a_rx.try_recv(); // membership update

        let ping = Utf8Bytes::from(codec::encode(&Packet::ConnectionPing).unwrap());

        // First sweep: everyone was alive on admission, so both get pinged.
        assert_eq!(connection.sweep(&ping).await, 0);
        assert!(matches!(a_rx.try_recv(), Ok(Message::Text(text)) if text.as_str().contains("\"packet\":2")));

        // Only A produces traffic before the next sweep.
        connection.mark_alive(a).await;
        assert_eq!(connection.sweep(&ping).await, 1);
        assert!(matches!(a_rx.try_recv(), Ok(Message::Text(_))));
        // B's outbox ends with a close frame.
        let mut saw_close = false;
        while let Ok(message) = b_rx.try_recv() {
            saw_close = matches!(message, Message::Close(_));
        }
        assert!(saw_close);
    }
}
