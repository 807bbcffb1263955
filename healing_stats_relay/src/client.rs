// Client transport: one logical connection from an addon process to the
// relay.
//
// `PeerTransport` owns a background drive thread and a block of shared state
// the host-facing methods mutate. Architecture:
// - **Shared state** (`Mutex<State>` + `Condvar`): local identity, the
//   current peer roster, the outbound combat-event queue, the enable /
//   budget / encryption switches, and the status snapshot. Host callbacks
//   only touch this and never block on the network.
// - **Drive thread**: polls its completion channel with a short timeout so
//   it can also notice switches flipping, reconnect on the fixed interval,
//   and keep one write in flight. It owns the `Session` for the live link,
//   including what has been registered on that link so far.
// - **Link** (see `link.rs`): connects, runs the TLS handshake, reads frames
//   and writes what the drive thread sends. Its events come back tagged with
//   the session generation, so events from a link that has since been
//   replaced are dropped.
//
// Send priority whenever no write is pending: (1) RegisterSelf on a fresh
// link, or SetSelfId when the local instance id changed; (2) peer roster
// deltas, removals first; (3) the oldest queued combat event. Nothing but
// (1) goes out before the link is registered.
//
// Delivery is best-effort: a failed read or write invalidates the link and
// the queued events are dropped with it. The next attempt starts a fresh
// session that re-registers and re-sends the whole roster.
//
// See also: `server.rs` for the other end, and `healing_stats_addon`, which
// feeds host callbacks into `process_local_event` / `process_area_event`.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv6Addr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use healing_stats_protocol::message::MAX_NAME_LEN;
use healing_stats_protocol::types::state_change;
use healing_stats_protocol::{Agent, CombatEvent, EventKind, HostEvent, InstanceId, Message};
use tracing::{debug, error, info, trace, warn};

use crate::link::{ClientTls, LinkEvent, LinkHandle, LinkTarget};
use crate::tls;

/// Late-bound configuration value, re-read on every connection attempt.
pub type Accessor = Box<dyn Fn() -> String + Send + Sync>;

/// Callback for combat events relayed from peers.
pub type PeerEventCallback = Box<dyn FnMut(&CombatEvent, InstanceId) + Send>;

/// Construction parameters for `PeerTransport`.
pub struct TransportSettings {
    /// Relay endpoint: `host`, `host:port`, a bare IPv6 address, or
    /// `[v6]:port`. Empty means "do not connect".
    pub endpoint: Accessor,
    /// PEM bundle of trusted root certificates for TLS.
    pub root_certificates: Accessor,
    pub reconnect_interval: Duration,
    pub poll_interval: Duration,
    /// Combat events beyond this many are dropped at enqueue time. Healing
    /// and combat enter/exit events may use twice the space.
    pub max_queued_events: usize,
    pub enabled: bool,
    pub budget_mode: bool,
    pub disable_encryption: bool,
}

impl TransportSettings {
    pub fn new(
        endpoint: impl Fn() -> String + Send + Sync + 'static,
        root_certificates: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            endpoint: Box::new(endpoint),
            root_certificates: Box::new(root_certificates),
            reconnect_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            max_queued_events: 5000,
            enabled: true,
            budget_mode: false,
            disable_encryption: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    /// Connect or TLS handshake in progress.
    Connecting,
    Streaming,
}

/// Snapshot of the transport for status displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: TransportState,
    pub connected: bool,
    /// Endpoint of the current or most recent attempt.
    pub endpoint: String,
    pub encrypted: bool,
    pub connect_time: Option<SystemTime>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct LocalIdentity {
    account_name: String,
    instance_id: InstanceId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PeerInfo {
    instance_id: InstanceId,
    account_name: String,
}

struct State {
    identity: Option<LocalIdentity>,
    /// Peer roster keyed by host agent id.
    peers: BTreeMap<u64, PeerInfo>,
    queue: VecDeque<CombatEvent>,
    enabled: bool,
    budget_mode: bool,
    disable_encryption: bool,
    status: TransportStatus,
    shutting_down: bool,
    retry_now: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled whenever the queue shrinks.
    drained: Condvar,
    max_queued_events: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum ClientCompletion {
    Link { generation: u64, event: LinkEvent },
    WakeUp,
}

/// Client side of the peer relay.
pub struct PeerTransport {
    shared: Arc<Shared>,
    wake: Sender<ClientCompletion>,
    drive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerTransport {
    /// Spawn the drive thread. `on_peer_event` runs on that thread for every
    /// combat event a peer relays to us.
    pub fn start(
        settings: TransportSettings,
        on_peer_event: impl FnMut(&CombatEvent, InstanceId) + Send + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                identity: None,
                peers: BTreeMap::new(),
                queue: VecDeque::new(),
                enabled: settings.enabled,
                budget_mode: settings.budget_mode,
                disable_encryption: settings.disable_encryption,
                status: TransportStatus {
                    state: TransportState::Disconnected,
                    connected: false,
                    endpoint: String::new(),
                    encrypted: false,
                    connect_time: None,
                },
                shutting_down: false,
                retry_now: true,
            }),
            drained: Condvar::new(),
            max_queued_events: settings.max_queued_events,
        });
        let (tx, rx) = mpsc::channel();

        let driver = Driver {
            shared: shared.clone(),
            settings,
            inbox: rx,
            completions: tx.clone(),
            on_peer_event: Box::new(on_peer_event),
            session: None,
            generation: 0,
            last_attempt: None,
        };
        let handle = thread::Builder::new()
            .name("peer-transport".into())
            .spawn(move || driver.run())?;

        Ok(Self {
            shared,
            wake: tx,
            drive_thread: Mutex::new(Some(handle)),
        })
    }

    /// Disabling drops the link immediately and clears queued events.
    /// Re-enabling connects on the next poll instead of waiting out the
    /// reconnect interval.
    pub fn set_enabled_status(&self, enabled: bool) {
        let mut state = self.shared.lock();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        if enabled {
            state.retry_now = true;
        } else {
            state.queue.clear();
            self.shared.drained.notify_all();
        }
        drop(state);
        info!(enabled, "relay transport toggled");
        self.wake();
    }

    /// In budget mode only healing and combat enter/exit events are queued.
    pub fn set_budget_mode(&self, budget_mode: bool) {
        self.shared.lock().budget_mode = budget_mode;
    }

    /// Applies from the next connection attempt.
    pub fn set_disable_encryption(&self, disable: bool) {
        self.shared.lock().disable_encryption = disable;
    }

    /// Set the local player's account name and instance id. Names the
    /// protocol cannot carry are ignored.
    pub fn set_local_identity(&self, account_name: &str, instance_id: InstanceId) {
        if account_name.is_empty() || account_name.len() > MAX_NAME_LEN {
            warn!(len = account_name.len(), "ignoring unusable local account name");
            return;
        }
        let identity = LocalIdentity {
            account_name: account_name.to_owned(),
            instance_id,
        };
        let mut state = self.shared.lock();
        if state.identity.as_ref() != Some(&identity) {
            debug!(account = %account_name, instance_id = instance_id.0, "local identity");
            state.identity = Some(identity);
        }
    }

    /// Record that agent `agent_id` is the peer `account_name`, currently
    /// using `instance_id`. A second entry for the same agent is ignored.
    pub fn add_peer_interest(&self, agent_id: u64, instance_id: InstanceId, account_name: &str) {
        if account_name.is_empty() || account_name.len() > MAX_NAME_LEN {
            warn!(agent_id, len = account_name.len(), "ignoring unusable peer account name");
            return;
        }
        let mut state = self.shared.lock();
        if let Some(existing) = state.peers.get(&agent_id) {
            warn!(
                agent_id,
                existing = %existing.account_name,
                account = %account_name,
                "peer already known for agent"
            );
            return;
        }
        debug!(agent_id, account = %account_name, instance_id = instance_id.0, "peer added");
        state.peers.insert(
            agent_id,
            PeerInfo {
                instance_id,
                account_name: account_name.to_owned(),
            },
        );
    }

    pub fn remove_peer_interest(&self, agent_id: u64) {
        if let Some(peer) = self.shared.lock().peers.remove(&agent_id) {
            debug!(agent_id, account = %peer.account_name, "peer removed");
        }
    }

    /// Queue a local combat event for the relay. Returns false if it was
    /// filtered out or dropped.
    pub fn queue_combat_event(&self, event: &CombatEvent) -> bool {
        let mut state = self.shared.lock();
        if !state.enabled {
            return false;
        }
        let important = is_important(event);
        if state.budget_mode && !important {
            return false;
        }
        let limit = if important {
            self.shared.max_queued_events * 2
        } else {
            self.shared.max_queued_events
        };
        if state.queue.len() >= limit {
            debug!(queued = state.queue.len(), important, "outbound queue full, dropping event");
            return false;
        }
        state.queue.push_back(*event);
        true
    }

    /// Interpret a callback from the local player's combat stream.
    pub fn process_local_event(&self, host_event: &HostEvent) {
        match &host_event.event {
            Some(event) => {
                self.queue_combat_event(event);
            }
            None => {
                let (Some(source), Some(destination)) = (&host_event.source, &host_event.destination)
                else {
                    return;
                };
                if source.elite != 0 || source.prof == 0 || destination.is_self == 0 {
                    return;
                }
                let Some(instance_id) = instance_id_of(destination) else {
                    return;
                };
                match destination.name.as_deref() {
                    Some(name) if !name.is_empty() => self.set_local_identity(name, instance_id),
                    _ => {}
                }
            }
        }
    }

    /// Interpret a callback from the area combat stream. Only roster
    /// notifications matter here; combat records are ignored.
    pub fn process_area_event(&self, host_event: &HostEvent) {
        if host_event.event.is_some() {
            return;
        }
        let Some(source) = &host_event.source else {
            return;
        };
        if source.prof == 0 {
            self.remove_peer_interest(source.id);
            return;
        }
        let Some(destination) = &host_event.destination else {
            return;
        };
        if destination.is_self != 0 {
            return;
        }
        let Some(instance_id) = instance_id_of(destination) else {
            return;
        };
        match destination.name.as_deref() {
            Some(name) if !name.is_empty() => self.add_peer_interest(source.id, instance_id, name),
            _ => {}
        }
    }

    /// Block until at most `acceptable_queue_size` events are queued. Also
    /// returns once the transport is disabled or shutting down. There is
    /// no timeout.
    pub fn flush_events(&self, acceptable_queue_size: usize) {
        let mut state = self.shared.lock();
        while state.queue.len() > acceptable_queue_size && state.enabled && !state.shutting_down
        {
            state = self
                .shared
                .drained
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn queued_events(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn status(&self) -> TransportStatus {
        self.shared.lock().status.clone()
    }

    /// Stop the drive thread and drop the link. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutting_down = true;
            self.shared.drained.notify_all();
        }
        self.wake();
        let handle = self
            .drive_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("peer transport drive thread panicked");
            }
        }
    }

    fn wake(&self) {
        let _ = self.wake.send(ClientCompletion::WakeUp);
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Events that still matter when upload bandwidth is scarce.
fn is_important(event: &CombatEvent) -> bool {
    matches!(
        event.is_statechange,
        state_change::ENTER_COMBAT | state_change::EXIT_COMBAT
    ) || EventKind::classify(event, true) == EventKind::Healing
}

/// The instance id a roster notification carries in its agent id.
fn instance_id_of(agent: &Agent) -> Option<InstanceId> {
    match u16::try_from(agent.id) {
        Ok(id) => Some(InstanceId(id)),
        Err(_) => {
            warn!(agent_id = agent.id, "agent id out of range for an instance id, ignoring");
            None
        }
    }
}

/// Append the scheme's default port when `endpoint` has none. A bare IPv6
/// address is bracketed first.
pub(crate) fn with_default_port(endpoint: &str, encrypted: bool) -> String {
    let port = if encrypted { 443 } else { 80 };
    if endpoint.parse::<Ipv6Addr>().is_ok() {
        return format!("[{endpoint}]:{port}");
    }
    let after_host = match endpoint.rfind(']') {
        Some(bracket) => &endpoint[bracket..],
        None => endpoint,
    };
    let has_port = if endpoint.starts_with('[') {
        after_host.contains(':')
    } else {
        after_host.matches(':').count() == 1
    };
    if has_port {
        endpoint.to_owned()
    } else {
        format!("{endpoint}:{port}")
    }
}

/// Host part of a `host:port` endpoint, without IPv6 brackets.
pub(crate) fn host_of(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match endpoint.rsplit_once(':') {
        Some((host, _)) => host,
        None => endpoint,
    }
}

/// One live link and what has been registered over it.
struct Session {
    generation: u64,
    link: LinkHandle,
    streaming: bool,
    write_pending: bool,
    registered: Option<LocalIdentity>,
    /// Peer entries the relay holds for this link: account name → instance.
    peers: BTreeMap<String, InstanceId>,
}

/// Next message the session should send, in priority order.
enum Outgoing {
    Message(Message),
    /// The account name changed; a link can only ever carry one.
    Reconnect,
}

struct Driver {
    shared: Arc<Shared>,
    settings: TransportSettings,
    inbox: Receiver<ClientCompletion>,
    completions: Sender<ClientCompletion>,
    on_peer_event: PeerEventCallback,
    session: Option<Session>,
    generation: u64,
    last_attempt: Option<Instant>,
}

impl Driver {
    fn run(mut self) {
        loop {
            match self.inbox.recv_timeout(self.settings.poll_interval) {
                Ok(ClientCompletion::Link { generation, event }) => {
                    self.handle_link_event(generation, event)
                }
                Ok(ClientCompletion::WakeUp) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let (enabled, shutting_down) = {
                let state = self.shared.lock();
                (state.enabled, state.shutting_down)
            };
            if shutting_down {
                break;
            }
            if !enabled {
                if self.session.is_some() {
                    self.invalidate("transport disabled");
                }
                continue;
            }
            if self.session.is_none() {
                self.maybe_connect();
            }
            self.pump_outbound();
        }
        if self.session.is_some() {
            self.invalidate("transport shutting down");
        }
        debug!("peer transport stopped");
    }

    fn maybe_connect(&mut self) {
        let now = Instant::now();
        {
            let mut state = self.shared.lock();
            let due = self
                .last_attempt
                .is_none_or(|at| now.duration_since(at) >= self.settings.reconnect_interval);
            if !state.retry_now && !due {
                return;
            }
            state.retry_now = false;
        }
        self.last_attempt = Some(now);

        let endpoint = (self.settings.endpoint)();
        if endpoint.is_empty() {
            return;
        }
        let encrypted = !self.shared.lock().disable_encryption;
        let endpoint = with_default_port(&endpoint, encrypted);

        let tls = if encrypted {
            match self.client_tls(&endpoint) {
                Ok(tls) => Some(tls),
                Err(e) => {
                    warn!(%endpoint, error = %e, "cannot set up TLS for relay");
                    return;
                }
            }
        } else {
            None
        };

        self.generation += 1;
        let generation = self.generation;
        let completions = self.completions.clone();
        let link = LinkHandle::spawn(
            LinkTarget::Dial {
                endpoint: endpoint.clone(),
                tls,
            },
            format!("relay{generation}"),
            move |event| {
                let _ = completions.send(ClientCompletion::Link { generation, event });
            },
        );
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                warn!(%endpoint, error = %e, "failed to start relay link");
                return;
            }
        };

        debug!(%endpoint, encrypted, generation, "connecting to relay");
        self.session = Some(Session {
            generation,
            link,
            streaming: false,
            write_pending: false,
            registered: None,
            peers: BTreeMap::new(),
        });
        let mut state = self.shared.lock();
        state.status = TransportStatus {
            state: TransportState::Connecting,
            connected: false,
            endpoint,
            encrypted,
            connect_time: None,
        };
    }

    fn client_tls(&self, endpoint: &str) -> Result<ClientTls, crate::error::RelayError> {
        let roots = (self.settings.root_certificates)();
        Ok(ClientTls {
            config: tls::client_config(&roots)?,
            server_name: tls::server_name(host_of(endpoint))?,
        })
    }

    fn handle_link_event(&mut self, generation: u64, event: LinkEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.generation == generation) else {
            trace!(generation, ?event, "event from a replaced link");
            return;
        };
        match event {
            LinkEvent::Ready => {
                session.streaming = true;
                let mut state = self.shared.lock();
                state.status.state = TransportState::Streaming;
                state.status.connected = true;
                state.status.connect_time = Some(SystemTime::now());
                info!(endpoint = %state.status.endpoint, encrypted = state.status.encrypted, "connected to relay");
            }
            LinkEvent::Frame(bytes) => match Message::decode(&bytes) {
                Ok(Message::CombatEvent {
                    event,
                    sender_instance_id,
                }) => (self.on_peer_event)(&event, sender_instance_id),
                Ok(Message::Close { reason }) => {
                    warn!(%reason, "relay closed the connection");
                    self.invalidate("closed by relay");
                }
                Ok(other) => debug!(message = ?other.message_type(), "ignoring message from relay"),
                Err(e) if !e.is_fatal() => debug!(error = %e, "ignoring message from relay"),
                Err(e) => {
                    warn!(error = %e, "malformed message from relay");
                    self.invalidate("protocol violation");
                }
            },
            LinkEvent::WriteCompleted => session.write_pending = false,
            LinkEvent::Closed => self.invalidate("connection closed"),
            LinkEvent::Failed(e) => {
                debug!(error = %e, "relay link failed");
                self.invalidate("transport failure");
            }
        }
    }

    /// Drop the link and everything queued for it.
    fn invalidate(&mut self, why: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.link.abort();
        let mut state = self.shared.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        self.shared.drained.notify_all();
        let was = state.status.state;
        state.status.state = TransportState::Disconnected;
        state.status.connected = false;
        state.status.connect_time = None;
        info!(why, dropped, endpoint = %state.status.endpoint, ?was, "relay connection lost");
    }

    fn pump_outbound(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.streaming || session.write_pending {
            return;
        }
        let next = {
            let mut state = self.shared.lock();
            let next = next_outgoing(session, &mut state);
            if matches!(next, Some(Outgoing::Message(Message::CombatEvent { .. }))) {
                self.shared.drained.notify_all();
            }
            next
        };
        match next {
            None => {}
            Some(Outgoing::Reconnect) => {
                self.invalidate("account name changed");
                self.shared.lock().retry_now = true;
            }
            Some(Outgoing::Message(message)) => match message.encode() {
                Ok(bytes) => {
                    trace!(message = ?message.message_type(), "sending");
                    session.link.send(bytes);
                    session.write_pending = true;
                }
                Err(e) => error!(error = %e, "failed to encode outbound message"),
            },
        }
    }
}

/// Pick the highest-priority message for `session`, updating what the
/// session considers registered. Pops a combat event off the queue if that
/// is what goes next.
fn next_outgoing(session: &mut Session, state: &mut State) -> Option<Outgoing> {
    let identity = state.identity.as_ref()?;
    match &session.registered {
        None => {
            session.registered = Some(identity.clone());
            return Some(Outgoing::Message(Message::RegisterSelf {
                instance_id: identity.instance_id,
                account_name: identity.account_name.clone(),
            }));
        }
        Some(registered) if registered.account_name != identity.account_name => {
            return Some(Outgoing::Reconnect);
        }
        Some(registered) if registered.instance_id != identity.instance_id => {
            session.registered = Some(identity.clone());
            return Some(Outgoing::Message(Message::SetSelfId {
                instance_id: identity.instance_id,
            }));
        }
        Some(_) => {}
    }

    let mut wanted: BTreeMap<&str, InstanceId> = BTreeMap::new();
    for peer in state.peers.values() {
        wanted
            .entry(peer.account_name.as_str())
            .or_insert(peer.instance_id);
    }

    let departed = session
        .peers
        .iter()
        .find(|(name, id)| wanted.get(name.as_str()) != Some(*id))
        .map(|(name, id)| (name.clone(), *id));
    if let Some((name, peer_instance_id)) = departed {
        session.peers.remove(&name);
        return Some(Outgoing::Message(Message::RemovePeer { peer_instance_id }));
    }

    let arrived = wanted
        .iter()
        .find(|(name, _)| !session.peers.contains_key(**name))
        .map(|(name, id)| (name.to_string(), *id));
    if let Some((account_name, peer_instance_id)) = arrived {
        session.peers.insert(account_name.clone(), peer_instance_id);
        return Some(Outgoing::Message(Message::AddPeer {
            peer_instance_id,
            account_name,
        }));
    }

    state.queue.pop_front().map(|event| {
        Outgoing::Message(Message::CombatEvent {
            event,
            sender_instance_id: InstanceId(0),
        })
    })
}
