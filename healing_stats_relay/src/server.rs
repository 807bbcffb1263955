// TCP/TLS server and drive loop for the peer relay.
//
// Architecture: thread-per-link with a central `mpsc` channel.
//
// - **Listener thread** (non-blocking `TcpListener::accept()` loop): accepts
//   new TCP connections and sends `Completion::Accepted` to the drive loop.
//   It polls `keep_running` between accepts.
// - **Link threads** (see `link.rs`, two per connection): perform the TLS
//   handshake, read frames, and write whatever the drive loop hands them.
//   Each reports back as `Completion::Link { conn, event }`.
// - **Drive loop**: blocks on the channel and reacts to one completion at a
//   time, so every connection's messages are handled strictly in order.
//   `Completion::WakeUp` only exists to unblock it during shutdown.
//
// Per-message handling (`RelayCore::handle_frame`):
// - Frames are decoded with `Message::decode`. Malformed frames end the
//   connection with the decoder's fixed reason; unknown message types are
//   logged and skipped.
// - The connection's `ConnectionState` gates dispatch: anything but
//   RegisterSelf before registration ends it with "not registered yet", and
//   frames that race a disconnect are dropped.
// - Registration messages go to the `Directory` under its lock. A rejected
//   request ends the connection with the `RegistrationError` reason.
// - CombatEvent resolves the sender's peer entries under the directory lock,
//   skipping stale ones, then hands one copy to each target connection,
//   which writes it now or queues it behind its in-flight write.
//
// Every terminal error funnels into `RelayCore::force_disconnect`, which is
// idempotent, frees the account name, and sends a `Close` message carrying
// the reason, unless the relay itself is shutting down, in which case the
// socket is simply shut. The shutdown flag is an `RwLock<bool>`: disconnects
// hold it shared, `RelayHandle::stop` takes it exclusively to flip it.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use healing_stats_protocol::{CombatEvent, InstanceId, Message, MessageType};
use rustls::ServerConfig;
use tracing::{debug, error, info, trace, warn};

use crate::config::RelayConfig;
use crate::connection::{Connection, ConnectionState, Delivery};
use crate::directory::{ConnectionId, Directory, RegistrationError, RegistrationInfo};
use crate::error::RelayError;
use crate::link::{LinkEvent, LinkHandle, LinkTarget};
use crate::stats::{Counters, RelayStatistics};
use crate::tls;

/// How often the listener re-checks `keep_running` while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Everything the drive loop reacts to.
enum Completion {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Link {
        conn: ConnectionId,
        event: LinkEvent,
    },
    WakeUp,
}

/// Handle returned by `start_relay` to inspect and stop the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    core: Arc<RelayCore>,
    wake: Sender<Completion>,
    drive_thread: Option<thread::JoinHandle<()>>,
    listener_thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down. Every
    /// connection is dropped without a Close message.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn statistics(&self) -> RelayStatistics {
        self.core.statistics()
    }

    /// Current registration of `account_name`, if it is online.
    pub fn registration(&self, account_name: &str) -> Option<RegistrationInfo> {
        self.core
            .directory()
            .find_account(account_name)
            .map(|(_, registration)| registration.info())
    }

    /// Disconnect whoever is registered as `account_name`, sending `reason`.
    /// Returns false if the account is not online.
    pub fn force_disconnect(&self, account_name: &str, reason: &str) -> bool {
        let conn = self
            .core
            .directory()
            .find_account(account_name)
            .map(|(_, registration)| registration.handle.clone());
        match conn {
            Some(conn) => {
                self.core.force_disconnect(&conn, reason);
                true
            }
            None => false,
        }
    }

    fn shutdown(&mut self) {
        if self.drive_thread.is_none() {
            return;
        }
        self.core.begin_shutdown();
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = self.wake.send(Completion::WakeUp);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.drive_thread.take() {
            let _ = handle.join();
        }
        info!("relay stopped");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start the relay on background threads. Returns a handle for stopping it
/// and the actual bound address (useful when port 0 is used to let the OS
/// pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let tls = match config.resolve_credentials()? {
        Some(credentials) => Some(tls::server_config(&credentials)?),
        None => None,
    };
    let listener = TcpListener::bind(&config.listen)?;
    let addr = listener.local_addr()?;
    // Non-blocking so the accept thread can check keep_running periodically.
    listener.set_nonblocking(true)?;

    let encrypted = tls.is_some();
    let keep_running = Arc::new(AtomicBool::new(true));
    let core = Arc::new(RelayCore::new());
    let (tx, rx): (Sender<Completion>, Receiver<Completion>) = mpsc::channel();

    let listener_thread = {
        let keep_running = keep_running.clone();
        let tx = tx.clone();
        thread::Builder::new()
            .name("relay-listener".into())
            .spawn(move || accept_loop(listener, tx, keep_running))?
    };
    let drive_thread = {
        let keep_running = keep_running.clone();
        let core = core.clone();
        let tx = tx.clone();
        thread::Builder::new()
            .name("relay-drive".into())
            .spawn(move || drive_loop(core, rx, tx, tls, keep_running))?
    };

    info!(%addr, encrypted, "relay listening");
    Ok((
        RelayHandle {
            keep_running,
            core,
            wake: tx,
            drive_thread: Some(drive_thread),
            listener_thread: Some(listener_thread),
        },
        addr,
    ))
}

fn accept_loop(listener: TcpListener, tx: Sender<Completion>, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping accepted socket");
                    continue;
                }
                if tx.send(Completion::Accepted { stream, peer }).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                error!(error = %e, "accept failed, listener exiting");
                break;
            }
        }
    }
}

fn drive_loop(
    core: Arc<RelayCore>,
    rx: Receiver<Completion>,
    tx: Sender<Completion>,
    tls: Option<Arc<ServerConfig>>,
    keep_running: Arc<AtomicBool>,
) {
    while let Ok(completion) = rx.recv() {
        if !keep_running.load(Ordering::SeqCst) {
            break;
        }
        match completion {
            Completion::Accepted { stream, peer } => {
                core.accept(stream, peer, tls.clone(), &tx);
            }
            Completion::Link { conn, event } => core.handle_link_event(conn, event),
            Completion::WakeUp => {}
        }
    }
    core.teardown();
}

/// Shared relay state. The drive loop owns the only mutating path for
/// connection traffic; `RelayHandle` reads statistics and can force
/// disconnects from other threads.
pub(crate) struct RelayCore {
    directory: Mutex<Directory<Arc<Connection>>>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    shutting_down: RwLock<bool>,
    counters: Counters,
    next_id: AtomicU64,
}

impl RelayCore {
    fn new() -> Self {
        Self {
            directory: Mutex::new(Directory::new()),
            connections: Mutex::new(HashMap::new()),
            shutting_down: RwLock::new(false),
            counters: Counters::default(),
            next_id: AtomicU64::new(1),
        }
    }

    fn directory(&self) -> MutexGuard<'_, Directory<Arc<Connection>>> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections().get(&id).cloned()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_shutdown(&self) {
        *self.shutting_down.write().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn statistics(&self) -> RelayStatistics {
        let directory = self.directory().statistics();
        let live = self.connections().len();
        self.counters.snapshot(directory, live)
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<Arc<ServerConfig>>,
        tx: &Sender<Completion>,
    ) {
        if self.is_shutting_down() {
            return;
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let tx = tx.clone();
        let link = LinkHandle::spawn(
            LinkTarget::Accepted { stream, tls },
            format!("conn{}", id.0),
            move |event| {
                let _ = tx.send(Completion::Link { conn: id, event });
            },
        );
        match link {
            Ok(link) => {
                debug!(conn = %id, %peer, "accepted connection");
                self.register_connection(Arc::new(Connection::new(id, peer, link)));
            }
            Err(e) => warn!(%peer, error = %e, "failed to start link"),
        }
    }

    fn register_connection(&self, conn: Arc<Connection>) {
        self.connections().insert(conn.id, conn);
    }

    fn handle_link_event(&self, id: ConnectionId, event: LinkEvent) {
        let Some(conn) = self.connection(id) else {
            trace!(conn = %id, ?event, "event for a finished connection");
            return;
        };
        match event {
            LinkEvent::Ready => {
                conn.set_state(ConnectionState::Unregistered);
                info!(conn = %id, peer = %conn.peer, "connection ready");
            }
            LinkEvent::Frame(bytes) => self.handle_frame(&conn, &bytes),
            LinkEvent::WriteCompleted => {
                if conn.write_completed() {
                    self.counters.transmitted(MessageType::CombatEvent);
                }
            }
            LinkEvent::Closed => self.release(&conn, "closed by peer"),
            LinkEvent::Failed(e) => {
                debug!(conn = %id, error = %e, "link failed");
                self.release(&conn, "transport failure");
            }
        }
    }

    fn handle_frame(&self, conn: &Arc<Connection>, bytes: &[u8]) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) if !e.is_fatal() => {
                self.counters.unknown_received();
                warn!(conn = %conn.id, error = %e, "ignoring message");
                return;
            }
            Err(e) => {
                warn!(conn = %conn.id, error = %e, "protocol violation");
                self.force_disconnect(conn, e.reason());
                return;
            }
        };
        match conn.state() {
            ConnectionState::Disconnected => return,
            ConnectionState::Registered => {}
            ConnectionState::Accepted | ConnectionState::Unregistered => {
                if !matches!(message, Message::RegisterSelf { .. }) {
                    self.counters.received(message.message_type());
                    warn!(conn = %conn.id, message = ?message.message_type(), "message before registration");
                    self.force_disconnect(conn, RegistrationError::NotRegistered.reason());
                    return;
                }
            }
        }
        self.counters.received(message.message_type());

        let result = match message {
            Message::RegisterSelf {
                instance_id,
                account_name,
            } => self.register_self(conn, instance_id, &account_name),
            Message::SetSelfId { instance_id } => self
                .directory()
                .set_self_id(conn.id, instance_id)
                .map(|()| {
                    debug!(conn = %conn.id, instance_id = instance_id.0, "instance id changed");
                }),
            Message::AddPeer {
                peer_instance_id,
                account_name,
            } => self
                .directory()
                .add_peer(conn.id, peer_instance_id, &account_name)
                .map(|()| {
                    debug!(conn = %conn.id, peer = %account_name, instance_id = peer_instance_id.0, "peer added");
                }),
            Message::RemovePeer { peer_instance_id } => self
                .directory()
                .remove_peer(conn.id, peer_instance_id)
                .map(|removed| {
                    debug!(conn = %conn.id, peer = ?removed, instance_id = peer_instance_id.0, "peer removed");
                }),
            Message::CombatEvent { event, .. } => self.forward(conn, event),
            Message::Close { .. } => {
                self.force_disconnect(conn, "unexpected Close from client");
                return;
            }
        };

        if let Err(e) = result {
            warn!(conn = %conn.id, error = %e, "registration rejected");
            self.force_disconnect(conn, e.reason());
        }
    }

    fn register_self(
        &self,
        conn: &Arc<Connection>,
        instance_id: InstanceId,
        account_name: &str,
    ) -> Result<(), RegistrationError> {
        self.directory()
            .register_self(conn.id, instance_id, account_name, conn.clone())?;
        conn.set_state(ConnectionState::Registered);
        info!(
            conn = %conn.id,
            account = %account_name,
            instance_id = instance_id.0,
            "registered"
        );
        Ok(())
    }

    fn forward(&self, sender: &Arc<Connection>, event: CombatEvent) -> Result<(), RegistrationError> {
        let resolved = self.directory().resolve_peers(sender.id)?;
        self.counters.stale_peers_skipped(resolved.stale);
        if resolved.targets.is_empty() {
            return Ok(());
        }

        let message = Message::CombatEvent {
            event,
            sender_instance_id: resolved.sender_instance_id,
        };
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode combat event");
                return Ok(());
            }
        };
        for target in &resolved.targets {
            match target.send_or_queue(bytes.clone()) {
                Delivery::Sent => self.counters.transmitted(MessageType::CombatEvent),
                Delivery::Queued => {
                    trace!(from = %sender.id, to = %target.id, queued = target.queued(), "queued combat event");
                }
                Delivery::Dropped => {}
            }
        }
        Ok(())
    }

    /// End `conn` because of `reason`. Safe to call more than once; only the
    /// first call has any effect.
    pub(crate) fn force_disconnect(&self, conn: &Arc<Connection>, reason: &str) {
        let shutting_down = self.shutting_down.read().unwrap_or_else(PoisonError::into_inner);
        if !conn.begin_disconnect() {
            return;
        }
        self.counters.forced_disconnect();
        let registration = self.directory().remove(conn.id);
        info!(
            conn = %conn.id,
            account = registration.as_ref().map(|r| r.account_name.as_str()),
            reason,
            "force disconnect"
        );

        if *shutting_down {
            conn.abort();
        } else {
            let close = Message::Close {
                reason: reason.to_owned(),
            };
            match close.encode() {
                Ok(bytes) => {
                    conn.close(bytes);
                    self.counters.transmitted(MessageType::Close);
                }
                Err(_) => conn.abort(),
            }
        }
        drop(shutting_down);
        self.connections().remove(&conn.id);
    }

    /// The link ended on its own; forget the connection quietly.
    fn release(&self, conn: &Arc<Connection>, why: &str) {
        if !conn.begin_disconnect() {
            return;
        }
        let registration = self.directory().remove(conn.id);
        info!(
            conn = %conn.id,
            account = registration.as_ref().map(|r| r.account_name.as_str()),
            why,
            "connection closed"
        );
        conn.abort();
        self.connections().remove(&conn.id);
    }

    /// Drop every connection. Runs on the drive thread as it exits.
    fn teardown(&self) {
        self.begin_shutdown();
        let connections: Vec<_> = self.connections().drain().map(|(_, conn)| conn).collect();
        for conn in &connections {
            self.force_disconnect(conn, "relay shutting down");
        }
        debug_assert!(self.directory().is_empty());
        info!(dropped = connections.len(), "relay connections closed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use healing_stats_protocol::framing::read_frame;

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    /// A connection past its handshake that has not registered.
    fn ready_connection(core: &RelayCore, id: u64) -> (Arc<Connection>, TcpStream) {
        let (client, server, peer) = tcp_pair();
        let link = LinkHandle::spawn(
            LinkTarget::Accepted {
                stream: server,
                tls: None,
            },
            format!("test{id}"),
            |_| {},
        )
        .unwrap();
        let conn = Arc::new(Connection::new(ConnectionId(id), peer, link));
        conn.set_state(ConnectionState::Unregistered);
        core.register_connection(conn.clone());
        (conn, client)
    }

    fn registered_connection(core: &RelayCore, id: u64, account: &str) -> (Arc<Connection>, TcpStream) {
        let (conn, client) = ready_connection(core, id);
        core.register_self(&conn, InstanceId(10), account).unwrap();
        (conn, client)
    }

    fn encoded(message: Message) -> Vec<u8> {
        message.encode().unwrap()
    }

    #[test]
    fn only_register_self_passes_before_registration() {
        let core = RelayCore::new();
        let (conn, mut client) = ready_connection(&core, 1);
        assert_eq!(conn.state(), ConnectionState::Unregistered);

        core.handle_frame(
            &conn,
            &encoded(Message::SetSelfId {
                instance_id: InstanceId(11),
            }),
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let stats = core.statistics();
        assert_eq!(stats.forced_disconnects, 1);
        assert_eq!(stats.received["SetSelfId"], 1);

        let frame = read_frame(&mut client).unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Close {
                reason: "not registered yet".into()
            }
        );
    }

    #[test]
    fn register_self_moves_connection_to_registered() {
        let core = RelayCore::new();
        let (conn, _client) = ready_connection(&core, 1);
        core.handle_frame(
            &conn,
            &encoded(Message::RegisterSelf {
                instance_id: InstanceId(10),
                account_name: "alice.1234".into(),
            }),
        );
        assert_eq!(conn.state(), ConnectionState::Registered);
        assert!(core.directory().find_account("alice.1234").is_some());
    }

    #[test]
    fn frames_racing_a_disconnect_are_dropped() {
        let core = RelayCore::new();
        let (conn, _client) = registered_connection(&core, 1, "alice.1234");
        core.force_disconnect(&conn, "maintenance");

        core.handle_frame(
            &conn,
            &encoded(Message::SetSelfId {
                instance_id: InstanceId(11),
            }),
        );
        let stats = core.statistics();
        assert_eq!(stats.received["SetSelfId"], 0);
        assert_eq!(stats.forced_disconnects, 1);
    }

    #[test]
    fn force_disconnect_is_idempotent() {
        let core = RelayCore::new();
        let (conn, mut client) = registered_connection(&core, 1, "alice.1234");
        assert_eq!(core.directory().len(), 1);

        core.force_disconnect(&conn, "account name collision");
        core.force_disconnect(&conn, "second reason");

        assert!(core.directory().is_empty());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let stats = core.statistics();
        assert_eq!(stats.forced_disconnects, 1);
        assert_eq!(stats.transmitted["Close"], 1);
        assert_eq!(stats.live_connections, 0);

        let frame = read_frame(&mut client).unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::Close {
                reason: "account name collision".into()
            }
        );
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn shutdown_disconnects_without_close() {
        let core = RelayCore::new();
        let (_alice, mut alice_client) = registered_connection(&core, 1, "alice.1234");
        let (_bob, _bob_client) = registered_connection(&core, 2, "bob.5678");

        core.teardown();
        assert!(core.directory().is_empty());
        assert_eq!(core.statistics().transmitted["Close"], 0);

        let mut rest = Vec::new();
        let _ = alice_client.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    #[test]
    fn queued_events_flow_after_write_completion() {
        let core = RelayCore::new();
        let (alice, _alice_client) = registered_connection(&core, 1, "alice.1234");
        let (bob, _bob_client) = registered_connection(&core, 2, "bob.5678");
        core.directory()
            .add_peer(alice.id, InstanceId(10), "bob.5678")
            .unwrap();

        let event = CombatEvent {
            skill_id: 500,
            ..CombatEvent::default()
        };
        core.forward(&alice, event).unwrap();
        core.forward(&alice, event).unwrap();
        core.forward(&alice, event).unwrap();
        assert_eq!(bob.queued(), 2);

        assert!(bob.write_completed());
        assert_eq!(bob.queued(), 1);
        assert!(bob.write_completed());
        assert!(!bob.write_completed());
        assert_eq!(bob.queued(), 0);
    }
}
