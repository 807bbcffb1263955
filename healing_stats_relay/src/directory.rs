// Registration directory for the relay server.
//
// `Directory` is the relay's authoritative view of who is online: which
// account name each connection registered under, that account's current
// instance id, and the peers (account name → instance id) the connection
// asked to receive its combat events. It is the piece of `server.rs` that
// decides every registration conflict, so it is kept free of sockets and
// generic over the per-connection handle `H` the server stores alongside
// each registration. Unit tests use `()` as the handle.
//
// Account names are bound insert-if-absent: a second connection claiming a
// live name is rejected, and a connection can register only once. A peer
// entry is honored only while the named account's current instance id still
// equals the one recorded by AddPeer; otherwise it is stale and skipped
// until the client replaces it.
//
// All methods run under the server's single directory lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use healing_stats_protocol::InstanceId;
use tracing::debug;

/// Relay-assigned connection id. Never reused within a relay's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registration request that cannot be honored. Each one ends the
/// offending connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("already registered account name on this connection")]
    AlreadyRegistered,
    #[error("account name collision")]
    AccountNameCollision,
    #[error("not registered yet")]
    NotRegistered,
    #[error("peer already registered")]
    PeerAlreadyRegistered,
}

impl RegistrationError {
    /// Disconnect reason sent to the client.
    pub fn reason(&self) -> &'static str {
        match self {
            RegistrationError::AlreadyRegistered => {
                "already registered account name on this connection"
            }
            RegistrationError::AccountNameCollision => "account name collision",
            RegistrationError::NotRegistered => "not registered yet",
            RegistrationError::PeerAlreadyRegistered => "peer already registered",
        }
    }
}

/// One connection's registration.
#[derive(Clone, Debug)]
pub struct Registration<H> {
    pub account_name: String,
    pub instance_id: InstanceId,
    pub peers: BTreeMap<String, InstanceId>,
    pub handle: H,
}

/// Read-only view of a registration, for callers outside the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub account_name: String,
    pub instance_id: InstanceId,
    pub peers: BTreeMap<String, InstanceId>,
}

impl<H> Registration<H> {
    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            account_name: self.account_name.clone(),
            instance_id: self.instance_id,
            peers: self.peers.clone(),
        }
    }
}

/// Where a sender's combat event should go.
#[derive(Debug)]
pub struct Resolved<H> {
    /// Sender's current instance id, stamped on forwarded events.
    pub sender_instance_id: InstanceId,
    pub targets: Vec<H>,
    /// Peer entries whose account re-registered with another instance id.
    pub stale: usize,
    /// Peer entries whose account is not connected.
    pub offline: usize,
}

/// Directory-derived counters for `RelayStatistics`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectoryStatistics {
    pub registered_players: usize,
    pub registered_peers: usize,
    /// Peer entries naming an account that is currently registered.
    pub known_peers: usize,
}

#[derive(Debug)]
pub struct Directory<H> {
    accounts: HashMap<String, ConnectionId>,
    registrations: HashMap<ConnectionId, Registration<H>>,
}

impl<H> Default for Directory<H> {
    fn default() -> Self {
        Self {
            accounts: HashMap::new(),
            registrations: HashMap::new(),
        }
    }
}

impl<H: Clone> Directory<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to `account_name`.
    pub fn register_self(
        &mut self,
        conn: ConnectionId,
        instance_id: InstanceId,
        account_name: &str,
        handle: H,
    ) -> Result<(), RegistrationError> {
        if self.registrations.contains_key(&conn) {
            return Err(RegistrationError::AlreadyRegistered);
        }
        if self.accounts.contains_key(account_name) {
            return Err(RegistrationError::AccountNameCollision);
        }
        self.accounts.insert(account_name.to_owned(), conn);
        self.registrations.insert(
            conn,
            Registration {
                account_name: account_name.to_owned(),
                instance_id,
                peers: BTreeMap::new(),
                handle,
            },
        );
        Ok(())
    }

    pub fn set_self_id(
        &mut self,
        conn: ConnectionId,
        instance_id: InstanceId,
    ) -> Result<(), RegistrationError> {
        let registration = self.registered_mut(conn)?;
        registration.instance_id = instance_id;
        Ok(())
    }

    pub fn add_peer(
        &mut self,
        conn: ConnectionId,
        peer_instance_id: InstanceId,
        account_name: &str,
    ) -> Result<(), RegistrationError> {
        let registration = self.registered_mut(conn)?;
        if registration.peers.contains_key(account_name) {
            return Err(RegistrationError::PeerAlreadyRegistered);
        }
        registration
            .peers
            .insert(account_name.to_owned(), peer_instance_id);
        Ok(())
    }

    /// Remove the peer entry recorded with `peer_instance_id`. Returns the
    /// removed account name, or `None` if nothing matched.
    pub fn remove_peer(
        &mut self,
        conn: ConnectionId,
        peer_instance_id: InstanceId,
    ) -> Result<Option<String>, RegistrationError> {
        let registration = self.registered_mut(conn)?;
        let name = registration
            .peers
            .iter()
            .find(|(_, id)| **id == peer_instance_id)
            .map(|(name, _)| name.clone());
        if let Some(name) = &name {
            registration.peers.remove(name);
        }
        Ok(name)
    }

    /// Resolve `conn`'s peer entries to live, current registrations.
    pub fn resolve_peers(&self, conn: ConnectionId) -> Result<Resolved<H>, RegistrationError> {
        let registration = self
            .registrations
            .get(&conn)
            .ok_or(RegistrationError::NotRegistered)?;

        let mut resolved = Resolved {
            sender_instance_id: registration.instance_id,
            targets: Vec::with_capacity(registration.peers.len()),
            stale: 0,
            offline: 0,
        };
        for (name, recorded) in &registration.peers {
            let peer = self
                .accounts
                .get(name)
                .and_then(|id| self.registrations.get(id));
            match peer {
                Some(peer) if peer.instance_id == *recorded => {
                    resolved.targets.push(peer.handle.clone());
                }
                Some(peer) => {
                    debug!(
                        conn = %conn,
                        peer = %name,
                        recorded = recorded.0,
                        current = peer.instance_id.0,
                        "skipping stale peer entry"
                    );
                    resolved.stale += 1;
                }
                None => resolved.offline += 1,
            }
        }
        Ok(resolved)
    }

    /// Drop `conn`'s registration, freeing its account name.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<Registration<H>> {
        let registration = self.registrations.remove(&conn)?;
        if self.accounts.get(&registration.account_name) == Some(&conn) {
            self.accounts.remove(&registration.account_name);
        }
        Some(registration)
    }

    pub fn registration(&self, conn: ConnectionId) -> Option<&Registration<H>> {
        self.registrations.get(&conn)
    }

    pub fn find_account(&self, account_name: &str) -> Option<(ConnectionId, &Registration<H>)> {
        let conn = *self.accounts.get(account_name)?;
        self.registrations.get(&conn).map(|r| (conn, r))
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn statistics(&self) -> DirectoryStatistics {
        let mut stats = DirectoryStatistics {
            registered_players: self.registrations.len(),
            ..DirectoryStatistics::default()
        };
        for registration in self.registrations.values() {
            stats.registered_peers += registration.peers.len();
            stats.known_peers += registration
                .peers
                .keys()
                .filter(|name| self.accounts.contains_key(*name))
                .count();
        }
        stats
    }

    fn registered_mut(
        &mut self,
        conn: ConnectionId,
    ) -> Result<&mut Registration<H>, RegistrationError> {
        self.registrations
            .get_mut(&conn)
            .ok_or(RegistrationError::NotRegistered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);
    const C: ConnectionId = ConnectionId(3);

    fn directory() -> Directory<ConnectionId> {
        let mut dir = Directory::new();
        dir.register_self(A, InstanceId(10), "alice.1234", A).unwrap();
        dir.register_self(B, InstanceId(20), "bob.5678", B).unwrap();
        dir
    }

    #[test]
    fn second_register_on_same_connection_fails() {
        let mut dir = directory();
        assert_eq!(
            dir.register_self(A, InstanceId(11), "carol.9999", A),
            Err(RegistrationError::AlreadyRegistered)
        );
        let (conn, reg) = dir.find_account("alice.1234").unwrap();
        assert_eq!(conn, A);
        assert_eq!(reg.instance_id, InstanceId(10));
        assert!(dir.find_account("carol.9999").is_none());
    }

    #[test]
    fn name_bound_elsewhere_collides() {
        let mut dir = directory();
        assert_eq!(
            dir.register_self(C, InstanceId(30), "alice.1234", C),
            Err(RegistrationError::AccountNameCollision)
        );
        assert_eq!(dir.find_account("alice.1234").unwrap().0, A);
        assert!(dir.registration(C).is_none());
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn name_is_free_again_after_removal() {
        let mut dir = directory();
        let removed = dir.remove(A).unwrap();
        assert_eq!(removed.account_name, "alice.1234");
        dir.register_self(C, InstanceId(30), "alice.1234", C).unwrap();
        assert_eq!(dir.find_account("alice.1234").unwrap().0, C);
    }

    #[test]
    fn unregistered_connection_is_rejected() {
        let mut dir = directory();
        assert_eq!(
            dir.set_self_id(C, InstanceId(1)),
            Err(RegistrationError::NotRegistered)
        );
        assert_eq!(
            dir.add_peer(C, InstanceId(1), "alice.1234"),
            Err(RegistrationError::NotRegistered)
        );
        assert_eq!(
            dir.remove_peer(C, InstanceId(1)),
            Err(RegistrationError::NotRegistered)
        );
        assert!(matches!(
            dir.resolve_peers(C),
            Err(RegistrationError::NotRegistered)
        ));
    }

    #[test]
    fn add_then_remove_peer_leaves_no_entry() {
        let mut dir = directory();
        dir.add_peer(A, InstanceId(20), "bob.5678").unwrap();
        assert_eq!(
            dir.remove_peer(A, InstanceId(20)).unwrap(),
            Some("bob.5678".to_string())
        );
        assert!(dir.registration(A).unwrap().peers.is_empty());

        // No match: no-op, not an error.
        assert_eq!(dir.remove_peer(A, InstanceId(20)).unwrap(), None);
    }

    #[test]
    fn duplicate_peer_name_is_rejected() {
        let mut dir = directory();
        dir.add_peer(A, InstanceId(20), "bob.5678").unwrap();
        assert_eq!(
            dir.add_peer(A, InstanceId(21), "bob.5678"),
            Err(RegistrationError::PeerAlreadyRegistered)
        );
    }

    #[test]
    fn resolve_skips_stale_and_offline_peers() {
        let mut dir = directory();
        dir.add_peer(A, InstanceId(20), "bob.5678").unwrap();
        dir.add_peer(A, InstanceId(40), "dave.0001").unwrap();

        let resolved = dir.resolve_peers(A).unwrap();
        assert_eq!(resolved.sender_instance_id, InstanceId(10));
        assert_eq!(resolved.targets, vec![B]);
        assert_eq!(resolved.offline, 1);

        dir.set_self_id(B, InstanceId(21)).unwrap();
        let resolved = dir.resolve_peers(A).unwrap();
        assert!(resolved.targets.is_empty());
        assert_eq!(resolved.stale, 1);
    }

    #[test]
    fn statistics_count_known_peers() {
        let mut dir = directory();
        dir.add_peer(A, InstanceId(20), "bob.5678").unwrap();
        dir.add_peer(A, InstanceId(40), "dave.0001").unwrap();
        dir.add_peer(B, InstanceId(10), "alice.1234").unwrap();
        assert_eq!(
            dir.statistics(),
            DirectoryStatistics {
                registered_players: 2,
                registered_peers: 3,
                known_peers: 2,
            }
        );
    }
}
