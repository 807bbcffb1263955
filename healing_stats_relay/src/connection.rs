// Server-side state for one accepted connection.
//
// A `Connection` pairs the link that carries its bytes with the relay-side
// outbound queue. The relay keeps at most one write in flight per link:
// `send_or_queue` writes immediately when the link is idle and otherwise
// appends to an unbounded FIFO, and `write_completed` pops the next queued
// message when the pump reports the previous write done. Both run under the
// connection's own lock, so forwarding from several senders to one peer
// never interleaves with its completion handling.
//
// `ConnectionState` is what the drive loop checks before dispatching a
// frame (see `RelayCore::handle_frame`).
//
// `begin_disconnect` makes teardown idempotent: only the first caller gets
// `true` and goes on to remove the directory entry and close the link.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::directory::ConnectionId;
use crate::link::LinkHandle;

/// Where a connection is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket accepted, handshake not finished.
    Accepted,
    /// Reads armed, no RegisterSelf yet.
    Unregistered,
    Registered,
    Disconnected,
}

/// What `send_or_queue` did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    /// The connection is already being torn down.
    Dropped,
}

struct Outbound {
    state: ConnectionState,
    write_pending: bool,
    queue: VecDeque<Vec<u8>>,
    force_disconnected: bool,
}

pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    link: LinkHandle,
    outbound: Mutex<Outbound>,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr, link: LinkHandle) -> Self {
        Self {
            id,
            peer,
            link,
            outbound: Mutex::new(Outbound {
                state: ConnectionState::Accepted,
                write_pending: false,
                queue: VecDeque::new(),
                force_disconnected: false,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Advance the lifecycle. A disconnected connection stays disconnected.
    pub fn set_state(&self, state: ConnectionState) {
        let mut outbound = self.lock();
        if outbound.state != ConnectionState::Disconnected {
            outbound.state = state;
        }
    }

    pub fn send_or_queue(&self, message: Vec<u8>) -> Delivery {
        let mut outbound = self.lock();
        if outbound.force_disconnected {
            return Delivery::Dropped;
        }
        if outbound.write_pending {
            outbound.queue.push_back(message);
            Delivery::Queued
        } else {
            outbound.write_pending = true;
            self.link.send(message);
            Delivery::Sent
        }
    }

    /// The in-flight write finished. Returns true if a queued message was
    /// sent in its place.
    pub fn write_completed(&self) -> bool {
        let mut outbound = self.lock();
        if outbound.force_disconnected {
            return false;
        }
        match outbound.queue.pop_front() {
            Some(message) => {
                self.link.send(message);
                true
            }
            None => {
                outbound.write_pending = false;
                false
            }
        }
    }

    /// Mark the connection as going away. Returns false if it already was.
    pub fn begin_disconnect(&self) -> bool {
        let mut outbound = self.lock();
        if outbound.force_disconnected {
            return false;
        }
        outbound.force_disconnected = true;
        outbound.state = ConnectionState::Disconnected;
        outbound.queue.clear();
        true
    }

    /// Write a final message and close gracefully.
    pub fn close(&self, farewell: Vec<u8>) {
        self.link.close(farewell);
    }

    /// Close without a final message.
    pub fn abort(&self) {
        self.link.abort();
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
