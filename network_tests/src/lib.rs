// Test-only addon peer for end-to-end relay tests.
//
// Wraps a real `AddonContext` (sequencer + `PeerTransport`) and a recording
// `StatsProcessor` to give tests a synchronous API that speaks in host
// callbacks: "the local player is X", "peer Y entered the area", "this
// combat event happened". Everything below the callbacks runs the same code
// the addon runs in the host.
//
// The only test-specific code is the recorder and the blocking wait
// helpers.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use healing_stats_addon::{AddonContext, AddonSettings, StatsProcessor};
use healing_stats_protocol::{Agent, CombatEvent, HostEvent, InstanceId};
use healing_stats_relay::TransportStatus;

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between polls in blocking waits.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds, panicking after `WAIT_TIMEOUT`.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Stats processor that remembers what it was handed.
#[derive(Default)]
pub struct RecordingProcessor {
    local: Mutex<Vec<u64>>,
    peer: Mutex<Vec<(CombatEvent, InstanceId)>>,
}

impl StatsProcessor for RecordingProcessor {
    fn local_combat(&self, event: &HostEvent, sequence_id: u64) {
        if event.event.is_some() {
            self.local
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(sequence_id);
        }
    }

    fn area_combat(&self, _: &HostEvent, _: u64) {}

    fn peer_combat(&self, event: &CombatEvent, peer_instance_id: InstanceId) {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*event, peer_instance_id));
    }
}

/// One simulated player: an addon context connected to a relay.
pub struct TestPeer {
    context: AddonContext,
    recorder: Arc<RecordingProcessor>,
    agent_id: u64,
}

impl TestPeer {
    /// Start an addon pointed at the plaintext relay at `addr` and announce
    /// the local player as `account` on `instance`.
    pub fn join(addr: SocketAddr, account: &str, instance: u16) -> Self {
        Self::join_with(addr, account, instance, |_| {})
    }

    /// Like `join`, with a chance to adjust settings first.
    pub fn join_with(
        addr: SocketAddr,
        account: &str,
        instance: u16,
        adjust: impl FnOnce(&mut AddonSettings),
    ) -> Self {
        let mut settings = AddonSettings {
            relay_endpoint: addr.to_string(),
            disable_encryption: true,
            reconnect_interval_ms: 50,
            ..AddonSettings::default()
        };
        adjust(&mut settings);
        let recorder = Arc::new(RecordingProcessor::default());
        let context = AddonContext::start(&settings, recorder.clone())
            .expect("AddonContext::start failed");
        let peer = Self {
            context,
            recorder,
            agent_id: 1000 + u64::from(instance),
        };
        peer.set_instance(account, instance);
        peer
    }

    /// Host notification that the local player (re-)entered the world.
    pub fn set_instance(&self, account: &str, instance: u16) {
        let notification = HostEvent {
            source: Some(Agent {
                id: self.agent_id,
                prof: 1,
                ..Agent::default()
            }),
            destination: Some(Agent {
                name: Some(account.into()),
                id: u64::from(instance),
                is_self: 1,
                ..Agent::default()
            }),
            ..HostEvent::default()
        };
        self.context.combat_local(notification, 0);
    }

    /// Host notification that another player's agent entered the area.
    pub fn see_peer(&self, agent_id: u64, account: &str, instance: u16) {
        let notification = HostEvent {
            source: Some(Agent {
                id: agent_id,
                prof: 1,
                ..Agent::default()
            }),
            destination: Some(Agent {
                name: Some(account.into()),
                id: u64::from(instance),
                ..Agent::default()
            }),
            ..HostEvent::default()
        };
        self.context.combat_area(notification, 0);
    }

    /// Host notification that another player's agent left the area.
    pub fn lose_peer(&self, agent_id: u64) {
        let notification = HostEvent {
            source: Some(Agent {
                id: agent_id,
                ..Agent::default()
            }),
            ..HostEvent::default()
        };
        self.context.combat_area(notification, 0);
    }

    /// A local combat callback with `sequence_id`.
    pub fn combat(&self, sequence_id: u64, event: CombatEvent) {
        self.context.combat_local(
            HostEvent {
                event: Some(event),
                ..HostEvent::default()
            },
            sequence_id,
        );
    }

    /// Block until every queued local event has been handed to the relay
    /// link.
    pub fn flush(&self) {
        self.context.flush_relay(0);
    }

    pub fn context(&self) -> &AddonContext {
        &self.context
    }

    pub fn status(&self) -> TransportStatus {
        self.context.relay_status()
    }

    /// Sequence ids the local processor has seen, in delivery order.
    pub fn local_sequence(&self) -> Vec<u64> {
        self.recorder
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn peer_events(&self) -> Vec<(CombatEvent, InstanceId)> {
        self.recorder
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until at least `count` peer events have arrived.
    pub fn wait_for_peer_events(&self, count: usize) -> Vec<(CombatEvent, InstanceId)> {
        wait_until(&format!("{count} peer events"), || {
            self.peer_events().len() >= count
        });
        self.peer_events()
    }

    pub fn leave(self) {
        self.context.shutdown();
    }
}
