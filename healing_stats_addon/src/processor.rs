// Seam between the addon context and the statistics engine.

use healing_stats_protocol::{CombatEvent, HostEvent, InstanceId};

/// Consumer of combat telemetry. Implementations must tolerate calls from
/// several threads at once: `local_combat` from whichever host thread
/// completes a sequence run, `area_combat` from host threads directly, and
/// `peer_combat` from the transport's drive thread.
pub trait StatsProcessor: Send + Sync {
    /// A local combat callback, in sequence-id order (best effort).
    fn local_combat(&self, event: &HostEvent, sequence_id: u64);

    /// An area combat callback, unordered.
    fn area_combat(&self, event: &HostEvent, sequence_id: u64);

    /// A combat event a peer observed, relayed to us. `peer_instance_id` is
    /// the peer's instance id at the time the relay forwarded it.
    fn peer_combat(&self, event: &CombatEvent, peer_instance_id: InstanceId);
}
