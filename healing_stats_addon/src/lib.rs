// healing_stats_addon — the owned context behind the host's combat
// callbacks.
//
// The host calls into the addon from several threads: once per local combat
// event (numbered, out of order) and once per area combat event. Everything
// those calls need lives in one `AddonContext`, created at load time and
// torn down at unload, instead of in process globals.
//
// Module overview:
// - `context.rs`:   `AddonContext`: sequencer for the local stream, the
//                   `PeerTransport`, relay settings accessors, shutdown.
// - `processor.rs`: `StatsProcessor`, the seam to the statistics engine
//                   (aggregation and display live outside this workspace).
// - `settings.rs`:  `AddonSettings`, the user-facing relay options, loaded
//                   from JSON.
//
// Data flow: local events → `EventSequencer` → `StatsProcessor::local_combat`
// and `PeerTransport::process_local_event`; area events →
// `StatsProcessor::area_combat` and `PeerTransport::process_area_event`;
// relayed peer events → `StatsProcessor::peer_combat`.

pub mod context;
pub mod processor;
pub mod settings;

pub use context::AddonContext;
pub use processor::StatsProcessor;
pub use settings::{AddonSettings, SettingsError};
