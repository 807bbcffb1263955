// healing_stats_relay — peer relay for healing stats combat telemetry.
//
// The relay is a thin broker: each addon process opens one connection,
// registers its account name and current instance id, declares which other
// accounts it wants its combat events sent to, and streams events. The relay
// fans each event out to the sender's declared peers whose current instance
// id still matches what the sender recorded. It keeps no history.
//
// Module overview:
// - `server.rs`:     Listener thread, drive loop, message dispatch, forced
//                    disconnects, and `start_relay` / `RelayHandle`.
// - `directory.rs`:  Account name → connection registrations and the
//                    per-connection peer lists. Plain data, no I/O.
// - `connection.rs`: Per-connection outbound queue with one write in flight.
// - `client.rs`:     `PeerTransport`, the addon side of the protocol with
//                    reconnects, roster diffing, and budget mode.
// - `link.rs`:       Thread pair that owns one socket (plain or TLS) and
//                    reports frames and write completions over a callback.
//                    Shared by both ends.
// - `tls.rs`:        rustls config builders from PEM material.
// - `config.rs`:     `RelayConfig`, JSON-loadable.
// - `stats.rs`:      Counters and the `RelayStatistics` snapshot.
// - `error.rs`:      `RelayError` for setup failures.
//
// Dependencies: `healing_stats_protocol` for the codec and framing. No
// async runtime; everything is `std::net` plus threads and channels.
//
// The relay runs as a standalone binary (`main.rs`) or embedded in a test
// process via `start_relay`.

pub mod client;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod link;
pub mod server;
pub mod stats;
pub mod tls;

pub use client::{PeerTransport, TransportSettings, TransportState, TransportStatus};
pub use config::RelayConfig;
pub use directory::RegistrationInfo;
pub use error::RelayError;
pub use server::{RelayHandle, start_relay};
pub use stats::RelayStatistics;
pub use tls::ServerCredentials;
