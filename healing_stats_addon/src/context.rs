// The addon's owned runtime state.
//
// `AddonContext::start` builds everything the host callbacks need and
// `AddonContext::shutdown` tears it down; the host shim keeps the context
// between the two and passes `&AddonContext` to each callback.
//
// Local combat events go through an `EventSequencer` so the statistics
// processor and the relay transport see them in sequence-id order. Area
// events are handed over directly. A `RwLock<bool>` guards shutdown: each
// callback holds it shared for its whole duration, and `shutdown` takes it
// exclusively, so once it returns no callback is still running and later
// ones are ignored.
//
// The relay endpoint and root certificate path live behind their own lock
// and are read by the transport's accessor closures on every connection
// attempt, so changing them takes effect at the next reconnect.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use healing_stats_protocol::HostEvent;
use healing_stats_relay::{PeerTransport, TransportSettings, TransportStatus};
use healing_stats_sequencer::{EventSequencer, SequencedEvent};
use tracing::{debug, info, warn};

use crate::processor::StatsProcessor;
use crate::settings::AddonSettings;

/// Relay options the transport re-reads on every attempt.
#[derive(Debug, Default)]
struct RelayTarget {
    endpoint: String,
    root_certificates_path: Option<PathBuf>,
}

pub struct AddonContext {
    sequencer: EventSequencer<HostEvent>,
    transport: Arc<PeerTransport>,
    processor: Arc<dyn StatsProcessor>,
    target: Arc<RwLock<RelayTarget>>,
    shutting_down: RwLock<bool>,
}

impl AddonContext {
    /// Start the relay transport and wire the host streams to `processor`.
    pub fn start(
        settings: &AddonSettings,
        processor: Arc<dyn StatsProcessor>,
    ) -> std::io::Result<Self> {
        let target = Arc::new(RwLock::new(RelayTarget {
            endpoint: settings.relay_endpoint.clone(),
            root_certificates_path: settings.root_certificates_path.clone(),
        }));

        let endpoint = {
            let target = target.clone();
            move || {
                target
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .endpoint
                    .clone()
            }
        };
        let root_certificates = {
            let target = target.clone();
            move || {
                let path = target
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .root_certificates_path
                    .clone();
                read_root_certificates(path)
            }
        };
        let mut transport_settings = TransportSettings::new(endpoint, root_certificates);
        transport_settings.reconnect_interval = settings.reconnect_interval();
        transport_settings.max_queued_events = settings.max_queued_events;
        transport_settings.enabled = settings.relay_enabled;
        transport_settings.budget_mode = settings.budget_mode;
        transport_settings.disable_encryption = settings.disable_encryption;

        let peer_processor = processor.clone();
        let transport = Arc::new(PeerTransport::start(
            transport_settings,
            move |event, peer_instance_id| peer_processor.peer_combat(event, peer_instance_id),
        )?);

        let sequencer = {
            let processor = processor.clone();
            let transport = transport.clone();
            EventSequencer::new(move |sequenced: SequencedEvent<HostEvent>| {
                processor.local_combat(&sequenced.payload, sequenced.sequence_id);
                transport.process_local_event(&sequenced.payload);
            })
        };

        info!(
            endpoint = %settings.relay_endpoint,
            enabled = settings.relay_enabled,
            "addon started"
        );
        Ok(Self {
            sequencer,
            transport,
            processor,
            target,
            shutting_down: RwLock::new(false),
        })
    }

    /// Host callback for the local player's combat stream.
    pub fn combat_local(&self, event: HostEvent, sequence_id: u64) {
        let shutting_down = self.shutting_down.read().unwrap_or_else(PoisonError::into_inner);
        if *shutting_down {
            return;
        }
        self.sequencer.submit(event, sequence_id);
    }

    /// Host callback for the area combat stream.
    pub fn combat_area(&self, event: HostEvent, sequence_id: u64) {
        let shutting_down = self.shutting_down.read().unwrap_or_else(PoisonError::into_inner);
        if *shutting_down {
            return;
        }
        self.processor.area_combat(&event, sequence_id);
        self.transport.process_area_event(&event);
    }

    pub fn relay_status(&self) -> TransportStatus {
        self.transport.status()
    }

    /// Takes effect at the next connection attempt.
    pub fn set_relay_endpoint(&self, endpoint: &str) {
        self.target
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .endpoint = endpoint.to_owned();
    }

    pub fn set_root_certificates_path(&self, path: Option<PathBuf>) {
        self.target
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .root_certificates_path = path;
    }

    pub fn set_relay_enabled(&self, enabled: bool) {
        self.transport.set_enabled_status(enabled);
    }

    pub fn set_budget_mode(&self, budget_mode: bool) {
        self.transport.set_budget_mode(budget_mode);
    }

    pub fn set_disable_encryption(&self, disable: bool) {
        self.transport.set_disable_encryption(disable);
    }

    /// Wait until at most `acceptable_queue_size` local events are waiting
    /// to go to the relay.
    pub fn flush_relay(&self, acceptable_queue_size: usize) {
        self.transport.flush_events(acceptable_queue_size);
    }

    /// Stop accepting callbacks, wait for running ones, and stop the
    /// transport.
    pub fn shutdown(self) {
        *self.shutting_down.write().unwrap_or_else(PoisonError::into_inner) = true;
        self.transport.shutdown();
        if !self.sequencer.queue_is_empty() {
            warn!("local events still buffered at shutdown");
        }
        debug!(
            highest_queue_size = self.sequencer.highest_queue_size(),
            "sequencer statistics"
        );
        info!("addon stopped");
    }
}

fn read_root_certificates(path: Option<PathBuf>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match fs::read_to_string(&path) {
        Ok(pem) => pem,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read root certificates");
            String::new()
        }
    }
}
