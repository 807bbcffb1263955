// TLS end-to-end test: a relay serving a self-signed certificate and two
// `PeerTransport` clients that trust it.
//
// The certificate is generated per test with rcgen for "localhost", so the
// clients connect by name and exercise certificate verification, not just
// encryption.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use healing_stats_protocol::{CombatEvent, InstanceId};
use healing_stats_relay::{
    PeerTransport, RelayConfig, ServerCredentials, TransportSettings, TransportState,
    start_relay,
};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn transports_exchange_events_over_tls() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let root_pem = certified.cert.pem();
    let config = RelayConfig {
        listen: "127.0.0.1:0".into(),
        credentials: Some(ServerCredentials::new(
            root_pem.clone(),
            certified.key_pair.serialize_pem(),
        )),
        ..RelayConfig::default()
    };
    let (relay, addr) = start_relay(config).unwrap();
    let endpoint = format!("localhost:{}", addr.port());

    let settings = |endpoint: String, roots: String| {
        TransportSettings::new(move || endpoint.clone(), move || roots.clone())
    };

    let alice = PeerTransport::start(settings(endpoint.clone(), root_pem.clone()), |_, _| {})
        .unwrap();
    let (tx, rx) = mpsc::channel();
    let bob = PeerTransport::start(
        settings(endpoint.clone(), root_pem.clone()),
        move |event: &CombatEvent, sender: InstanceId| {
            let _ = tx.send((*event, sender));
        },
    )
    .unwrap();

    alice.set_local_identity("alice.1234", InstanceId(10));
    alice.add_peer_interest(2, InstanceId(20), "bob.5678");
    bob.set_local_identity("bob.5678", InstanceId(20));

    wait_until("both transports registered", || {
        relay.registration("bob.5678").is_some()
            && relay
                .registration("alice.1234")
                .is_some_and(|r| r.peers.len() == 1)
    });

    let status = alice.status();
    assert_eq!(status.state, TransportState::Streaming);
    assert!(status.connected);
    assert!(status.encrypted);
    assert_eq!(status.endpoint, endpoint);
    assert!(status.connect_time.is_some());

    let event = CombatEvent {
        skill_id: 500,
        value: 300,
        ..CombatEvent::default()
    };
    assert!(alice.queue_combat_event(&event));
    alice.flush_events(0);

    let (received, sender) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(received.skill_id, 500);
    assert_eq!(received.value, 300);
    assert_eq!(sender, InstanceId(10));

    alice.shutdown();
    bob.shutdown();
    wait_until("relay empty", || relay.statistics().registered_players == 0);
    relay.stop();
}

#[test]
fn untrusted_certificate_never_registers() {
    let served = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let config = RelayConfig {
        listen: "127.0.0.1:0".into(),
        credentials: Some(ServerCredentials::new(
            served.cert.pem(),
            served.key_pair.serialize_pem(),
        )),
        ..RelayConfig::default()
    };
    let (relay, addr) = start_relay(config).unwrap();

    let endpoint = format!("localhost:{}", addr.port());
    let roots = other.cert.pem();
    let mut settings = TransportSettings::new(move || endpoint.clone(), move || roots.clone());
    settings.reconnect_interval = Duration::from_millis(50);
    let transport = PeerTransport::start(settings, |_, _| {}).unwrap();
    transport.set_local_identity("alice.1234", InstanceId(10));

    std::thread::sleep(Duration::from_millis(500));
    assert!(!transport.status().connected);
    assert!(relay.registration("alice.1234").is_none());

    transport.shutdown();
    relay.stop();
}
