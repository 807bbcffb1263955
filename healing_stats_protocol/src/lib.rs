// healing_stats_protocol — wire protocol for the healing stats peer relay.
//
// This crate defines the combat telemetry types, the binary message codec,
// and the stream framing shared by the relay server (`healing_stats_relay`)
// and its clients. It has no networking of its own and no dependency on the
// addon crate.
//
// Module overview:
// - `types.rs`:    `InstanceId`, the 64-byte `CombatEvent` record, host-side
//                  `Agent`/`HostEvent`, and the `EventKind` classifier.
// - `message.rs`:  `Message` enum with its little-endian header + payload
//                  codec, and `ProtocolError` with per-error disconnect
//                  reasons.
// - `framing.rs`:  4-byte little-endian length prefix framing, blocking
//                  (`read_frame`/`write_frame`) and incremental
//                  (`FrameDecoder`).
//
// Design decisions:
// - **Fixed binary layout.** Combat events are high-volume and fixed-size;
//   the relay forwards them without re-encoding the event body.
// - **Exact-size validation.** Every message type has either an exact
//   payload size or a length-prefixed name whose length must account for
//   every trailing byte. Anything else is a protocol violation.
// - **No async runtime.** Framing works on `std::io::Read`/`Write`, shared by
//   plain TCP streams and rustls stream wrappers.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{FrameDecoder, MAX_FRAME_SIZE, frame, read_frame, write_frame};
pub use message::{MESSAGE_VERSION, Message, MessageType, ProtocolError};
pub use types::{Agent, COMBAT_EVENT_SIZE, CombatEvent, EventKind, HostEvent, InstanceId};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Encode, frame, read back, decode.
    fn roundtrip(msg: &Message) -> Message {
        let bytes = msg.encode().unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &bytes).unwrap();
        let recovered = read_frame(&mut Cursor::new(&wire)).unwrap();
        Message::decode(&recovered).unwrap()
    }

    #[test]
    fn client_session_messages_survive_framing() {
        let session = [
            Message::RegisterSelf {
                instance_id: InstanceId(10),
                account_name: "alice.1234".into(),
            },
            Message::AddPeer {
                peer_instance_id: InstanceId(20),
                account_name: "bob.5678".into(),
            },
            Message::CombatEvent {
                event: CombatEvent {
                    skill_id: 500,
                    value: 300,
                    ..CombatEvent::default()
                },
                sender_instance_id: InstanceId(0),
            },
            Message::SetSelfId {
                instance_id: InstanceId(11),
            },
            Message::RemovePeer {
                peer_instance_id: InstanceId(20),
            },
        ];
        for msg in &session {
            assert_eq!(&roundtrip(msg), msg);
        }
    }

    #[test]
    fn every_message_type_has_a_distinct_wire_id() {
        let mut ids: Vec<u32> = MessageType::ALL.iter().map(|t| *t as u32).collect();
        ids.dedup();
        assert_eq!(ids.len(), MessageType::ALL.len());
        for t in MessageType::ALL {
            assert_eq!(MessageType::try_from(t as u32).unwrap(), t);
        }
    }
}
