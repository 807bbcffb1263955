// Binary message codec for client-relay communication.
//
// Every message is a fixed little-endian header (`message_version: u32`,
// `message_type: u32`) followed by a type-specific payload. Variable-length
// messages carry a trailing name preceded by a `u8` length, so names are
// capped at 255 bytes. The layout is deliberately flat: both the relay and
// the client validate each received buffer against exact expected sizes
// and treat any mismatch as a protocol violation.
//
// `decode` distinguishes unknown message types (`ProtocolError::UnknownType`)
// from malformed ones. Unknown types are not fatal: receivers log and skip
// them so newer peers can add message types without breaking older relays.
// Every other error maps to the fixed disconnect reason returned by
// `ProtocolError::reason`.
//
// See also: `framing.rs` for how encoded messages are delimited on a byte
// stream, `types.rs` for the combat event layout.

use crate::types::{COMBAT_EVENT_SIZE, CombatEvent, InstanceId};

/// Version written into every header. Receivers reject anything else.
pub const MESSAGE_VERSION: u32 = 1;

/// Encoded header size.
pub const HEADER_SIZE: usize = 8;

/// Fixed payload sizes, excluding any trailing name.
pub const REGISTER_SELF_SIZE: usize = 3;
pub const SET_SELF_ID_SIZE: usize = 2;
pub const ADD_PEER_SIZE: usize = 3;
pub const REMOVE_PEER_SIZE: usize = 2;
pub const COMBAT_EVENT_MESSAGE_SIZE: usize = COMBAT_EVENT_SIZE + 2;
pub const CLOSE_SIZE: usize = 1;

/// Longest name a message can carry.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Wire discriminant of each message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageType {
    RegisterSelf = 1,
    SetSelfId = 2,
    AddPeer = 3,
    RemovePeer = 4,
    CombatEvent = 5,
    Close = 6,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::RegisterSelf,
        MessageType::SetSelfId,
        MessageType::AddPeer,
        MessageType::RemovePeer,
        MessageType::CombatEvent,
        MessageType::Close,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageType::RegisterSelf => "RegisterSelf",
            MessageType::SetSelfId => "SetSelfId",
            MessageType::AddPeer => "AddPeer",
            MessageType::RemovePeer => "RemovePeer",
            MessageType::CombatEvent => "CombatEvent",
            MessageType::Close => "Close",
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::RegisterSelf),
            2 => Ok(MessageType::SetSelfId),
            3 => Ok(MessageType::AddPeer),
            4 => Ok(MessageType::RemovePeer),
            5 => Ok(MessageType::CombatEvent),
            6 => Ok(MessageType::Close),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// A decoded protocol message. Both directions share one vocabulary:
/// clients send everything but `Close`, the relay sends `CombatEvent` and
/// `Close`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Bind this connection to an account name.
    RegisterSelf {
        instance_id: InstanceId,
        account_name: String,
    },
    /// The local player's instance id changed.
    SetSelfId { instance_id: InstanceId },
    /// Start forwarding combat events to `account_name` while its instance id
    /// matches `peer_instance_id`.
    AddPeer {
        peer_instance_id: InstanceId,
        account_name: String,
    },
    /// Stop forwarding to the peer recorded with `peer_instance_id`.
    RemovePeer { peer_instance_id: InstanceId },
    /// A combat event. `sender_instance_id` is zero from clients; the relay
    /// fills in the sender's registered instance id when forwarding.
    CombatEvent {
        event: CombatEvent,
        sender_instance_id: InstanceId,
    },
    /// Terminal close from the relay, carrying the disconnect reason.
    Close { reason: String },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RegisterSelf { .. } => MessageType::RegisterSelf,
            Message::SetSelfId { .. } => MessageType::SetSelfId,
            Message::AddPeer { .. } => MessageType::AddPeer,
            Message::RemovePeer { .. } => MessageType::RemovePeer,
            Message::CombatEvent { .. } => MessageType::CombatEvent,
            Message::Close { .. } => MessageType::Close,
        }
    }

    /// Encode into a standalone buffer (header + payload).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(HEADER_SIZE + COMBAT_EVENT_MESSAGE_SIZE);
        out.extend_from_slice(&MESSAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.message_type() as u32).to_le_bytes());

        match self {
            Message::RegisterSelf {
                instance_id,
                account_name,
            } => {
                out.extend_from_slice(&instance_id.0.to_le_bytes());
                push_name(&mut out, account_name)?;
            }
            Message::SetSelfId { instance_id } => {
                out.extend_from_slice(&instance_id.0.to_le_bytes());
            }
            Message::AddPeer {
                peer_instance_id,
                account_name,
            } => {
                out.extend_from_slice(&peer_instance_id.0.to_le_bytes());
                push_name(&mut out, account_name)?;
            }
            Message::RemovePeer { peer_instance_id } => {
                out.extend_from_slice(&peer_instance_id.0.to_le_bytes());
            }
            Message::CombatEvent {
                event,
                sender_instance_id,
            } => {
                out.extend_from_slice(&event.encode());
                out.extend_from_slice(&sender_instance_id.0.to_le_bytes());
            }
            Message::Close { reason } => {
                // Reasons are relay-generated; clip rather than fail.
                let mut end = reason.len().min(MAX_NAME_LEN);
                while !reason.is_char_boundary(end) {
                    end -= 1;
                }
                push_name(&mut out, &reason[..end])?;
            }
        }
        Ok(out)
    }

    /// Decode one complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader);
        }
        let version = read_u32(&buf[0..4]);
        if version != MESSAGE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let message_type = MessageType::try_from(read_u32(&buf[4..8]))?;
        let body = &buf[HEADER_SIZE..];

        match message_type {
            MessageType::RegisterSelf => {
                let (instance_id, account_name) =
                    decode_named(body, REGISTER_SELF_SIZE, message_type)?;
                Ok(Message::RegisterSelf {
                    instance_id,
                    account_name,
                })
            }
            MessageType::SetSelfId => {
                expect_size(body, SET_SELF_ID_SIZE, message_type)?;
                Ok(Message::SetSelfId {
                    instance_id: InstanceId(read_u16(body)),
                })
            }
            MessageType::AddPeer => {
                let (peer_instance_id, account_name) =
                    decode_named(body, ADD_PEER_SIZE, message_type)?;
                Ok(Message::AddPeer {
                    peer_instance_id,
                    account_name,
                })
            }
            MessageType::RemovePeer => {
                expect_size(body, REMOVE_PEER_SIZE, message_type)?;
                Ok(Message::RemovePeer {
                    peer_instance_id: InstanceId(read_u16(body)),
                })
            }
            MessageType::CombatEvent => {
                expect_size(body, COMBAT_EVENT_MESSAGE_SIZE, message_type)?;
                let mut raw = [0u8; COMBAT_EVENT_SIZE];
                raw.copy_from_slice(&body[..COMBAT_EVENT_SIZE]);
                Ok(Message::CombatEvent {
                    event: CombatEvent::decode(&raw),
                    sender_instance_id: InstanceId(read_u16(&body[COMBAT_EVENT_SIZE..])),
                })
            }
            MessageType::Close => {
                if body.len() < CLOSE_SIZE {
                    return Err(ProtocolError::ShortPayload(message_type));
                }
                let len = usize::from(body[0]);
                if body.len() - CLOSE_SIZE != len {
                    return Err(ProtocolError::NameLengthMismatch(message_type));
                }
                let reason = String::from_utf8_lossy(&body[CLOSE_SIZE..]).into_owned();
                Ok(Message::Close { reason })
            }
        }
    }
}

/// Why a received buffer was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message shorter than its header")]
    ShortHeader,
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("{} payload shorter than its fixed part", .0.name())]
    ShortPayload(MessageType),
    #[error("{} name length does not match payload", .0.name())]
    NameLengthMismatch(MessageType),
    #[error("{} payload has the wrong size", .0.name())]
    SizeMismatch(MessageType),
    #[error("{} name is not valid UTF-8", .0.name())]
    InvalidName(MessageType),
    #[error("name of {0} bytes exceeds the 255-byte limit")]
    NameTooLong(usize),
}

impl ProtocolError {
    /// Short reason sent to a peer that is being disconnected for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::ShortHeader => "short message header",
            ProtocolError::UnsupportedVersion(_) => "incorrect version",
            ProtocolError::UnknownType(_) => "unknown message type",
            ProtocolError::ShortPayload(MessageType::RegisterSelf) => "short RegisterSelf content",
            ProtocolError::ShortPayload(MessageType::AddPeer) => "short AddPeer content",
            ProtocolError::ShortPayload(_) => "short message content",
            ProtocolError::NameLengthMismatch(MessageType::RegisterSelf) => {
                "mismatched RegisterSelf length"
            }
            ProtocolError::NameLengthMismatch(MessageType::AddPeer) => "mismatched AddPeer length",
            ProtocolError::NameLengthMismatch(_) => "mismatched message length",
            ProtocolError::SizeMismatch(MessageType::SetSelfId) => "SetSelfId size mismatch",
            ProtocolError::SizeMismatch(MessageType::RemovePeer) => "RemovePeer size mismatch",
            ProtocolError::SizeMismatch(MessageType::CombatEvent) => "CombatEvent size mismatch",
            ProtocolError::SizeMismatch(_) => "message size mismatch",
            ProtocolError::InvalidName(_) => "invalid account name",
            ProtocolError::NameTooLong(_) => "name too long",
        }
    }

    /// Whether the receiver should disconnect the sender. Unknown message
    /// types are skipped instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::UnknownType(_))
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) -> Result<(), ProtocolError> {
    let len = u8::try_from(name.len()).map_err(|_| ProtocolError::NameTooLong(name.len()))?;
    out.push(len);
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

fn decode_named(
    body: &[u8],
    fixed: usize,
    message_type: MessageType,
) -> Result<(InstanceId, String), ProtocolError> {
    if body.len() < fixed {
        return Err(ProtocolError::ShortPayload(message_type));
    }
    let name_len = usize::from(body[fixed - 1]);
    if body.len() - fixed != name_len {
        return Err(ProtocolError::NameLengthMismatch(message_type));
    }
    let name = std::str::from_utf8(&body[fixed..])
        .map_err(|_| ProtocolError::InvalidName(message_type))?;
    Ok((InstanceId(read_u16(body)), name.to_owned()))
}

fn expect_size(body: &[u8], size: usize, message_type: MessageType) -> Result<(), ProtocolError> {
    if body.len() == size {
        Ok(())
    } else {
        Err(ProtocolError::SizeMismatch(message_type))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}
