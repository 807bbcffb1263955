// Combat telemetry types shared by the relay, its clients, and the addon.
//
// `CombatEvent` mirrors the host's fixed 64-byte combat record. It travels
// over the wire verbatim (see `message.rs`), so `encode`/`decode` pin the
// little-endian field layout explicitly instead of relying on a
// `#[repr(C)]` transmute. `Agent` and `HostEvent` are the host-side shapes
// the addon receives; they never go over the wire.
//
// `EventKind::classify` reproduces the host's damage/healing split, which
// the client transport uses to decide what to forward in budget mode.

use serde::{Deserialize, Serialize};

/// Per-encounter instance id of an actor. Small, reused between encounters,
/// and changed whenever a player's character re-enters the world.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InstanceId(pub u16);

/// Size of an encoded `CombatEvent` on the wire.
pub const COMBAT_EVENT_SIZE: usize = 64;

/// `CombatEvent::result` values the classifier cares about.
pub mod result {
    pub const NORMAL: u8 = 0;
    pub const CRIT: u8 = 1;
    pub const GLANCE: u8 = 2;
    pub const ACTIVATION: u8 = 11;
}

/// `CombatEvent::is_statechange` values the classifier cares about.
pub mod state_change {
    pub const NONE: u8 = 0;
    pub const ENTER_COMBAT: u8 = 1;
    pub const EXIT_COMBAT: u8 = 2;
}

/// One combat record as produced by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatEvent {
    pub time: u64,
    pub src_agent: u64,
    pub dst_agent: u64,
    pub value: i32,
    pub buff_dmg: i32,
    pub overstack_value: u32,
    pub skill_id: u32,
    pub src_instid: u16,
    pub dst_instid: u16,
    pub src_master_instid: u16,
    pub dst_master_instid: u16,
    pub iff: u8,
    pub buff: u8,
    pub result: u8,
    pub is_activation: u8,
    pub is_buffremove: u8,
    pub is_ninety: u8,
    pub is_fifty: u8,
    pub is_moving: u8,
    pub is_statechange: u8,
    pub is_flanking: u8,
    pub is_shields: u8,
    pub is_offcycle: u8,
    pub pad: [u8; 4],
}

impl CombatEvent {
    /// Encode into the host's 64-byte little-endian layout.
    pub fn encode(&self) -> [u8; COMBAT_EVENT_SIZE] {
        let mut out = [0u8; COMBAT_EVENT_SIZE];
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..16].copy_from_slice(&self.src_agent.to_le_bytes());
        out[16..24].copy_from_slice(&self.dst_agent.to_le_bytes());
        out[24..28].copy_from_slice(&self.value.to_le_bytes());
        out[28..32].copy_from_slice(&self.buff_dmg.to_le_bytes());
        out[32..36].copy_from_slice(&self.overstack_value.to_le_bytes());
        out[36..40].copy_from_slice(&self.skill_id.to_le_bytes());
        out[40..42].copy_from_slice(&self.src_instid.to_le_bytes());
        out[42..44].copy_from_slice(&self.dst_instid.to_le_bytes());
        out[44..46].copy_from_slice(&self.src_master_instid.to_le_bytes());
        out[46..48].copy_from_slice(&self.dst_master_instid.to_le_bytes());
        out[48] = self.iff;
        out[49] = self.buff;
        out[50] = self.result;
        out[51] = self.is_activation;
        out[52] = self.is_buffremove;
        out[53] = self.is_ninety;
        out[54] = self.is_fifty;
        out[55] = self.is_moving;
        out[56] = self.is_statechange;
        out[57] = self.is_flanking;
        out[58] = self.is_shields;
        out[59] = self.is_offcycle;
        out[60..64].copy_from_slice(&self.pad);
        out
    }

    /// Decode from the 64-byte layout produced by `encode`.
    pub fn decode(bytes: &[u8; COMBAT_EVENT_SIZE]) -> Self {
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let i32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            i32::from_le_bytes(buf)
        };
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);

        Self {
            time: u64_at(0),
            src_agent: u64_at(8),
            dst_agent: u64_at(16),
            value: i32_at(24),
            buff_dmg: i32_at(28),
            overstack_value: u32_at(32),
            skill_id: u32_at(36),
            src_instid: u16_at(40),
            dst_instid: u16_at(42),
            src_master_instid: u16_at(44),
            dst_master_instid: u16_at(46),
            iff: bytes[48],
            buff: bytes[49],
            result: bytes[50],
            is_activation: bytes[51],
            is_buffremove: bytes[52],
            is_ninety: bytes[53],
            is_fifty: bytes[54],
            is_moving: bytes[55],
            is_statechange: bytes[56],
            is_flanking: bytes[57],
            is_shields: bytes[58],
            is_offcycle: bytes[59],
            pad: [bytes[60], bytes[61], bytes[62], bytes[63]],
        }
    }
}

/// Coarse classification of a combat event from the perspective of the
/// process that observed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Damage,
    SemiDamaging,
    Healing,
    Other,
}

impl EventKind {
    /// Classify `event`. `is_local` selects the sign convention: local
    /// events report outgoing healing as positive values, area events as
    /// negative ones.
    pub fn classify(event: &CombatEvent, is_local: bool) -> Self {
        if event.is_statechange != state_change::NONE
            || event.is_activation != 0
            || event.is_buffremove != 0
        {
            return EventKind::Other;
        }

        let amount = if event.buff == 0 {
            match event.result {
                result::NORMAL | result::CRIT | result::GLANCE => {}
                result::ACTIVATION => return EventKind::Other,
                _ => return EventKind::SemiDamaging,
            }
            event.value
        } else {
            if event.buff_dmg == 0 {
                return EventKind::SemiDamaging;
            }
            event.buff_dmg
        };

        if (is_local && amount <= 0) || (!is_local && amount >= 0) {
            EventKind::Damage
        } else {
            EventKind::Healing
        }
    }
}

/// Host description of an actor, attached to combat callbacks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Character name, or the account name on agent notifications.
    pub name: Option<String>,
    /// Host agent id. Stable for the lifetime of the actor.
    pub id: u64,
    /// Profession; zero on agent-removal notifications.
    pub prof: u32,
    /// Elite specialization; nonzero on target-change notifications.
    pub elite: u32,
    /// Nonzero when the actor is the local player.
    pub is_self: u32,
    pub team: u16,
}

/// Argument bundle of one host combat callback.
///
/// `event == None` marks an agent notification (actor added to or removed
/// from the roster) rather than a combat record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    pub event: Option<CombatEvent>,
    pub source: Option<Agent>,
    pub destination: Option<Agent>,
    pub skill_name: Option<String>,
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CombatEvent {
        CombatEvent {
            time: 0x0102_0304_0506_0708,
            src_agent: 7,
            dst_agent: 9,
            value: -1234,
            buff_dmg: 55,
            overstack_value: 3,
            skill_id: 500,
            src_instid: 10,
            dst_instid: 20,
            src_master_instid: 0,
            dst_master_instid: 0,
            iff: 1,
            buff: 0,
            result: result::CRIT,
            is_statechange: 0,
            pad: [0xA, 0xB, 0xC, 0xD],
            ..CombatEvent::default()
        }
    }

    #[test]
    fn combat_event_layout_is_little_endian() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[36..40], &500u32.to_le_bytes());
        assert_eq!(&bytes[40..42], &[10, 0]);
        assert_eq!(bytes[50], result::CRIT);
        assert_eq!(&bytes[60..64], &[0xA, 0xB, 0xC, 0xD]);
        assert_eq!(CombatEvent::decode(&bytes), sample());
    }

    #[test]
    fn classify_direct_heal_and_damage() {
        let mut event = sample();
        event.value = 300;
        assert_eq!(EventKind::classify(&event, true), EventKind::Healing);
        assert_eq!(EventKind::classify(&event, false), EventKind::Damage);

        event.value = -300;
        assert_eq!(EventKind::classify(&event, true), EventKind::Damage);
        assert_eq!(EventKind::classify(&event, false), EventKind::Healing);
    }

    #[test]
    fn classify_buff_ticks() {
        let mut event = sample();
        event.buff = 1;
        event.buff_dmg = 0;
        assert_eq!(EventKind::classify(&event, true), EventKind::SemiDamaging);

        event.buff_dmg = 80;
        assert_eq!(EventKind::classify(&event, true), EventKind::Healing);
    }

    #[test]
    fn classify_non_combat_records() {
        let mut event = sample();
        event.is_statechange = state_change::ENTER_COMBAT;
        assert_eq!(EventKind::classify(&event, true), EventKind::Other);

        let mut event = sample();
        event.result = result::ACTIVATION;
        assert_eq!(EventKind::classify(&event, true), EventKind::Other);

        let mut event = sample();
        event.result = 5;
        assert_eq!(EventKind::classify(&event, true), EventKind::SemiDamaging);
    }

    #[test]
    fn host_event_serializes_for_diagnostics() {
        let host = HostEvent {
            event: Some(sample()),
            source: Some(Agent {
                name: Some("alice.1234".into()),
                id: 7,
                ..Agent::default()
            }),
            ..HostEvent::default()
        };
        let json = serde_json::to_string(&host).unwrap();
        let back: HostEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, host);
    }
}
