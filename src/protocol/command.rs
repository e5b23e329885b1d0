//! Opcode table and length resolution (spec.md §4.A).
//!
//! Mirrors the shape of `valence_protocol::decode::PacketDecoder::try_next_packet`:
//! a pure function decides whether enough bytes are buffered to know a
//! packet's length, without touching any I/O.

use super::version::ProtocolVersion;

/// Single-byte opcode, the packet's first byte.
pub type Command = u8;

pub mod cmd {
    use super::Command;

    pub const CREATE_CHARACTER: Command = 0x00;
    pub const WALK: Command = 0x02;
    pub const TALK_ASCII: Command = 0x03;
    pub const USE_: Command = 0x06;
    pub const LIFT_REQUEST: Command = 0x07;
    pub const DROP: Command = 0x08;
    pub const MOBILE_STATUS: Command = 0x11;
    pub const ACTION: Command = 0x12;
    pub const WORLD_ITEM: Command = 0x1A;
    pub const START: Command = 0x1B;
    pub const SPEAK_ASCII: Command = 0x1C;
    pub const DELETE: Command = 0x1D;
    pub const MOBILE_UPDATE: Command = 0x20;
    pub const WALK_CANCEL: Command = 0x21;
    pub const WALK_ACK: Command = 0x22;
    pub const RESYNCHRONIZE: Command = 0x22;
    pub const CONTAINER_OPEN: Command = 0x24;
    pub const CONTAINER_UPDATE: Command = 0x25;
    pub const LIFT_REJECT: Command = 0x27;
    pub const EQUIP: Command = 0x2E;
    pub const CONTAINER_CONTENT: Command = 0x3C;
    pub const PERSONAL_LIGHT_LEVEL: Command = 0x4E;
    pub const GLOBAL_LIGHT_LEVEL: Command = 0x4F;
    pub const POPUP_MESSAGE: Command = 0x53;
    pub const LOGIN_COMPLETE: Command = 0x55;
    pub const PLAY_CHARACTER: Command = 0x5D;
    pub const TARGET: Command = 0x6C;
    pub const WAR_MODE: Command = 0x72;
    pub const PING: Command = 0x73;
    pub const ZONE_CHANGE: Command = 0x76;
    pub const MOBILE_MOVING: Command = 0x77;
    pub const MOBILE_INCOMING: Command = 0x78;
    pub const ACCOUNT_LOGIN: Command = 0x80;
    pub const ACCOUNT_LOGIN_REJECT: Command = 0x82;
    pub const RELAY: Command = 0x8C;
    pub const GAME_LOGIN: Command = 0x91;
    pub const WALK_FORCE: Command = 0x97;
    pub const PLAY_SERVER: Command = 0xA0;
    pub const SERVER_LIST: Command = 0xA8;
    pub const CHAR_LIST: Command = 0xA9;
    pub const TALK_UNICODE: Command = 0xAD;
    pub const GUMP_RESPONSE: Command = 0xB1;
    pub const SEASON: Command = 0xBC;
    pub const SUPPORTED_FEATURES: Command = 0xB9;
    pub const CLIENT_VERSION: Command = 0xBD;
    pub const EXTENDED: Command = 0xBF;
    pub const HARDWARE: Command = 0xD9;
    pub const SPY: Command = 0xA4;
    pub const SEED: Command = 0xEF;
    pub const PROTOCOL_EXTENSION: Command = 0xF0;
    pub const WORLD_ITEM_7: Command = 0xF3;

    pub const EXT_CLOSE_GUMP: u16 = 0x0004;
    pub const EXT_MAP_CHANGE: u16 = 0x0008;
    pub const EXT_MAP_PATCHES: u16 = 0x0018;
}

/// Result of attempting to determine a buffered packet's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// The opcode is not assigned; the stream is corrupt.
    Invalid,
    /// Not enough bytes are buffered to determine the length; need at least
    /// this many total bytes before asking again.
    Need(usize),
    /// The full packet is `n` bytes including the opcode.
    Have(usize),
}

fn fixed_length(command: Command, protocol: ProtocolVersion) -> Option<usize> {
    use cmd::*;
    Some(match command {
        CREATE_CHARACTER => 0x68,
        WALK => 7,
        USE_ => 5,
        LIFT_REQUEST => 7,
        DROP => {
            if protocol >= ProtocolVersion::V6 {
                15
            } else {
                14
            }
        }
        START => 37,
        DELETE => 5,
        MOBILE_UPDATE => 19,
        WALK_CANCEL => 8,
        WALK_ACK => 3,
        CONTAINER_OPEN => {
            if protocol >= ProtocolVersion::V7 {
                9
            } else {
                7
            }
        }
        CONTAINER_UPDATE => {
            if protocol >= ProtocolVersion::V6 {
                21
            } else {
                20
            }
        }
        LIFT_REJECT => 2,
        EQUIP => 15,
        PERSONAL_LIGHT_LEVEL => 6,
        GLOBAL_LIGHT_LEVEL => 2,
        POPUP_MESSAGE => 2,
        LOGIN_COMPLETE => 1,
        PLAY_CHARACTER => 73,
        TARGET => 19,
        WAR_MODE => 5,
        PING => 2,
        ZONE_CHANGE => 16,
        MOBILE_MOVING => 17,
        ACCOUNT_LOGIN => 62,
        ACCOUNT_LOGIN_REJECT => 2,
        RELAY => 11,
        GAME_LOGIN => 65,
        WALK_FORCE => 2,
        PLAY_SERVER => 3,
        SUPPORTED_FEATURES => {
            if protocol >= ProtocolVersion::V6_0_14 {
                5
            } else {
                3
            }
        }
        SEASON => 3,
        HARDWARE => 268,
        SEED => 21,
        WORLD_ITEM_7 => 26,
        _ => return None,
    })
}

/// Opcodes that carry their own big-endian 16-bit length at offset 1.
fn is_variable_length(command: Command) -> bool {
    use cmd::*;
    matches!(
        command,
        TALK_ASCII
            | MOBILE_STATUS
            | ACTION
            | WORLD_ITEM
            | SPEAK_ASCII
            | CONTAINER_CONTENT
            | MOBILE_INCOMING
            | SERVER_LIST
            | CHAR_LIST
            | TALK_UNICODE
            | GUMP_RESPONSE
            | CLIENT_VERSION
            | EXTENDED
            | PROTOCOL_EXTENSION
            | SPY
    )
}

/// Determines the length of the packet at the front of `src`, or whether
/// more bytes are needed to decide (spec.md §4.A).
pub fn packet_length(src: &[u8], protocol: ProtocolVersion) -> PacketLength {
    if src.is_empty() {
        return PacketLength::Need(1);
    }

    let command = src[0];

    if let Some(len) = fixed_length(command, protocol) {
        return PacketLength::Have(len);
    }

    if is_variable_length(command) {
        if src.len() < 3 {
            return PacketLength::Need(3);
        }
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if len == 0 {
            // Zero-length variable packet: malformed, must not infinite-loop
            // (spec.md §8 boundary behavior).
            return PacketLength::Invalid;
        }
        return PacketLength::Have(len);
    }

    PacketLength::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_opcode_resolves_without_more_bytes() {
        let buf = [cmd::PING];
        assert_eq!(
            packet_length(&buf, ProtocolVersion::V7),
            PacketLength::Have(2)
        );
    }

    #[test]
    fn variable_opcode_needs_three_bytes() {
        let buf = [cmd::CLIENT_VERSION];
        assert_eq!(
            packet_length(&buf, ProtocolVersion::V7),
            PacketLength::Need(3)
        );
    }

    #[test]
    fn variable_opcode_zero_length_is_invalid() {
        let buf = [cmd::CLIENT_VERSION, 0x00, 0x00];
        assert_eq!(
            packet_length(&buf, ProtocolVersion::V7),
            PacketLength::Invalid
        );
    }

    #[test]
    fn unknown_opcode_is_invalid() {
        let buf = [0xFF];
        assert_eq!(
            packet_length(&buf, ProtocolVersion::V7),
            PacketLength::Invalid
        );
    }

    #[test]
    fn drop_length_differs_by_protocol() {
        assert_eq!(
            fixed_length(cmd::DROP, ProtocolVersion::V5),
            Some(14)
        );
        assert_eq!(
            fixed_length(cmd::DROP, ProtocolVersion::V6),
            Some(15)
        );
    }
}
