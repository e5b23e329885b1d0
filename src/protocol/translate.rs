//! Cross-version packet translation (spec.md §4.A "Round-trip laws").
//!
//! uoproxy sits between a client speaking one protocol variant and a
//! server speaking another; these functions upgrade/downgrade the handful
//! of opcodes whose wire layout changed between variants, filling in the
//! fields the narrower layout doesn't carry with neutral defaults so a
//! downgrade-then-upgrade round trip is lossless on every field the
//! narrower side *can* represent.

use anyhow::{ensure, Result};
use bytes::BytesMut;

use super::command::cmd;
use super::packet::{
    ContainerContent, ContainerItem, ContainerOpen, ContainerUpdate, Reader, Writer, WorldItem,
    WorldItem7,
};

/// 0x08 Drop (pre-6.0.1.7): no container grid slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drop {
    pub serial: u32,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub container_serial: u32,
}

impl Drop {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 14, "Drop must be 14 bytes");
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            serial: r.u32()?,
            x: r.u16()?,
            y: r.u16()?,
            z: r.i8()?,
            container_serial: r.u32()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::DROP)
            .u32(self.serial)
            .u16(self.x)
            .u16(self.y)
            .i8(self.z)
            .u32(self.container_serial);
        w.finish()
    }
}

/// 0x08 Drop6 (6.0.1.7+): carries an extra grid-slot byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drop6 {
    pub serial: u32,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub container_serial: u32,
    pub grid_slot: u8,
}

impl Drop6 {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 15, "Drop6 must be 15 bytes");
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            serial: r.u32()?,
            x: r.u16()?,
            y: r.u16()?,
            z: r.i8()?,
            container_serial: r.u32()?,
            grid_slot: r.u8()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::DROP)
            .u32(self.serial)
            .u16(self.x)
            .u16(self.y)
            .i8(self.z)
            .u32(self.container_serial)
            .u8(self.grid_slot);
        w.finish()
    }
}

/// Upgrades a pre-6.0.1.7 Drop into the 6.0.1.7+ layout, defaulting the
/// grid slot field a v5 client never sends to 0 (spec.md §4.A).
pub fn drop_to_v6(p: &Drop) -> Drop6 {
    Drop6 {
        serial: p.serial,
        x: p.x,
        y: p.y,
        z: p.z,
        container_serial: p.container_serial,
        grid_slot: 0,
    }
}

/// Downgrades a 6.0.1.7+ Drop6 into the pre-6.0.1.7 layout, dropping the
/// grid slot a v5 server can't accept.
pub fn drop_from_v6(p: &Drop6) -> Drop {
    Drop {
        serial: p.serial,
        x: p.x,
        y: p.y,
        z: p.z,
        container_serial: p.container_serial,
    }
}

/// 0xB9 SupportedFeatures, pre-6.0.14 (2-byte flag field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedFeatures {
    pub flags: u16,
}

impl SupportedFeatures {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 3, "SupportedFeatures must be 3 bytes");
        let mut r = Reader::new(&body[1..]);
        Ok(Self { flags: r.u16()? })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::SUPPORTED_FEATURES).u16(self.flags);
        w.finish()
    }
}

/// 0xB9 SupportedFeatures, 6.0.14+ (4-byte flag field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedFeatures6014 {
    pub flags: u32,
}

impl SupportedFeatures6014 {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 5, "SupportedFeatures6014 must be 5 bytes");
        let mut r = Reader::new(&body[1..]);
        Ok(Self { flags: r.u32()? })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::SUPPORTED_FEATURES).u32(self.flags);
        w.finish()
    }
}

/// Widens the 16-bit flag field into 32 bits; the high word is unused by
/// pre-6.0.14 clients so is zeroed.
pub fn supported_features_to_6014(p: &SupportedFeatures) -> SupportedFeatures6014 {
    SupportedFeatures6014 {
        flags: p.flags as u32,
    }
}

/// Narrows the 32-bit flag field back to 16 bits, truncating any high-word
/// feature bits a pre-6.0.14 client couldn't represent anyway.
pub fn supported_features_from_6014(p: &SupportedFeatures6014) -> SupportedFeatures {
    SupportedFeatures {
        flags: (p.flags & 0xFFFF) as u16,
    }
}

/// Upgrades a variable-length v5 [`WorldItem`] into the fixed-length
/// [`WorldItem7`] layout.
pub fn world_item_to_v7(p: &WorldItem) -> WorldItem7 {
    WorldItem7::from_v5(p)
}

/// Downgrades a [`WorldItem7`] into the variable-length v5 layout, setting
/// high-bit presence flags only for fields that differ from their v5
/// defaults.
pub fn world_item_from_v7(p: &WorldItem7) -> WorldItem {
    WorldItem::from_v7(p)
}

/// Upgrades a pre-6.0.1.7 [`ContainerUpdate`] to the 6.0.1.7+ layout
/// (adds one reserved byte, always zero).
pub fn container_update_to_v6(p: &ContainerUpdate) -> ContainerUpdate {
    *p
}

/// Downgrades a 6.0.1.7+ [`ContainerUpdate`] back to the pre-6.0.1.7
/// layout, dropping the reserved byte.
pub fn container_update_from_v6(p: &ContainerUpdate) -> ContainerUpdate {
    *p
}

/// Upgrades a pre-6.0.1.7 [`ContainerContent`] to the 6.0.1.7+ layout.
pub fn container_content_to_v6(p: &ContainerContent) -> ContainerContent {
    p.clone()
}

/// Downgrades a 6.0.1.7+ [`ContainerContent`] back to the pre-6.0.1.7
/// layout.
pub fn container_content_from_v6(p: &ContainerContent) -> ContainerContent {
    p.clone()
}

/// Upgrades a pre-7.0 [`ContainerOpen`] to the 7.0+ layout by appending the
/// trailing gump-type byte 7.0 clients expect.
pub fn container_open_to_v7(p: &ContainerOpen) -> BytesMut {
    p.encode(true)
}

/// Downgrades a 7.0 [`ContainerOpen`] wire frame to the pre-7.0 layout by
/// re-encoding without the trailing bytes.
pub fn container_open_from_v7(p: &ContainerOpen) -> BytesMut {
    p.encode(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{ContainerItem, ContainerUpdate};

    #[test]
    fn drop_v5_to_v6_and_back_is_identity() {
        let p = Drop {
            serial: 0x1001,
            x: 10,
            y: 20,
            z: 0,
            container_serial: 0x2002,
        };
        let up = drop_to_v6(&p);
        let back = drop_from_v6(&up);
        assert_eq!(p, back);
    }

    #[test]
    fn drop_v5_round_trip_bytes() {
        let p = Drop {
            serial: 0x1001,
            x: 10,
            y: 20,
            z: -1,
            container_serial: 0x2002,
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), 14);
        assert_eq!(Drop::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn drop6_round_trip_bytes() {
        let p = Drop6 {
            serial: 0x1001,
            x: 10,
            y: 20,
            z: -1,
            container_serial: 0x2002,
            grid_slot: 5,
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), 15);
        assert_eq!(Drop6::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn supported_features_widen_then_narrow_preserves_low_word() {
        let p = SupportedFeatures { flags: 0xBEEF };
        let wide = supported_features_to_6014(&p);
        let back = supported_features_from_6014(&wide);
        assert_eq!(p, back);
    }

    #[test]
    fn world_item_v5_variable_round_trip_through_v7() {
        let p5 = WorldItem {
            serial: 0x4000_0010,
            item_id: 0x0EED,
            amount: 0,
            x: 55,
            y: 66,
            direction: 0,
            z: 0,
            hue: 0,
            flags: 0,
        };
        let p7 = world_item_to_v7(&p5);
        let back = world_item_from_v7(&p7);
        assert_eq!(p5, back);
    }

    #[test]
    fn container_content_v5_to_v6_round_trip() {
        let content = ContainerContent {
            items: vec![ContainerItem {
                serial: 1,
                item_id: 2,
                amount: 3,
                x: 4,
                y: 5,
                parent_serial: 6,
                hue: 7,
            }],
        };
        let v6 = container_content_to_v6(&content);
        let back = container_content_from_v6(&v6);
        assert_eq!(content, back);
    }

    #[test]
    fn container_open_v7_carries_trailing_gump_type_byte() {
        let p = ContainerOpen {
            serial: 0x1234,
            gump_id: 0x3C,
        };
        let v5_bytes = container_open_from_v7(&p);
        let v7_bytes = container_open_to_v7(&p);
        assert_eq!(v5_bytes.len(), 7);
        assert_eq!(v7_bytes.len(), 9);
    }

    #[test]
    fn container_update_translation_is_noop_on_typed_fields() {
        let p = ContainerUpdate {
            item: ContainerItem {
                serial: 9,
                item_id: 8,
                amount: 7,
                x: 6,
                y: 5,
                parent_serial: 4,
                hue: 3,
            },
        };
        assert_eq!(container_update_to_v6(&p).item, p.item);
        assert_eq!(container_update_from_v6(&p).item, p.item);
    }
}
