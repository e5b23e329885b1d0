//! Mirrored world model (spec.md §3, §4.E): the proxy's own copy of
//! everything a client would need to redraw its view, kept fresh from
//! server-origin packets and replayable to a newly attached endpoint.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::protocol::packet::{
    ContainerItem, ContainerOpen, ContainerUpdate, Equip, MobileIncoming, MobileStatus,
    MobileUpdate, Start, WorldItem7, ZoneChange,
};
use crate::protocol::translate::{
    container_open_from_v7, container_open_to_v7, world_item_from_v7,
};
use crate::protocol::ProtocolVersion;

/// Where an item currently sits (spec.md §3 `Item.placement`).
#[derive(Debug, Clone)]
pub enum Placement {
    Ground(WorldItem7),
    InContainer(ContainerItem),
    Equipped(Equip),
}

impl Placement {
    pub fn parent_serial(&self) -> u32 {
        match self {
            Placement::Ground(_) => 0,
            Placement::InContainer(c) => c.parent_serial,
            Placement::Equipped(e) => e.parent_serial,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Item {
    pub serial: u32,
    pub placement: Placement,
    pub container_open: Option<ContainerOpen>,
    pub attach_sequence: u64,
}

#[derive(Debug, Clone)]
pub struct Mobile {
    pub serial: u32,
    pub last_incoming: Option<MobileIncoming>,
    pub last_status: Option<MobileStatus>,
    pub update: Option<MobileUpdate>,
}

/// Cached authoritative player position, the reference walk cancellation
/// reports against (spec.md GLOSSARY "Anchor").
#[derive(Debug, Clone, Copy, Default)]
pub struct Anchor {
    pub serial: u32,
    pub body: u16,
    pub x: u16,
    pub y: u16,
    pub z: i16,
    pub direction: u8,
}

/// Ambient packets stashed verbatim for replay (spec.md §4.E).
#[derive(Debug, Clone, Default)]
pub struct Ambient {
    pub start: Option<BytesMut>,
    pub map_change: Option<BytesMut>,
    pub map_patches: Option<BytesMut>,
    pub season: Option<BytesMut>,
    pub supported_features: Option<BytesMut>,
    pub global_light_level: Option<BytesMut>,
    pub personal_light_level: Option<BytesMut>,
    pub war_mode: Option<BytesMut>,
    pub target: Option<BytesMut>,
}

#[derive(Debug, Clone, Default)]
pub struct World {
    pub player_anchor: Anchor,
    pub ambient: Ambient,
    pub mobiles: HashMap<u32, Mobile>,
    pub items: HashMap<u32, Item>,
    pub item_attach_sequence: u64,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_game(&self) -> bool {
        self.player_anchor.serial != 0
    }

    fn item_mut(&mut self, serial: u32) -> &mut Item {
        self.items.entry(serial).or_insert_with(|| Item {
            serial,
            placement: Placement::Ground(WorldItem7 {
                serial,
                item_id: 0,
                direction: 0,
                amount: 0,
                x: 0,
                y: 0,
                z: 0,
                hue: 0,
                flags: 0,
            }),
            container_open: None,
            attach_sequence: 0,
        })
    }

    fn mobile_mut(&mut self, serial: u32) -> &mut Mobile {
        self.mobiles.entry(serial).or_insert_with(|| Mobile {
            serial,
            last_incoming: None,
            last_status: None,
            update: None,
        })
    }

    /// `Start`: anchors the player and clears the session into `IN_GAME`
    /// (spec.md §4.E).
    pub fn on_start(&mut self, pkt: &Start, raw: &[u8]) {
        self.player_anchor = Anchor {
            serial: pkt.serial,
            body: pkt.body,
            x: pkt.x,
            y: pkt.y,
            z: pkt.z,
            direction: pkt.direction,
        };
        self.ambient.start = Some(BytesMut::from(raw));
    }

    pub fn on_world_item(&mut self, pkt: WorldItem7) {
        let item = self.item_mut(pkt.serial);
        item.placement = Placement::Ground(pkt);
    }

    pub fn on_equip(&mut self, pkt: Equip) {
        let item = self.item_mut(pkt.serial);
        item.placement = Placement::Equipped(pkt);
    }

    pub fn on_container_open(&mut self, serial: u32, pkt: ContainerOpen) {
        let item = self.item_mut(serial);
        item.container_open = Some(pkt);
    }

    pub fn on_container_update(&mut self, child: ContainerItem) {
        let serial = child.serial;
        let item = self.item_mut(serial);
        item.placement = Placement::InContainer(child);
    }

    /// `ContainerContent{,_6}`: replaces a container's full child list and
    /// sweeps children that are no longer present (spec.md §4.E).
    pub fn on_container_content(&mut self, children: &[ContainerItem]) {
        self.item_attach_sequence += 1;
        let sequence = self.item_attach_sequence;
        let parent = match children.first() {
            Some(first) => first.parent_serial,
            None => return,
        };

        for child in children {
            let item = self.item_mut(child.serial);
            item.placement = Placement::InContainer(*child);
            item.attach_sequence = sequence;
        }

        let stale: Vec<u32> = self
            .items
            .values()
            .filter(|i| i.placement.parent_serial() == parent && i.attach_sequence < sequence)
            .map(|i| i.serial)
            .collect();
        for serial in stale {
            self.delete_subtree(serial);
        }
    }

    /// `Delete`: removes a serial and, transitively, everything parented
    /// to it (spec.md §4.E).
    pub fn delete_subtree(&mut self, serial: u32) {
        self.mobiles.remove(&serial);
        self.items.remove(&serial);

        let children: Vec<u32> = self
            .items
            .values()
            .filter(|i| i.placement.parent_serial() == serial)
            .map(|i| i.serial)
            .collect();
        for child in children {
            self.delete_subtree(child);
        }
    }

    /// `MobileIncoming`: also applies its inline equipment list as
    /// synthetic `Equip`s (spec.md §4.E).
    pub fn on_mobile_incoming(&mut self, pkt: MobileIncoming) {
        let serial = pkt.serial;
        for item in &pkt.items {
            self.on_equip(Equip {
                serial: item.serial,
                item_id: item.item_id,
                layer: item.layer,
                parent_serial: serial,
                hue: item.hue.unwrap_or(0),
            });
        }
        self.mobile_mut(serial).last_incoming = Some(pkt);
    }

    /// `MobileStatus`: a status with strictly more fields (higher `flags`)
    /// supersedes an older, shorter one (spec.md §4.E).
    pub fn on_mobile_status(&mut self, pkt: MobileStatus) {
        let mobile = self.mobile_mut(pkt.serial);
        let keep_existing = mobile
            .last_status
            .as_ref()
            .is_some_and(|existing| existing.flags > pkt.flags);
        if !keep_existing {
            mobile.last_status = Some(pkt);
        }
    }

    /// `MobileUpdate` / `MobileMoving`: also patches the player anchor if
    /// this is the player's own mobile (spec.md §4.E).
    pub fn on_mobile_update(&mut self, pkt: MobileUpdate) {
        if pkt.serial == self.player_anchor.serial {
            self.player_anchor.x = pkt.x;
            self.player_anchor.y = pkt.y;
            self.player_anchor.z = pkt.z as i16;
            self.player_anchor.direction = pkt.direction;
        }
        self.mobile_mut(pkt.serial).update = Some(pkt);
    }

    /// `ZoneChange`: patches the player position directly (spec.md §4.E).
    pub fn on_zone_change(&mut self, pkt: ZoneChange) {
        self.player_anchor.x = pkt.x;
        self.player_anchor.y = pkt.y;
        self.player_anchor.z = pkt.z;
        if let Some(mobile) = self.mobiles.get_mut(&self.player_anchor.serial) {
            if let Some(update) = &mut mobile.update {
                update.x = pkt.x;
                update.y = pkt.y;
                update.z = pkt.z as i8;
            }
        }
    }

    /// Applied after a committed walk step (spec.md §4.F step 3).
    pub fn apply_walked(&mut self, x: u16, y: u16, direction: u8) {
        self.player_anchor.x = x;
        self.player_anchor.y = y;
        self.player_anchor.direction = direction;
        let serial = self.player_anchor.serial;
        if let Some(mobile) = self.mobiles.get_mut(&serial) {
            if let Some(update) = &mut mobile.update {
                update.x = x;
                update.y = y;
                update.direction = direction;
            }
        }
    }

    /// Builds the ordered replay stream for a newly attached endpoint
    /// (spec.md §4.E "Attach replay"). Each packet is downgraded to
    /// `protocol`'s layout as needed.
    pub fn replay_for(&self, protocol: ProtocolVersion) -> Vec<BytesMut> {
        let mut out = Vec::new();

        if let Some(start) = &self.ambient.start {
            out.push(start.clone());
        }
        if let Some(p) = &self.ambient.map_change {
            out.push(p.clone());
        }
        if let Some(p) = &self.ambient.map_patches {
            out.push(p.clone());
        }
        if let Some(p) = &self.ambient.season {
            out.push(p.clone());
        }
        if let Some(p) = &self.ambient.supported_features {
            out.push(p.clone());
        }
        if let Some(p) = &self.ambient.global_light_level {
            out.push(p.clone());
        }
        if let Some(p) = &self.ambient.personal_light_level {
            out.push(p.clone());
        }
        if let Some(mobile) = self.mobiles.get(&self.player_anchor.serial) {
            if let Some(update) = &mobile.update {
                out.push(update.encode());
            }
        }
        if let Some(p) = &self.ambient.war_mode {
            out.push(p.clone());
        }

        for mobile in self.mobiles.values() {
            if let Some(incoming) = &mobile.last_incoming {
                out.push(incoming.encode());
            }
            if let Some(status) = &mobile.last_status {
                out.push(BytesMut::from(status.raw.as_slice()));
            }
        }

        // Parent-before-child walk of the item tree, cycle-safe via a
        // visited set keyed by serial.
        let mut emitted = std::collections::HashSet::new();
        let roots: Vec<u32> = self
            .items
            .values()
            .filter(|i| i.placement.parent_serial() == 0)
            .map(|i| i.serial)
            .collect();
        for root in roots {
            self.replay_item_subtree(root, protocol, &mut emitted, &mut out);
        }

        out.push([0x55u8].as_slice().into());
        out
    }

    fn replay_item_subtree(
        &self,
        serial: u32,
        protocol: ProtocolVersion,
        emitted: &mut std::collections::HashSet<u32>,
        out: &mut Vec<BytesMut>,
    ) {
        if !emitted.insert(serial) {
            return;
        }
        let Some(item) = self.items.get(&serial) else {
            return;
        };

        match &item.placement {
            Placement::Ground(p) => {
                if protocol.is_v7() {
                    out.push(p.encode());
                } else {
                    out.push(world_item_from_v7(p).encode());
                }
            }
            Placement::InContainer(c) => {
                out.push(ContainerUpdate { item: *c }.encode(protocol.is_v6()));
            }
            Placement::Equipped(e) => out.push(e.encode()),
        }

        if let Some(open) = &item.container_open {
            if protocol.is_v7() {
                out.push(container_open_to_v7(open));
            } else {
                out.push(container_open_from_v7(open));
            }
        }

        let children: Vec<u32> = self
            .items
            .values()
            .filter(|i| i.placement.parent_serial() == serial)
            .map(|i| i.serial)
            .collect();
        for child in children {
            self.replay_item_subtree(child, protocol, emitted, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ground_item(serial: u32) -> WorldItem7 {
        WorldItem7 {
            serial,
            item_id: 0x0eed,
            direction: 0,
            amount: 0,
            x: 101,
            y: 100,
            z: 0,
            hue: 0,
            flags: 0,
        }
    }

    #[test]
    fn world_item_then_delete_removes_it() {
        let mut w = World::new();
        w.on_world_item(ground_item(0x4000_0001));
        assert!(w.items.contains_key(&0x4000_0001));
        w.delete_subtree(0x4000_0001);
        assert!(!w.items.contains_key(&0x4000_0001));
    }

    #[test]
    fn deleting_a_mobile_deep_deletes_equipped_items() {
        let mut w = World::new();
        w.on_equip(Equip {
            serial: 2,
            item_id: 10,
            layer: 1,
            parent_serial: 1,
            hue: 0,
        });
        assert_eq!(w.items.get(&2).unwrap().placement.parent_serial(), 1);
        w.delete_subtree(1);
        assert!(!w.items.contains_key(&2));
    }

    #[test]
    fn container_content_sweeps_stale_children() {
        let mut w = World::new();
        w.on_container_content(&[ContainerItem {
            serial: 100,
            item_id: 1,
            amount: 1,
            x: 0,
            y: 0,
            parent_serial: 1,
            hue: 0,
        }]);
        w.on_container_content(&[ContainerItem {
            serial: 101,
            item_id: 2,
            amount: 1,
            x: 0,
            y: 0,
            parent_serial: 1,
            hue: 0,
        }]);
        assert!(!w.items.contains_key(&100));
        assert!(w.items.contains_key(&101));
    }

    #[test]
    fn item_attach_sequence_is_monotonic() {
        let mut w = World::new();
        let before = w.item_attach_sequence;
        w.on_container_content(&[ContainerItem {
            serial: 1,
            item_id: 1,
            amount: 1,
            x: 0,
            y: 0,
            parent_serial: 9,
            hue: 0,
        }]);
        assert!(w.item_attach_sequence > before);
    }

    #[test]
    fn mobile_status_with_fewer_flags_does_not_overwrite() {
        let mut w = World::new();
        w.on_mobile_status(MobileStatus {
            serial: 1,
            name: "a".into(),
            hits: 10,
            hits_max: 10,
            flags: 5,
            raw: vec![],
        });
        w.on_mobile_status(MobileStatus {
            serial: 1,
            name: "a".into(),
            hits: 1,
            hits_max: 10,
            flags: 1,
            raw: vec![],
        });
        assert_eq!(w.mobiles[&1].last_status.as_ref().unwrap().flags, 5);
    }

    #[test]
    fn replay_includes_mobile_status_after_incoming() {
        let mut w = World::new();
        w.on_mobile_status(MobileStatus {
            serial: 1,
            name: "a".into(),
            hits: 10,
            hits_max: 10,
            flags: 0,
            raw: vec![0x11, 0x22, 0x33],
        });
        let replay = w.replay_for(ProtocolVersion::V7);
        assert!(replay.iter().any(|p| p.as_ref() == [0x11, 0x22, 0x33]));
    }
}
