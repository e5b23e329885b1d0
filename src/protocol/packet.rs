//! Bit-exact packet layouts (spec.md §6) and the big-endian reader/writer
//! helpers used to parse/emit them.
//!
//! Per the design notes in spec.md §9, we never reinterpret incoming bytes
//! as a record directly; every packet is parsed into an owned typed value
//! via a small BE cursor, and re-emitted through a symmetric writer. This
//! mirrors how `valence_protocol::decode`/`encode` build owned packets from
//! a `bytes::Buf` cursor rather than transmuting raw memory.

use anyhow::{bail, ensure, Context, Result};
use bytes::{Buf, BufMut, BytesMut};

use super::command::cmd;

/// A read-only big-endian cursor over a packet body.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self) -> Result<u8> {
        ensure!(!self.buf.is_empty(), "unexpected end of packet");
        let v = self.buf[0];
        self.buf = &self.buf[1..];
        Ok(v)
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16> {
        ensure!(self.buf.len() >= 2, "unexpected end of packet");
        let v = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        self.buf = &self.buf[2..];
        Ok(v)
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32> {
        ensure!(self.buf.len() >= 4, "unexpected end of packet");
        let v = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.buf = &self.buf[4..];
        Ok(v)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(self.buf.len() >= n, "unexpected end of packet");
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n)?;
        Ok(())
    }

    /// Reads a fixed-width NUL-padded ASCII field and trims at the first
    /// NUL, the way `CredentialsFragment` fields are compared (spec.md
    /// §3).
    pub fn fixed_str(&mut self, width: usize) -> Result<String> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let r = self.buf;
        self.buf = &[];
        r
    }
}

/// A big-endian packet writer backed by `bytes::BytesMut`, matching the
/// teacher's `PacketEncoder` idiom of an append-only buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_i8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_slice(b);
        self
    }

    pub fn zero(&mut self, n: usize) -> &mut Self {
        self.buf.put_bytes(0, n);
        self
    }

    /// Writes a fixed-width NUL-padded ASCII field, truncating `s` if it
    /// doesn't fit.
    pub fn fixed_str(&mut self, s: &str, width: usize) -> &mut Self {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        self.buf.put_slice(&bytes[..n]);
        self.buf.put_bytes(0, width - n);
        self
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

/// Two 30-byte NUL-padded ASCII fields; equality is byte-wise over both
/// (spec.md §3, used as an attach key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn decode(r: &mut Reader) -> Result<Self> {
        let username = r.fixed_str(30)?;
        let password = r.fixed_str(30)?;
        Ok(Self { username, password })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.fixed_str(&self.username, 30);
        w.fixed_str(&self.password, 30);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: i16,
    pub direction: u8,
}

/// 0x02 Walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub direction: u8,
    pub seq: u8,
    pub key: u32,
}

impl Walk {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            direction: r.u8()?,
            seq: r.u8()?,
            key: r.u32()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::WALK)
            .u8(self.direction)
            .u8(self.seq)
            .u32(self.key);
        w.finish()
    }
}

/// 0x21 WalkCancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkCancel {
    pub seq: u8,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub z: i8,
}

impl WalkCancel {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            seq: r.u8()?,
            x: r.u16()?,
            y: r.u16()?,
            direction: r.u8()?,
            z: r.i8()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::WALK_CANCEL)
            .u8(self.seq)
            .u16(self.x)
            .u16(self.y)
            .u8(self.direction)
            .i8(self.z);
        w.finish()
    }
}

/// 0x22 WalkAck / Resynchronize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkAck {
    pub seq: u8,
    pub notoriety: u8,
}

impl WalkAck {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            seq: r.u8()?,
            notoriety: r.u8()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::WALK_ACK).u8(self.seq).u8(self.notoriety);
        w.finish()
    }
}

/// 0x73 Ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u8,
}

impl Ping {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self { id: r.u8()? })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::PING).u8(self.id);
        w.finish()
    }
}

/// 0xEF Seed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed {
    pub seed: u32,
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub patch: u32,
}

impl Seed {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            seed: r.u32()?,
            major: r.u32()?,
            minor: r.u32()?,
            revision: r.u32()?,
            patch: r.u32()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::SEED)
            .u32(self.seed)
            .u32(self.major)
            .u32(self.minor)
            .u32(self.revision)
            .u32(self.patch);
        w.finish()
    }
}

/// 0x80 AccountLogin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLogin {
    pub credentials: Credentials,
}

impl AccountLogin {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 62, "AccountLogin must be 62 bytes");
        let mut r = Reader::new(&body[1..]);
        let credentials = Credentials::decode(&mut r)?;
        Ok(Self { credentials })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::ACCOUNT_LOGIN);
        self.credentials.encode(&mut w);
        w.zero(1);
        w.finish()
    }
}

/// 0x82 AccountLoginReject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLoginReject {
    pub reason: u8,
}

impl AccountLoginReject {
    pub const BLOCKED: u8 = 0x02;

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::ACCOUNT_LOGIN_REJECT).u8(self.reason);
        w.finish()
    }
}

/// 0x8C Relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relay {
    pub ip: u32,
    pub port: u16,
    pub auth_id: u32,
}

impl Relay {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            ip: r.u32()?,
            port: r.u16()?,
            auth_id: r.u32()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::RELAY).u32(self.ip).u16(self.port).u32(self.auth_id);
        w.finish()
    }
}

/// 0x91 GameLogin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameLogin {
    pub auth_id: u32,
    pub credentials: Credentials,
}

impl GameLogin {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 65, "GameLogin must be 65 bytes");
        let mut r = Reader::new(&body[1..]);
        let auth_id = r.u32()?;
        let credentials = Credentials::decode(&mut r)?;
        Ok(Self {
            auth_id,
            credentials,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::GAME_LOGIN).u32(self.auth_id);
        self.credentials.encode(&mut w);
        w.finish()
    }
}

/// 0xA0 PlayServer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayServer {
    pub index: u16,
}

impl PlayServer {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self { index: r.u16()? })
    }
}

/// One entry of `0xA8 ServerList`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub index: u16,
    pub name: String,
    pub full: u8,
    pub timezone: u8,
    pub address: u32,
}

/// 0xA8 ServerList
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerList {
    pub servers: Vec<ServerInfo>,
}

impl ServerList {
    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        let length = 1 + 2 + 1 + 2 + self.servers.len() * 40;
        w.u8(cmd::SERVER_LIST)
            .u16(length as u16)
            .u8(0x5D)
            .u16(self.servers.len() as u16);
        for s in &self.servers {
            w.u16(s.index);
            w.fixed_str(&s.name, 32);
            w.u8(s.full).u8(s.timezone).u32(s.address);
        }
        w.finish()
    }
}

/// 0x5D PlayCharacter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayCharacter {
    pub slot: u32,
}

impl PlayCharacter {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 73, "PlayCharacter must be 73 bytes");
        let mut r = Reader::new(&body[1..]);
        r.skip(4)?; // unknown0
        r.skip(30)?; // name
        r.skip(2)?; // unknown1
        r.skip(4)?; // flags
        r.skip(24)?; // unknown2
        let slot = r.u32()?;
        Ok(Self { slot })
    }
}

/// One character slot in `0xA9 CharList`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterInfo {
    pub name: String,
}

/// 0xA9 CharList
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CharList {
    pub characters: Vec<CharacterInfo>,
    pub city_count: u8,
    pub flags: u32,
}

impl CharList {
    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        let length = 1 + 2 + 1 + self.characters.len() * 60 + 1 + 4;
        w.u8(cmd::CHAR_LIST)
            .u16(length as u16)
            .u8(self.characters.len() as u8);
        for c in &self.characters {
            w.fixed_str(&c.name, 30);
            w.zero(30);
        }
        w.u8(self.city_count).u32(self.flags);
        w.finish()
    }
}

/// 0x1B Start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    pub serial: u32,
    pub body: u16,
    pub x: u16,
    pub y: u16,
    pub z: i16,
    pub direction: u8,
    pub map_width: u16,
    pub map_height: u16,
}

impl Start {
    pub fn decode(body_bytes: &[u8]) -> Result<Self> {
        ensure!(body_bytes.len() == 37, "Start must be 37 bytes");
        let mut r = Reader::new(&body_bytes[1..]);
        let serial = r.u32()?;
        r.skip(4)?; // unknown0
        let body = r.u16()?;
        let x = r.u16()?;
        let y = r.u16()?;
        let z = r.i16()?;
        let direction = r.u8()?;
        r.skip(1)?; // unknown1
        r.skip(4)?; // unknown2
        r.skip(2)?; // unknown3
        r.skip(2)?; // unknown4
        let map_width = r.u16()?;
        let map_height = r.u16()?;
        r.skip(6)?; // unknown5
        Ok(Self {
            serial,
            body,
            x,
            y,
            z,
            direction,
            map_width,
            map_height,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::START)
            .u32(self.serial)
            .zero(4)
            .u16(self.body)
            .u16(self.x)
            .u16(self.y)
            .i16(self.z)
            .u8(self.direction)
            .zero(1)
            .zero(4)
            .zero(2)
            .zero(2)
            .u16(self.map_width)
            .u16(self.map_height)
            .zero(6);
        w.finish()
    }
}

/// 0x1D Delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delete {
    pub serial: u32,
}

impl Delete {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self { serial: r.u32()? })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::DELETE).u32(self.serial);
        w.finish()
    }
}

/// 0x1A WorldItem (v5, variable layout). High bits of `serial`/`x`/`y` gate
/// optional fields (spec.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldItem {
    pub serial: u32,
    pub item_id: u16,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub z: i8,
    pub hue: u16,
    pub flags: u8,
}

const SERIAL_HAS_AMOUNT: u32 = 0x8000_0000;
const XY_HAS_DIRECTION: u16 = 0x8000;
const XY_HAS_HUE: u16 = 0x8000;

impl WorldItem {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() >= 3, "WorldItem too short");
        let mut r = Reader::new(&body[3..]); // skip cmd + 2-byte length
        let serial_raw = r.u32()?;
        let has_amount = serial_raw & SERIAL_HAS_AMOUNT != 0;
        let serial = serial_raw & !SERIAL_HAS_AMOUNT;
        let item_id = r.u16()?;
        let amount = if has_amount { r.u16()? } else { 0 };
        let x_raw = r.u16()?;
        let has_direction = x_raw & XY_HAS_DIRECTION != 0;
        let x = x_raw & !XY_HAS_DIRECTION;
        let y_raw = r.u16()?;
        let has_hue = y_raw & XY_HAS_HUE != 0;
        let y = y_raw & !(XY_HAS_HUE | 0x4000);
        let flags_present = y_raw & 0x4000 != 0;
        let direction = if has_direction { r.u8()? } else { 0 };
        let z = r.i8()?;
        let hue = if has_hue { r.u16()? } else { 0 };
        let flags = if flags_present { r.u8()? } else { 0 };
        Ok(Self {
            serial,
            item_id,
            amount,
            x,
            y,
            direction,
            z,
            hue,
            flags,
        })
    }

    /// Re-downgrades a [`WorldItem7`] to this variable v5 layout, setting
    /// the high-bit flags only for fields that differ from their default.
    pub fn from_v7(p: &WorldItem7) -> Self {
        Self {
            serial: p.serial,
            item_id: p.item_id,
            amount: p.amount,
            x: p.x,
            y: p.y,
            direction: p.direction,
            z: p.z,
            hue: p.hue,
            flags: p.flags,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let has_amount = self.amount != 0;
        let has_direction = self.direction != 0;
        let has_hue = self.hue != 0;
        let has_flags = self.flags != 0;

        let mut w = Writer::new();
        let mut length = 1 + 2 + 4 + 2 + 2 + 2 + 1 + 1;
        if has_amount {
            length += 2;
        }
        if has_direction {
            length += 1;
        }
        if has_hue {
            length += 2;
        }
        if has_flags {
            length += 1;
        }

        let serial = if has_amount {
            self.serial | SERIAL_HAS_AMOUNT
        } else {
            self.serial
        };
        let x = if has_direction {
            self.x | XY_HAS_DIRECTION
        } else {
            self.x
        };
        let y = (self.y & 0x3FFF)
            | if has_hue { XY_HAS_HUE } else { 0 }
            | if has_flags { 0x4000 } else { 0 };

        w.u8(cmd::WORLD_ITEM).u16(length as u16).u32(serial).u16(self.item_id);
        if has_amount {
            w.u16(self.amount);
        }
        w.u16(x).u16(y);
        if has_direction {
            w.u8(self.direction);
        }
        w.i8(self.z);
        if has_hue {
            w.u16(self.hue);
        }
        if has_flags {
            w.u8(self.flags);
        }
        w.finish()
    }
}

/// 0xF3 WorldItem7 (fixed 26-byte layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldItem7 {
    pub serial: u32,
    pub item_id: u16,
    pub direction: u8,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub hue: u16,
    pub flags: u8,
}

impl WorldItem7 {
    pub fn decode(body: &[u8]) -> Result<Self> {
        ensure!(body.len() == 26, "WorldItem7 must be 26 bytes");
        let mut r = Reader::new(&body[1..]);
        r.u16()?; // "one"
        r.u8()?; // type
        let serial = r.u32()?;
        let item_id = r.u16()?;
        let direction = r.u8()?;
        let amount = r.u16()?;
        r.u16()?; // amount2
        let x = r.u16()?;
        let y = r.u16()?;
        let z = r.i8()?;
        r.u8()?; // light_level
        let hue = r.u16()?;
        let flags = r.u8()?;
        r.u8()?; // zero
        r.u8()?; // function
        Ok(Self {
            serial,
            item_id,
            direction,
            amount,
            x,
            y,
            z,
            hue,
            flags,
        })
    }

    pub fn from_v5(p: &WorldItem) -> Self {
        Self {
            serial: p.serial,
            item_id: p.item_id,
            direction: p.direction,
            amount: p.amount,
            x: p.x,
            y: p.y,
            z: p.z,
            hue: p.hue,
            flags: p.flags,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::WORLD_ITEM_7)
            .u16(1)
            .u8(0)
            .u32(self.serial)
            .u16(self.item_id)
            .u8(self.direction)
            .u16(self.amount)
            .u16(0)
            .u16(self.x)
            .u16(self.y)
            .i8(self.z)
            .u8(0)
            .u16(self.hue)
            .u8(self.flags)
            .u8(0)
            .u8(0);
        w.finish()
    }
}

/// 0x2E Equip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equip {
    pub serial: u32,
    pub item_id: u16,
    pub layer: u8,
    pub parent_serial: u32,
    pub hue: u16,
}

impl Equip {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        let serial = r.u32()?;
        let item_id = r.u16()?;
        r.skip(1)?; // unknown0
        let layer = r.u8()?;
        let parent_serial = r.u32()?;
        let hue = r.u16()?;
        Ok(Self {
            serial,
            item_id,
            layer,
            parent_serial,
            hue,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::EQUIP)
            .u32(self.serial)
            .u16(self.item_id)
            .zero(1)
            .u8(self.layer)
            .u32(self.parent_serial)
            .u16(self.hue);
        w.finish()
    }
}

/// 0x24 ContainerOpen (v5 and v7; v7 appends two trailing bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOpen {
    pub serial: u32,
    pub gump_id: u16,
}

impl ContainerOpen {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            serial: r.u32()?,
            gump_id: r.u16()?,
        })
    }

    pub fn encode(&self, protocol_v7: bool) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::CONTAINER_OPEN).u32(self.serial).u16(self.gump_id);
        if protocol_v7 {
            w.zero(1).u8(0x7D);
        }
        w.finish()
    }
}

/// One child-item fragment of `0x25 ContainerUpdate` / `0x3C ContainerContent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerItem {
    pub serial: u32,
    pub item_id: u16,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub parent_serial: u32,
    pub hue: u16,
}

impl ContainerItem {
    fn decode(r: &mut Reader, has_v6_unknown: bool) -> Result<Self> {
        let serial = r.u32()?;
        let item_id = r.u16()?;
        r.skip(1)?; // unknown0
        let amount = r.u16()?;
        let x = r.u16()?;
        let y = r.u16()?;
        if has_v6_unknown {
            r.skip(1)?;
        }
        let parent_serial = r.u32()?;
        let hue = r.u16()?;
        Ok(Self {
            serial,
            item_id,
            amount,
            x,
            y,
            parent_serial,
            hue,
        })
    }

    fn encode(&self, w: &mut Writer, v6_layout: bool) {
        w.u32(self.serial)
            .u16(self.item_id)
            .zero(1)
            .u16(self.amount)
            .u16(self.x)
            .u16(self.y);
        if v6_layout {
            w.zero(1);
        }
        w.u32(self.parent_serial).u16(self.hue);
    }
}

/// 0x25 ContainerUpdate (v5 and v6 layouts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub item: ContainerItem,
}

impl ContainerUpdate {
    pub fn decode(body: &[u8], v6_layout: bool) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            item: ContainerItem::decode(&mut r, v6_layout)?,
        })
    }

    pub fn encode(&self, v6_layout: bool) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::CONTAINER_UPDATE);
        self.item.encode(&mut w, v6_layout);
        w.finish()
    }
}

/// 0x3C ContainerContent (v5 and v6 layouts)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerContent {
    pub items: Vec<ContainerItem>,
}

impl ContainerContent {
    pub fn decode(body: &[u8], v6_layout: bool) -> Result<Self> {
        let mut r = Reader::new(&body[3..]);
        let num = r.u16()? as usize;
        let mut items = Vec::with_capacity(num);
        for _ in 0..num {
            items.push(ContainerItem::decode(&mut r, v6_layout)?);
        }
        Ok(Self { items })
    }

    pub fn encode(&self, v6_layout: bool) -> BytesMut {
        let mut w = Writer::new();
        let item_size = if v6_layout { 20 } else { 19 };
        let length = 1 + 2 + 2 + self.items.len() * item_size;
        w.u8(cmd::CONTAINER_CONTENT).u16(length as u16).u16(self.items.len() as u16);
        for item in &self.items {
            item.encode(&mut w, v6_layout);
        }
        w.finish()
    }
}

/// One inline equipment fragment of `0x78 MobileIncoming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MobileItem {
    pub serial: u32,
    pub item_id: u16,
    pub layer: u8,
    pub hue: Option<u16>,
}

const ITEM_ID_HAS_HUE: u16 = 0x8000;

/// 0x78 MobileIncoming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobileIncoming {
    pub serial: u32,
    pub body: u16,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub direction: u8,
    pub hue: u16,
    pub flags: u8,
    pub notoriety: u8,
    pub items: Vec<MobileItem>,
}

impl MobileIncoming {
    pub fn decode(body_bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body_bytes[3..]);
        let serial = r.u32()?;
        let body = r.u16()?;
        let x = r.u16()?;
        let y = r.u16()?;
        let z = r.i8()?;
        let direction = r.u8()?;
        let hue = r.u16()?;
        let flags = r.u8()?;
        let notoriety = r.u8()?;

        let mut items = Vec::new();
        loop {
            if r.remaining() < 4 {
                break;
            }
            let serial = r.u32()?;
            if serial == 0 {
                break;
            }
            let item_id_raw = r.u16()?;
            let has_hue = item_id_raw & ITEM_ID_HAS_HUE != 0;
            let item_id = item_id_raw & !ITEM_ID_HAS_HUE;
            let layer = r.u8()?;
            let hue = if has_hue { Some(r.u16()?) } else { None };
            items.push(MobileItem {
                serial,
                item_id,
                layer,
                hue,
            });
        }

        Ok(Self {
            serial,
            body,
            x,
            y,
            z,
            direction,
            hue,
            flags,
            notoriety,
            items,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        let mut length = 1 + 2 + 4 + 2 + 2 + 2 + 1 + 1 + 2 + 1 + 1;
        for item in &self.items {
            length += if item.hue.is_some() { 9 } else { 7 };
        }
        length += 4; // trailing zero serial terminator

        w.u8(cmd::MOBILE_INCOMING)
            .u16(length as u16)
            .u32(self.serial)
            .u16(self.body)
            .u16(self.x)
            .u16(self.y)
            .i8(self.z)
            .u8(self.direction)
            .u16(self.hue)
            .u8(self.flags)
            .u8(self.notoriety);

        for item in &self.items {
            w.u32(item.serial);
            let item_id = if item.hue.is_some() {
                item.item_id | ITEM_ID_HAS_HUE
            } else {
                item.item_id
            };
            w.u16(item_id).u8(item.layer);
            if let Some(hue) = item.hue {
                w.u16(hue);
            }
        }
        w.u32(0);
        w.finish()
    }
}

/// 0x11 MobileStatus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobileStatus {
    pub serial: u32,
    pub name: String,
    pub hits: u16,
    pub hits_max: u16,
    pub flags: u8,
    pub raw: Vec<u8>,
}

impl MobileStatus {
    pub fn decode(body_bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body_bytes[3..]);
        let serial = r.u32()?;
        let name = r.fixed_str(30)?;
        let hits = r.u16()?;
        let hits_max = r.u16()?;
        r.u8()?; // rename
        let flags = r.u8()?;
        Ok(Self {
            serial,
            name,
            hits,
            hits_max,
            flags,
            raw: body_bytes.to_vec(),
        })
    }
}

/// 0x20 MobileUpdate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MobileUpdate {
    pub serial: u32,
    pub body: u16,
    pub hue: u16,
    pub flags: u8,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub z: i8,
}

impl MobileUpdate {
    pub fn decode(body_bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body_bytes[1..]);
        let serial = r.u32()?;
        let body = r.u16()?;
        r.skip(1)?; // unknown0
        let hue = r.u16()?;
        let flags = r.u8()?;
        let x = r.u16()?;
        let y = r.u16()?;
        r.skip(2)?; // unknown1
        let direction = r.u8()?;
        let z = r.i8()?;
        Ok(Self {
            serial,
            body,
            hue,
            flags,
            x,
            y,
            direction,
            z,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut w = Writer::new();
        w.u8(cmd::MOBILE_UPDATE)
            .u32(self.serial)
            .u16(self.body)
            .zero(1)
            .u16(self.hue)
            .u8(self.flags)
            .u16(self.x)
            .u16(self.y)
            .zero(2)
            .u8(self.direction)
            .i8(self.z);
        w.finish()
    }
}

/// 0x76 ZoneChange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneChange {
    pub x: u16,
    pub y: u16,
    pub z: i16,
}

impl ZoneChange {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(&body[1..]);
        Ok(Self {
            x: r.u16()?,
            y: r.u16()?,
            z: r.i16()?,
        })
    }
}

/// Ambient ("mirror") ingredients stashed verbatim for replay (spec.md
/// §4.E). We keep the original bytes rather than re-decoding every field,
/// since these are replayed byte-for-byte to newly attached endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket(pub BytesMut);

impl RawPacket {
    pub fn from_bytes(b: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(b.len());
        buf.extend_from_slice(b);
        Self(buf)
    }
}

/// 0x8C-adjacent synthetic console-speech packet (spec.md §4.D
/// `speak_console`).
pub fn speak_console(text: &str) -> BytesMut {
    let mut w = Writer::new();
    let length = 1 + 2 + 4 + 2 + 1 + 2 + 2 + 30 + text.len() + 1;
    w.u8(cmd::SPEAK_ASCII)
        .u16(length as u16)
        .u32(0xFFFF_FFFF)
        .i16(-1)
        .u8(0)
        .u16(0x35)
        .u16(3)
        .fixed_str("uoproxy", 30)
        .bytes(text.as_bytes())
        .u8(0);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_round_trip() {
        let w = Walk {
            direction: 2,
            seq: 5,
            key: 0x1234,
        };
        let bytes = w.encode();
        let decoded = Walk::decode(&bytes).unwrap();
        assert_eq!(w, decoded);
    }

    #[test]
    fn world_item_7_round_trip() {
        let p = WorldItem7 {
            serial: 0x4000_0001,
            item_id: 0x0eed,
            direction: 0,
            amount: 0,
            x: 101,
            y: 100,
            z: 0,
            hue: 0,
            flags: 0,
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), 26);
        let decoded = WorldItem7::decode(&bytes).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn world_item_v5_to_7_and_back_is_identity_on_shared_fields() {
        let p7 = WorldItem7 {
            serial: 0x4000_0002,
            item_id: 0x0eed,
            direction: 3,
            amount: 5,
            x: 200,
            y: 300,
            z: -2,
            hue: 17,
            flags: 1,
        };
        let v5 = WorldItem::from_v7(&p7);
        let back = WorldItem7::from_v5(&v5);
        assert_eq!(p7, back);
    }

    #[test]
    fn container_update_5_to_6_round_trip_zero_restores_unknown() {
        let item = ContainerItem {
            serial: 1,
            item_id: 2,
            amount: 3,
            x: 4,
            y: 5,
            parent_serial: 6,
            hue: 7,
        };
        let v5 = ContainerUpdate { item }.encode(false);
        let decoded_v5 = ContainerUpdate::decode(&v5, false).unwrap();
        let v6 = decoded_v5.encode(true);
        let decoded_v6 = ContainerUpdate::decode(&v6, true).unwrap();
        assert_eq!(decoded_v5.item, decoded_v6.item);
    }

    #[test]
    fn account_login_round_trip() {
        let p = AccountLogin {
            credentials: Credentials {
                username: "alice".into(),
                password: "pw".into(),
            },
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), 62);
        let decoded = AccountLogin::decode(&bytes).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn mobile_incoming_inline_equipment_round_trip() {
        let p = MobileIncoming {
            serial: 1,
            body: 0x190,
            x: 100,
            y: 100,
            z: 0,
            direction: 0,
            hue: 0,
            flags: 0,
            notoriety: 1,
            items: vec![
                MobileItem {
                    serial: 2,
                    item_id: 10,
                    layer: 1,
                    hue: None,
                },
                MobileItem {
                    serial: 3,
                    item_id: 11,
                    layer: 2,
                    hue: Some(55),
                },
            ],
        };
        let bytes = p.encode();
        let decoded = MobileIncoming::decode(&bytes).unwrap();
        assert_eq!(p, decoded);
    }
}
