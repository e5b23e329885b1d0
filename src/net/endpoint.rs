//! Downstream server endpoint: the socket a real client connects to,
//! believing it is talking to the genuine login/game server (spec.md
//! §4.D, "LinkedServer").

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::cipher::{account_login_valid, LoginCipher};
use crate::protocol::command::cmd;
use crate::protocol::packet::{Reader, Writer};
use crate::protocol::version::{protocol_version_from_build, ClientBuild};
use crate::protocol::ProtocolVersion;
use crate::session::SessionEvent;

use super::framed::{FramedReader, FramedWriter};

pub type EndpointId = u64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

fn next_endpoint_id() -> EndpointId {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A client-facing socket plus its parse/encrypt/compress state. Multiple
/// endpoints can be attached to the same [`crate::session::Connection`]
/// (spec.md §1 "multi-head").
pub struct LinkedServer {
    pub id: EndpointId,
    writer: FramedWriter,
    pub protocol: ProtocolVersion,
    pub seed: u32,
    pub build: ClientBuild,
    /// Set once this endpoint is told to redirect to itself (spec.md §4.G
    /// "Razor workaround"); matched against a reconnecting client's
    /// `GameLogin.auth_id` while this endpoint lingers as a zombie.
    pub auth_id: Option<u32>,
}

/// Outcome of the handshake performed in [`LinkedServer::accept`]: the
/// decoded first application packet, already de-ciphered if needed, plus
/// the still-unspawned reader half. The caller picks the session this
/// endpoint belongs to (new or an existing attach target) before handing
/// the reader to [`LinkedServer::spawn_reader`], so no packet is ever
/// routed to the wrong session's channel.
pub struct Handshake {
    pub endpoint: LinkedServer,
    pub reader: FramedReader,
    pub first_packet: BytesMut,
}

impl LinkedServer {
    /// Performs the seed handshake and login-cipher auto-detection
    /// (spec.md §4.D). Does not yet spawn the steady-state reader task —
    /// call [`LinkedServer::spawn_reader`] once the owning session is known.
    pub async fn accept(stream: TcpStream) -> Result<Handshake> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedReader::new(read_half);
        let writer = FramedWriter::new(write_half);
        let id = next_endpoint_id();

        // Seed prelude: either a raw 4-byte seed, or a 21-byte 0xEF Seed
        // packet for clients that declare their build up front.
        let (seed, build) = read_seed_prelude(&mut reader).await?;
        let protocol = if build != ClientBuild::default() {
            protocol_version_from_build(build)
        } else {
            ProtocolVersion::V5
        };

        let (first_packet, cipher) = read_first_login_record(&mut reader, seed).await?;
        if let Some(cipher) = cipher {
            reader.set_cipher(cipher);
        }

        Ok(Handshake {
            endpoint: LinkedServer {
                id,
                writer,
                protocol,
                seed,
                build,
                auth_id: None,
            },
            reader,
            first_packet,
        })
    }

    /// Spawns the steady-state reader task that forwards every decoded
    /// packet from this endpoint to `events`. Kept separate from
    /// [`LinkedServer::accept`] so the listener can resolve the owning
    /// session (new or attach) before any packet is routed anywhere.
    pub fn spawn_reader(
        mut reader: FramedReader,
        id: EndpointId,
        protocol: ProtocolVersion,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        tokio::spawn(async move {
            loop {
                loop {
                    match reader.take_packet(protocol) {
                        Ok(Some(packet)) => {
                            if events
                                .send(SessionEvent::FromClient { endpoint: id, packet })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(endpoint = id, error = %e, "malformed client packet");
                            let _ = events.send(SessionEvent::ClientClosed { endpoint: id });
                            return;
                        }
                    }
                }

                match reader.fill().await {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = events.send(SessionEvent::ClientClosed { endpoint: id });
                        return;
                    }
                    Err(e) => {
                        warn!(endpoint = id, error = %e, "client read error");
                        let _ = events.send(SessionEvent::ClientClosed { endpoint: id });
                        return;
                    }
                }
            }
        });
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.queue(bytes)?;
        self.writer.flush().await
    }

    /// Enables outbound Huffman compression after the first relayed
    /// `GameLogin` (spec.md §4.D).
    pub fn enable_outbound_compression(&mut self) {
        self.writer.enable_compression();
    }

    pub fn outbound_compression_enabled(&self) -> bool {
        self.writer.compression_enabled()
    }

    /// Builds and sends a console speech line as if spoken by "uoproxy"
    /// (spec.md §4.D `speak_console`).
    pub async fn speak_console(&mut self, text: &str) -> Result<()> {
        let pkt = crate::protocol::packet::speak_console(text);
        self.send(&pkt).await
    }
}

async fn read_seed_prelude(reader: &mut FramedReader) -> Result<(u32, ClientBuild)> {
    // Looking at the first raw byte: 0xEF indicates a structured Seed
    // packet (21 bytes); anything else means a bare 32-bit seed.
    while reader.buffered() < 4 {
        if !reader.fill().await? {
            bail!("endpoint closed during seed handshake");
        }
    }

    // We need to know whether byte 0 is 0xEF without destructively
    // consuming a wrong-sized chunk. `drain_raw(1)` lets us peek the tag
    // byte and, if it's not a Seed packet, treat that single byte as the
    // first byte of the raw 4-byte seed.
    let tag = reader.drain_raw(1).expect("4 bytes buffered");
    if tag[0] == cmd::SEED {
        while reader.buffered() < 20 {
            if !reader.fill().await? {
                bail!("endpoint closed during seed packet");
            }
        }
        let rest = reader.drain_raw(20).expect("20 bytes buffered");
        let mut r = Reader::new(&rest);
        let seed = r.u32()?;
        let build = ClientBuild {
            major: r.u32()?,
            minor: r.u32()?,
            revision: r.u32()?,
            patch: r.u32()?,
        };
        Ok((seed, build))
    } else {
        while reader.buffered() < 3 {
            if !reader.fill().await? {
                bail!("endpoint closed during seed handshake");
            }
        }
        let rest = reader.drain_raw(3).expect("3 bytes buffered");
        let mut w = Writer::new();
        w.bytes(&tag).bytes(&rest);
        let full = w.finish();
        let mut r = Reader::new(&full);
        let seed = r.u32()?;
        Ok((seed, ClientBuild::default()))
    }
}

/// Buffers the first post-seed record and determines whether it's
/// login-cipher-encrypted (spec.md §4.D).
async fn read_first_login_record(
    reader: &mut FramedReader,
    seed: u32,
) -> Result<(BytesMut, Option<LoginCipher>)> {
    const ACCOUNT_LOGIN_LEN: usize = 62;
    const GAME_LOGIN_LEN: usize = 65;

    while reader.buffered() < 1 {
        if !reader.fill().await? {
            bail!("endpoint closed awaiting login record");
        }
    }
    let op = reader.drain_raw(1).expect("1 byte buffered");

    if op[0] == cmd::GAME_LOGIN {
        while reader.buffered() < GAME_LOGIN_LEN - 1 {
            if !reader.fill().await? {
                bail!("endpoint closed mid GameLogin");
            }
        }
        let rest = reader.drain_raw(GAME_LOGIN_LEN - 1).expect("buffered");
        let mut w = Writer::new();
        w.bytes(&op).bytes(&rest);
        return Ok((w.finish(), None));
    }

    while reader.buffered() < ACCOUNT_LOGIN_LEN - 1 {
        if !reader.fill().await? {
            bail!("endpoint closed mid AccountLogin");
        }
    }
    let rest = reader.drain_raw(ACCOUNT_LOGIN_LEN - 1).expect("buffered");
    let mut w = Writer::new();
    w.bytes(&op).bytes(&rest);
    let raw = w.finish();

    if account_login_valid(&raw) {
        return Ok((raw, None));
    }

    match LoginCipher::detect(seed, &raw) {
        Some(mut cipher) => {
            let mut plain = raw.clone();
            cipher.decrypt(&mut plain);
            Ok((plain, Some(cipher)))
        }
        None => Ok((raw, None)),
    }
}
