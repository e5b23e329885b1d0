//! Upstream client: the proxy's own connection to the real login/game
//! server (spec.md §4.C).

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::version::ClientBuild;
use crate::protocol::ProtocolVersion;
use crate::session::SessionEvent;

use super::framed::{FramedReader, FramedWriter};

/// Proxy-side connection to the authoritative server. Outbound traffic is
/// always plaintext; inbound traffic is Huffman-decompressed from the
/// first byte onward.
pub struct UpstreamClient {
    writer: FramedWriter,
    pub protocol: ProtocolVersion,
    ping_id: u8,
}

impl UpstreamClient {
    /// Connects, sends the seed prelude, and spawns the background reader
    /// task that forwards decoded packets to the owning session.
    pub async fn connect(
        addr: SocketAddr,
        protocol: ProtocolVersion,
        seed: u32,
        build: ClientBuild,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to upstream {addr}"))?;
        Self::connect_with_stream(stream, protocol, seed, build, events).await
    }

    /// Completes the seed handshake over an already-connected stream, used
    /// when the connection was established via a SOCKS4 proxy rather than
    /// dialed directly.
    pub async fn connect_with_stream(
        stream: TcpStream,
        protocol: ProtocolVersion,
        seed: u32,
        build: ClientBuild,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();

        let mut reader = FramedReader::new(read_half);
        reader.enable_decompression();

        let mut writer = FramedWriter::new(write_half);
        writer.queue(&seed_prelude(protocol, seed, build))?;
        writer.flush().await?;

        tokio::spawn(async move {
            loop {
                match reader.fill().await {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = events.send(SessionEvent::UpstreamClosed);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "upstream read error");
                        let _ = events.send(SessionEvent::UpstreamClosed);
                        return;
                    }
                }

                loop {
                    match reader.take_packet(protocol) {
                        Ok(Some(packet)) => {
                            if events.send(SessionEvent::FromUpstream { packet }).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "malformed upstream packet");
                            let _ = events.send(SessionEvent::UpstreamClosed);
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self {
            writer,
            protocol,
            ping_id: 0,
        })
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.queue(bytes)?;
        self.writer.flush().await
    }

    /// Sends the periodic keepalive (spec.md §4.C, §5); there is no
    /// timeout waiting for the ack, the idle-read timeout covers it.
    pub async fn send_ping(&mut self) -> Result<()> {
        self.ping_id = self.ping_id.wrapping_add(1);
        let pkt = crate::protocol::packet::Ping { id: self.ping_id }.encode();
        self.send(&pkt).await
    }
}

/// Builds the first bytes the real server ever sees on this connection: a
/// bare 32-bit seed for older clients, or the structured `0xEF Seed`
/// packet for 6.0.14+ (spec.md §4.C point 1).
fn seed_prelude(protocol: ProtocolVersion, seed: u32, build: ClientBuild) -> BytesMut {
    if protocol.needs_seed_packet() {
        crate::protocol::packet::Seed {
            seed,
            major: build.major,
            minor: build.minor,
            revision: build.revision,
            patch: build.patch,
        }
        .encode()
    } else {
        let mut w = crate::protocol::packet::Writer::new();
        w.u32(seed);
        w.finish()
    }
}
