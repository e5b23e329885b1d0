//! Framed byte-stream halves (spec.md §4.B), split the way
//! `tokio::net::TcpStream::into_split` separates read and write paths so a
//! session actor can own one lightweight sender per endpoint while a
//! dedicated task blocks on the socket read.
//!
//! Unlike `valence_protocol`'s `PacketEncoder`/`PacketDecoder` (which frame
//! on a VarInt length prefix with optional zlib compression), this stream
//! is framed by the per-opcode length table (`protocol::command`) and
//! optionally Huffman-compressed or XOR-enciphered — so the read/write
//! halves below apply that transform instead.

use std::time::Instant;

use anyhow::{bail, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::protocol::cipher::LoginCipher;
use crate::protocol::command::{packet_length, PacketLength};
use crate::protocol::huffman::{self, Decompressor};
use crate::protocol::ProtocolVersion;

const READ_CHUNK: usize = 4096;
const MAX_BUFFER: usize = 64 * 1024;

/// Read half of a framed socket: accumulates raw bytes, optionally
/// decompresses (Huffman) or decrypts (login cipher) them into a logical
/// byte stream, and slices complete packets out of that stream.
pub struct FramedReader {
    stream: OwnedReadHalf,
    decoded: BytesMut,
    decompressor: Option<Decompressor>,
    cipher: Option<LoginCipher>,
    pub last_read: Instant,
}

impl FramedReader {
    pub fn new(stream: OwnedReadHalf) -> Self {
        Self {
            stream,
            decoded: BytesMut::new(),
            decompressor: None,
            cipher: None,
            last_read: Instant::now(),
        }
    }

    /// Enables Huffman decompression of all bytes read from here on
    /// (upstream server→proxy direction, spec.md §4.C).
    pub fn enable_decompression(&mut self) {
        self.decompressor = Some(Decompressor::new());
    }

    /// Installs a login cipher; every byte read from here on is decrypted
    /// in place before being added to the logical stream (spec.md §4.D).
    pub fn set_cipher(&mut self, cipher: LoginCipher) {
        self.cipher = Some(cipher);
    }

    pub fn cipher_installed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Reads one chunk off the socket, applying any installed
    /// decryption/decompression. Returns `false` on EOF.
    pub async fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        self.last_read = Instant::now();

        let mut raw = BytesMut::from(&chunk[..n]);
        if let Some(cipher) = &mut self.cipher {
            cipher.decrypt(&mut raw);
        }

        if let Some(dec) = &mut self.decompressor {
            let mut out = vec![0u8; n * 4 + 64];
            let written = dec.decompress(&mut out, &raw)?;
            self.decoded.extend_from_slice(&out[..written]);
        } else {
            self.decoded.extend_from_slice(&raw);
        }

        if self.decoded.len() > MAX_BUFFER {
            bail!("input buffer exceeded {MAX_BUFFER} bytes");
        }

        Ok(true)
    }

    pub fn buffered(&self) -> usize {
        self.decoded.len()
    }

    /// Drains exactly `n` raw bytes out of the decoded stream, bypassing
    /// the opcode length table. Used only for the login handshake, where
    /// the record's encryption status isn't known yet (spec.md §4.D).
    pub fn drain_raw(&mut self, n: usize) -> Option<BytesMut> {
        if self.decoded.len() < n {
            return None;
        }
        Some(self.decoded.split_to(n))
    }

    /// Slices the next complete packet out of the decoded stream, if one
    /// is fully buffered.
    pub fn take_packet(&mut self, protocol: ProtocolVersion) -> Result<Option<BytesMut>> {
        match packet_length(&self.decoded, protocol) {
            PacketLength::Invalid => bail!("malformed packet: unknown opcode or zero length"),
            PacketLength::Need(_) => Ok(None),
            PacketLength::Have(len) => {
                if self.decoded.len() < len {
                    return Ok(None);
                }
                let packet = self.decoded.split_to(len);
                Ok(Some(packet))
            }
        }
    }
}

/// Write half of a framed socket: queues bytes, optionally Huffman-codes
/// them, and flushes eagerly.
pub struct FramedWriter {
    stream: OwnedWriteHalf,
    out: BytesMut,
    compress: bool,
}

impl FramedWriter {
    pub fn new(stream: OwnedWriteHalf) -> Self {
        Self {
            stream,
            out: BytesMut::new(),
            compress: false,
        }
    }

    /// Enables Huffman compression of everything queued from here on
    /// (spec.md §4.D: after the first relayed `GameLogin`).
    pub fn enable_compression(&mut self) {
        self.compress = true;
    }

    pub fn compression_enabled(&self) -> bool {
        self.compress
    }

    pub fn queue(&mut self, bytes: &[u8]) -> Result<()> {
        if self.compress {
            let mut packed = Vec::new();
            huffman::compress(bytes, &mut packed)?;
            self.out.extend_from_slice(&packed);
        } else {
            self.out.extend_from_slice(bytes);
        }
        Ok(())
    }

    /// Writes every queued byte to the socket and clears the queue.
    pub async fn flush(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.out).await?;
        self.out.clear();
        Ok(())
    }
}
