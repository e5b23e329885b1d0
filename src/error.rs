//! Typed errors callers pattern-match on.
//!
//! Most fallible internal plumbing (codec parsing, config loading) returns
//! `anyhow::Result` the way `valence_protocol`'s `Decode`/`Encode` impls do;
//! `ProxyError` exists only for the handful of outcomes a caller needs to
//! branch on (e.g. deciding whether a failure should tear down one endpoint
//! versus the whole session).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("packet in state where it is not accepted")]
    StateViolation,

    #[error("huffman decompression buffer overflow")]
    DecompressOverflow,

    #[error("huffman compression buffer overflow")]
    CompressOverflow,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(#[source] std::io::Error),

    #[error("server index {index} out of range (have {len} configured servers)")]
    ServerIndexOutOfRange { index: usize, len: usize },
}

pub type ProxyResult<T> = Result<T, ProxyError>;
