//! Wire-protocol codec layer: opcode tables, fixed data tables (Huffman,
//! login cipher), packet layouts, and cross-version translation.

pub mod cipher;
pub mod command;
pub mod huffman;
pub mod packet;
pub mod translate;
pub mod version;

pub use command::{cmd, packet_length, Command, PacketLength};
pub use version::ProtocolVersion;
