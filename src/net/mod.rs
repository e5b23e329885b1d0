//! Transport layer: framed byte-stream handling, the upstream (proxy→real
//! server) client, and the downstream (client→proxy) server endpoint.

pub mod endpoint;
pub mod framed;
pub mod upstream;

pub use endpoint::LinkedServer;
pub use framed::{FramedReader, FramedWriter};
pub use upstream::UpstreamClient;

/// Read-idle timeout for any framed socket (spec.md §5).
pub const IDLE_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Upstream ping interval (spec.md §4.C).
pub const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Zombie (`RELAY_SERVER`) linger window (spec.md §4.G).
pub const ZOMBIE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Reconnect retry delay (spec.md §4.G).
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
