//! Error types for the debug bridge.
//!
//! Only failures the caller must act on are represented here. Port collisions while
//! scanning, failed upstream connection attempts and connections closing mid-session are
//! handled inside the allocator and the relay and only show up in the log.

use thiserror::Error;

/// Errors surfaced by the allocator, the relay session and configuration loading.
#[derive(Error, Debug)]
pub enum Error {
    /// Binding a candidate port failed for a reason other than the port being in use.
    ///
    /// This aborts allocation; picking another port will not fix a permission problem or
    /// descriptor exhaustion.
    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Every port from `base_port + min_identity` up to 65535 is already in use.
    #[error("no free port at or above {base_port} + {min_identity}")]
    PortSpaceExhausted { base_port: u16, min_identity: u32 },

    /// `base_port + offset` does not fit in a TCP port number.
    #[error("port {base_port} + {offset} is outside the TCP port range")]
    PortOverflow { base_port: u16, offset: u32 },

    /// The listener stopped accepting connections.
    #[error("accepting a debugger connection failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A relay thread could not be started.
    #[error("cannot spawn relay thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Configuration JSON could not be parsed.
    #[error("invalid relay configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The thread running a relay session panicked.
    #[error("relay session thread panicked")]
    SessionPanicked,

    /// Any other I/O failure, such as reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
