//! Port arithmetic and fixed constants shared by the allocator and the relay.
//!
//! The debugger extension never sees the real target process. It only sees process ids
//! inside its own sandbox and turns one of them into a TCP port:
//!
//! ```text
//! port = pid % PID_MODULUS + DEBUGGER_BASE_PORT
//! ```
//!
//! The bridge runs that same transform twice: once on the real target's pid to find where
//! to connect upstream, and once (in reverse) to choose a decoy identity whose port it can
//! listen on locally.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Base of the debugger's port-discovery scheme.
pub const DEBUGGER_BASE_PORT: u16 = 56000;

/// Modulus the debugger applies to a process id before adding [`DEBUGGER_BASE_PORT`].
pub const PID_MODULUS: u32 = 1000;

/// Lowest identity a decoy process can take inside the debugger's sandbox.
///
/// Pid 1 is the sandbox's init process and pid 2 its shell.
pub const FIRST_DECOY_IDENTITY: u32 = 3;

/// Delay between upstream connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for a single upstream connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval for the non-blocking accept loop.
pub const BACKOFF_DURATION: Duration = Duration::from_millis(10);

/// Every socket the bridge opens lives on the loopback interface.
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Returns `base_port + offset`, failing if the result is not a valid port.
pub fn offset_port(base_port: u16, offset: u32) -> Result<u16> {
    u32::from(base_port)
        .checked_add(offset)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or(Error::PortOverflow { base_port, offset })
}

/// Applies the debugger's discovery transform to `pid` using an arbitrary base.
pub fn port_for_pid(base_port: u16, pid: u32) -> Result<u16> {
    offset_port(base_port, pid % PID_MODULUS)
}

/// The port the debugger expects the process `pid` to listen on.
pub fn upstream_port_for_pid(pid: u32) -> u16 {
    // 56000 + 999 always fits.
    DEBUGGER_BASE_PORT + (pid % PID_MODULUS) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_port_wraps_pid() {
        assert_eq!(upstream_port_for_pid(0), 56000);
        assert_eq!(upstream_port_for_pid(42), 56042);
        assert_eq!(upstream_port_for_pid(123_042), 56042);
        assert_eq!(upstream_port_for_pid(u32::MAX), 56000 + (u32::MAX % 1000) as u16);
    }

    #[test]
    fn port_for_pid_matches_upstream_transform() {
        assert_eq!(port_for_pid(DEBUGGER_BASE_PORT, 7042).unwrap(), 56042);
        assert_eq!(port_for_pid(100, 1999).unwrap(), 1099);
    }

    #[test]
    fn offset_port_rejects_overflow() {
        assert_eq!(offset_port(65000, 535).unwrap(), 65535);
        assert!(matches!(
            offset_port(65000, 536),
            Err(Error::PortOverflow {
                base_port: 65000,
                offset: 536
            })
        ));
        assert!(offset_port(1, u32::MAX).is_err());
    }
}
