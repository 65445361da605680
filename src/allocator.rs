//! Port identity allocation.
//!
//! An *identity* is a small integer that serves twice: it is the pid the decoy process
//! will show to the debugger, and it is the offset from the debugger's base port at which
//! the bridge listens. Allocation scans upward from a minimum identity and keeps the first
//! port it manages to bind.
//!
//! The kernel is the only authority on which ports are free. Other processes may bind
//! ports in the range at any moment, so the allocator never predicts availability: it
//! binds, and treats `AddrInUse` as "try the next one".
//!
//! # Examples
//!
//! ```no_run
//! use sandbox_debug_bridge::allocator::allocate;
//! use sandbox_debug_bridge::wire::{DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY};
//!
//! let allocation = allocate(DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY)?;
//! println!("decoy pid {} listens on {}", allocation.identity(), allocation.port());
//! # Ok::<(), sandbox_debug_bridge::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::wire::{LOOPBACK, offset_port};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::Mutex;

/// Serializes allocations made from this process.
///
/// Two sessions scanning the same base concurrently would otherwise both observe a
/// collision-free candidate in whichever order the kernel lets them bind. The bind result
/// still decides; the lock only keeps the scan order deterministic within the process.
static ALLOCATION_LOCK: Mutex<()> = Mutex::new(());

/// A bound listener together with the identity it was allocated for.
#[derive(Debug)]
pub struct Allocation {
    identity: u32,
    port: u16,
    listener: TcpListener,
}

impl Allocation {
    /// The identity the decoy process must expose.
    pub fn identity(&self) -> u32 {
        self.identity
    }

    /// The port the listener is bound to (`base_port + identity`).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The bound listener, still owned by the allocation.
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Gives up the identity and hands over the listener.
    pub fn into_listener(self) -> TcpListener {
        self.listener
    }

    /// Splits the allocation into its identity and listener.
    pub fn into_parts(self) -> (u32, TcpListener) {
        (self.identity, self.listener)
    }
}

/// Finds the lowest identity `>= min_identity` whose port `base_port + identity` can be
/// bound on the loopback interface.
///
/// # Errors
///
/// * [`Error::Bind`] if binding fails for any reason other than the port being in use.
///   Scanning stops at that candidate.
/// * [`Error::PortSpaceExhausted`] if every candidate up to port 65535 is taken.
pub fn allocate(base_port: u16, min_identity: u32) -> Result<Allocation> {
    allocate_with(base_port, min_identity, |port| {
        TcpListener::bind((LOOPBACK, port))
    })
}

/// Same scan as [`allocate`], but binding through `bind`.
///
/// `bind` receives the candidate port and must return a listener bound to it, or the
/// error from the attempt. Only [`ErrorKind::AddrInUse`] advances the scan.
pub fn allocate_with<B>(base_port: u16, min_identity: u32, mut bind: B) -> Result<Allocation>
where
    B: FnMut(u16) -> std::io::Result<TcpListener>,
{
    let _guard = ALLOCATION_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let exhausted = Error::PortSpaceExhausted {
        base_port,
        min_identity,
    };

    let mut candidate = min_identity;
    loop {
        let Ok(port) = offset_port(base_port, candidate) else {
            return Err(exhausted);
        };
        match bind(port) {
            Ok(listener) => {
                logwise::info_sync!(
                    "allocated identity {identity} on port {port}",
                    identity = logwise::privacy::LogIt(&candidate),
                    port = logwise::privacy::LogIt(&port)
                );
                return Ok(Allocation {
                    identity: candidate,
                    port,
                    listener,
                });
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                logwise::info_sync!(
                    "port {port} in use, trying next identity",
                    port = logwise::privacy::LogIt(&port)
                );
                candidate = match candidate.checked_add(1) {
                    Some(next) => next,
                    None => return Err(exhausted),
                };
            }
            Err(source) => return Err(Error::Bind { port, source }),
        }
    }
}
