/*!
Lets a sandboxed debugger attach to a process that lives in a different sandbox.

# Overview

Some editor debugger extensions locate their target the old-fashioned way: they look for
a process with a well-known name, take its pid and connect to

```text
pid % 1000 + 56000
```

That works until the editor and the debug target are installed as two separate sandboxed
applications. Neither can see the other's processes, and the editor's pid namespace is
nearly empty (pid 1 is the sandbox init, pid 2 its shell).

sandbox_debug_bridge closes the gap in two steps:

1. **Allocate an identity.** [`allocator::allocate`] scans upward from
   [`wire::FIRST_DECOY_IDENTITY`] and binds the first free port `56000 + identity` on
   loopback. The launcher then starts a decoy process inside the editor's sandbox whose
   pid is exactly that identity, so the debugger computes our port.
2. **Relay.** A [`relay::RelaySession`] accepts the debugger's connection on that port and
   forwards it, byte for byte, to the real target at
   [`wire::upstream_port_for_pid`]`(target_pid)`. If the target is not listening yet,
   the debugger's first bytes are held back and the connection is retried every five
   seconds until it is.

Spawning the decoy, launching the editor and prompting the user to install anything are
left to the launcher.

# Quick Start

```no_run
use sandbox_debug_bridge::allocator::allocate;
use sandbox_debug_bridge::relay::{RelaySession, Upstream};
use sandbox_debug_bridge::wire::{DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY, upstream_port_for_pid};

# fn main() -> Result<(), sandbox_debug_bridge::Error> {
let target_pid = std::os::unix::process::parent_id();
let allocation = allocate(DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY)?;
println!("start the decoy with pid {}", allocation.identity());

let session = RelaySession::new(
    allocation.into_listener(),
    Upstream::localhost(upstream_port_for_pid(target_pid)),
);
// blocks until the debugger disconnects
session.run()?;
# Ok(())
# }
```

# Threads, not async

Like the rest of the bridge, the relay uses plain threads: the session thread accepts
and reads from the debugger, a connector thread connects upstream and reads from the
target. A [`Shutdown`] token unblocks both when the session is torn down.

# Logging

Diagnostics go through [logwise](https://docs.rs/logwise). Every failed upstream
connection attempt is logged at warning level before the retry.

# Module Organization

- [`allocator`] - port identity allocation
- [`relay`] - the relay session, its configuration and the per-connection bridge
- [`shutdown`] - cancellation token shared by the relay threads
- [`wire`] - port arithmetic and timing constants
*/

pub mod allocator;
mod error;
pub mod relay;
pub mod shutdown;
pub mod wire;

pub use allocator::{Allocation, allocate};
pub use error::{Error, Result};
pub use relay::{BridgePhase, RelayConfig, RelayHandle, RelaySession, RelayStats, Upstream};
pub use shutdown::Shutdown;
