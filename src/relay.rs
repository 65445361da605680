//! The relay session: one listener, one debugger connection, one upstream target.
//!
//! # Architecture
//!
//! ```text
//!  debugger ──▶ listener (base + identity) ──▶ Bridge ──▶ upstream target
//!                                              │
//!               session thread: accept, then downstream → upstream
//!               connector thread: connect (with retry), then upstream → downstream
//! ```
//!
//! A session accepts exactly one downstream connection. While the upstream target is not
//! reachable yet, bytes from the debugger are held back and replayed once it is; the
//! connection attempt is repeated every [`RelayConfig::retry_delay`] until it succeeds or
//! the debugger hangs up. When either side closes, the other is closed too and
//! [`RelaySession::run`] returns.
//!
//! There is no async runtime involved. Each bridge uses two threads blocked on socket
//! reads, and a [`Shutdown`] token to unblock them.
//!
//! # Examples
//!
//! ```no_run
//! use sandbox_debug_bridge::allocator::allocate;
//! use sandbox_debug_bridge::relay::{RelaySession, Upstream};
//! use sandbox_debug_bridge::wire::{DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY, upstream_port_for_pid};
//!
//! let target_pid = 4242;
//! let allocation = allocate(DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY)?;
//! let identity = allocation.identity();
//! let session = RelaySession::new(
//!     allocation.into_listener(),
//!     Upstream::localhost(upstream_port_for_pid(target_pid)),
//! );
//! let handle = session.spawn()?;
//! // ... start the decoy process with `identity` and launch the editor ...
//! # let _ = identity;
//! handle.join()?;
//! # Ok::<(), sandbox_debug_bridge::Error>(())
//! ```

mod bridge;

pub use bridge::BridgePhase;

use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::wire::{BACKOFF_DURATION, CONNECT_TIMEOUT, RETRY_DELAY};
use bridge::Bridge;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Where the relay forwards the debugger connection to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Upstream {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Upstream::new("localhost", port)
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Timing knobs for a relay session.
///
/// Serialized with durations in milliseconds:
///
/// ```
/// use sandbox_debug_bridge::relay::RelayConfig;
/// use std::time::Duration;
///
/// let config = RelayConfig::from_json(r#"{"retry_delay_ms": 250}"#).unwrap();
/// assert_eq!(config.retry_delay, Duration::from_millis(250));
/// assert_eq!(config.connect_timeout, RelayConfig::default().connect_timeout);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Wait between failed upstream connection attempts.
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
    /// Limit for one upstream connection attempt. Zero leaves it to the OS.
    ///
    /// An attempt in progress is not interrupted by shutdown, so this also bounds how
    /// long [`RelayHandle::join`] can take after [`RelayHandle::shutdown`].
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// How often the accept loop checks for shutdown.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            retry_delay: RETRY_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
            poll_interval: BACKOFF_DURATION,
        }
    }
}

impl RelayConfig {
    /// Parses a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// A point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Upstream connection attempts so far, successful or not.
    pub upstream_attempts: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_downstream: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    upstream_attempts: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_downstream: AtomicU64,
}

impl Counters {
    pub(crate) fn record_attempt(&self) {
        self.upstream_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sent_upstream(&self, bytes: usize) {
        self.bytes_to_upstream
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn sent_downstream(&self, bytes: usize) {
        self.bytes_to_downstream
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            upstream_attempts: self.upstream_attempts.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_downstream: self.bytes_to_downstream.load(Ordering::Relaxed),
        }
    }
}

/// State a [`RelayHandle`] can observe while the session runs elsewhere.
///
/// The bridge is held weakly so its sockets are released as soon as the session ends.
#[derive(Debug, Default)]
struct Monitor {
    bridge: Mutex<Option<Weak<Bridge>>>,
    counters: Arc<Counters>,
}

impl Monitor {
    fn phase(&self) -> Option<BridgePhase> {
        let bridge = self.bridge.lock().unwrap_or_else(|e| e.into_inner());
        bridge.as_ref().map(|weak| match weak.upgrade() {
            Some(bridge) => bridge.phase(),
            None => BridgePhase::Closed,
        })
    }
}

/// A listener paired with the upstream target it relays to.
#[derive(Debug)]
pub struct RelaySession {
    listener: TcpListener,
    upstream: Upstream,
    config: RelayConfig,
    shutdown: Shutdown,
    monitor: Arc<Monitor>,
}

impl RelaySession {
    pub fn new(listener: TcpListener, upstream: Upstream) -> Self {
        Self::with_config(listener, upstream, RelayConfig::default())
    }

    pub fn with_config(listener: TcpListener, upstream: Upstream, config: RelayConfig) -> Self {
        RelaySession {
            listener,
            upstream,
            config,
            shutdown: Shutdown::new(),
            monitor: Arc::default(),
        }
    }

    /// A token that tears the session down when triggered, from any thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Runs the session on the calling thread.
    ///
    /// Blocks until a debugger connects and the resulting bridge closes, or until the
    /// session is shut down. The listener is closed on return.
    ///
    /// # Errors
    ///
    /// [`Error::Accept`] if the listener fails, [`Error::Spawn`] if the connector thread
    /// cannot be started. Upstream connection failures are retried, and I/O errors on an
    /// established bridge simply close it.
    pub fn run(self) -> Result<()> {
        let RelaySession {
            listener,
            upstream,
            config,
            shutdown,
            monitor,
        } = self;
        let local = listener.local_addr()?;
        logwise::info_sync!(
            "relay listening on {local}, forwarding to {upstream}",
            local = logwise::privacy::LogIt(&local),
            upstream = upstream.to_string()
        );

        let Some(downstream) = accept(&listener, &shutdown, config.poll_interval)? else {
            logwise::info_sync!(
                "relay on {local} shut down before a debugger connected",
                local = logwise::privacy::LogIt(&local)
            );
            return Ok(());
        };

        let bridge = Bridge::new(
            downstream,
            upstream,
            config,
            shutdown.child(),
            Arc::clone(&monitor.counters),
        );
        *monitor.bridge.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&bridge));
        let result = bridge.run();
        drop(bridge);
        drop(listener);
        logwise::info_sync!(
            "relay on {local} finished",
            local = logwise::privacy::LogIt(&local)
        );
        result
    }

    /// Runs the session on a background thread.
    pub fn spawn(self) -> Result<RelayHandle> {
        let shutdown = self.shutdown.clone();
        let monitor = Arc::clone(&self.monitor);
        let thread = std::thread::Builder::new()
            .name("sandbox_debug_bridge::relay".to_owned())
            .spawn(move || self.run())
            .map_err(Error::Spawn)?;
        Ok(RelayHandle {
            shutdown,
            monitor,
            thread: Some(thread),
        })
    }
}

/// Waits for the one downstream connection, polling so shutdown is noticed.
fn accept(
    listener: &TcpListener,
    shutdown: &Shutdown,
    poll_interval: Duration,
) -> Result<Option<TcpStream>> {
    listener.set_nonblocking(true).map_err(Error::Accept)?;
    loop {
        if shutdown.is_triggered() {
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                // accepted sockets inherit non-blocking mode on some platforms
                stream.set_nonblocking(false).map_err(Error::Accept)?;
                logwise::info_sync!(
                    "debugger connected from {peer}",
                    peer = logwise::privacy::LogIt(&peer)
                );
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if shutdown.wait_timeout(poll_interval) {
                    return Ok(None);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionAborted) => {}
            Err(e) => return Err(Error::Accept(e)),
        }
    }
}

/// Relays one debugger connection accepted on `listener` to `upstream_host:upstream_port`.
///
/// Shorthand for [`RelaySession::new`] followed by [`RelaySession::run`].
pub fn run(listener: TcpListener, upstream_host: &str, upstream_port: u16) -> Result<()> {
    RelaySession::new(listener, Upstream::new(upstream_host, upstream_port)).run()
}

/// Controls a session started with [`RelaySession::spawn`].
///
/// Dropping the handle shuts the session down without waiting for it.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: Shutdown,
    monitor: Arc<Monitor>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl RelayHandle {
    /// Tears the session down: closes the listener and both sockets, and interrupts a
    /// pending retry.
    ///
    /// Returns immediately. If an upstream connection attempt is in flight, the session
    /// thread finishes only once that attempt completes or hits
    /// [`RelayConfig::connect_timeout`], and the listener stays open until then.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|thread| thread.is_finished())
    }

    /// The bridge's phase, or `None` while no debugger has connected.
    pub fn phase(&self) -> Option<BridgePhase> {
        self.monitor.phase()
    }

    pub fn stats(&self) -> RelayStats {
        self.monitor.counters.snapshot()
    }

    /// Waits for the session to end and returns its result.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| Error::SessionPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
