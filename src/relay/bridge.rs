//! One debugger connection paired with its upstream connection.
//!
//! A bridge moves through three phases:
//!
//! * **AwaitingUpstream**: the debugger is connected, the target is not. Bytes from the
//!   debugger go into a pending buffer while the connector thread keeps trying to reach
//!   the target.
//! * **Connected**: the pending buffer has been written upstream exactly once and
//!   everything else is forwarded as it arrives, in both directions.
//! * **Closed**: terminal. Both sockets are shut down.
//!
//! The pending buffer and the phase live behind one mutex. The connector flushes the
//! buffer and switches to `Connected` without releasing it, so every byte the downstream
//! reader handles is either appended before the flush or written after it.

use super::{Counters, RelayConfig, Upstream};
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown as Direction, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const BUF_SIZE: usize = 8 * 1024;

/// Where a bridge is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgePhase {
    AwaitingUpstream,
    Connected,
    Closed,
}

#[derive(Debug)]
enum State {
    AwaitingUpstream { pending: Vec<u8> },
    /// Holds the write half used by the downstream reader.
    Connected { upstream: TcpStream },
    Closed,
}

impl State {
    fn phase(&self) -> BridgePhase {
        match self {
            State::AwaitingUpstream { .. } => BridgePhase::AwaitingUpstream,
            State::Connected { .. } => BridgePhase::Connected,
            State::Closed => BridgePhase::Closed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Bridge {
    state: Mutex<State>,
    downstream: TcpStream,
    /// A handle on the upstream socket used only to shut it down.
    upstream_socket: Mutex<Option<TcpStream>>,
    upstream: Upstream,
    config: RelayConfig,
    shutdown: Shutdown,
    counters: Arc<Counters>,
}

impl Bridge {
    /// Wraps an accepted debugger connection.
    ///
    /// Triggering `shutdown` (or any of its ancestors) closes the bridge.
    pub(crate) fn new(
        downstream: TcpStream,
        upstream: Upstream,
        config: RelayConfig,
        shutdown: Shutdown,
        counters: Arc<Counters>,
    ) -> Arc<Bridge> {
        let bridge = Arc::new(Bridge {
            state: Mutex::new(State::AwaitingUpstream {
                pending: Vec::new(),
            }),
            downstream,
            upstream_socket: Mutex::new(None),
            upstream,
            config,
            shutdown,
            counters,
        });
        let weak = Arc::downgrade(&bridge);
        bridge.shutdown.on_trigger(move || {
            if let Some(bridge) = weak.upgrade() {
                bridge.teardown();
            }
        });
        bridge
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn phase(&self) -> BridgePhase {
        self.lock().phase()
    }

    pub(crate) fn close(&self) {
        self.shutdown.trigger();
    }

    /// Shuts both sockets down and enters `Closed`.
    ///
    /// Sockets are shut down before taking the state lock so that a thread blocked in a
    /// write while holding it gets an error and lets go.
    fn teardown(&self) {
        let _ = self.downstream.shutdown(Direction::Both);
        let upstream = self
            .upstream_socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(upstream) = upstream {
            let _ = upstream.shutdown(Direction::Both);
        }
        let previous = std::mem::replace(&mut *self.lock(), State::Closed);
        if previous.phase() != BridgePhase::Closed {
            logwise::info_sync!(
                "bridge to {upstream} closed",
                upstream = self.upstream.to_string()
            );
        }
    }

    /// Drives the bridge until it closes.
    ///
    /// The downstream reader runs on the calling thread; connecting and the upstream
    /// reader run on a second thread, which is joined before returning.
    pub(crate) fn run(self: &Arc<Self>) -> Result<()> {
        let bridge = Arc::clone(self);
        let connector = std::thread::Builder::new()
            .name("sandbox_debug_bridge::connect".to_owned())
            .spawn(move || bridge.connect_and_forward());
        let connector = match connector {
            Ok(connector) => connector,
            Err(e) => {
                self.close();
                return Err(Error::Spawn(e));
            }
        };

        self.forward_downstream();
        self.close();
        connector.join().map_err(|_| Error::SessionPanicked)
    }

    /// Downstream reader: buffers while awaiting upstream, forwards afterwards.
    fn forward_downstream(&self) {
        let mut downstream = &self.downstream;
        let mut upstream: Option<TcpStream> = None;
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let n = match downstream.read(&mut buf) {
                Ok(0) => {
                    if !self.shutdown.is_triggered() {
                        logwise::info_sync!("debugger closed its connection");
                    }
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.report("reading from debugger", &e);
                    return;
                }
            };
            let chunk = &buf[..n];

            if upstream.is_none() {
                let attached = match &mut *self.lock() {
                    State::AwaitingUpstream { pending } => {
                        pending.extend_from_slice(chunk);
                        None
                    }
                    State::Connected { upstream: writer } => Some(writer.try_clone()),
                    State::Closed => return,
                };
                match attached {
                    None => continue,
                    Some(Ok(stream)) => upstream = Some(stream),
                    Some(Err(e)) => {
                        self.report("cloning upstream socket", &e);
                        return;
                    }
                }
            }

            if let Some(stream) = upstream.as_mut() {
                if let Err(e) = stream.write_all(chunk) {
                    self.report("writing to target", &e);
                    return;
                }
                self.counters.sent_upstream(n);
            }
        }
    }

    fn connect_and_forward(&self) {
        let Some(stream) = self.connect_with_retry() else {
            return;
        };
        let Some(reader) = self.attach(stream) else {
            return;
        };
        self.forward_upstream(reader);
        self.close();
    }

    /// Keeps trying to reach the target until it answers or the bridge closes.
    fn connect_with_retry(&self) -> Option<TcpStream> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            self.counters.record_attempt();
            match connect(&self.upstream, self.config.connect_timeout) {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    logwise::warn_sync!(
                        "cannot connect to {upstream}, retrying in {delay}: {error}",
                        upstream = self.upstream.to_string(),
                        delay = logwise::privacy::LogIt(&self.config.retry_delay),
                        error = logwise::privacy::LogIt(&e)
                    );
                    if self.shutdown.wait_timeout(self.config.retry_delay) {
                        return None;
                    }
                }
            }
        }
    }

    /// Flushes the pending buffer into `stream` and enters `Connected`.
    ///
    /// Returns the read half for upstream-to-downstream forwarding, or `None` if the
    /// bridge closed first or the flush failed.
    fn attach(&self, stream: TcpStream) -> Option<TcpStream> {
        let (reader, kill) = match split(&stream) {
            Ok(handles) => handles,
            Err(e) => {
                self.report("cloning upstream socket", &e);
                self.close();
                return None;
            }
        };
        *self
            .upstream_socket
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(kill);
        if self.shutdown.is_triggered() {
            // teardown may have run before the socket was registered
            let _ = stream.shutdown(Direction::Both);
            return None;
        }

        let mut state = self.lock();
        let pending = match std::mem::replace(&mut *state, State::Closed) {
            State::AwaitingUpstream { pending } => pending,
            other => {
                *state = other;
                return None;
            }
        };

        let mut writer = stream;
        if let Err(e) = writer.write_all(&pending) {
            drop(state);
            self.report("flushing buffered bytes to target", &e);
            self.close();
            return None;
        }
        self.counters.sent_upstream(pending.len());
        *state = State::Connected { upstream: writer };
        drop(state);

        logwise::info_sync!(
            "connected to {upstream}, replayed {count} buffered bytes",
            upstream = self.upstream.to_string(),
            count = logwise::privacy::LogIt(&pending.len())
        );
        Some(reader)
    }

    /// Upstream reader: forwards everything the target sends to the debugger.
    fn forward_upstream(&self, mut upstream: TcpStream) {
        let mut downstream = &self.downstream;
        let mut buf = [0u8; BUF_SIZE];
        loop {
            match upstream.read(&mut buf) {
                Ok(0) => {
                    if !self.shutdown.is_triggered() {
                        logwise::info_sync!(
                            "{upstream} closed its connection",
                            upstream = self.upstream.to_string()
                        );
                    }
                    return;
                }
                Ok(n) => {
                    if let Err(e) = downstream.write_all(&buf[..n]) {
                        self.report("writing to debugger", &e);
                        return;
                    }
                    self.counters.sent_downstream(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.report("reading from target", &e);
                    return;
                }
            }
        }
    }

    /// Logs an I/O error that ends the bridge, unless it was caused by teardown.
    fn report(&self, what: &str, error: &std::io::Error) {
        if !self.shutdown.is_triggered() {
            logwise::warn_sync!(
                "bridge error {what}: {error}",
                what = logwise::privacy::LogIt(&what),
                error = logwise::privacy::LogIt(error)
            );
        }
    }
}

/// Two more handles on `stream`: one to read from, one to shut it down with.
fn split(stream: &TcpStream) -> std::io::Result<(TcpStream, TcpStream)> {
    Ok((stream.try_clone()?, stream.try_clone()?))
}

/// Tries every address `upstream` resolves to, in order.
fn connect(upstream: &Upstream, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (upstream.host.as_str(), upstream.port).to_socket_addrs()? {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("{upstream} did not resolve to any address"),
        )
    }))
}
