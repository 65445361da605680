//! Cooperative cancellation for relay threads.
//!
//! A [`Shutdown`] is a cloneable flag plus a condition variable. Threads that sleep (the
//! accept poll, the upstream retry delay) wait on it so that triggering wakes them at
//! once. Threads that block in socket reads cannot wait on it, so whoever owns those
//! sockets registers a hook with [`Shutdown::on_trigger`] that shuts them down.
//!
//! Tokens form a tree: a [`child`](Shutdown::child) is triggered along with its parent,
//! but triggering a child leaves the parent alone. The relay session owns the root and
//! gives every bridge a child.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    triggered: bool,
    hooks: Vec<Hook>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
}

/// A cancellation token shared between the threads of one relay session.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Triggers the token, wakes every waiter and runs the registered hooks.
    ///
    /// Hooks run on the calling thread, outside the token's lock. Triggering twice is a
    /// no-op.
    pub fn trigger(&self) {
        let hooks = {
            let mut state = self.lock();
            if state.triggered {
                return;
            }
            state.triggered = true;
            std::mem::take(&mut state.hooks)
        };
        self.inner.condvar.notify_all();
        for hook in hooks {
            hook();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().triggered
    }

    /// Sleeps for up to `duration`, returning early if the token is triggered.
    ///
    /// Returns `true` if the token was triggered (before or during the wait).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        while !state.triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.inner.condvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Registers `hook` to run when the token is triggered.
    ///
    /// If the token has already been triggered the hook runs immediately.
    pub fn on_trigger<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            if !state.triggered {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Creates a token that is triggered whenever `self` is.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        let weak = Arc::downgrade(&child.inner);
        self.on_trigger(move || {
            if let Some(inner) = weak.upgrade() {
                Shutdown { inner }.trigger();
            }
        });
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_times_out_when_not_triggered() {
        let shutdown = Shutdown::new();
        let start = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn trigger_interrupts_wait() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let triggered = remote.wait_timeout(Duration::from_secs(30));
            (triggered, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        let (triggered, elapsed) = waiter.join().unwrap();
        assert!(triggered);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn hooks_run_once() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        shutdown.on_trigger(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        shutdown.trigger();
        shutdown.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // late registration runs straight away
        let c = count.clone();
        shutdown.on_trigger(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = Shutdown::new();
        let first = parent.child();
        first.trigger();
        assert!(!parent.is_triggered());

        let second = parent.child();
        parent.trigger();
        assert!(second.is_triggered());
        assert!(second.wait_timeout(Duration::from_secs(5)));
    }
}
