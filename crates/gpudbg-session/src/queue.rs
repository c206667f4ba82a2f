//! Command-queue lifecycle tracking.
//!
//! The kernel wants to hear about a debug session when the first command queue of a device is
//! created and again when the last one is destroyed. Queues come and go on arbitrary threads, so
//! the live count is a single atomic and transitions are detected on the value returned by the
//! read-modify-write itself (`0 -> 1` opens, `1 -> 0` closes).
//!
//! Detection and dispatch are separate steps: a thread that saw the `1 -> 0` transition may lose
//! the race to a thread that immediately saw a new `0 -> 1`. Dispatch therefore happens under a
//! small mutex and reconciles the kernel-visible state with the live count at that moment, so
//! the kernel always observes start and end strictly alternating and, once queue activity
//! quiesces, the session is open exactly when queues are live.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU32;
#[cfg(all(feature = "loom", test))]
use loom::sync::Mutex;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU32;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::Mutex;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::registrar::{KernelResourceRegistrar, SessionToken};

pub struct CommandQueueLifecycleTracker {
    registrar: Arc<dyn KernelResourceRegistrar>,
    queues: AtomicU32,
    /// Token of the session the kernel currently considers open.
    open_session: Mutex<Option<SessionToken>>,
}

impl CommandQueueLifecycleTracker {
    pub fn new(registrar: Arc<dyn KernelResourceRegistrar>) -> Self {
        Self {
            registrar,
            queues: AtomicU32::new(0),
            open_session: Mutex::new(None),
        }
    }

    pub fn on_queue_created(&self) {
        let prev = self.queues.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.dispatch();
        }
    }

    pub fn on_queue_destroyed(&self) {
        let prev = self
            .queues
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.dispatch(),
            Ok(_) => {}
            Err(_) => {
                tracing::warn!("command queue destroyed without a matching create; ignoring");
            }
        }
    }

    pub fn queue_count(&self) -> u32 {
        self.queues.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.queue_count() > 0
    }

    /// Token of the currently open kernel session, if any.
    pub fn session_token(&self) -> Option<SessionToken> {
        *self.open_session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self) {
        let mut open = self.open_session.lock().unwrap_or_else(|e| e.into_inner());
        let live = self.queues.load(Ordering::Acquire) > 0;
        match (*open, live) {
            (None, true) => {
                let token = self.registrar.notify_session_start();
                tracing::debug!(token, "debug session started");
                *open = Some(token);
            }
            (Some(token), false) => {
                self.registrar.notify_session_end(token);
                tracing::debug!(token, "debug session ended");
                *open = None;
            }
            // Another transition already brought the kernel in line with the live count.
            _ => {}
        }
    }
}

impl Drop for CommandQueueLifecycleTracker {
    fn drop(&mut self) {
        let open = self.open_session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = open {
            tracing::debug!(token, "ending debug session left open at teardown");
            self.registrar.notify_session_end(token);
        }
    }
}
