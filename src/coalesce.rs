//! Single-flight coalescing of concurrent renders for the same cache key.
//!
//! When N requests arrive for the same uncached path, only the first should
//! pay for the source fetch and transform. This module tracks one in-flight
//! marker per key: the first caller is admitted and renders; late arrivals
//! get a wait handle that resolves when the admitted render finishes, at
//! which point they re-check the response cache.
//!
//! # Release is RAII
//!
//! Admission hands back a [`RenderGuard`]. Dropping the guard removes the
//! marker and wakes every waiter — and drop runs no matter how the render
//! ends: delivered response, pipeline error, or client disconnect (the
//! request future is dropped, taking the guard with it). A waiter can never
//! be stuck behind a render that aborted.
//!
//! # Waiters re-check, they don't receive bytes
//!
//! The admitted render publishes its result through the response cache, not
//! through the wait handle. A woken waiter re-reads the cache; on a miss
//! (the render failed, skipped population, or the entry already expired) it
//! simply attempts admission again. Each attempt either wins admission or
//! waits on a *newer* render, so there is no spin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// In-flight marker table, one entry per key currently being rendered.
#[derive(Default)]
pub struct Coalescer {
    inflight: Mutex<HashMap<String, watch::Receiver<()>>>,
}

/// Outcome of an admission attempt.
pub enum Admission {
    /// This caller owns the render for the key. Exactly one exists per key
    /// at any instant.
    Admitted(RenderGuard),
    /// Another render is in flight; wait for it, then re-check the cache.
    Wait(WaitHandle),
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to begin a render for `key`.
    ///
    /// The marker is created atomically under the table lock, so two
    /// concurrent calls for the same key cannot both be admitted.
    pub fn begin(self: &Arc<Self>, key: &str) -> Admission {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(rx) = inflight.get(key) {
            return Admission::Wait(WaitHandle { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(());
        inflight.insert(key.to_string(), rx);
        Admission::Admitted(RenderGuard {
            key: key.to_string(),
            coalescer: Arc::clone(self),
            _tx: tx,
        })
    }

    /// Number of keys currently in flight. Test support.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

/// Ownership of the in-flight marker for one key.
///
/// Held by the admitted render for the lifetime of its response — through
/// delivery of the final byte, or until the connection aborts. Dropping it
/// releases the marker exactly once and wakes all waiters.
pub struct RenderGuard {
    key: String,
    coalescer: Arc<Coalescer>,
    // Dropping the sender is what wakes the waiters.
    _tx: watch::Sender<()>,
}

impl Drop for RenderGuard {
    fn drop(&mut self) {
        self.coalescer.inflight.lock().unwrap().remove(&self.key);
    }
}

/// Handle on which a late arrival waits for the in-flight render.
pub struct WaitHandle {
    rx: watch::Receiver<()>,
}

impl WaitHandle {
    /// Resolve when the admitted render's guard is dropped.
    ///
    /// Wake order across waiters is unspecified; they all just re-check the
    /// cache afterwards.
    pub async fn wait(mut self) {
        // The sender is never written to, only dropped; `changed` returning
        // an error is the completion signal.
        let _ = self.rx.changed().await;
    }
}
