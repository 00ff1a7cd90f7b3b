//! Periodic ping/pong supervision of client connections.
//!
//! Each sweep visits every tracked client. A client whose alive flag is still
//! clear from the previous sweep is evicted; every other client has its flag
//! cleared and is asked to send a ping. A pong sets the flag again. A silent
//! client therefore survives at least one and at most two intervals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wsproxy_core::SessionId;

use crate::metrics::LIVENESS_EVICTIONS_TOTAL;

/// Liveness state shared between the monitor and one session.
#[derive(Debug)]
pub struct TrackedClient {
    alive: AtomicBool,
    probe: Notify,
    evicted: CancellationToken,
    connected_at: Instant,
}

impl TrackedClient {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            probe: Notify::new(),
            evicted: CancellationToken::new(),
            connected_at: Instant::now(),
        }
    }

    /// Record a pong.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Whether a pong (or registration) was seen since the last sweep.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Resolves when the monitor wants a ping sent.
    pub async fn probe_requested(&self) {
        self.probe.notified().await;
    }

    /// Resolves when the monitor has evicted this client.
    pub async fn evicted(&self) {
        self.evicted.cancelled().await;
    }

    /// Whether the monitor has evicted this client.
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Time since the client was tracked.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Result of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Clients asked to send a ping.
    pub probed: usize,
    /// Clients evicted.
    pub evicted: usize,
}

/// The set of live client connections and the sweep that polices it.
#[derive(Debug)]
pub struct LivenessMonitor {
    clients: DashMap<SessionId, Arc<TrackedClient>>,
    interval: Duration,
}

impl LivenessMonitor {
    /// Monitor sweeping every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            interval,
        }
    }

    /// Start tracking a client. It counts as alive until the next sweep.
    pub fn track(&self, id: SessionId) -> Arc<TrackedClient> {
        let client = Arc::new(TrackedClient::new());
        let _ = self.clients.insert(id, Arc::clone(&client));
        client
    }

    /// Stop tracking a client. No-op if it was already evicted.
    pub fn untrack(&self, id: &SessionId) {
        let _ = self.clients.remove(id);
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Evict clients that missed the previous probe; probe the rest.
    pub fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        // `retain` holds each shard's write lock while visiting it, so a
        // concurrent track/untrack on the same shard waits for the sweep.
        self.clients.retain(|id, client| {
            if client.alive.swap(false, Ordering::Relaxed) {
                client.probe.notify_one();
                outcome.probed += 1;
                true
            } else {
                client.evicted.cancel();
                outcome.evicted += 1;
                info!(session_id = %id, age_ms = duration_ms(client.age()), "evicting unresponsive client");
                false
            }
        });
        if outcome.evicted > 0 {
            metrics::counter!(LIVENESS_EVICTIONS_TOTAL).increment(outcome.evicted as u64);
        }
        outcome
    }

    /// Sweep every interval until `cancel` fires. The first sweep happens one
    /// full interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.sweep();
                    debug!(probed = outcome.probed, evicted = outcome.evicted, "liveness sweep");
                }
                () = cancel.cancelled() => {
                    debug!("liveness monitor stopped");
                    return;
                }
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
