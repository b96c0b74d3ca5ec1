//! Throttled, perpetual probe scheduling
//!
//! At most `limit` probes run at once. Submissions beyond the limit wait in
//! FIFO order. When a probe finishes, its slot goes to the oldest waiting
//! entry straight away, and the finished entry is submitted again once the
//! cooldown has elapsed, so every entry keeps being probed for as long as
//! the runtime lives.

use crate::pool::entry::ProxyEntry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

#[derive(Debug, Default)]
struct SlotState {
    active: usize,
    waiting: VecDeque<Arc<ProxyEntry>>,
}

/// Owns the slot counter and the waiting queue; entries never touch either.
#[derive(Debug)]
pub(crate) struct ProbeScheduler {
    limit: Option<usize>,
    cooldown: Duration,
    slots: Mutex<SlotState>,
}

impl ProbeScheduler {
    /// `limit == None` means every submission starts at once.
    pub(crate) fn new(limit: Option<usize>, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            limit,
            cooldown,
            slots: Mutex::new(SlotState::default()),
        })
    }

    /// Probes currently in flight
    pub(crate) fn active(&self) -> usize {
        self.slots.lock().active
    }

    /// Entries waiting for a slot
    pub(crate) fn queued(&self) -> usize {
        self.slots.lock().waiting.len()
    }

    /// URLs of the waiting entries, oldest first
    #[cfg(test)]
    fn queued_urls(&self) -> Vec<String> {
        self.slots
            .lock()
            .waiting
            .iter()
            .map(|entry| entry.url().to_string())
            .collect()
    }

    fn has_free_slot(&self, slots: &SlotState) -> bool {
        self.limit.map_or(true, |limit| slots.active < limit)
    }

    /// Start a probe for `entry` now if a slot is free, else queue it.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn submit(self: &Arc<Self>, entry: Arc<ProxyEntry>) {
        let mut slots = self.slots.lock();
        if self.has_free_slot(&slots) {
            slots.active += 1;
            drop(slots);
            self.start_probe(entry);
        } else {
            trace!(proxy = %entry.descriptor(), "probe queued");
            slots.waiting.push_back(entry);
        }
    }

    /// Spawn a probe for an entry that already holds a slot.
    fn start_probe(self: &Arc<Self>, entry: Arc<ProxyEntry>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            trace!(proxy = %entry.descriptor(), "probe started");

            // A panicking probe still has to hand its slot back.
            let probing = Arc::clone(&entry);
            if let Err(e) = tokio::spawn(async move { probing.probe().await }).await {
                error!(proxy = %entry.descriptor(), error = %e, "probe task failed");
            }

            scheduler.finish_probe(entry);
        });
    }

    fn finish_probe(self: &Arc<Self>, entry: Arc<ProxyEntry>) {
        // Releasing the slot and handing it to the next waiter happen under
        // one lock, so a concurrent submit cannot jump the queue.
        let next = {
            let mut slots = self.slots.lock();
            slots.active -= 1;
            if self.has_free_slot(&slots) {
                let next = slots.waiting.pop_front();
                if next.is_some() {
                    slots.active += 1;
                }
                next
            } else {
                None
            }
        };

        if let Some(next) = next {
            self.start_probe(next);
        }

        let scheduler = Arc::clone(self);
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            scheduler.submit(entry);
        });
    }
}
