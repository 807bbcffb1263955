// healing_stats_sequencer — restores sequence-id order over events that
// concurrent producer threads hand in out of order.
//
// The host numbers every local combat event with a monotonically increasing
// id but invokes the callback from several threads, so ids arrive shuffled.
// `EventSequencer::submit` delivers each event to a single callback, in id
// order where it can:
//
// - id 0 means "unordered" and is delivered immediately.
// - The first non-zero id bootstraps `highest_delivered` to `id - 1`.
// - `id == highest + 1` (fast path): deliver on the calling thread, advance
//   `highest` by compare-and-swap, then drain any buffered successors. No
//   lock is taken unless something is buffered.
// - `id <= highest`: already passed; delivered immediately and logged.
// - otherwise the event waits in one of `MAX_QUEUED_EVENTS` slots until its
//   predecessor is delivered.
//
// Locking: buffering takes the `RwLock` shared, draining takes it exclusive,
// so a drain never observes a half-written slot and two drains never
// interleave deliveries. Slot indices are handed out by `fetch_add` on
// `pending_count`. A submitter that loses a race against the fast path after
// reserving an index leaves that slot empty and retries; the index is
// reclaimed when a drain finds nothing left and resets the count.
//
// Ordering is best effort. Events are never dropped or blocked on: a full
// buffer delivers the newcomer immediately and leaves `highest` alone, so
// the buffered run keeps waiting for its missing predecessor. An id that
// went out this way never advances `highest`; anything buffered behind it
// stays put until a later drain finds its predecessor.
//
// The callback must not call back into `submit` on the same sequencer; a
// drain holds the exclusive lock while delivering.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, warn};

/// Number of out-of-order events that can wait for their predecessors.
pub const MAX_QUEUED_EVENTS: usize = 256;

/// `highest_delivered` before the first non-zero id arrives.
const UNSET: u64 = u64::MAX;

/// One event together with the id it was submitted under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencedEvent<T> {
    pub sequence_id: u64,
    pub payload: T,
}

type Callback<T> = Box<dyn Fn(SequencedEvent<T>) + Send + Sync>;

/// Reorders submissions by sequence id before handing them to a callback.
pub struct EventSequencer<T> {
    callback: Callback<T>,
    highest_delivered: AtomicU64,
    pending_count: AtomicUsize,
    highest_queue_size: AtomicUsize,
    buffer_lock: RwLock<()>,
    slots: Box<[Mutex<Option<SequencedEvent<T>>>]>,
}

impl<T: Send> EventSequencer<T> {
    pub fn new(callback: impl Fn(SequencedEvent<T>) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            highest_delivered: AtomicU64::new(UNSET),
            pending_count: AtomicUsize::new(0),
            highest_queue_size: AtomicUsize::new(0),
            buffer_lock: RwLock::new(()),
            slots: (0..MAX_QUEUED_EVENTS).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Deliver `payload` now or once every lower id has been delivered.
    pub fn submit(&self, payload: T, sequence_id: u64) {
        if sequence_id == 0 {
            self.deliver(SequencedEvent {
                sequence_id,
                payload,
            });
            return;
        }

        loop {
            let current = self.highest_delivered.load(Ordering::SeqCst);
            if current == UNSET {
                // Losers of the bootstrap race simply re-read.
                let _ = self.highest_delivered.compare_exchange(
                    UNSET,
                    sequence_id - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }

            if current >= sequence_id {
                debug!(sequence_id, current, "event arrived after a later one was delivered");
                self.deliver(SequencedEvent {
                    sequence_id,
                    payload,
                });
                return;
            }

            if current == sequence_id - 1 {
                self.deliver(SequencedEvent {
                    sequence_id,
                    payload,
                });
                if self
                    .highest_delivered
                    .compare_exchange(current, sequence_id, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    warn!(sequence_id, current, "highest delivered id moved during fast path");
                }
                self.try_flush();
                return;
            }

            let guard = self.buffer_lock.read().unwrap_or_else(PoisonError::into_inner);
            if self.highest_delivered.load(Ordering::SeqCst) != current {
                continue;
            }

            let index = self.pending_count.fetch_add(1, Ordering::SeqCst);
            if index >= MAX_QUEUED_EVENTS {
                drop(guard);
                warn!(
                    sequence_id,
                    current,
                    capacity = MAX_QUEUED_EVENTS,
                    "sequencer buffer full, delivering out of order"
                );
                self.deliver(SequencedEvent {
                    sequence_id,
                    payload,
                });
                return;
            }

            if self.highest_delivered.load(Ordering::SeqCst) != current {
                // Slot `index` stays empty until the next full drain.
                continue;
            }

            *lock_slot(&self.slots[index]) = Some(SequencedEvent {
                sequence_id,
                payload,
            });
            return;
        }
    }

    /// True when nothing is buffered or reserved.
    pub fn queue_is_empty(&self) -> bool {
        self.pending_count.load(Ordering::SeqCst) == 0
    }

    /// Largest number of reserved slots seen by a drain that emptied the
    /// buffer.
    pub fn highest_queue_size(&self) -> usize {
        self.highest_queue_size.load(Ordering::SeqCst)
    }

    /// Highest id delivered in order so far, if any non-zero id was seen.
    pub fn highest_delivered(&self) -> Option<u64> {
        match self.highest_delivered.load(Ordering::SeqCst) {
            UNSET => None,
            id => Some(id),
        }
    }

    fn deliver(&self, event: SequencedEvent<T>) {
        (self.callback)(event);
    }

    /// Deliver buffered events that are now in order.
    fn try_flush(&self) {
        if self.pending_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.buffer_lock.write().unwrap_or_else(PoisonError::into_inner);
        self.drain_locked();
    }

    /// Drain loop proper. Caller holds the exclusive buffer lock.
    fn drain_locked(&self) {
        let count = self.pending_count.load(Ordering::SeqCst).min(MAX_QUEUED_EVENTS);

        let remaining = loop {
            let mut removed = false;
            let mut remaining = 0;

            for slot in &self.slots[..count] {
                let mut slot = lock_slot(slot);
                let Some(sequence_id) = slot.as_ref().map(|e| e.sequence_id) else {
                    continue;
                };
                let current = self.highest_delivered.load(Ordering::SeqCst);
                if sequence_id > current + 1 {
                    remaining += 1;
                    continue;
                }

                let event = slot.take();
                drop(slot);
                if sequence_id <= current {
                    debug!(sequence_id, current, "buffered event overtaken");
                }
                if let Some(event) = event {
                    self.deliver(event);
                }
                if sequence_id == current + 1 {
                    self.advance(current, sequence_id);
                }
                removed = true;
            }

            if !removed {
                break remaining;
            }
        };

        if remaining == 0 {
            self.highest_queue_size.fetch_max(count, Ordering::SeqCst);
            self.pending_count.store(0, Ordering::SeqCst);
        }
    }

    fn advance(&self, current: u64, to: u64) {
        if self
            .highest_delivered
            .compare_exchange(current, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(to, current, "highest delivered id moved during drain");
        }
    }
}

fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
