//! Bounded, blocking message queue between sensor producers and the fusion
//! consumer.
//!
//! A fixed-capacity ring buffer guarded by one mutex and two condition
//! variables (`not_empty`, `not_full`). Pushes are non-blocking: a full queue
//! rejects the message and the producer is expected to drop it and continue.
//! Pops block with a caller-chosen timeout. Each enqueued message holds its
//! own clone of the detection batch handle, so the producer may keep or drop
//! its copy independently; `pop` transfers the queue's clone to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::detection::BatchRef;
use crate::error::FusionError;

/// Default queue capacity (messages).
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// One sensor upload: who sent it, the shared batch, and when it was
/// received.
#[derive(Debug, Clone)]
pub struct SensorMessage {
    pub sensor_id: i16,
    pub batch: BatchRef,
    /// Receive timestamp, microseconds since the Unix epoch.
    pub timestamp_us: i64,
}

/// How long [`MessageQueue::pop`] may wait for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopTimeout {
    /// Block until a message arrives or the queue closes.
    Never,
    /// Return immediately when the queue is empty.
    Immediate,
    /// Block for at most this long.
    After(Duration),
}

struct QueueState {
    ring: Vec<Option<SensorMessage>>,
    head: usize,
    tail: usize,
    count: usize,
    closed: bool,
}

/// Thread-safe bounded FIFO of [`SensorMessage`]s.
///
/// Invariants: `0 <= count <= capacity`, `head` and `tail` stay within
/// `[0, capacity)`, and the queue holds exactly `count` live batch handles.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl MessageQueue {
    /// Creates a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "message queue initialized");
        Self {
            state: Mutex::new(QueueState {
                ring: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking enqueue.
    ///
    /// Returns [`FusionError::QueueFull`] when `count == capacity` and
    /// [`FusionError::QueueClosed`] after [`close`]; in both cases ownership
    /// of the message stays with the caller.
    ///
    /// [`close`]: MessageQueue::close
    pub fn push(&self, msg: SensorMessage) -> Result<(), FusionError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(FusionError::QueueClosed);
        }
        if state.count == self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(sensor_id = msg.sensor_id, "queue full, dropping message");
            return Err(FusionError::QueueFull);
        }

        let head = state.head;
        state.ring[head] = Some(msg);
        state.head = (state.head + 1) % self.capacity;
        state.count += 1;
        self.pushed.fetch_add(1, Ordering::Relaxed);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocking dequeue.
    ///
    /// Waits up to `timeout` for a message. Returns
    /// [`FusionError::QueueTimeout`] when none arrives in time, and
    /// [`FusionError::QueueClosed`] once the queue is both closed and
    /// drained. On success the queue's batch handle is transferred to the
    /// caller; no extra retain happens.
    pub fn pop(&self, timeout: PopTimeout) -> Result<SensorMessage, FusionError> {
        // `None` waits forever; an already-expired deadline covers the
        // immediate case.
        let deadline = match timeout {
            PopTimeout::Never => None,
            PopTimeout::Immediate => Some(Instant::now()),
            PopTimeout::After(d) => Some(Instant::now() + d),
        };

        let mut state = self.lock_state();
        // Condvar wakeups can be spurious; the count is re-checked every
        // iteration.
        while state.count == 0 {
            if state.closed {
                return Err(FusionError::QueueClosed);
            }
            match deadline {
                None => {
                    state = self
                        .not_empty
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(FusionError::QueueTimeout);
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }

        let tail = state.tail;
        let msg = state.ring[tail].take().expect("count > 0 implies occupied slot");
        state.tail = (state.tail + 1) % self.capacity;
        state.count -= 1;

        self.not_full.notify_one();
        Ok(msg)
    }

    /// Current number of queued messages.
    pub fn size(&self) -> usize {
        self.lock_state().count
    }

    /// Closes the queue for shutdown.
    ///
    /// Wakes every blocked consumer; subsequent pushes fail with
    /// [`FusionError::QueueClosed`], and pops drain the remaining messages
    /// before reporting closed.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Messages accepted since creation.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Messages rejected with `QueueFull` since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A poisoned lock still holds a structurally consistent ring; the
        // panic happened in some other holder's code, not mid-update here.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Drop drains the ring implicitly: every remaining SensorMessage releases its
// batch handle when the Vec is dropped.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionBatch;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn msg(sensor_id: i16) -> SensorMessage {
        SensorMessage {
            sensor_id,
            batch: DetectionBatch::new().into_shared(),
            timestamp_us: 0,
        }
    }

    #[test]
    fn push_pop_fifo() {
        let q = MessageQueue::new(4);
        for i in 0..3 {
            q.push(msg(i)).unwrap();
        }
        for i in 0..3 {
            let m = q.pop(PopTimeout::Immediate).unwrap();
            assert_eq!(m.sensor_id, i);
        }
    }

    #[test]
    fn push_full_returns_without_blocking() {
        let q = MessageQueue::new(2);
        q.push(msg(0)).unwrap();
        q.push(msg(1)).unwrap();
        assert!(matches!(q.push(msg(2)), Err(FusionError::QueueFull)));
        assert_eq!(q.size(), 2);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn pop_immediate_on_empty_is_fast() {
        let q = MessageQueue::new(2);
        let start = Instant::now();
        assert!(matches!(
            q.pop(PopTimeout::Immediate),
            Err(FusionError::QueueTimeout)
        ));
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn pop_timeout_elapses() {
        let q = MessageQueue::new(2);
        let start = Instant::now();
        assert!(matches!(
            q.pop(PopTimeout::After(Duration::from_millis(20))),
            Err(FusionError::QueueTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_transfers_queue_reference() {
        let q = MessageQueue::new(2);
        let batch = DetectionBatch::new().into_shared();
        q.push(SensorMessage {
            sensor_id: 1,
            batch: Arc::clone(&batch),
            timestamp_us: 0,
        })
        .unwrap();
        // producer copy + queue copy
        assert_eq!(Arc::strong_count(&batch), 2);
        let popped = q.pop(PopTimeout::Immediate).unwrap();
        // queue copy moved to the consumer, not duplicated
        assert_eq!(Arc::strong_count(&batch), 2);
        drop(popped);
        assert_eq!(Arc::strong_count(&batch), 1);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q = Arc::new(MessageQueue::new(2));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop(PopTimeout::Never));
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(matches!(handle.join().unwrap(), Err(FusionError::QueueClosed)));
    }

    #[test]
    fn close_drains_before_reporting_closed() {
        let q = MessageQueue::new(4);
        q.push(msg(1)).unwrap();
        q.close();
        assert!(matches!(q.push(msg(2)), Err(FusionError::QueueClosed)));
        assert!(q.pop(PopTimeout::Immediate).is_ok());
        assert!(matches!(
            q.pop(PopTimeout::Immediate),
            Err(FusionError::QueueClosed)
        ));
    }

    #[test]
    fn drop_releases_queued_batches() {
        let batch = DetectionBatch::new().into_shared();
        {
            let q = MessageQueue::new(4);
            q.push(SensorMessage {
                sensor_id: 1,
                batch: Arc::clone(&batch),
                timestamp_us: 0,
            })
            .unwrap();
            assert_eq!(Arc::strong_count(&batch), 2);
        }
        assert_eq!(Arc::strong_count(&batch), 1);
    }

    #[test]
    fn concurrent_producers_consumer_accounting() {
        let q = Arc::new(MessageQueue::new(8));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut delivered = 0u64;
                loop {
                    match q.pop(PopTimeout::After(Duration::from_millis(50))) {
                        Ok(_) => delivered += 1,
                        Err(FusionError::QueueClosed) => break,
                        Err(_) => continue,
                    }
                }
                delivered
            })
        };

        let producers: Vec<_> = (0..4i16)
            .map(|s| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _ = q.push(msg(s));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        // Let the consumer drain what was accepted, then close.
        while q.size() > 0 {
            thread::sleep(Duration::from_millis(5));
        }
        q.close();
        let delivered = consumer.join().unwrap();

        assert_eq!(delivered + q.dropped(), 400);
        assert_eq!(delivered, q.pushed());
    }

    proptest! {
        /// For any interleaving of pushes and pops, the size stays within
        /// [0, capacity] and FIFO accounting balances.
        #[test]
        fn size_stays_bounded(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let q = MessageQueue::new(5);
            let mut expected = 0usize;
            for is_push in ops {
                if is_push {
                    if q.push(msg(0)).is_ok() {
                        expected += 1;
                    }
                } else if q.pop(PopTimeout::Immediate).is_ok() {
                    expected -= 1;
                }
                let size = q.size();
                prop_assert!(size <= 5);
                prop_assert_eq!(size, expected);
            }
        }
    }
}
