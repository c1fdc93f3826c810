//! Hand-off between producers and the forwarder.
//!
//! The queue is a multi-producer, single-consumer FIFO built on top of `crossbeam-channel`. Producers push through a
//! shared [`DeliveryQueue`], while the forwarder thread owns the only [`QueueConsumer`].
//!
//! Shutdown is signalled by dropping the queue's sender: records that were already queued remain poppable, and the
//! consumer only observes [`Popped::Shutdown`] once the queue is both closed and empty.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use parking_lot::RwLock;
use thiserror::Error;

use crate::record::MetricRecord;

// How long a producer blocked on a full queue waits before checking for shutdown again.
const BLOCKED_PUSH_RECHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Behavior when pushing to a full queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until there is space in the queue.
    ///
    /// This applies backpressure to application threads, and so should only be used when losing metrics is worse than
    /// slowing down the caller.
    Block,

    /// Drop the record being pushed.
    #[default]
    DropNewest,

    /// Evict the oldest queued record to make room for the record being pushed.
    DropOldest,
}

/// The queue has been shut down and no longer accepts records.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("delivery queue is closed")]
pub struct QueueClosed;

/// Outcome of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The record was queued.
    Enqueued,

    /// The queue was full and the record was dropped.
    DroppedNewest,

    /// The record was queued after evicting the given number of older records.
    EvictedOldest(usize),
}

/// Result of popping from the queue.
#[derive(Debug, PartialEq)]
pub enum Popped {
    /// A record was available.
    Record(MetricRecord),

    /// No record became available before the deadline, or right away for non-blocking pops.
    Empty,

    /// The queue was shut down and every queued record has been consumed.
    Shutdown,
}

struct Shared {
    closed: AtomicBool,
    consumer_dropped: AtomicBool,
}

/// Producer side of the delivery queue.
pub struct DeliveryQueue {
    tx: RwLock<Option<Sender<MetricRecord>>>,
    // Only held for `DropOldest`, so producers can evict from the head of the queue.
    evictor: Option<Receiver<MetricRecord>>,
    policy: OverflowPolicy,
    shared: Arc<Shared>,
}

/// Consumer side of the delivery queue.
pub struct QueueConsumer {
    rx: Receiver<MetricRecord>,
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    /// Creates a new queue, returning both of its ends.
    ///
    /// When `capacity` is `None`, the queue is unbounded and `policy` has no effect.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is `Some(0)`.
    pub fn new(capacity: Option<usize>, policy: OverflowPolicy) -> (Self, QueueConsumer) {
        assert!(capacity != Some(0), "queue capacity must be greater than zero");

        let (tx, rx) = match capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };

        let evictor = match (capacity, policy) {
            (Some(_), OverflowPolicy::DropOldest) => Some(rx.clone()),
            _ => None,
        };

        let shared = Arc::new(Shared { closed: AtomicBool::new(false), consumer_dropped: AtomicBool::new(false) });
        let queue = DeliveryQueue { tx: RwLock::new(Some(tx)), evictor, policy, shared: Arc::clone(&shared) };

        (queue, QueueConsumer { rx, shared })
    }

    /// Pushes a record onto the queue.
    ///
    /// If the queue is full, the configured [`OverflowPolicy`] decides what happens.
    ///
    /// # Errors
    ///
    /// If the queue has been shut down, or its consumer is gone, the record is not queued and [`QueueClosed`] is
    /// returned. This includes producers that were blocked on a full queue when shutdown was signalled.
    pub fn push(&self, record: MetricRecord) -> Result<PushOutcome, QueueClosed> {
        if self.is_closed() || self.shared.consumer_dropped.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }

        // Holding the read guard for the duration of the push means `signal_shutdown` cannot drop the sender out from
        // under us, so any push that returns `Ok` is guaranteed to be visible to the consumer.
        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(QueueClosed)?;

        match self.policy {
            OverflowPolicy::Block => {
                // Wait in short slices so that a shutdown is never held up by a full queue.
                let mut record = record;
                loop {
                    match tx.send_timeout(record, BLOCKED_PUSH_RECHECK_INTERVAL) {
                        Ok(()) => return Ok(PushOutcome::Enqueued),
                        Err(SendTimeoutError::Timeout(returned)) => {
                            if self.is_closed() {
                                return Err(QueueClosed);
                            }
                            record = returned;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => return Err(QueueClosed),
                    }
                }
            }
            OverflowPolicy::DropNewest => match tx.try_send(record) {
                Ok(()) => Ok(PushOutcome::Enqueued),
                Err(TrySendError::Full(_)) => Ok(PushOutcome::DroppedNewest),
                Err(TrySendError::Disconnected(_)) => Err(QueueClosed),
            },
            OverflowPolicy::DropOldest => {
                let mut record = record;
                let mut evicted = 0;
                loop {
                    match tx.try_send(record) {
                        Ok(()) if evicted == 0 => return Ok(PushOutcome::Enqueued),
                        Ok(()) => return Ok(PushOutcome::EvictedOldest(evicted)),
                        Err(TrySendError::Full(returned)) => {
                            // The evictor keeps the channel connected, so a consumer that has gone away has to be
                            // noticed here instead.
                            if self.shared.consumer_dropped.load(Ordering::Acquire) {
                                return Err(QueueClosed);
                            }
                            record = returned;
                            if let Some(evictor) = &self.evictor {
                                if evictor.try_recv().is_ok() {
                                    evicted += 1;
                                }
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(QueueClosed),
                    }
                }
            }
        }
    }

    /// Signals shutdown.
    ///
    /// Subsequent pushes fail with [`QueueClosed`], while records that were already queued remain available to the
    /// consumer. Calling this more than once has no additional effect.
    ///
    /// Producers blocked on a full queue with [`OverflowPolicy::Block`] give up with [`QueueClosed`] shortly after.
    pub fn signal_shutdown(&self) {
        // Flip the flag first so that new pushes fail fast, even while we wait for in-flight pushes to finish.
        self.shared.closed.store(true, Ordering::Release);
        drop(self.tx.write().take());
    }

    /// Returns `true` if the queue has been shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl QueueConsumer {
    /// Pops the next record, blocking until one is available or the queue is shut down and empty.
    pub fn pop(&self) -> Popped {
        match self.rx.recv() {
            Ok(record) => Popped::Record(record),
            Err(_) => Popped::Shutdown,
        }
    }

    /// Pops the next record, blocking until one is available, the deadline passes, or the queue is shut down and
    /// empty.
    pub fn pop_deadline(&self, deadline: Instant) -> Popped {
        match self.rx.recv_deadline(deadline) {
            Ok(record) => Popped::Record(record),
            Err(RecvTimeoutError::Timeout) => Popped::Empty,
            Err(RecvTimeoutError::Disconnected) => Popped::Shutdown,
        }
    }

    /// Pops the next record if one is immediately available.
    pub fn try_pop(&self) -> Popped {
        match self.rx.try_recv() {
            Ok(record) => Popped::Record(record),
            Err(TryRecvError::Empty) => Popped::Empty,
            Err(TryRecvError::Disconnected) => Popped::Shutdown,
        }
    }

    /// Returns `true` if shutdown has been signalled, even if records remain queued.
    pub fn is_shutdown_signalled(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Returns the number of queued records.
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.shared.consumer_dropped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::{DeliveryQueue, OverflowPolicy, Popped, PushOutcome, QueueClosed};
    use crate::record::MetricRecord;

    fn record(n: i64) -> MetricRecord {
        MetricRecord::counter("queue.test", n).unwrap()
    }

    fn drain(consumer: &super::QueueConsumer) -> Vec<i64> {
        let mut values = Vec::new();
        while let Popped::Record(record) = consumer.try_pop() {
            match record.value() {
                crate::record::Value::Integer(v) => values.push(v),
                crate::record::Value::Float(_) => unreachable!(),
            }
        }
        values
    }

    #[test]
    fn fifo_order() {
        let (queue, consumer) = DeliveryQueue::new(None, OverflowPolicy::DropNewest);
        for i in 0..100 {
            assert_eq!(queue.push(record(i)), Ok(PushOutcome::Enqueued));
        }

        assert_eq!(drain(&consumer), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn drop_newest_when_full() {
        let (queue, consumer) = DeliveryQueue::new(Some(3), OverflowPolicy::DropNewest);
        for i in 0..3 {
            assert_eq!(queue.push(record(i)), Ok(PushOutcome::Enqueued));
        }
        assert_eq!(queue.push(record(3)), Ok(PushOutcome::DroppedNewest));

        assert_eq!(drain(&consumer), vec![0, 1, 2]);
    }

    #[test]
    fn drop_oldest_when_full() {
        let (queue, consumer) = DeliveryQueue::new(Some(3), OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(queue.push(record(i)), Ok(PushOutcome::Enqueued));
        }
        assert_eq!(queue.push(record(3)), Ok(PushOutcome::EvictedOldest(1)));

        assert_eq!(drain(&consumer), vec![1, 2, 3]);
    }

    #[test]
    fn block_when_full() {
        let (queue, consumer) = DeliveryQueue::new(Some(1), OverflowPolicy::Block);
        let queue = Arc::new(queue);
        assert_eq!(queue.push(record(0)), Ok(PushOutcome::Enqueued));

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                let outcome = queue.push(record(1));
                pushed.store(true, Ordering::SeqCst);
                outcome
            })
        };

        // The producer can't make progress until we make room.
        thread::sleep(Duration::from_millis(100));
        assert!(!pushed.load(Ordering::SeqCst));

        assert_eq!(consumer.pop(), Popped::Record(record(0)));
        assert_eq!(producer.join().unwrap(), Ok(PushOutcome::Enqueued));
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(consumer.pop(), Popped::Record(record(1)));
    }

    #[test]
    fn shutdown_releases_blocked_producer() {
        let (queue, consumer) = DeliveryQueue::new(Some(1), OverflowPolicy::Block);
        let queue = Arc::new(queue);
        assert_eq!(queue.push(record(0)), Ok(PushOutcome::Enqueued));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(record(1)))
        };
        thread::sleep(Duration::from_millis(50));

        // Nothing is popping, so the producer only gets out because of the shutdown.
        let started = Instant::now();
        queue.signal_shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(producer.join().unwrap(), Err(QueueClosed));

        assert_eq!(consumer.pop(), Popped::Record(record(0)));
        assert_eq!(consumer.pop(), Popped::Shutdown);
    }

    #[test]
    fn push_fails_once_consumer_is_gone() {
        for policy in [OverflowPolicy::Block, OverflowPolicy::DropNewest, OverflowPolicy::DropOldest] {
            let (queue, consumer) = DeliveryQueue::new(Some(2), policy);
            queue.push(record(0)).unwrap();
            queue.push(record(1)).unwrap();
            drop(consumer);

            assert_eq!(queue.push(record(2)), Err(QueueClosed), "{:?} accepted a record", policy);
        }
    }

    #[test]
    fn shutdown_drains_then_signals() {
        let (queue, consumer) = DeliveryQueue::new(Some(8), OverflowPolicy::DropNewest);
        queue.push(record(1)).unwrap();
        queue.push(record(2)).unwrap();

        queue.signal_shutdown();
        assert!(queue.is_closed());
        assert!(consumer.is_shutdown_signalled());
        assert_eq!(queue.push(record(3)), Err(QueueClosed));

        assert_eq!(consumer.pop(), Popped::Record(record(1)));
        assert_eq!(consumer.pop(), Popped::Record(record(2)));
        assert_eq!(consumer.pop(), Popped::Shutdown);
        assert_eq!(consumer.try_pop(), Popped::Shutdown);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (queue, consumer) = DeliveryQueue::new(None, OverflowPolicy::DropNewest);
        queue.signal_shutdown();
        queue.signal_shutdown();

        assert_eq!(queue.push(record(1)), Err(QueueClosed));
        assert_eq!(consumer.pop(), Popped::Shutdown);
    }

    #[test]
    fn pop_deadline_times_out() {
        let (queue, consumer) = DeliveryQueue::new(None, OverflowPolicy::DropNewest);

        let started = Instant::now();
        assert_eq!(consumer.pop_deadline(started + Duration::from_millis(20)), Popped::Empty);
        assert!(started.elapsed() >= Duration::from_millis(20));

        queue.push(record(7)).unwrap();
        assert_eq!(consumer.pop_deadline(Instant::now() + Duration::from_secs(1)), Popped::Record(record(7)));
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let (queue, consumer) = DeliveryQueue::new(None, OverflowPolicy::DropNewest);
        let queue = Arc::new(queue);

        let producers = (0..4)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..500 {
                        queue.push(record(producer * 1_000 + i)).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for producer in producers {
            producer.join().unwrap();
        }

        let values = drain(&consumer);
        assert_eq!(values.len(), 2_000);
        for producer in 0..4 {
            let theirs = values.iter().copied().filter(|v| v / 1_000 == producer).collect::<Vec<_>>();
            let expected = (0..500).map(|i| producer * 1_000 + i).collect::<Vec<_>>();
            assert_eq!(theirs, expected);
        }
    }
}
