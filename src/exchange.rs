//! Hand-off of sealed batches from the acquisition thread to the consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::batch::EventBatch;
use crate::config::Backpressure;

/// Upper bound on a single condition-variable wait. Waiters re-check the
/// thread state after each slice, so a missed wake-up costs at most this long.
const WAIT_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Idle = 0,
    Running = 1,
    Exited = 2,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> Self {
        match value {
            0 => ThreadState::Idle,
            1 => ThreadState::Running,
            _ => ThreadState::Exited,
        }
    }
}

/// Shared `Idle → Running → Exited` flag of the acquisition thread.
#[derive(Debug, Clone)]
pub struct StateFlag(Arc<AtomicU8>);

impl Default for StateFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ThreadState::Idle as u8)))
    }

    pub fn get(&self) -> ThreadState {
        ThreadState::from(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ThreadState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; returns `false` if the state was something else.
    pub fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.get() == ThreadState::Running
    }

    pub fn is_exited(&self) -> bool {
        self.get() == ThreadState::Exited
    }
}

/// Callbacks from the acquisition pipeline.
///
/// `batch_available` fires when the queue goes from empty to non-empty and
/// `queue_emptied` when it goes back to empty, never twice for the same
/// transition. The two alternate, and the last one delivered always matches
/// the queue as it is now. `shutdown` fires once if the acquisition thread dies
/// on a transport error. All of them run on whichever thread caused the event
/// and outside the queue lock, but queue callbacks are serialized: they must
/// not push to or pop from the queue themselves.
pub trait AcquisitionObserver: Send + Sync {
    fn batch_available(&self) {}
    fn queue_emptied(&self) {}
    fn shutdown(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AcquisitionObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest batch.
    ReplacedOldest,
    /// Queue full, the pushed batch was discarded.
    Dropped,
    /// The acquisition thread has exited; nothing was queued.
    Closed,
}

/// Bounded FIFO between the acquisition thread and the consumer.
pub struct DataExchange {
    queue: Mutex<VecDeque<EventBatch>>,
    space: Condvar,
    data: Condvar,
    capacity: usize,
    policy: Backpressure,
    state: StateFlag,
    observer: Arc<dyn AcquisitionObserver>,
    /// Whether the observer was last told that data is available.
    announced: Mutex<bool>,
}

impl DataExchange {
    pub fn new(
        capacity: usize,
        policy: Backpressure,
        state: StateFlag,
        observer: Arc<dyn AcquisitionObserver>,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            data: Condvar::new(),
            capacity,
            policy,
            state,
            observer,
            announced: Mutex::new(false),
        }
    }

    /// Tell the observer about an empty/non-empty change it has not seen yet.
    ///
    /// Holding `announced` across the check and the callback keeps callbacks
    /// from two threads from overtaking each other.
    fn announce(&self) {
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        let available = !self.lock().is_empty();
        if available == *announced {
            return;
        }
        *announced = available;
        if available {
            self.observer.batch_available();
        } else {
            self.observer.queue_emptied();
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EventBatch>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue a batch according to the configured backpressure policy.
    pub fn push(&self, batch: EventBatch) -> PushOutcome {
        self.push_with(batch, self.policy)
    }

    /// Queue a batch, waiting for room regardless of policy.
    pub fn push_blocking(&self, batch: EventBatch) -> PushOutcome {
        self.push_with(batch, Backpressure::Block)
    }

    fn push_with(&self, batch: EventBatch, policy: Backpressure) -> PushOutcome {
        let mut queue = self.lock();
        let outcome = loop {
            if self.state.is_exited() {
                return PushOutcome::Closed;
            }
            if queue.len() < self.capacity {
                queue.push_back(batch);
                break PushOutcome::Queued;
            }
            match policy {
                Backpressure::Block => {
                    queue = self
                        .space
                        .wait_timeout(queue, WAIT_SLICE)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Backpressure::DropOldest => {
                    queue.pop_front();
                    queue.push_back(batch);
                    break PushOutcome::ReplacedOldest;
                }
                Backpressure::DropNewest => return PushOutcome::Dropped,
            }
        };

        drop(queue);
        self.data.notify_one();
        self.announce();
        outcome
    }

    /// Take the oldest batch without waiting.
    pub fn pop(&self) -> Option<EventBatch> {
        let mut queue = self.lock();
        let batch = queue.pop_front()?;
        drop(queue);
        self.space.notify_one();
        self.announce();
        Some(batch)
    }

    /// Wait for a batch for as long as the acquisition thread is running.
    ///
    /// Returns `None` once the queue is empty and the thread is no longer
    /// running.
    pub fn pop_blocking(&self) -> Option<EventBatch> {
        loop {
            if let Some(batch) = self.pop() {
                return Some(batch);
            }
            if !self.state.is_running() {
                return None;
            }
            let queue = self.lock();
            if queue.is_empty() && self.state.is_running() {
                drop(
                    self.data
                        .wait_timeout(queue, WAIT_SLICE)
                        .unwrap_or_else(PoisonError::into_inner),
                );
            }
        }
    }

    /// Release every waiter so it can observe a state change.
    pub fn wake_all(&self) {
        self.space.notify_all();
        self.data.notify_all();
    }

    /// Drop all queued batches, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        drop(queue);
        self.space.notify_all();
        self.announce();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PixelEvent;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Counting {
        available: AtomicUsize,
        emptied: AtomicUsize,
    }

    impl AcquisitionObserver for Counting {
        fn batch_available(&self) {
            self.available.fetch_add(1, Ordering::SeqCst);
        }

        fn queue_emptied(&self) {
            self.emptied.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn batch(tag: u32) -> EventBatch {
        let pixel = PixelEvent {
            timestamp: tag,
            x: 0,
            y: 0,
            polarity: true,
        };
        EventBatch::seal(0, 0, false, Some(vec![pixel]), None)
    }

    fn running() -> StateFlag {
        let state = StateFlag::new();
        assert!(state.transition(ThreadState::Idle, ThreadState::Running));
        state
    }

    #[test]
    fn exited_is_not_revived() {
        let state = StateFlag::new();
        state.set(ThreadState::Exited);
        assert!(!state.transition(ThreadState::Idle, ThreadState::Running));
        assert!(state.is_exited());
    }

    fn tags(exchange: &DataExchange) -> Vec<u32> {
        std::iter::from_fn(|| exchange.pop())
            .map(|b| b.lowest_timestamp())
            .collect()
    }

    #[test]
    fn fifo_order() {
        let exchange = DataExchange::new(8, Backpressure::Block, running(), Arc::new(NoopObserver));
        for i in 0..5 {
            assert_eq!(exchange.push(batch(i)), PushOutcome::Queued);
        }
        assert_eq!(tags(&exchange), vec![0, 1, 2, 3, 4]);
        assert!(exchange.pop().is_none());
    }

    #[test]
    fn notifications_fire_once_per_transition() {
        let observer = Arc::new(Counting::default());
        let exchange = DataExchange::new(8, Backpressure::Block, running(), observer.clone());

        exchange.push(batch(0));
        exchange.push(batch(1));
        assert_eq!(observer.available.load(Ordering::SeqCst), 1);

        exchange.pop();
        assert_eq!(observer.emptied.load(Ordering::SeqCst), 0);
        exchange.pop();
        assert_eq!(observer.emptied.load(Ordering::SeqCst), 1);
        exchange.pop();
        assert_eq!(observer.emptied.load(Ordering::SeqCst), 1);

        exchange.push(batch(2));
        assert_eq!(observer.available.load(Ordering::SeqCst), 2);
    }

    /// Records callbacks in order; `queue_emptied` takes a while to return.
    #[derive(Default)]
    struct SlowEmptied {
        calls: Mutex<Vec<&'static str>>,
    }

    impl AcquisitionObserver for SlowEmptied {
        fn batch_available(&self) {
            self.calls.lock().unwrap().push("available");
        }

        fn queue_emptied(&self) {
            thread::sleep(Duration::from_millis(50));
            self.calls.lock().unwrap().push("emptied");
        }
    }

    #[test]
    fn last_notification_matches_queue_state() {
        let observer = Arc::new(SlowEmptied::default());
        let exchange = Arc::new(DataExchange::new(
            4,
            Backpressure::Block,
            running(),
            observer.clone(),
        ));
        exchange.push(batch(0));

        let consumer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || exchange.pop().is_some())
        };
        thread::sleep(Duration::from_millis(10));
        exchange.push(batch(1));
        assert!(consumer.join().unwrap());

        let calls = observer.calls.lock().unwrap().clone();
        assert_eq!(exchange.len(), 1);
        assert_eq!(calls.last(), Some(&"available"));
        assert!(calls.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let exchange =
            DataExchange::new(2, Backpressure::DropOldest, running(), Arc::new(NoopObserver));
        exchange.push(batch(0));
        exchange.push(batch(1));
        assert_eq!(exchange.push(batch(2)), PushOutcome::ReplacedOldest);
        assert_eq!(tags(&exchange), vec![1, 2]);
    }

    #[test]
    fn drop_newest_keeps_oldest() {
        let exchange =
            DataExchange::new(2, Backpressure::DropNewest, running(), Arc::new(NoopObserver));
        exchange.push(batch(0));
        exchange.push(batch(1));
        assert_eq!(exchange.push(batch(2)), PushOutcome::Dropped);
        assert_eq!(tags(&exchange), vec![0, 1]);
    }

    #[test]
    fn forced_push_waits_even_when_dropping() {
        let exchange = Arc::new(DataExchange::new(
            1,
            Backpressure::DropNewest,
            running(),
            Arc::new(NoopObserver),
        ));
        exchange.push(batch(0));

        let producer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || exchange.push_blocking(batch(1)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(exchange.pop().map(|b| b.lowest_timestamp()), Some(0));
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(tags(&exchange), vec![1]);
    }

    #[test]
    fn blocked_producer_released_on_exit() {
        let state = running();
        let exchange = Arc::new(DataExchange::new(
            1,
            Backpressure::Block,
            state.clone(),
            Arc::new(NoopObserver),
        ));
        exchange.push(batch(0));

        let producer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || exchange.push(batch(1)))
        };
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        state.set(ThreadState::Exited);
        exchange.wake_all();
        assert_eq!(producer.join().unwrap(), PushOutcome::Closed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn blocking_pop_sees_data_and_exit() {
        let state = running();
        let exchange = Arc::new(DataExchange::new(
            4,
            Backpressure::Block,
            state.clone(),
            Arc::new(NoopObserver),
        ));

        let consumer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || {
                let first = exchange.pop_blocking().map(|b| b.lowest_timestamp());
                let second = exchange.pop_blocking();
                (first, second.is_none())
            })
        };

        thread::sleep(Duration::from_millis(10));
        exchange.push(batch(7));
        thread::sleep(Duration::from_millis(10));
        state.set(ThreadState::Exited);
        exchange.wake_all();

        assert_eq!(consumer.join().unwrap(), (Some(7), true));
    }

    #[test]
    fn interleaved_producer_consumer_keeps_order() {
        let exchange = Arc::new(DataExchange::new(
            3,
            Backpressure::Block,
            running(),
            Arc::new(NoopObserver),
        ));
        let producer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || {
                for i in 0..200 {
                    assert_eq!(exchange.push(batch(i)), PushOutcome::Queued);
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 200 {
            match exchange.pop() {
                Some(b) => seen.push(b.lowest_timestamp()),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<u32>>());
    }

    #[test]
    fn clear_reports_count() {
        let observer = Arc::new(Counting::default());
        let exchange = DataExchange::new(4, Backpressure::Block, running(), observer.clone());
        exchange.push(batch(0));
        exchange.push(batch(1));
        assert_eq!(exchange.clear(), 2);
        assert!(exchange.is_empty());
        assert_eq!(exchange.clear(), 0);
        assert_eq!(observer.emptied.load(Ordering::SeqCst), 1);
    }
}
