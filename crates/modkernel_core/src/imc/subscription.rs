//! Subscriptions and their bounded delivery queues.
//!
//! # Invariants
//! - Queue order is enqueue order; the queue never exceeds `capacity`.
//! - Once `active` is cleared no handler invocation starts.
//! - The dispatch lock is held by at most one pumping thread, so handlers of
//!   one subscription never run concurrently.
//! - A thread running any handler never waits on another dispatch lock.

use super::intern::TopicId;
use super::message::{Message, Priority};
use crate::context::ModContext;
use crate::error::{KernelError, KernelResult};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

thread_local! {
    /// Handler invocations currently running on this thread.
    static HANDLER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

fn inside_handler() -> bool {
    HANDLER_DEPTH.with(|depth| depth.get() > 0)
}

/// Opaque subscription identifier. `0` is never issued.
pub type SubscriptionId = u64;

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// What a full queue does with the next message.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BackpressurePolicy {
    /// Evict the oldest queued message to make room.
    #[default]
    DropOldest = 0,
    /// Discard the incoming message.
    DropNewest = 1,
    /// Wait for room up to the block timeout, then report `WouldBlock`.
    Block = 2,
    /// Reject the publish with `QueueFull`.
    Fail = 3,
}

impl BackpressurePolicy {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::DropOldest),
            1 => Some(Self::DropNewest),
            2 => Some(Self::Block),
            3 => Some(Self::Fail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
            Self::Block => "block",
            Self::Fail => "fail",
        }
    }
}

/// Options for `ImcBus::subscribe_ex`.
///
/// Unset capacity and block timeout fall back to the bus defaults.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub(crate) capacity: Option<usize>,
    pub(crate) policy: BackpressurePolicy,
    pub(crate) min_priority: Priority,
    pub(crate) filter: Option<MessageFilter>,
    pub(crate) block_timeout: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            capacity: None,
            policy: BackpressurePolicy::default(),
            min_priority: Priority::Low,
            filter: None,
            block_timeout: None,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Messages below `priority` are skipped before the filter runs.
    pub fn with_min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = priority;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn min_priority(&self) -> Priority {
        self.min_priority
    }
}

/// Result of offering one message to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// Queued after evicting the oldest entry.
    EvictedOldest,
    /// Discarded by drop-newest.
    DroppedNewest,
    /// The subscription went inactive while the publisher waited.
    Closed,
}

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub topic: TopicId,
    pub owner: ModContext,
    handler: MessageHandler,
    filter: Option<MessageFilter>,
    min_priority: Priority,
    policy: BackpressurePolicy,
    capacity: usize,
    block_timeout: Duration,
    queue: Mutex<VecDeque<Message>>,
    space: Condvar,
    active: AtomicBool,
    dispatch: Mutex<()>,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        topic: TopicId,
        owner: ModContext,
        handler: MessageHandler,
        options: SubscribeOptions,
        default_capacity: usize,
        default_block_timeout: Duration,
    ) -> KernelResult<Self> {
        let capacity = options.capacity.unwrap_or(default_capacity);
        if capacity == 0 {
            return Err(KernelError::InvalidArgument(
                "subscription capacity must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            id,
            topic,
            owner,
            handler,
            filter: options.filter,
            min_priority: options.min_priority,
            policy: options.policy,
            capacity,
            block_timeout: options.block_timeout.unwrap_or(default_block_timeout),
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            space: Condvar::new(),
            active: AtomicBool::new(true),
            dispatch: Mutex::new(()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Priority floor first, then the custom predicate. Runs without locks.
    pub fn accepts(&self, message: &Message) -> bool {
        if message.priority() < self.min_priority {
            return false;
        }
        match &self.filter {
            Some(filter) => filter(message),
            None => true,
        }
    }

    /// Offers one message according to the backpressure policy.
    ///
    /// Evicted or rejected messages are dropped after the queue lock is
    /// released, since dropping the last copy may run a buffer cleanup.
    pub fn enqueue(&self, message: Message) -> KernelResult<Enqueued> {
        let (outcome, leftover) = self.offer(message);
        drop(leftover);
        outcome
    }

    fn offer(&self, message: Message) -> (KernelResult<Enqueued>, Option<Message>) {
        let mut queue = self.queue.lock();
        if !self.is_active() {
            return (Ok(Enqueued::Closed), Some(message));
        }
        if queue.len() < self.capacity {
            queue.push_back(message);
            return (Ok(Enqueued::Queued), None);
        }

        match self.policy {
            BackpressurePolicy::DropOldest => {
                let evicted = queue.pop_front();
                queue.push_back(message);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                (Ok(Enqueued::EvictedOldest), evicted)
            }
            BackpressurePolicy::DropNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                (Ok(Enqueued::DroppedNewest), Some(message))
            }
            BackpressurePolicy::Fail => (
                Err(KernelError::QueueFull {
                    subscription: self.id,
                }),
                Some(message),
            ),
            BackpressurePolicy::Block => {
                let deadline = Instant::now() + self.block_timeout;
                while queue.len() >= self.capacity && self.is_active() {
                    if self.space.wait_until(&mut queue, deadline).timed_out()
                        && queue.len() >= self.capacity
                    {
                        let err = KernelError::WouldBlock(format!(
                            "subscription {} queue stayed full for {} ms",
                            self.id,
                            self.block_timeout.as_millis()
                        ));
                        return (Err(err), Some(message));
                    }
                }
                if !self.is_active() {
                    return (Ok(Enqueued::Closed), Some(message));
                }
                queue.push_back(message);
                (Ok(Enqueued::Queued), None)
            }
        }
    }

    fn pop(&self) -> Option<Message> {
        let message = self.queue.lock().pop_front();
        if message.is_some() {
            self.space.notify_one();
        }
        message
    }

    /// Delivers up to `max` queued messages. `0` drains what is queued now.
    ///
    /// Returns `None` when another thread is already dispatching.
    pub fn dispatch(&self, max: usize) -> Option<DispatchReport> {
        let _dispatch = self.dispatch.try_lock()?;
        let limit = if max == 0 { self.queue_len() } else { max };
        let mut report = DispatchReport::default();

        for _ in 0..limit {
            if !self.is_active() {
                break;
            }
            let Some(message) = self.pop() else {
                break;
            };
            let handler = Arc::clone(&self.handler);
            HANDLER_DEPTH.with(|depth| depth.set(depth.get() + 1));
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&message)));
            HANDLER_DEPTH.with(|depth| depth.set(depth.get() - 1));
            if outcome.is_err() {
                report.panicked += 1;
            }
            report.delivered += 1;
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Some(report)
    }

    /// Stops delivery and drops everything still queued.
    ///
    /// Waits for an in-flight handler unless called from inside any
    /// handler. Two handlers unsubscribing each other on different threads
    /// would otherwise wait on each other forever; skipping the wait is safe
    /// because the running invocation is the last one.
    pub fn deactivate(&self) -> usize {
        {
            let _queue = self.queue.lock();
            self.active.store(false, Ordering::Release);
        }
        self.space.notify_all();

        if !inside_handler() {
            drop(self.dispatch.lock());
        }

        let discarded: Vec<Message> = self.queue.lock().drain(..).collect();
        discarded.len()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchReport {
    pub delivered: usize,
    pub panicked: usize,
}

#[cfg(test)]
mod tests {
    use super::{BackpressurePolicy, Enqueued, SubscribeOptions, Subscription};
    use crate::context::ModContext;
    use crate::error::KernelError;
    use crate::imc::message::{Message, MessageMetadata, Payload, Priority};
    use crate::resource::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn owner() -> ModContext {
        ModContext::new(
            Handle {
                type_id: 1,
                generation: 1,
                slot: 0,
            },
            "tester",
        )
    }

    fn message(sequence: u64, priority: Priority) -> Message {
        Message {
            topic: 1,
            sender: owner(),
            sequence,
            metadata: MessageMetadata::with_priority(priority),
            payload: Payload::copy_from(&sequence.to_le_bytes()),
        }
    }

    fn subscription(options: SubscribeOptions, seen: Arc<AtomicUsize>) -> Subscription {
        Subscription::new(
            7,
            1,
            owner(),
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            options,
            256,
            Duration::from_millis(20),
        )
        .expect("valid subscription")
    }

    #[test]
    fn drop_oldest_keeps_most_recent_messages() {
        let sub = subscription(
            SubscribeOptions::new().with_capacity(2),
            Arc::new(AtomicUsize::new(0)),
        );
        for sequence in 0..3 {
            sub.enqueue(message(sequence, Priority::Normal))
                .expect("enqueue");
        }
        assert_eq!(sub.queue_len(), 2);
        assert_eq!(sub.pop().map(|m| m.sequence), Some(1));
        assert_eq!(sub.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fail_and_block_policies_report_full_queue() {
        let seen = Arc::new(AtomicUsize::new(0));
        let fail = subscription(
            SubscribeOptions::new()
                .with_capacity(1)
                .with_policy(BackpressurePolicy::Fail),
            Arc::clone(&seen),
        );
        fail.enqueue(message(0, Priority::Normal)).expect("first");
        assert!(matches!(
            fail.enqueue(message(1, Priority::Normal)),
            Err(KernelError::QueueFull { subscription: 7 })
        ));

        let block = subscription(
            SubscribeOptions::new()
                .with_capacity(1)
                .with_policy(BackpressurePolicy::Block)
                .with_block_timeout(Duration::from_millis(5)),
            seen,
        );
        block.enqueue(message(0, Priority::Normal)).expect("first");
        assert!(matches!(
            block.enqueue(message(1, Priority::Normal)),
            Err(KernelError::WouldBlock(_))
        ));
    }

    #[test]
    fn priority_floor_runs_before_filter() {
        let filter_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&filter_calls);
        let sub = subscription(
            SubscribeOptions::new()
                .with_min_priority(Priority::High)
                .with_filter(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            Arc::new(AtomicUsize::new(0)),
        );

        assert!(!sub.accepts(&message(0, Priority::Normal)));
        assert_eq!(filter_calls.load(Ordering::SeqCst), 0);
        assert!(sub.accepts(&message(1, Priority::Critical)));
        assert_eq!(filter_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deactivated_subscription_delivers_nothing() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = subscription(SubscribeOptions::new(), Arc::clone(&seen));
        sub.enqueue(message(0, Priority::Normal)).expect("enqueue");

        assert_eq!(sub.deactivate(), 1);
        assert_eq!(
            sub.enqueue(message(1, Priority::Normal)).expect("closed"),
            Enqueued::Closed
        );
        let report = sub.dispatch(0).expect("dispatch lock free");
        assert_eq!(report.delivered, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = Subscription::new(
            1,
            1,
            owner(),
            Arc::new(|_| {}),
            SubscribeOptions::new().with_capacity(0),
            256,
            Duration::from_millis(1),
        );
        assert!(matches!(result, Err(KernelError::InvalidArgument(_))));
    }
}
