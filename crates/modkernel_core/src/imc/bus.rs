//! The inter-mod communication bus.
//!
//! # Responsibility
//! - Intern topic and RPC names into stable non-zero ids.
//! - Fan published messages out to per-subscription bounded queues.
//! - Run subscriber handlers and deferred RPC calls from `pump`.
//!
//! # Invariants
//! - For one subscription, delivery order equals the order in which publish
//!   calls enqueued into it.
//! - The subscription table lock is never held while a filter, handler,
//!   buffer cleanup or RPC handler runs.
//! - After `unsubscribe` returns, no handler invocation for that
//!   subscription starts.

use super::future::RpcFuture;
use super::intern::{NameTable, RpcId, TopicId};
use super::message::{BufferCleanup, Message, MessageMetadata, Payload};
use super::rpc::{CallOptions, RpcHandler, RpcRequest, RpcTable};
use super::stats::{BusCounters, ImcStats};
use super::subscription::{
    Enqueued, MessageHandler, SubscribeOptions, Subscription, SubscriptionId,
};
use crate::context::ModContext;
use crate::error::{KernelError, KernelResult};
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SubscriptionTable {
    by_id: BTreeMap<SubscriptionId, Arc<Subscription>>,
    by_topic: HashMap<TopicId, Vec<Arc<Subscription>>>,
}

struct BusInner {
    topics: NameTable,
    rpc_names: NameTable,
    subscriptions: RwLock<SubscriptionTable>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    rpcs: RpcTable,
    counters: BusCounters,
    default_capacity: usize,
    default_block_timeout: Duration,
}

/// Thread-safe publish/subscribe and RPC bus. Clones share one bus.
#[derive(Clone)]
pub struct ImcBus {
    inner: Arc<BusInner>,
}

impl Default for ImcBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_BLOCK_TIMEOUT)
    }
}

impl ImcBus {
    /// Creates a bus whose subscriptions default to `default_capacity`
    /// queued messages and `default_block_timeout` for the block policy.
    pub fn new(default_capacity: usize, default_block_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: NameTable::new("topic"),
                rpc_names: NameTable::new("rpc"),
                subscriptions: RwLock::new(SubscriptionTable::default()),
                next_subscription: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                rpcs: RpcTable::default(),
                counters: BusCounters::default(),
                default_capacity: default_capacity.max(1),
                default_block_timeout,
            }),
        }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Interns a topic name. The same name always yields the same id.
    pub fn get_topic_id(&self, name: &str) -> KernelResult<TopicId> {
        self.inner.topics.intern(name)
    }

    pub fn get_rpc_id(&self, name: &str) -> KernelResult<RpcId> {
        self.inner.rpc_names.intern(name)
    }

    /// Looks up a topic id without interning the name.
    pub fn find_topic_id(&self, name: &str) -> Option<TopicId> {
        self.inner.topics.lookup(name)
    }

    pub fn find_rpc_id(&self, name: &str) -> Option<RpcId> {
        self.inner.rpc_names.lookup(name)
    }

    pub fn topic_name(&self, topic: TopicId) -> Option<String> {
        self.inner.topics.name(topic)
    }

    pub fn rpc_name(&self, rpc: RpcId) -> Option<String> {
        self.inner.rpc_names.name(rpc)
    }

    /// Copies `data` and enqueues it to every matching subscription.
    ///
    /// Returns how many subscriptions queued the message. When a queue
    /// rejects it (fail or block policy) the remaining subscriptions still
    /// receive it and the first rejection is returned.
    pub fn publish(
        &self,
        sender: &ModContext,
        topic: TopicId,
        data: &[u8],
        metadata: Option<MessageMetadata>,
    ) -> KernelResult<usize> {
        self.inner.topics.check(topic)?;
        self.publish_payload(sender, topic, Payload::copy_from(data), metadata)
    }

    /// Publishes `buffer` without copying. `cleanup` runs once, after every
    /// subscriber has consumed or dropped its copy (immediately when no
    /// subscription takes it).
    pub fn publish_buffer<B>(
        &self,
        sender: &ModContext,
        topic: TopicId,
        buffer: B,
        cleanup: Option<BufferCleanup>,
        metadata: Option<MessageMetadata>,
    ) -> KernelResult<usize>
    where
        B: AsRef<[u8]> + Send + Sync + 'static,
    {
        let payload = Payload::wrap(buffer, cleanup);
        self.inner.topics.check(topic)?;
        self.publish_payload(sender, topic, payload, metadata)
    }

    fn publish_payload(
        &self,
        sender: &ModContext,
        topic: TopicId,
        payload: Payload,
        metadata: Option<MessageMetadata>,
    ) -> KernelResult<usize> {
        let targets = self.topic_subscriptions(topic);
        let message = Message {
            topic,
            sender: sender.clone(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            metadata: metadata.unwrap_or_default(),
            payload,
        };
        let counters = &self.inner.counters;
        counters.record_topic(topic);
        BusCounters::add(&counters.published, 1);

        let mut queued = 0;
        let mut first_error = None;
        for subscription in targets {
            if !subscription.accepts(&message) {
                BusCounters::add(&counters.filtered, 1);
                continue;
            }
            match subscription.enqueue(message.clone()) {
                Ok(Enqueued::Queued) => queued += 1,
                Ok(Enqueued::EvictedOldest) => {
                    queued += 1;
                    BusCounters::add(&counters.dropped, 1);
                }
                Ok(Enqueued::DroppedNewest) => BusCounters::add(&counters.dropped, 1),
                Ok(Enqueued::Closed) => {}
                Err(err) => {
                    BusCounters::add(&counters.rejected, 1);
                    debug!(
                        "event=imc_publish module=imc status=rejected topic_id={} subscription_id={} policy={} error_code={}",
                        topic,
                        subscription.id,
                        subscription.policy().as_str(),
                        err.code()
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        trace!(
            "event=imc_publish module=imc status=ok topic_id={} sequence={} queued={}",
            topic,
            message.sequence,
            queued
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(queued),
        }
    }

    fn topic_subscriptions(&self, topic: TopicId) -> Vec<Arc<Subscription>> {
        self.inner
            .subscriptions
            .read()
            .by_topic
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribes with default options.
    pub fn subscribe<F>(
        &self,
        owner: &ModContext,
        topic: TopicId,
        handler: F,
    ) -> KernelResult<SubscriptionId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe_ex(owner, topic, handler, SubscribeOptions::default())
    }

    pub fn subscribe_ex<F>(
        &self,
        owner: &ModContext,
        topic: TopicId,
        handler: F,
        options: SubscribeOptions,
    ) -> KernelResult<SubscriptionId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe_handler(owner, topic, Arc::new(handler), options)
    }

    pub(crate) fn subscribe_handler(
        &self,
        owner: &ModContext,
        topic: TopicId,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> KernelResult<SubscriptionId> {
        self.inner.topics.check(topic)?;
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = options.policy();
        let subscription = Arc::new(Subscription::new(
            id,
            topic,
            owner.clone(),
            handler,
            options,
            self.inner.default_capacity,
            self.inner.default_block_timeout,
        )?);

        {
            let mut table = self.inner.subscriptions.write();
            table
                .by_topic
                .entry(topic)
                .or_default()
                .push(Arc::clone(&subscription));
            table.by_id.insert(id, subscription);
        }
        info!(
            "event=imc_subscribe module=imc status=ok subscription_id={} topic_id={} owner={} policy={}",
            id,
            topic,
            owner.name(),
            policy.as_str()
        );
        Ok(id)
    }

    /// Removes a subscription. No handler invocation starts after this
    /// returns; an invocation already running on another thread is waited
    /// for, unless the caller is itself running inside a handler.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> KernelResult<()> {
        let removed = self
            .detach_subscriptions(|candidate| candidate.id == subscription)
            .pop()
            .ok_or_else(|| KernelError::NotFound(format!("subscription {subscription}")))?;
        let discarded = removed.deactivate();
        info!(
            "event=imc_unsubscribe module=imc status=ok subscription_id={} discarded={}",
            subscription, discarded
        );
        Ok(())
    }

    /// Removes every subscription owned by `owner`.
    pub fn unsubscribe_owned_by(&self, owner: &ModContext) -> usize {
        let removed = self.detach_subscriptions(|candidate| candidate.owner == *owner);
        for subscription in &removed {
            subscription.deactivate();
        }
        removed.len()
    }

    fn detach_subscriptions<P>(&self, matches: P) -> Vec<Arc<Subscription>>
    where
        P: Fn(&Subscription) -> bool,
    {
        let mut table = self.inner.subscriptions.write();
        let ids: Vec<SubscriptionId> = table
            .by_id
            .values()
            .filter(|subscription| matches(subscription))
            .map(|subscription| subscription.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(subscription) = table.by_id.remove(&id) else {
                continue;
            };
            if let Some(list) = table.by_topic.get_mut(&subscription.topic) {
                list.retain(|candidate| candidate.id != id);
                if list.is_empty() {
                    table.by_topic.remove(&subscription.topic);
                }
            }
            removed.push(subscription);
        }
        removed
    }

    /// Delivers up to `max_per_subscription` queued messages to each
    /// subscription (`0` = everything queued when its turn starts), then
    /// services up to as many deferred RPC calls.
    ///
    /// Returns the number of handler invocations. Subscriptions already
    /// being pumped by another thread are skipped.
    pub fn pump(&self, max_per_subscription: usize) -> usize {
        let subscriptions: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .read()
            .by_id
            .values()
            .cloned()
            .collect();

        let mut delivered = 0;
        for subscription in subscriptions {
            let Some(report) = subscription.dispatch(max_per_subscription) else {
                continue;
            };
            if report.panicked > 0 {
                warn!(
                    "event=imc_pump module=imc status=error subscription_id={} reason=handler_panic count={}",
                    subscription.id, report.panicked
                );
            }
            delivered += report.delivered;
        }
        BusCounters::add(&self.inner.counters.delivered, delivered as u64);
        delivered + self.service_rpcs(max_per_subscription)
    }

    pub fn register_rpc<F>(&self, owner: &ModContext, rpc: RpcId, handler: F) -> KernelResult<()>
    where
        F: Fn(&RpcRequest) -> KernelResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.register_rpc_handler(owner, rpc, Arc::new(handler))
    }

    pub(crate) fn register_rpc_handler(
        &self,
        owner: &ModContext,
        rpc: RpcId,
        handler: RpcHandler,
    ) -> KernelResult<()> {
        self.inner.rpc_names.check(rpc)?;
        self.inner.rpcs.register(owner, rpc, handler)
    }

    /// Only the registering mod may unregister an RPC.
    pub fn unregister_rpc(&self, caller: &ModContext, rpc: RpcId) -> KernelResult<()> {
        self.inner.rpc_names.check(rpc)?;
        self.inner.rpcs.unregister(caller, rpc)
    }

    pub fn unregister_rpcs_owned_by(&self, owner: &ModContext) -> usize {
        self.inner.rpcs.unregister_owned_by(owner)
    }

    pub fn is_rpc_registered(&self, rpc: RpcId) -> bool {
        self.inner.rpcs.is_registered(rpc)
    }

    /// Calls an RPC. Inline calls have completed (or failed) when this
    /// returns; deferred calls stay `Pending` until serviced.
    pub fn call_rpc(
        &self,
        caller: &ModContext,
        rpc: RpcId,
        request: &[u8],
        options: CallOptions,
    ) -> KernelResult<RpcFuture> {
        self.inner.rpc_names.check(rpc)?;
        self.inner.rpcs.call(
            self.identity(),
            &self.inner.counters,
            RpcRequest {
                rpc,
                caller: caller.clone(),
                payload: request.to_vec(),
            },
            options,
        )
    }

    /// Runs up to `max` deferred RPC calls (`0` = all queued now).
    pub fn service_rpcs(&self, max: usize) -> usize {
        self.inner
            .rpcs
            .service(self.identity(), &self.inner.counters, max)
    }

    pub fn deferred_rpc_len(&self) -> usize {
        self.inner.rpcs.deferred_len()
    }

    /// Cancels every outstanding future and drops queued deferred calls.
    pub fn cancel_pending_rpcs(&self) -> usize {
        let cancelled = self.inner.rpcs.cancel_pending();
        if cancelled > 0 {
            info!(
                "event=rpc_cancel_all module=rpc status=ok cancelled={}",
                cancelled
            );
        }
        cancelled
    }

    pub fn stats(&self) -> ImcStats {
        let active = self.inner.subscriptions.read().by_id.len() as u64;
        let rpcs = self.inner.rpcs.registered_len() as u64;
        self.inner.counters.snapshot(active, rpcs)
    }

    /// Messages published on `topic` since the last reset.
    pub fn topic_message_count(&self, topic: TopicId) -> u64 {
        self.inner.counters.topic_count(topic)
    }

    pub fn reset_stats(&self) {
        self.inner.counters.reset();
    }

    pub fn subscription_queue_len(&self, subscription: SubscriptionId) -> KernelResult<usize> {
        self.inner
            .subscriptions
            .read()
            .by_id
            .get(&subscription)
            .map(|subscription| subscription.queue_len())
            .ok_or_else(|| KernelError::NotFound(format!("subscription {subscription}")))
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ImcBus;
    use crate::context::ModContext;
    use crate::error::KernelError;
    use crate::imc::{CallOptions, FutureState, MessageMetadata, Priority, SubscribeOptions};
    use crate::resource::Handle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn module(name: &str, slot: u32) -> ModContext {
        ModContext::new(
            Handle {
                type_id: 1,
                generation: 1,
                slot,
            },
            name,
        )
    }

    #[test]
    fn zero_and_unknown_topics_are_rejected() {
        let bus = ImcBus::default();
        let sender = module("alpha", 0);
        assert!(matches!(
            bus.publish(&sender, 0, b"x", None),
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(matches!(
            bus.subscribe(&sender, 0, |_| {}),
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(matches!(
            bus.publish(&sender, 99, b"x", None),
            Err(KernelError::NotFound(_))
        ));
    }

    #[test]
    fn delivery_waits_for_pump() {
        let bus = ImcBus::default();
        let sender = module("alpha", 0);
        let topic = bus.get_topic_id("tick").expect("topic");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(&sender, topic, move |message| {
            sink.lock().push(message.data().to_vec());
        })
        .expect("subscribe");

        assert_eq!(bus.publish(&sender, topic, b"one", None).expect("publish"), 1);
        assert!(seen.lock().is_empty());
        assert_eq!(bus.pump(0), 1);
        assert_eq!(seen.lock().as_slice(), &[b"one".to_vec()]);
    }

    #[test]
    fn priority_floor_filters_before_queueing() {
        let bus = ImcBus::default();
        let sender = module("alpha", 0);
        let topic = bus.get_topic_id("alerts").expect("topic");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.subscribe_ex(
            &sender,
            topic,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::new().with_min_priority(Priority::High),
        )
        .expect("subscribe");

        bus.publish(&sender, topic, b"low", None).expect("normal");
        bus.publish(
            &sender,
            topic,
            b"high",
            Some(MessageMetadata::with_priority(Priority::Critical)),
        )
        .expect("critical");
        bus.pump(0);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(bus.topic_message_count(topic), 2);
    }

    #[test]
    fn unsubscribe_from_own_handler_stops_delivery() {
        let bus = ImcBus::default();
        let sender = module("alpha", 0);
        let topic = bus.get_topic_id("once").expect("topic");
        let seen = Arc::new(AtomicUsize::new(0));
        let id_cell = Arc::new(Mutex::new(0u64));

        let handler_bus = bus.clone();
        let handler_seen = Arc::clone(&seen);
        let handler_id = Arc::clone(&id_cell);
        let id = bus
            .subscribe(&sender, topic, move |_| {
                handler_seen.fetch_add(1, Ordering::SeqCst);
                let id = *handler_id.lock();
                handler_bus.unsubscribe(id).expect("self unsubscribe");
            })
            .expect("subscribe");
        *id_cell.lock() = id;

        for _ in 0..3 {
            bus.publish(&sender, topic, b"x", None).expect("publish");
        }
        bus.pump(0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn inline_rpc_completes_before_return() {
        let bus = ImcBus::default();
        let owner = module("alpha", 0);
        let rpc = bus.get_rpc_id("math.double").expect("rpc id");
        bus.register_rpc(&owner, rpc, |request| {
            Ok(request.payload.iter().map(|byte| byte * 2).collect())
        })
        .expect("register");

        let future = bus
            .call_rpc(&owner, rpc, &[1, 2, 3], CallOptions::default())
            .expect("call");
        assert_eq!(future.state(), FutureState::Ready);
        assert_eq!(future.result().expect("result"), vec![2, 4, 6]);
    }

    #[test]
    fn unregister_requires_owner() {
        let bus = ImcBus::default();
        let owner = module("alpha", 0);
        let other = module("beta", 1);
        let rpc = bus.get_rpc_id("svc").expect("rpc id");
        bus.register_rpc(&owner, rpc, |_| Ok(Vec::new()))
            .expect("register");

        assert!(matches!(
            bus.unregister_rpc(&other, rpc),
            Err(KernelError::NotOwner(_))
        ));
        bus.unregister_rpc(&owner, rpc).expect("owner unregister");
        assert!(matches!(
            bus.call_rpc(&owner, rpc, &[], CallOptions::default()),
            Err(KernelError::NotFound(_))
        ));
    }
}
