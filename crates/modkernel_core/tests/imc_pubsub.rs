use modkernel_core::error::KernelError;
use modkernel_core::imc::{
    BackpressurePolicy, ImcBus, MessageMetadata, Priority, SubscribeOptions,
};
use modkernel_core::resource::Handle;
use modkernel_core::ModContext;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

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

fn collecting(bus: &ImcBus, owner: &ModContext, topic: u32, options: SubscribeOptions) -> (u64, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = bus
        .subscribe_ex(
            owner,
            topic,
            move |message| sink.lock().extend_from_slice(message.data()),
            options,
        )
        .unwrap();
    (id, seen)
}

#[test]
fn topic_ids_are_stable_and_non_zero() {
    let bus = ImcBus::default();
    let first = bus.get_topic_id("world.loaded").unwrap();
    let second = bus.get_topic_id("world.saved").unwrap();
    assert_ne!(first, 0);
    assert_ne!(first, second);
    assert_eq!(bus.get_topic_id("world.loaded").unwrap(), first);
    assert_eq!(bus.topic_name(second).as_deref(), Some("world.saved"));

    assert_eq!(bus.find_topic_id("world.saved"), Some(second));
    assert_eq!(bus.find_topic_id("world.unloaded"), None);
    assert_eq!(bus.find_rpc_id("world.save"), None);
    let save = bus.get_rpc_id("world.save").unwrap();
    assert_eq!(bus.find_rpc_id("world.save"), Some(save));
    assert_eq!(bus.get_topic_id("world.unloaded").unwrap(), second + 1);
}

#[test]
fn single_publisher_order_is_preserved() {
    let bus = ImcBus::default();
    let publisher = module("publisher", 0);
    let topic = bus.get_topic_id("ordered").unwrap();
    let (_, seen) = collecting(&bus, &publisher, topic, SubscribeOptions::new());

    for value in 0..=255u8 {
        bus.publish(&publisher, topic, &[value], None).unwrap();
    }
    assert_eq!(bus.pump(0), 256);

    let expected: Vec<u8> = (0..=255u8).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn two_publishers_interleave_without_reordering_either_stream() {
    let bus = ImcBus::default();
    let listener = module("listener", 0);
    let topic = bus.get_topic_id("interleaved").unwrap();
    let (_, seen) = collecting(
        &bus,
        &listener,
        topic,
        SubscribeOptions::new().with_capacity(1024),
    );

    let barrier = Arc::new(Barrier::new(2));
    let publishers: Vec<_> = [(0u8, "even"), (1u8, "odd")]
        .into_iter()
        .enumerate()
        .map(|(slot, (parity, name))| {
            let bus = bus.clone();
            let barrier = Arc::clone(&barrier);
            let sender = module(name, slot as u32 + 1);
            thread::spawn(move || {
                barrier.wait();
                for value in (0..=255u8).filter(|value| value % 2 == parity) {
                    bus.publish(&sender, topic, &[value], None).unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }
    bus.pump(0);

    let seen = seen.lock().clone();
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..=255u8).collect::<Vec<_>>());
    for parity in [0u8, 1] {
        let stream: Vec<u8> = seen.iter().copied().filter(|v| v % 2 == parity).collect();
        assert!(stream.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[test]
fn drop_policies_keep_the_expected_end_of_the_stream() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("bursty").unwrap();
    let (_, oldest) = collecting(
        &bus,
        &owner,
        topic,
        SubscribeOptions::new().with_capacity(3),
    );
    let (_, newest) = collecting(
        &bus,
        &owner,
        topic,
        SubscribeOptions::new()
            .with_capacity(3)
            .with_policy(BackpressurePolicy::DropNewest),
    );

    for value in 0..6u8 {
        bus.publish(&owner, topic, &[value], None).unwrap();
    }
    bus.pump(0);

    assert_eq!(*oldest.lock(), vec![3, 4, 5]);
    assert_eq!(*newest.lock(), vec![0, 1, 2]);
    assert_eq!(bus.stats().dropped, 6);
}

#[test]
fn fail_policy_rejects_when_full() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("strict").unwrap();
    let (id, _) = collecting(
        &bus,
        &owner,
        topic,
        SubscribeOptions::new()
            .with_capacity(1)
            .with_policy(BackpressurePolicy::Fail),
    );

    bus.publish(&owner, topic, b"a", None).unwrap();
    assert!(matches!(
        bus.publish(&owner, topic, b"b", None),
        Err(KernelError::QueueFull { subscription }) if subscription == id
    ));
    assert_eq!(bus.subscription_queue_len(id).unwrap(), 1);
    assert_eq!(bus.stats().rejected, 1);
}

#[test]
fn block_policy_waits_for_a_pump_on_another_thread() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("paced").unwrap();
    let (patient, seen) = collecting(
        &bus,
        &owner,
        topic,
        SubscribeOptions::new()
            .with_capacity(1)
            .with_policy(BackpressurePolicy::Block)
            .with_block_timeout(Duration::from_secs(5)),
    );
    bus.publish(&owner, topic, &[1], None).unwrap();

    let pumper = {
        let bus = bus.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            bus.pump(0)
        })
    };
    bus.publish(&owner, topic, &[2], None).unwrap();
    pumper.join().unwrap();
    bus.pump(0);
    assert_eq!(*seen.lock(), vec![1, 2]);
    bus.unsubscribe(patient).unwrap();

    collecting(
        &bus,
        &owner,
        topic,
        SubscribeOptions::new()
            .with_capacity(1)
            .with_policy(BackpressurePolicy::Block)
            .with_block_timeout(Duration::from_millis(10)),
    );
    bus.publish(&owner, topic, &[3], None).unwrap();
    assert!(matches!(
        bus.publish(&owner, topic, &[4], None),
        Err(KernelError::WouldBlock(_))
    ));
}

#[test]
fn filter_sees_only_messages_above_the_priority_floor() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("events").unwrap();
    let filter_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&filter_calls);
    let (_, seen) = collecting(
        &bus,
        &owner,
        topic,
        SubscribeOptions::new()
            .with_min_priority(Priority::High)
            .with_filter(move |message| {
                counter.fetch_add(1, Ordering::SeqCst);
                message.metadata.flags & 1 == 1
            }),
    );

    let publish = |value: u8, priority: Priority, flags: u32| {
        bus.publish(&owner, topic, &[value], Some(MessageMetadata { priority, flags }))
            .unwrap();
    };
    publish(1, Priority::Low, 1);
    publish(2, Priority::High, 0);
    publish(3, Priority::Critical, 1);
    bus.pump(0);

    assert_eq!(*seen.lock(), vec![3]);
    assert_eq!(filter_calls.load(Ordering::SeqCst), 2);
    assert_eq!(bus.stats().filtered, 2);
}

#[test]
fn unsubscribe_drops_queued_messages_and_stops_delivery() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("cancelled").unwrap();
    let (id, seen) = collecting(&bus, &owner, topic, SubscribeOptions::new());

    bus.publish(&owner, topic, &[1], None).unwrap();
    bus.unsubscribe(id).unwrap();
    assert_eq!(bus.publish(&owner, topic, &[2], None).unwrap(), 0);
    bus.pump(0);

    assert!(seen.lock().is_empty());
    assert!(matches!(bus.unsubscribe(id), Err(KernelError::NotFound(_))));
}

#[test]
fn unsubscribe_waits_for_a_running_handler() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("slow").unwrap();
    let entered = Arc::new(Barrier::new(2));
    let finished = Arc::new(AtomicUsize::new(0));

    let handler_entered = Arc::clone(&entered);
    let handler_finished = Arc::clone(&finished);
    let id = bus
        .subscribe(&owner, topic, move |_| {
            handler_entered.wait();
            thread::sleep(Duration::from_millis(30));
            handler_finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    bus.publish(&owner, topic, &[0], None).unwrap();
    bus.publish(&owner, topic, &[1], None).unwrap();

    let pumper = {
        let bus = bus.clone();
        thread::spawn(move || bus.pump(0))
    };
    entered.wait();
    bus.unsubscribe(id).unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(pumper.join().unwrap(), 1);
}

#[test]
fn buffer_cleanup_runs_after_every_subscriber_is_done() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("frames").unwrap();
    let (_, first) = collecting(&bus, &owner, topic, SubscribeOptions::new());
    let (_, second) = collecting(&bus, &owner, topic, SubscribeOptions::new());

    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cleanups);
    let queued = bus
        .publish_buffer(
            &owner,
            topic,
            vec![7u8; 4],
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();
    assert_eq!(queued, 2);
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);

    bus.pump(0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(*first.lock(), vec![7; 4]);
    assert_eq!(*second.lock(), vec![7; 4]);

    let unheard = bus.get_topic_id("unheard").unwrap();
    let idle = Arc::new(AtomicUsize::new(0));
    let idle_counter = Arc::clone(&idle);
    bus.publish_buffer(
        &owner,
        unheard,
        b"static".as_slice(),
        Some(Box::new(move || {
            idle_counter.fetch_add(1, Ordering::SeqCst);
        })),
        None,
    )
    .unwrap();
    assert_eq!(idle.load(Ordering::SeqCst), 1);
}

fn assert_shared<T: Send + Sync>() {}

#[test]
fn borrowed_buffers_publish_from_many_threads() {
    assert_shared::<ImcBus>();
    assert_shared::<modkernel_core::imc::Message>();

    let bus = Arc::new(ImcBus::default());
    let owner = module("owner", 0);
    let topic = bus.get_topic_id("frames.shared").unwrap();
    let (_, seen) = collecting(&bus, &owner, topic, SubscribeOptions::new().with_capacity(64));

    let cleanups = Arc::new(AtomicUsize::new(0));
    let publishers: Vec<_> = (0..4u8)
        .map(|index| {
            let bus = Arc::clone(&bus);
            let owner = owner.clone();
            let counter = Arc::clone(&cleanups);
            thread::spawn(move || {
                bus.publish_buffer(
                    &owner,
                    topic,
                    vec![index; 2],
                    Some(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                    None,
                )
                .unwrap();
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    let pump_bus = Arc::clone(&bus);
    assert_eq!(thread::spawn(move || pump_bus.pump(0)).join().unwrap(), 4);
    assert_eq!(cleanups.load(Ordering::SeqCst), 4);
    assert_eq!(seen.lock().len(), 8);
}

#[test]
fn stats_track_counts_without_affecting_delivery() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let busy = bus.get_topic_id("busy").unwrap();
    let quiet = bus.get_topic_id("quiet").unwrap();
    let (_, seen) = collecting(&bus, &owner, busy, SubscribeOptions::new());

    for value in 0..5u8 {
        bus.publish(&owner, busy, &[value], None).unwrap();
    }
    bus.publish(&owner, quiet, &[0], None).unwrap();
    bus.pump(2);

    let stats = bus.stats();
    assert_eq!(stats.published, 6);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.active_subscriptions, 1);
    assert_eq!(bus.topic_message_count(busy), 5);
    assert_eq!(bus.topic_message_count(quiet), 1);

    bus.reset_stats();
    assert_eq!(bus.stats().published, 0);
    bus.pump(0);
    assert_eq!(seen.lock().len(), 5);
}

#[test]
fn detach_cleanup_removes_only_the_owners_subscriptions() {
    let bus = ImcBus::default();
    let leaving = module("leaving", 0);
    let staying = module("staying", 1);
    let topic = bus.get_topic_id("shared").unwrap();
    collecting(&bus, &leaving, topic, SubscribeOptions::new());
    collecting(&bus, &leaving, topic, SubscribeOptions::new());
    let (_, kept) = collecting(&bus, &staying, topic, SubscribeOptions::new());

    assert_eq!(bus.unsubscribe_owned_by(&leaving), 2);
    assert_eq!(bus.publish(&staying, topic, &[9], None).unwrap(), 1);
    bus.pump(0);
    assert_eq!(*kept.lock(), vec![9]);
}

#[test]
fn handlers_unsubscribing_each_other_on_two_threads_finish() {
    let bus = ImcBus::default();
    let owner = module("owner", 0);
    let left_topic = bus.get_topic_id("pair.left").unwrap();
    let right_topic = bus.get_topic_id("pair.right").unwrap();
    let both_running = Arc::new(Barrier::new(2));
    let left_id = Arc::new(Mutex::new(0u64));
    let right_id = Arc::new(Mutex::new(0u64));

    let subscribe_peer = |topic: u32, peer: Arc<Mutex<u64>>| {
        let bus_in_handler = bus.clone();
        let barrier = Arc::clone(&both_running);
        bus.subscribe(&owner, topic, move |_| {
            barrier.wait();
            let peer = *peer.lock();
            let _ = bus_in_handler.unsubscribe(peer);
        })
        .unwrap()
    };
    *left_id.lock() = subscribe_peer(left_topic, Arc::clone(&right_id));
    *right_id.lock() = subscribe_peer(right_topic, Arc::clone(&left_id));

    bus.publish(&owner, left_topic, b"l", None).unwrap();
    bus.publish(&owner, right_topic, b"r", None).unwrap();
    let pumps: Vec<_> = (0..2)
        .map(|_| {
            let bus = bus.clone();
            thread::spawn(move || bus.pump(0))
        })
        .collect();
    let delivered: usize = pumps.into_iter().map(|pump| pump.join().unwrap()).sum();

    assert_eq!(delivered, 2);
    assert_eq!(bus.subscription_count(), 0);
}
