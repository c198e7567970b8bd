//! Cross-context ordering and independence guarantees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fluxrust_core::{Buffer, Context, DType, Device};

mod common;
use common::{init_logging, read_f32};

#[test]
fn consumer_after_wait_observes_producer_effects() {
    init_logging();
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(1)).unwrap();

    let value = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let v = Arc::clone(&value);
    producer.enqueue(move || {
        // Give the consumer every chance to race ahead if ordering is broken.
        std::thread::sleep(Duration::from_millis(50));
        v.store(1, Ordering::SeqCst);
    });
    consumer.wait([&producer]);
    let (v, o) = (Arc::clone(&value), Arc::clone(&observed));
    consumer.enqueue(move || {
        o.store(v.load(Ordering::SeqCst), Ordering::SeqCst);
    });
    consumer.synchronize();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_orders_buffer_traffic_between_contexts_on_one_device() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(0)).unwrap();

    let value = Buffer::empty_on(Device::Accel(0), 3, 3, DType::F32).unwrap();
    let sink = Buffer::empty_on(Device::Accel(0), 3, 3, DType::F32).unwrap();

    value.fill(&producer, 7.0f32).unwrap();
    consumer.wait([&producer]);
    value.copy_to(&consumer, &sink).unwrap();
    consumer.synchronize();

    let host = read_f32(&sink);
    for j in 0..3 {
        for i in 0..3 {
            assert_eq!(host.get(i, j), 7.0);
        }
    }
}

#[test]
fn block_is_the_dual_of_wait() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(1)).unwrap();

    let value = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let v = Arc::clone(&value);
    producer.enqueue(move || {
        std::thread::sleep(Duration::from_millis(50));
        v.store(1, Ordering::SeqCst);
    });
    // The producer holds the consumer back instead of the consumer asking.
    producer.block([&consumer]);
    let (v, o) = (Arc::clone(&value), Arc::clone(&observed));
    consumer.enqueue(move || {
        o.store(v.load(Ordering::SeqCst), Ordering::SeqCst);
    });
    consumer.synchronize();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_captures_the_producer_position_at_call_time() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(1)).unwrap();

    let early = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&early);
    producer.enqueue(move || e.store(1, Ordering::SeqCst));

    consumer.wait([&producer]);

    // Enqueued after the wait was recorded: the consumer must not stall on it.
    producer.enqueue(move || std::thread::sleep(Duration::from_millis(300)));

    let (e, observed) = (Arc::clone(&early), Arc::new(AtomicUsize::new(usize::MAX)));
    let o = Arc::clone(&observed);
    consumer.enqueue(move || o.store(e.load(Ordering::SeqCst), Ordering::SeqCst));

    let start = Instant::now();
    consumer.synchronize();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!(
        start.elapsed() < Duration::from_millis(200),
        "consumer serialized against work enqueued after its wait"
    );
    producer.synchronize();
}

#[test]
fn unrelated_contexts_never_serialize() {
    let busy = Context::new(Device::Accel(0)).unwrap();
    let idle = Context::new(Device::Accel(1)).unwrap();

    busy.enqueue(|| std::thread::sleep(Duration::from_millis(500)));
    let touched = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&touched);
    idle.enqueue(move || {
        t.store(1, Ordering::SeqCst);
    });

    let start = Instant::now();
    idle.synchronize();
    assert_eq!(touched.load(Ordering::SeqCst), 1);
    assert!(
        start.elapsed() < Duration::from_millis(250),
        "independent context blocked on an unrelated queue"
    );
    busy.synchronize();
}

#[test]
fn host_context_wait_executes_inline() {
    let host = Context::new(Device::Cpu).unwrap();
    let device = Context::new(Device::Accel(0)).unwrap();

    let value = Arc::new(AtomicUsize::new(0));
    let v = Arc::clone(&value);
    device.enqueue(move || {
        std::thread::sleep(Duration::from_millis(50));
        v.store(1, Ordering::SeqCst);
    });
    // The host queue is the calling thread, so the wait instruction runs here.
    host.wait([&device]);
    assert_eq!(value.load(Ordering::SeqCst), 1);
}
