//! Connector fan-out/fan-in across contexts and devices.

use fluxrust_core::{Buffer, Connector, Context, DType, Device, FluxRustError, HostMatrix};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

mod common;
use common::{assert_matrix_close, init_logging, read_f32};

#[test]
fn producer_to_consumer_forward_and_backward_across_devices() {
    init_logging();
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(1)).unwrap();

    let value = Buffer::empty_on(Device::Accel(0), 3, 4, DType::F32).unwrap();
    let edge = Connector::with_grad(value.clone(), producer.clone(), producer.clone()).unwrap();
    let (forward, sink) = edge.register_usage_with_grad(&consumer, &consumer).unwrap();

    value.fill(&producer, 1.0f32).unwrap();
    edge.fprop().unwrap();
    consumer.synchronize();
    assert_eq!(read_f32(&forward), HostMatrix::full(3, 4, 1.0));

    sink.buffer().fill(&consumer, 2.0f32).unwrap();
    sink.commit().unwrap();
    let grad = edge.bprop().unwrap();
    producer.synchronize();
    assert_eq!(read_f32(&grad), HostMatrix::full(3, 4, 2.0));
}

#[test]
fn same_device_consumers_share_the_value_handle() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(0)).unwrap();

    let value = Buffer::empty_on(Device::Accel(0), 2, 2, DType::F32).unwrap();
    let edge = Connector::new(value.clone(), producer.clone());
    let forward = edge.register_usage(&consumer).unwrap();

    // Same allocation: no per-step copy on this path.
    assert_eq!(forward, value);

    value.fill(&producer, 8.0f32).unwrap();
    edge.fprop().unwrap();
    consumer.synchronize();
    producer.synchronize();
    assert_eq!(read_f32(&forward), HostMatrix::full(2, 2, 8.0));
}

#[test]
fn accumulated_gradient_is_the_sum_of_all_contributions() {
    for k in [1usize, 2, 5] {
        let producer = Context::new(Device::Accel(0)).unwrap();
        let value = Buffer::empty_on(Device::Accel(0), 3, 4, DType::F32).unwrap();
        let edge = Connector::with_grad(value.clone(), producer.clone(), producer.clone()).unwrap();

        let mut rng = StdRng::seed_from_u64(0xfeed + k as u64);
        let mut consumers = Vec::new();
        for c in 0..k {
            let device = Device::Accel((c % 2) as u32);
            let ctx = Context::new(device).unwrap();
            let (_, sink) = edge.register_usage_with_grad(&ctx, &ctx).unwrap();
            consumers.push((ctx, sink));
        }

        value.fill(&producer, 0.0f32).unwrap();
        edge.fprop().unwrap();

        let mut expected = HostMatrix::zeros(3, 4);
        for (ctx, sink) in &consumers {
            let contribution =
                HostMatrix::from_fn(3, 4, |_, _| rng.sample::<f32, _>(StandardNormal));
            for j in 0..4 {
                for i in 0..3 {
                    expected.set(i, j, expected.get(i, j) + contribution.get(i, j));
                }
            }
            sink.buffer().copy_from_host(ctx, &contribution).unwrap();
            sink.commit().unwrap();
        }

        let grad = edge.bprop().unwrap();
        producer.synchronize();
        assert_matrix_close(&read_f32(&grad), &expected, 1e-4);
    }
}

#[test]
fn contribution_past_the_expected_count_is_a_protocol_error() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let value = Buffer::empty_on(Device::Accel(0), 3, 4, DType::F32).unwrap();
    let edge = Connector::with_grad(value.clone(), producer.clone(), producer.clone()).unwrap();

    let k = 2;
    let mut sinks = Vec::new();
    for _ in 0..=k {
        let ctx = Context::new(Device::Accel(1)).unwrap();
        let (_, sink) = edge.register_usage_with_grad(&ctx, &ctx).unwrap();
        sinks.push((ctx, sink));
    }
    // Only k of the k+1 registered consumers are active this step.
    edge.set_expected_contributions(k).unwrap();
    edge.fprop().unwrap();

    for (ctx, sink) in sinks.iter().take(k) {
        sink.buffer().fill(ctx, 1.0f32).unwrap();
        sink.commit().unwrap();
    }
    let (ctx, extra) = &sinks[k];
    extra.buffer().fill(ctx, 1.0f32).unwrap();
    assert!(matches!(
        extra.commit().unwrap_err(),
        FluxRustError::Protocol { .. }
    ));

    // The completed accumulation is still intact.
    let grad = edge.bprop().unwrap();
    producer.synchronize();
    assert_eq!(read_f32(&grad), HostMatrix::full(3, 4, k as f32));
}

#[test]
fn per_step_resize_propagates_to_private_consumer_copies() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let consumer = Context::new(Device::Accel(1)).unwrap();

    let value = Buffer::empty_on(Device::Accel(0), 6, 3, DType::F32).unwrap();
    let edge = Connector::new(value.clone(), producer.clone());
    let forward = edge.register_usage(&consumer).unwrap();

    value.fill(&producer, 1.5f32).unwrap();
    edge.fprop().unwrap();
    consumer.synchronize();
    assert_eq!(forward.shape(), (6, 3));

    // A shorter step: the logical extent shrinks, capacity stays.
    edge.set_nrows(4).unwrap();
    value.fill(&producer, 2.5f32).unwrap();
    edge.fprop().unwrap();
    consumer.synchronize();
    assert_eq!(forward.shape(), (4, 3));
    assert_eq!(read_f32(&forward), HostMatrix::full(4, 3, 2.5));

    assert!(matches!(
        edge.set_nrows(7).unwrap_err(),
        FluxRustError::CapacityExceeded { .. }
    ));
}

#[test]
fn truncated_steps_only_wait_for_scheduled_contributions() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let value = Buffer::empty_on(Device::Accel(0), 2, 2, DType::F32).unwrap();
    let edge = Connector::with_grad(value.clone(), producer.clone(), producer.clone()).unwrap();

    let ctx_a = Context::new(Device::Accel(0)).unwrap();
    let ctx_b = Context::new(Device::Accel(1)).unwrap();
    let (_, sink_a) = edge.register_usage_with_grad(&ctx_a, &ctx_a).unwrap();
    let (_, _sink_b) = edge.register_usage_with_grad(&ctx_b, &ctx_b).unwrap();

    // This step only the first consumer runs backward.
    edge.set_expected_contributions(1).unwrap();
    edge.fprop().unwrap();
    sink_a.buffer().fill(&ctx_a, 3.0f32).unwrap();
    sink_a.commit().unwrap();

    let grad = edge.bprop().unwrap();
    producer.synchronize();
    assert_eq!(read_f32(&grad), HostMatrix::full(2, 2, 3.0));
}

#[test]
fn zero_expected_contributions_never_reach_ready() {
    let producer = Context::new(Device::Accel(0)).unwrap();
    let value = Buffer::empty_on(Device::Accel(0), 2, 2, DType::F32).unwrap();
    let edge = Connector::with_grad(value.clone(), producer.clone(), producer.clone()).unwrap();
    let ctx = Context::new(Device::Accel(0)).unwrap();
    let (_, _sink) = edge.register_usage_with_grad(&ctx, &ctx).unwrap();

    edge.set_expected_contributions(0).unwrap();
    edge.fprop().unwrap();
    assert!(matches!(
        edge.bprop().unwrap_err(),
        FluxRustError::Protocol { .. }
    ));
    // The edge rolls into the next step regardless.
    edge.fprop().unwrap();
}
