//! Latency of the emergency-stop critical path against the simulated driver.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use strider_hal::{MonotonicClock, SimServoDriver};
use strider_kernel::{EmergencyStop, EmergencyStopConfig, SafetyConfig, SafetyCoordinator};

fn bench_trigger(c: &mut Criterion) {
    let mut group = c.benchmark_group("trigger");

    group.bench_function("trigger_and_reset", |b| {
        let estop = EmergencyStop::new(
            Arc::new(SimServoDriver::new(16)),
            EmergencyStopConfig {
                auto_reset: true,
                ..EmergencyStopConfig::default()
            },
            None,
        );
        let _ = estop.start();
        b.iter(|| {
            let outcome = estop.trigger("bench");
            let _ = estop.reset();
            black_box(outcome)
        });
    });

    group.bench_function("trigger_already_stopped", |b| {
        let estop = EmergencyStop::new(
            Arc::new(SimServoDriver::new(16)),
            EmergencyStopConfig::default(),
            None,
        );
        estop.trigger("latch");
        b.iter(|| black_box(estop.trigger("bench")));
    });

    group.finish();
}

fn bench_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate");

    let coordinator = SafetyCoordinator::new(
        Arc::new(SimServoDriver::new(16)),
        SafetyConfig::default(),
        MonotonicClock::shared(),
        None,
    );
    if let Ok(coordinator) = coordinator {
        if coordinator.start().is_ok() {
            group.bench_function("feed_watchdog_16ch", |b| {
                b.iter(|| black_box(coordinator.feed_watchdog()));
            });
            group.bench_function("get_status", |b| {
                b.iter(|| black_box(coordinator.get_status()));
            });
        }
        coordinator.stop();
    }

    group.finish();
}

criterion_group!(benches, bench_trigger, bench_gate);
criterion_main!(benches);
