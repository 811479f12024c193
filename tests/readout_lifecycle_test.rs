//! Integration tests for the readout run-control lifecycle with the simulated producer.

use daq_readout::{
    DeliveryMode, Fragment, LifecycleState, Readout, ReadoutConfig, ReadoutError, ReadoutMetrics,
    RequestBuffer, SequenceId, Simulator, SimulatorConfig, Telemetry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(1);

fn ignored_config() -> ReadoutConfig {
    ReadoutConfig {
        request_mode: DeliveryMode::Ignored,
        fragment_id: Some(0),
        hardware_poll_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn simulator(config: SimulatorConfig) -> Arc<Simulator> {
    Arc::new(Simulator::new(SimulatorConfig {
        seed: Some(7),
        ..config
    }))
}

fn readout(config: ReadoutConfig, producer: Arc<Simulator>) -> (Readout, Arc<ReadoutMetrics>) {
    let metrics = ReadoutMetrics::new();
    let readout = Readout::new(
        config,
        producer,
        Arc::new(RequestBuffer::new()),
        Telemetry::new(metrics.clone()),
    )
    .expect("valid config");
    (readout, metrics)
}

/// Fetch until `fetch_next` reports the end, with a safety deadline.
fn drain(readout: &Readout) -> Vec<Fragment> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::new();
    while readout.fetch_next(&mut out) {
        assert!(Instant::now() < deadline, "fetch_next never ended");
    }
    out
}

fn sequence_ids(fragments: &[Fragment]) -> Vec<SequenceId> {
    fragments.iter().map(Fragment::sequence_id).collect()
}

#[test]
fn test_ignored_mode_delivers_every_event_in_order() {
    let producer = simulator(SimulatorConfig {
        tick_period: Duration::ZERO,
        max_events: Some(50),
        ..Default::default()
    });
    let (readout, metrics) = readout(ignored_config(), producer.clone());

    readout.start(1, TIMEOUT, 0).unwrap();
    assert_eq!(readout.lifecycle_state(), LifecycleState::Running);

    let fragments = drain(&readout);
    assert_eq!(sequence_ids(&fragments), (1..=50).collect::<Vec<_>>());
    assert!(fragments
        .windows(2)
        .all(|pair| pair[0].timestamp() < pair[1].timestamp()));

    readout.stop(TIMEOUT, 0).unwrap();
    assert_eq!(readout.lifecycle_state(), LifecycleState::Idle);
    assert_eq!(readout.ev_counter(), 51);
    assert_eq!(producer.events(), 50);
    assert!(!readout.exception());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.delivered_fragments, 50);
    assert_eq!(snapshot.evicted_fragments, 0);
}

#[test]
fn test_producer_failure_latches_exception() {
    let producer = simulator(SimulatorConfig {
        tick_period: Duration::ZERO,
        fail_after: Some(5),
        ..Default::default()
    });
    let (readout, _metrics) = readout(ignored_config(), producer);

    readout.start(3, TIMEOUT, 0).unwrap();
    drain(&readout);

    assert!(readout.exception());
    let message = readout.latest_exception().unwrap();
    assert!(
        message.contains("simulated failure after 5 events"),
        "unexpected exception: {}",
        message
    );
    assert!(readout.report().contains("exception"));

    // Stop still joins and returns to idle
    readout.stop(TIMEOUT, 0).unwrap();
    assert_eq!(readout.lifecycle_state(), LifecycleState::Idle);
    assert!(!readout.stats().producer_running);
}

#[test]
fn test_force_stop_ends_delivery_promptly() {
    let producer = simulator(SimulatorConfig::default());
    let (readout, _metrics) = readout(ignored_config(), producer);

    readout.start(1, TIMEOUT, 0).unwrap();
    let mut out = Vec::new();
    assert!(readout.fetch_next(&mut out));

    readout.force_stop();
    assert!(readout.check_stop());
    drain(&readout);

    let started = Instant::now();
    readout.stop(TIMEOUT, 0).unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        started.elapsed()
    );
    assert!(!readout.stats().producer_running);
}

#[test]
fn test_restart_after_stop_begins_a_new_run() {
    let producer = simulator(SimulatorConfig {
        tick_period: Duration::ZERO,
        max_events: Some(10),
        ..Default::default()
    });
    let (readout, _metrics) = readout(ignored_config(), producer);

    readout.start(1, TIMEOUT, 0).unwrap();
    assert_eq!(drain(&readout).len(), 10);
    readout.stop(TIMEOUT, 0).unwrap();

    readout.start(2, TIMEOUT, 0).unwrap();
    assert_eq!(readout.run_number(), 2);
    assert_eq!(readout.subrun(), 1);
    let second = drain(&readout);
    assert_eq!(sequence_ids(&second), (1..=10).collect::<Vec<_>>());
    readout.stop(TIMEOUT, 0).unwrap();
}

#[test]
fn test_pause_and_resume_continue_the_sequence() {
    let producer = simulator(SimulatorConfig::default());
    let (readout, _metrics) = readout(ignored_config(), producer);

    readout.start(1, TIMEOUT, 0).unwrap();
    let mut before = Vec::new();
    while before.len() < 5 {
        assert!(readout.fetch_next(&mut before));
    }

    readout.pause(TIMEOUT, 0).unwrap();
    assert_eq!(readout.lifecycle_state(), LifecycleState::Paused);
    let paused_at = readout.ev_counter();

    readout.resume(TIMEOUT, 0).unwrap();
    assert_eq!(readout.lifecycle_state(), LifecycleState::Running);
    assert_eq!(readout.subrun(), 2);

    let mut after = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while after.len() < 5 {
        assert!(readout.fetch_next(&mut after));
        assert!(Instant::now() < deadline, "no data after resume");
    }
    assert!(after[0].sequence_id() >= paused_at);
    assert!(after
        .windows(2)
        .all(|pair| pair[0].sequence_id() < pair[1].sequence_id()));

    readout.stop(TIMEOUT, 0).unwrap();
}

#[test]
fn test_commands_rejected_in_wrong_state() {
    let (readout, _metrics) = readout(ignored_config(), simulator(SimulatorConfig::default()));

    assert!(matches!(
        readout.stop(TIMEOUT, 0),
        Err(ReadoutError::InvalidTransition { command: "stop", .. })
    ));
    assert!(matches!(
        readout.resume(TIMEOUT, 0),
        Err(ReadoutError::InvalidTransition { .. })
    ));

    readout.start(1, TIMEOUT, 0).unwrap();
    assert!(matches!(
        readout.start(1, TIMEOUT, 0),
        Err(ReadoutError::InvalidTransition { command: "start", .. })
    ));
    readout.stop(TIMEOUT, 0).unwrap();
}

#[test]
fn test_drop_while_running_joins_threads() {
    let producer = simulator(SimulatorConfig::default());
    let (readout, _metrics) = readout(ignored_config(), producer.clone());
    readout.start(1, TIMEOUT, 0).unwrap();
    std::thread::sleep(Duration::from_millis(10));

    let started = Instant::now();
    drop(readout);
    assert!(started.elapsed() < Duration::from_secs(2));

    // The producer thread released its reference
    assert_eq!(Arc::strong_count(&producer), 1);
}

#[test]
fn test_stop_keeps_buffered_fragments_deliverable() {
    let producer = simulator(SimulatorConfig {
        tick_period: Duration::ZERO,
        max_events: Some(50),
        ..Default::default()
    });
    let (readout, _metrics) = readout(ignored_config(), producer);
    readout.start(1, TIMEOUT, 0).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while readout.stats().producer_running {
        assert!(Instant::now() < deadline, "producer never finished");
        std::thread::sleep(Duration::from_millis(5));
    }
    readout.stop(TIMEOUT, 0).unwrap();
    assert_eq!(readout.lifecycle_state(), LifecycleState::Idle);

    let out = drain(&readout);
    assert_eq!(sequence_ids(&out), (1..=50).collect::<Vec<_>>());
    assert_eq!(readout.buffer_stats().fragments, 0);
}
