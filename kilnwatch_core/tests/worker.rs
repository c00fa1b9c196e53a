//! Worker-level behavior: staleness, persistence, degraded mode, restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use kilnwatch_core::mocks::{ScriptedSource, SharedSink};
use kilnwatch_core::{BuildError, EnabledZones, FsmCfg, FsmWorker, Termination};
use kilnwatch_traits::{ManualClock, Zone, ZoneSample};

fn wall(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).unwrap()
}

fn preheat_cfg() -> FsmCfg {
    FsmCfg {
        zones: EnabledZones {
            preheat: true,
            main: false,
            rib: false,
        },
        ..FsmCfg::default()
    }
}

/// Nominal preheat profile, one sample per 2 s tick, `t` starting at 2 s
/// to line up with a worker whose clock advances before each tick.
fn scripted_cycle(source: &ScriptedSource, ticks: u64) {
    for k in 0..ticks {
        let t_s = (k + 1) * 2;
        let t = t_s as f64;
        let temp = if t < 10.0 {
            75.0
        } else if t < 130.0 {
            75.0 + 1.875 * (t - 10.0)
        } else if t < 330.0 {
            300.0
        } else {
            (300.0 - 2.0 * (t - 330.0)).max(200.0)
        };
        let sp = if t_s < 10 || t_s >= 330 { 75.0 } else { 300.0 };
        source.push(ZoneSample {
            zone: Zone::Preheat,
            t_mono_ms: t_s * 1000,
            t_wall: wall(t_s * 1000),
            temperature_f: temp,
            setpoint_f: sp,
            valid: true,
        });
    }
}

fn build_worker(
    source: Arc<ScriptedSource>,
    sink: SharedSink,
    clock: Arc<ManualClock>,
) -> FsmWorker {
    FsmWorker::builder("Line-07", preheat_cfg())
        .with_source(source)
        .with_sink(Box::new(sink))
        .with_clock(clock)
        .try_build()
        .expect("build worker")
}

#[test]
fn builder_requires_source_and_sink() {
    let err = FsmWorker::builder("Line-07", preheat_cfg())
        .try_build()
        .expect_err("must refuse without source");
    assert!(err.downcast_ref::<BuildError>().is_some());

    let err = FsmWorker::builder("Line-07", preheat_cfg())
        .with_source(Arc::new(ScriptedSource::new()))
        .try_build()
        .expect_err("must refuse without sink");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::MissingSink)
    ));
}

#[test]
fn invalid_config_is_fatal_at_build() {
    let cfg = FsmCfg {
        sampling_period_s: 0.0,
        ..preheat_cfg()
    };
    let err = FsmWorker::builder("Line-07", cfg)
        .with_source(Arc::new(ScriptedSource::new()))
        .with_sink(Box::new(SharedSink::new()))
        .try_build()
        .expect_err("must refuse invalid config");
    assert!(format!("{err}").contains("sampling_period_s"));
}

#[test]
fn stale_samples_are_invalidated() {
    let source = Arc::new(ScriptedSource::new());
    // a single old sample: by the time the worker looks, it is >3 ticks old
    source.push(ZoneSample {
        zone: Zone::Preheat,
        t_mono_ms: 1000,
        t_wall: wall(1000),
        temperature_f: 80.0,
        setpoint_f: 80.0,
        valid: true,
    });
    let sink = SharedSink::new();
    let clock = Arc::new(ManualClock::default());
    let mut worker = build_worker(source, sink, clock.clone());

    clock.advance(Duration::from_secs(10));
    worker.tick();

    let status = worker.status();
    assert_eq!(status.ticks, 1);
    assert_eq!(status.samples_processed, 0, "stale sample must not count");
}

#[test]
fn full_cycle_persists_run_and_checkpoints() {
    const TICKS: u64 = 300;
    let source = Arc::new(ScriptedSource::new());
    scripted_cycle(&source, TICKS);
    let sink = SharedSink::new();
    let clock = Arc::new(ManualClock::default());
    let mut worker = build_worker(source, sink.clone(), clock.clone());

    for _ in 0..TICKS {
        clock.advance(Duration::from_secs(2));
        worker.tick();
    }

    let status = worker.status();
    assert_eq!(status.ticks, TICKS);
    assert!(status.events_generated > 0);
    assert!(!status.degraded);

    sink.with(|s| {
        assert_eq!(s.state_saves, TICKS, "one checkpoint per tick");
        assert_eq!(s.runs.len(), 1, "exactly one run record");
        assert_eq!(s.runs[0].termination, Termination::Completed);
        assert_eq!(s.stages.len(), 1);
        assert!(!s.events.is_empty());
    });
}

#[test]
fn degraded_sink_buffers_until_recovery_and_never_loses_the_run() {
    const TICKS: u64 = 300;
    let source = Arc::new(ScriptedSource::new());
    scripted_cycle(&source, TICKS);
    let sink = SharedSink::new();
    // every write fails for a while: checkpoint + appends
    sink.with(|s| s.fail_next_writes = 60);
    let clock = Arc::new(ManualClock::default());
    let mut worker = build_worker(source, sink.clone(), clock.clone());

    let mut saw_degraded = false;
    for _ in 0..TICKS {
        clock.advance(Duration::from_secs(2));
        worker.tick();
        saw_degraded |= worker.status().degraded;
    }

    assert!(saw_degraded, "sustained failures must degrade the worker");
    let status = worker.status();
    assert!(!status.degraded, "worker must recover once writes succeed");
    assert_eq!(status.events_dropped, 0, "queue never overflowed here");

    sink.with(|s| {
        assert_eq!(s.runs.len(), 1, "run record survives the outage");
        assert_eq!(s.runs[0].termination, Termination::Completed);
        // buffered events were flushed after recovery
        assert!(s
            .events
            .iter()
            .any(|e| e.kind == kilnwatch_core::EventKind::RunOpened));
    });
}

#[test]
fn restart_resumes_open_run_from_checkpoint() {
    const TICKS: u64 = 300;
    const SPLIT: u64 = 80; // mid-ramp
    let source = Arc::new(ScriptedSource::new());
    scripted_cycle(&source, TICKS);
    let sink = SharedSink::new();

    let clock1 = Arc::new(ManualClock::default());
    let mut worker = build_worker(source.clone(), sink.clone(), clock1.clone());
    for _ in 0..SPLIT {
        clock1.advance(Duration::from_secs(2));
        worker.tick();
    }
    let run_id = worker
        .status()
        .run
        .run_id
        .clone()
        .expect("run open at split");
    drop(worker);

    // a new incarnation picks the run up from the last checkpoint
    let clock2 = Arc::new(ManualClock::default());
    let mut worker = build_worker(source, sink.clone(), clock2.clone());
    assert_eq!(
        worker.status().run.run_id.as_deref(),
        Some(run_id.as_str()),
        "run must resume"
    );
    for _ in SPLIT..TICKS {
        clock2.advance(Duration::from_secs(2));
        worker.tick();
    }

    sink.with(|s| {
        assert_eq!(s.runs.len(), 1, "resumed run closes exactly once");
        assert_eq!(s.runs[0].run_id, run_id);
        assert_eq!(s.runs[0].termination, Termination::Completed);
    });
}

#[test]
fn abort_run_emits_aborted_record() {
    let source = Arc::new(ScriptedSource::new());
    scripted_cycle(&source, 40);
    let sink = SharedSink::new();
    let clock = Arc::new(ManualClock::default());
    let mut worker = build_worker(source, sink.clone(), clock.clone());

    for _ in 0..20 {
        clock.advance(Duration::from_secs(2));
        worker.tick();
    }
    assert!(worker.status().run.run_id.is_some(), "run open before abort");

    worker.abort_run("operator request");

    sink.with(|s| {
        assert_eq!(s.runs.len(), 1);
        assert_eq!(s.runs[0].termination, Termination::Aborted);
    });
    assert!(worker.status().run.run_id.is_none());
}
