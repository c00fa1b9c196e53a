//! Idempotent recovery: splitting the stream at a tick boundary, saving
//! the checkpoint, reloading into a fresh coordinator, and replaying the
//! remainder must yield an identical run record.

use chrono::{DateTime, TimeZone, Utc};
use rstest::rstest;

use kilnwatch_core::{checkpoint, EnabledZones, FsmCfg, RunCoordinator, RunRecord};
use kilnwatch_traits::{Zone, ZoneSample};

fn wall(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).unwrap()
}

fn cfg() -> FsmCfg {
    FsmCfg {
        zones: EnabledZones {
            preheat: true,
            main: true,
            rib: false,
        },
        ..FsmCfg::default()
    }
}

/// Preheat faults on ramp timeout; main ramps at t=1000 s, stabilizes,
/// and completes. Exercises faults, recovery hints, dwell markers, and
/// live Welford state across the split.
fn tick_samples(t_s: u64) -> Vec<ZoneSample> {
    let preheat_sp = if t_s == 0 { 75.0 } else { 400.0 };
    let preheat_temp = (75.0 + t_s as f64 / 12.0).min(150.0);

    let tf = t_s as f64;
    let main_temp = if t_s < 1000 {
        75.0
    } else if t_s < 1170 {
        75.0 + 2.5 * (tf - 1000.0)
    } else if t_s < 1400 {
        500.0
    } else {
        (500.0 - 3.0 * (tf - 1400.0)).max(75.0)
    };
    let main_sp = if t_s < 1000 { 75.0 } else { 500.0 };

    vec![
        ZoneSample {
            zone: Zone::Preheat,
            t_mono_ms: t_s * 1000,
            t_wall: wall(t_s * 1000),
            temperature_f: preheat_temp,
            setpoint_f: preheat_sp,
            valid: true,
        },
        ZoneSample {
            zone: Zone::Main,
            t_mono_ms: t_s * 1000,
            t_wall: wall(t_s * 1000),
            temperature_f: main_temp,
            setpoint_f: main_sp,
            valid: true,
        },
    ]
}

fn drive(coord: &mut RunCoordinator, from_s: u64, to_s: u64) -> Option<RunRecord> {
    let mut closed = None;
    for t in (from_s..to_s).step_by(2) {
        let out = coord.observe(&tick_samples(t));
        if let Some(r) = out.closed_run {
            closed = Some(r);
        }
    }
    closed
}

#[rstest]
#[case(10)]
#[case(24)] // mid setpoint-acceptance dwell
#[case(500)] // mid ramp, long into the stats
#[case(904)] // just after the preheat fault
#[case(1200)] // main stable, dwell markers live
#[case(1440)] // inside the END confirmation dwell
fn split_and_replay_yields_identical_record(#[case] split_s: u64) {
    const END_S: u64 = 1700;

    // uninterrupted reference
    let mut reference = RunCoordinator::new("Line-07", cfg());
    let expected = drive(&mut reference, 0, END_S).expect("reference run closes");

    // split: checkpoint, reload into a fresh coordinator, replay the rest
    let mut first = RunCoordinator::new("Line-07", cfg());
    assert!(drive(&mut first, 0, split_s).is_none(), "must split before close");
    let blob = checkpoint::encode(&first).expect("encode");
    // small blob: the slope windows dominate, everything else is scalar
    assert!(blob.len() <= 64 * 1024, "checkpoint blob {} bytes", blob.len());

    let mut resumed = RunCoordinator::new("Line-07", cfg());
    resumed.restore_state(checkpoint::decode(&blob).expect("decode"));
    let replayed = drive(&mut resumed, split_s, END_S).expect("resumed run closes");

    // NaN-bearing floats compare as JSON (NaN serializes to null)
    let expected_json = serde_json::to_value(&expected).expect("serialize expected");
    let replayed_json = serde_json::to_value(&replayed).expect("serialize replayed");
    assert_eq!(expected_json, replayed_json);
}

#[test]
fn restored_coordinator_preserves_welford_moments_exactly() {
    let mut coord = RunCoordinator::new("Line-07", cfg());
    drive(&mut coord, 0, 600);

    let blob = checkpoint::encode(&coord).expect("encode");
    let state = checkpoint::decode(&blob).expect("decode");
    assert_eq!(state, coord.snapshot_state());
}
