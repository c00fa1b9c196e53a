//! kilnwatch_sim: a deterministic line simulator behind
//! `kilnwatch_traits::SampleSource`.
//!
//! Stands in for the out-of-scope controller poller: each zone follows a
//! scripted setpoint schedule and a first-order thermal lag toward it,
//! with a small deterministic wobble so stable plateaus look like real
//! sensor data. Useful for demos, CLI runs, and integration tests.

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kilnwatch_traits::{Clock, SampleSource, Zone, ZoneSample};

/// Integration step for the thermal model.
const SIM_STEP_MS: u64 = 500;
/// Wobble amplitude around a settled plateau, °F.
const WOBBLE_F: f64 = 1.5;

/// One zone's scripted behavior.
#[derive(Debug, Clone)]
pub struct ZoneProfile {
    /// Starting temperature and idle setpoint, °F.
    pub ambient_f: f64,
    /// `(at_ms, setpoint_F)` steps, sorted by time. Before the first step
    /// the setpoint is `ambient_f`.
    pub steps: Vec<(u64, f64)>,
    /// First-order lag time constant, seconds.
    pub tau_s: f64,
    /// When false the zone reports invalid samples.
    pub healthy: bool,
}

impl ZoneProfile {
    pub fn idle(ambient_f: f64) -> Self {
        Self {
            ambient_f,
            steps: Vec::new(),
            tau_s: 60.0,
            healthy: true,
        }
    }

    fn setpoint_at(&self, t_ms: u64) -> f64 {
        let mut sp = self.ambient_f;
        for &(at, v) in &self.steps {
            if t_ms >= at {
                sp = v;
            } else {
                break;
            }
        }
        sp
    }
}

/// A full-cycle demo schedule for one line: preheat, then main, then rib,
/// each stepped up and later returned to idle.
pub fn demo_profiles(ambient_f: f64) -> HashMap<Zone, ZoneProfile> {
    let mut profiles = HashMap::new();
    profiles.insert(
        Zone::Preheat,
        ZoneProfile {
            steps: vec![(10_000, 300.0), (400_000, ambient_f)],
            tau_s: 45.0,
            ..ZoneProfile::idle(ambient_f)
        },
    );
    profiles.insert(
        Zone::Main,
        ZoneProfile {
            steps: vec![(420_000, 500.0), (900_000, ambient_f)],
            tau_s: 60.0,
            ..ZoneProfile::idle(ambient_f)
        },
    );
    profiles.insert(
        Zone::Rib,
        ZoneProfile {
            steps: vec![(920_000, 450.0), (1_300_000, ambient_f)],
            tau_s: 50.0,
            ..ZoneProfile::idle(ambient_f)
        },
    );
    profiles
}

struct ZoneSim {
    profile: ZoneProfile,
    temp_f: f64,
    last_ms: u64,
}

/// Simulated production line. Shared between workers; `get_latest`
/// advances each zone's thermal state to the clock's current time.
pub struct SimulatedLine {
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    zones: Mutex<HashMap<Zone, ZoneSim>>,
}

impl SimulatedLine {
    pub fn new(
        clock: Arc<dyn Clock + Send + Sync>,
        profiles: HashMap<Zone, ZoneProfile>,
    ) -> Self {
        let epoch = clock.now();
        let zones = profiles
            .into_iter()
            .map(|(z, p)| {
                let temp = p.ambient_f;
                (
                    z,
                    ZoneSim {
                        profile: p,
                        temp_f: temp,
                        last_ms: 0,
                    },
                )
            })
            .collect();
        Self {
            clock,
            epoch,
            zones: Mutex::new(zones),
        }
    }

    /// Flip a zone's health at runtime (dropout scenarios).
    pub fn set_healthy(&self, zone: Zone, healthy: bool) {
        if let Ok(mut zones) = self.zones.lock() {
            if let Some(sim) = zones.get_mut(&zone) {
                sim.profile.healthy = healthy;
            }
        }
    }

    fn advance(sim: &mut ZoneSim, now_ms: u64) {
        let tau_ms = (sim.profile.tau_s * 1000.0).max(1.0);
        let mut t = sim.last_ms;
        while t < now_ms {
            let step = SIM_STEP_MS.min(now_ms - t);
            t += step;
            let sp = sim.profile.setpoint_at(t);
            let k = 1.0 - (-(step as f64) / tau_ms).exp();
            sim.temp_f += (sp - sim.temp_f) * k;
        }
        sim.last_ms = now_ms;
    }

    fn wobble(now_ms: u64) -> f64 {
        // slow deterministic ripple, period ~40 s
        WOBBLE_F * ((now_ms as f64) / 40_000.0 * std::f64::consts::TAU).sin()
    }
}

impl SampleSource for SimulatedLine {
    fn get_latest(
        &self,
        zone: Zone,
    ) -> Result<Option<ZoneSample>, Box<dyn Error + Send + Sync>> {
        let now_ms = self.clock.ms_since(self.epoch);
        let now_wall = self.clock.wall_now();
        let mut zones = self
            .zones
            .lock()
            .map_err(|_| std::io::Error::other("simulated line poisoned"))?;
        let Some(sim) = zones.get_mut(&zone) else {
            return Ok(None);
        };
        Self::advance(sim, now_ms);
        if !sim.profile.healthy {
            return Ok(Some(ZoneSample::invalid(zone, now_ms, now_wall)));
        }
        Ok(Some(ZoneSample {
            zone,
            t_mono_ms: now_ms,
            t_wall: now_wall,
            temperature_f: sim.temp_f + Self::wobble(now_ms),
            setpoint_f: sim.profile.setpoint_at(now_ms),
            valid: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kilnwatch_traits::ManualClock;
    use std::time::Duration;

    #[test]
    fn zone_approaches_setpoint() {
        let clock = Arc::new(ManualClock::default());
        let mut profiles = HashMap::new();
        profiles.insert(
            Zone::Preheat,
            ZoneProfile {
                steps: vec![(0, 300.0)],
                tau_s: 30.0,
                ..ZoneProfile::idle(75.0)
            },
        );
        let line = SimulatedLine::new(clock.clone(), profiles);

        clock.advance(Duration::from_secs(300));
        let s = line.get_latest(Zone::Preheat).unwrap().unwrap();
        assert!(s.valid);
        assert!(
            (s.temperature_f - 300.0).abs() < 5.0,
            "temp {} after 10 tau",
            s.temperature_f
        );
    }

    #[test]
    fn unhealthy_zone_reports_invalid() {
        let clock = Arc::new(ManualClock::default());
        let mut profiles = HashMap::new();
        profiles.insert(Zone::Main, ZoneProfile::idle(75.0));
        let line = SimulatedLine::new(clock.clone(), profiles);
        line.set_healthy(Zone::Main, false);
        clock.advance(Duration::from_secs(2));
        let s = line.get_latest(Zone::Main).unwrap().unwrap();
        assert!(!s.valid);
    }

    #[test]
    fn unknown_zone_yields_none() {
        let clock = Arc::new(ManualClock::default());
        let line = SimulatedLine::new(clock, HashMap::new());
        assert!(line.get_latest(Zone::Rib).unwrap().is_none());
    }
}
