//! Plateau controller for thermal frequency calibration.
//!
//! The controller walks the CPU through a rising staircase of temperature
//! plateaus. At 1 Hz it folds the sensor reading into an 8-sample moving
//! average, nudges the PWM duty toward the current target with a three-band
//! deadband, and holds each plateau until chronyd's tracking state has
//! settled (enough tracking updates, zero residual, skew under the bound).
//! Each accepted plateau yields one (temperature, frequency) calibration
//! point and raises the target by one degree.
//!
//! The deadband is asymmetric in display only: saturating at either end of
//! the duty range replaces the trend arrow so a pegged actuator is visible
//! in the status line.

use anyhow::{Context, Result};

use crate::sensor::TemperatureProbe;
use crate::tracking::{Tracking, TrackingSource};

/// Full-scale PWM on-duration: one whole second.
pub const PULSE_MAX_NS: i64 = 1_000_000_000;

const WINDOW: usize = 8;

/// Consecutive plateau misses (one per second) before giving up.
const MISS_LIMIT: u32 = 3600;

/// One degree of stability margin required around the lock-on average.
const LOCK_BAND_MILLIDEG: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusLine {
    pub avg_millideg: f64,
    /// `None` while still seeking the first plateau.
    pub target_millideg: Option<f64>,
    pub arrow: &'static str,
    pub freq_ppm: f64,
    pub residual_ppm: f64,
    pub skew_ppm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateauRecord {
    pub avg_millideg: f64,
    pub freq_ppm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The staircase passed the configured maximum temperature.
    Complete,
    /// An hour without an accepted plateau.
    NoConvergence,
}

/// Everything one controller tick produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub line: Option<StatusLine>,
    pub plateau: Option<PlateauRecord>,
    pub stop: Option<StopReason>,
}

impl StepOutcome {
    fn quiet() -> Self {
        StepOutcome {
            line: None,
            plateau: None,
            stop: None,
        }
    }
}

pub struct PlateauController {
    window: [f64; WINDOW],
    idx: usize,
    filled: usize,
    locked: bool,

    target: f64,
    high: f64,
    pulse: i64,

    exact: bool,
    wait: u32,
    minskew: f64,

    ticks: u32,
    base: u32,
    nohit: u32,
    prev_time: f64,
}

impl PlateauController {
    pub fn new(high_millideg: f64, wait: u32, minskew_ppm: f64, exact: bool) -> Self {
        PlateauController {
            window: [0.0; WINDOW],
            idx: 0,
            filled: 0,
            locked: false,
            target: 0.0,
            high: high_millideg,
            pulse: 0,
            exact,
            wait,
            minskew: minskew_ppm,
            ticks: 0,
            base: 0,
            nohit: 0,
            prev_time: 0.0,
        }
    }

    /// Current commanded PWM on-duration in nanoseconds.
    pub fn pulse(&self) -> i64 {
        self.pulse
    }

    pub fn target_millideg(&self) -> f64 {
        self.target
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn average(&self) -> f64 {
        self.window.iter().sum::<f64>() / WINDOW as f64
    }

    /// One 1 Hz tick: a fresh sensor sample plus chrony's tracking state.
    pub fn step(&mut self, millideg: f64, t: &Tracking) -> StepOutcome {
        // Tracking updates are slower than our tick; count only changes.
        if t.ref_time != self.prev_time {
            self.ticks = self.ticks.wrapping_add(1);
            self.prev_time = t.ref_time;
        }

        self.window[self.idx] = millideg;
        self.idx = (self.idx + 1) % WINDOW;
        if self.filled < WINDOW {
            self.filled += 1;
            return StepOutcome::quiet();
        }

        let mut plateau = None;
        if !self.locked {
            let avg = self.average();
            let line = StatusLine {
                avg_millideg: avg,
                target_millideg: None,
                arrow: " - ",
                freq_ppm: t.freq_ppm,
                residual_ppm: t.residual_ppm,
                skew_ppm: t.skew_ppm,
            };
            let steady_env = self
                .window
                .iter()
                .all(|&d| d + LOCK_BAND_MILLIDEG >= avg && d - LOCK_BAND_MILLIDEG <= avg);
            if !(steady_env && t.residual_ppm == 0.0 && t.skew_ppm <= self.minskew) {
                return self.miss(Some(line), None);
            }

            // Next whole degree at or above the settled average.
            self.target = (((avg + 999.0) as i64) / 1000 * 1000) as f64;
            self.locked = true;
            self.base = self.ticks;
            self.nohit = 0;
            if avg == self.target {
                plateau = Some(PlateauRecord {
                    avg_millideg: avg,
                    freq_ppm: t.freq_ppm,
                });
                self.target += 1000.0;
            }
            if self.target > self.high {
                return StepOutcome {
                    line: Some(line),
                    plateau,
                    stop: Some(StopReason::Complete),
                };
            }
            // Fall through: the lock-on tick already steers.
        }

        let avg = self.average();
        let (delta, arrow) = self.steer(avg);
        let line = StatusLine {
            avg_millideg: avg,
            target_millideg: Some(self.target),
            arrow,
            freq_ppm: t.freq_ppm,
            residual_ppm: t.residual_ppm,
            skew_ppm: t.skew_ppm,
        };

        let on_plateau = if self.exact {
            delta == 0
        } else {
            delta <= 100_000
        };
        let settled = self.ticks.wrapping_sub(self.base) >= self.wait
            && t.residual_ppm == 0.0
            && t.skew_ppm <= self.minskew;
        if !(on_plateau && settled) {
            return self.miss(Some(line), plateau);
        }

        self.target += 1000.0;
        self.base = self.ticks;
        self.nohit = 0;
        StepOutcome {
            line: Some(line),
            plateau: Some(PlateauRecord {
                avg_millideg: avg,
                freq_ppm: t.freq_ppm,
            }),
            stop: (self.target > self.high).then_some(StopReason::Complete),
        }
    }

    fn miss(&mut self, line: Option<StatusLine>, plateau: Option<PlateauRecord>) -> StepOutcome {
        self.nohit += 1;
        StepOutcome {
            line,
            plateau,
            stop: (self.nohit >= MISS_LIMIT).then_some(StopReason::NoConvergence),
        }
    }

    /// Three-band deadband with saturation-aware arrows.
    fn steer(&mut self, avg: f64) -> (i64, &'static str) {
        if avg < self.target {
            let gap = self.target - avg;
            let (delta, mut arrow) = if gap > 500.0 {
                (1_000_000, ">>>")
            } else if gap > 250.0 {
                (500_000, " >>")
            } else {
                (100_000, " > ")
            };
            if self.pulse + delta > PULSE_MAX_NS {
                self.pulse = PULSE_MAX_NS;
                arrow = " >|";
            } else {
                self.pulse += delta;
            }
            (delta, arrow)
        } else if avg > self.target {
            let gap = avg - self.target;
            let (delta, mut arrow) = if gap > 500.0 {
                (1_000_000, "<<<")
            } else if gap > 250.0 {
                (500_000, "<< ")
            } else {
                (100_000, " < ")
            };
            if self.pulse - delta < 0 {
                self.pulse = 0;
                arrow = "|< ";
            } else {
                self.pulse -= delta;
            }
            (delta, arrow)
        } else {
            (0, " - ")
        }
    }
}

/// Wires a temperature probe and the chrony oracle to the controller.
pub struct Calibrator<P: TemperatureProbe, T: TrackingSource> {
    probe: P,
    chrony: T,
    pub controller: PlateauController,
}

impl<P: TemperatureProbe, T: TrackingSource> Calibrator<P, T> {
    pub fn new(probe: P, chrony: T, controller: PlateauController) -> Self {
        Calibrator {
            probe,
            chrony,
            controller,
        }
    }

    pub fn tick(&mut self) -> Result<StepOutcome> {
        let millideg = self
            .probe
            .read_millideg()
            .context("can't read temperature data")?;
        let tracking = self
            .chrony
            .sample()
            .context("can't get chrony tracking data")?;
        Ok(self.controller.step(millideg, &tracking))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::MockTemperatureProbe;
    use crate::tracking::MockTrackingSource;

    fn tracking(time: f64, freq: f64, res: f64, skew: f64) -> Tracking {
        Tracking {
            ref_time: time,
            freq_ppm: freq,
            residual_ppm: res,
            skew_ppm: skew,
        }
    }

    fn good_tracking(time: f64) -> Tracking {
        tracking(time, -3.21, 0.0, 0.010)
    }

    /// A controller already locked onto `target` with a uniform window.
    fn locked(target: f64, window_val: f64, pulse: i64) -> PlateauController {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        c.window = [window_val; WINDOW];
        c.filled = WINDOW;
        c.locked = true;
        c.target = target;
        c.pulse = pulse;
        c
    }

    /// Step with a sample equal to the uniform window so the average is
    /// unchanged by the ring-buffer insert.
    fn steady_step(c: &mut PlateauController, t: &Tracking) -> StepOutcome {
        let val = c.window[0];
        c.step(val, t)
    }

    #[test]
    fn warmup_is_quiet_for_eight_samples() {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        for i in 0..8 {
            let out = c.step(70_000.0, &good_tracking(100.0 + i as f64));
            assert_eq!(out, StepOutcome::quiet(), "tick {}", i);
        }
    }

    #[test]
    fn ninth_sample_locks_prints_plateau_and_advances() {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        for _ in 0..8 {
            c.step(70_000.0, &good_tracking(100.0));
        }
        let out = c.step(70_000.0, &good_tracking(100.0));
        assert_eq!(
            out.plateau,
            Some(PlateauRecord {
                avg_millideg: 70_000.0,
                freq_ppm: -3.21
            })
        );
        assert_eq!(c.target_millideg(), 71_000.0);
        assert!(c.is_locked());
        // The lock-on tick already steers toward the new target.
        let line = out.line.unwrap();
        assert_eq!(line.target_millideg, Some(71_000.0));
        assert_eq!(line.arrow, ">>>");
        assert_eq!(c.pulse(), 1_000_000);
        assert!(out.stop.is_none());
    }

    #[test]
    fn lock_on_rounds_up_to_next_degree() {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        for _ in 0..9 {
            c.step(70_400.0, &good_tracking(100.0));
        }
        assert!(c.is_locked());
        assert_eq!(c.target_millideg(), 71_000.0);
    }

    #[test]
    fn lock_on_needs_a_steady_environment() {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        for _ in 0..8 {
            c.step(70_000.0, &good_tracking(100.0));
        }
        // One sample more than a degree off the mean spoils the window.
        let out = c.step(78_000.0, &good_tracking(100.0));
        assert!(!c.is_locked());
        assert_eq!(out.line.unwrap().target_millideg, None);
    }

    #[test]
    fn lock_on_needs_settled_chrony() {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        for _ in 0..8 {
            c.step(70_000.0, &good_tracking(100.0));
        }
        let out = c.step(70_000.0, &tracking(100.0, -3.21, 0.0, 0.5));
        assert!(!c.is_locked());
        assert!(out.plateau.is_none());
    }

    #[test]
    fn band_arrows_and_deltas() {
        // (window temperature, expected arrow, expected pulse change)
        let cases = [
            (70_400.0, ">>>", 1_000_000),
            (70_700.0, " >>", 500_000),
            (70_800.0, " > ", 100_000),
            (71_000.0, " - ", 0),
            (71_200.0, " < ", -100_000),
            (71_300.0, "<< ", -500_000),
            (71_600.0, "<<<", -1_000_000),
        ];
        for (temp, arrow, change) in cases {
            let mut c = locked(71_000.0, temp, 500_000_000);
            let out = steady_step(&mut c, &good_tracking(100.0));
            let line = out.line.unwrap();
            assert_eq!(line.arrow, arrow, "temp {}", temp);
            assert_eq!(c.pulse(), 500_000_000 + change, "temp {}", temp);
        }
    }

    #[test]
    fn band_edges_are_strict() {
        // Exactly 500 below the target is the middle band, not the outer.
        let mut c = locked(71_000.0, 70_500.0, 0);
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert_eq!(out.line.unwrap().arrow, " >>");
        // Exactly 250 below is the inner band.
        let mut c = locked(71_000.0, 70_750.0, 0);
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert_eq!(out.line.unwrap().arrow, " > ");
    }

    #[test]
    fn saturation_clamps_and_flags() {
        let mut c = locked(72_000.0, 70_000.0, 999_500_000);
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert_eq!(c.pulse(), PULSE_MAX_NS);
        assert_eq!(out.line.unwrap().arrow, " >|");

        let mut c = locked(70_000.0, 71_600.0, 500_000);
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert_eq!(c.pulse(), 0);
        assert_eq!(out.line.unwrap().arrow, "|< ");
    }

    #[test]
    fn exact_landing_keeps_the_plain_arrow() {
        // Reaching the rail exactly is not a saturation.
        let mut c = locked(72_000.0, 70_000.0, 999_000_000);
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert_eq!(c.pulse(), PULSE_MAX_NS);
        assert_eq!(out.line.unwrap().arrow, ">>>");
    }

    #[test]
    fn pulse_stays_in_range_under_any_sequence() {
        let mut c = locked(71_000.0, 71_000.0, 0);
        let temps = [
            60_000.0, 80_000.0, 70_900.0, 71_100.0, 50_000.0, 95_000.0, 71_000.0,
        ];
        for round in 0..2000 {
            let temp = temps[round % temps.len()];
            c.window = [temp; WINDOW];
            steady_step(&mut c, &good_tracking(100.0));
            assert!(
                (0..=PULSE_MAX_NS).contains(&c.pulse()),
                "pulse {} out of range",
                c.pulse()
            );
        }
    }

    #[test]
    fn exact_mode_accepts_only_zero_delta() {
        let mut c = locked(71_000.0, 71_000.0, 100_000_000);
        c.ticks = 10;
        c.base = 0;
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_some());
        assert_eq!(c.target_millideg(), 72_000.0);

        let mut c = locked(71_000.0, 70_800.0, 100_000_000);
        c.ticks = 10;
        c.base = 0;
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_none());
    }

    #[test]
    fn relaxed_mode_accepts_the_inner_band() {
        let mut c = locked(71_000.0, 70_800.0, 100_000_000);
        c.exact = false;
        c.ticks = 10;
        c.base = 0;
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_some());
        assert_eq!(c.target_millideg(), 72_000.0);

        // The middle band is still too far off.
        let mut c = locked(71_000.0, 70_700.0, 100_000_000);
        c.exact = false;
        c.ticks = 10;
        c.base = 0;
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_none());
    }

    #[test]
    fn acceptance_waits_for_tracking_updates() {
        let mut c = locked(71_000.0, 71_000.0, 100_000_000);
        c.ticks = 3;
        c.base = 0;
        c.wait = 5;
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_none());
    }

    #[test]
    fn acceptance_gates_on_residual_and_skew() {
        let mut c = locked(71_000.0, 71_000.0, 100_000_000);
        c.ticks = 10;
        let out = steady_step(&mut c, &tracking(100.0, -3.2, 0.001, 0.010));
        assert!(out.plateau.is_none());

        let mut c = locked(71_000.0, 71_000.0, 100_000_000);
        c.ticks = 10;
        let out = steady_step(&mut c, &tracking(100.0, -3.2, 0.0, 0.020));
        assert!(out.plateau.is_none());
    }

    #[test]
    fn an_hour_of_misses_gives_up() {
        let mut c = locked(71_000.0, 70_600.0, 0);
        let mut stopped = None;
        for i in 0..MISS_LIMIT {
            let out = steady_step(&mut c, &good_tracking(100.0));
            if out.stop.is_some() {
                stopped = Some((i, out.stop.unwrap()));
                break;
            }
        }
        let (i, reason) = stopped.expect("controller never gave up");
        assert_eq!(reason, StopReason::NoConvergence);
        assert_eq!(i, MISS_LIMIT - 1);
    }

    #[test]
    fn an_accepted_plateau_resets_the_miss_count() {
        let mut c = locked(71_000.0, 70_600.0, 0);
        for _ in 0..1000 {
            steady_step(&mut c, &good_tracking(100.0));
        }
        // Land on the plateau and settle.
        c.window = [71_000.0; WINDOW];
        c.ticks = c.base.wrapping_add(10);
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_some());
        assert_eq!(c.nohit, 0);
    }

    #[test]
    fn passing_the_maximum_completes() {
        let mut c = locked(85_000.0, 85_000.0, 200_000_000);
        c.ticks = 10;
        let out = steady_step(&mut c, &good_tracking(100.0));
        assert!(out.plateau.is_some());
        assert_eq!(out.stop, Some(StopReason::Complete));
    }

    #[test]
    fn tracking_ticks_count_only_changes() {
        let mut c = PlateauController::new(85_000.0, 5, 0.015, true);
        c.step(70_000.0, &good_tracking(100.0));
        c.step(70_000.0, &good_tracking(100.0));
        c.step(70_000.0, &good_tracking(101.0));
        assert_eq!(c.ticks, 2);
    }

    #[test]
    fn calibrator_contextualizes_probe_errors() {
        let mut probe = MockTemperatureProbe::new();
        probe
            .expect_read_millideg()
            .returning(|| Err(anyhow::anyhow!("io")));
        let chrony = MockTrackingSource::new();
        let mut cal = Calibrator::new(
            probe,
            chrony,
            PlateauController::new(85_000.0, 5, 0.015, true),
        );
        let err = cal.tick().unwrap_err();
        assert!(err.to_string().contains("can't read temperature data"));
    }

    #[test]
    fn calibrator_feeds_the_controller() {
        let mut probe = MockTemperatureProbe::new();
        probe.expect_read_millideg().returning(|| Ok(70_000.0));
        let mut chrony = MockTrackingSource::new();
        chrony.expect_sample().returning(|| {
            Ok(Tracking {
                ref_time: 100.0,
                freq_ppm: -3.21,
                residual_ppm: 0.0,
                skew_ppm: 0.010,
            })
        });
        let mut cal = Calibrator::new(
            probe,
            chrony,
            PlateauController::new(85_000.0, 5, 0.015, true),
        );
        for _ in 0..8 {
            assert_eq!(cal.tick().unwrap(), StepOutcome::quiet());
        }
        let out = cal.tick().unwrap();
        assert!(out.plateau.is_some());
    }
}
