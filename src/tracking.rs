//! Chrony tracking oracle.
//!
//! The controller never talks NTP itself; it asks `chronyc -c tracking` for
//! chronyd's view of the clock and extracts the four fields it needs. The
//! subprocess is hidden behind [`TrackingSource`] so tests can inject a
//! scripted oracle instead.

use anyhow::{bail, Context, Result};
use std::process::Command;

/// The slice of `chronyc -c tracking` the controller consumes.
///
/// Fields 4, 8, 9 and 10 (1-indexed) of the CSV line: reference timestamp,
/// frequency estimate (ppm), residual frequency (ppm) and skew (ppm).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tracking {
    pub ref_time: f64,
    pub freq_ppm: f64,
    pub residual_ppm: f64,
    pub skew_ppm: f64,
}

#[cfg_attr(test, mockall::automock)]
pub trait TrackingSource {
    fn sample(&mut self) -> Result<Tracking>;
}

/// Spawns `chronyc -c tracking` and parses its single CSV line.
pub struct ChronycTracking;

impl TrackingSource for ChronycTracking {
    fn sample(&mut self) -> Result<Tracking> {
        let out = Command::new("chronyc")
            .args(["-c", "tracking"])
            .output()
            .context("spawning chronyc")?;
        if !out.status.success() {
            bail!("chronyc exited with {}", out.status);
        }
        let stdout = std::str::from_utf8(&out.stdout).context("chronyc output not UTF-8")?;
        let line = match stdout.lines().next() {
            Some(l) => l,
            None => bail!("chronyc produced no output"),
        };
        parse_tracking(line)
    }
}

pub fn parse_tracking(line: &str) -> Result<Tracking> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 10 {
        bail!("tracking line has {} fields, need at least 10", fields.len());
    }
    let num = |idx: usize| -> Result<f64> {
        fields[idx]
            .parse::<f64>()
            .with_context(|| format!("tracking field {} is {:?}", idx + 1, fields[idx]))
    };
    Ok(Tracking {
        ref_time: num(3)?,
        freq_ppm: num(7)?,
        residual_ppm: num(8)?,
        skew_ppm: num(9)?,
    })
}
