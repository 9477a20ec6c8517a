use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;

/// Source of temperature samples in millidegrees Celsius.
#[cfg_attr(test, mockall::automock)]
pub trait TemperatureProbe {
    fn read_millideg(&mut self) -> Result<f64>;
}

/// Reads an hwmon-style sensor file: one decimal value per line,
/// millidegrees Celsius (e.g. `/sys/class/hwmon/hwmon0/temp1_input`).
pub struct HwmonProbe {
    path: PathBuf,
}

impl HwmonProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HwmonProbe { path: path.into() }
    }
}

impl TemperatureProbe for HwmonProbe {
    fn read_millideg(&mut self) -> Result<f64> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_millideg(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// First comma/newline-separated token of the first line, as a double.
pub fn parse_millideg(contents: &str) -> Result<f64> {
    let line = match contents.lines().next() {
        Some(l) => l,
        None => bail!("empty sensor file"),
    };
    let token = line.split(',').next().unwrap_or("");
    if token.is_empty() {
        bail!("empty sensor value");
    }
    token
        .parse::<f64>()
        .with_context(|| format!("bad sensor value {:?}", token))
}
