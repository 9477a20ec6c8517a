//! Per-CPU idle-state plumbing.
//!
//! Two ways to steer the kernel away from deep idle: the per-state
//! `cpuidle/stateN/disable` knobs of one CPU, or the system-wide
//! `/dev/cpu_dma_latency` hint. Discovery and handle setup happen once at
//! startup; afterwards only writes to the already-open handles occur.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::phase::{IdleAction, PhaseConfig};

pub const SYSFS_CPU: &str = "/sys/devices/system/cpu";
pub const CPU_DMA_LATENCY: &str = "/dev/cpu_dma_latency";

/// Kernel ceiling on the number of cpuidle states.
pub const MAX_IDLE_STATES: usize = 32;

fn state_dir(base: &Path, cpu: usize, state: usize) -> PathBuf {
    base.join(format!("cpu{}/cpuidle/state{}", cpu, state))
}

/// Counts the contiguous run of states exposing a `disable` knob.
pub fn discover(cpu: usize) -> Result<usize> {
    discover_in(Path::new(SYSFS_CPU), cpu)
}

pub fn discover_in(base: &Path, cpu: usize) -> Result<usize> {
    let mut max = 0;
    for i in 0..MAX_IDLE_STATES {
        if state_dir(base, cpu, i).join("disable").is_file() {
            max = i + 1;
        } else {
            break;
        }
    }
    if max == 0 {
        bail!("cpu{} exposes no cpuidle disable knobs", cpu);
    }
    Ok(max)
}

/// Index of the first state whose exit latency exceeds `thres_us`.
///
/// If every state is below the threshold the deepest state is returned.
/// An answer of zero means even state 1 is too slow, which makes the
/// shallow-hold phases meaningless.
pub fn latency_boundary(cpu: usize, max: usize, thres_us: i64) -> Result<usize> {
    latency_boundary_in(Path::new(SYSFS_CPU), cpu, max, thres_us)
}

pub fn latency_boundary_in(base: &Path, cpu: usize, max: usize, thres_us: i64) -> Result<usize> {
    let mut high = 0;
    for i in 0..max {
        let path = state_dir(base, cpu, i).join("latency");
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => break,
        };
        let val: i64 = match text.trim().parse() {
            Ok(v) => v,
            Err(_) => break,
        };
        high = i;
        if val > thres_us {
            break;
        }
    }
    if high == 0 {
        bail!(
            "cpu{} has no usable idle state below the {} us threshold",
            cpu,
            thres_us
        );
    }
    Ok(high)
}

/// Opens every `disable` knob of `cpu` write-only.
pub fn open_disable_knobs(cpu: usize, max: usize) -> Result<Vec<File>> {
    open_disable_knobs_in(Path::new(SYSFS_CPU), cpu, max)
}

pub fn open_disable_knobs_in(base: &Path, cpu: usize, max: usize) -> Result<Vec<File>> {
    let mut knobs = Vec::with_capacity(max);
    for i in 0..max {
        let path = state_dir(base, cpu, i).join("disable");
        let f = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        knobs.push(f);
    }
    Ok(knobs)
}

pub fn open_dma_latency() -> Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(CPU_DMA_LATENCY)
        .with_context(|| format!("opening {}", CPU_DMA_LATENCY))
}

/// Owns the idle-control handles and maps phase actions onto them.
pub enum IdleControl {
    PerState {
        knobs: Vec<File>,
        max: usize,
        high: usize,
        relax_base: usize,
        forbid_limit: usize,
    },
    Global {
        latency: File,
        thres_us: i32,
    },
}

impl IdleControl {
    /// Single-core mode over the given CPU's knobs. The relax and forbid
    /// ranges depend on whether the shallow-hold phases exist at all.
    pub fn per_state(knobs: Vec<File>, high: usize, cfg: &PhaseConfig) -> Self {
        let max = knobs.len();
        IdleControl::PerState {
            relax_base: if cfg.poh > 0 { high } else { 1 },
            forbid_limit: if cfg.prh > 0 { high } else { max },
            knobs,
            max,
            high,
        }
    }

    /// All-cores mode through the PM QoS hint.
    pub fn global(latency: File, thres_us: i32) -> Self {
        IdleControl::Global { latency, thres_us }
    }

    pub fn apply(&mut self, action: IdleAction) -> io::Result<()> {
        match self {
            IdleControl::PerState {
                knobs,
                max,
                high,
                relax_base,
                forbid_limit,
            } => match action {
                IdleAction::WakeShallow => write_range(knobs, 1, *high, false),
                IdleAction::RelaxDeep => write_range(knobs, *relax_base, *max, false),
                IdleAction::HoldShallow => write_range(knobs, *high, *max, true),
                IdleAction::Forbid => write_range(knobs, 1, *forbid_limit, true),
            },
            IdleControl::Global { latency, thres_us } => match action {
                IdleAction::WakeShallow | IdleAction::HoldShallow => {
                    write_latency(latency, *thres_us)
                }
                IdleAction::RelaxDeep => write_latency(latency, -1),
                IdleAction::Forbid => write_latency(latency, 0),
            },
        }
    }

    /// Fully-idle policy: every state enabled, hint released.
    pub fn allow_all(&mut self) -> io::Result<()> {
        match self {
            IdleControl::PerState { knobs, max, .. } => write_range(knobs, 1, *max, false),
            IdleControl::Global { latency, .. } => write_latency(latency, -1),
        }
    }
}

impl Drop for IdleControl {
    fn drop(&mut self) {
        let _ = self.allow_all();
    }
}

fn write_range(knobs: &mut [File], base: usize, limit: usize, disable: bool) -> io::Result<()> {
    let val: &[u8] = if disable { b"1\n" } else { b"0\n" };
    for knob in knobs.iter_mut().take(limit).skip(base) {
        knob.write_all(val)?;
    }
    Ok(())
}

fn write_latency(latency: &mut File, us: i32) -> io::Result<()> {
    latency.write_all(&us.to_ne_bytes())
}
