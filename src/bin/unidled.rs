//! CPU idle management daemon for gpsd with GPS PPS input.
//!
//! Locks onto a PPS pulse and, inside every second, schedules the local
//! CPU's idle-state exposure so deep idle is forbidden just before the
//! expected edge. The PPS-servicing interrupt then never pays a deep-sleep
//! wakeup penalty, while the CPU still cools off in the middle of each
//! second. Run gpsd, chronyd and unidled pinned to the same core, unidled
//! at the highest realtime priority.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::read;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gps_idle_tools::cpuidle::{self, IdleControl};
use gps_idle_tools::phase::{self, PhaseConfig, PhaseMachine, MIN_PULSE_DELTA_NS};
use gps_idle_tools::pps::PpsDevice;
use gps_idle_tools::rt::{self, PidFile};

#[derive(Parser, Debug)]
#[command(name = "unidled", about = "CPU idle-state shaper locked to a GPS PPS pulse")]
struct Args {
    /// Serial device carrying the PPS signal (as configured for gpsd)
    #[arg(short = 'd', value_name = "DEV")]
    device: String,

    /// Core to pin to (the one servicing the PPS interrupt)
    #[arg(short = 'c', value_name = "CORE", default_value_t = 0,
          value_parser = clap::value_parser!(u32).range(0..=1023))]
    core: u32,

    /// Realtime round-robin priority
    #[arg(short = 'r', value_name = "PRIO", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..=99))]
    priority: u32,

    /// Idle exit-latency threshold in microseconds
    #[arg(short = 't', value_name = "LAT_US", default_value_t = 50,
          value_parser = clap::value_parser!(u32).range(1..=1000))]
    threshold: u32,

    /// Post-edge full-idle-forbid time in milliseconds
    #[arg(short = 'P', value_name = "MS", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..=1000))]
    post_forbid: u32,

    /// Pre-edge full-idle-forbid time in milliseconds
    #[arg(short = 'p', value_name = "MS", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(0..=1000))]
    pre_forbid: u32,

    /// Pre-edge shallow-idle-only time in milliseconds
    #[arg(short = 'l', value_name = "MS", default_value_t = 0,
          value_parser = clap::value_parser!(u32).range(0..=1000))]
    pre_hold: u32,

    /// Post-edge shallow-idle-only time in milliseconds
    #[arg(short = 'L', value_name = "MS", default_value_t = 0,
          value_parser = clap::value_parser!(u32).range(0..=1000))]
    post_hold: u32,

    /// Constrain all cores via /dev/cpu_dma_latency instead of one core's
    /// idle-state knobs
    #[arg(short = 'a')]
    all: bool,

    /// PID file
    #[arg(short = 'f', value_name = "PATH", default_value = "/run/unidled.pid")]
    pid_file: PathBuf,

    /// Stay in the foreground
    #[arg(short = 'n')]
    foreground: bool,
}

struct PhaseEngine {
    machine: PhaseMachine,
    idle: IdleControl,
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };

    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .filter_level(log::LevelFilter::Info)
        .init();

    let meta =
        std::fs::metadata(&args.device).with_context(|| format!("checking {}", args.device))?;
    if !meta.file_type().is_char_device() {
        bail!("{} is not a character device", args.device);
    }

    let cfg = PhaseConfig::from_millis(
        args.post_hold,
        args.post_forbid,
        args.pre_hold,
        args.pre_forbid,
    )?;

    rt::install_quit_handlers()?;
    rt::lock_memory()?;
    rt::set_affinity(args.core as usize).context("setting CPU affinity")?;
    rt::set_realtime_rr(args.priority as i32).context("setting realtime priority")?;

    let idle = if args.all {
        IdleControl::global(cpuidle::open_dma_latency()?, args.threshold as i32)
    } else {
        let cpu = args.core as usize;
        let max = cpuidle::discover(cpu)?;
        let high = if cfg.prf > 0 || cfg.pof > 0 {
            cpuidle::latency_boundary(cpu, max, i64::from(args.threshold))?
        } else {
            0
        };
        IdleControl::per_state(cpuidle::open_disable_knobs(cpu, max)?, high, &cfg)
    };

    // gpsd may still be creating the node when we start.
    let pps = PpsDevice::open_retry(&args.device, 80, Duration::from_millis(25))?;
    info!("using /dev/{} for {}", pps.name(), args.device);

    if !args.foreground {
        rt::daemonize()?;
    }
    let _pid_file = if args.foreground {
        None
    } else {
        match PidFile::create(&args.pid_file) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        }
    };

    let timer = Arc::new(
        TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .context("creating phase timer")?,
    );
    let engine = Arc::new(Mutex::new(PhaseEngine {
        machine: PhaseMachine::new(cfg),
        idle,
    }));
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let engine = engine.clone();
        let timer = timer.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("phase".into())
            .spawn(move || phase_worker(engine, timer, stop))
            .context("spawning phase thread")?
    };

    let fetch_timeout = Duration::new(1, 100_000_000);
    let mut first: u8 = 1;

    while !rt::quit_requested() {
        if first == 1 {
            if let Err(e) = engine.lock().unwrap().idle.allow_all() {
                error!("idle control write failed: {}", e);
                process::exit(1);
            }
            first = 2;
        }

        let info = match pps.fetch(fetch_timeout) {
            Ok(i) => i,
            Err(Errno::ETIMEDOUT) => {
                if first == 0 {
                    debug!("PPS timeout, lock lost");
                    first = 1;
                }
                continue;
            }
            Err(Errno::EINTR) => break,
            Err(e) => {
                debug!("PPS_FETCH failed ({}), retrying", e);
                continue;
            }
        };

        if first != 0 {
            // First good edge after a loss: restart the plan right away;
            // the next fetch anchors it precisely.
            first = 0;
            engine.lock().unwrap().machine.reset();
            fatal_arm(&timer, 1);
            continue;
        }

        let window = match phase::measure(&info) {
            Some(w) => w,
            None => {
                debug!("PPS source stalled");
                first = 1;
                continue;
            }
        };
        if window.delta_ns < MIN_PULSE_DELTA_NS {
            continue;
        }
        let edge = phase::normalize_edge_ns(window.edge_ns);

        engine.lock().unwrap().machine.reset();
        fatal_arm(&timer, cfg.anchor_ns(edge));
    }

    info!("shutting down");
    let _ = timer.unset();
    stop.store(true, Ordering::SeqCst);
    let _ = arm(&timer, 1);
    let _ = worker.join();
    if let Err(e) = engine.lock().unwrap().idle.allow_all() {
        warn!("restoring idle policy: {}", e);
    }
    Ok(())
}

fn phase_worker(engine: Arc<Mutex<PhaseEngine>>, timer: Arc<TimerFd>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 8];
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let fired = {
            let timer_fd = timer.as_fd();
            let mut fds = [PollFd::new(&timer_fd, PollFlags::POLLIN)];
            match poll(&mut fds, -1) {
                Ok(0) => false,
                Ok(_) => fds[0]
                    .revents()
                    .map_or(false, |r| r.contains(PollFlags::POLLIN)),
                Err(Errno::EINTR) => false,
                Err(e) => {
                    error!("phase poll failed: {}", e);
                    process::exit(1);
                }
            }
        };
        if !fired {
            continue;
        }
        if read(timer.as_fd().as_raw_fd(), &mut buf) != Ok(8) {
            continue;
        }
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let mut engine = engine.lock().unwrap();
        if let Some((action, ns)) = engine.machine.advance() {
            if let Err(e) = engine.idle.apply(action) {
                error!("idle control write failed: {}", e);
                process::exit(1);
            }
            if let Err(e) = arm(&timer, ns) {
                error!("timerfd_settime failed: {}", e);
                process::exit(1);
            }
        }
    }
}

fn arm(timer: &TimerFd, ns: i64) -> nix::Result<()> {
    timer.set(
        Expiration::OneShot(TimeSpec::from_duration(Duration::from_nanos(
            ns.max(1) as u64,
        ))),
        TimerSetTimeFlags::empty(),
    )
}

fn fatal_arm(timer: &TimerFd, ns: i64) {
    if let Err(e) = arm(timer, ns) {
        error!("timerfd_settime failed: {}", e);
        process::exit(1);
    }
}
