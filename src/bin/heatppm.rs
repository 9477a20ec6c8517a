//! CPU heater with chronyd frequency offset output.
//!
//! Drives the package temperature up a staircase of one-degree plateaus by
//! duty-cycling the PM QoS latency hint, and prints chronyd's frequency
//! estimate at every settled plateau. The resulting (temperature, ppm)
//! pairs calibrate the oscillator's thermal drift. Run on an otherwise idle
//! machine, cooled down first; a full staircase takes hours.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::read;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gps_idle_tools::cpuidle;
use gps_idle_tools::heater::{Calibrator, PlateauController, StatusLine};
use gps_idle_tools::pwm::PwmGenerator;
use gps_idle_tools::rt;
use gps_idle_tools::sensor::HwmonProbe;
use gps_idle_tools::tracking::ChronycTracking;

#[derive(Parser, Debug)]
#[command(
    name = "heatppm",
    about = "CPU heater with chronyd frequency offset output",
    after_help = "Pick a sensible temperature source, e.g. \
                  /sys/class/hwmon/hwmon*/temp*_input"
)]
struct Args {
    /// Temperature source file (millidegrees Celsius)
    #[arg(short = 't', value_name = "PATH")]
    temp_source: PathBuf,

    /// Tracking updates from chronyc required before plateau validation
    #[arg(short = 'w', value_name = "N", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(4..=16))]
    wait: u32,

    /// Maximum plateau temperature in degrees Celsius
    #[arg(short = 'l', value_name = "TEMP", default_value_t = 85,
          value_parser = clap::value_parser!(u32).range(30..=99))]
    limit: u32,

    /// Minimum required chrony skew in ppb
    #[arg(short = 'm', value_name = "PPB", default_value_t = 15,
          value_parser = clap::value_parser!(u32).range(1..=100))]
    minskew: u32,

    /// Relaxed plateau acceptance (within 0.25 C instead of exact)
    #[arg(short = 'r')]
    relaxed: bool,
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

    rt::set_realtime_rr(rt::max_rr_priority()).context("enabling SCHED_RR")?;

    let ctl_timer = TimerFd::new(
        ClockId::CLOCK_MONOTONIC,
        TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
    )
    .context("creating controller timer")?;
    let period = Arc::new(
        TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .context("creating PWM period timer")?,
    );
    let latency = cpuidle::open_dma_latency()?;
    let duty = Arc::new(Mutex::new(0i64));

    let generator = PwmGenerator::new(period.clone(), latency, duty.clone())?;
    thread::Builder::new()
        .name("pwm".into())
        .spawn(move || {
            generator.run();
        })
        .context("spawning PWM thread")?;

    info!("heating toward {} C via {}", args.limit, args.temp_source.display());

    print!("\rWait...");
    io::stdout().flush().ok();
    align_to_half_second();

    let second = Expiration::Interval(TimeSpec::from_duration(Duration::from_secs(1)));
    ctl_timer
        .set(second, TimerSetTimeFlags::empty())
        .context("arming controller timer")?;
    period
        .set(second, TimerSetTimeFlags::empty())
        .context("arming PWM period timer")?;

    print!("\rInitializing...");
    io::stdout().flush().ok();

    let controller = PlateauController::new(
        f64::from(args.limit) * 1000.0,
        args.wait,
        f64::from(args.minskew) / 1000.0,
        !args.relaxed,
    );
    let mut calibrator = Calibrator::new(
        HwmonProbe::new(&args.temp_source),
        ChronycTracking,
        controller,
    );

    let mut buf = [0u8; 8];
    let mut live_line = true;
    loop {
        {
            let ctl_timer_fd = ctl_timer.as_fd();
            let mut fds = [PollFd::new(&ctl_timer_fd, PollFlags::POLLIN)];
            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll"),
            }
        }
        if read(ctl_timer.as_fd().as_raw_fd(), &mut buf) != Ok(8) {
            continue;
        }

        let outcome = calibrator.tick()?;
        *duty.lock().unwrap() = calibrator.controller.pulse();

        if let Some(line) = outcome.line {
            print_status(&line);
            live_line = true;
        }
        if let Some(p) = outcome.plateau {
            // The record replaces the transient status display in place.
            print!(
                "\r{:.0} {:.3}{}\n",
                p.avg_millideg,
                p.freq_ppm,
                " ".repeat(60)
            );
            io::stdout().flush().ok();
            live_line = false;
        }
        if outcome.stop.is_some() {
            break;
        }
    }

    if live_line {
        print!("\r{}\r", " ".repeat(70));
        io::stdout().flush().ok();
    }
    Ok(())
}

/// Chrony refreshes its tracking state on the second; sampling on the
/// half-second keeps our timers clear of that edge.
fn align_to_half_second() {
    loop {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let usec = now.subsec_micros();
        if (450_000..=550_000).contains(&usec) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn print_status(line: &StatusLine) {
    let target = match line.target_millideg {
        Some(t) => format!("[{:.3}]", t / 1000.0),
        None => "[------]".to_string(),
    };
    print!(
        "\r{:.3} {} {} {} {} {}",
        line.avg_millideg / 1000.0,
        target,
        line.arrow,
        fmt_signed(line.freq_ppm),
        fmt_signed(line.residual_ppm),
        fmt_signed(line.skew_ppm)
    );
    io::stdout().flush().ok();
}

/// A leading blank where the minus sign would be, so columns stay put as
/// values change sign.
fn fmt_signed(v: f64) -> String {
    if v < 0.0 {
        format!("{:.3}", v)
    } else {
        format!(" {:.3}", v)
    }
}
