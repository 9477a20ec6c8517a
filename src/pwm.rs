//! 1 Hz PWM over the PM QoS latency hint.
//!
//! A realtime thread turns the shared duty value into a square wave on
//! `/dev/cpu_dma_latency`: at each period start the hint is installed, and a
//! one-shot gate timer releases it again after the on-duration. The kernel
//! then alternates between forced-shallow and unconstrained idle, which
//! modulates wakeup rate and therefore package power.

use anyhow::{Context, Result};
use log::error;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::read;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::heater::PULSE_MAX_NS;

/// What a period tick does with the latency handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmCommand {
    /// Zero duty: hint released for the whole period.
    Release,
    /// Full duty: zero-latency hint held for the whole period.
    Restrict,
    /// Partial duty: restrict now, release after this many nanoseconds.
    Pulse(i64),
}

pub fn command_for(duty_ns: i64) -> PwmCommand {
    match duty_ns {
        0 => PwmCommand::Release,
        PULSE_MAX_NS => PwmCommand::Restrict,
        on => PwmCommand::Pulse(on),
    }
}

pub struct PwmGenerator {
    period: Arc<TimerFd>,
    gate: TimerFd,
    latency: File,
    duty: Arc<Mutex<i64>>,
}

impl PwmGenerator {
    /// `period` is armed by the controller once sampling is aligned; until
    /// then the generator sleeps in poll.
    pub fn new(period: Arc<TimerFd>, latency: File, duty: Arc<Mutex<i64>>) -> Result<Self> {
        let gate = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .context("creating PWM gate timer")?;
        Ok(PwmGenerator {
            period,
            gate,
            latency,
            duty,
        })
    }

    /// Never returns; any timer or write failure aborts the process.
    pub fn run(mut self) -> ! {
        let mut buf = [0u8; 8];
        let mut on: i64 = 0;
        loop {
            let (period_fired, gate_fired) = {
                let period_fd = self.period.as_fd();
                let gate_fd = self.gate.as_fd();
                let mut fds = [
                    PollFd::new(&period_fd, PollFlags::POLLIN),
                    PollFd::new(&gate_fd, PollFlags::POLLIN),
                ];
                match poll(&mut fds, -1) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!("PWM poll failed: {}", e);
                        process::exit(1);
                    }
                }
                (
                    fds[0]
                        .revents()
                        .map_or(false, |r| r.contains(PollFlags::POLLIN)),
                    fds[1]
                        .revents()
                        .map_or(false, |r| r.contains(PollFlags::POLLIN)),
                )
            };

            if period_fired && read(self.period.as_fd().as_raw_fd(), &mut buf) == Ok(8) {
                self.disarm_gate();
                on = *self.duty.lock().unwrap();
            }

            if gate_fired && read(self.gate.as_fd().as_raw_fd(), &mut buf) == Ok(8) {
                // On-window over: release until the next period tick.
                self.write_latency(-1);
                self.disarm_gate();
                continue;
            }

            match command_for(on) {
                PwmCommand::Release => {
                    self.write_latency(-1);
                    self.disarm_gate();
                }
                PwmCommand::Restrict => {
                    self.write_latency(0);
                    self.disarm_gate();
                }
                PwmCommand::Pulse(ns) => {
                    self.write_latency(0);
                    if let Err(e) = self.gate.set(
                        Expiration::OneShot(TimeSpec::from_duration(Duration::from_nanos(
                            ns as u64,
                        ))),
                        TimerSetTimeFlags::empty(),
                    ) {
                        error!("PWM timerfd_settime failed: {}", e);
                        process::exit(1);
                    }
                }
            }
        }
    }

    /// Disarm and drain so a stale expiry cannot double-fire.
    fn disarm_gate(&mut self) {
        if let Err(e) = self.gate.unset() {
            error!("PWM timerfd_settime failed: {}", e);
            process::exit(1);
        }
        let mut buf = [0u8; 8];
        let _ = read(self.gate.as_fd().as_raw_fd(), &mut buf);
    }

    fn write_latency(&mut self, us: i32) {
        if let Err(e) = self.latency.write_all(&us.to_ne_bytes()) {
            error!("writing {}: {}", crate::cpuidle::CPU_DMA_LATENCY, e);
            process::exit(1);
        }
    }
}
