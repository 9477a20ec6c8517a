//! Realtime process plumbing: scheduling, affinity, memory locking,
//! daemonization and signal-driven shutdown.

use anyhow::{anyhow, Context, Result};
use log::warn;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

static QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn note_quit(_: libc::c_int) {
    QUIT.store(true, Ordering::SeqCst);
}

/// Installs handlers for the four terminating signals and blocks everything
/// else, so only an explicit shutdown request interrupts the fetch loop.
pub fn install_quit_handlers() -> Result<()> {
    let keep = [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ];
    let mut blocked = SigSet::all();
    for sig in keep {
        blocked.remove(sig);
    }
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), None).context("sigprocmask")?;

    let action = SigAction::new(
        SigHandler::Handler(note_quit),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in keep {
        unsafe { sigaction(sig, &action) }
            .with_context(|| format!("installing handler for {:?}", sig))?;
    }
    Ok(())
}

pub fn quit_requested() -> bool {
    QUIT.load(Ordering::SeqCst)
}

pub fn max_rr_priority() -> i32 {
    unsafe { libc::sched_get_priority_max(libc::SCHED_RR) }
}

/// SCHED_RR at the given priority for the whole process. Needs root or
/// CAP_SYS_NICE.
pub fn set_realtime_rr(prio: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: prio,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } != 0 {
        return Err(anyhow!(
            "sched_setscheduler: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Pins the whole process to one CPU.
pub fn set_affinity(cpu: usize) -> Result<()> {
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    if unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) } != 0 {
        return Err(anyhow!(
            "sched_setaffinity: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Locks current and future pages so the control loops never page-fault.
pub fn lock_memory() -> Result<()> {
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(anyhow!("mlockall: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Forks into the background, detached from the controlling terminal.
pub fn daemonize() -> Result<()> {
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(anyhow!("daemon: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// PID file that unlinks itself on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::write(&path, format!("{}\n", process::id()))
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("removing {}: {}", self.path.display(), e);
        }
    }
}
