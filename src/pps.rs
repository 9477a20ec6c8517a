//! Linux PPS binding.
//!
//! gpsd creates one `/sys/class/pps/ppsN` entry per serial port carrying a
//! pulse. We pick the entry whose `path` attribute names the configured
//! serial device, then require capture-both with blocking fetch support and
//! strip any assert/clear offsets before use.

use anyhow::{bail, Context, Result};
use log::debug;
use nix::errno::Errno;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

pub const PPS_CAPTUREASSERT: libc::c_int = 0x01;
pub const PPS_CAPTURECLEAR: libc::c_int = 0x02;
pub const PPS_CAPTUREBOTH: libc::c_int = 0x03;
pub const PPS_OFFSETASSERT: libc::c_int = 0x10;
pub const PPS_OFFSETCLEAR: libc::c_int = 0x20;
pub const PPS_CANWAIT: libc::c_int = 0x100;

/// API version of the `linux/pps.h` this module lays out.
pub const PPS_API_VERS: libc::c_int = 1;

const REQUIRED_CAPS: libc::c_int = PPS_CAPTUREBOTH | PPS_CANWAIT;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpsKtime {
    pub sec: i64,
    pub nsec: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PpsKinfo {
    pub assert_sequence: u32,
    pub clear_sequence: u32,
    pub assert_tu: PpsKtime,
    pub clear_tu: PpsKtime,
    pub current_mode: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PpsKparams {
    pub api_version: libc::c_int,
    pub mode: libc::c_int,
    pub assert_off_tu: PpsKtime,
    pub clear_off_tu: PpsKtime,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PpsFdata {
    pub info: PpsKinfo,
    pub timeout: PpsKtime,
}

// The kernel encodes the size of a *pointer* in these request numbers, not
// the size of the struct, so the plain ioctl_read!/ioctl_readwrite! forms
// would produce the wrong codes.
nix::ioctl_read_bad!(
    pps_getparams,
    nix::request_code_read!(b'p', 0xa1, std::mem::size_of::<*mut PpsKparams>()),
    PpsKparams
);
nix::ioctl_write_ptr_bad!(
    pps_setparams,
    nix::request_code_write!(b'p', 0xa2, std::mem::size_of::<*mut PpsKparams>()),
    PpsKparams
);
nix::ioctl_read_bad!(
    pps_getcap,
    nix::request_code_read!(b'p', 0xa3, std::mem::size_of::<*mut libc::c_int>()),
    libc::c_int
);
nix::ioctl_readwrite_bad!(
    pps_fetch,
    nix::request_code_readwrite!(b'p', 0xa4, std::mem::size_of::<*mut PpsFdata>()),
    PpsFdata
);

pub fn has_required_caps(caps: libc::c_int) -> bool {
    caps & REQUIRED_CAPS == REQUIRED_CAPS
}

/// Capture-both, no timestamp offsets.
pub fn configure_mode(mode: libc::c_int) -> libc::c_int {
    (mode | PPS_CAPTUREBOTH) & !(PPS_OFFSETASSERT | PPS_OFFSETCLEAR)
}

pub struct PpsDevice {
    file: File,
    name: String,
}

impl PpsDevice {
    /// Scans `/sys/class/pps` for the entry bound to `serial_dev` and
    /// configures it. Entries that fail any step of the capability or
    /// parameter sequence are skipped.
    pub fn open(serial_dev: &str) -> Result<Self> {
        let entries = fs::read_dir("/sys/class/pps").context("reading /sys/class/pps")?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("pps") {
                continue;
            }
            let bound = match fs::read_to_string(entry.path().join("path")) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if bound.trim_end_matches('\n') != serial_dev {
                continue;
            }
            match Self::configure(&name) {
                Ok(dev) => return Ok(dev),
                Err(e) => {
                    debug!("skipping /dev/{}: {:#}", name, e);
                    continue;
                }
            }
        }
        bail!("no PPS source bound to {}", serial_dev)
    }

    /// Like [`open`](Self::open), retrying while gpsd is still creating the
    /// node at startup.
    pub fn open_retry(serial_dev: &str, retries: u32, delay: Duration) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match Self::open(serial_dev) {
                Ok(dev) => return Ok(dev),
                Err(e) => {
                    if attempt >= retries {
                        return Err(e.context(format!("no usable PPS device for {}", serial_dev)));
                    }
                    attempt += 1;
                    thread::sleep(delay);
                }
            }
        }
    }

    fn configure(name: &str) -> Result<Self> {
        let dev_path = format!("/dev/{}", name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&dev_path)
            .with_context(|| format!("opening {}", dev_path))?;
        let fd = file.as_raw_fd();

        let mut caps: libc::c_int = 0;
        unsafe { pps_getcap(fd, &mut caps) }.context("PPS_GETCAP")?;
        if !has_required_caps(caps) {
            bail!("capabilities {:#x} lack capture-both or blocking fetch", caps);
        }

        let mut params = PpsKparams::default();
        unsafe { pps_getparams(fd, &mut params) }.context("PPS_GETPARAMS")?;
        if params.api_version != PPS_API_VERS {
            bail!(
                "kernel PPS API version {} does not match compiled version {}",
                params.api_version,
                PPS_API_VERS
            );
        }

        params.mode = configure_mode(params.mode);
        params.assert_off_tu = PpsKtime::default();
        params.clear_off_tu = PpsKtime::default();
        unsafe { pps_setparams(fd, &params) }.context("PPS_SETPARAMS")?;

        Ok(PpsDevice {
            file,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks for the next captured edge pair, up to `timeout`.
    ///
    /// Errno is surfaced raw: the fetch loop treats `ETIMEDOUT` as lock
    /// loss, `EINTR` as shutdown and anything else as retryable.
    pub fn fetch(&self, timeout: Duration) -> std::result::Result<PpsKinfo, Errno> {
        let mut data = PpsFdata {
            info: PpsKinfo::default(),
            timeout: PpsKtime {
                sec: timeout.as_secs() as i64,
                nsec: timeout.subsec_nanos() as i32,
                flags: 0,
            },
        };
        unsafe { pps_fetch(self.file.as_raw_fd(), &mut data) }?;
        Ok(data.info)
    }
}
