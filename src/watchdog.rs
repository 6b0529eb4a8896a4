// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! Hardware Watchdog (WDG): open, arm, tickle, and close `/dev/watchdog`.
//!
//! Grounded in the ioctl surface of `/dev/watchdog` character devices.
//! Opening the device is best-effort: a servant without a real watchdog
//! (test mode, or an operator who has deliberately opted out with `-W`)
//! runs with `Watchdog::None` and the inquisitor treats that the same as
//! "no hardware backstop", per spec.md §4.3.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{SbdError, SbdResult};

const WDIOC_GETSUPPORT: libc::c_ulong = 0x8028_5700;
const WDIOC_GETSTATUS: libc::c_ulong = 0x8004_5701;
const WDIOC_GETBOOTSTATUS: libc::c_ulong = 0x8004_5702;
const WDIOC_SETOPTIONS: libc::c_ulong = 0x8004_5704;
const WDIOC_KEEPALIVE: libc::c_ulong = 0x8004_5705;
const WDIOC_SETTIMEOUT: libc::c_ulong = 0xC004_5706;
const WDIOC_GETTIMEOUT: libc::c_ulong = 0x8004_5707;

const WDIOF_SETTIMEOUT: i32 = 0x0080;
const WDIOF_MAGICCLOSE: i32 = 0x0100;
const WDIOF_KEEPALIVEPING: i32 = 0x8000;

const WDIOS_DISABLECARD: libc::c_int = 0x0001;
const WDIOS_ENABLECARD: libc::c_int = 0x0002;

const MAGIC_CLOSE_BYTE: u8 = b'V';

const DEFAULT_PATH: &str = "/dev/watchdog";

/// Mirrors `struct watchdog_info` from `linux/watchdog.h`: options bitmask,
/// firmware version, and an ASCII identity string.
#[repr(C)]
struct WatchdogInfo {
    options: u32,
    firmware_version: u32,
    identity: [u8; 32],
}

/// A driver's reported capability bits, decoded from `WDIOC_GETSUPPORT`.
#[derive(Debug, Clone)]
pub struct WatchdogSupport {
    pub identity: String,
    pub firmware_version: u32,
    pub settimeout: bool,
    pub magicclose: bool,
    pub keepaliveping: bool,
}

/// An open hardware watchdog handle.
pub struct Watchdog {
    file: File,
    path: PathBuf,
    timeout: u32,
    magic_close: bool,
}

impl Watchdog {
    /// Open and arm the watchdog at `path` with `timeout` seconds.
    pub fn open(path: impl AsRef<Path>, timeout: u32) -> SbdResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| SbdError::open(&path, e))?;

        let support = query_support(&file, &path).ok();
        let magic_close = support.as_ref().map(|s| s.magicclose).unwrap_or(false);
        if let Some(s) = &support {
            tracing::info!(
                target: "sbd::wdg",
                path = %path.display(),
                identity = %s.identity,
                firmware_version = s.firmware_version,
                settimeout = s.settimeout,
                magicclose = s.magicclose,
                "opened watchdog device"
            );
        }

        let mut wdg = Self {
            file,
            path,
            timeout,
            magic_close,
        };
        wdg.set_timeout(timeout)?;
        wdg.tickle()?;
        Ok(wdg)
    }

    /// Open with the default `/dev/watchdog` path.
    pub fn open_default(timeout: u32) -> SbdResult<Self> {
        Self::open(DEFAULT_PATH, timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: u32) -> SbdResult<()> {
        let mut t: libc::c_int = timeout as libc::c_int;
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                WDIOC_SETTIMEOUT,
                &mut t as *mut libc::c_int,
            )
        };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!(
                    "WDIOC_SETTIMEOUT failed: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }
        self.timeout = t as u32;
        Ok(())
    }

    /// Send a keepalive ping (`WDIOC_KEEPALIVE`), resetting the countdown.
    pub fn tickle(&self) -> SbdResult<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), WDIOC_KEEPALIVE, 0) };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!("WDIOC_KEEPALIVE failed: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(())
    }

    pub fn get_timeout(&self) -> SbdResult<u32> {
        let mut t: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), WDIOC_GETTIMEOUT, &mut t as *mut libc::c_int)
        };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!("WDIOC_GETTIMEOUT failed: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(t as u32)
    }

    pub fn get_status(&self) -> SbdResult<i32> {
        let mut status: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), WDIOC_GETSTATUS, &mut status as *mut libc::c_int)
        };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!("WDIOC_GETSTATUS failed: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(status)
    }

    pub fn get_boot_status(&self) -> SbdResult<i32> {
        let mut status: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                WDIOC_GETBOOTSTATUS,
                &mut status as *mut libc::c_int,
            )
        };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!(
                    "WDIOC_GETBOOTSTATUS failed: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }
        Ok(status)
    }

    /// Disable the card's automatic reboot instead of closing it outright.
    /// Used on clean inquisitor shutdown when no fencing action is pending.
    pub fn disable(&self) -> SbdResult<()> {
        let mut opt: libc::c_int = WDIOS_DISABLECARD;
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), WDIOC_SETOPTIONS, &mut opt as *mut libc::c_int)
        };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!(
                    "WDIOC_SETOPTIONS(DISABLECARD) failed: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }
        Ok(())
    }

    pub fn enable(&self) -> SbdResult<()> {
        let mut opt: libc::c_int = WDIOS_ENABLECARD;
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), WDIOC_SETOPTIONS, &mut opt as *mut libc::c_int)
        };
        if rc != 0 {
            return Err(SbdError::io(
                &self.path,
                format!(
                    "WDIOC_SETOPTIONS(ENABLECARD) failed: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }
        Ok(())
    }

    /// Close the watchdog handle the "let it reboot" way: write nothing,
    /// drop the fd. If the driver supports magic-close, closing without
    /// the magic byte guarantees the timer keeps counting down instead of
    /// disarming on close; this is what `inquisitor::handle_event` calls
    /// on a fence command or quorum loss.
    pub fn abandon(self) {
        tracing::warn!(target: "sbd::wdg", path = %self.path.display(), "abandoning watchdog without magic close; expecting reboot");
        drop(self.file);
    }

    /// Close cleanly, writing the magic-close byte first if the driver
    /// requires one to disarm on close.
    pub fn close_clean(self) -> SbdResult<()> {
        if self.magic_close {
            use std::io::Write;
            let mut file = &self.file;
            file.write_all(&[MAGIC_CLOSE_BYTE])
                .map_err(|e| SbdError::io(&self.path, e))?;
        }
        Ok(())
    }
}

fn query_support(file: &File, path: &Path) -> SbdResult<WatchdogSupport> {
    let mut info = WatchdogInfo {
        options: 0,
        firmware_version: 0,
        identity: [0u8; 32],
    };
    let rc = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            WDIOC_GETSUPPORT,
            &mut info as *mut WatchdogInfo,
        )
    };
    if rc != 0 {
        return Err(SbdError::io(
            path,
            format!("WDIOC_GETSUPPORT failed: {}", std::io::Error::last_os_error()),
        ));
    }
    let end = info.identity.iter().position(|&b| b == 0).unwrap_or(32);
    let identity = String::from_utf8_lossy(&info.identity[..end]).into_owned();
    let options = info.options as i32;
    Ok(WatchdogSupport {
        identity,
        firmware_version: info.firmware_version,
        settimeout: options & WDIOF_SETTIMEOUT != 0,
        magicclose: options & WDIOF_MAGICCLOSE != 0,
        keepaliveping: options & WDIOF_KEEPALIVEPING != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_watchdog_fails() {
        let result = Watchdog::open("/nonexistent/dev/watchdog", 10);
        assert!(result.is_err());
    }
}
