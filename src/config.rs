// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! Node configuration: the timeouts, disk list, and watchdog settings one
//! node runs with. Assembled from CLI flags, with an optional JSON file
//! overriding the disk list and timeouts, mirroring `ServerConfig`'s
//! `Default`/`validate`/`from_file`/`to_file` shape.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SbdError, SbdResult};

pub const DEFAULT_TIMEOUT_WATCHDOG: u32 = 15;
pub const DEFAULT_TIMEOUT_LOOP: u32 = 1;
pub const DEFAULT_TIMEOUT_MSGWAIT: u32 = 10;
pub const DEFAULT_TIMEOUT_ALLOCATE: u32 = 2;
pub const DEFAULT_TIMEOUT_WATCHDOG_WARN: u32 = 3;

fn default_timeout_watchdog() -> u32 {
    DEFAULT_TIMEOUT_WATCHDOG
}
fn default_timeout_loop() -> u32 {
    DEFAULT_TIMEOUT_LOOP
}
fn default_timeout_msgwait() -> u32 {
    DEFAULT_TIMEOUT_MSGWAIT
}
fn default_timeout_allocate() -> u32 {
    DEFAULT_TIMEOUT_ALLOCATE
}
fn default_timeout_watchdog_warn() -> u32 {
    DEFAULT_TIMEOUT_WATCHDOG_WARN
}
fn default_watchdog_device() -> PathBuf {
    PathBuf::from("/dev/watchdog")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's name, as it appears in every slot it owns.
    pub node_name: String,

    /// Block devices this node fences over. At least one is required.
    pub devices: Vec<PathBuf>,

    #[serde(default = "default_timeout_watchdog")]
    pub timeout_watchdog: u32,
    #[serde(default = "default_timeout_loop")]
    pub timeout_loop: u32,
    #[serde(default = "default_timeout_msgwait")]
    pub timeout_msgwait: u32,
    #[serde(default = "default_timeout_allocate")]
    pub timeout_allocate: u32,
    /// `-5`: diagnostic-only threshold above which a servant logs a warning
    /// about its own loop latency (spec.md §4.4 step 5). Does not affect
    /// when the watchdog actually fires; the hardware timer alone does that.
    #[serde(default = "default_timeout_watchdog_warn")]
    pub timeout_watchdog_warn: u32,

    #[serde(default = "default_watchdog_device")]
    pub watchdog_device: PathBuf,
    /// `-W`: run without arming a hardware watchdog at all.
    #[serde(default)]
    pub watchdog_disabled: bool,

    /// `-D`: double-fork and detach from the controlling terminal.
    #[serde(default)]
    pub daemonize: bool,

    /// `-R`: skip real-time scheduling / memory locking. That helper itself
    /// is out of scope (spec.md §1); this flag is accepted and recorded
    /// only so the CLI surface matches spec.md §6.
    #[serde(default)]
    pub skip_realtime: bool,

    /// `-v`: verbosity, 0 = warn and above, 1 = info, 2+ = debug.
    #[serde(default)]
    pub verbose: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            devices: Vec::new(),
            timeout_watchdog: DEFAULT_TIMEOUT_WATCHDOG,
            timeout_loop: DEFAULT_TIMEOUT_LOOP,
            timeout_msgwait: DEFAULT_TIMEOUT_MSGWAIT,
            timeout_allocate: DEFAULT_TIMEOUT_ALLOCATE,
            timeout_watchdog_warn: DEFAULT_TIMEOUT_WATCHDOG_WARN,
            watchdog_device: default_watchdog_device(),
            watchdog_disabled: false,
            daemonize: false,
            skip_realtime: false,
            verbose: 0,
        }
    }
}

impl NodeConfig {
    /// Invariant I4 (timeouts must agree across every configured disk) is
    /// checked once headers are read back in Phase A; this only validates
    /// the configuration is internally coherent before any disk I/O.
    pub fn validate(&self) -> SbdResult<()> {
        if self.node_name.trim().is_empty() {
            return Err(SbdError::BadConfig("node name must not be empty".into()));
        }
        if self.node_name.as_bytes().len() > crate::slot::NAME_LEN {
            return Err(SbdError::BadConfig(format!(
                "node name longer than {} bytes",
                crate::slot::NAME_LEN
            )));
        }
        if self.devices.is_empty() {
            return Err(SbdError::BadConfig("at least one device is required".into()));
        }
        if self.timeout_watchdog == 0
            || self.timeout_loop == 0
            || self.timeout_msgwait == 0
            || self.timeout_watchdog_warn == 0
        {
            return Err(SbdError::BadConfig("timeouts must be nonzero".into()));
        }
        if self.timeout_msgwait <= self.timeout_loop {
            return Err(SbdError::BadConfig(
                "timeout_msgwait must exceed timeout_loop".into(),
            ));
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> SbdResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SbdError::open(path, e))?;
        serde_json::from_str(&text).map_err(|e| SbdError::BadConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> SbdResult<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| SbdError::BadConfig(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| SbdError::io(path, e))
    }

    /// Quorum threshold over the *configured* disk count, not the number
    /// currently reporting live (spec.md invariant I5).
    pub fn quorum(&self) -> usize {
        self.devices.len() / 2 + 1
    }
}
