// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! Servant (SVT): one per configured disk, polling its mailbox slot and
//! reporting liveness to the inquisitor.
//!
//! Translated from a forked child plus real-time signals (spec.md §9
//! Design Notes) into an OS thread plus a `crossbeam_channel`. Each
//! servant owns its `BlockDevice` exclusively; nothing outside this
//! module touches a disk handle once the servant thread starts.
//!
//! Servants do not open the hardware watchdog themselves: most drivers
//! only accept one open file descriptor, and the inquisitor already holds
//! one for the quorum-gated tickle. A `RESET`/`OFF` command instead
//! surfaces as an event; the inquisitor is the single authority that acts
//! on the shared watchdog handle (see `inquisitor::fence`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::bdio::BlockDevice;
use crate::slot::{self, Command, Header};

/// Identifies a servant. Stands in for the forked child's pid in the
/// original design; used only for dedup and log correlation.
pub type ServantId = usize;

/// Why a servant thread exited.
#[derive(Debug, Clone)]
pub enum ExitReason {
    /// Told to stop by the inquisitor (cancel token observed).
    Cancelled,
    /// Received an `EXIT` command through its own mailbox slot.
    ExitCommand,
    /// Received `RESET` or `OFF`; the inquisitor now owns fencing.
    FenceRequested(Command),
    /// The disk became unusable (I/O error, header no longer validates).
    Failed(String),
}

/// What a servant reports to the inquisitor. The analogue of
/// `sigqueue(SIG_LIVENESS/SIG_EXITREQ, si_pid)` collapsed into one
/// channel, since there's no separate SIGCHLD to multiplex when servants
/// are threads rather than processes.
#[derive(Debug, Clone)]
pub enum EventKind {
    Liveness,
    ExitReq,
    Test,
    /// A peer wrote `RESET` or `OFF` to this node's slot. Carries the
    /// sender's name for logging.
    FenceRequested { cmd: Command, from: String },
    Exited(ExitReason),
}

#[derive(Debug, Clone)]
pub struct ServantEvent {
    pub servant_id: ServantId,
    /// Which spawn of this `servant_id` sent this event. Lets the
    /// inquisitor tell a live servant's exit apart from a stale one still
    /// draining the channel after a restart or respawn.
    pub generation: u64,
    pub kind: EventKind,
}

/// Per-servant configuration, the thread-local equivalent of the argv the
/// original passed to each forked child.
#[derive(Debug, Clone)]
pub struct ServantConfig {
    pub servant_id: ServantId,
    pub generation: u64,
    pub device_path: std::path::PathBuf,
    pub node_name: String,
    pub timeout_watchdog: u32,
    pub timeout_loop: u32,
    pub timeout_msgwait: u32,
    /// Diagnostic-only threshold above which a slow loop iteration logs a
    /// warning (spec.md §4.4 step 5); does not affect sleep duration.
    pub timeout_watchdog_warn: u32,
    /// Prepare-only: validate the header and allocate a slot, then exit
    /// instead of looping. Used by the inquisitor's Phase A.
    pub prepare_only: bool,
}

/// Cooperative shutdown signal shared between a servant thread and its
/// owner. Replaces reparent-to-init detection, which has no meaning for
/// threads in a single process.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the servant loop on the calling thread. Intended to be the body of
/// a `std::thread::spawn` closure; returns only when cancelled, told to
/// exit, handed a fence command, or the disk fails.
pub fn run(cfg: ServantConfig, events: Sender<ServantEvent>, cancel: CancelToken) {
    let reason = run_inner(&cfg, &events, &cancel);
    let _ = events.send(ServantEvent {
        servant_id: cfg.servant_id,
        generation: cfg.generation,
        kind: EventKind::Exited(reason),
    });
}

fn run_inner(cfg: &ServantConfig, events: &Sender<ServantEvent>, cancel: &CancelToken) -> ExitReason {
    let dev = match BlockDevice::open(&cfg.device_path) {
        Ok(dev) => dev,
        Err(e) => return ExitReason::Failed(e.to_string()),
    };

    let header = match Header::read(&dev) {
        Ok(h) => h,
        Err(e) => return ExitReason::Failed(e.to_string()),
    };
    if header.timeout_watchdog != cfg.timeout_watchdog
        || header.timeout_loop != cfg.timeout_loop
        || header.timeout_msgwait != cfg.timeout_msgwait
    {
        tracing::warn!(
            target: "sbd::svt",
            servant_id = cfg.servant_id,
            path = %cfg.device_path.display(),
            "disk header timeouts disagree with configured node timeouts"
        );
    }

    let slot_index = match slot::slot_allocate(&dev, &cfg.node_name) {
        Ok(i) => i,
        Err(e) => return ExitReason::Failed(e.to_string()),
    };

    tracing::info!(
        target: "sbd::svt",
        servant_id = cfg.servant_id,
        path = %cfg.device_path.display(),
        slot = slot_index,
        "servant prepared"
    );

    if cfg.prepare_only {
        return ExitReason::Cancelled;
    }

    let loop_sleep = Duration::from_secs(u64::from(cfg.timeout_loop));
    let warn_threshold = Duration::from_secs(u64::from(cfg.timeout_watchdog_warn));

    loop {
        if cancel.is_cancelled() {
            return ExitReason::Cancelled;
        }

        let started = Instant::now();
        let slot = match slot::mbox_read(&dev, slot_index) {
            Ok(s) => s,
            Err(e) => return ExitReason::Failed(e.to_string()),
        };

        match slot.cmd {
            Command::Clear => {
                let _ = events.send(ServantEvent {
                    servant_id: cfg.servant_id,
                    generation: cfg.generation,
                    kind: EventKind::Liveness,
                });
            }
            Command::Test => {
                tracing::info!(target: "sbd::svt", servant_id = cfg.servant_id, from = %slot.from, "received TEST");
                if let Err(e) = slot::slot_clear(&dev, slot_index) {
                    return ExitReason::Failed(e.to_string());
                }
                let _ = events.send(ServantEvent {
                    servant_id: cfg.servant_id,
                    generation: cfg.generation,
                    kind: EventKind::Test,
                });
            }
            Command::Reset | Command::Off => {
                tracing::warn!(target: "sbd::svt", servant_id = cfg.servant_id, from = %slot.from, cmd = ?slot.cmd, "received fence command");
                let _ = events.send(ServantEvent {
                    servant_id: cfg.servant_id,
                    generation: cfg.generation,
                    kind: EventKind::FenceRequested {
                        cmd: slot.cmd,
                        from: slot.from.clone(),
                    },
                });
                return ExitReason::FenceRequested(slot.cmd);
            }
            Command::Exit => {
                tracing::info!(target: "sbd::svt", servant_id = cfg.servant_id, from = %slot.from, "received EXIT");
                if let Err(e) = slot::slot_clear(&dev, slot_index) {
                    return ExitReason::Failed(e.to_string());
                }
                let _ = events.send(ServantEvent {
                    servant_id: cfg.servant_id,
                    generation: cfg.generation,
                    kind: EventKind::ExitReq,
                });
                return ExitReason::ExitCommand;
            }
            Command::Unknown(b) => {
                tracing::warn!(target: "sbd::svt", servant_id = cfg.servant_id, cmd = b, "ignoring unrecognized command byte");
            }
        }

        let elapsed = started.elapsed();
        if elapsed > warn_threshold {
            tracing::warn!(
                target: "sbd::svt",
                servant_id = cfg.servant_id,
                elapsed_ms = elapsed.as_millis() as u64,
                warn_threshold_ms = warn_threshold.as_millis() as u64,
                "servant loop iteration exceeded timeout_watchdog_warn; this is diagnostic only, the hardware watchdog catches true stalls"
            );
        }
        if elapsed < loop_sleep {
            std::thread::sleep(loop_sleep - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{mbox_write, Header, Slot};
    use crossbeam::channel::unbounded;

    fn fresh_disk(dir: &std::path::Path, slot_count: u16) -> (std::path::PathBuf, BlockDevice) {
        let path = dir.join("disk.img");
        let sector_size = 512usize;
        let total = sector_size * (1 + slot_count as usize);
        std::fs::write(&path, vec![0u8; total]).unwrap();
        let dev = BlockDevice::open_for_test(&path, sector_size).unwrap();
        Header::new(slot_count, 15, 1, 10).write(&dev).unwrap();
        (path, dev)
    }

    fn base_cfg(servant_id: ServantId, device_path: std::path::PathBuf) -> ServantConfig {
        ServantConfig {
            servant_id,
            generation: 0,
            device_path,
            node_name: "nodeA".into(),
            timeout_watchdog: 15,
            timeout_loop: 1,
            timeout_msgwait: 10,
            timeout_watchdog_warn: 3,
            prepare_only: false,
        }
    }

    #[test]
    fn prepare_only_allocates_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (path, dev) = fresh_disk(dir.path(), 2);
        drop(dev);

        let mut cfg = base_cfg(0, path);
        cfg.prepare_only = true;
        let (tx, _rx) = unbounded();
        let cancel = CancelToken::new();
        let reason = run_inner(&cfg, &tx, &cancel);
        assert!(matches!(reason, ExitReason::Cancelled));
    }

    #[test]
    fn cancel_token_stops_loop_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let (path, dev) = fresh_disk(dir.path(), 2);
        drop(dev);

        let cfg = base_cfg(1, path);
        let (tx, _rx) = unbounded();
        let cancel = CancelToken::new();
        let cancel_clone = cancel.clone();
        let handle = std::thread::spawn(move || run_inner(&cfg, &tx, &cancel_clone));
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        let reason = handle.join().unwrap();
        assert!(matches!(reason, ExitReason::Cancelled));
    }

    #[test]
    fn exit_command_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let (path, dev) = fresh_disk(dir.path(), 2);
        let idx = slot::slot_allocate(&dev, "nodeA").unwrap();
        mbox_write(
            &dev,
            idx,
            &Slot {
                name: "nodeA".into(),
                cmd: Command::Exit,
                from: "peer".into(),
            },
        )
        .unwrap();
        drop(dev);

        let cfg = base_cfg(2, path);
        let (tx, rx) = unbounded();
        let cancel = CancelToken::new();
        let reason = run_inner(&cfg, &tx, &cancel);
        assert!(matches!(reason, ExitReason::ExitCommand));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.kind, EventKind::ExitReq));
    }

    #[test]
    fn reset_command_surfaces_as_fence_event() {
        let dir = tempfile::tempdir().unwrap();
        let (path, dev) = fresh_disk(dir.path(), 2);
        let idx = slot::slot_allocate(&dev, "nodeA").unwrap();
        mbox_write(
            &dev,
            idx,
            &Slot {
                name: "nodeA".into(),
                cmd: Command::Reset,
                from: "peer".into(),
            },
        )
        .unwrap();
        drop(dev);

        let cfg = base_cfg(3, path);
        let (tx, rx) = unbounded();
        let cancel = CancelToken::new();
        let reason = run_inner(&cfg, &tx, &cancel);
        assert!(matches!(reason, ExitReason::FenceRequested(Command::Reset)));
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event.kind,
            EventKind::FenceRequested {
                cmd: Command::Reset,
                ..
            }
        ));
    }
}
