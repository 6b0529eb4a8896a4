// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! Inquisitor (INQ): the supervisor. Validates every configured disk
//! (Phase A), optionally daemonizes (Phase B), then spawns one servant
//! thread per disk and arms the shared hardware watchdog only while a
//! majority of *configured* disks report liveness (Phase C).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::bdio::BlockDevice;
use crate::config::NodeConfig;
use crate::error::{SbdError, SbdResult};
use crate::servant::{self, CancelToken, EventKind, ExitReason, ServantConfig, ServantEvent, ServantId};
use crate::slot::{self, Command, Header};
use crate::watchdog::Watchdog;

/// Operator-issued commands, the analogue of `SIGUSR1` (restart all
/// servants) and an operator-driven `EXIT` cascade.
#[derive(Debug, Clone)]
pub enum InquisitorCommand {
    RestartAll,
    Shutdown,
}

/// Outcome of a completed `run()`: either a clean shutdown or a fence
/// that's already in motion (watchdog abandoned, node rebooting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    CleanShutdown,
    Fenced,
}

struct ServantHandle {
    generation: u64,
    cancel: CancelToken,
    join: JoinHandle<()>,
}

/// What `main_loop` should do once the current event has been handled.
enum LoopSignal {
    Continue,
    Fence,
    CleanShutdown,
}

pub struct Inquisitor {
    config: NodeConfig,
}

impl Inquisitor {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Phase A: validate every configured disk is usable and agrees on
    /// the timeout triple (invariant I4), and that a majority of them are
    /// good before committing to run at all.
    pub fn prepare(&self) -> SbdResult<()> {
        let mut good = 0usize;
        for device in &self.config.devices {
            match self.prepare_device(device) {
                Ok(()) => good += 1,
                Err(e) => tracing::warn!(target: "sbd::inq", path = %device.display(), error = %e, "disk failed preparation"),
            }
        }

        let configured = self.config.devices.len();
        let quorum = self.config.quorum();
        tracing::info!(target: "sbd::inq", good, configured, quorum, "preparation complete");
        if good < quorum {
            return Err(SbdError::QuorumLost { good, configured });
        }
        Ok(())
    }

    fn prepare_device(&self, device: &Path) -> SbdResult<()> {
        let dev = BlockDevice::open(device)?;
        let header = Header::read(&dev)?;
        if header.timeout_watchdog != self.config.timeout_watchdog
            || header.timeout_loop != self.config.timeout_loop
            || header.timeout_msgwait != self.config.timeout_msgwait
        {
            return Err(SbdError::BadConfig(format!(
                "{}: disk timeouts do not match configured timeouts",
                device.display()
            )));
        }
        slot::slot_allocate(&dev, &self.config.node_name)?;
        Ok(())
    }

    /// Phase B + C: daemonize if requested, then run the main supervisory
    /// loop until a clean shutdown or a fence takes effect.
    pub fn run(&self, commands: Receiver<InquisitorCommand>) -> SbdResult<Outcome> {
        self.prepare()?;

        if self.config.daemonize {
            daemonize()?;
        }

        self.main_loop(commands)
    }

    fn open_watchdog(&self) -> Option<Watchdog> {
        if self.config.watchdog_disabled {
            return None;
        }
        match Watchdog::open(&self.config.watchdog_device, self.config.timeout_watchdog) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(target: "sbd::inq", error = %e, "running without hardware watchdog");
                None
            }
        }
    }

    fn spawn_all(&self, events: &Sender<ServantEvent>, next_generation: &mut u64) -> HashMap<ServantId, ServantHandle> {
        let mut handles = HashMap::new();
        for (id, device) in self.config.devices.iter().enumerate() {
            let generation = *next_generation;
            *next_generation += 1;
            handles.insert(id, self.spawn_one(id, generation, device, events));
        }
        handles
    }

    fn spawn_one(&self, id: ServantId, generation: u64, device: &Path, events: &Sender<ServantEvent>) -> ServantHandle {
        let cancel = CancelToken::new();
        let cfg = ServantConfig {
            servant_id: id,
            generation,
            device_path: device.to_path_buf(),
            node_name: self.config.node_name.clone(),
            timeout_watchdog: self.config.timeout_watchdog,
            timeout_loop: self.config.timeout_loop,
            timeout_msgwait: self.config.timeout_msgwait,
            timeout_watchdog_warn: self.config.timeout_watchdog_warn,
            prepare_only: false,
        };
        let events = events.clone();
        let cancel_clone = cancel.clone();
        let join = std::thread::spawn(move || servant::run(cfg, events, cancel_clone));
        ServantHandle { generation, cancel, join }
    }

    fn main_loop(&self, commands: Receiver<InquisitorCommand>) -> SbdResult<Outcome> {
        let (events_tx, events_rx) = unbounded::<ServantEvent>();
        let mut next_generation: u64 = 0;
        let mut servants = self.spawn_all(&events_tx, &mut next_generation);
        let mut watchdog = self.open_watchdog();
        let quorum = self.config.quorum();
        let mut reports: HashSet<ServantId> = HashSet::new();
        let tick = Duration::from_secs(u64::from(self.config.timeout_loop));
        // Set once an EXIT cascade is under way; turns every subsequent
        // servant exit into teardown bookkeeping instead of a respawn.
        let mut exiting = false;

        loop {
            if let Ok(cmd) = commands.try_recv() {
                match cmd {
                    InquisitorCommand::Shutdown => {
                        return Ok(self.shutdown(servants, watchdog));
                    }
                    InquisitorCommand::RestartAll => {
                        tracing::info!(target: "sbd::inq", "operator requested restart of all servants");
                        for (_, handle) in servants.drain() {
                            handle.cancel.cancel();
                            let _ = handle.join.join();
                        }
                        reports.clear();
                        servants = self.spawn_all(&events_tx, &mut next_generation);
                    }
                }
            }

            match events_rx.recv_timeout(tick) {
                Ok(event) => {
                    let signal = self.handle_event(
                        event,
                        &mut servants,
                        &mut reports,
                        &mut watchdog,
                        &events_tx,
                        &mut next_generation,
                        &mut exiting,
                        quorum,
                    );
                    match signal {
                        LoopSignal::Continue => {}
                        LoopSignal::Fence => return Ok(self.fence(servants, watchdog)),
                        LoopSignal::CleanShutdown => return Ok(self.shutdown(servants, watchdog)),
                    }
                }
                // No servant reported within this window. A single missed
                // tick says nothing about quorum: liveness is tickled and
                // the report set cleared the moment quorum is reached (see
                // the Liveness arm below), not on a timer. This timeout
                // exists only to come back around and poll `commands`.
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(self.shutdown(servants, watchdog));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_event(
        &self,
        event: ServantEvent,
        servants: &mut HashMap<ServantId, ServantHandle>,
        reports: &mut HashSet<ServantId>,
        watchdog: &mut Option<Watchdog>,
        events_tx: &Sender<ServantEvent>,
        next_generation: &mut u64,
        exiting: &mut bool,
        quorum: usize,
    ) -> LoopSignal {
        match event.kind {
            EventKind::Liveness => {
                reports.insert(event.servant_id);
                if reports.len() >= quorum {
                    if let Some(w) = watchdog.as_ref() {
                        if let Err(e) = w.tickle() {
                            tracing::error!(target: "sbd::inq", error = %e, "failed to tickle watchdog");
                        }
                    }
                    reports.clear();
                }
            }
            EventKind::Test => {
                tracing::info!(target: "sbd::inq", servant_id = event.servant_id, "servant observed TEST");
            }
            EventKind::ExitReq => {
                tracing::warn!(target: "sbd::inq", servant_id = event.servant_id, "servant observed EXIT command; cascading to all servants");
                *exiting = true;
                for (id, handle) in servants.iter() {
                    if *id != event.servant_id {
                        handle.cancel.cancel();
                    }
                }
            }
            EventKind::FenceRequested { cmd, from } => {
                tracing::error!(
                    target: "sbd::inq",
                    servant_id = event.servant_id,
                    from,
                    cmd = ?cmd,
                    "fence command received; abandoning watchdog"
                );
                if let Some(w) = watchdog.take() {
                    w.abandon();
                } else {
                    tracing::error!(target: "sbd::inq", "fence requested but no watchdog armed; node will not reboot automatically");
                }
                for (_, handle) in servants.iter() {
                    handle.cancel.cancel();
                }
                return LoopSignal::Fence;
            }
            EventKind::Exited(reason) => {
                reports.remove(&event.servant_id);

                let current_generation = servants.get(&event.servant_id).map(|h| h.generation);
                if current_generation != Some(event.generation) {
                    tracing::debug!(
                        target: "sbd::inq",
                        servant_id = event.servant_id,
                        "ignoring exit from a superseded servant generation"
                    );
                    return LoopSignal::Continue;
                }

                match &reason {
                    ExitReason::Cancelled | ExitReason::ExitCommand => {
                        tracing::info!(target: "sbd::inq", servant_id = event.servant_id, "servant stopped");
                        if let Some(handle) = servants.remove(&event.servant_id) {
                            let _ = handle.join.join();
                        }
                    }
                    ExitReason::FenceRequested(cmd) => {
                        tracing::warn!(target: "sbd::inq", servant_id = event.servant_id, cmd = ?cmd, "servant thread ended after fence command");
                        servants.remove(&event.servant_id);
                    }
                    ExitReason::Failed(msg) => {
                        tracing::error!(target: "sbd::inq", servant_id = event.servant_id, error = %msg, "servant thread failed");
                        if let Some(handle) = servants.remove(&event.servant_id) {
                            let _ = handle.join.join();
                        }
                        if *exiting {
                            // Tearing down already; let it stay dead.
                        } else if let Some(device) = self.config.devices.get(event.servant_id) {
                            tracing::warn!(target: "sbd::inq", servant_id = event.servant_id, path = %device.display(), "respawning failed servant");
                            let generation = *next_generation;
                            *next_generation += 1;
                            let handle = self.spawn_one(event.servant_id, generation, device, events_tx);
                            servants.insert(event.servant_id, handle);
                        }
                    }
                }

                if *exiting && servants.is_empty() {
                    return LoopSignal::CleanShutdown;
                }
            }
        }
        LoopSignal::Continue
    }

    fn shutdown(
        &self,
        servants: HashMap<ServantId, ServantHandle>,
        watchdog: Option<Watchdog>,
    ) -> Outcome {
        for (_, handle) in servants {
            handle.cancel.cancel();
            let _ = handle.join.join();
        }
        if let Some(w) = watchdog {
            if let Err(e) = w.close_clean() {
                tracing::warn!(target: "sbd::inq", error = %e, "failed to close watchdog cleanly");
            }
        }
        Outcome::CleanShutdown
    }

    fn fence(
        &self,
        servants: HashMap<ServantId, ServantHandle>,
        watchdog: Option<Watchdog>,
    ) -> Outcome {
        for (_, handle) in servants {
            handle.cancel.cancel();
        }
        if let Some(w) = watchdog {
            w.abandon();
        }
        Outcome::Fenced
    }

    /// One-shot `ping`: allocate (if needed) and send a TEST to every
    /// configured disk, returning per-disk success. Surfaced to operators
    /// since the thread model makes it available for free (SPEC_FULL.md
    /// §6).
    pub fn ping_all(&self) -> Vec<(std::path::PathBuf, bool)> {
        self.config
            .devices
            .iter()
            .map(|device| {
                let ok = self.ping_one(device).is_ok();
                (device.clone(), ok)
            })
            .collect()
    }

    fn ping_one(&self, device: &Path) -> SbdResult<()> {
        let dev = BlockDevice::open(device)?;
        slot::slot_allocate(&dev, &self.config.node_name)?;
        slot::slot_ping(&dev, &self.config.node_name, &self.config.node_name)
    }

    /// Send `cmd` to `target` on every configured disk (the `message`
    /// subcommand). Unlike `ping`, the caller needs assurance the command
    /// was actually picked up: after every write lands we wait out
    /// `timeout_msgwait` once, the same grace period a servant's own
    /// mailbox poll relies on, before reporting back (spec.md §4.2).
    pub fn message_all(&self, target: &str, cmd: Command) -> Vec<(std::path::PathBuf, SbdResult<()>)> {
        let results: Vec<(std::path::PathBuf, SbdResult<()>)> = self
            .config
            .devices
            .iter()
            .map(|device| {
                let result = (|| {
                    let dev = BlockDevice::open(device)?;
                    slot::slot_msg(&dev, target, &self.config.node_name, cmd)
                })();
                (device.clone(), result)
            })
            .collect();

        if results.iter().any(|(_, r)| r.is_ok()) {
            std::thread::sleep(Duration::from_secs(u64::from(self.config.timeout_msgwait)));
        }

        results
    }
}

/// Double-fork and detach from the controlling terminal, redirecting the
/// standard streams to `/dev/null`. Unix-only, gated behind `-D`.
#[cfg(unix)]
fn daemonize() -> SbdResult<()> {
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    unsafe {
        match libc::fork() {
            -1 => return Err(SbdError::Fatal("first fork() failed".into())),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err(SbdError::Fatal("setsid() failed".into()));
        }

        match libc::fork() {
            -1 => return Err(SbdError::Fatal("second fork() failed".into())),
            0 => {}
            _ => std::process::exit(0),
        }

        let _ = libc::chdir(CString::new("/").unwrap().as_ptr());
    }

    let devnull_r = OpenOptions::new()
        .read(true)
        .open("/dev/null")
        .map_err(|e| SbdError::io("/dev/null", e))?;
    let devnull_w = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .map_err(|e| SbdError::io("/dev/null", e))?;

    unsafe {
        libc::dup2(devnull_r.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(devnull_w.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(devnull_w.as_raw_fd(), libc::STDERR_FILENO);
    }

    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> SbdResult<()> {
    Err(SbdError::Fatal("daemonize is only supported on unix".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fresh_disk(path: &PathBuf, slot_count: u16, timeouts: (u32, u32, u32)) {
        let sector_size = 512usize;
        let total = sector_size * (1 + slot_count as usize);
        std::fs::write(path, vec![0u8; total]).unwrap();
        let dev = BlockDevice::open_for_test(path, sector_size).unwrap();
        Header::new(slot_count, timeouts.0, timeouts.1, timeouts.2)
            .write(&dev)
            .unwrap();
    }

    fn sample_config(dir: &std::path::Path, n: usize) -> NodeConfig {
        let devices: Vec<PathBuf> = (0..n).map(|i| dir.join(format!("disk{i}.img"))).collect();
        for d in &devices {
            // Kept short (rather than the spec-default 10s) so
            // `message_all`'s post-write grace wait doesn't make the test
            // suite crawl; validate() only requires msgwait > loop.
            fresh_disk(d, 4, (15, 1, 2));
        }
        NodeConfig {
            node_name: "nodeA".into(),
            devices,
            timeout_watchdog: 15,
            timeout_loop: 1,
            timeout_msgwait: 2,
            timeout_allocate: 2,
            timeout_watchdog_warn: 3,
            watchdog_device: PathBuf::from("/dev/null"),
            watchdog_disabled: true,
            daemonize: false,
            skip_realtime: false,
            verbose: 0,
        }
    }

    #[test]
    fn prepare_succeeds_with_full_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 3);
        let inq = Inquisitor::new(cfg);
        assert!(inq.prepare().is_ok());
    }

    #[test]
    fn prepare_fails_below_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = sample_config(dir.path(), 3);
        // Corrupt two of the three disks' magic.
        for device in cfg.devices.iter().take(2) {
            std::fs::write(device, vec![0xFFu8; 512 * 5]).unwrap();
        }
        let inq = Inquisitor::new(cfg);
        match inq.prepare() {
            Err(SbdError::QuorumLost { good, configured }) => {
                assert_eq!(good, 1);
                assert_eq!(configured, 3);
            }
            other => panic!("expected QuorumLost, got {other:?}"),
        }
    }

    #[test]
    fn prepare_rejects_mismatched_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = sample_config(dir.path(), 1);
        fresh_disk(&cfg.devices[0], 4, (30, 1, 10));
        cfg.devices.truncate(1);
        let inq = Inquisitor::new(cfg);
        assert!(inq.prepare().is_err());
    }

    #[test]
    fn ping_all_reports_per_disk_success() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 2);
        let inq = Inquisitor::new(cfg);
        let results = inq.ping_all();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, ok)| *ok));
    }

    #[test]
    fn message_all_delivers_to_every_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 2);
        for device in &cfg.devices {
            let dev = BlockDevice::open_for_test(device, 512).unwrap();
            slot::slot_allocate(&dev, "peer").unwrap();
        }
        let inq = Inquisitor::new(cfg.clone());
        let results = inq.message_all("peer", Command::Test);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        for device in &cfg.devices {
            let dev = BlockDevice::open_for_test(device, 512).unwrap();
            let idx = slot::slot_find(&dev, "peer").unwrap().unwrap();
            let s = slot::mbox_read(&dev, idx).unwrap();
            assert_eq!(s.cmd, Command::Test);
        }
    }

    fn dummy_handle(generation: u64) -> ServantHandle {
        ServantHandle {
            generation,
            cancel: CancelToken::new(),
            join: std::thread::spawn(|| {}),
        }
    }

    #[test]
    fn liveness_reaching_quorum_tickles_and_clears_reports() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 2);
        let inq = Inquisitor::new(cfg);
        let (tx, _rx) = unbounded();
        let mut servants = HashMap::new();
        servants.insert(0, dummy_handle(0));
        servants.insert(1, dummy_handle(0));
        let mut reports = HashSet::new();
        let mut watchdog = None;
        let mut next_gen = 5;
        let mut exiting = false;

        let s1 = inq.handle_event(
            ServantEvent { servant_id: 0, generation: 0, kind: EventKind::Liveness },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s1, LoopSignal::Continue));
        assert_eq!(reports.len(), 1);

        let s2 = inq.handle_event(
            ServantEvent { servant_id: 1, generation: 0, kind: EventKind::Liveness },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s2, LoopSignal::Continue));
        assert!(reports.is_empty(), "reports must clear once quorum is reached");
    }

    #[test]
    fn exit_cascade_ends_in_clean_shutdown_once_all_servants_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 2);
        let inq = Inquisitor::new(cfg);
        let (tx, _rx) = unbounded();
        let mut servants = HashMap::new();
        servants.insert(0, dummy_handle(0));
        servants.insert(1, dummy_handle(0));
        let mut reports = HashSet::new();
        let mut watchdog = None;
        let mut next_gen = 5;
        let mut exiting = false;

        let s = inq.handle_event(
            ServantEvent { servant_id: 0, generation: 0, kind: EventKind::ExitReq },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s, LoopSignal::Continue));
        assert!(exiting);

        let s = inq.handle_event(
            ServantEvent { servant_id: 1, generation: 0, kind: EventKind::Exited(ExitReason::Cancelled) },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s, LoopSignal::Continue));
        assert_eq!(servants.len(), 1);

        let s = inq.handle_event(
            ServantEvent { servant_id: 0, generation: 0, kind: EventKind::Exited(ExitReason::ExitCommand) },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s, LoopSignal::CleanShutdown));
        assert!(servants.is_empty());
    }

    #[test]
    fn failed_servant_is_respawned_with_a_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 1);
        let inq = Inquisitor::new(cfg);
        let (tx, _rx) = unbounded();
        let mut servants = HashMap::new();
        servants.insert(0, dummy_handle(0));
        let mut reports = HashSet::new();
        let mut watchdog = None;
        let mut next_gen = 7;
        let mut exiting = false;

        let s = inq.handle_event(
            ServantEvent { servant_id: 0, generation: 0, kind: EventKind::Exited(ExitReason::Failed("disk error".into())) },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s, LoopSignal::Continue));
        let respawned = servants.get(&0).expect("servant respawned after failure");
        assert_eq!(respawned.generation, 7);
        assert_eq!(next_gen, 8);

        respawned.cancel.cancel();
        let handle = servants.remove(&0).unwrap();
        let _ = handle.join.join();
    }

    #[test]
    fn stale_exit_from_a_superseded_generation_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample_config(dir.path(), 1);
        let inq = Inquisitor::new(cfg);
        let (tx, _rx) = unbounded();
        let mut servants = HashMap::new();
        servants.insert(0, dummy_handle(1));
        let mut reports = HashSet::new();
        let mut watchdog = None;
        let mut next_gen = 9;
        let mut exiting = false;

        let s = inq.handle_event(
            ServantEvent { servant_id: 0, generation: 0, kind: EventKind::Exited(ExitReason::Failed("stale".into())) },
            &mut servants, &mut reports, &mut watchdog, &tx, &mut next_gen, &mut exiting, 2,
        );
        assert!(matches!(s, LoopSignal::Continue));
        assert_eq!(servants.get(&0).unwrap().generation, 1, "current generation must survive a stale event");
        assert_eq!(next_gen, 9, "no respawn should happen for a stale event");
    }
}
