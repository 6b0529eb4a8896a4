// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! `sbd`: storage-based fencing agent command-line entry point.
//!
//! Subcommands operate directly on the primitives in `bdio`/`slot`/`wdg`;
//! `watch` is the long-running supervisor (`inquisitor`).

mod bdio;
mod config;
mod error;
mod inquisitor;
mod servant;
mod slot;
mod watchdog;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use crossbeam::channel::unbounded;

use config::NodeConfig;
use error::SbdResult;
use inquisitor::{Inquisitor, InquisitorCommand, Outcome};
use slot::Command as SlotCommand;

const BANNER: &str = r"
 ____  ____  ____
/ ___|| __ )|  _ \
\___ \|  _ \| | | |
 ___) | |_) | |_| |
|____/|____/|____/  storage-based death
";

#[derive(Parser, Debug)]
#[command(name = "sbd", version, about = "Storage-based fencing agent")]
struct Args {
    /// Block device to operate on; repeat `-d` for more than one disk.
    #[arg(short = 'd', long = "device", global = true)]
    devices: Vec<PathBuf>,

    /// This node's name (defaults to the local hostname).
    #[arg(short = 'n', long = "node", global = true)]
    node: Option<String>,

    /// Watchdog timeout in seconds.
    #[arg(short = '1', long = "watchdog-timeout", default_value_t = config::DEFAULT_TIMEOUT_WATCHDOG, global = true)]
    timeout_watchdog: u32,

    /// Slot allocation timeout in seconds.
    #[arg(short = '2', long = "allocate-timeout", default_value_t = config::DEFAULT_TIMEOUT_ALLOCATE, global = true)]
    timeout_allocate: u32,

    /// Servant poll loop timeout in seconds.
    #[arg(short = '3', long = "loop-timeout", default_value_t = config::DEFAULT_TIMEOUT_LOOP, global = true)]
    timeout_loop: u32,

    /// Message wait timeout in seconds.
    #[arg(short = '4', long = "msgwait-timeout", default_value_t = config::DEFAULT_TIMEOUT_MSGWAIT, global = true)]
    timeout_msgwait: u32,

    /// Servant loop-latency warning threshold in seconds; diagnostic only,
    /// does not change when the hardware watchdog fires.
    #[arg(short = '5', long = "watchdog-warn-timeout", default_value_t = config::DEFAULT_TIMEOUT_WATCHDOG_WARN, global = true)]
    timeout_watchdog_warn: u32,

    /// Daemonize (double-fork and detach) before entering the watch loop.
    #[arg(short = 'D', long, global = true)]
    daemonize: bool,

    /// Run without arming a hardware watchdog.
    #[arg(short = 'W', long, global = true)]
    no_watchdog: bool,

    /// Path to the watchdog character device.
    #[arg(short = 'w', long = "watchdog-device", default_value = "/dev/watchdog", global = true)]
    watchdog_device: PathBuf,

    /// Skip real-time scheduling / memory locking. The helper this would
    /// wrap is out of scope for this agent; the flag is accepted so the CLI
    /// surface matches the original tool's.
    #[arg(short = 'R', long = "skip-realtime", global = true)]
    skip_realtime: bool,

    /// Load disk list and timeouts from a JSON config file, overriding
    /// the corresponding CLI flags.
    #[arg(long = "config", global = true)]
    config_file: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Initialize a disk's header sector.
    Create {
        /// Number of mailbox slots to allocate on the disk.
        #[arg(short = 's', long, default_value_t = 255)]
        slots: u16,
    },
    /// Print a disk's header.
    Dump,
    /// List every occupied slot on a disk.
    List,
    /// Claim (or confirm) this node's slot on every configured disk.
    Allocate,
    /// Send a command to a peer's slot on every configured disk.
    Message {
        /// The peer node name to address.
        target: String,
        /// One of: test, reset, off, exit.
        cmd: String,
    },
    /// Send a TEST to every configured disk and report per-disk success.
    Ping,
    /// Run the supervisor: prepare every disk, then watch for commands
    /// and arm the watchdog while quorum holds.
    Watch,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("sbd: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(true)
        .init();
}

fn build_config(args: &Args) -> SbdResult<NodeConfig> {
    let mut cfg = if let Some(path) = &args.config_file {
        NodeConfig::from_file(path)?
    } else {
        NodeConfig::default()
    };

    if !args.devices.is_empty() {
        cfg.devices = args.devices.clone();
    }
    if let Some(node) = &args.node {
        cfg.node_name = node.clone();
    } else if cfg.node_name.is_empty() {
        cfg.node_name = hostname().unwrap_or_default();
    }
    cfg.timeout_watchdog = args.timeout_watchdog;
    cfg.timeout_allocate = args.timeout_allocate;
    cfg.timeout_loop = args.timeout_loop;
    cfg.timeout_msgwait = args.timeout_msgwait;
    cfg.timeout_watchdog_warn = args.timeout_watchdog_warn;
    cfg.watchdog_device = args.watchdog_device.clone();
    cfg.watchdog_disabled = args.no_watchdog;
    cfg.daemonize = args.daemonize;
    cfg.skip_realtime = args.skip_realtime;
    cfg.verbose = args.verbose;

    cfg.validate()?;
    Ok(cfg)
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn run(args: Args) -> SbdResult<()> {
    match &args.command {
        Cmd::Create { slots } => cmd_create(&args, *slots),
        Cmd::Dump => cmd_dump(&args),
        Cmd::List => cmd_list(&args),
        Cmd::Allocate => cmd_allocate(&args),
        Cmd::Message { target, cmd } => cmd_message(&args, target, cmd),
        Cmd::Ping => cmd_ping(&args),
        Cmd::Watch => cmd_watch(&args),
    }
}

fn single_device(args: &Args) -> SbdResult<PathBuf> {
    args.devices
        .first()
        .cloned()
        .ok_or_else(|| error::SbdError::BadConfig("at least one -d <device> is required".into()))
}

fn cmd_create(args: &Args, slots: u16) -> SbdResult<()> {
    let device = single_device(args)?;
    let dev = bdio::BlockDevice::open(&device)?;
    let header = slot::Header::new(
        slots,
        args.timeout_watchdog,
        args.timeout_loop,
        args.timeout_msgwait,
    );
    header.write(&dev)?;
    for i in 0..slots {
        slot::mbox_write(&dev, i, &slot::Slot::empty())?;
    }
    println!("initialized {} with {} slots", device.display(), slots);
    Ok(())
}

fn cmd_dump(args: &Args) -> SbdResult<()> {
    let device = single_device(args)?;
    let dev = bdio::BlockDevice::open(&device)?;
    let header = slot::header_dump(&dev)?;
    println!("{}:", device.display());
    println!("  slots           = {}", header.slot_count);
    println!("  timeout_watchdog = {}", header.timeout_watchdog);
    println!("  timeout_loop     = {}", header.timeout_loop);
    println!("  timeout_msgwait  = {}", header.timeout_msgwait);
    Ok(())
}

fn cmd_list(args: &Args) -> SbdResult<()> {
    let device = single_device(args)?;
    let dev = bdio::BlockDevice::open(&device)?;
    for (index, entry) in slot::slot_list(&dev)? {
        println!("{:>4}  {:<64}  {:?}  <- {}", index, entry.name, entry.cmd, entry.from);
    }
    Ok(())
}

fn cmd_allocate(args: &Args) -> SbdResult<()> {
    let cfg = build_config(args)?;
    for device in &cfg.devices {
        let dev = bdio::BlockDevice::open(device)?;
        let index = slot::slot_allocate(&dev, &cfg.node_name)?;
        println!("{}: slot {}", device.display(), index);
    }
    Ok(())
}

fn cmd_message(args: &Args, target: &str, cmd: &str) -> SbdResult<()> {
    let cfg = build_config(args)?;
    let command = parse_command(cmd)?;
    let inq = Inquisitor::new(cfg);
    let mut failed = false;
    for (device, result) in inq.message_all(target, command) {
        match result {
            Ok(()) => println!("{}: sent", device.display()),
            Err(e) => {
                failed = true;
                println!("{}: failed: {}", device.display(), e);
            }
        }
    }
    if failed {
        return Err(error::SbdError::Fatal("message delivery failed on at least one disk".into()));
    }
    Ok(())
}

fn parse_command(s: &str) -> SbdResult<SlotCommand> {
    match s.to_ascii_lowercase().as_str() {
        "test" => Ok(SlotCommand::Test),
        "reset" => Ok(SlotCommand::Reset),
        "off" => Ok(SlotCommand::Off),
        "exit" => Ok(SlotCommand::Exit),
        "clear" => Ok(SlotCommand::Clear),
        other => Err(error::SbdError::BadConfig(format!("unknown command {other:?}"))),
    }
}

fn cmd_ping(args: &Args) -> SbdResult<()> {
    let cfg = build_config(args)?;
    let inq = Inquisitor::new(cfg);
    let mut failed = false;
    for (device, ok) in inq.ping_all() {
        println!("{}: {}", device.display(), if ok { "alive" } else { "unreachable" });
        failed |= !ok;
    }
    if failed {
        return Err(error::SbdError::Fatal("ping failed on at least one disk".into()));
    }
    Ok(())
}

fn cmd_watch(args: &Args) -> SbdResult<()> {
    let cfg = build_config(args)?;
    eprintln!("{BANNER}");
    tracing::info!(target: "sbd", node = %cfg.node_name, devices = ?cfg.devices, "starting watch");
    if cfg.skip_realtime {
        tracing::debug!(target: "sbd", "real-time scheduling / memory locking skipped (-R)");
    }

    let (tx, rx) = unbounded();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        tracing::warn!(target: "sbd", "received interrupt; shutting down");
        let _ = ctrlc_tx.send(InquisitorCommand::Shutdown);
    })
    .map_err(|e| error::SbdError::Fatal(format!("failed to install signal handler: {e}")))?;

    let inquisitor = Inquisitor::new(cfg);
    match inquisitor.run(rx)? {
        Outcome::CleanShutdown => {
            tracing::info!(target: "sbd", "shut down cleanly");
            Ok(())
        }
        Outcome::Fenced => Err(error::SbdError::Fatal(
            "quorum lost or fence command received; node is expected to reboot".into(),
        )),
    }
}
