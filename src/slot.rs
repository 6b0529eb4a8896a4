// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! Slot Protocol (SLOT): the disk's header sector and per-node mailbox
//! sectors: allocation, read, write, and message send/clear.
//!
//! Sector 0 is the header. Sectors `1..=slot_count` are mailboxes, one per
//! allocated node. All multi-byte integers are little-endian; unused bytes
//! are zero.

use crate::bdio::BlockDevice;
use crate::error::{SbdError, SbdResult};

/// 8-byte ASCII magic identifying a disk initialized by this agent.
pub const MAGIC: &[u8; 8] = b"SBDMAGIC";
/// On-disk format version this build writes and expects.
pub const VERSION: u8 = 1;
/// Fixed width of the `name`/`from` fields, in bytes.
pub const NAME_LEN: usize = 64;

const HEADER_FIXED_LEN: usize = 8 + 1 + 2 + 4 + 4 + 4;
const MBOX_FIXED_LEN: usize = NAME_LEN + 1 + NAME_LEN;

/// Mailbox command codes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Clear,
    Test,
    Reset,
    Off,
    Exit,
    /// A command byte that doesn't match any known code, treated as
    /// partial-write garbage by the servant loop.
    Unknown(u8),
}

impl Command {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Clear => 0,
            Self::Test => 1,
            Self::Reset => 2,
            Self::Off => 3,
            Self::Exit => 4,
            Self::Unknown(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Clear,
            1 => Self::Test,
            2 => Self::Reset,
            3 => Self::Off,
            4 => Self::Exit,
            other => Self::Unknown(other),
        }
    }
}

/// The disk's header sector: magic, version, slot count, and the three
/// timeouts that must match across every disk of one node (invariant I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub slot_count: u16,
    pub timeout_watchdog: u32,
    pub timeout_loop: u32,
    pub timeout_msgwait: u32,
}

impl Header {
    pub fn new(slot_count: u16, timeout_watchdog: u32, timeout_loop: u32, timeout_msgwait: u32) -> Self {
        Self {
            slot_count,
            timeout_watchdog,
            timeout_loop,
            timeout_msgwait,
        }
    }

    fn encode(&self, sector: &mut [u8]) {
        sector[0..8].copy_from_slice(MAGIC);
        sector[8] = VERSION;
        sector[9..11].copy_from_slice(&self.slot_count.to_le_bytes());
        sector[11..15].copy_from_slice(&self.timeout_watchdog.to_le_bytes());
        sector[15..19].copy_from_slice(&self.timeout_loop.to_le_bytes());
        sector[19..23].copy_from_slice(&self.timeout_msgwait.to_le_bytes());
    }

    fn decode(sector: &[u8], path: &std::path::Path) -> SbdResult<Self> {
        if sector.len() < HEADER_FIXED_LEN {
            return Err(SbdError::bad_disk(path, "header sector too short"));
        }
        if &sector[0..8] != MAGIC {
            return Err(SbdError::bad_disk(path, "bad magic"));
        }
        if sector[8] != VERSION {
            return Err(SbdError::bad_disk(
                path,
                format!("unsupported version {}", sector[8]),
            ));
        }
        let slot_count = u16::from_le_bytes(sector[9..11].try_into().unwrap());
        let timeout_watchdog = u32::from_le_bytes(sector[11..15].try_into().unwrap());
        let timeout_loop = u32::from_le_bytes(sector[15..19].try_into().unwrap());
        let timeout_msgwait = u32::from_le_bytes(sector[19..23].try_into().unwrap());
        Ok(Self {
            slot_count,
            timeout_watchdog,
            timeout_loop,
            timeout_msgwait,
        })
    }

    /// Read and validate the header (invariant I1).
    pub fn read(dev: &BlockDevice) -> SbdResult<Self> {
        let sector = dev.read_sector(0)?;
        Self::decode(&sector, dev.path())
    }

    /// Write the header sector (used only by `create`, an out-of-band
    /// operation per spec.md §5).
    pub fn write(&self, dev: &BlockDevice) -> SbdResult<()> {
        let mut sector = dev.sector_alloc();
        self.encode(&mut sector);
        dev.write_sector(0, &sector)
    }
}

/// A mailbox slot: the owning node's name, the pending command, and who
/// sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub cmd: Command,
    pub from: String,
}

impl Slot {
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            cmd: Command::Clear,
            from: String::new(),
        }
    }

    fn encode(&self, sector: &mut [u8]) -> SbdResult<()> {
        write_fixed_str(&mut sector[0..NAME_LEN], &self.name)?;
        sector[NAME_LEN] = self.cmd.to_byte();
        write_fixed_str(&mut sector[NAME_LEN + 1..NAME_LEN + 1 + NAME_LEN], &self.from)?;
        Ok(())
    }

    fn decode(sector: &[u8]) -> Self {
        let name = read_fixed_str(&sector[0..NAME_LEN]);
        let cmd = Command::from_byte(sector[NAME_LEN]);
        let from = read_fixed_str(&sector[NAME_LEN + 1..NAME_LEN + 1 + NAME_LEN]);
        Self { name, cmd, from }
    }
}

fn write_fixed_str(field: &mut [u8], s: &str) -> SbdResult<()> {
    let bytes = s.as_bytes();
    if bytes.len() > field.len() {
        return Err(SbdError::Fatal(format!(
            "name/from value {:?} exceeds {} bytes",
            s,
            field.len()
        )));
    }
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn mbox_sector_index(slot_index: u16) -> u64 {
    u64::from(slot_index) + 1
}

/// Read mailbox `index`.
pub fn mbox_read(dev: &BlockDevice, index: u16) -> SbdResult<Slot> {
    let sector = dev.read_sector(mbox_sector_index(index))?;
    Ok(Slot::decode(&sector))
}

/// Write mailbox `index` (invariant I3: always a full sector, atomically).
pub fn mbox_write(dev: &BlockDevice, index: u16, slot: &Slot) -> SbdResult<()> {
    let mut sector = dev.sector_alloc();
    slot.encode(&mut sector)?;
    dev.write_sector(mbox_sector_index(index), &sector)
}

/// Allocation algorithm (spec.md §4.2):
/// 1. validate header,
/// 2. idempotent re-allocation if `name` already owns a slot,
/// 3. otherwise claim the lowest-indexed empty (all-zero-name) slot,
/// 4. `NoSlot` if none exists.
pub fn slot_allocate(dev: &BlockDevice, name: &str) -> SbdResult<u16> {
    let header = Header::read(dev)?;

    let mut first_empty: Option<u16> = None;
    for i in 0..header.slot_count {
        let slot = mbox_read(dev, i)?;
        if slot.name == name {
            return Ok(i);
        }
        if first_empty.is_none() && slot.name.is_empty() {
            first_empty = Some(i);
        }
    }

    match first_empty {
        Some(i) => {
            let slot = Slot {
                name: name.to_string(),
                cmd: Command::Clear,
                from: String::new(),
            };
            mbox_write(dev, i, &slot)?;
            tracing::info!(target: "sbd::slot", path = %dev.path().display(), slot = i, name, "allocated slot");
            Ok(i)
        }
        None => Err(SbdError::NoSlot {
            path: dev.path().to_path_buf(),
        }),
    }
}

/// Find the slot index owned by `name`, without allocating.
pub fn slot_find(dev: &BlockDevice, name: &str) -> SbdResult<Option<u16>> {
    let header = Header::read(dev)?;
    for i in 0..header.slot_count {
        let slot = mbox_read(dev, i)?;
        if slot.name == name {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Send a command to `target`'s slot, tagged with `from`. Per spec.md
/// §4.2, delivery is assumed once the sector write returns plus a
/// `timeout_msgwait`-second grace period for the recipient's poll loop to
/// observe it; callers are responsible for that wait, this function only
/// performs the write.
pub fn slot_msg(dev: &BlockDevice, target: &str, from: &str, cmd: Command) -> SbdResult<()> {
    let index = slot_find(dev, target)?.ok_or_else(|| SbdError::NoSlot {
        path: dev.path().to_path_buf(),
    })?;
    let slot = Slot {
        name: target.to_string(),
        cmd,
        from: from.to_string(),
    };
    mbox_write(dev, index, &slot)?;
    tracing::info!(target: "sbd::slot", path = %dev.path().display(), target, from, cmd = ?cmd, "sent slot message");
    Ok(())
}

/// Ping is the TEST command sentinel; the recipient clears its own slot on
/// receipt with no synchronous acknowledgement required.
pub fn slot_ping(dev: &BlockDevice, target: &str, from: &str) -> SbdResult<()> {
    slot_msg(dev, target, from, Command::Test)
}

/// List all non-empty slots, in index order.
pub fn slot_list(dev: &BlockDevice) -> SbdResult<Vec<(u16, Slot)>> {
    let header = Header::read(dev)?;
    let mut out = Vec::new();
    for i in 0..header.slot_count {
        let slot = mbox_read(dev, i)?;
        if !slot.name.is_empty() {
            out.push((i, slot));
        }
    }
    Ok(out)
}

/// Dump the header for diagnostics (the `dump` subcommand).
pub fn header_dump(dev: &BlockDevice) -> SbdResult<Header> {
    Header::read(dev)
}

/// Clear a slot's command and sender, preserving its name (used by the
/// servant loop after acting on a `TEST` command, and after handling an
/// unrecognized one).
pub fn slot_clear(dev: &BlockDevice, index: u16) -> SbdResult<()> {
    let mut slot = mbox_read(dev, index)?;
    slot.cmd = Command::Clear;
    slot.from.clear();
    mbox_write(dev, index, &slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdio::BlockDevice;

    fn fresh_disk(dir: &std::path::Path, slot_count: u16) -> BlockDevice {
        let path = dir.join("disk.img");
        let sector_size = 512usize;
        let total = sector_size * (1 + slot_count as usize);
        std::fs::write(&path, vec![0u8; total]).unwrap();
        let dev = BlockDevice::open_for_test(&path, sector_size).unwrap();
        Header::new(slot_count, 15, 1, 10).write(&dev).unwrap();
        dev
    }

    #[test]
    fn header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fresh_disk(dir.path(), 5);
        let header = Header::read(&dev).unwrap();
        assert_eq!(header.slot_count, 5);
        assert_eq!(header.timeout_watchdog, 15);
        assert_eq!(header.timeout_loop, 1);
        assert_eq!(header.timeout_msgwait, 10);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 512 * 4]).unwrap();
        let dev = BlockDevice::open_for_test(&path, 512).unwrap();
        assert!(Header::read(&dev).is_err());
    }

    #[test]
    fn allocation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fresh_disk(dir.path(), 3);

        let first = slot_allocate(&dev, "nodeA").unwrap();
        let second = slot_allocate(&dev, "nodeA").unwrap();
        assert_eq!(first, second);

        // Mutates the disk only on the first call: slot content identical
        // after the second, idempotent call.
        let slot = mbox_read(&dev, first).unwrap();
        assert_eq!(slot.name, "nodeA");
        assert_eq!(slot.cmd, Command::Clear);
    }

    #[test]
    fn allocation_is_monotonic_and_dense() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fresh_disk(dir.path(), 4);

        let names = ["nodeA", "nodeB", "nodeC"];
        let mut indices = Vec::new();
        for n in names {
            indices.push(slot_allocate(&dev, n).unwrap());
        }
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn allocation_fails_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fresh_disk(dir.path(), 2);
        slot_allocate(&dev, "a").unwrap();
        slot_allocate(&dev, "b").unwrap();
        assert!(slot_allocate(&dev, "c").is_err());
    }

    #[test]
    fn message_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fresh_disk(dir.path(), 3);
        slot_allocate(&dev, "nodeA").unwrap();

        slot_msg(&dev, "nodeA", "nodeB", Command::Reset).unwrap();
        let index = slot_find(&dev, "nodeA").unwrap().unwrap();
        let slot = mbox_read(&dev, index).unwrap();
        assert_eq!(slot.cmd, Command::Reset);
        assert_eq!(slot.from, "nodeB");

        slot_clear(&dev, index).unwrap();
        let slot = mbox_read(&dev, index).unwrap();
        assert_eq!(slot.cmd, Command::Clear);
    }

    #[test]
    fn name_immutable_until_reallocated() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fresh_disk(dir.path(), 2);
        let idx = slot_allocate(&dev, "nodeA").unwrap();
        slot_msg(&dev, "nodeA", "peer", Command::Test).unwrap();
        let slot = mbox_read(&dev, idx).unwrap();
        assert_eq!(slot.name, "nodeA");
    }
}
