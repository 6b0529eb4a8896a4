// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sbd contributors

//! Crate-wide error type.

use std::fmt;
use std::path::PathBuf;

/// All fallible outcomes this agent can produce.
///
/// Mirrors the error kinds spec.md's error-handling design names: servants
/// never propagate these across the servant/inquisitor boundary (they act
/// locally, see `servant::run`), so in practice this type surfaces at the
/// CLI layer and inside `Inquisitor` Phase A.
#[derive(Debug)]
pub enum SbdError {
    /// A device could not be opened (absent path, permission denied, not a
    /// block device).
    OpenError { path: PathBuf, reason: String },
    /// A sector-aligned read or write failed mid-operation.
    IoError { path: PathBuf, reason: String },
    /// The disk's header magic or version did not validate.
    BadDisk { path: PathBuf, reason: String },
    /// Slot allocation found no empty slot.
    NoSlot { path: PathBuf },
    /// Configuration is invalid or inconsistent across disks.
    BadConfig(String),
    /// Fewer than a majority of configured disks reported good at startup.
    QuorumLost { good: usize, configured: usize },
    /// Out-of-memory or otherwise impossible internal state.
    Fatal(String),
}

impl fmt::Display for SbdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenError { path, reason } => {
                write!(f, "failed to open {}: {}", path.display(), reason)
            }
            Self::IoError { path, reason } => {
                write!(f, "I/O error on {}: {}", path.display(), reason)
            }
            Self::BadDisk { path, reason } => {
                write!(f, "bad disk {}: {}", path.display(), reason)
            }
            Self::NoSlot { path } => write!(f, "no free slot on {}", path.display()),
            Self::BadConfig(s) => write!(f, "configuration error: {}", s),
            Self::QuorumLost { good, configured } => write!(
                f,
                "quorum lost: only {} of {} configured disks are usable",
                good, configured
            ),
            Self::Fatal(s) => write!(f, "fatal: {}", s),
        }
    }
}

impl std::error::Error for SbdError {}

impl From<std::io::Error> for SbdError {
    fn from(e: std::io::Error) -> Self {
        Self::Fatal(e.to_string())
    }
}

impl SbdError {
    pub fn open(path: impl Into<PathBuf>, e: impl fmt::Display) -> Self {
        Self::OpenError {
            path: path.into(),
            reason: e.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, e: impl fmt::Display) -> Self {
        Self::IoError {
            path: path.into(),
            reason: e.to_string(),
        }
    }

    pub fn bad_disk(path: impl Into<PathBuf>, e: impl fmt::Display) -> Self {
        Self::BadDisk {
            path: path.into(),
            reason: e.to_string(),
        }
    }
}

pub type SbdResult<T> = Result<T, SbdError>;
