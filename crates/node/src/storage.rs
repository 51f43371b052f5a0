//! Boot-epoch persistence across deep sleep.
//!
//! The counter lives on a tmpfs path: it survives the process restart that
//! models deep sleep, and is gone after a reboot (full power loss), which
//! resets it to [`BootEpoch::FIRST`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Count of successful publishes since the last full power loss, plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootEpoch(u32);

impl BootEpoch {
    pub const FIRST: BootEpoch = BootEpoch(1);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Default for BootEpoch {
    fn default() -> Self {
        Self::FIRST
    }
}

/// Storage that outlives deep sleep but not power loss.
pub trait EpochStore {
    /// `None` when nothing was stored since power-up.
    fn load(&self) -> Result<Option<BootEpoch>>;
    fn store(&mut self, epoch: BootEpoch) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    boot_epoch: BootEpoch,
}

/// JSON file store, replaced atomically on each write.
pub struct FileEpochStore {
    path: PathBuf,
}

impl FileEpochStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EpochStore for FileEpochStore {
    fn load(&self) -> Result<Option<BootEpoch>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let persisted: Persisted = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(persisted.boot_epoch))
    }

    fn store(&mut self, epoch: BootEpoch) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string(&Persisted { boot_epoch: epoch })?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!(boot_epoch = epoch.get(), path = %self.path.display(), "boot epoch stored");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
