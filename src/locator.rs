//! Finds the device backup to export from.
//!
//! A backup is one subdirectory of the MobileSync store, usually named by
//! the device UDID. A directory qualifies when it holds a readable
//! manifest index (`Manifest.db`, or `Manifest.mbdb` for old backups).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{ExportError, Result};

pub const MANIFEST_DB: &str = "Manifest.db";
pub const MANIFEST_MBDB: &str = "Manifest.mbdb";

/// A backup directory that has been checked for a readable manifest.
/// Discovered once per run and never mutated.
#[derive(Debug, Clone)]
pub struct BackupRoot {
    path: PathBuf,
}

impl BackupRoot {
    /// Validate that `path` is one backup instance.
    pub fn open(path: &Path) -> Result<Self> {
        Self::probe(path).ok_or_else(|| ExportError::InvalidBackup(path.to_path_buf()))
    }

    fn probe(path: &Path) -> Option<Self> {
        for name in [MANIFEST_DB, MANIFEST_MBDB] {
            if fs::File::open(path.join(name)).is_ok() {
                return Some(Self {
                    path: path.to_path_buf(),
                });
            }
        }
        None
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The manifest file inside this backup, preferring the modern format.
    pub fn manifest_path(&self) -> PathBuf {
        let db = self.path.join(MANIFEST_DB);
        if db.is_file() {
            db
        } else {
            self.path.join(MANIFEST_MBDB)
        }
    }
}

/// Locate the backup to read.
///
/// With an explicit root the directory itself must be a valid backup.
/// Otherwise the platform-conventional store is scanned and the most
/// recently modified valid candidate wins.
pub fn locate(explicit_root: Option<&Path>) -> Result<BackupRoot> {
    if let Some(root) = explicit_root {
        return BackupRoot::open(root);
    }
    let store = default_store_dir()
        .ok_or_else(|| ExportError::NoBackupFound(PathBuf::from("<no conventional store>")))?;
    locate_in_store(&store)
}

/// Scan one store directory for backup instances.
pub fn locate_in_store(store: &Path) -> Result<BackupRoot> {
    let entries =
        fs::read_dir(store).map_err(|_| ExportError::NoBackupFound(store.to_path_buf()))?;

    let mut best: Option<(SystemTime, BackupRoot)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        // The store keeps a "Snapshot" dir next to real backups.
        if !path.is_dir() || path.file_name().is_some_and(|n| n == "Snapshot") {
            continue;
        }
        let Some(root) = BackupRoot::probe(&path) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(ts, _)| modified > *ts) {
            best = Some((modified, root));
        }
    }

    best.map(|(_, root)| root)
        .ok_or_else(|| ExportError::NoBackupFound(store.to_path_buf()))
}

fn default_store_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library/Application Support/MobileSync/Backup"))
    } else if cfg!(windows) {
        dirs::config_dir().map(|c| c.join("Apple Computer").join("MobileSync").join("Backup"))
    } else {
        None
    }
}
