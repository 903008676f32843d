//! Read-only view of a backup's file index.
//!
//! The backup never stores files under their device paths. Each logical
//! file lives in a flat blob store under the lowercase hex SHA-1 of
//! `"{domain}-{relativePath}"`. The mapping itself is recorded in a
//! manifest, which comes in two formats:
//!
//! * `Manifest.db` — a SQLite database with a `Files` table. Blobs are
//!   sharded into subdirectories named by the first two hex characters.
//! * `Manifest.mbdb` — the legacy binary index: a `mbdb\x05\x00` header
//!   followed by big-endian records. Blobs sit flat next to the manifest.
//!
//! All entries are loaded up front into an arena with a by-path index, so
//! lookups and prefix scans never touch the filesystem again.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use rusqlite::{Connection, OpenFlags};
use sha1::{Digest, Sha1};

use crate::error::{ExportError, Result};
use crate::locator::{BackupRoot, MANIFEST_DB};

/// What a manifest entry points at on the device filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One row of the backup index. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub domain: String,
    pub relative_path: String,
    /// Hashed blob name; deterministic function of (domain, relative_path).
    pub file_id: String,
    pub kind: EntryKind,
}

/// The blob name for a logical file: lowercase hex SHA-1 over
/// `"{domain}-{relative_path}"`. The `-` separator and the lowercase hex
/// are load-bearing; any deviation yields the name of a blob that does
/// not exist rather than an error.
pub fn file_id(domain: &str, relative_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"-");
    hasher.update(relative_path.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// `Manifest.db`; blobs sharded by the first two hex characters.
    Sqlite,
    /// `Manifest.mbdb`; blobs stored flat.
    Mbdb,
}

#[derive(Debug)]
pub struct Manifest {
    root: PathBuf,
    flavor: Flavor,
    entries: Vec<ManifestEntry>,
    /// `"{domain}-{relative_path}"` → arena index.
    index: HashMap<String, usize>,
}

impl Manifest {
    /// Load the full index of a backup. Any parse or read failure here is
    /// fatal for the run.
    pub fn open(root: &BackupRoot) -> Result<Self> {
        let manifest_path = root.manifest_path();
        let flavor = if manifest_path.ends_with(MANIFEST_DB) {
            Flavor::Sqlite
        } else {
            Flavor::Mbdb
        };
        let entries = match flavor {
            Flavor::Sqlite => load_sqlite(&manifest_path)?,
            Flavor::Mbdb => {
                let data = fs::read(&manifest_path)
                    .map_err(|e| ExportError::CorruptManifest(e.to_string()))?;
                parse_mbdb(&data)?
            }
        };
        Ok(Self::from_parts(root.path().to_path_buf(), flavor, entries))
    }

    fn from_parts(root: PathBuf, flavor: Flavor, entries: Vec<ManifestEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (join_key(&e.domain, &e.relative_path), i))
            .collect();
        Self {
            root,
            flavor,
            entries,
            index,
        }
    }

    /// Arena-backed manifest for unit tests in sibling modules.
    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        Self::from_parts(PathBuf::new(), Flavor::Sqlite, entries)
    }

    /// Look up one logical file. Absence is recoverable: the file simply
    /// does not exist in this backup.
    pub fn resolve(&self, domain: &str, relative_path: &str) -> Result<&ManifestEntry> {
        self.index
            .get(&join_key(domain, relative_path))
            .map(|&i| &self.entries[i])
            .ok_or_else(|| ExportError::NotFound {
                domain: domain.to_string(),
                relative_path: relative_path.to_string(),
            })
    }

    /// All entries of `domain` whose relative path starts with `prefix`.
    /// Lazy over the in-memory arena; restartable.
    pub fn entries_under<'a>(
        &'a self,
        domain: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries
            .iter()
            .filter(move |e| e.domain == domain && e.relative_path.starts_with(prefix))
    }

    /// Where the blob for `entry` lives on disk.
    pub fn blob_path(&self, entry: &ManifestEntry) -> PathBuf {
        match self.flavor {
            Flavor::Sqlite => self.root.join(&entry.file_id[..2]).join(&entry.file_id),
            Flavor::Mbdb => self.root.join(&entry.file_id),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn join_key(domain: &str, relative_path: &str) -> String {
    format!("{domain}-{relative_path}")
}

// ── Manifest.db ───────────────────────────────────────────────────────────────

fn load_sqlite(path: &std::path::Path) -> Result<Vec<ManifestEntry>> {
    let corrupt = |e: rusqlite::Error| ExportError::CorruptManifest(e.to_string());
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(corrupt)?;

    let mut stmt = conn
        .prepare("SELECT fileID, domain, relativePath, flags FROM Files WHERE relativePath != ''")
        .map_err(corrupt)?;
    let mut rows = stmt.query([]).map_err(corrupt)?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next().map_err(corrupt)? {
        let file_id: String = row.get(0).map_err(corrupt)?;
        // The blob name is always 40 lowercase hex characters; anything
        // else would later be sliced into a shard prefix and panic.
        if file_id.len() != 40 || !file_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ExportError::CorruptManifest(format!(
                "fileID is not a 40-hex blob name: {file_id:?}"
            )));
        }
        let domain: String = row.get(1).map_err(corrupt)?;
        let relative_path: String = row.get(2).map_err(corrupt)?;
        let flags: i64 = row.get::<_, Option<i64>>(3).map_err(corrupt)?.unwrap_or(1);
        entries.push(ManifestEntry {
            domain,
            relative_path,
            file_id,
            kind: match flags {
                2 => EntryKind::Directory,
                4 => EntryKind::Symlink,
                _ => EntryKind::File,
            },
        });
    }
    Ok(entries)
}

// ── Manifest.mbdb ─────────────────────────────────────────────────────────────

const MBDB_MAGIC: &[u8] = b"mbdb";

/// Big-endian record walker over the legacy binary index.
struct MbdbCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MbdbCursor<'a> {
    fn uint(&mut self, width: usize) -> Result<u64> {
        let end = self.pos + width;
        if end > self.data.len() {
            return Err(ExportError::CorruptManifest(format!(
                "truncated record at offset {}",
                self.pos
            )));
        }
        let mut value = 0u64;
        for &byte in &self.data[self.pos..end] {
            value = (value << 8) | u64::from(byte);
        }
        self.pos = end;
        Ok(value)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        // 0xFFFF marks an absent value.
        if self.data[self.pos..].starts_with(&[0xFF, 0xFF]) {
            self.pos += 2;
            return Ok(&[]);
        }
        let len = self.uint(2)? as usize;
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(ExportError::CorruptManifest(format!(
                "truncated string at offset {}",
                self.pos
            )));
        }
        let value = &self.data[self.pos..end];
        self.pos = end;
        Ok(value)
    }

    fn string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn parse_mbdb(data: &[u8]) -> Result<Vec<ManifestEntry>> {
    if data.len() < 6 || &data[..4] != MBDB_MAGIC {
        return Err(ExportError::CorruptManifest(
            "missing mbdb magic header".into(),
        ));
    }
    // 4-byte magic, then a 2-byte version field.
    let mut cursor = MbdbCursor { data, pos: 6 };

    let mut entries = Vec::new();
    while !cursor.done() {
        let domain = cursor.string()?;
        let relative_path = cursor.string()?;
        let _link_target = cursor.string()?;
        let _data_hash = cursor.bytes()?;
        let _enc_key = cursor.string()?;
        let mode = cursor.uint(2)? as u16;
        let _inode = cursor.uint(8)?;
        let _user_id = cursor.uint(4)?;
        let _group_id = cursor.uint(4)?;
        let _mtime = cursor.uint(4)?;
        let _atime = cursor.uint(4)?;
        let _ctime = cursor.uint(4)?;
        let _file_len = cursor.uint(8)?;
        let _flag = cursor.uint(1)?;
        let prop_count = cursor.uint(1)? as usize;
        for _ in 0..prop_count {
            let _name = cursor.string()?;
            let _value = cursor.bytes()?;
        }
        if relative_path.is_empty() {
            continue;
        }
        let kind = match mode & 0xE000 {
            0x4000 => EntryKind::Directory,
            0xA000 => EntryKind::Symlink,
            _ => EntryKind::File,
        };
        let id = file_id(&domain, &relative_path);
        entries.push(ManifestEntry {
            domain,
            relative_path,
            file_id: id,
            kind,
        });
    }
    Ok(entries)
}
