//! Turns an account's logical chat-database paths into open handles.
//!
//! Each open failure is recorded and skipped; whether an empty result is
//! fatal is decided by the pipeline, which only aborts when nothing
//! resolved across every account.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::accounts::{APP_DOMAIN, Account};
use crate::error::{ExportError, Result};
use crate::manifest::Manifest;

/// An open read-only handle to one resolved chat database, tagged with
/// the owning account. Exclusively owned by its extractor while in use.
pub struct ChatDb {
    pub account_id: String,
    pub logical_path: String,
    pub conn: Connection,
}

/// A database that could not be resolved or opened.
#[derive(Debug)]
pub struct ResolveFailure {
    pub account_id: String,
    pub logical_path: String,
    pub reason: String,
}

fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

/// Resolve every chat database recorded on the account, returning the
/// successes and the failures side by side.
pub fn resolve_chat_dbs(manifest: &Manifest, account: &Account) -> (Vec<ChatDb>, Vec<ResolveFailure>) {
    let mut handles = Vec::new();
    let mut failures = Vec::new();
    for logical in &account.chat_db_paths {
        match resolve_one(manifest, account, logical) {
            Ok(db) => handles.push(db),
            Err(e) => failures.push(ResolveFailure {
                account_id: account.account_id.clone(),
                logical_path: logical.clone(),
                reason: e.to_string(),
            }),
        }
    }
    (handles, failures)
}

fn resolve_one(manifest: &Manifest, account: &Account, logical: &str) -> Result<ChatDb> {
    let entry = manifest.resolve(APP_DOMAIN, logical)?;
    let blob = manifest.blob_path(entry);
    if !blob.is_file() {
        // Listed in the manifest but the blob itself is gone.
        return Err(ExportError::NotFound {
            domain: APP_DOMAIN.to_string(),
            relative_path: logical.to_string(),
        });
    }
    let conn = open_read_only(&blob)?;
    // Probe now so a malformed blob fails here, not mid-extraction.
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(ChatDb {
        account_id: account.account_id.clone(),
        logical_path: logical.to_string(),
        conn,
    })
}

/// Best-effort open of the account's contact database. Absence or
/// unreadability just means the export falls back to raw contact hashes.
pub fn resolve_contact_db(manifest: &Manifest, account: &Account) -> Option<Connection> {
    let logical = account.contact_db_path.as_deref()?;
    let entry = manifest.resolve(APP_DOMAIN, logical).ok()?;
    let blob = manifest.blob_path(entry);
    if !blob.is_file() {
        return None;
    }
    open_read_only(&blob).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EntryKind, ManifestEntry, file_id};
    use std::fs;

    fn entry(path: &str) -> ManifestEntry {
        ManifestEntry {
            domain: APP_DOMAIN.to_string(),
            relative_path: path.to_string(),
            file_id: file_id(APP_DOMAIN, path),
            kind: EntryKind::File,
        }
    }

    fn account(paths: &[&str]) -> Account {
        Account {
            account_id: "aaaa".to_string(),
            chat_db_paths: paths.iter().map(|p| p.to_string()).collect(),
            contact_db_path: None,
        }
    }

    // Manifest::from_entries has no backing root directory, so every blob
    // path points at a nonexistent file.
    #[test]
    fn missing_blob_is_recorded_not_fatal() {
        let manifest = Manifest::from_entries(vec![entry("Documents/aaaa/DB/MM.sqlite")]);
        let account = account(&["Documents/aaaa/DB/MM.sqlite"]);
        let (handles, failures) = resolve_chat_dbs(&manifest, &account);
        assert!(handles.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].logical_path, "Documents/aaaa/DB/MM.sqlite");
    }

    #[test]
    fn unlisted_path_is_recorded_not_fatal() {
        let manifest = Manifest::from_entries(vec![]);
        let account = account(&["Documents/aaaa/DB/MM.sqlite"]);
        let (handles, failures) = resolve_chat_dbs(&manifest, &account);
        assert!(handles.is_empty());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].reason.contains("not present in backup"));
    }

    #[test]
    fn garbage_blob_fails_the_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let logical = "Documents/aaaa/DB/MM.sqlite";
        let fid = file_id(APP_DOMAIN, logical);
        fs::create_dir_all(tmp.path().join(&fid[..2])).unwrap();
        fs::write(tmp.path().join(&fid[..2]).join(&fid), b"not a sqlite file").unwrap();

        // Build a real sqlite-flavored manifest rooted at the tempdir.
        let conn = Connection::open(tmp.path().join("Manifest.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE Files (fileID TEXT, domain TEXT, relativePath TEXT, flags INTEGER)",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Files VALUES (?1, ?2, ?3, 1)",
            rusqlite::params![fid, APP_DOMAIN, logical],
        )
        .unwrap();
        drop(conn);

        let root = crate::locator::BackupRoot::open(tmp.path()).unwrap();
        let manifest = Manifest::open(&root).unwrap();
        let (handles, failures) = resolve_chat_dbs(&manifest, &account(&[logical]));
        assert!(handles.is_empty());
        assert_eq!(failures.len(), 1);
    }
}
