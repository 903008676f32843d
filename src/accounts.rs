//! Finds WeChat accounts inside the backup.
//!
//! Each login account gets a `Documents/<hash>/` folder in the app
//! sandbox, named by a hash of the account id rather than anything
//! human-readable. A folder counts as an account only when it holds at
//! least one chat database; everything else under `Documents/` is cache
//! and plugin debris.

use std::collections::BTreeMap;

use crate::manifest::{EntryKind, Manifest};

pub const APP_DOMAIN: &str = "AppDomain-com.tencent.xin";
const DOCUMENTS_PREFIX: &str = "Documents/";

const CHAT_DB_PRIMARY: &str = "MM.sqlite";
const CONTACT_DB: &str = "WCDB_Contact.sqlite";

/// One account folder and the chat databases recorded for it.
/// `chat_db_paths` keeps the primary database first, then the numbered
/// overflow databases in ascending order.
#[derive(Debug, Clone)]
pub struct Account {
    /// The folder hash. Stable per account, not human-meaningful.
    pub account_id: String,
    pub chat_db_paths: Vec<String>,
    pub contact_db_path: Option<String>,
}

#[derive(Default)]
struct FolderScan {
    primary: Option<String>,
    overflow: BTreeMap<u32, String>,
    contacts: Option<String>,
}

/// Enumerate account folders in the app domain.
///
/// Folders without any chat database are silently skipped. The result is
/// ordered lexically by folder hash so repeated runs over the same backup
/// enumerate accounts identically.
pub fn discover_accounts(manifest: &Manifest) -> Vec<Account> {
    let mut folders: BTreeMap<String, FolderScan> = BTreeMap::new();

    for entry in manifest.entries_under(APP_DOMAIN, DOCUMENTS_PREFIX) {
        if entry.kind != EntryKind::File {
            continue;
        }
        let rel = &entry.relative_path[DOCUMENTS_PREFIX.len()..];
        let Some((folder, rest)) = rel.split_once('/') else {
            continue; // a file directly under Documents/, not an account
        };
        let file_name = rest.rsplit('/').next().unwrap_or(rest);
        let scan = folders.entry(folder.to_string()).or_default();
        if file_name == CHAT_DB_PRIMARY {
            scan.primary = Some(entry.relative_path.clone());
        } else if file_name == CONTACT_DB {
            scan.contacts = Some(entry.relative_path.clone());
        } else if let Some(n) = overflow_db_index(file_name) {
            scan.overflow.insert(n, entry.relative_path.clone());
        }
    }

    folders
        .into_iter()
        .filter_map(|(folder, scan)| {
            let mut chat_db_paths = Vec::with_capacity(1 + scan.overflow.len());
            chat_db_paths.extend(scan.primary);
            chat_db_paths.extend(scan.overflow.into_values());
            if chat_db_paths.is_empty() {
                return None;
            }
            Some(Account {
                account_id: folder,
                chat_db_paths,
                contact_db_path: scan.contacts,
            })
        })
        .collect()
}

/// `message_7.sqlite` → `Some(7)`.
fn overflow_db_index(file_name: &str) -> Option<u32> {
    let n = file_name
        .strip_prefix("message_")?
        .strip_suffix(".sqlite")?;
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    n.parse().ok()
}
