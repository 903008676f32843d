//! Contact labels from an account's `WCDB_Contact.sqlite`.
//!
//! Conversation tables are named `Chat_<md5(peer id)>`, so without this
//! index the export can only show the hash. The `Friend` table maps each
//! peer id to a remark blob using a tag/length encoding: one tag byte,
//! one length byte, then the value. Only a few tags matter here; the rest
//! are skipped with the same framing.

use std::collections::HashMap;

use md5::{Digest, Md5};
use rusqlite::Connection;

use crate::error::Result;

const TAG_NICKNAME: u8 = 0x0a;
const TAG_ALIAS: u8 = 0x12;
const TAG_DISPLAY_NAME: u8 = 0x1a;

/// Maps `md5(peer id)` (the suffix of a conversation table name) to the
/// best human-readable label available for that peer.
#[derive(Debug, Default)]
pub struct ContactIndex {
    labels: HashMap<String, String>,
}

impl ContactIndex {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare("SELECT userName, dbContactRemark FROM Friend")?;
        let mut rows = stmt.query([])?;

        let mut labels = HashMap::new();
        while let Some(row) = rows.next()? {
            let peer_id: String = row.get(0)?;
            let remark: Option<Vec<u8>> = row.get(1)?;
            let key = hex::encode(Md5::digest(peer_id.as_bytes()));
            let parsed = remark.as_deref().map(parse_remark).unwrap_or_default();
            // Preference order mirrors what the app shows: the name the
            // user assigned, then the peer's own nickname, then alias id.
            let label = [parsed.display_name, parsed.nickname, parsed.alias]
                .into_iter()
                .flatten()
                .find(|s| !s.trim().is_empty())
                .unwrap_or(peer_id);
            labels.insert(key, label);
        }
        Ok(Self { labels })
    }

    pub fn label(&self, contact_hash: &str) -> Option<&str> {
        self.labels.get(contact_hash).map(String::as_str)
    }

    /// Look up by the raw peer id, as it appears in group-chat sender
    /// prefixes.
    pub fn label_for_peer(&self, peer_id: &str) -> Option<&str> {
        self.label(&hex::encode(Md5::digest(peer_id.as_bytes())))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Default, PartialEq)]
struct Remark {
    nickname: Option<String>,
    alias: Option<String>,
    display_name: Option<String>,
}

fn parse_remark(buf: &[u8]) -> Remark {
    let mut remark = Remark::default();
    let mut pos = 0;
    while pos < buf.len() {
        let tag = buf[pos];
        let (value, next) = read_value(buf, pos + 1);
        match tag {
            TAG_NICKNAME => remark.nickname = Some(value),
            TAG_ALIAS => remark.alias = Some(value),
            TAG_DISPLAY_NAME => remark.display_name = Some(value),
            _ => {}
        }
        pos = next;
    }
    remark
}

/// Read one length-prefixed value starting at the length byte.
/// Truncated values are clamped to the buffer, not rejected.
fn read_value(buf: &[u8], start: usize) -> (String, usize) {
    if start >= buf.len() {
        return (String::new(), start + 1);
    }
    let len = buf[start] as usize;
    let begin = start + 1;
    let end = (begin + len).min(buf.len());
    (
        String::from_utf8_lossy(&buf[begin..end]).into_owned(),
        begin + len,
    )
}
