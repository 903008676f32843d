//! Pulls normalized message records out of one chat database.
//!
//! Every conversation lives in its own `Chat_<md5(peer id)>` table, and
//! the column set differs across app versions. Rather than hardcoding
//! one schema, a priority list of known column layouts is probed against
//! `PRAGMA table_info`; the first layout fully present in the table wins.
//! A table matching no layout is skipped on its own, the rest of the
//! database still extracts.

use std::collections::HashSet;

use rusqlite::Connection;
use rusqlite::types::ValueRef;

use crate::contacts::ContactIndex;
use crate::error::{ExportError, Result};
use crate::resolver::ChatDb;

pub const CHAT_TABLE_PREFIX: &str = "Chat_";

/// Message direction, from the `Des` column (0 = sent, 1 = received).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

/// Normalized message class for the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    System,
    /// Non-text payload, or text that failed to decode.
    UnknownBinary,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::UnknownBinary => "unknown-binary",
        }
    }
}

/// Outcome of decoding one stored payload. `Degraded` keeps the payload
/// size and type code so callers can count and label the loss instead of
/// inventing content.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Text(String),
    Degraded { byte_len: usize, type_code: i64 },
}

/// Identity of a message across possibly-overlapping source databases.
pub type DedupKey = (String, String, i64, i64);

/// One extracted message, immutable from here to the writer.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub source_account: String,
    /// Hash suffix of the conversation table.
    pub contact_id: String,
    /// Human label resolved from the contact database, when available.
    pub contact_label: Option<String>,
    pub direction: Direction,
    pub timestamp_utc: i64,
    pub kind: MessageKind,
    pub content: String,
    pub row_id: i64,
}

impl MessageRecord {
    pub fn dedup_key(&self) -> DedupKey {
        (
            self.source_account.clone(),
            self.contact_id.clone(),
            self.timestamp_utc,
            self.row_id,
        )
    }
}

/// One known per-version column layout for conversation tables.
struct ColumnSet {
    timestamp: &'static str,
    direction: &'static str,
    content: &'static str,
    kind: Option<&'static str>,
    row_id: Option<&'static str>,
}

/// Probed in order; required columns are timestamp, direction and
/// content. Later entries degrade gracefully for older app versions.
const KNOWN_COLUMN_SETS: &[ColumnSet] = &[
    ColumnSet {
        timestamp: "CreateTime",
        direction: "Des",
        content: "Message",
        kind: Some("Type"),
        row_id: Some("MesLocalID"),
    },
    // Early builds lack the local message id; the sqlite rowid is the
    // next most stable identifier.
    ColumnSet {
        timestamp: "CreateTime",
        direction: "Des",
        content: "Message",
        kind: Some("Type"),
        row_id: None,
    },
    // Minimal layout without a type column: classify by decodability.
    ColumnSet {
        timestamp: "CreateTime",
        direction: "Des",
        content: "Message",
        kind: None,
        row_id: None,
    },
];

/// All conversation tables in the database, in name order.
pub fn conversation_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name LIKE 'Chat\\_%' ESCAPE '\\' \
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    let mut columns = HashSet::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        columns.insert(name.to_ascii_lowercase());
    }
    Ok(columns)
}

fn select_mapping(columns: &HashSet<String>) -> Option<&'static ColumnSet> {
    KNOWN_COLUMN_SETS.iter().find(|set| {
        [
            Some(set.timestamp),
            Some(set.direction),
            Some(set.content),
            set.kind,
            set.row_id,
        ]
        .into_iter()
        .flatten()
        .all(|column| columns.contains(&column.to_ascii_lowercase()))
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const TYPE_TEXT: i64 = 1;
const TYPE_SYSTEM: i64 = 10000;
const TYPE_RECALLED: i64 = 10002;

/// Best-effort decode of one stored payload. Never errors: anything that
/// is not valid UTF-8 text, or whose type code marks a non-text payload,
/// degrades to an explicit placeholder.
pub fn decode_content(type_code: Option<i64>, raw: &[u8]) -> (MessageKind, Decoded) {
    let code = type_code.unwrap_or(TYPE_TEXT);
    let textual = matches!(code, TYPE_TEXT | TYPE_SYSTEM | TYPE_RECALLED);
    if textual && let Ok(text) = std::str::from_utf8(raw) {
        let kind = if code == TYPE_TEXT {
            MessageKind::Text
        } else {
            MessageKind::System
        };
        return (kind, Decoded::Text(text.trim().to_string()));
    }
    (
        MessageKind::UnknownBinary,
        Decoded::Degraded {
            byte_len: raw.len(),
            type_code: code,
        },
    )
}

fn placeholder(byte_len: usize, type_code: i64) -> String {
    format!("<non-text payload: type {type_code}, {byte_len} bytes>")
}

/// Group-chat bodies carry a `"{sender id}:\n"` prefix. When the sender
/// resolves in the contact index, the raw id is replaced with the label;
/// an unresolved prefix is left alone so ordinary multi-line messages
/// are never mangled.
fn resolve_sender_prefix(text: &str, contacts: Option<&ContactIndex>) -> Option<String> {
    let index = contacts?;
    let (sender, body) = text.split_once(":\n")?;
    let label = index.label_for_peer(sender.trim())?;
    Some(format!("{label}: {body}"))
}

/// What one conversation table yielded.
#[derive(Debug)]
pub struct TableExtraction {
    pub records: Vec<MessageRecord>,
    pub degraded: usize,
}

/// Extract one conversation table, ordered by timestamp ascending with
/// the row id breaking ties.
pub fn extract_table(
    db: &ChatDb,
    table: &str,
    contacts: Option<&ContactIndex>,
) -> Result<TableExtraction> {
    let columns = table_columns(&db.conn, table)?;
    let Some(mapping) = select_mapping(&columns) else {
        return Err(ExportError::SchemaMismatch {
            table: table.to_string(),
        });
    };

    let contact_id = table[CHAT_TABLE_PREFIX.len()..].to_string();
    let contact_label = contacts
        .and_then(|index| index.label(&contact_id))
        .map(str::to_string);

    let row_id_column = mapping.row_id.unwrap_or("rowid");
    let kind_column = mapping.kind.unwrap_or("NULL");
    let sql = format!(
        "SELECT {ts}, {des}, {msg}, {kind}, {rid} FROM {table} ORDER BY {ts} ASC, {rid} ASC",
        ts = mapping.timestamp,
        des = mapping.direction,
        msg = mapping.content,
        kind = kind_column,
        rid = row_id_column,
        table = quote_ident(table),
    );

    let mut stmt = db.conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;

    let mut records = Vec::new();
    let mut degraded = 0usize;
    while let Some(row) = rows.next()? {
        let timestamp_utc = row.get::<_, Option<i64>>(0)?.unwrap_or(0);
        let des = row.get::<_, Option<i64>>(1)?.unwrap_or(0);
        let raw = match row.get_ref(2)? {
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes.to_vec(),
            ValueRef::Null => Vec::new(),
            ValueRef::Integer(n) => n.to_string().into_bytes(),
            ValueRef::Real(f) => f.to_string().into_bytes(),
        };
        let type_code = row.get::<_, Option<i64>>(3)?;
        let row_id = row.get::<_, Option<i64>>(4)?.unwrap_or(0);

        let (kind, decoded) = decode_content(type_code, &raw);
        let content = match decoded {
            Decoded::Text(text) => {
                resolve_sender_prefix(&text, contacts).unwrap_or(text)
            }
            Decoded::Degraded {
                byte_len,
                type_code,
            } => {
                degraded += 1;
                placeholder(byte_len, type_code)
            }
        };

        records.push(MessageRecord {
            source_account: db.account_id.clone(),
            contact_id: contact_id.clone(),
            contact_label: contact_label.clone(),
            direction: if des == 0 {
                Direction::Sent
            } else {
                Direction::Received
            },
            timestamp_utc,
            kind,
            content,
            row_id,
        });
    }

    Ok(TableExtraction { records, degraded })
}

/// What one whole database yielded. Skipped tables are those that
/// matched no known column layout.
#[derive(Default)]
pub struct DbExtraction {
    pub records: Vec<MessageRecord>,
    pub degraded: usize,
    pub tables_skipped: Vec<String>,
}

/// Extract every conversation table in the database. Forward-only: the
/// handle is read once.
pub fn extract_db(db: &ChatDb, contacts: Option<&ContactIndex>) -> Result<DbExtraction> {
    let mut out = DbExtraction::default();
    for table in conversation_tables(&db.conn)? {
        match extract_table(db, &table, contacts) {
            Ok(extraction) => {
                out.records.extend(extraction.records);
                out.degraded += extraction.degraded;
            }
            Err(e) if e.is_recoverable() => out.tables_skipped.push(table),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn chat_db(conn: Connection) -> ChatDb {
        ChatDb {
            account_id: "aaaa".to_string(),
            logical_path: "Documents/aaaa/DB/MM.sqlite".to_string(),
            conn,
        }
    }

    fn full_schema_db(table: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE {table} (
                MesLocalID INTEGER PRIMARY KEY,
                MesSvrID INTEGER,
                CreateTime INTEGER,
                Message TEXT,
                Status INTEGER,
                ImgStatus INTEGER,
                Type INTEGER,
                Des INTEGER
            )"
        ))
        .unwrap();
        conn
    }

    #[test]
    fn chat_tables_are_enumerated_and_others_ignored() {
        let conn = full_schema_db("Chat_beef");
        conn.execute_batch(
            "CREATE TABLE Chat_0a0a (CreateTime INTEGER, Message TEXT, Des INTEGER);
             CREATE TABLE ChatExt2_beef (x INTEGER);
             CREATE TABLE Friend (userName TEXT);",
        )
        .unwrap();
        let tables = conversation_tables(&conn).unwrap();
        assert_eq!(tables, vec!["Chat_0a0a".to_string(), "Chat_beef".to_string()]);
    }

    #[test]
    fn mapping_prefers_richest_layout() {
        let conn = full_schema_db("Chat_beef");
        let columns = table_columns(&conn, "Chat_beef").unwrap();
        let mapping = select_mapping(&columns).unwrap();
        assert_eq!(mapping.row_id, Some("MesLocalID"));
        assert_eq!(mapping.kind, Some("Type"));
    }

    #[test]
    fn minimal_layout_still_maps() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE Chat_beef (CreateTime INTEGER, Message TEXT, Des INTEGER)")
            .unwrap();
        let columns = table_columns(&conn, "Chat_beef").unwrap();
        let mapping = select_mapping(&columns).unwrap();
        assert_eq!(mapping.kind, None);
        assert_eq!(mapping.row_id, None);
    }

    #[test]
    fn unmappable_table_is_schema_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE Chat_beef (Payload BLOB, Stamp INTEGER)")
            .unwrap();
        let db = chat_db(conn);
        let err = extract_table(&db, "Chat_beef", None).unwrap_err();
        assert!(matches!(err, ExportError::SchemaMismatch { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn mismatched_table_skips_but_database_continues() {
        let conn = full_schema_db("Chat_good");
        conn.execute_batch("CREATE TABLE Chat_bad (Payload BLOB)").unwrap();
        conn.execute(
            "INSERT INTO Chat_good (MesLocalID, CreateTime, Message, Type, Des) VALUES (1, 100, 'hi', 1, 0)",
            [],
        )
        .unwrap();
        let db = chat_db(conn);
        let out = extract_db(&db, None).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.tables_skipped, vec!["Chat_bad".to_string()]);
    }

    #[test]
    fn rows_come_back_in_timestamp_order_with_row_id_tiebreak() {
        let conn = full_schema_db("Chat_beef");
        for (id, ts, msg) in [(3, 200, "c"), (1, 100, "a"), (2, 100, "b")] {
            conn.execute(
                "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (?1, ?2, ?3, 1, 0)",
                params![id, ts, msg],
            )
            .unwrap();
        }
        let db = chat_db(conn);
        let out = extract_table(&db, "Chat_beef", None).unwrap();
        let order: Vec<_> = out.records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(out.records.windows(2).all(|w| {
            (w[0].timestamp_utc, w[0].row_id) <= (w[1].timestamp_utc, w[1].row_id)
        }));
    }

    #[test]
    fn direction_and_kind_decode() {
        let conn = full_schema_db("Chat_beef");
        conn.execute(
            "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (1, 100, 'hello', 1, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (2, 200, 'joined the group', 10000, 1)",
            [],
        )
        .unwrap();
        let db = chat_db(conn);
        let out = extract_table(&db, "Chat_beef", None).unwrap();
        assert_eq!(out.records[0].direction, Direction::Sent);
        assert_eq!(out.records[0].kind, MessageKind::Text);
        assert_eq!(out.records[1].direction, Direction::Received);
        assert_eq!(out.records[1].kind, MessageKind::System);
        assert_eq!(out.degraded, 0);
    }

    #[test]
    fn binary_payload_degrades_to_placeholder() {
        let conn = full_schema_db("Chat_beef");
        conn.execute(
            "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (1, 100, ?1, 3, 1)",
            params![&[0xFFu8, 0xD8, 0x00, 0x42][..]],
        )
        .unwrap();
        let db = chat_db(conn);
        let out = extract_table(&db, "Chat_beef", None).unwrap();
        assert_eq!(out.degraded, 1);
        assert_eq!(out.records[0].kind, MessageKind::UnknownBinary);
        assert_eq!(out.records[0].content, "<non-text payload: type 3, 4 bytes>");
    }

    #[test]
    fn invalid_utf8_in_text_message_degrades() {
        let (kind, decoded) = decode_content(Some(TYPE_TEXT), &[0xC3, 0x28]);
        assert_eq!(kind, MessageKind::UnknownBinary);
        assert_eq!(
            decoded,
            Decoded::Degraded {
                byte_len: 2,
                type_code: 1
            }
        );
    }

    #[test]
    fn missing_type_column_classifies_by_decodability() {
        let (kind, decoded) = decode_content(None, "plain".as_bytes());
        assert_eq!(kind, MessageKind::Text);
        assert_eq!(decoded, Decoded::Text("plain".to_string()));
    }

    #[test]
    fn contact_label_is_attached() {
        use crate::contacts::ContactIndex;
        let contact_conn = Connection::open_in_memory().unwrap();
        contact_conn
            .execute_batch("CREATE TABLE Friend (userName TEXT, dbContactRemark BLOB)")
            .unwrap();
        contact_conn
            .execute(
                "INSERT INTO Friend VALUES ('alice_wechat_id', ?1)",
                params![&[0x0au8, 5, b'A', b'l', b'i', b'c', b'e'][..]],
            )
            .unwrap();
        let index = ContactIndex::load(&contact_conn).unwrap();

        // Table named by md5("alice_wechat_id").
        let table = "Chat_d3e83366f0b17d59439439b823a087e3";
        let conn = full_schema_db(table);
        conn.execute(
            &format!("INSERT INTO {table} (MesLocalID, CreateTime, Message, Type, Des) VALUES (1, 100, 'hi', 1, 0)"),
            [],
        )
        .unwrap();
        let db = chat_db(conn);
        let out = extract_table(&db, table, Some(&index)).unwrap();
        assert_eq!(out.records[0].contact_label.as_deref(), Some("Alice"));
        assert_eq!(
            out.records[0].contact_id,
            "d3e83366f0b17d59439439b823a087e3"
        );
    }

    #[test]
    fn group_sender_prefix_resolves_to_contact_label() {
        use crate::contacts::ContactIndex;
        let contact_conn = Connection::open_in_memory().unwrap();
        contact_conn
            .execute_batch("CREATE TABLE Friend (userName TEXT, dbContactRemark BLOB)")
            .unwrap();
        contact_conn
            .execute(
                "INSERT INTO Friend VALUES ('alice_wechat_id', ?1)",
                params![&[0x0au8, 5, b'A', b'l', b'i', b'c', b'e'][..]],
            )
            .unwrap();
        let index = ContactIndex::load(&contact_conn).unwrap();

        let conn = full_schema_db("Chat_beef");
        conn.execute(
            "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (1, 100, 'alice_wechat_id:\nmorning all', 1, 1)",
            [],
        )
        .unwrap();
        // A member outside the contact database stays as the raw id.
        conn.execute(
            "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (2, 200, 'wxid_stranger:\nwho dis', 1, 1)",
            [],
        )
        .unwrap();
        let db = chat_db(conn);
        let out = extract_table(&db, "Chat_beef", Some(&index)).unwrap();
        assert_eq!(out.records[0].content, "Alice: morning all");
        assert_eq!(out.records[1].content, "wxid_stranger:\nwho dis");
    }

    #[test]
    fn multiline_message_without_contacts_is_untouched() {
        let conn = full_schema_db("Chat_beef");
        conn.execute(
            "INSERT INTO Chat_beef (MesLocalID, CreateTime, Message, Type, Des) VALUES (1, 100, 'note:\nbuy milk', 1, 0)",
            [],
        )
        .unwrap();
        let db = chat_db(conn);
        let out = extract_table(&db, "Chat_beef", None).unwrap();
        assert_eq!(out.records[0].content, "note:\nbuy milk");
    }
}
