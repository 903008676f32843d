//! Serializes the merged record stream to the destination file.
//!
//! One CSV row per message, fixed column order
//! `account, contact, direction, timestamp, type, content`, RFC 4180
//! quoting. The byte order mark and compression options compose: the
//! marker always goes inside the compressed stream, before the header.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{ExportError, Result};
use crate::extractor::MessageRecord;

pub const CSV_HEADER: [&str; 6] = [
    "account",
    "contact",
    "direction",
    "timestamp",
    "type",
    "content",
];

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Owned by the caller, consumed by the writer.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub destination: PathBuf,
    pub compress: bool,
    pub byte_order_mark: bool,
}

/// Stream records into the destination, consuming the sequence
/// incrementally. Returns the number of rows written (header excluded).
/// Any destination failure is fatal for the run.
pub fn write_records<I>(records: I, options: &ExportOptions) -> Result<u64>
where
    I: IntoIterator<Item = MessageRecord>,
{
    let file = File::create(&options.destination)?;
    if options.compress {
        // Level 0 selects zstd's default.
        let encoder = zstd::stream::Encoder::new(file, 0)?;
        let (written, encoder) = stream(records, encoder, options.byte_order_mark)?;
        encoder.finish()?;
        Ok(written)
    } else {
        let (written, mut out) = stream(records, BufWriter::new(file), options.byte_order_mark)?;
        out.flush()?;
        Ok(written)
    }
}

fn stream<W, I>(records: I, mut sink: W, byte_order_mark: bool) -> Result<(u64, W)>
where
    W: Write,
    I: IntoIterator<Item = MessageRecord>,
{
    if byte_order_mark {
        sink.write_all(&UTF8_BOM)?;
    }
    let mut csv = csv::Writer::from_writer(sink);
    csv.write_record(CSV_HEADER)?;

    let mut written = 0u64;
    for record in records {
        csv.write_record(&row(&record))?;
        written += 1;
    }
    csv.flush()?;
    let sink = csv
        .into_inner()
        .map_err(|e| ExportError::Io(std::io::Error::other(e.to_string())))?;
    Ok((written, sink))
}

fn row(record: &MessageRecord) -> [String; 6] {
    [
        record.source_account.clone(),
        record
            .contact_label
            .clone()
            .unwrap_or_else(|| record.contact_id.clone()),
        record.direction.as_str().to_string(),
        format_timestamp(record.timestamp_utc),
        record.kind.as_str().to_string(),
        record.content.clone(),
    ]
}

/// Epoch seconds rendered as UTC with second precision. UTC keeps the
/// output identical across machines; out-of-range values fall back to
/// the raw number.
pub fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}
