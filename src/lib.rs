//! # wechat-backup-export
//!
//! A CLI tool that exports WeChat chat history out of a local
//! iTunes/Finder device backup into CSV files.
//!
//! ## What it does
//!
//! Device backups don't store files under their device paths. Everything
//! sits in a flat blob store named by `SHA1("{domain}-{relativePath}")`,
//! with the mapping recorded in a manifest index (`Manifest.db`, or
//! `Manifest.mbdb` for old backups). This tool locates the most recent
//! backup, resolves the WeChat chat databases hidden in the blob store,
//! extracts every conversation table it can recognize, and writes one
//! chronological CSV transcript per run.
//!
//! Backups and databases are opened **read-only**; nothing is modified.
//!
//! ## Usage
//!
//! ```sh
//! # Export from the most recent backup into ./wechat-export
//! wechat-backup-export
//!
//! # Explicit backup directory, compressed output with a BOM for Excel
//! wechat-backup-export ~/exports --backup /path/to/backup --compress --bom
//! ```
//!
//! Preferences can be persisted in `~/.config/wechat-backup-export/config.toml`.
//!
//! ## Compatibility
//!
//! Conversation tables vary by app version; a priority list of known
//! column layouts is probed per table, and tables matching none are
//! skipped and counted rather than failing the run. Backups protected
//! with a passphrase are not supported.

pub mod accounts;
pub mod contacts;
pub mod error;
pub mod extractor;
pub mod locator;
pub mod manifest;
pub mod pipeline;
pub mod resolver;
pub mod writer;

pub use error::ExportError;
pub use pipeline::{
    ExportConfig, ExportSummary, OverlapPolicy, run_export, run_export_with_cancel,
};
