//! Error types for the export pipeline.
//!
//! Errors are classified by scope. A missing manifest entry or a
//! conversation table with an unrecognized column layout only affects one
//! unit of work and is converted into a skip at the place it occurred; a
//! corrupt manifest or an unwritable destination ends the whole run.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug, Error)]
pub enum ExportError {
    /// No subdirectory of the backup store contains a readable manifest.
    #[error("no device backup found under {0}")]
    NoBackupFound(PathBuf),

    /// An explicitly given backup directory has no readable manifest.
    #[error("not a usable device backup (no readable manifest): {0}")]
    InvalidBackup(PathBuf),

    /// The manifest index itself is unreadable or malformed.
    #[error("corrupt backup manifest: {0}")]
    CorruptManifest(String),

    /// A single logical file is absent from the manifest.
    #[error("not present in backup: {domain}-{relative_path}")]
    NotFound {
        domain: String,
        relative_path: String,
    },

    /// A conversation table satisfies none of the known column layouts.
    #[error("table {table} has no usable column mapping")]
    SchemaMismatch { table: String },

    /// Every account's chat databases failed to resolve or open.
    #[error("no chat database could be opened in this backup")]
    NoChatDatabases,

    #[error("failed to serialize export output: {0}")]
    Csv(#[from] csv::Error),

    #[error("destination i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl ExportError {
    /// Whether the caller should skip the affected unit and continue.
    /// Everything else propagates to the top and aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::SchemaMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classes() {
        let not_found = ExportError::NotFound {
            domain: "AppDomain-com.tencent.xin".into(),
            relative_path: "Documents/x/DB/MM.sqlite".into(),
        };
        assert!(not_found.is_recoverable());
        assert!(
            ExportError::SchemaMismatch {
                table: "Chat_ff".into()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn fatal_classes() {
        assert!(!ExportError::CorruptManifest("truncated".into()).is_recoverable());
        assert!(!ExportError::InvalidBackup(PathBuf::from("/tmp/nope")).is_recoverable());
        assert!(!ExportError::NoChatDatabases.is_recoverable());
    }
}
