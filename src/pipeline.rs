//! The end-to-end export run.
//!
//! Locates the backup, loads the manifest, discovers accounts, fans the
//! accounts out over a bounded worker pool, then merges the per-account
//! record batches on one thread: dedup in encounter order, a final sort
//! by (account, contact, timestamp, row id), and a single streaming
//! write. The merge re-sort makes the output deterministic regardless of
//! worker scheduling.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, bounded, unbounded};

use crate::accounts::{self, Account};
use crate::contacts::ContactIndex;
use crate::error::{ExportError, Result};
use crate::extractor::{self, DedupKey, MessageRecord};
use crate::locator;
use crate::manifest::Manifest;
use crate::resolver;
use crate::writer::{self, ExportOptions};

/// How to resolve two copies of the same message when an account's
/// databases overlap (a backup can hold both an old and a migrated copy
/// of one conversation, with slightly drifted field values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// The first resolved database wins; `MM.sqlite` precedes the
    /// numbered overflow databases.
    #[default]
    KeepFirst,
    /// Later databases overwrite earlier copies.
    KeepLast,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Backup directory override; auto-detected when absent.
    pub backup_root: Option<PathBuf>,
    /// Full path of the output file.
    pub destination: PathBuf,
    pub compress: bool,
    pub byte_order_mark: bool,
    pub overlap: OverlapPolicy,
    /// Worker count override; defaults to available parallelism.
    pub workers: Option<usize>,
    pub verbose: bool,
    pub quiet: bool,
}

/// What the run did, reported even on partial failure. Nothing is
/// dropped without showing up in a count here.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub accounts_processed: usize,
    pub messages_written: u64,
    pub duplicates_dropped: usize,
    pub degraded_messages: usize,
    pub tables_skipped: usize,
    pub databases_skipped: usize,
    pub cancelled: bool,
}

impl std::fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} account(s), {} message(s) written",
            self.accounts_processed, self.messages_written
        )?;
        if self.duplicates_dropped > 0 {
            write!(f, ", {} duplicate(s) dropped", self.duplicates_dropped)?;
        }
        if self.degraded_messages > 0 {
            write!(f, ", {} non-text payload(s)", self.degraded_messages)?;
        }
        if self.tables_skipped > 0 {
            write!(f, ", {} table(s) skipped", self.tables_skipped)?;
        }
        if self.databases_skipped > 0 {
            write!(f, ", {} database(s) skipped", self.databases_skipped)?;
        }
        if self.cancelled {
            write!(f, " (cancelled, partial output kept)")?;
        }
        Ok(())
    }
}

struct AccountOutput {
    records: Vec<MessageRecord>,
    degraded: usize,
    tables_skipped: usize,
    resolved_dbs: usize,
    failed_dbs: usize,
}

/// The pipeline's only public entry point.
pub fn run_export(config: &ExportConfig) -> Result<ExportSummary> {
    let cancel = AtomicBool::new(false);
    run_export_with_cancel(config, &cancel)
}

/// Like [`run_export`], but aborts remaining work promptly once `cancel`
/// is set. Partially written output is left in place and the summary is
/// marked as cancelled.
pub fn run_export_with_cancel(
    config: &ExportConfig,
    cancel: &AtomicBool,
) -> Result<ExportSummary> {
    let root = locator::locate(config.backup_root.as_deref())?;
    if config.verbose {
        eprintln!("Reading backup: {}", root.path().display());
    }
    let manifest = Manifest::open(&root)?;
    let accounts = accounts::discover_accounts(&manifest);
    if config.verbose {
        eprintln!(
            "Manifest: {} entries, {} account(s)",
            manifest.len(),
            accounts.len()
        );
    }

    let outputs = fan_out(&manifest, accounts, config, cancel);

    let mut summary = ExportSummary {
        accounts_processed: outputs.len(),
        cancelled: cancel.load(Ordering::Relaxed),
        ..Default::default()
    };
    let mut resolved_total = 0usize;
    for output in &outputs {
        summary.degraded_messages += output.degraded;
        summary.tables_skipped += output.tables_skipped;
        summary.databases_skipped += output.failed_dbs;
        resolved_total += output.resolved_dbs;
    }
    if resolved_total == 0 && !summary.cancelled {
        return Err(ExportError::NoChatDatabases);
    }

    let records = merge(outputs, config.overlap, &mut summary.duplicates_dropped);

    let options = ExportOptions {
        destination: config.destination.clone(),
        compress: config.compress,
        byte_order_mark: config.byte_order_mark,
    };
    summary.messages_written = writer::write_records(records, &options)?;
    Ok(summary)
}

fn fan_out(
    manifest: &Manifest,
    accounts: Vec<Account>,
    config: &ExportConfig,
    cancel: &AtomicBool,
) -> Vec<AccountOutput> {
    let n_workers = config
        .workers
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8)
        })
        .clamp(1, accounts.len().max(1));

    let (tx_jobs, rx_jobs) = bounded::<Account>(accounts.len().max(1));
    let (tx_out, rx_out) = unbounded::<AccountOutput>();

    std::thread::scope(|s| {
        for _ in 0..n_workers {
            let rx_jobs = rx_jobs.clone();
            let tx_out = tx_out.clone();
            s.spawn(move || {
                while let Ok(account) = rx_jobs.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let output = process_account(manifest, &account, config);
                    if tx_out.send(output).is_err() {
                        break;
                    }
                }
            });
        }
        drop(rx_jobs);
        drop(tx_out);

        'outer: for account in accounts {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let mut pending = account;
            loop {
                match tx_jobs.send_timeout(pending, Duration::from_millis(50)) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Disconnected(_)) => break 'outer,
                    Err(SendTimeoutError::Timeout(returned)) => {
                        pending = returned;
                        if cancel.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                    }
                }
            }
        }
        drop(tx_jobs);

        let mut outputs = Vec::new();
        while let Ok(output) = rx_out.recv() {
            outputs.push(output);
        }
        outputs
    })
}

fn process_account(manifest: &Manifest, account: &Account, config: &ExportConfig) -> AccountOutput {
    let (handles, failures) = resolver::resolve_chat_dbs(manifest, account);
    if !config.quiet {
        for failure in &failures {
            eprintln!(
                "Skipping database {} ({}): {}",
                failure.logical_path, failure.account_id, failure.reason
            );
        }
    }

    let contacts = resolver::resolve_contact_db(manifest, account)
        .and_then(|conn| ContactIndex::load(&conn).ok());
    if config.verbose && let Some(ref index) = contacts {
        eprintln!("Account {}: {} contact(s)", account.account_id, index.len());
    }

    let mut output = AccountOutput {
        records: Vec::new(),
        degraded: 0,
        tables_skipped: 0,
        resolved_dbs: 0,
        failed_dbs: failures.len(),
    };
    for db in &handles {
        match extractor::extract_db(db, contacts.as_ref()) {
            Ok(extraction) => {
                output.resolved_dbs += 1;
                output.degraded += extraction.degraded;
                output.tables_skipped += extraction.tables_skipped.len();
                if !config.quiet {
                    for table in &extraction.tables_skipped {
                        eprintln!(
                            "Skipping table {} in {}: no usable column mapping",
                            table, db.logical_path
                        );
                    }
                }
                output.records.extend(extraction.records);
            }
            Err(e) => {
                output.failed_dbs += 1;
                if !config.quiet {
                    eprintln!("Error reading {}: {:#}", db.logical_path, e);
                }
            }
        }
    }
    output
}

/// Dedup in encounter order (database resolution order within each
/// account), then sort for the final deterministic output.
fn merge(
    outputs: Vec<AccountOutput>,
    policy: OverlapPolicy,
    duplicates_dropped: &mut usize,
) -> Vec<MessageRecord> {
    let total: usize = outputs.iter().map(|o| o.records.len()).sum();
    let mut kept: Vec<MessageRecord> = Vec::with_capacity(total);
    let mut seen: HashMap<DedupKey, usize> = HashMap::with_capacity(total);

    for output in outputs {
        for record in output.records {
            match seen.entry(record.dedup_key()) {
                Entry::Vacant(slot) => {
                    slot.insert(kept.len());
                    kept.push(record);
                }
                Entry::Occupied(slot) => {
                    *duplicates_dropped += 1;
                    if policy == OverlapPolicy::KeepLast {
                        kept[*slot.get()] = record;
                    }
                }
            }
        }
    }

    kept.sort_by(|a, b| {
        (&a.source_account, &a.contact_id, a.timestamp_utc, a.row_id).cmp(&(
            &b.source_account,
            &b.contact_id,
            b.timestamp_utc,
            b.row_id,
        ))
    });
    kept
}
