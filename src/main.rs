use clap::Parser;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use wechat_backup_export::{ExportConfig, OverlapPolicy, run_export};

/// Export WeChat chat history from an iTunes/Finder device backup to CSV.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to write the export into.
    /// Defaults to ./wechat-export if not set in config.
    #[arg(value_name = "TARGET_DIR")]
    target_dir: Option<PathBuf>,

    /// Path to one backup directory (the folder holding Manifest.db).
    /// The most recent backup in the MobileSync store is used if omitted.
    #[arg(long, value_name = "PATH")]
    backup: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/wechat-backup-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Compress the output with zstd (adds a .zst extension).
    #[arg(long)]
    compress: bool,

    /// Prepend a UTF-8 byte order mark (helps Excel open the CSV).
    #[arg(long)]
    bom: bool,

    /// When overlapping databases carry the same message with drifted
    /// fields, keep the copy from the later (migrated) database.
    #[arg(long)]
    prefer_newer: bool,

    /// Worker threads. Defaults to available parallelism.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Print per-account and per-database progress.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress the final summary line.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    target_dir: Option<PathBuf>,
    backup_root: Option<PathBuf>,
    compress: Option<bool>,
    bom: Option<bool>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        // Search: XDG/OS config dir, then nothing
        dirs::config_dir()
            .map(|d| d.join("wechat-backup-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve settings (CLI > Config > Default)
    let target_dir = cli
        .target_dir
        .or(file_cfg.target_dir)
        .unwrap_or_else(|| PathBuf::from("wechat-export"));
    let backup_root = cli.backup.or(file_cfg.backup_root);
    let compress = cli.compress || file_cfg.compress.unwrap_or(false);
    let bom = cli.bom || file_cfg.bom.unwrap_or(false);

    // 3. Destination setup belongs to this layer, not the pipeline
    fs::create_dir_all(&target_dir)
        .wrap_err_with(|| format!("Failed to create target dir: {}", target_dir.display()))?;
    let file_name = if compress { "chats.csv.zst" } else { "chats.csv" };

    let config = ExportConfig {
        backup_root,
        destination: target_dir.join(file_name),
        compress,
        byte_order_mark: bom,
        overlap: if cli.prefer_newer {
            OverlapPolicy::KeepLast
        } else {
            OverlapPolicy::KeepFirst
        },
        workers: cli.workers,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    // 4. Run the pipeline
    let summary = run_export(&config).wrap_err("Export failed")?;

    if !config.quiet {
        eprintln!("Done. {}", summary);
    }
    Ok(())
}
