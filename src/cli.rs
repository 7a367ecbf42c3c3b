use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::debug;

use crate::cache::inventory::{StoreInventory, remove_keys};
use crate::cache::path::cache_root;
use crate::config::Config;
use crate::storage::{LocalStorage, Storage};
use crate::utils::logger;
use crate::version::VERSION;

#[derive(Parser, Debug)]
#[command(name = "cachestore", version = VERSION, about = "Inspect and maintain a cachestore directory")]
pub struct CachestoreCli {
    #[arg(long, global = true)]
    /// Store directory. Defaults to the configured root, then `$CACHESTORE_DIR`, then `.cachestore`.
    root: Option<PathBuf>,

    #[arg(long, global = true)]
    /// Configuration file read after the discovered ones.
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "default")]
    /// Cache whose configuration section applies.
    cache: String,

    #[command(subcommand)]
    command: Command,
}

impl CachestoreCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lists every function with stored entries.
    List,
    /// Shows the stored entries of one function.
    Details {
        /// Qualified name, or its trailing part.
        function: String,
    },
    /// Removes the stored entries of the named functions.
    Remove {
        #[arg(required_unless_present = "all")]
        functions: Vec<String>,
        #[arg(long, conflicts_with = "functions")]
        /// Removes every stored key.
        all: bool,
    },
    /// Removes expired entries and keys that belong to no complete entry.
    Evict,
}

pub fn run() -> Result<()> {
    logger::init_logging();
    let cli = CachestoreCli::parse();
    execute(&cli)
}

pub fn execute(cli: &CachestoreCli) -> Result<()> {
    let storage = open_storage(cli)?;
    debug!(root = %storage.root().display(), "store opened");
    match &cli.command {
        Command::List => handle_list(&storage),
        Command::Details { function } => handle_details(&storage, function),
        Command::Remove { functions, all } => handle_remove(&storage, functions, *all),
        Command::Evict => handle_evict(&storage),
    }
}

fn open_storage(cli: &CachestoreCli) -> Result<LocalStorage> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let section = config.cache(&cli.cache).cloned().unwrap_or_default();
    let root = cli
        .root
        .clone()
        .or_else(|| section.root.clone())
        .unwrap_or_else(cache_root);
    Ok(LocalStorage::new(root).with_compression(section.compression()?))
}

fn handle_list(storage: &LocalStorage) -> Result<()> {
    let inventory = StoreInventory::scan(storage)?;
    if inventory.functions().is_empty() {
        println!("{} {}", "empty".yellow().bold(), storage.root().display());
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{}",
        format!("{:<48} {:>7} {:>7}  {}", "FUNCTION", "ENTRIES", "EXPIRED", "LAST EXECUTED").bold()
    );
    for summary in inventory.functions() {
        println!(
            "{} {:>7} {:>7}  {}",
            format!("{:<48}", summary.function.qualified_name).cyan(),
            summary.entries.len(),
            summary.expired(now),
            format_time(summary.last_executed()),
        );
    }
    if !inventory.orphans().is_empty() {
        println!(
            "{} {} key(s) belong to no complete entry; run `cachestore evict`",
            "note".yellow().bold(),
            inventory.orphans().len()
        );
    }
    Ok(())
}

fn handle_details(storage: &LocalStorage, function: &str) -> Result<()> {
    let inventory = StoreInventory::scan(storage)?;
    let matches = inventory.find(function);
    if matches.is_empty() {
        bail!("no stored entries for `{function}`");
    }

    let now = Utc::now();
    for summary in matches {
        println!("{} {}", "function".green().bold(), summary.function.qualified_name);
        println!("  {:<10} {}", "defined", summary.function.defining_path);
        println!("  {:<10} {}", "hash", summary.function_hash);
        for entry in &summary.entries {
            let state = if entry.record.is_expired_at(now) {
                "expired".red()
            } else if entry.artifact_present {
                "ready".green()
            } else {
                "missing".yellow()
            };
            println!("  {} {}", entry.key.execution_hash().bold(), state);
            println!("    {:<10} {}", "executed", format_time(Some(entry.record.executed_at)));
            println!("    {:<10} {}", "expires", format_time(entry.record.expired_at));
            for (name, value) in &entry.record.parameters {
                println!("    {} = {value}", name.cyan());
            }
        }
    }
    Ok(())
}

fn handle_remove(storage: &LocalStorage, functions: &[String], all: bool) -> Result<()> {
    let keys = if all {
        storage.all()?
    } else {
        let inventory = StoreInventory::scan(storage)?;
        let mut keys = Vec::new();
        for name in functions {
            let matches = inventory.find(name);
            if matches.is_empty() {
                bail!("no stored entries for `{name}`");
            }
            keys.extend(matches.into_iter().flat_map(StoreInventory::keys_of));
        }
        keys
    };

    let removed = remove_keys(storage, keys)?.len();
    println!("{} {removed} key(s)", "removed".green().bold());
    Ok(())
}

fn handle_evict(storage: &LocalStorage) -> Result<()> {
    let inventory = StoreInventory::scan(storage)?;
    let removed = remove_keys(storage, inventory.evictable(Utc::now()))?.len();
    println!("{} {removed} key(s)", "evicted".green().bold());
    Ok(())
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(
        || "never".to_string(),
        |at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}
