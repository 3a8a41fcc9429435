use chrono::{DateTime, Local};
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::info;

use objectstore::cli::{Cli, Command};
use objectstore::config::Config;
use objectstore::handle::list_store_names;
use objectstore::{ObjectStore, StoreHandle};

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn open_store(name: &str, config: &Config) -> Result<ObjectStore<Value>> {
    ObjectStore::builder(name)
        .config(config.clone())
        .open()
        .context(format!("Failed to open store '{}'", name))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.dir {
        config.store_dir = dir;
    }
    if let Some(ms) = cli.write_interval_ms {
        config.write_interval_ms = ms;
    }
    info!(store_dir = %config.store_dir.display(), "objectstore starting");

    match cli.command {
        Command::Put { name, value } => {
            let value: Value = serde_json::from_str(&value).context("Value must be valid JSON")?;
            let store = open_store(&name, &config)?;
            store.write(Some(value));
            store.flush();
            if !store.exists() {
                return Err(eyre!("Failed to persist value for '{}'", name));
            }
            println!("{} Stored {}", "✓".green(), name.cyan());
        }
        Command::Get { name, compact } => {
            let store = open_store(&name, &config)?;
            let value = store
                .read_blocking()
                .ok_or_else(|| eyre!("No value stored for '{}'", name))?;
            let text = if compact {
                serde_json::to_string(&value)?
            } else {
                serde_json::to_string_pretty(&value)?
            };
            println!("{}", text);
        }
        Command::Clear { name } => {
            let store = open_store(&name, &config)?;
            store.clear();
            store.drain();
            println!("{} Cleared {}", "✓".green(), name.cyan());
        }
        Command::List => {
            let names = list_store_names(&config.store_dir)?;
            if names.is_empty() {
                println!("{}", "No stores found".dimmed());
            }
            for name in names {
                let handle = StoreHandle::new(&name, &config.store_dir)?;
                let size = fs::metadata(handle.primary_path()).map(|m| m.len()).unwrap_or(0);
                println!("{} {}", name.cyan(), format!("{} bytes", size).dimmed());
            }
        }
        Command::Info { name } => {
            let handle = StoreHandle::new(&name, &config.store_dir)?;
            print_info(&handle)?;
        }
    }

    Ok(())
}

fn print_info(handle: &StoreHandle) -> Result<()> {
    println!("{} {}", "Store:".bold(), handle.name().cyan());
    println!("{} {}", "File:".bold(), handle.primary_path().display());
    print_file_line("Value:", handle.primary_path())?;
    print_file_line("Temp:", handle.temp_path())?;
    Ok(())
}

fn print_file_line(label: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        println!("{} {}", label.bold(), "absent".dimmed());
        return Ok(());
    }

    let meta = fs::metadata(path).context(format!("Failed to stat {}", path.display()))?;
    let modified: DateTime<Local> = meta.modified()?.into();
    println!(
        "{} {} bytes, modified {}",
        label.bold(),
        meta.len(),
        modified.format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}
