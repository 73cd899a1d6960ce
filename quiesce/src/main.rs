//! quiesce - batch stdin lines after a quiet period
//!
//! Commands:
//! - `batch`: read lines from stdin and print each flushed batch as a JSON array
//! - `status`: show configuration and the pending batch in the durable store
//! - `clear`: remove a pending batch from the durable store
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/quiesce/store.db (~/.local/share/quiesce/store.db)
//! - Config: $XDG_CONFIG_HOME/quiesce/config.toml (~/.config/quiesce/config.toml)
//! - Logs: $XDG_STATE_HOME/quiesce/ (~/.local/state/quiesce/)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quiesce_core::{
    Collector, CollectorConfig, CollectorEvent, Config, ListenerError, PersistedState,
    Persistence, SqliteStore, StorageType, TokioScheduler,
};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "quiesce")]
#[command(about = "Batch stdin lines after a quiet period")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read lines from stdin and print every flushed batch as a JSON array
    Batch {
        /// Quiescence delay in milliseconds (default: from config)
        #[arg(short, long)]
        delay_ms: Option<u64>,

        /// Keep the first schedule instead of restarting it on every line
        #[arg(long)]
        no_reset: bool,

        /// Where to persist the pending batch: memory, local or session
        #[arg(short, long)]
        storage: Option<StorageType>,

        /// Storage key of the pending batch (default: from config)
        #[arg(short, long)]
        key: Option<String>,

        /// Keep flushed lines buffered and persisted instead of draining them
        #[arg(long)]
        keep: bool,
    },

    /// Show configuration and the pending batch in the durable store
    Status {
        /// Storage key to inspect (default: from config)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Remove a pending batch from the durable store
    Clear {
        /// Storage key to clear (default: from config)
        #[arg(short, long)]
        key: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(quiesce_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Batch {
            delay_ms,
            no_reset,
            storage,
            key,
            keep,
        } => {
            let mut collector = config.collector.clone();
            if let Some(delay_ms) = delay_ms {
                collector.delay_ms = delay_ms;
            }
            if no_reset {
                collector.reset_timer_on_push = false;
            }
            if let Some(storage) = storage {
                collector.storage = storage;
            }
            if let Some(key) = key {
                collector.storage_key = key;
            }
            if keep {
                collector.auto_clear = false;
            }
            cmd_batch(collector).await
        }
        Command::Status { key } => cmd_status(&config, key),
        Command::Clear { key } => cmd_clear(&config, key),
    }
}

async fn cmd_batch(config: CollectorConfig) -> Result<()> {
    let scheduler = Arc::new(TokioScheduler::current()?);
    let collector: Collector<String> =
        Collector::new(&config, scheduler).context("invalid collector configuration")?;

    if config.storage == StorageType::Local && !collector.is_persistent() {
        eprintln!(
            "warning: store at {} unavailable, batching in memory only",
            config.resolved_storage_path().display()
        );
    }

    // Batches are printed from this task so output keeps emission order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();
    collector.subscribe(CollectorEvent::Flush, move |batch| {
        tx.send(batch.to_vec())
            .map_err(|e| Box::new(e) as ListenerError)
    });

    // The recovered batch is emitted on the first tick, before any new line.
    if collector.stats().recovered_items > 0 {
        if let Some(batch) = rx.recv().await {
            print_batch(&batch)?;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut read_error = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => collector.push(line),
                    Ok(None) => break,
                    // Lines already pushed still get flushed below
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read stdin, flushing pending lines");
                        read_error = Some(e);
                        break;
                    }
                }
            }
            Some(batch) = rx.recv() => print_batch(&batch)?,
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, flushing pending lines");
                break;
            }
        }
    }

    // Without auto_clear the buffer also holds lines that were already printed
    if collector.unflushed() > 0 {
        collector.flush_now();
    }
    let stats = collector.stats();
    drop(collector);

    // Dropping the collector drops the sender, which ends the drain.
    while let Some(batch) = rx.recv().await {
        print_batch(&batch)?;
    }

    tracing::info!(
        items_pushed = stats.items_pushed,
        flushes = stats.flushes,
        recovered_items = stats.recovered_items,
        listener_failures = stats.listener_failures,
        persist_failures = stats.persist_failures,
        "Batch run complete"
    );

    match read_error {
        Some(e) => Err(e).context("failed to read stdin"),
        None => Ok(()),
    }
}

fn print_batch(batch: &[String]) -> Result<()> {
    let line = serde_json::to_string(batch).context("failed to encode batch")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line).context("failed to write batch")?;
    stdout.flush().context("failed to flush stdout")?;
    Ok(())
}

/// The durable store, or `None` if it was never created
fn open_store(config: &Config) -> Result<Option<Arc<SqliteStore>>> {
    let path = config.collector.resolved_storage_path();
    if !path.exists() {
        return Ok(None);
    }

    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(Some(Arc::new(store)))
}

fn cmd_status(config: &Config, key: Option<String>) -> Result<()> {
    let collector = &config.collector;
    let store_path = collector.resolved_storage_path();

    println!("quiesce Configuration");
    println!("=====================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Delay:           {}ms", collector.delay_ms);
    println!(
        "Timer:           {}",
        if collector.reset_timer_on_push {
            "restart on every push"
        } else {
            "fixed window"
        }
    );
    println!("Storage:         {}", collector.storage.as_str());
    println!("Auto clear:      {}", collector.auto_clear);
    println!("Store path:      {}", store_path.display());
    println!();

    let Some(store) = open_store(config)? else {
        println!("No store yet (nothing pending)");
        return Ok(());
    };

    println!("Schema version:  {}", store.schema_version()?);
    println!("Keys:            {}", store.keys()?.len());

    let key = key.unwrap_or_else(|| collector.storage_key.clone());
    println!("Key:             {}", key);

    match Persistence::new(store, key).inspect::<Value>() {
        PersistedState::Absent => println!("Pending:         none"),
        PersistedState::Batch(items) => {
            println!("Pending:         {} items", items.len());
            for item in &items {
                println!("  {}", item);
            }
        }
        PersistedState::Foreign(raw) => {
            println!("Pending:         none (key holds a non-batch value)");
            println!("  {}", raw);
        }
    }

    Ok(())
}

fn cmd_clear(config: &Config, key: Option<String>) -> Result<()> {
    let Some(store) = open_store(config)? else {
        println!("Nothing to clear");
        return Ok(());
    };
    let key = key.unwrap_or_else(|| config.collector.storage_key.clone());
    let persistence = Persistence::new(store, key);

    match persistence.inspect::<Value>() {
        PersistedState::Absent => println!("Nothing to clear"),
        PersistedState::Foreign(_) => {
            println!(
                "Key '{}' holds a non-batch value, leaving it untouched",
                persistence.key()
            );
        }
        PersistedState::Batch(_) => {
            let claimed = persistence.claim::<Value>();
            tracing::info!(key = %persistence.key(), items = claimed.len(), "Cleared pending batch");
            println!("Cleared {} pending items", claimed.len());
        }
    }

    Ok(())
}
