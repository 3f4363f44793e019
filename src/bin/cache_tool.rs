use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use memosync::cache::{CommandRecord, StoredRecord, list_records};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "memosync-cache")]
#[command(about = "Inspect and maintain a memosync command cache directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print queued commands in delivery order.
    List { dir: PathBuf },
    /// Delete every queued command.
    Purge {
        dir: PathBuf,
        #[arg(long)]
        yes: bool,
    },
    Stats { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::List { dir } => list(&dir).await,
        Command::Purge { dir, yes } => purge(&dir, yes).await,
        Command::Stats { dir } => stats(&dir).await,
    }
}

async fn records(dir: &Path) -> Result<Vec<StoredRecord>> {
    list_records(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))
}

async fn read_record(dir: &Path, record: &StoredRecord) -> Result<Option<CommandRecord>> {
    let path = dir.join(&record.name);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(CommandRecord::parse(&bytes))
}

/// Milliseconds encoded in a record name, if it has the expected shape.
fn queued_at(name: &str) -> Option<DateTime<Utc>> {
    let hex = name.strip_prefix(memosync::cache::RECORD_PREFIX)?.get(..16)?;
    let millis = i64::from_str_radix(hex, 16).ok()?;
    DateTime::from_timestamp_millis(millis)
}

async fn list(dir: &Path) -> Result<()> {
    let stored = records(dir).await?;
    if stored.is_empty() {
        println!("no queued commands in {}", dir.display());
        return Ok(());
    }
    for record in &stored {
        let when = queued_at(&record.name)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        match read_record(dir, record).await? {
            Some(parsed) => println!(
                "{}  {:>8} B  {}  {} {}{}",
                record.name,
                record.size,
                when,
                parsed.command.method,
                parsed.command.path,
                parsed
                    .local_id
                    .map(|id| format!("  ({})", id))
                    .unwrap_or_default(),
            ),
            None => println!("{}  {:>8} B  {}  <unreadable>", record.name, record.size, when),
        }
    }
    Ok(())
}

async fn purge(dir: &Path, yes: bool) -> Result<()> {
    let stored = records(dir).await?;
    if !yes {
        bail!(
            "refusing to delete {} queued commands without --yes",
            stored.len()
        );
    }
    for record in &stored {
        let path = dir.join(&record.name);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete {}", path.display()))?;
    }
    println!("deleted {} queued commands", stored.len());
    Ok(())
}

async fn stats(dir: &Path) -> Result<()> {
    let stored = records(dir).await?;
    let total: u64 = stored.iter().map(|r| r.size).sum();
    let mut unreadable = 0usize;
    for record in &stored {
        if read_record(dir, record).await?.is_none() {
            unreadable += 1;
        }
    }
    println!("commands:   {}", stored.len());
    println!("bytes:      {}", total);
    println!("unreadable: {}", unreadable);
    if let (Some(first), Some(last)) = (stored.first(), stored.last()) {
        if let Some(at) = queued_at(&first.name) {
            println!("oldest:     {}", at.to_rfc3339());
        }
        if let Some(at) = queued_at(&last.name) {
            println!("newest:     {}", at.to_rfc3339());
        }
    }
    Ok(())
}
