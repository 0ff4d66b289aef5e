//! Cache administration commands.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use folio_core::{
    CacheRecord, CacheStore, DiskCacheStore, ExecutionConfig, StagedRecord, read_notebook,
};

use crate::colors;

/// Cache directory from the flag, or the default under the current directory.
pub fn resolve_root(cache_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let config = ExecutionConfig {
        cache_path,
        ..ExecutionConfig::default()
    };
    Ok(config.resolve_cache_path(&std::env::current_dir()?))
}

fn open(root: &Path) -> anyhow::Result<DiskCacheStore> {
    if !root.exists() {
        anyhow::bail!("No cache found at {}", root.display());
    }
    Ok(DiskCacheStore::open(root)?)
}

fn timestamp(secs: f64) -> String {
    DateTime::from_timestamp(secs.trunc() as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// List committed or staged records.
pub fn list(root: &Path, staged: bool) -> anyhow::Result<()> {
    let store = open(root)?;

    if staged {
        let records = store.staged_records()?;
        if records.is_empty() {
            println!("{}No staged notebooks.{}", colors::YELLOW, colors::RESET);
            return Ok(());
        }
        for record in records {
            let status = match &record.error {
                Some(error) => format!("{}failed: {}{}", colors::RED, error, colors::RESET),
                None => format!("{}pending{}", colors::DIM, colors::RESET),
            };
            println!("{}  {}  {}", &record.hash[..record.hash.len().min(12)], record.uri, status);
            if let Some(traceback) = &record.traceback {
                for line in traceback.lines() {
                    println!("    {}{}{}", colors::DIM, line, colors::RESET);
                }
            }
        }
        return Ok(());
    }

    let records = store.records()?;
    if records.is_empty() {
        println!("{}Cache is empty.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {}  {:.2}s",
            record.hash,
            timestamp(record.created),
            record.uri,
            record.runtime
        );
    }
    Ok(())
}

fn find_record<'a>(records: &'a [CacheRecord], id: &str) -> anyhow::Result<&'a CacheRecord> {
    let matches: Vec<&CacheRecord> = records.iter().filter(|r| r.hash.starts_with(id)).collect();
    match matches.as_slice() {
        [record] => Ok(record),
        [] => anyhow::bail!("No cache record with ID {}", id),
        _ => anyhow::bail!("Cache record ID {} is ambiguous ({} matches)", id, matches.len()),
    }
}

/// Staged record by source path or unique key prefix.
fn find_staged<'a>(records: &'a [StagedRecord], id: &str) -> Option<&'a StagedRecord> {
    let canonical = Path::new(id)
        .canonicalize()
        .ok()
        .map(|path| path.display().to_string());
    if let Some(record) = records
        .iter()
        .find(|r| r.uri == id || Some(&r.uri) == canonical.as_ref())
    {
        return Some(record);
    }
    let matches: Vec<&StagedRecord> = records.iter().filter(|r| r.hash.starts_with(id)).collect();
    match matches.as_slice() {
        [record] => Some(record),
        _ => None,
    }
}

fn show_staged(record: &StagedRecord) {
    println!("{}Key:{}      {}", colors::BOLD, colors::RESET, record.hash);
    println!("{}URI:{}      {}", colors::BOLD, colors::RESET, record.uri);
    println!("{}Staged:{}   {}", colors::BOLD, colors::RESET, timestamp(record.created));
    match (&record.error, &record.traceback) {
        (error, Some(traceback)) => {
            println!(
                "{}Status:{}   {}failed: {}{}",
                colors::BOLD,
                colors::RESET,
                colors::RED,
                error.as_deref().unwrap_or("ExecutionError"),
                colors::RESET
            );
            println!("\n{}", traceback.trim_end());
        }
        _ => println!("{}Status:{}   pending", colors::BOLD, colors::RESET),
    }
}

/// Show one committed record, or a staged notebook and its stored failure.
pub fn show(root: &Path, id: &str, with_notebook: bool) -> anyhow::Result<()> {
    let store = open(root)?;
    let records = store.records()?;
    let record = match find_record(&records, id) {
        Ok(record) => record,
        Err(e) => {
            let staged = store.staged_records()?;
            return match find_staged(&staged, id) {
                Some(record) if !with_notebook => {
                    show_staged(record);
                    Ok(())
                }
                _ => Err(e),
            };
        }
    };
    let payload = store.payload_path(&record.hash);

    if with_notebook {
        let notebook = read_notebook(&payload)?;
        println!("{}", serde_json::to_string_pretty(&notebook)?);
        return Ok(());
    }

    println!("{}ID:{}       {}", colors::BOLD, colors::RESET, record.hash);
    println!("{}URI:{}      {}", colors::BOLD, colors::RESET, record.uri);
    println!("{}Created:{}  {}", colors::BOLD, colors::RESET, timestamp(record.created));
    println!("{}Runtime:{}  {:.2}s", colors::BOLD, colors::RESET, record.runtime);
    println!("{}Notebook:{} {}", colors::BOLD, colors::RESET, payload.display());
    Ok(())
}

/// Remove every record.
pub fn clear(root: &Path) -> anyhow::Result<()> {
    if !root.exists() {
        println!("{}No cache found at {}{}", colors::YELLOW, root.display(), colors::RESET);
        return Ok(());
    }
    DiskCacheStore::open(root)?.clear()?;
    println!("{}Cleared{} cache at {}", colors::GREEN, colors::RESET, root.display());
    Ok(())
}

/// Remove a staged notebook.
pub fn unstage(root: &Path, path: &Path) -> anyhow::Result<()> {
    let store = open(root)?;
    let uri = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();
    if !store.unstage(&uri)? {
        anyhow::bail!("{} is not staged", uri);
    }
    println!("{}Unstaged{} {}", colors::GREEN, colors::RESET, uri);
    Ok(())
}
