//! `trek queue` - inspect and reset the pending-change log

use super::load_config;
use anyhow::Result;
use serde_json::json;
use std::path::Path;
use trek_sync::{OfflineQueue, QueueEntry};

pub async fn cmd_queue_list(config: Option<&Path>, json: bool) -> Result<()> {
    let (config, _) = load_config(config)?;
    let queue = OfflineQueue::open(&config.queue_path)?;

    let mut entries = queue.entries();
    entries.sort_by_key(|e| e.seq);

    if json {
        let rows: Vec<_> = entries.iter().map(entry_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No pending changes");
        return Ok(());
    }

    println!("{} pending change(s) in {}", entries.len(), config.queue_path.display());
    for entry in &entries {
        let retry = entry
            .not_before
            .map(|t| format!("  retry after {}", t.to_rfc3339()))
            .unwrap_or_default();
        println!(
            "  #{:<4} {:<12} {:<8} {}  attempts={}{}",
            entry.seq,
            entry.key.kind,
            format!("{:?}", entry.change).to_lowercase(),
            entry.key.id,
            entry.attempts,
            retry
        );
    }
    Ok(())
}

pub async fn cmd_queue_clear(config: Option<&Path>) -> Result<()> {
    let (config, _) = load_config(config)?;
    let mut queue = OfflineQueue::open(&config.queue_path)?;
    let dropped = queue.clear()?;
    println!("✓ Cleared {} pending change(s)", dropped);
    Ok(())
}

fn entry_json(entry: &QueueEntry) -> serde_json::Value {
    json!({
        "seq": entry.seq,
        "kind": entry.key.kind,
        "id": entry.key.id,
        "change": entry.change,
        "attempts": entry.attempts,
        "enqueuedAt": entry.enqueued_at,
        "notBefore": entry.not_before,
    })
}
