//! `trek pending` - local entities not yet confirmed remotely

use super::load_config;
use anyhow::Result;
use serde_json::json;
use std::path::Path;
use trek_common::Entity;
use trek_sync::{LocalStore, SqliteStore};

pub async fn cmd_pending(config: Option<&Path>, json: bool) -> Result<()> {
    let (config, _) = load_config(config)?;

    let mut pending = if config.database_path.exists() {
        SqliteStore::open(&config.database_path)?.pending()?
    } else {
        tracing::debug!("No local store at {:?}", config.database_path);
        Vec::new()
    };
    pending.sort_by(|a, b| {
        a.kind()
            .cmp(&b.kind())
            .then_with(|| a.meta().last_updated.cmp(&b.meta().last_updated))
    });

    if json {
        let rows: Vec<_> = pending.iter().map(entity_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("Everything is synced");
        return Ok(());
    }

    println!("{} entities waiting to sync:", pending.len());
    for entity in &pending {
        let meta = entity.meta();
        println!(
            "  {:<12} {}  {:<10} updated {}{}",
            entity.kind(),
            entity.id(),
            meta.sync_status,
            meta.last_updated.to_rfc3339(),
            meta.remote_id
                .as_deref()
                .map(|r| format!("  (remote {})", r))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn entity_json(entity: &Entity) -> serde_json::Value {
    let meta = entity.meta();
    json!({
        "kind": entity.kind(),
        "id": entity.id(),
        "remoteId": meta.remote_id,
        "syncStatus": meta.sync_status,
        "lastUpdated": meta.last_updated,
    })
}
