//! `trek config check`

use super::load_config;
use anyhow::Result;
use std::path::Path;

pub async fn cmd_config_check(config: Option<&Path>) -> Result<()> {
    let (config, source) = load_config(config)?;

    match source {
        Some(path) => println!("✓ Config valid: {}", path.display()),
        None => println!("✓ No config file, using defaults"),
    }
    println!("  queue_path:             {}", config.queue_path.display());
    println!("  database_path:          {}", config.database_path.display());
    println!("  max_attempts:           {}", config.max_attempts);
    println!(
        "  backoff:                {:?} .. {:?} (quota x{})",
        config.backoff_base, config.backoff_max, config.quota_backoff_multiplier
    );
    println!("  request_timeout:        {:?}", config.request_timeout);
    println!("  max_concurrent_uploads: {}", config.max_concurrent_uploads);
    println!("  retry_interval:         {:?}", config.retry_interval);
    Ok(())
}
