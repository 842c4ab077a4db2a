//! bplus demo binary.
//! Usage: bplus [CONFIG_PATH]

use anyhow::Result;
use bplus::{Config, MemBackingStore, Tree};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match env::args().nth(1) {
        Some(path) => Config::from_path(&PathBuf::from(path))?,
        None => Config::default_config(),
    };

    tracing::info!(data_dir = %config.data_dir, "bplus starting");

    let mut tree = Tree::init(MemBackingStore::with_capacity(config.initial_pages))?;
    for key in 1..=10u64 {
        tree.insert(key, key * key)?;
    }
    let scanned = tree.range_forward(None)?;
    tracing::info!(count = scanned.len(), "inserted demo keys");
    for (k, v) in &scanned {
        tracing::debug!(key = k, value = v, "entry");
    }

    tracing::info!("bplus exiting");
    Ok(())
}
