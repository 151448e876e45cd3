use anyhow::{Context, Result};
use clap::Subcommand;
use kiln_cache::{CacheStatistics, CacheStore};
use kiln_task::KilnConfig;
use std::fmt::Write as _;

#[derive(Debug, Subcommand)]
pub enum CacheCommands {
    /// Show cache statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every cache entry
    Clear,
    /// Drop expired entries and enforce the size limits now
    Cleanup,
}

impl CacheCommands {
    pub async fn execute(self, config: &KilnConfig) -> Result<()> {
        let dir = config.cache.base_dir.display().to_string();
        let store = CacheStore::open(config.cache.clone())
            .with_context(|| format!("failed to open cache at {dir}"))?;

        match self {
            CacheCommands::Stats { json } => {
                let stats = store.stats();
                if json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    print!("{}", render_stats(&dir, &stats));
                }
            }
            CacheCommands::Clear => {
                let removed = store.len();
                store.clear().context("failed to clear cache")?;
                tracing::info!(removed, "Cache cleared");
                println!("Removed {removed} cache entries from {dir}");
            }
            CacheCommands::Cleanup => {
                let expired = store.cleanup_expired();
                let report = store.enforce_limits();
                println!(
                    "Removed {expired} expired and {} evicted entries ({} bytes freed)",
                    report.total(),
                    report.bytes_freed
                );
            }
        }
        store.shutdown();
        Ok(())
    }
}

pub fn render_stats(dir: &str, stats: &CacheStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Cache: {dir}");
    let _ = writeln!(out, "  Entries: {} / {}", stats.entries, stats.max_entries);
    let _ = writeln!(
        out,
        "  Size: {:.2} MB / {:.2} MB",
        stats.total_bytes as f64 / 1_048_576.0,
        stats.max_bytes as f64 / 1_048_576.0
    );
    let _ = writeln!(out, "  Hits: {}", stats.hits);
    let _ = writeln!(out, "  Misses: {}", stats.misses);
    let _ = writeln!(out, "  Hit rate: {:.1}%", stats.hit_rate * 100.0);
    let _ = writeln!(out, "  Writes: {}", stats.writes);
    let _ = writeln!(
        out,
        "  Removed: {} evicted, {} expired, {} corrupted",
        stats.evictions, stats.expirations, stats.corrupted_removed
    );
    out
}
