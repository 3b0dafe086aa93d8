//! `kiln cache` commands

use super::format_bytes;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_core::builder::PruneStrategy;
use kiln_core::{BuilderOptions, CacheEngine, Settings};
use std::time::Duration;

fn open_cache() -> Result<(CacheEngine, PruneStrategy)> {
    let settings = Settings::load().context("failed to load settings")?;
    let options = BuilderOptions::from_settings(&settings);
    let cache = CacheEngine::open(&options.cache_dir)
        .with_context(|| format!("failed to open cache at {}", options.cache_dir.display()))?;
    Ok((cache, options.prune_strategy))
}

pub fn info() -> Result<()> {
    let (cache, _) = open_cache()?;
    let info = cache.info()?;

    println!("{} {}", "Cache:".bold(), info.base_dir.display());
    println!("  Entries:  {}", info.entries);
    println!("  Size:     {}", format_bytes(info.total_bytes));
    println!(
        "  Lookups:  {} hits, {} misses ({:.1}% hit rate)",
        info.stats.hits,
        info.stats.misses,
        info.stats.hit_rate() * 100.0
    );
    println!("  Evicted:  {}", info.stats.evictions);

    println!();
    println!("{:<24} {:>8} {:>12}", "PARTITION".bold(), "ENTRIES".bold(), "SIZE".bold());
    println!("{:<24} {:>8} {:>12}", "shared", info.shared.entries, format_bytes(info.shared.bytes));
    for (platform, partition) in &info.platforms {
        println!("{:<24} {:>8} {:>12}", platform, partition.entries, format_bytes(partition.bytes));
    }
    Ok(())
}

pub fn prune(
    max_size: Option<u64>,
    max_age_hours: Option<u64>,
    max_files: Option<usize>,
    platform_quota: Option<u64>,
) -> Result<()> {
    let (cache, configured) = open_cache()?;
    let strategy = PruneStrategy {
        max_size: max_size.or(configured.max_size),
        max_age: max_age_hours.map(|h| Duration::from_secs(h * 3600)).or(configured.max_age),
        max_files: max_files.or(configured.max_files),
        platform_quota: platform_quota.or(configured.platform_quota),
        ..configured
    };

    let report = cache.prune(&strategy)?;
    println!(
        "{} Removed {} of {} entries, freed {}",
        "✓".green(),
        report.removed,
        report.scanned,
        format_bytes(report.bytes_freed)
    );
    for (reason, count) in &report.by_reason {
        println!("  {:<16} {}", reason, count);
    }
    if report.failed_deletions > 0 {
        println!("  {} {} entries could not be deleted", "!".yellow(), report.failed_deletions);
    }
    println!(
        "  Remaining: {} entries, {}",
        report.remaining_entries,
        format_bytes(report.remaining_bytes)
    );
    Ok(())
}

pub fn clear() -> Result<()> {
    let (cache, _) = open_cache()?;
    let removed = cache.clear()?;
    println!("{} Cleared {} cache entries", "✓".green(), removed);
    Ok(())
}
