//! Print sequence health and recent gaps for a draw database

use clap::Parser;
use drawguard::{
    config::StorageConfig,
    draw_store::DrawStore,
    metrics::DrawGuardMetrics,
    sequence::SequenceIntegrityMonitor,
    storage::DrawStorage,
    DrawGuardResult,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gap_report")]
#[command(about = "Report missing draw numbers and recorded gaps")]
struct Args {
    /// Path to the database directory
    #[arg(short, long, default_value = "./DB/drawguard_data")]
    data_dir: String,

    /// Trailing window for recorded gaps, in seconds
    #[arg(short, long, default_value = "3600")]
    window_secs: u64,

    /// Show at most this many missing draw numbers
    #[arg(short, long, default_value = "50")]
    limit: usize,
}

fn main() -> DrawGuardResult<()> {
    let args = Args::parse();

    let storage = DrawStorage::open(&StorageConfig {
        data_directory: args.data_dir.clone(),
        ..Default::default()
    })?;
    let monitor = SequenceIntegrityMonitor::new(
        DrawStore::new(storage.clone())?,
        storage,
        DrawGuardMetrics::new()?,
        100,
        Duration::from_secs(args.window_secs),
    )
    .with_missing_limit(args.limit);

    let gaps = monitor.gaps_in_window()?;
    let health = monitor.health(gaps.len())?;

    println!("📋 Sequence health ({})", health.source_identifier);
    println!("   Status:         {}", health.status);
    println!("   Total draws:    {}", health.total_draws);
    match (health.min_draw, health.max_draw) {
        (Some(min), Some(max)) => println!("   Range:          {} - {}", min, max),
        _ => println!("   Range:          (empty)"),
    }
    println!("   Expected draws: {}", health.expected_draws);
    println!("   Missing:        {}", health.missing_count);

    if !health.missing_draws.is_empty() {
        let shown: Vec<String> = health.missing_draws.iter().map(|n| n.to_string()).collect();
        let more = health.missing_count.saturating_sub(health.missing_draws.len() as u64);
        println!("   Missing draws:  {}{}", shown.join(", "), if more > 0 { format!(" (+{} more)", more) } else { String::new() });
    }

    println!();
    println!("⚠️  Recorded gaps in the last {}s: {}", args.window_secs, gaps.len());
    for gap in gaps {
        println!(
            "   {}  expected {} got {} ({} missing)",
            gap.timestamp.format("%Y-%m-%d %H:%M:%S"),
            gap.expected_draw_number,
            gap.attempted_draw_number,
            gap.gap_size
        );
    }

    Ok(())
}
