//! Seeded crash/recovery simulation runner
//!
//! Usage: journal-dst [baseline|crash|chaos] [seed-count] [first-seed]

use flash_journal::config::LoggingConfig;
use flash_journal::dst::{run_dst_batch, summarize_dst_batch, JournalDSTConfig};
use flash_journal::observability::init_tracing;
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let preset = env::args().nth(1).unwrap_or("chaos".to_string());
    let count: u64 = env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(100);
    let first: u64 = env::args().nth(3).and_then(|s| s.parse().ok()).unwrap_or(0);

    let config = match preset.as_str() {
        "baseline" => JournalDSTConfig::baseline(),
        "crash" => JournalDSTConfig::crash_only(),
        "chaos" => JournalDSTConfig::chaos(),
        other => {
            eprintln!("unknown preset {:?} (expected baseline, crash or chaos)", other);
            return ExitCode::from(2);
        }
    };

    init_tracing(&LoggingConfig {
        level: "warn".to_string(),
        json: false,
    });

    println!("Journal DST: preset {}, seeds {}..{}", preset, first, first + count);
    let results = run_dst_batch(first..first + count, config);
    println!("{}", summarize_dst_batch(&results));
    for r in results.iter().filter(|r| !r.passed) {
        if let Ok(line) = serde_json::to_string(r) {
            eprintln!("{}", line);
        }
    }

    if results.iter().all(|r| r.passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
