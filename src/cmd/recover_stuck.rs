//! Stuck-session recovery command (`appforge recover-stuck`).
//!
//! Run this while the server is stopped; sessions owned by a live server
//! process are indistinguishable from stuck ones here.

use std::collections::HashSet;

use anyhow::{Context, Result};
use appforge::config::AppConfig;
use appforge::session::recover_stuck_sessions;
use appforge::store::SessionDb;
use chrono::Utc;

pub fn cmd_recover_stuck(threshold_ms: Option<u64>, dry_run: bool) -> Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let db = SessionDb::new(&config.database_path).context("Failed to open session database")?;
    let threshold_ms = match threshold_ms {
        Some(ms) => i64::try_from(ms).context("--threshold-ms is out of range")?,
        None => i64::try_from(config.stuck_threshold.as_millis()).context("Stuck threshold is out of range")?,
    };
    let now = Utc::now();

    if dry_run {
        let stuck = db.find_stuck_sessions(threshold_ms, now)?;
        if stuck.is_empty() {
            println!("No stuck sessions.");
        }
        for session in stuck {
            println!(
                "Would recover {} (generating for {} minutes)",
                session.id,
                session.age_millis(now) / 60_000
            );
        }
        return Ok(());
    }

    let recovered = recover_stuck_sessions(&db, threshold_ms, now, &HashSet::new())?;
    if recovered.is_empty() {
        println!("No stuck sessions.");
        return Ok(());
    }
    for session in &recovered {
        println!("Recovered {} (generating for {} minutes)", session.id, session.age_ms / 60_000);
    }
    println!("Marked {} session(s) as failed.", recovered.len());
    Ok(())
}
