use std::collections::HashSet;

use anyhow::Result;
use appforge_common::SessionStatus;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::store::SessionDb;

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredSession {
    pub id: Uuid,
    pub age_ms: i64,
}

pub fn stuck_message(age_ms: i64) -> String {
    format!(
        "Session timed out after {} minutes (stuck in generating state)",
        age_ms / 60_000
    )
}

/// Mark every session left in `generating` past `threshold_ms` as failed.
/// Sessions in `running` are skipped; they belong to live orchestrators.
pub fn recover_stuck_sessions(
    db: &SessionDb,
    threshold_ms: i64,
    now: DateTime<Utc>,
    running: &HashSet<Uuid>,
) -> Result<Vec<RecoveredSession>> {
    let mut recovered = Vec::new();
    for session in db.find_stuck_sessions(threshold_ms, now)? {
        if running.contains(&session.id) {
            continue;
        }
        let age_ms = session.age_millis(now);
        if db.finish_session(session.id, SessionStatus::Failed, Some(&stuck_message(age_ms)), None)? {
            warn!(session_id = %session.id, age_ms, "recovered stuck session");
            recovered.push(RecoveredSession { id: session.id, age_ms });
        }
    }
    Ok(recovered)
}
