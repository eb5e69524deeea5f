//! Small helpers shared across the services.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// One failed item of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of a best-effort batch. Successes are counted and failures are
/// kept so callers and operators can see what went wrong. Items that were
/// not eligible (for example a challenge still waiting for a reply) are only
/// counted as skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_failure(&mut self, id: impl ToString, reason: impl ToString) {
        self.failures.push(BatchFailure {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Parse a provider timestamp. Accepts RFC 3339 (`Z` or offset) and the
/// Postgres text form `2024-05-01 10:11:12.123456+00`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
