//! Timestamp helpers for the storage layer.
//!
//! Timestamps are persisted as Unix epoch milliseconds (UTC). Records are
//! truncated to millisecond precision before they are written so that the
//! caller's copy and the stored copy compare equal.

use chrono::{DateTime, TimeZone, Utc};

use crate::domain::{Job, JobKind};

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range clamp to the nearest representable timestamp.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

#[inline]
pub fn opt_to_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(datetime_to_ms)
}

#[inline]
pub fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_datetime)
}

#[inline]
pub fn truncate_to_ms(dt: DateTime<Utc>) -> DateTime<Utc> {
    ms_to_datetime(datetime_to_ms(dt))
}

/// Truncate every timestamp of `job` to millisecond precision.
pub fn normalize_job_timestamps(job: &mut Job) {
    let trunc = |dt: &mut Option<DateTime<Utc>>| *dt = dt.map(truncate_to_ms);

    job.created_at = truncate_to_ms(job.created_at);
    job.updated_at = truncate_to_ms(job.updated_at);
    trunc(&mut job.scheduled_at);
    trunc(&mut job.started_at);
    trunc(&mut job.finished_at);
    trunc(&mut job.next_attempt_at);
    if let JobKind::Template(template) = &mut job.kind {
        trunc(&mut template.last_fired_at);
    }
}
