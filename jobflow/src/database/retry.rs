//! Retry helpers for storage writes.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::repositories::JobRepository;
use crate::domain::Job;
use crate::{Error, Result};

const SQLITE_BUSY_MAX_RETRIES: usize = 12;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 2000;

const UPDATE_BASE_DELAY_MS: u64 = 50;
const UPDATE_MAX_DELAY_MS: u64 = 5000;

/// Exponential delay for retry number `attempt` (0-indexed), capped at `max_ms`,
/// with up to 25% jitter added under the cap.
pub fn jittered_backoff(attempt: usize, base_ms: u64, max_ms: u64) -> Duration {
    let shift = attempt.min(32) as u32;
    let capped_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
    let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
    Duration::from_millis((capped_ms + jitter_ms).min(max_ms))
}

fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    // SQLITE_BUSY / SQLITE_LOCKED
    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Re-run `op` while SQLite reports the database as busy or locked.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let delay = jittered_backoff(
                    attempt,
                    SQLITE_BUSY_BASE_DELAY_MS,
                    SQLITE_BUSY_MAX_DELAY_MS,
                );
                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    SQLITE_BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn update_once<F>(repo: &dyn JobRepository, job_id: &str, apply: &mut F) -> Result<Option<Job>>
where
    F: FnMut(&mut Job) -> Result<bool>,
{
    let mut job = repo.get(job_id).await?;
    if !apply(&mut job)? {
        return Ok(None);
    }
    repo.put(&mut job).await?;
    Ok(Some(job))
}

/// Read-modify-write a job, re-reading and re-applying `apply` when the write
/// loses a revision race or storage is briefly unavailable.
///
/// `apply` returns `false` to leave the record untouched; the call then
/// returns `Ok(None)`. It may run several times and must only depend on the
/// record it is handed.
pub async fn update_job_with_retry<F>(
    repo: &dyn JobRepository,
    job_id: &str,
    max_retries: usize,
    mut apply: F,
) -> Result<Option<Job>>
where
    F: FnMut(&mut Job) -> Result<bool>,
{
    let mut attempt = 0usize;
    loop {
        match update_once(repo, job_id, &mut apply).await {
            Ok(job) => return Ok(job),
            Err(err)
                if (err.is_conflict() || err.is_storage_unavailable()) && attempt < max_retries =>
            {
                let delay = jittered_backoff(attempt, UPDATE_BASE_DELAY_MS, UPDATE_MAX_DELAY_MS);
                if err.is_conflict() {
                    debug!(job_id = %job_id, "Revision conflict, re-reading job ({})", err);
                } else {
                    warn!(
                        job_id = %job_id,
                        "Storage unavailable, retrying in {:?} (attempt {}/{}): {}",
                        delay,
                        attempt + 1,
                        max_retries,
                        err
                    );
                }
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jittered_backoff_is_capped() {
        for attempt in 0..40 {
            let delay = jittered_backoff(attempt, 10, 2000);
            assert!(delay <= Duration::from_millis(2000));
            assert!(delay >= Duration::from_millis(10.min(2000)));
        }
    }

    #[tokio::test]
    async fn test_non_busy_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_sqlite_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::conflict("stale")) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_reapplied() {
        use crate::database::repositories::SqlxJobRepository;
        use crate::domain::{Command, JobKind, JobSpec, JobStatus};
        use std::sync::Arc;

        let repo: Arc<dyn JobRepository> =
            Arc::new(SqlxJobRepository::connect("sqlite::memory:").await.unwrap());
        let mut job = JobSpec::new("counter", Command::shell("true")).into_job(
            JobStatus::Pending,
            JobKind::default(),
            None,
            Duration::from_secs(1),
            chrono::Utc::now(),
        );
        job.metadata.insert("count".into(), 0.into());
        repo.put(&mut job).await.unwrap();

        let bump = |repo: Arc<dyn JobRepository>, id: String| async move {
            update_job_with_retry(repo.as_ref(), &id, 10, |job| {
                let count = job.metadata["count"].as_i64().unwrap_or(0);
                job.metadata.insert("count".into(), (count + 1).into());
                Ok(true)
            })
            .await
        };
        let (a, b) = tokio::join!(
            bump(repo.clone(), job.id.clone()),
            bump(repo.clone(), job.id.clone())
        );
        a.unwrap();
        b.unwrap();

        let stored = repo.get(&job.id).await.unwrap();
        assert_eq!(stored.metadata["count"], 2);
        assert_eq!(stored.revision, 3);
    }

    #[tokio::test]
    async fn test_skipped_update_does_not_write() {
        use crate::database::repositories::SqlxJobRepository;
        use crate::domain::{Command, JobKind, JobSpec, JobStatus};

        let repo = SqlxJobRepository::connect("sqlite::memory:").await.unwrap();
        let mut job = JobSpec::new("noop", Command::shell("true")).into_job(
            JobStatus::Pending,
            JobKind::default(),
            None,
            Duration::from_secs(1),
            chrono::Utc::now(),
        );
        repo.put(&mut job).await.unwrap();

        let result = update_job_with_retry(&repo, &job.id, 3, |_| Ok(false))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(repo.get(&job.id).await.unwrap().revision, 1);
    }
}
