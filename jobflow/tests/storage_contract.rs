//! Storage contract shared by the SQLite and file backends.
//!
//! Every check runs against both repositories so the engine can rely on the
//! same compare-and-swap, history and listing behaviour regardless of backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use tempfile::TempDir;

use jobflow::database::repositories::{
    FileJobRepository, JobRepository, SqlxJobRepository, list_all, list_stream,
};
use jobflow::{Command, Error, Job, JobFilter, JobKind, JobSpec, JobStatus, KindFilter, Priority};

fn t(sec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + sec, 0).unwrap()
}

fn job(id: &str, created_sec: i64) -> Job {
    JobSpec::new(id, Command::shell("echo hi"))
        .with_id(id)
        .with_priority(Priority::High)
        .with_tags(["nightly"])
        .into_job(
            JobStatus::Pending,
            JobKind::default(),
            None,
            Duration::from_secs(5),
            t(created_sec),
        )
}

async fn sqlite() -> Arc<dyn JobRepository> {
    Arc::new(
        SqlxJobRepository::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory database"),
    )
}

async fn file() -> (Arc<dyn JobRepository>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let repo = FileJobRepository::open(dir.path())
        .await
        .expect("Failed to open job directory");
    (Arc::new(repo), dir)
}

async fn put_get_roundtrip(repo: Arc<dyn JobRepository>) {
    let mut stored = job("alpha", 0);
    repo.put(&mut stored).await.unwrap();
    assert_eq!(stored.revision, 1);

    let loaded = repo.get("alpha").await.unwrap();
    assert_eq!(loaded, stored);
    assert_eq!(loaded.priority, Priority::High);
    assert_eq!(loaded.timeout, Duration::from_secs(5));
    assert_eq!(loaded.tags, vec!["nightly".to_string()]);

    let err = repo.get("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

async fn compare_and_swap(repo: Arc<dyn JobRepository>) {
    let mut first = job("cas", 0);
    repo.put(&mut first).await.unwrap();

    // Inserting the same id again is a conflict.
    let mut duplicate = job("cas", 1);
    assert!(repo.put(&mut duplicate).await.unwrap_err().is_conflict());

    let mut a = repo.get("cas").await.unwrap();
    let mut b = repo.get("cas").await.unwrap();

    a.mark_running(t(2)).unwrap();
    repo.put(&mut a).await.unwrap();
    assert_eq!(a.revision, 2);

    // `b` still carries revision 1.
    b.mark_cancelled(None, None, t(3)).unwrap();
    assert!(repo.put(&mut b).await.unwrap_err().is_conflict());
    assert_eq!(repo.get("cas").await.unwrap().status, JobStatus::Running);

    // Updating a record that was never inserted is a conflict too.
    let mut ghost = job("ghost", 0);
    ghost.revision = 4;
    assert!(repo.put(&mut ghost).await.unwrap_err().is_conflict());
}

async fn history_follows_status(repo: Arc<dyn JobRepository>) {
    let mut stored = job("hist", 0);
    repo.put(&mut stored).await.unwrap();

    stored.mark_running(t(1)).unwrap();
    repo.put(&mut stored).await.unwrap();
    stored.mark_retry_pending("boom", t(5), t(2)).unwrap();
    repo.put(&mut stored).await.unwrap();

    // Same status, no new entry.
    stored.metadata.insert("note".into(), "edited".into());
    repo.put(&mut stored).await.unwrap();

    let history = repo.history("hist").await.unwrap();
    let steps: Vec<_> = history.iter().map(|h| (h.from, h.to)).collect();
    assert_eq!(
        steps,
        vec![
            (None, JobStatus::Pending),
            (Some(JobStatus::Pending), JobStatus::Running),
            (Some(JobStatus::Running), JobStatus::RetryPending),
        ]
    );
    assert_eq!(history[2].error.as_deref(), Some("boom"));
}

async fn listing_and_paging(repo: Arc<dyn JobRepository>) {
    for i in 0..7 {
        let mut j = job(&format!("job-{}", i), i);
        if i % 2 == 0 {
            j.mark_cancelled(None, None, t(i)).unwrap();
        }
        repo.put(&mut j).await.unwrap();
    }

    let all = list_all(&repo, JobFilter::new()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["job-0", "job-1", "job-2", "job-3", "job-4", "job-5", "job-6"]
    );

    // Small pages must not skip or repeat records.
    let paged: Vec<Job> = list_stream(repo.clone(), JobFilter::new(), 2)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(paged.len(), 7);
    assert_eq!(paged, all);

    let cancelled = list_all(&repo, JobFilter::new().with_status(JobStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 4);

    let templates = list_all(&repo, JobFilter::new().with_kind(KindFilter::Template))
        .await
        .unwrap();
    assert!(templates.is_empty());

    let stats = repo.statistics().await.unwrap();
    assert_eq!(stats.cancelled, 4);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.total(), 7);
}

async fn delete_only_finished(repo: Arc<dyn JobRepository>) {
    let mut j = job("del", 0);
    repo.put(&mut j).await.unwrap();

    let err = repo.delete("del").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    j.mark_cancelled(None, None, t(1)).unwrap();
    repo.put(&mut j).await.unwrap();
    repo.delete("del").await.unwrap();

    assert!(repo.get("del").await.unwrap_err().is_not_found());
    assert!(repo.history("del").await.unwrap_err().is_not_found());
    assert!(repo.delete("del").await.unwrap_err().is_not_found());
}

mod sqlite_backend {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        put_get_roundtrip(sqlite().await).await;
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        compare_and_swap(sqlite().await).await;
    }

    #[tokio::test]
    async fn test_history_follows_status() {
        history_follows_status(sqlite().await).await;
    }

    #[tokio::test]
    async fn test_listing_and_paging() {
        listing_and_paging(sqlite().await).await;
    }

    #[tokio::test]
    async fn test_delete_only_finished() {
        delete_only_finished(sqlite().await).await;
    }

    #[tokio::test]
    async fn test_state_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display());

        let repo = SqlxJobRepository::connect(&url).await.unwrap();
        let mut j = job("durable", 0);
        repo.put(&mut j).await.unwrap();
        repo.close().await;

        let reopened = SqlxJobRepository::connect(&url).await.unwrap();
        assert_eq!(reopened.get("durable").await.unwrap(), j);
        assert_eq!(reopened.history("durable").await.unwrap().len(), 1);
        reopened.close().await;
    }
}

mod file_backend {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (repo, _dir) = file().await;
        put_get_roundtrip(repo).await;
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (repo, _dir) = file().await;
        compare_and_swap(repo).await;
    }

    #[tokio::test]
    async fn test_history_follows_status() {
        let (repo, _dir) = file().await;
        history_follows_status(repo).await;
    }

    #[tokio::test]
    async fn test_listing_and_paging() {
        let (repo, _dir) = file().await;
        listing_and_paging(repo).await;
    }

    #[tokio::test]
    async fn test_delete_only_finished() {
        let (repo, _dir) = file().await;
        delete_only_finished(repo).await;
    }
}
