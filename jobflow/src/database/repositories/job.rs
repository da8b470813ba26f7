//! SQLite job repository.

use async_trait::async_trait;
use sqlx::sqlite::SqliteArguments;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::warn;

use super::{JobRepository, JobStats};
use crate::database::models::{JobDbModel, JobHistoryDbModel, KIND_INSTANCE, KIND_TEMPLATE};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, normalize_job_timestamps};
use crate::database::{self, DbPool, WritePool, begin_immediate};
use crate::domain::{Job, JobFilter, JobStatus, KindFilter, ListCursor, StatusTransition};
use crate::{Error, Result};

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind every column except `id`, in the order used by the INSERT and UPDATE below.
fn bind_columns<'q>(query: Query<'q>, row: &'q JobDbModel) -> Query<'q> {
    query
        .bind(&row.name)
        .bind(&row.kind)
        .bind(&row.parent_id)
        .bind(&row.cron)
        .bind(&row.timezone)
        .bind(row.last_fired_at)
        .bind(&row.command)
        .bind(row.priority)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.scheduled_at)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(&row.retry_policy)
        .bind(row.attempt_count)
        .bind(row.timeout_ms)
        .bind(&row.result)
        .bind(&row.error)
        .bind(&row.tags)
        .bind(&row.metadata)
        .bind(row.cancel_requested)
        .bind(row.next_attempt_at)
        .bind(row.updated_at)
        .bind(row.revision)
}

const INSERT_JOB: &str = r#"
    INSERT INTO job (
        name, kind, parent_id, cron, timezone, last_fired_at, command, priority, status,
        created_at, scheduled_at, started_at, finished_at, retry_policy, attempt_count,
        timeout_ms, result, error, tags, metadata, cancel_requested, next_attempt_at,
        updated_at, revision, id
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPDATE_JOB: &str = r#"
    UPDATE job SET
        name = ?, kind = ?, parent_id = ?, cron = ?, timezone = ?, last_fired_at = ?,
        command = ?, priority = ?, status = ?, created_at = ?, scheduled_at = ?,
        started_at = ?, finished_at = ?, retry_policy = ?, attempt_count = ?,
        timeout_ms = ?, result = ?, error = ?, tags = ?, metadata = ?,
        cancel_requested = ?, next_attempt_at = ?, updated_at = ?, revision = ?
    WHERE id = ?
"#;

/// SQLx implementation of [`JobRepository`].
///
/// Reads go through the shared pool; every write is a `BEGIN IMMEDIATE`
/// transaction on the single-connection write pool.
pub struct SqlxJobRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxJobRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    /// Open `database_url` and bring its schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (pool, write_pool) = database::connect(database_url).await?;
        database::run_migrations(&pool).await?;
        Ok(Self::new(pool, write_pool))
    }

    async fn write_row(conn: &mut SqliteConnection, job: &Job, row: &JobDbModel) -> Result<()> {
        let existing: Option<(String, i64)> =
            sqlx::query_as("SELECT status, revision FROM job WHERE id = ?")
                .bind(&row.id)
                .fetch_optional(&mut *conn)
                .await?;

        let previous = match (existing, job.revision) {
            (None, 0) => {
                bind_columns(sqlx::query(INSERT_JOB), row)
                    .bind(&row.id)
                    .execute(&mut *conn)
                    .await?;
                None
            }
            (Some(_), 0) => {
                return Err(Error::conflict(format!("job {} already exists", job.id)));
            }
            (None, _) => {
                return Err(Error::conflict(format!("job {} does not exist", job.id)));
            }
            (Some((_, stored)), expected) if stored.max(0) as u64 != expected => {
                return Err(Error::conflict(format!(
                    "job {} was modified concurrently (revision {} != {})",
                    job.id, expected, stored
                )));
            }
            (Some((status, _)), _) => {
                bind_columns(sqlx::query(UPDATE_JOB), row)
                    .bind(&row.id)
                    .execute(&mut *conn)
                    .await?;
                JobStatus::parse(&status)
            }
        };

        if let Some(entry) = StatusTransition::between(previous, job) {
            let entry = JobHistoryDbModel::from(&entry);
            sqlx::query(
                "INSERT INTO job_history (job_id, at, from_status, to_status, error) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&entry.job_id)
            .bind(entry.at)
            .bind(&entry.from_status)
            .bind(&entry.to_status)
            .bind(&entry.error)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    async fn put_once(&self, job: &Job, row: &JobDbModel) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        match Self::write_row(&mut tx, job, row).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(job_id = %job.id, "Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn delete_row(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some((status,)) = status else {
            return Err(Error::not_found("Job", id));
        };
        if !JobStatus::parse(&status).is_some_and(|s| s.is_terminal()) {
            return Err(Error::invalid_state(format!(
                "job {} is {} and cannot be deleted until it finishes",
                id, status
            )));
        }
        sqlx::query("DELETE FROM job_history WHERE job_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM job WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_once(&self, id: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        match Self::delete_row(&mut tx, id).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(job_id = %id, "Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn put(&self, job: &mut Job) -> Result<()> {
        normalize_job_timestamps(job);
        let expected = job.revision;
        let mut row = JobDbModel::from_job(job)?;
        row.revision = (expected.saturating_add(1)).min(i64::MAX as u64) as i64;

        {
            let snapshot: &Job = job;
            retry_on_sqlite_busy("put_job", || self.put_once(snapshot, &row)).await?;
        }
        job.revision = row.revision as u64;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?
            .into_job()
    }

    async fn list_page(
        &self,
        filter: &JobFilter,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM job WHERE 1 = 1");

        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut statuses = qb.separated(", ");
            for status in &filter.statuses {
                statuses.push_bind(status.as_str());
            }
            statuses.push_unseparated(")");
        }
        match filter.kind {
            Some(KindFilter::Instance) => {
                qb.push(" AND kind = ").push_bind(KIND_INSTANCE);
            }
            Some(KindFilter::Template) => {
                qb.push(" AND kind = ").push_bind(KIND_TEMPLATE);
            }
            None => {}
        }
        for tag in &filter.tags {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(job.tags) WHERE json_each.value = ")
                .push_bind(tag.clone())
                .push(")");
        }
        if let Some(t) = filter.created_after {
            qb.push(" AND created_at > ").push_bind(datetime_to_ms(t));
        }
        if let Some(t) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(datetime_to_ms(t));
        }
        if let Some(t) = filter.scheduled_before {
            qb.push(" AND scheduled_at IS NOT NULL AND scheduled_at <= ")
                .push_bind(datetime_to_ms(t));
        }
        if let Some(t) = filter.finished_before {
            qb.push(" AND finished_at IS NOT NULL AND finished_at < ")
                .push_bind(datetime_to_ms(t));
        }
        if let Some(parent) = &filter.parent_id {
            qb.push(" AND parent_id = ").push_bind(parent.clone());
        }
        if let Some(cursor) = after {
            let created = datetime_to_ms(cursor.created_at);
            qb.push(" AND (created_at > ")
                .push_bind(created)
                .push(" OR (created_at = ")
                .push_bind(created)
                .push(" AND id > ")
                .push_bind(cursor.id.clone())
                .push("))");
        }
        qb.push(" ORDER BY created_at, id LIMIT ")
            .push_bind(limit.min(i64::MAX as usize) as i64);

        let rows = qb
            .build_query_as::<JobDbModel>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobDbModel::into_job).collect()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_job", || self.delete_once(id)).await
    }

    async fn statistics(&self) -> Result<JobStats> {
        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT kind, status, COUNT(*) FROM job GROUP BY kind, status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = JobStats::default();
        for (kind, status, count) in rows {
            match JobStatus::parse(&status) {
                Some(status) => {
                    stats.record(status, kind == KIND_TEMPLATE, count.max(0) as u64);
                }
                None => warn!("Ignoring {} jobs with unknown status '{}'", count, status),
            }
        }
        Ok(stats)
    }

    async fn history(&self, id: &str) -> Result<Vec<StatusTransition>> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(Error::not_found("Job", id));
        }

        let rows = sqlx::query_as::<_, JobHistoryDbModel>(
            "SELECT job_id, at, from_status, to_status, error FROM job_history WHERE job_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(JobHistoryDbModel::into_transition)
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        self.write_pool.close().await;
    }
}
