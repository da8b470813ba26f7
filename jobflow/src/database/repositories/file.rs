//! Flat-file job repository.
//!
//! One pretty-printed JSON document per job (`<id>.json`) plus one JSON-lines
//! history file per job (`<id>.history.jsonl`). Records are written to a
//! temporary file and renamed into place, so readers never observe a partial
//! write. A process-wide lock serialises every read-modify-write sequence.
//!
//! There is no index: every listing reads the whole directory, so a paged
//! listing costs one directory scan per page. Full listings scan once.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{JobRepository, JobStats};
use crate::database::time::normalize_job_timestamps;
use crate::domain::{Job, JobFilter, ListCursor, StatusTransition};
use crate::{Error, Result};

const RECORD_EXT: &str = "json";
const HISTORY_SUFFIX: &str = ".history.jsonl";

/// Directory-backed implementation of [`JobRepository`].
pub struct FileJobRepository {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobRepository {
    /// Open (creating if needed) the store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!("File job store opened at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids become file names, so they must not escape the directory.
    fn check_id(id: &str) -> Result<()> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "job id '{}' is not usable as a file name",
                id
            )))
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXT))
    }

    fn history_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, HISTORY_SUFFIX))
    }

    async fn read_record(path: &Path) -> Result<Option<Job>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, id: &str) -> Result<Option<Job>> {
        if Self::check_id(id).is_err() {
            return Ok(None);
        }
        Self::read_record(&self.record_path(id)).await
    }

    async fn write_record(&self, job: &Job) -> Result<()> {
        let path = self.record_path(&job.id);
        let tmp = self.dir.join(format!(".{}.{}.tmp", job.id, RECORD_EXT));
        let bytes = serde_json::to_vec_pretty(job)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append_history(&self, entry: &StatusTransition) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(&entry.job_id))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == RECORD_EXT)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_record {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e @ Error::Serialization(_)) => {
                    warn!("Skipping unreadable job record {}: {}", path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobRepository for FileJobRepository {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn put(&self, job: &mut Job) -> Result<()> {
        Self::check_id(&job.id)?;
        normalize_job_timestamps(job);

        let _guard = self.write_lock.lock().await;
        let existing = self.load(&job.id).await?;

        let previous = match (&existing, job.revision) {
            (None, 0) => None,
            (Some(_), 0) => {
                return Err(Error::conflict(format!("job {} already exists", job.id)));
            }
            (None, _) => {
                return Err(Error::conflict(format!("job {} does not exist", job.id)));
            }
            (Some(stored), expected) if stored.revision != expected => {
                return Err(Error::conflict(format!(
                    "job {} was modified concurrently (revision {} != {})",
                    job.id, expected, stored.revision
                )));
            }
            (Some(stored), _) => Some(stored.status),
        };

        let mut updated = job.clone();
        updated.revision = job.revision.saturating_add(1);

        // History before record: a crash in between leaves an extra log line, never a gap.
        if let Some(entry) = StatusTransition::between(previous, &updated) {
            self.append_history(&entry).await?;
        }
        self.write_record(&updated).await?;

        job.revision = updated.revision;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job> {
        self.load(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_page(
        &self,
        filter: &JobFilter,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| filter.matches(job))
            .filter(|job| after.is_none_or(|cursor| cursor.precedes(job)))
            .collect();
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_matching(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(jobs)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let job = self
            .load(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        if !job.is_terminal() {
            return Err(Error::invalid_state(format!(
                "job {} is {} and cannot be deleted until it finishes",
                id, job.status
            )));
        }

        fs::remove_file(self.record_path(id)).await?;
        match fs::remove_file(self.history_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn statistics(&self) -> Result<JobStats> {
        let mut stats = JobStats::default();
        for job in self.load_all().await? {
            stats.record(job.status, job.is_template(), 1);
        }
        Ok(stats)
    }

    async fn history(&self, id: &str) -> Result<Vec<StatusTransition>> {
        if self.load(id).await?.is_none() {
            return Err(Error::not_found("Job", id));
        }

        let content = match fs::read_to_string(self.history_path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<StatusTransition> = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<StatusTransition>(line) {
                // Left behind by a put whose record write failed and was retried.
                Ok(entry) if entries.last() == Some(&entry) => {}
                Ok(entry) => entries.push(entry),
                // A torn final line from a crash mid-append.
                Err(e) => warn!(job_id = %id, "Skipping malformed history line: {}", e),
            }
        }
        Ok(entries)
    }
}
