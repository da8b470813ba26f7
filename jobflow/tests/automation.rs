//! End-to-end tests through the `AutomationSystem` façade.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use jobflow::database::repositories::{FileJobRepository, JobRepository};
use jobflow::metrics::HealthStatus;
use jobflow::scheduler::SchedulerConfig;
use jobflow::{
    AutomationSystem, Backoff, Command, EngineConfig, Error, Job, JobFilter, JobKind, JobSpec,
    JobStatus, KindFilter, Priority, RetryPolicy, StorageConfig, SystemBuilder,
};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// A builder with the `echo` function most tests run.
fn builder(config: EngineConfig) -> SystemBuilder {
    AutomationSystem::builder(config)
        .register_function("echo", |p: Map<String, Value>| async move {
            Ok::<_, anyhow::Error>(Value::Object(p))
        })
}

async fn start() -> AutomationSystem {
    builder(EngineConfig::in_memory())
        .start()
        .await
        .expect("Failed to start automation system")
}

async fn wait_for(
    system: &AutomationSystem,
    id: &str,
    done: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let job = system.get_job(id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for job {} (status {})",
            id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until_finished(system: &AutomationSystem, id: &str) -> Job {
    wait_for(system, id, |job| job.is_terminal()).await
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(unix)]
mod shell_jobs {
    use super::*;

    #[tokio::test]
    async fn test_successful_job_completes_once() {
        let system = start().await;

        let job = system
            .submit(
                JobSpec::new("echo-test", Command::shell("true"))
                    .with_priority(Priority::High)
                    .with_timeout(Duration::from_secs(5))
                    .with_retry_policy(RetryPolicy::none()),
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt_count, 1);
        assert!(job.error.is_none());
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_job_retries_then_fails() {
        let system = start().await;

        let job = system
            .submit(
                JobSpec::new("always-fails", Command::shell("false"))
                    .with_retry_policy(RetryPolicy::new(1, Backoff::fixed(Duration::ZERO))),
            )
            .await
            .unwrap();

        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 2);
        assert!(job.error.as_deref().is_some_and(|e| !e.is_empty()));

        let statuses: Vec<JobStatus> = system
            .history(&job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.to)
            .collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::RetryPending,
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Failed,
            ]
        );

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_attempt_over_timeout_fails() {
        let system = start().await;

        let job = system
            .submit(
                JobSpec::new("too-slow", Command::shell("sleep 5"))
                    .with_timeout(Duration::from_millis(200))
                    .with_retry_policy(RetryPolicy::none()),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().is_some_and(|e| e.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(4));

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_job_runs_after_delay() {
        let system = start().await;

        let job = system
            .schedule_delayed(
                JobSpec::new("later", Command::shell("echo later")),
                Duration::from_millis(150),
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::PendingAtTime);
        assert!(job.scheduled_at.is_some());

        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!("later")));
        assert!(job.started_at >= job.scheduled_at);

        system.shutdown().await.unwrap();
    }
}

mod function_jobs {
    use super::*;

    #[tokio::test]
    async fn test_registered_function_result_is_stored() {
        let system = AutomationSystem::builder(EngineConfig::in_memory())
            .register_function("add", |p: Map<String, Value>| async move {
                let a = p.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = p.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok::<_, anyhow::Error>(json!(a + b))
            })
            .start()
            .await
            .unwrap();

        let job = system
            .submit(JobSpec::new(
                "sum",
                Command::function("add", params(json!({"a": 2, "b": 40}))),
            ))
            .await
            .unwrap();

        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!(42)));

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_function_fails_the_job() {
        let system = start().await;

        let job = system
            .submit(
                JobSpec::new("missing", Command::function("nope", Map::new()))
                    .with_retry_policy(RetryPolicy::none()),
            )
            .await
            .unwrap();

        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().is_some_and(|e| e.contains("nope")));

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_functions_registered_after_start_are_callable() {
        let system = start().await;
        system
            .functions()
            .register("late", |_| async { Ok::<_, anyhow::Error>(json!("registered late")) });

        let job = system
            .submit(JobSpec::new("late", Command::function("late", Map::new())))
            .await
            .unwrap();
        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.result, Some(json!("registered late")));

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_higher_priority_runs_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorded = order.clone();

        let system = AutomationSystem::builder(EngineConfig::in_memory().with_max_workers(1))
            .register_function("block", |_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, anyhow::Error>(Value::Null)
            })
            .register_function("record", move |p: Map<String, Value>| {
                let recorded = recorded.clone();
                async move {
                    let label = p.get("label").cloned().unwrap_or(Value::Null);
                    recorded.lock().push(label);
                    Ok::<_, anyhow::Error>(Value::Null)
                }
            })
            .start()
            .await
            .unwrap();

        system
            .submit(JobSpec::new("block", Command::function("block", Map::new())))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("urgent", Priority::Urgent),
        ] {
            let job = system
                .submit(
                    JobSpec::new(
                        label,
                        Command::function("record", params(json!({"label": label}))),
                    )
                    .with_priority(priority),
                )
                .await
                .unwrap();
            ids.push(job.id);
        }

        for id in &ids {
            wait_until_finished(&system, id).await;
        }
        assert_eq!(
            *order.lock(),
            vec![json!("urgent"), json!("normal"), json!("low")]
        );

        system.shutdown().await.unwrap();
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancel_waiting_job() {
        let system = start().await;

        let job = system
            .schedule(
                JobSpec::new("tomorrow", Command::function("echo", Map::new())),
                Utc::now() + chrono::Duration::hours(24),
            )
            .await
            .unwrap();

        let cancelled = system.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());

        let err = system.cancel(&job.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = system.cancel("does-not-exist").await.unwrap_err();
        assert!(err.is_not_found());

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_job_leaves_queue() {
        let system = builder(EngineConfig::in_memory().with_max_workers(1))
            .register_function("block", |_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, anyhow::Error>(Value::Null)
            })
            .start()
            .await
            .unwrap();

        let blocker = system
            .submit(JobSpec::new("block", Command::function("block", Map::new())))
            .await
            .unwrap();
        wait_for(&system, &blocker.id, |j| j.status == JobStatus::Running).await;

        let queued = system
            .submit(JobSpec::new("queued", Command::function("echo", Map::new())))
            .await
            .unwrap();
        assert_eq!(queued.status, JobStatus::Pending);
        assert_eq!(system.queue_depth(), 1);

        let cancelled = system.cancel(&queued.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.attempt_count, 0);
        assert_eq!(system.queue_depth(), 0);

        // The freed worker never picks it up.
        let blocker = wait_until_finished(&system, &blocker.id).await;
        assert_eq!(blocker.status, JobStatus::Completed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = system.get_job(&queued.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempt_count, 0);
        assert!(job.started_at.is_none());

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_running_job_stops_retries() {
        let system = AutomationSystem::builder(EngineConfig::in_memory())
            .register_function("slow_fail", |_| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Err::<Value, _>(anyhow::anyhow!("still broken"))
            })
            .start()
            .await
            .unwrap();

        let job = system
            .submit(
                JobSpec::new("flaky", Command::function("slow_fail", Map::new()))
                    .with_retry_policy(RetryPolicy::new(5, Backoff::fixed(Duration::ZERO))),
            )
            .await
            .unwrap();

        wait_for(&system, &job.id, |j| j.status == JobStatus::Running).await;
        let requested = system.cancel(&job.id).await.unwrap();
        assert_eq!(requested.status, JobStatus::Running);
        assert!(requested.cancel_requested);

        let job = wait_until_finished(&system, &job.id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempt_count, 1);
        assert!(job.error.as_deref().is_some_and(|e| e.contains("still broken")));

        system.shutdown().await.unwrap();
    }
}

mod recurrence {
    use super::*;

    #[tokio::test]
    async fn test_template_spawns_instances() {
        let system = start().await;

        let template = system
            .schedule_recurring(
                JobSpec::new("every-second", Command::function("echo", Map::new())),
                "* * * * * *",
            )
            .await
            .unwrap();
        assert!(template.is_template());
        assert_eq!(template.status, JobStatus::PendingAtTime);

        let deadline = Instant::now() + WAIT_LIMIT;
        let instance = loop {
            let instances = system
                .list_jobs(
                    JobFilter::new()
                        .with_parent(template.id.clone())
                        .with_status(JobStatus::Completed),
                )
                .await
                .unwrap();
            if let Some(first) = instances.into_iter().next() {
                break first;
            }
            assert!(Instant::now() < deadline, "no instance completed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        assert!(matches!(instance.kind, JobKind::Instance { .. }));
        assert_eq!(instance.parent_id(), Some(template.id.as_str()));

        let template = system.get_job(&template.id).await.unwrap();
        assert_eq!(template.status, JobStatus::PendingAtTime);
        assert!(template.template().is_some_and(|t| t.last_fired_at.is_some()));

        // Cancelling the template stops future fires.
        let cancelled = system.cancel(&template.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        let templates = system
            .list_jobs(JobFilter::new().with_kind(KindFilter::Template))
            .await
            .unwrap();
        assert_eq!(templates.len(), 1);

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_recurrence_is_rejected() {
        let system = start().await;

        let spec = JobSpec::new("bad", Command::function("echo", Map::new()));
        let err = system
            .schedule_recurring(spec.clone(), "not a cron")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = system
            .schedule_recurring(spec.with_timezone("Mars/Olympus"), "0 * * * *")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(system.list_jobs(JobFilter::new()).await.unwrap().is_empty());
        system.shutdown().await.unwrap();
    }
}

mod submission {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_id_is_a_conflict() {
        let system = AutomationSystem::start(
            EngineConfig::in_memory().with_scheduler(SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            }),
        )
        .await
        .unwrap();

        let spec = JobSpec::new("once", Command::function("echo", Map::new())).with_id("nightly-1");
        system
            .schedule(spec.clone(), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let err = system.submit(spec).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(system.statistics().await.unwrap().total(), 1);

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_without_storing() {
        let system = start().await;

        let err = system
            .submit(JobSpec::new("  ", Command::shell("true")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = system
            .submit(JobSpec::new("no-url", Command::http("GET", "")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert_eq!(system.statistics().await.unwrap().total(), 0);
        system.shutdown().await.unwrap();
    }
}

mod http_jobs {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::get};

    async fn serve() -> String {
        let app = Router::new()
            .route("/ping", get(|| async { Json(json!({"pong": true})) }))
            .route(
                "/broken",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_job_stores_response() {
        let base = serve().await;
        let system = start().await;

        let ok = system
            .submit(JobSpec::new("ping", Command::http("GET", format!("{}/ping", base))))
            .await
            .unwrap();
        let broken = system
            .submit(
                JobSpec::new("broken", Command::http("GET", format!("{}/broken", base)))
                    .with_retry_policy(RetryPolicy::none()),
            )
            .await
            .unwrap();

        let ok = wait_until_finished(&system, &ok.id).await;
        assert_eq!(ok.status, JobStatus::Completed);
        let result = ok.result.unwrap();
        assert_eq!(result["status"], json!(200));
        assert_eq!(result["body"]["pong"], json!(true));

        let broken = wait_until_finished(&system, &broken.id).await;
        assert_eq!(broken.status, JobStatus::Failed);
        assert!(
            broken
                .error
                .as_deref()
                .is_some_and(|e| e.contains("500") && e.contains("upstream exploded"))
        );

        system.shutdown().await.unwrap();
    }
}

mod recovery {
    use super::*;

    fn stored(name: &str, retry_policy: RetryPolicy) -> Job {
        JobSpec::new(name, Command::function("echo", Map::new()))
            .with_id(name)
            .with_retry_policy(retry_policy)
            .into_job(
                JobStatus::Pending,
                JobKind::default(),
                None,
                Duration::from_secs(5),
                Utc::now(),
            )
    }

    #[tokio::test]
    async fn test_restart_resumes_unfinished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn JobRepository> =
            Arc::new(FileJobRepository::open(dir.path()).await.unwrap());
        let now = Utc::now();

        // Left behind by a previous process.
        let mut queued = stored("queued", RetryPolicy::none());
        repo.put(&mut queued).await.unwrap();

        let mut interrupted = stored(
            "interrupted",
            RetryPolicy::new(2, Backoff::fixed(Duration::ZERO)),
        );
        repo.put(&mut interrupted).await.unwrap();
        interrupted.mark_running(now).unwrap();
        repo.put(&mut interrupted).await.unwrap();

        let mut exhausted = stored("exhausted", RetryPolicy::none());
        repo.put(&mut exhausted).await.unwrap();
        exhausted.mark_running(now).unwrap();
        repo.put(&mut exhausted).await.unwrap();

        let mut backing_off = stored(
            "backing-off",
            RetryPolicy::new(2, Backoff::fixed(Duration::ZERO)),
        );
        repo.put(&mut backing_off).await.unwrap();
        backing_off.mark_running(now).unwrap();
        repo.put(&mut backing_off).await.unwrap();
        backing_off
            .mark_retry_pending("transient", now - chrono::Duration::seconds(1), now)
            .unwrap();
        repo.put(&mut backing_off).await.unwrap();

        let config = EngineConfig::in_memory().with_storage(StorageConfig::File {
            directory: dir.path().to_path_buf(),
        });
        let system = builder(config)
            .with_repository(repo.clone())
            .start()
            .await
            .unwrap();

        let queued = wait_until_finished(&system, "queued").await;
        assert_eq!(queued.status, JobStatus::Completed);

        let interrupted = wait_until_finished(&system, "interrupted").await;
        assert_eq!(interrupted.status, JobStatus::Completed);
        assert_eq!(interrupted.attempt_count, 2);

        let exhausted = wait_until_finished(&system, "exhausted").await;
        assert_eq!(exhausted.status, JobStatus::Failed);
        assert!(exhausted.error.as_deref().is_some_and(|e| e.contains("restart")));

        let backing_off = wait_until_finished(&system, "backing-off").await;
        assert_eq!(backing_off.status, JobStatus::Completed);
        assert_eq!(backing_off.attempt_count, 2);

        system.shutdown().await.unwrap();

        // An injected repository outlives the system.
        assert_eq!(repo.statistics().await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn test_jobs_survive_restart_on_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::in_memory().with_storage(StorageConfig::Sqlite {
            database_url: format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display()),
        });

        let system = AutomationSystem::start(config.clone()).await.unwrap();
        let scheduled = system
            .schedule(
                JobSpec::new("next-week", Command::function("echo", Map::new())),
                Utc::now() + chrono::Duration::days(7),
            )
            .await
            .unwrap();
        system.shutdown().await.unwrap();

        let system = AutomationSystem::start(config).await.unwrap();
        let job = system.get_job(&scheduled.id).await.unwrap();
        assert_eq!(job.status, JobStatus::PendingAtTime);
        assert_eq!(job.scheduled_at, scheduled.scheduled_at);
        system.shutdown().await.unwrap();
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_health_report() {
        let system = start().await;

        let health = system.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        for component in ["storage", "queue", "scheduler", "executor", "failure_rate"] {
            assert!(
                health.component(component).is_some(),
                "missing component {}",
                component
            );
        }

        system.shutdown().await.unwrap();
        let health = system.health().await;
        assert_ne!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_listing_history_and_purge() {
        let system = start().await;

        let mut ids = Vec::new();
        for i in 0..3 {
            let job = system
                .submit(
                    JobSpec::new(format!("job-{}", i), Command::function("echo", Map::new()))
                        .with_tags(["batch"]),
                )
                .await
                .unwrap();
            ids.push(job.id);
        }
        for id in &ids {
            wait_until_finished(&system, id).await;
        }

        let batch = system
            .list_jobs(JobFilter::new().with_tag("batch"))
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let stats = system.statistics().await.unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(system.executor_stats().completed, 3);
        assert_eq!(system.queue_depth(), 0);

        system.delete_job(&ids[0]).await.unwrap();
        assert!(system.get_job(&ids[0]).await.unwrap_err().is_not_found());

        // Let `finished_at` fall strictly before the cutoff.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(system.purge_finished(Duration::ZERO).await.unwrap(), 2);
        assert_eq!(system.statistics().await.unwrap().total(), 0);

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_rejected() {
        let system = start().await;
        system.shutdown().await.unwrap();
        // Idempotent.
        system.shutdown().await.unwrap();
        assert!(!system.is_running());

        let err = system
            .submit(JobSpec::new("late", Command::function("echo", Map::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = system.cancel("anything").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
