// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Operation runtime: every long-running action is enqueued as an
//! [`db::operation::Operation`] row and driven by a dedicated worker
//! pool, keeping request handling free of head-of-line blocking.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::db::{
    self,
    operation::{Kind, Operation},
};

/// Terminal payload a job produces, success or failure
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub message: String,
    pub result_data: Option<String>,
}

pub type JobResult = Result<Completion, Completion>;

/// The work itself: a closure handed a [`Handle`] for progress and
/// cancellation
pub type Job = Box<dyn FnOnce(Handle) -> BoxFuture<'static, JobResult> + Send>;

/// Given to a running job: progress reporting plus the cancellation
/// signal checked between phases
#[derive(Clone)]
pub struct Handle {
    id: String,
    db: db::Database,
    cancel: CancellationToken,
}

impl Handle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Best-effort: a progress write never fails the job
    pub async fn progress(&self, percent: i64, message: &str) {
        if let Err(error) = self.db.set_progress(&self.id, percent, message).await {
            debug!("progress update for {} dropped: {error}", self.id);
        }
    }
}

struct Queued {
    id: String,
    job: Job,
    timeout: Option<Duration>,
}

pub struct Runtime {
    db: db::Database,
    queue: mpsc::Sender<Queued>,
    cancel: CancellationToken,
    sequence: AtomicU64,
}

impl Runtime {
    /// Spawn `workers` consumers over a queue of the given bounded
    /// capacity
    pub fn new(db: db::Database, workers: usize, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        for index in 0..workers.max(1) {
            tokio::spawn(worker(index, db.clone(), rx.clone(), cancel.clone()));
        }

        Arc::new(Self {
            db,
            queue: tx,
            cancel,
            sequence: AtomicU64::new(0),
        })
    }

    /// Insert a queued row and hand the job to the pool. A full
    /// queue is reported to the caller, never dropped silently.
    pub async fn enqueue(
        &self,
        kind: Kind,
        user: &str,
        message: &str,
        timeout: Option<Duration>,
        job: Job,
    ) -> Result<String, Error> {
        let permit = self.queue.try_reserve().map_err(|_| Error::QueueFull)?;

        let id = self.next_id();
        self.db.create_operation(&id, kind, user, message).await?;

        permit.send(Queued {
            id: id.clone(),
            job,
            timeout,
        });

        Ok(id)
    }

    /// Poll until the operation reaches a terminal status or the
    /// deadline passes. Timing out does not stop the operation.
    pub async fn poll(
        &self,
        id: &str,
        max: Duration,
        interval: Duration,
        mut on_status: impl FnMut(&Operation),
    ) -> Result<Operation, Error> {
        let started = tokio::time::Instant::now();

        loop {
            let operation = self.db.get_operation(id).await?;
            on_status(&operation);

            if operation.status.is_terminal() {
                return Ok(operation);
            }

            if started.elapsed() >= max {
                return Err(Error::Timeout(id.to_owned()));
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Signal cancellation to running jobs; each takes effect at its
    /// next checkpoint
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Periodic retention sweep, deleting operations untouched for
    /// `retention`
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, retention: Duration, only_completed: bool) {
        let runtime = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;

                let cutoff = runtime.db.clock().stamp() - retention.as_secs() as i64;
                match runtime.db.sweep_operations(cutoff, only_completed).await {
                    Ok(0) => {}
                    Ok(swept) => info!("retention sweep removed {swept} operation(s)"),
                    Err(error) => error!("retention sweep failed: {error}"),
                }
            }
        });
    }

    fn next_id(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let stamp = self.db.clock().now().timestamp_micros();

        format!("op-{stamp:x}-{sequence:x}")
    }
}

async fn worker(
    index: usize,
    db: db::Database,
    rx: Arc<Mutex<mpsc::Receiver<Queued>>>,
    cancel: CancellationToken,
) {
    loop {
        let queued = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(Queued { id, job, timeout }) = queued else {
            return;
        };

        debug!("worker {index} picked up {id}");

        if let Err(error) = db.start_operation(&id).await {
            error!("could not start operation {id}: {error}");
            continue;
        }

        let handle = Handle {
            id: id.clone(),
            db: db.clone(),
            cancel: cancel.clone(),
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, job(handle)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Completion {
                    message: format!("timed out after {}s", limit.as_secs()),
                    result_data: None,
                }),
            },
            None => job(handle).await,
        };

        let write = match outcome {
            Ok(completion) => {
                db.complete_operation(&id, &completion.message, completion.result_data.as_deref())
                    .await
            }
            Err(completion) => {
                db.fail_operation(&id, &completion.message, completion.result_data.as_deref())
                    .await
            }
        };

        if let Err(error) = write {
            error!("could not finish operation {id}: {error}");
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation queue is full")]
    QueueFull,
    #[error("operation {0} did not finish before the deadline")]
    Timeout(String),
    #[error("registry: {0}")]
    Database(#[from] db::Error),
}

#[cfg(test)]
mod test {
    use futures::FutureExt;

    use crate::db::{operation::Status, Clock};

    use super::*;

    fn job(result: JobResult) -> Job {
        Box::new(move |_handle| async move { result }.boxed())
    }

    #[tokio::test]
    async fn lifecycle_success() {
        let db = db::Database::memory(Clock::system()).await.unwrap();
        let runtime = Runtime::new(db.clone(), 2, 8);

        let id = runtime
            .enqueue(
                Kind::RepoAdd,
                "alice",
                "adding",
                None,
                Box::new(|handle| {
                    async move {
                        handle.progress(45, "halfway").await;
                        Ok(Completion {
                            message: "done".to_owned(),
                            result_data: Some(r#"{"files":42}"#.to_owned()),
                        })
                    }
                    .boxed()
                }),
            )
            .await
            .unwrap();

        let finished = runtime
            .poll(&id, Duration::from_secs(5), Duration::from_millis(10), |_| {})
            .await
            .unwrap();

        assert_eq!(finished.status, Status::Success);
        assert_eq!(finished.progress, 100);
        assert_eq!(finished.result_data.as_deref(), Some(r#"{"files":42}"#));
        assert!(finished.started_at.is_some());
    }

    #[tokio::test]
    async fn failures_are_recorded() {
        let db = db::Database::memory(Clock::system()).await.unwrap();
        let runtime = Runtime::new(db, 1, 8);

        let id = runtime
            .enqueue(
                Kind::RepoSync,
                "alice",
                "",
                None,
                job(Err(Completion {
                    message: "upstream vanished".to_owned(),
                    result_data: None,
                })),
            )
            .await
            .unwrap();

        let finished = runtime
            .poll(&id, Duration::from_secs(5), Duration::from_millis(10), |_| {})
            .await
            .unwrap();

        assert_eq!(finished.status, Status::Failed);
        assert_eq!(finished.message, "upstream vanished");
    }

    #[tokio::test]
    async fn overflow_reports_queue_full() {
        let db = db::Database::memory(Clock::system()).await.unwrap();
        // one worker, capacity one; block the worker to fill the pipe
        let runtime = Runtime::new(db, 1, 1);

        let blocker = || {
            Box::new(|_handle: Handle| {
                async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Completion::default())
                }
                .boxed()
            }) as Job
        };

        // first occupies the worker, second occupies the queue slot
        runtime.enqueue(Kind::PackApply, "a", "", None, blocker()).await.unwrap();

        let mut full = None;
        for _ in 0..8 {
            match runtime.enqueue(Kind::PackApply, "a", "", None, blocker()).await {
                Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(error) => {
                    full = Some(error);
                    break;
                }
            }
        }

        assert!(matches!(full, Some(Error::QueueFull)));
    }

    #[tokio::test]
    async fn poll_timeout_leaves_operation_running() {
        let db = db::Database::memory(Clock::system()).await.unwrap();
        let runtime = Runtime::new(db.clone(), 1, 4);

        let id = runtime
            .enqueue(
                Kind::PackApply,
                "alice",
                "",
                None,
                Box::new(|_handle| {
                    async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(Completion::default())
                    }
                    .boxed()
                }),
            )
            .await
            .unwrap();

        let err = runtime
            .poll(&id, Duration::from_millis(50), Duration::from_millis(10), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(!db.get_operation(&id).await.unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn job_timeout_fails_operation() {
        let db = db::Database::memory(Clock::system()).await.unwrap();
        let runtime = Runtime::new(db, 1, 4);

        let id = runtime
            .enqueue(
                Kind::PackApply,
                "alice",
                "",
                Some(Duration::from_millis(20)),
                Box::new(|_handle| {
                    async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(Completion::default())
                    }
                    .boxed()
                }),
            )
            .await
            .unwrap();

        let finished = runtime
            .poll(&id, Duration::from_secs(5), Duration::from_millis(10), |_| {})
            .await
            .unwrap();

        assert_eq!(finished.status, Status::Failed);
        assert!(finished.message.contains("timed out"));
    }
}
