// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded worker pool for download jobs.
//!
//! `max_workers` long-lived tokio tasks pull jobs from one FIFO channel, so
//! at most that many jobs run at once and the rest wait in order. The pool
//! also remembers which task ids are running or queued; submitting one of
//! those again is refused with [`SubmitOutcome::Existing`], which keeps a
//! task from ever having two runners. [`WorkerPool::submit_after`] instead
//! chains a follow-up job that the same worker runs once the current one
//! for that id is done.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::SubmitOutcome;
use crate::locks::resilient_lock;

/// Concurrent downloads when nothing valid is configured.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// A unit of work. Errors are logged by the worker and go no further.
pub type Job = BoxFuture<'static, Result<()>>;

/// Called with the task id of a job that panicked.
pub type PanicHook = Arc<dyn Fn(&str) + Send + Sync>;

struct QueuedJob {
    task_id: String,
    job: Job,
}

/// Turn a configured worker count into a usable one. Missing, zero and
/// negative values fall back to [`DEFAULT_MAX_WORKERS`].
pub fn normalize_max_workers(configured: Option<i64>) -> usize {
    match configured {
        Some(n) if n > 0 => usize::try_from(n).unwrap_or(DEFAULT_MAX_WORKERS),
        Some(n) => {
            tracing::warn!(
                "Invalid max task count {}, using default {}",
                n,
                DEFAULT_MAX_WORKERS
            );
            DEFAULT_MAX_WORKERS
        }
        None => DEFAULT_MAX_WORKERS,
    }
}

/// Fixed-capacity executor with per-task deduplication.
pub struct WorkerPool {
    max_workers: usize,
    /// Task ids running or waiting in the queue.
    tracked: Arc<Mutex<HashSet<String>>>,
    /// Follow-up jobs to run once the tracked job of the same id finishes.
    deferred: Arc<Mutex<HashMap<String, Job>>>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    busy: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `max_workers` workers. Must be called inside a Tokio runtime.
    pub fn new(max_workers: usize) -> Self {
        Self::start(max_workers, None)
    }

    /// Like [`new`](Self::new), calling `on_panic` for every job that panics.
    pub fn with_panic_hook(max_workers: usize, on_panic: PanicHook) -> Self {
        Self::start(max_workers, Some(on_panic))
    }

    fn start(max_workers: usize, on_panic: Option<PanicHook>) -> Self {
        let max_workers = max_workers.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let tracked = Arc::new(Mutex::new(HashSet::new()));
        let deferred = Arc::new(Mutex::new(HashMap::new()));
        let busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..max_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&queue_rx),
                    Shared {
                        tracked: Arc::clone(&tracked),
                        deferred: Arc::clone(&deferred),
                        busy: Arc::clone(&busy),
                        on_panic: on_panic.clone(),
                    },
                ))
            })
            .collect();

        tracing::debug!("Worker pool started with {} workers", max_workers);

        Self {
            max_workers,
            tracked,
            deferred,
            queue_tx: Mutex::new(Some(queue_tx)),
            busy,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `job` for `task_id`.
    ///
    /// Returns `Existing` without queueing if the task is already running or
    /// queued, `Running` if a worker is free to take it right away, and
    /// `Waiting` if it has to wait for a slot. Fails once the pool is shut down.
    pub fn submit(&self, task_id: &str, job: Job) -> Result<SubmitOutcome> {
        let mut tracked = resilient_lock(&self.tracked);
        if tracked.contains(task_id) {
            return Ok(SubmitOutcome::Existing);
        }
        self.enqueue(&mut tracked, task_id, job)
    }

    /// Queue `job` to run after the task's current job, if it has one.
    ///
    /// When the task is running or queued, `job` replaces any earlier
    /// follow-up and runs on the same worker right after the current job
    /// finishes; the result is `Waiting`. Otherwise this is [`submit`](Self::submit).
    pub fn submit_after(&self, task_id: &str, job: Job) -> Result<SubmitOutcome> {
        let mut tracked = resilient_lock(&self.tracked);
        if !tracked.contains(task_id) {
            return self.enqueue(&mut tracked, task_id, job);
        }
        if resilient_lock(&self.queue_tx).is_none() {
            return Err(anyhow!("Worker pool is shut down"));
        }
        resilient_lock(&self.deferred).insert(task_id.to_string(), job);
        Ok(SubmitOutcome::Waiting)
    }

    fn enqueue(
        &self,
        tracked: &mut HashSet<String>,
        task_id: &str,
        job: Job,
    ) -> Result<SubmitOutcome> {
        let queue_tx = resilient_lock(&self.queue_tx);
        let sender = queue_tx
            .as_ref()
            .ok_or_else(|| anyhow!("Worker pool is shut down"))?;
        sender
            .send(QueuedJob {
                task_id: task_id.to_string(),
                job,
            })
            .map_err(|_| anyhow!("Worker pool is shut down"))?;

        tracked.insert(task_id.to_string());
        // Every tracked task holds a worker or sits ahead in the FIFO, so the
        // new job gets a worker right away iff it is within the first N.
        if tracked.len() <= self.max_workers {
            Ok(SubmitOutcome::Running)
        } else {
            Ok(SubmitOutcome::Waiting)
        }
    }

    /// True if the task is running or queued.
    pub fn is_tracked(&self, task_id: &str) -> bool {
        resilient_lock(&self.tracked).contains(task_id)
    }

    /// Ids of every running or queued task.
    pub fn tracked_ids(&self) -> Vec<String> {
        resilient_lock(&self.tracked).iter().cloned().collect()
    }

    /// Number of jobs executing right now.
    pub fn active_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Stop accepting jobs, let the workers drain the queue and wait for them.
    pub async fn shutdown(&self) {
        resilient_lock(&self.queue_tx).take();
        let workers: Vec<JoinHandle<()>> = resilient_lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker exited abnormally: {}", e);
            }
        }
    }
}

/// State the workers share with the pool.
struct Shared {
    tracked: Arc<Mutex<HashSet<String>>>,
    deferred: Arc<Mutex<HashMap<String, Job>>>,
    busy: Arc<AtomicUsize>,
    on_panic: Option<PanicHook>,
}

async fn worker_loop(
    worker_id: usize,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    shared: Shared,
) {
    loop {
        let next = {
            let mut rx = queue_rx.lock().await;
            rx.recv().await
        };
        let Some(QueuedJob { task_id, mut job }) = next else {
            break;
        };

        shared.busy.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = worker_id, task = %task_id, "Job started");

        loop {
            // Run on its own task so a panic is contained to this job.
            match tokio::spawn(job).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(task = %task_id, "worker run error: {:#}", e),
                Err(e) => {
                    tracing::error!(task = %task_id, "worker job panicked: {}", e);
                    if let Some(on_panic) = &shared.on_panic {
                        on_panic(&task_id);
                    }
                }
            }

            // The follow-up check and the untracking share one critical
            // section with submit_after.
            let mut tracked = resilient_lock(&shared.tracked);
            match resilient_lock(&shared.deferred).remove(&task_id) {
                Some(follow_up) => {
                    tracing::debug!(worker = worker_id, task = %task_id, "Running follow-up job");
                    job = follow_up;
                }
                None => {
                    tracked.remove(&task_id);
                    break;
                }
            }
        }

        shared.busy.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker = worker_id, task = %task_id, "Job finished");
    }

    tracing::debug!(worker = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn gated_job(gate: oneshot::Receiver<()>) -> Job {
        async move {
            let _ = gate.await;
            Ok(())
        }
        .boxed()
    }

    fn panicking_job() -> Job {
        async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(())
        }
        .boxed()
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_normalize_max_workers() {
        assert_eq!(normalize_max_workers(None), DEFAULT_MAX_WORKERS);
        assert_eq!(normalize_max_workers(Some(0)), DEFAULT_MAX_WORKERS);
        assert_eq!(normalize_max_workers(Some(-3)), DEFAULT_MAX_WORKERS);
        assert_eq!(normalize_max_workers(Some(2)), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_running_then_waiting() {
        let pool = WorkerPool::new(1);
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();

        assert_eq!(pool.submit("a", gated_job(rx_a)).unwrap(), SubmitOutcome::Running);
        assert_eq!(pool.submit("b", gated_job(rx_b)).unwrap(), SubmitOutcome::Waiting);
        wait_until(|| pool.active_count() == 1).await;

        tx_a.send(()).unwrap();
        wait_until(|| !pool.is_tracked("a")).await;
        assert!(pool.is_tracked("b"));
        wait_until(|| pool.active_count() == 1).await;

        tx_b.send(()).unwrap();
        wait_until(|| pool.tracked_ids().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_submission_is_existing() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = oneshot::channel();
        let (_tx_dup, rx_dup) = oneshot::channel();

        assert_eq!(pool.submit("a", gated_job(rx)).unwrap(), SubmitOutcome::Running);
        assert_eq!(pool.submit("a", gated_job(rx_dup)).unwrap(), SubmitOutcome::Existing);
        assert_eq!(pool.tracked_ids(), vec!["a".to_string()]);

        // The duplicate did not take the second slot.
        let (tx_b, rx_b) = oneshot::channel();
        assert_eq!(pool.submit("b", gated_job(rx_b)).unwrap(), SubmitOutcome::Running);

        tx.send(()).unwrap();
        tx_b.send(()).unwrap();
        wait_until(|| pool.tracked_ids().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_never_exceeds_cap() {
        let pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            let job = async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed();
            let outcome = pool.submit(&format!("task-{}", i), job).unwrap();
            if i < 3 {
                assert_eq!(outcome, SubmitOutcome::Running);
            }
        }

        wait_until(|| done.load(Ordering::SeqCst) == 20).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_jobs_do_not_kill_workers() {
        let pool = WorkerPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit("err", async { Err(anyhow!("HTTP 500")) }.boxed()).unwrap();
        pool.submit("panic", panicking_job()).unwrap();
        let counter = Arc::clone(&done);
        pool.submit(
            "ok",
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed(),
        )
        .unwrap();

        wait_until(|| done.load(Ordering::SeqCst) == 1).await;
        wait_until(|| pool.tracked_ids().is_empty()).await;

        // Resubmitting a finished id is a fresh run.
        assert_eq!(
            pool.submit("err", async { Ok(()) }.boxed()).unwrap(),
            SubmitOutcome::Running
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panic_hook_sees_task_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let pool = WorkerPool::with_panic_hook(
            1,
            Arc::new(move |task_id: &str| hook_seen.lock().unwrap().push(task_id.to_string())),
        );

        pool.submit("fine", async { Ok(()) }.boxed()).unwrap();
        pool.submit("broken", panicking_job()).unwrap();
        wait_until(|| pool.tracked_ids().is_empty()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["broken".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_after_runs_behind_current_run() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = oneshot::channel();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = Arc::clone(&order);
        let first = async move {
            let _ = rx.await;
            first_order.lock().unwrap().push("first");
            Ok(())
        }
        .boxed();
        assert_eq!(pool.submit("a", first).unwrap(), SubmitOutcome::Running);
        wait_until(|| pool.active_count() == 1).await;

        let second_order = Arc::clone(&order);
        let second = async move {
            second_order.lock().unwrap().push("second");
            Ok(())
        }
        .boxed();
        assert_eq!(pool.submit_after("a", second).unwrap(), SubmitOutcome::Waiting);
        assert_eq!(pool.tracked_ids(), vec!["a".to_string()]);

        tx.send(()).unwrap();
        wait_until(|| pool.tracked_ids().is_empty()).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(pool.active_count(), 0);

        // Nothing to wait behind: a plain submission.
        assert_eq!(
            pool.submit_after("b", async { Ok(()) }.boxed()).unwrap(),
            SubmitOutcome::Running
        );
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(2);
        pool.shutdown().await;
        assert!(pool.submit("late", async { Ok(()) }.boxed()).is_err());
        assert!(!pool.is_tracked("late"));
    }
}
