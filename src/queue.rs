//! Asynchronous submission path: dedup queue, bounded worker pool,
//! stalled-job detection, and a dead-letter lane.
//!
//! The queue owns retry/backoff for jobs it processes; the engine does
//! not double-retry queued work. Jobs are ordered by priority (higher
//! first) and FIFO within a priority.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::context::ExecutionContext;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is already processing")]
    AlreadyProcessing,
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(String),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub stalled_check_interval: Duration,
    pub stalled_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            stalled_check_interval: Duration::from_secs(30),
            stalled_timeout: Duration::from_secs(60),
        }
    }
}

/// One queued execution request. Dedup key is the execution id.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub execution_id: String,
    pub context: ExecutionContext,
    pub priority: u8,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ExecutionJob {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            execution_id: context.execution_id.clone(),
            priority: context.priority,
            context,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: ExecutionJob,
    pub reason: String,
    pub attempts_made: u32,
    pub moved_at: DateTime<Utc>,
}

/// Worker-side job execution seam; usually a thin wrapper around
/// [`crate::engine::ExecutionEngine::execute`].
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: ExecutionJob) -> Result<(), EngineError>;
}

struct FnProcessor {
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(ExecutionJob) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>,
}

#[async_trait]
impl JobProcessor for FnProcessor {
    async fn process(&self, job: ExecutionJob) -> Result<(), EngineError> {
        (self.f)(job).await
    }
}

/// Wrap an async closure as a [`JobProcessor`].
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn JobProcessor>
where
    F: Fn(ExecutionJob) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
{
    Arc::new(FnProcessor { f: Box::new(move |job| Box::pin(f(job))) })
}

struct PendingJob {
    priority: u8,
    seq: u64,
    job: ExecutionJob,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then earlier sequence.
        self.priority.cmp(&other.priority).then(other.seq.cmp(&self.seq))
    }
}

struct InProgress {
    job: ExecutionJob,
    started: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<PendingJob>,
    tracked: HashSet<String>,
    processing: HashMap<String, InProgress>,
    dead: Vec<DeadLetter>,
    workers: Vec<JoinHandle<()>>,
    stop: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub dead_lettered: usize,
    pub processed: u64,
    pub failed: u64,
}

/// Dedup-by-id priority queue with a bounded worker pool.
#[derive(Clone)]
pub struct ExecutionQueue {
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    seq: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

impl ExecutionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            seq: Arc::new(AtomicU64::new(0)),
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false when a job with the same execution id is already
    /// tracked (pending or processing).
    pub fn enqueue(&self, job: ExecutionJob) -> bool {
        let mut state = self.lock();
        if !state.tracked.insert(job.execution_id.clone()) {
            tracing::debug!(execution_id = %job.execution_id, "duplicate job ignored");
            return false;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        state.pending.push(PendingJob { priority: job.priority, seq, job });
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Enqueue many; returns how many were accepted after dedup.
    pub fn enqueue_batch(&self, jobs: Vec<ExecutionJob>) -> usize {
        jobs.into_iter().filter(|job| self.enqueue(job.clone())).count()
    }

    /// Spawn `concurrency` workers plus the stalled-job detector.
    pub fn start_processing(
        &self,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.stop.is_some() {
            return Err(QueueError::AlreadyProcessing);
        }
        let stop = CancellationToken::new();
        state.stop = Some(stop.clone());

        for worker_id in 0..concurrency.max(1) {
            let queue = self.clone();
            let processor = Arc::clone(&processor);
            let stop = stop.clone();
            state.workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, processor, stop).await;
            }));
        }

        let queue = self.clone();
        let detector_stop = stop;
        state.workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = detector_stop.cancelled() => break,
                    _ = tokio::time::sleep(queue.config.stalled_check_interval) => {
                        queue.requeue_stalled();
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop workers and wait for them to exit. In-flight jobs finish.
    pub async fn stop_processing(&self) {
        let (stop, workers) = {
            let mut state = self.lock();
            (state.stop.take(), std::mem::take(&mut state.workers))
        };
        if let Some(stop) = stop {
            stop.cancel();
        }
        self.notify.notify_waiters();
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    /// Move a dead letter back onto the primary queue with a fresh
    /// attempt budget.
    pub fn retry_dead_letter(&self, execution_id: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state
            .dead
            .iter()
            .position(|d| d.job.execution_id == execution_id)
            .ok_or_else(|| QueueError::DeadLetterNotFound(execution_id.to_owned()))?;
        let mut letter = state.dead.remove(index);
        letter.job.attempts = 0;
        state.tracked.insert(letter.job.execution_id.clone());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        state.pending.push(PendingJob { priority: letter.job.priority, seq, job: letter.job });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.pending.len(),
            processing: state.processing.len(),
            dead_lettered: state.dead.len(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        processor: Arc<dyn JobProcessor>,
        stop: CancellationToken,
    ) {
        loop {
            if stop.is_cancelled() {
                break;
            }
            let job = {
                let mut state = self.lock();
                match state.pending.pop() {
                    Some(pending) => {
                        let job = pending.job;
                        state.processing.insert(
                            job.execution_id.clone(),
                            InProgress { job: job.clone(), started: Instant::now() },
                        );
                        Some(job)
                    }
                    None => None,
                }
            };

            let Some(job) = job else {
                let notified = self.notify.notified();
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = notified => {}
                }
                continue;
            };

            tracing::debug!(worker_id, execution_id = %job.execution_id, "processing job");
            match processor.process(job.clone()).await {
                Ok(()) => self.complete(&job.execution_id),
                Err(err) => self.handle_failure(job, err),
            }
        }
    }

    fn complete(&self, execution_id: &str) {
        let mut state = self.lock();
        state.processing.remove(execution_id);
        state.tracked.remove(execution_id);
        // Drop any stalled-requeue duplicate.
        if state.pending.iter().any(|p| p.job.execution_id == execution_id) {
            let remaining: Vec<PendingJob> = state
                .pending
                .drain()
                .filter(|p| p.job.execution_id != execution_id)
                .collect();
            state.pending.extend(remaining);
        }
        drop(state);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_failure(&self, mut job: ExecutionJob, err: EngineError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        if state.processing.remove(&job.execution_id).is_none() {
            // Stalled detector already re-queued it; let that copy run.
            return;
        }
        job.attempts += 1;

        if job.attempts > self.config.max_retries {
            tracing::warn!(
                execution_id = %job.execution_id,
                attempts = job.attempts,
                code = err.code(),
                "job moved to dead-letter queue"
            );
            state.tracked.remove(&job.execution_id);
            let attempts_made = job.attempts;
            state.dead.push(DeadLetter {
                job,
                reason: err.to_string(),
                attempts_made,
                moved_at: Utc::now(),
            });
            return;
        }

        let delay = Backoff::exponential(self.config.base_backoff)
            .with_max(self.config.max_backoff)
            .delay(job.attempts as usize);
        drop(state);

        tracing::debug!(
            execution_id = %job.execution_id,
            attempt = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "requeueing failed job after backoff"
        );
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = queue.lock();
            let seq = queue.seq.fetch_add(1, Ordering::Relaxed);
            state.pending.push(PendingJob { priority: job.priority, seq, job });
            drop(state);
            queue.notify.notify_one();
        });
    }

    fn requeue_stalled(&self) {
        let mut state = self.lock();
        let stalled: Vec<String> = state
            .processing
            .iter()
            .filter(|(_, p)| p.started.elapsed() >= self.config.stalled_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for execution_id in stalled {
            if let Some(mut stuck) = state.processing.remove(&execution_id) {
                stuck.job.attempts += 1;
                tracing::warn!(execution_id = %execution_id, "stalled job re-queued");
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                state.pending.push(PendingJob {
                    priority: stuck.job.priority,
                    seq,
                    job: stuck.job,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Decision, Intent, TrustLevel};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn job(execution_id: &str, priority: u8) -> ExecutionJob {
        let ctx = ExecutionContext::builder(
            execution_id,
            Intent::new(format!("intent-{execution_id}"), "acme"),
            Decision::allow(0.9, TrustLevel::High),
        )
        .priority(priority)
        .build();
        ExecutionJob::new(ctx)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            stalled_check_interval: Duration::from_millis(50),
            stalled_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn enqueue_dedups_by_execution_id() {
        let queue = ExecutionQueue::new(QueueConfig::default());
        assert!(queue.enqueue(job("e-1", 0)));
        assert!(!queue.enqueue(job("e-1", 0)));
        assert_eq!(queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn enqueue_batch_reports_accepted_count() {
        let queue = ExecutionQueue::new(QueueConfig::default());
        queue.enqueue(job("e-1", 0));
        let accepted = queue.enqueue_batch(vec![job("e-1", 0), job("e-2", 0), job("e-3", 0)]);
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn workers_process_in_priority_then_fifo_order() {
        let queue = ExecutionQueue::new(fast_config());
        queue.enqueue(job("low-a", 1));
        queue.enqueue(job("low-b", 1));
        queue.enqueue(job("high", 9));

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        let processor = processor_fn(move |job: ExecutionJob| {
            let order = Arc::clone(&order_clone);
            async move {
                order.lock().unwrap().push(job.execution_id.clone());
                Ok(())
            }
        });

        queue.start_processing(processor, 1).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().processed < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all jobs processed");
        queue.stop_processing().await;

        assert_eq!(*order.lock().unwrap(), vec!["high", "low-a", "low-b"]);
    }

    #[tokio::test]
    async fn failed_jobs_retry_with_backoff_then_dead_letter() {
        let queue = ExecutionQueue::new(fast_config());
        queue.enqueue(job("e-1", 0));

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let processor = processor_fn(move |_job| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::handler(None, "always fails"))
            }
        });

        queue.start_processing(processor, 1).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().dead_lettered == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job dead-lettered");
        queue.stop_processing().await;

        // max_retries=2 → 3 attempts total.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts_made, 3);
        assert!(dead[0].reason.contains("always fails"));
    }

    #[tokio::test]
    async fn retry_dead_letter_requeues_with_fresh_budget() {
        let queue = ExecutionQueue::new(fast_config());
        queue.enqueue(job("e-1", 0));

        let succeed_now = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&succeed_now);
        let processor = processor_fn(move |_job| {
            let flag = Arc::clone(&flag);
            async move {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(EngineError::handler(None, "not yet"))
                }
            }
        });

        queue.start_processing(processor, 1).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().dead_lettered == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dead-lettered");

        succeed_now.store(true, Ordering::SeqCst);
        queue.retry_dead_letter("e-1").unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().processed == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("retried job processed");
        queue.stop_processing().await;

        assert!(queue.dead_letters().is_empty());
        assert!(matches!(
            queue.retry_dead_letter("e-1"),
            Err(QueueError::DeadLetterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued() {
        let queue = ExecutionQueue::new(fast_config());
        queue.enqueue(job("e-1", 0));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let processor = processor_fn(move |_job| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // First delivery hangs well past the stalled timeout.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(())
            }
        });

        // Two workers: one gets stuck, the second picks up the re-queued copy.
        queue.start_processing(processor, 2).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.stats().processed == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stalled job recovered by second worker");
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn start_processing_twice_is_an_error() {
        let queue = ExecutionQueue::new(QueueConfig::default());
        let processor = processor_fn(|_job| async { Ok(()) });
        queue.start_processing(Arc::clone(&processor), 1).unwrap();
        assert_eq!(
            queue.start_processing(processor, 1),
            Err(QueueError::AlreadyProcessing)
        );
        queue.stop_processing().await;
    }
}
