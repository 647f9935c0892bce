//! Fixed-size worker pool over a task queue.
//!
//! Workers pull from a shared queue, run the handler, and keep going after a
//! failed task. A handler asks for early termination by returning
//! [`Flow::Stop`]; the caller's [`CancellationToken`] aborts the run. Failures
//! are counted and recorded in place, never pushed through a channel, so a
//! burst of errors cannot wedge the pool.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use deckhive_adapters::{FetchError, ParseError};
use deckhive_core::{Record, ValidationError};
use deckhive_storage::{BlobStore, StorageError};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stats::{ExtractStats, ProgressReporter};

pub const MAX_PARALLELISM: usize = 1024;

/// What a successful handler wants the pool to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Finish in-flight tasks, dispatch nothing new.
    Stop,
}

/// Per-task failure. Recorded and counted; never aborts the run.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("decoding {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding record {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("{0}")]
    Other(String),
}

impl TaskError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Parse(_) | Self::Decode { .. } => "parse",
            Self::Fetch(_) => "fetch",
            Self::Storage(_) | Self::Encode { .. } => "storage",
            Self::Cancelled => "cancelled",
            Self::Panic(_) => "panic",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("parallel must be 1-1024, got {0}")]
    InvalidParallelism(usize),
    #[error("run cancelled after {} dispatched tasks", .report.dispatched)]
    Cancelled { report: RunReport },
    #[error("listing tasks under {prefix}: {source}")]
    Discovery {
        prefix: String,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// A handler returned [`Flow::Stop`].
    pub stopped: bool,
}

#[derive(Debug, Default)]
struct RunCounters {
    dispatched: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    stopped: AtomicBool,
}

impl RunCounters {
    fn report(&self) -> RunReport {
        RunReport {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct Observers {
    dataset: Arc<str>,
    stats: Option<Arc<ExtractStats>>,
    progress: Option<Arc<ProgressReporter>>,
}

impl Observers {
    fn succeeded(&self) {
        if let Some(stats) = &self.stats {
            stats.record_success();
        }
        if let Some(progress) = &self.progress {
            progress.increment_success();
        }
    }

    fn failed(&self, label: &str, err: &TaskError) {
        warn!(dataset = %self.dataset, task = label, category = err.category(), error = %err, "task failed");
        if let Some(stats) = &self.stats {
            stats.record_categorized_error(label, &self.dataset, err);
        }
        if let Some(progress) = &self.progress {
            progress.increment_failed();
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    parallelism: usize,
    observers: Observers,
}

impl Executor {
    pub fn new(parallelism: usize) -> Result<Self, ExecutorError> {
        if !(1..=MAX_PARALLELISM).contains(&parallelism) {
            return Err(ExecutorError::InvalidParallelism(parallelism));
        }
        Ok(Self {
            parallelism,
            observers: Observers {
                dataset: Arc::from(""),
                stats: None,
                progress: None,
            },
        })
    }

    /// Record every task outcome into `stats`, tagged with `dataset`.
    pub fn with_stats(mut self, dataset: &str, stats: Arc<ExtractStats>) -> Self {
        self.observers.dataset = Arc::from(dataset);
        self.observers.stats = Some(stats);
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.observers.progress = Some(progress);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Queue depth used by the feeding entry points.
    pub fn queue_capacity(&self) -> usize {
        self.parallelism * 2
    }

    /// Drains `tasks` with `parallelism` workers until the queue closes, a
    /// handler stops the run, or `cancel` fires.
    ///
    /// The receiver is dropped before this returns, so a producer still
    /// sending observes a closed channel instead of blocking forever.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        tasks: mpsc::Receiver<T>,
        handler: F,
    ) -> Result<RunReport, ExecutorError>
    where
        T: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, TaskError>> + Send + 'static,
    {
        let queue = Arc::new(Mutex::new(tasks));
        let handler = Arc::new(handler);
        let counters = Arc::new(RunCounters::default());
        // Child token: a handler-requested stop must not cancel the caller.
        let stop = cancel.child_token();

        let mut workers = JoinSet::new();
        for worker in 0..self.parallelism {
            workers.spawn(worker_loop(
                worker,
                Arc::clone(&queue),
                Arc::clone(&handler),
                stop.clone(),
                Arc::clone(&counters),
                self.observers.clone(),
            ));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "executor worker aborted");
            }
        }
        drop(queue);

        let report = counters.report();
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled { report });
        }
        Ok(report)
    }

    /// Like [`Executor::run`], fed from an iterator by a background producer.
    pub async fn run_iter<I, T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        items: I,
        handler: F,
    ) -> Result<RunReport, ExecutorError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, TaskError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity());
        let items = items.into_iter();
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for item in items {
                tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let result = self.run(cancel, rx, handler).await;
        if let Err(err) = feeder.await {
            warn!(error = %err, "task feeder aborted");
        }
        result
    }

    /// Replays every blob under `prefix`: read, `deserialize`, then `handler`.
    ///
    /// Read and decode failures count as failed tasks. Failing to list the
    /// prefix aborts the run.
    pub async fn iter_prefix<R, D, F, Fut>(
        &self,
        cancel: &CancellationToken,
        store: Arc<dyn BlobStore>,
        prefix: &str,
        deserialize: D,
        handler: F,
    ) -> Result<RunReport, ExecutorError>
    where
        R: Send + 'static,
        D: Fn(&str, &[u8]) -> Result<R, TaskError> + Send + Sync + 'static,
        F: Fn(String, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, TaskError>> + Send + 'static,
    {
        let keys = store
            .list_prefix(prefix)
            .await
            .map_err(|source| ExecutorError::Discovery {
                prefix: prefix.to_string(),
                source,
            })?;
        debug!(prefix, keys = keys.len(), "replaying stored items");

        let deserialize = Arc::new(deserialize);
        let handler = Arc::new(handler);
        self.run_iter(cancel, keys, move |key: String| {
            let store = Arc::clone(&store);
            let deserialize = Arc::clone(&deserialize);
            let handler = Arc::clone(&handler);
            async move {
                let bytes = store.read(&key).await?;
                let item = deserialize(&key, &bytes)?;
                handler(key, item).await
            }
        })
        .await
    }
}

/// Decodes a stored JSON record; the default deserializer for replays.
pub fn deserialize_record(key: &str, bytes: &[u8]) -> Result<Record, TaskError> {
    serde_json::from_slice(bytes).map_err(|source| TaskError::Decode {
        key: key.to_string(),
        source,
    })
}

async fn worker_loop<T, F, Fut>(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<T>>>,
    handler: Arc<F>,
    stop: CancellationToken,
    counters: Arc<RunCounters>,
    observers: Observers,
) where
    T: Display + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, TaskError>> + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            task = async { queue.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };
        // A task received after a stop is dropped rather than started.
        if stop.is_cancelled() {
            break;
        }

        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let label = task.to_string();
        let call = {
            let handler = Arc::clone(&handler);
            async move { handler(task).await }
        };
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(TaskError::Panic(panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(flow) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                observers.succeeded();
                if flow == Flow::Stop {
                    debug!(worker, task = %label, "handler requested stop");
                    counters.stopped.store(true, Ordering::Relaxed);
                    stop.cancel();
                }
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                observers.failed(&label, &err);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use deckhive_core::{Entry, Group};
    use deckhive_storage::MemoryBlobStore;
    use tokio::time::timeout;

    #[test]
    fn parallelism_is_validated_up_front() {
        assert!(matches!(Executor::new(0), Err(ExecutorError::InvalidParallelism(0))));
        assert!(matches!(
            Executor::new(2000),
            Err(ExecutorError::InvalidParallelism(2000))
        ));
        assert_eq!(Executor::new(1).expect("min").parallelism(), 1);
        assert_eq!(Executor::new(MAX_PARALLELISM).expect("max").parallelism(), MAX_PARALLELISM);
    }

    async fn seeded_store(count: usize) -> Arc<dyn BlobStore> {
        let store = MemoryBlobStore::new();
        for i in 0..count {
            let record = Record {
                id: format!("deck-{i}"),
                url: format!("https://mtgtop8.example/deck/{i}"),
                source: "mtgtop8".into(),
                release_date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single(),
                groups: vec![Group::new("Main", vec![Entry::new("Island", i as u32 + 1)])],
                ..Default::default()
            };
            let bytes = serde_json::to_vec(&record).expect("encode");
            store
                .write(&format!("magic/mtgtop8/collections/{i:03}.json"), &bytes)
                .await
                .expect("seed");
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn replay_processes_every_item_exactly_once() {
        let store = seeded_store(100).await;
        let seen: Arc<parking_lot::Mutex<HashMap<String, usize>>> = Arc::default();
        let executor = Executor::new(16).expect("executor");

        let recorder = Arc::clone(&seen);
        let report = executor
            .iter_prefix(
                &CancellationToken::new(),
                store,
                "magic/mtgtop8/collections/",
                deserialize_record,
                move |_key, record: Record| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        tokio::task::yield_now().await;
                        *recorder.lock().entry(record.id).or_default() += 1;
                        Ok::<_, TaskError>(Flow::Continue)
                    }
                },
            )
            .await
            .expect("run");

        let seen = seen.lock();
        assert_eq!(report.dispatched, 100);
        assert_eq!(report.succeeded, 100);
        assert_eq!(seen.len(), 100);
        assert!(seen.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn stop_request_bounds_overshoot_by_worker_count() {
        let workers = 4;
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Executor::new(workers).expect("executor");

        let counter = Arc::clone(&calls);
        let report = executor
            .run_iter(&CancellationToken::new(), 0..1_000u32, move |_n| {
                let counter = Arc::clone(&counter);
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    let flow = if call >= 10 { Flow::Stop } else { Flow::Continue };
                    Ok::<_, TaskError>(flow)
                }
            })
            .await
            .expect("stopping is not an error");

        let processed = calls.load(Ordering::SeqCst);
        assert!(report.stopped);
        assert!(
            (10..=10 + workers).contains(&processed),
            "processed {processed} items"
        );
        assert_eq!(report.dispatched, processed);
    }

    #[tokio::test]
    async fn all_tasks_failing_does_not_deadlock() {
        let stats = Arc::new(ExtractStats::new());
        let executor = Executor::new(32)
            .expect("executor")
            .with_stats("yugiohmeta", Arc::clone(&stats));

        let report = timeout(
            Duration::from_secs(10),
            executor.run_iter(&CancellationToken::new(), 0..500u32, |n| async move {
                Err::<Flow, _>(TaskError::Other(format!("item {n} exploded")))
            }),
        )
        .await
        .expect("run finished within the timeout")
        .expect("failures are not fatal");

        assert_eq!(report.failed, 500);
        assert_eq!(report.succeeded, 0);
        assert_eq!(stats.failed(), 500);
        assert_eq!(stats.errors().len(), crate::stats::MAX_RECENT_ERRORS);
    }

    #[tokio::test]
    async fn cancellation_unblocks_idle_and_busy_workers() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<String>(8);
        let executor = Executor::new(32).expect("executor");

        for i in 0..4 {
            tx.send(format!("https://slow.example/{i}")).await.expect("queue");
        }
        let handler_cancel = cancel.clone();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        // `tx` stays alive: idle workers sit on an open, empty queue.
        let result = timeout(
            Duration::from_secs(5),
            executor.run(&cancel, rx, move |_url| {
                let token = handler_cancel.clone();
                async move {
                    token.cancelled().await;
                    Err::<Flow, _>(TaskError::Cancelled)
                }
            }),
        )
        .await
        .expect("run returned within the timeout");

        match result {
            Err(ExecutorError::Cancelled { report }) => {
                assert_eq!(report.dispatched, 4);
                assert_eq!(report.failed, 4);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(tx.is_closed(), "queue receiver is released after the run");
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded_and_run_continues() {
        let stats = Arc::new(ExtractStats::new());
        let executor = Executor::new(2)
            .expect("executor")
            .with_stats("deckbox", Arc::clone(&stats));

        let report = executor
            .run_iter(&CancellationToken::new(), 0..6u32, |n| async move {
                if n == 3 {
                    panic!("parser blew up on {n}");
                }
                Ok::<_, TaskError>(Flow::Continue)
            })
            .await
            .expect("run");

        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, 1);
        let errors = stats.errors();
        assert_eq!(errors[0].category, "panic");
        assert_eq!(errors[0].url, "3");
        assert!(errors[0].error.contains("parser blew up on 3"));
    }

    #[tokio::test]
    async fn unreadable_items_fail_individually() {
        let store = MemoryBlobStore::new();
        store.write("p/good.json", br#"{"id":"1","url":"u","source":"s","release_date":null}"#).await.expect("seed");
        store.write("p/bad.json", b"not json").await.expect("seed");
        let store: Arc<dyn BlobStore> = Arc::new(store);
        let executor = Executor::new(4).expect("executor");

        let report = executor
            .iter_prefix(&CancellationToken::new(), store, "p/", deserialize_record, |_k, _r| async {
                Ok::<_, TaskError>(Flow::Continue)
            })
            .await
            .expect("run");
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }
}
