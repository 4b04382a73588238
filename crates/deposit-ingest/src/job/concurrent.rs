//! Bounded task pool with batched result registration
//!
//! Tasks submitted through [`ConcurrentDepositJob::submit_task`] run on the
//! tokio runtime, at most `worker_count` at a time. Submitters call
//! [`ConcurrentDepositJob::wait_for_queue_capacity`] before each submission,
//! which keeps the number of uncollected tasks under `max_queued_jobs`.
//!
//! Tasks hand results to a [`ResultSink`]. A background registrar drains the
//! results every `flush_interval` and passes each batch to a
//! [`ResultRegistrar`] while holding the flushing lock, so at most one batch
//! is registered at a time. Batches carry no ordering guarantee.
//!
//! Two monotonic flags drive shutdown: `interrupted` is set by the first
//! task failure or by [`ConcurrentDepositJob::cancel_pending`], `done_work`
//! by [`ConcurrentDepositJob::wait_for_completion`]. The registrar exits once
//! either is set and no results are left. A registrar failure is parked in a
//! shared slot and returned from the next call made by the owning job.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

use deposit_common::JobId;

use crate::config::ConcurrencyConfig;
use crate::error::JobError;

/// Persists batches of task results
#[async_trait]
pub trait ResultRegistrar<R>: Send + Sync {
    async fn register_results(&self, results: Vec<R>) -> Result<(), JobError>;
}

/// Cloneable handle tasks use to hand over their results
pub struct ResultSink<R> {
    results: Arc<Mutex<VecDeque<R>>>,
}

impl<R> Clone for ResultSink<R> {
    fn clone(&self) -> Self {
        Self {
            results: self.results.clone(),
        }
    }
}

impl<R> ResultSink<R> {
    pub fn receive_result(&self, result: R) {
        lock(&self.results).push_back(result);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Worker pool state shared by one concurrent job execution
pub struct ConcurrentDepositJob<R> {
    job_id: JobId,
    config: ConcurrencyConfig,
    workers: Arc<Semaphore>,
    in_flight: Mutex<VecDeque<JoinHandle<Result<(), JobError>>>>,
    results: Arc<Mutex<VecDeque<R>>>,
    flushing_lock: Arc<tokio::sync::Mutex<()>>,
    interrupted: Arc<AtomicBool>,
    done_work: Arc<AtomicBool>,
    wake_registrar: Arc<Notify>,
    registrar: Mutex<Option<JoinHandle<()>>>,
    registrar_error: Arc<Mutex<Option<JobError>>>,
}

impl<R: Send + 'static> ConcurrentDepositJob<R> {
    pub fn new(job_id: JobId, config: ConcurrencyConfig) -> Self {
        Self {
            job_id,
            workers: Arc::new(Semaphore::new(config.worker_count)),
            config,
            in_flight: Mutex::new(VecDeque::new()),
            results: Arc::new(Mutex::new(VecDeque::new())),
            flushing_lock: Arc::new(tokio::sync::Mutex::new(())),
            interrupted: Arc::new(AtomicBool::new(false)),
            done_work: Arc::new(AtomicBool::new(false)),
            wake_registrar: Arc::new(Notify::new()),
            registrar: Mutex::new(None),
            registrar_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Submit a task to the worker pool
    ///
    /// Submission is not refused after a failure; callers stop submitting
    /// once a call returns an error.
    pub fn submit_task<F>(&self, task: F)
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let workers = self.workers.clone();
        let interrupted = self.interrupted.clone();
        let handle = tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| JobError::Task("worker pool is closed".to_string()))?;
            let result = task.await;
            if result.is_err() {
                interrupted.store(true, Ordering::SeqCst);
            }
            result
        });
        lock(&self.in_flight).push_back(handle);
    }

    /// Block until fewer than `max_queued_jobs` tasks are uncollected
    ///
    /// Finished tasks found while waiting are collected; the first failed one
    /// is returned as the error.
    pub async fn wait_for_queue_capacity(&self) -> Result<(), JobError> {
        loop {
            self.check_registrar()?;

            let finished = {
                let mut in_flight = lock(&self.in_flight);
                if in_flight.len() < self.config.max_queued_jobs {
                    return Ok(());
                }
                in_flight
                    .iter()
                    .position(JoinHandle::is_finished)
                    .and_then(|index| in_flight.remove(index))
            };

            match finished {
                Some(handle) => self.collect(handle).await?,
                None => sleep(self.config.capacity_poll_interval).await,
            }
        }
    }

    /// Sink for handing results to the registrar
    pub fn result_sink(&self) -> ResultSink<R> {
        ResultSink {
            results: self.results.clone(),
        }
    }

    pub fn receive_result(&self, result: R) {
        lock(&self.results).push_back(result);
    }

    /// Spawn the background loop that registers results in batches
    pub fn start_result_registrar(&self, registrar: Arc<dyn ResultRegistrar<R>>) {
        let mut slot = lock(&self.registrar);
        if slot.is_some() {
            warn!(job_id = %self.job_id, "Result registrar already started");
            return;
        }

        let job_id = self.job_id;
        let flush_interval = self.config.flush_interval;
        let results = self.results.clone();
        let flushing_lock = self.flushing_lock.clone();
        let interrupted = self.interrupted.clone();
        let done_work = self.done_work.clone();
        let wake = self.wake_registrar.clone();
        let error_slot = self.registrar_error.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }

                // Read before draining so results that arrived before the
                // flag was set are part of this flush.
                let finishing =
                    done_work.load(Ordering::SeqCst) || interrupted.load(Ordering::SeqCst);

                let flushed = {
                    let _flushing = flushing_lock.lock().await;
                    let batch: Vec<R> = lock(&results).drain(..).collect();
                    let count = batch.len();
                    let outcome = if count == 0 {
                        Ok(0)
                    } else {
                        registrar.register_results(batch).await.map(|()| count)
                    };
                    // The error is published before the flush lock is released
                    // so a waiter holding the lock next always sees it.
                    outcome.map_err(|e| {
                        error!(job_id = %job_id, error = %e, "Result registration failed");
                        interrupted.store(true, Ordering::SeqCst);
                        *lock(&error_slot) = Some(e);
                    })
                };

                match flushed {
                    Ok(0) => {}
                    Ok(count) => debug!(job_id = %job_id, count, "Registered result batch"),
                    Err(()) => break,
                }

                if finishing && lock(&results).is_empty() {
                    break;
                }
            }

            debug!(job_id = %job_id, "Result registrar stopped");
        }));
    }

    /// Collect every submitted task and wait for all results to be registered
    ///
    /// Sets `done_work` on success. The first task failure is returned and
    /// the remaining tasks are cancelled.
    pub async fn wait_for_completion(&self) -> Result<(), JobError> {
        loop {
            let next = lock(&self.in_flight).pop_front();
            let Some(handle) = next else {
                break;
            };
            if let Err(e) = self.collect(handle).await {
                self.cancel_pending();
                return Err(e);
            }
        }

        if !self.registrar_started() {
            let left = lock(&self.results).len();
            if left > 0 {
                warn!(job_id = %self.job_id, left, "No result registrar, dropping results");
            }
            self.done_work.store(true, Ordering::SeqCst);
            return Ok(());
        }

        self.wake_registrar.notify_one();
        loop {
            self.check_registrar()?;

            let drained = lock(&self.results).is_empty();
            if drained {
                let _flushing = self.flushing_lock.lock().await;
                self.check_registrar()?;
                let still_drained = lock(&self.results).is_empty();
                if still_drained {
                    self.done_work.store(true, Ordering::SeqCst);
                    break;
                }
            } else if self.registrar_finished() {
                return Err(JobError::Task(
                    "Result registrar stopped before all results were registered".to_string(),
                ));
            }

            sleep(self.config.capacity_poll_interval).await;
        }

        debug!(job_id = %self.job_id, "All tasks completed and results registered");
        Ok(())
    }

    /// Wait for the registrar to exit
    ///
    /// Exceeding `registrar_shutdown_timeout` aborts the registrar and is
    /// reported as an interruption.
    pub async fn await_registrar_shutdown(&self) -> Result<(), JobError> {
        let handle = lock(&self.registrar).take();
        let Some(mut handle) = handle else {
            return self.check_registrar();
        };

        self.wake_registrar.notify_one();
        let limit = self.config.registrar_shutdown_timeout;
        match timeout(limit, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                self.interrupted.store(true, Ordering::SeqCst);
                return Err(JobError::Task(format!("Result registrar failed: {}", join_err)));
            }
            Err(_) => {
                handle.abort();
                self.interrupted.store(true, Ordering::SeqCst);
                return Err(JobError::Interrupted(format!(
                    "Result registrar did not stop within {}s",
                    limit.as_secs_f64()
                )));
            }
        }

        self.check_registrar()
    }

    /// Mark the job interrupted and abort every uncollected task
    pub fn cancel_pending(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let pending: Vec<_> = lock(&self.in_flight).drain(..).collect();
        if !pending.is_empty() {
            debug!(job_id = %self.job_id, count = pending.len(), "Cancelling pending tasks");
        }
        for handle in pending {
            handle.abort();
        }
        self.wake_registrar.notify_one();
    }

    /// Number of submitted tasks not yet collected
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done_work.load(Ordering::SeqCst)
    }

    async fn collect(&self, handle: JoinHandle<Result<(), JobError>>) -> Result<(), JobError> {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(JobError::Task(format!("Task panicked: {}", join_err)))
            }
            Err(join_err) => Err(JobError::Task(format!("Task was cancelled: {}", join_err))),
        };
        if outcome.is_err() {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        outcome
    }

    fn check_registrar(&self) -> Result<(), JobError> {
        match lock(&self.registrar_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn registrar_started(&self) -> bool {
        lock(&self.registrar).is_some()
    }

    fn registrar_finished(&self) -> bool {
        lock(&self.registrar)
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
    }
}

impl<R> Drop for ConcurrentDepositJob<R> {
    fn drop(&mut self) {
        for handle in lock(&self.in_flight).drain(..) {
            handle.abort();
        }
        if let Some(handle) = lock(&self.registrar).take() {
            handle.abort();
        }
    }
}
