//! Concurrent worker pool tests
//!
//! Backpressure, result registration and failure handling of
//! `ConcurrentDepositJob` under real task scheduling.

mod helpers;

use async_trait::async_trait;
use deposit_common::JobId;
use deposit_ingest::config::ConcurrencyConfig;
use deposit_ingest::job::{ConcurrentDepositJob, ResultRegistrar};
use deposit_ingest::JobError;
use helpers::init_tracing;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config(worker_count: usize, max_queued_jobs: usize) -> ConcurrencyConfig {
    ConcurrencyConfig {
        worker_count,
        max_queued_jobs,
        flush_interval: Duration::from_millis(5),
        registrar_shutdown_timeout: Duration::from_secs(5),
        capacity_poll_interval: Duration::from_millis(1),
    }
}

/// Records every batch and the peak number of overlapping flushes
#[derive(Default)]
struct CountingRegistrar {
    registered: Mutex<Vec<u32>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    flushes: AtomicUsize,
}

#[async_trait]
impl ResultRegistrar<u32> for CountingRegistrar {
    async fn register_results(&self, results: Vec<u32>) -> Result<(), JobError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.registered.lock().unwrap().extend(results);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_never_exceeds_capacity() {
    init_tracing();
    let pool: ConcurrentDepositJob<u32> = ConcurrentDepositJob::new(JobId::new(), config(2, 3));
    let running = Arc::new(AtomicUsize::new(0));
    let peak_running = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        pool.wait_for_queue_capacity().await.unwrap();
        assert!(pool.in_flight_count() < 3);

        let running = running.clone();
        let peak_running = peak_running.clone();
        pool.submit_task(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(3)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(pool.in_flight_count() <= 3);
    }

    pool.wait_for_completion().await.unwrap();
    assert_eq!(pool.in_flight_count(), 0);
    assert!(peak_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_capacity_wait_surfaces_task_failure() {
    init_tracing();
    let pool: ConcurrentDepositJob<u32> = ConcurrentDepositJob::new(JobId::new(), config(1, 1));

    pool.submit_task(async { Err(JobError::failed("broken file", "f9 could not be read")) });

    let err = tokio::time::timeout(Duration::from_secs(5), pool.wait_for_queue_capacity())
        .await
        .expect("capacity wait should not hang")
        .unwrap_err();
    assert!(err.is_failed());
    assert_eq!(err.to_string(), "broken file");
    assert!(pool.is_interrupted());
}

// ============================================================================
// Result registration
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flushes_are_exclusive_and_complete() {
    init_tracing();
    let pool: ConcurrentDepositJob<u32> = ConcurrentDepositJob::new(JobId::new(), config(4, 8));
    let registrar = Arc::new(CountingRegistrar::default());
    pool.start_result_registrar(registrar.clone());

    for n in 0..64u32 {
        pool.wait_for_queue_capacity().await.unwrap();
        let sink = pool.result_sink();
        pool.submit_task(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(n % 3))).await;
            sink.receive_result(n);
            Ok(())
        });
    }

    pool.wait_for_completion().await.unwrap();
    pool.await_registrar_shutdown().await.unwrap();

    assert!(pool.is_done());
    assert_eq!(registrar.peak.load(Ordering::SeqCst), 1);
    assert!(registrar.flushes.load(Ordering::SeqCst) >= 1);

    let mut registered = registrar.registered.lock().unwrap().clone();
    registered.sort_unstable();
    assert_eq!(registered, (0..64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_results_registered_before_cancellation_are_kept() {
    init_tracing();
    let pool: ConcurrentDepositJob<u32> = ConcurrentDepositJob::new(JobId::new(), config(2, 4));
    let registrar = Arc::new(CountingRegistrar::default());
    pool.start_result_registrar(registrar.clone());

    pool.receive_result(7);
    pool.receive_result(8);
    pool.submit_task(async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    });

    pool.cancel_pending();
    pool.await_registrar_shutdown().await.unwrap();

    assert!(pool.is_interrupted());
    assert_eq!(pool.in_flight_count(), 0);
    assert_eq!(*registrar.registered.lock().unwrap(), vec![7, 8]);
}
