//! Periodic progress lines for long-running loads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Logs a shared counter at a fixed cadence until stopped.
///
/// Only reads the counter; never slows down whoever increments it. Dropping
/// the reporter cancels the background task.
pub struct ProgressReporter {
    label: String,
    plural: &'static str,
    counter: Arc<AtomicU64>,
    ticks: Arc<AtomicU64>,
    started: Instant,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Spawn the ticking task. The first line is logged one `period` after
    /// start.
    pub fn start(
        label: impl Into<String>,
        plural: &'static str,
        counter: Arc<AtomicU64>,
        period: Duration,
    ) -> Self {
        let label = label.into();
        let ticks = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = oneshot::channel();

        let task_label = label.clone();
        let task_counter = Arc::clone(&counter);
        let task_ticks = Arc::clone(&ticks);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the first immediate tick
            interval.tick().await;

            let mut last = task_counter.load(Ordering::Relaxed);
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = interval.tick() => {
                        let current = task_counter.load(Ordering::Relaxed);
                        let rate = (current.saturating_sub(last)) as f64 / period.as_secs_f64();
                        tracing::info!(
                            "[PROGRESS] {} {} {} processed ({:.0} items/sec)",
                            task_label,
                            current,
                            plural,
                            rate
                        );
                        last = current;
                        task_ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        ProgressReporter {
            label,
            plural,
            counter,
            ticks,
            started: Instant::now(),
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Progress lines emitted so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// The tick count itself, readable after the reporter is gone.
    pub fn tick_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.ticks)
    }

    /// Stop ticking, log the final total and return it.
    pub async fn stop(mut self) -> u64 {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("[PROGRESS] {} reporter task ended abnormally: {}", self.label, e);
            }
        }
        let total = self.counter.load(Ordering::Relaxed);
        tracing::info!(
            "[PROGRESS] {} {} {} processed in {:?}",
            self.label,
            total,
            self.plural,
            self.started.elapsed()
        );
        total
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
