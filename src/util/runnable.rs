use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};

/// Drives `runnable` once per `interval`, measured from the start of each run,
/// until it asks to stop or `shutdown` is notified.
///
/// The first run happens one interval after the call. Shutdown only cuts the
/// wait between runs; a run that has started is always allowed to finish.
pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut last_loop_time = Instant::now();
    loop {
        let shutdown_signal = tokio::select! {
            biased;
            _ = shutdown.notified() => true,
            _ = tokio::time::sleep_until(last_loop_time + interval) => false,
        };
        if shutdown_signal {
            break;
        }

        last_loop_time = Instant::now();
        if !runnable.run_once().await {
            break;
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    /// Returns false to stop the loop.
    async fn run_once(&self) -> bool;
    async fn before_shutdown_complete(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        stop_after: usize,
    }

    #[async_trait]
    impl PeriodicRunnable for Counter {
        async fn run_once(&self) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst) + 1 < self.stop_after
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_runnable_declines() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            stop_after: 3,
        });
        let started = Instant::now();

        run_at_fixed_interval(
            counter.clone(),
            Duration::from_millis(100),
            Arc::new(Notify::new()),
        )
        .await;

        assert_eq!(counter.runs.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_the_wait() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            stop_after: usize::MAX,
        });
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_at_fixed_interval(
            counter.clone(),
            Duration::from_millis(100),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.notify_one();
        task.await.unwrap();

        assert_eq!(counter.runs.load(Ordering::SeqCst), 2);
    }
}
