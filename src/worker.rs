use crate::core::{Result, VaultError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Handle of a periodic background task. Dropping it aborts the task.
pub struct BackgroundWorker {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the worker to stop and waits for the current tick to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| VaultError::Storage(format!("{} worker join: {}", self.name, err)))?;
        }
        event!(Level::INFO, worker = self.name, "background worker stopped");
        Ok(())
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Runs `tick` every `interval_ms` (at least 10 ms) until stopped.
pub fn spawn_periodic<F, Fut>(name: &'static str, interval_ms: u64, mut tick: F) -> BackgroundWorker
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let interval_ms = interval_ms.max(10);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(Duration::from_millis(interval_ms)) => {
                    tick().await;
                }
            }
        }
    });
    event!(Level::INFO, worker = name, interval_ms, "background worker started");

    BackgroundWorker {
        name,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let worker = spawn_periodic("test", 10, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_millis(80)).await;
        worker.stop().await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);

        sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
