use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{ChainError, ChainResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The main sequence: a single-consumer queue through which every mutation
/// of authoritative state passes. Tasks run strictly in enqueue order and
/// the next task starts only after the previous one fully resolves.
pub struct Sequence {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    warn_threshold: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sequence {
    pub fn new(max_pending: usize, warn_threshold: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("sequence drained");
        });
        Self {
            sender,
            pending,
            max_pending,
            warn_threshold,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a task and await its result. Rejects when the backlog is at
    /// capacity or the sequence has shut down.
    pub async fn add<F, T>(&self, label: &'static str, task: F) -> ChainResult<T>
    where
        F: Future<Output = ChainResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let backlog = self.pending.load(Ordering::SeqCst);
        if backlog >= self.max_pending {
            return Err(ChainError::Sequence(format!(
                "sequence backlog full ({backlog} pending), rejecting {label}"
            )));
        }
        if backlog + 1 >= self.warn_threshold {
            warn!(backlog = backlog + 1, label, "sequence backlog is high");
        }
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = result_tx.send(task.await);
        });
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ChainError::Sequence(format!(
                "sequence shut down, rejecting {label}"
            )));
        }
        result_rx
            .await
            .map_err(|_| ChainError::Sequence(format!("sequence task {label} was cancelled")))?
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks. Queued tasks that never ran resolve with a
    /// cancellation error on their callers' side.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_in_enqueue_order() {
        let sequence = Arc::new(Sequence::new(64, 32));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for index in 0..8u32 {
            let sequence = sequence.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                sequence
                    .add("test", async move {
                        // A later task must observe every earlier effect.
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        log.lock().push(index);
                        Ok(())
                    })
                    .await
            }));
            // Enqueue order is fixed by awaiting each send's turn.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.expect("join").expect("task");
        }
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn results_and_errors_propagate() {
        let sequence = Sequence::new(64, 32);
        let value = sequence.add("ok", async { Ok(41 + 1) }).await.expect("value");
        assert_eq!(value, 42);
        let err = sequence
            .add("fail", async {
                Err::<(), _>(ChainError::State("broken".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::State(_)));
        // The sequence keeps running after a failed task.
        let value = sequence.add("after", async { Ok(7) }).await.expect("value");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn backlog_limit_rejects_new_tasks() {
        let sequence = Arc::new(Sequence::new(2, 2));
        let blocker = {
            let sequence = sequence.clone();
            tokio::spawn(async move {
                sequence
                    .add("slow", async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _second = {
            let sequence = sequence.clone();
            tokio::spawn(async move { sequence.add("queued", async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = sequence.add("overflow", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ChainError::Sequence(_)));
        blocker.await.expect("join").expect("task");
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_tasks() {
        let sequence = Arc::new(Sequence::new(64, 32));
        let held = {
            let sequence = sequence.clone();
            tokio::spawn(async move {
                sequence
                    .add("held", async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        sequence.shutdown();
        let err = held.await.expect("join").unwrap_err();
        assert!(matches!(err, ChainError::Sequence(_)));
    }
}
