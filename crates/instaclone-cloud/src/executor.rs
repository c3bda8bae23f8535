//! Execution pools of a cloud client. Power transitions are serialized on a
//! single worker so start/stop jobs of one profile never interleave at the
//! hypervisor-call level; clone-from-self jobs run on the shared tokio pool
//! and are spawned directly where they start.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One worker draining an unbounded queue of power-transition jobs.
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    shutdown: CancellationToken,
}

impl SerialExecutor {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let shutdown = CancellationToken::new();
        let guard = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = guard.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(job) => {
                            tokio::select! {
                                _ = guard.cancelled() => break,
                                _ = job => {}
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("serial executor worker stopped");
        });

        Self { tx, shutdown }
    }

    /// Queues a job. The job receives its own cancellation token; cancelling
    /// the returned handle both signals the token and drops the job future
    /// at its next suspension point.
    pub fn submit<F, Fut>(&self, make_job: F) -> JobHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let job = make_job(cancel.clone());
        let token = cancel.clone();
        let wrapped = async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = job => {}
            }
            let _ = done_tx.send(());
        }
        .boxed();

        if self.tx.send(wrapped).is_err() {
            // Executor closed; the dropped job closes the done channel and
            // join() returns immediately.
            debug!("serial executor closed, job dropped");
        }

        JobHandle {
            cancel,
            done: done_rx,
        }
    }

    /// Stops the worker. Queued and in-flight jobs are abandoned; each job
    /// reports its own outcome, so nothing is fixed up after the fact.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a queued lifecycle job.
pub struct JobHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits until the job has finished or was torn down.
    pub async fn join(self) {
        let _ = self.done.await;
    }

    pub async fn cancel_and_join(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let executor = SerialExecutor::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            handles.push(executor.submit(move |_| async move {
                // The later jobs would win a race if they ran concurrently.
                tokio::time::sleep(Duration::from_millis(20 - i * 5)).await;
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.join().await;
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancelled_queued_job_never_runs() {
        let executor = SerialExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = executor.submit(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let ran_clone = Arc::clone(&ran);
        let queued = executor.submit(move |_| async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        queued.cancel();
        queued.join().await;
        blocker.join().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_abandons_queued_jobs() {
        let executor = SerialExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_clone = Arc::clone(&ran);
        executor.close();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let handle = executor.submit(move |_| async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.join().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
