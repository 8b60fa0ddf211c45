//! At-least-once job queue between the feed ingress and the replica worker.
//!
//! Jobs are processed strictly in enqueue order. A failed job is retried with
//! exponential backoff until the attempt cap is reached, then dropped with an
//! error log; handlers must tolerate duplicate delivery.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts per job, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), doubling each time.
    fn delay(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

#[derive(Debug, Clone)]
pub struct Job<T> {
    pub channel: String,
    pub payload: T,
}

#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, job: &Job<T>) -> Result<()>;
}

/// Producer half. Cheap to clone; enqueue never blocks.
pub struct JobQueue<T> {
    tx: mpsc::UnboundedSender<Job<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> JobQueue<T> {
    pub fn enqueue(&self, channel: impl Into<String>, payload: T) -> Result<()> {
        self.tx
            .send(Job {
                channel: channel.into(),
                payload,
            })
            .map_err(|_| anyhow!("job queue is closed"))
    }
}

/// Consumer half, driven by a single task so jobs never interleave.
pub struct JobRunner<T> {
    pub(crate) rx: mpsc::UnboundedReceiver<Job<T>>,
    policy: RetryPolicy,
}

pub fn channel<T>(policy: RetryPolicy) -> (JobQueue<T>, JobRunner<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobQueue { tx }, JobRunner { rx, policy })
}

impl<T: Send> JobRunner<T> {
    /// Drains the queue until all producers are dropped.
    pub async fn run<H: JobHandler<T>>(mut self, handler: H) {
        while let Some(job) = self.rx.recv().await {
            self.process(&handler, &job).await;
        }
        log::info!("[QUEUE] all producers closed; runner exiting");
    }

    async fn process<H: JobHandler<T>>(&self, handler: &H, job: &Job<T>) {
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            match handler.handle(job).await {
                Ok(()) => return,
                Err(err) if attempt < attempts => {
                    let delay = self.policy.delay(attempt);
                    log::warn!(
                        "[QUEUE] job on {} failed (attempt {}/{}), retrying in {:?}: {}",
                        job.channel,
                        attempt,
                        attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    log::error!(
                        "[QUEUE] job on {} dropped after {} attempts: {}",
                        job.channel,
                        attempts,
                        err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl JobHandler<u32> for CountingHandler {
        async fn handle(&self, _job: &Job<u32>) -> Result<()> {
            let seen = self.calls.fetch_add(1, Ordering::SeqCst);
            if seen < self.fail_first {
                Err(anyhow!("transient failure"))
            } else {
                Ok(())
            }
        }
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn delivers_jobs_in_order() {
        let (queue, runner) = channel(fast_policy(2));
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        struct Recorder(Arc<tokio::sync::Mutex<Vec<u32>>>);
        #[async_trait]
        impl JobHandler<u32> for Recorder {
            async fn handle(&self, job: &Job<u32>) -> Result<()> {
                self.0.lock().await.push(job.payload);
                Ok(())
            }
        }

        for i in 0..5 {
            queue.enqueue("v3_trades", i).unwrap();
        }
        drop(queue);
        runner.run(Recorder(seen.clone())).await;
        assert_eq!(*seen.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let (queue, runner) = channel(fast_policy(2));
        let calls = Arc::new(AtomicU32::new(0));
        queue.enqueue("v3_orderbook", 1).unwrap();
        drop(queue);
        runner
            .run(CountingHandler {
                calls: calls.clone(),
                fail_first: 1,
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drops_job_after_attempt_cap() {
        let (queue, runner) = channel(fast_policy(2));
        let calls = Arc::new(AtomicU32::new(0));
        queue.enqueue("v3_orderbook", 1).unwrap();
        queue.enqueue("v3_orderbook", 2).unwrap();
        drop(queue);
        runner
            .run(CountingHandler {
                calls: calls.clone(),
                fail_first: 10,
            })
            .await;
        // two attempts per job, then dropped; the second job still runs
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
