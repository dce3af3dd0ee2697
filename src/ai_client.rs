//! The AI batching client.
//!
//! Coalesces single-connection score requests into size- and
//! timeout-bounded batches, enforces a requests-per-second ceiling on the
//! downstream [`AnomalyScorer`], and demultiplexes batch results back to
//! per-request waiters. An mpsc queue feeds a single background processor;
//! each request carries its own `oneshot::Sender` reply channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::anomaly_scorer::AnomalyScorer;
use crate::error::FirewallError;
use crate::models::Connection;

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub min_interval: Duration,
}

impl BatchConfig {
    pub fn new(max_batch_size: usize, batch_timeout: Duration, rate_limit_rps: f64) -> Self {
        let min_interval = if rate_limit_rps > 0.0 {
            Duration::from_secs_f64(1.0 / rate_limit_rps)
        } else {
            Duration::ZERO
        };
        Self {
            max_batch_size,
            batch_timeout,
            min_interval,
        }
    }
}

struct BatchItem {
    connection: Connection,
    reply: oneshot::Sender<Result<f64, FirewallError>>,
}

#[derive(Default)]
struct ClientInner {
    sender: Option<mpsc::UnboundedSender<BatchItem>>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

/// Owns the pending queue and the background processor's task handle. See
/// spec §4.1 for the full contract; this implementation follows its
/// batch-assembly algorithm step for step.
pub struct AIBatchingClient {
    scorer: Arc<dyn AnomalyScorer>,
    config: BatchConfig,
    inner: Mutex<ClientInner>,
}

impl AIBatchingClient {
    pub fn new(scorer: Arc<dyn AnomalyScorer>, config: BatchConfig) -> Self {
        Self {
            scorer,
            config,
            inner: Mutex::new(ClientInner::default()),
        }
    }

    /// Idempotent: creates the background processor only if it isn't
    /// already running.
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        let needs_start = inner.task.as_ref().map_or(true, |t| t.is_finished());
        if !needs_start {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<BatchItem>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scorer = self.scorer.clone();
        let config = self.config.clone();
        let task = tokio::spawn(Self::run(scorer, rx, config, shutdown_rx));

        inner.sender = Some(tx);
        inner.task = Some(task);
        inner.shutdown = Some(shutdown_tx);
    }

    /// Idempotent graceful shutdown. Blocks until the processor drains and
    /// exits or the 10-second safety timeout elapses, whichever is first.
    pub async fn stop(&self) {
        let (shutdown_tx, task) = {
            let mut inner = self.inner.lock().await;
            let shutdown_tx = match inner.shutdown.take() {
                Some(tx) => tx,
                None => return,
            };
            let task = inner.task.take();
            inner.sender = None;
            (shutdown_tx, task)
        };

        let _ = shutdown_tx.send(true);

        if let Some(task) = task {
            let abort_handle = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                abort_handle.abort();
            }
        }
    }

    /// Enqueues `connection` and suspends until its batch is scored.
    /// Auto-starts the client if it is not currently running.
    pub async fn get_anomaly_score(&self, connection: Connection) -> Result<f64, FirewallError> {
        self.start().await;

        let sender = {
            let inner = self.inner.lock().await;
            inner.sender.clone()
        };
        let sender = sender.ok_or(FirewallError::Cancelled)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if sender
            .send(BatchItem {
                connection,
                reply: reply_tx,
            })
            .is_err()
        {
            return Err(FirewallError::Cancelled);
        }

        reply_rx.await.map_err(|_| FirewallError::Cancelled)?
    }

    async fn run(
        scorer: Arc<dyn AnomalyScorer>,
        mut rx: mpsc::UnboundedReceiver<BatchItem>,
        config: BatchConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut last_dispatch: Option<Instant> = None;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let first = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => None,
                item = rx.recv() => item,
            };

            let Some(first_item) = first else {
                continue;
            };

            let mut batch = vec![first_item];
            let batch_start = Instant::now();
            while batch.len() < config.max_batch_size {
                let elapsed = batch_start.elapsed();
                if elapsed >= config.batch_timeout {
                    break;
                }
                let wait = (config.batch_timeout - elapsed).max(Duration::from_millis(1));
                match tokio::time::timeout(wait, rx.recv()).await {
                    Ok(Some(next)) => batch.push(next),
                    Ok(None) | Err(_) => break,
                }
            }

            Self::dispatch_batch(&scorer, batch, &mut last_dispatch, config.min_interval).await;
        }

        Self::drain(&scorer, &mut rx, &config, &mut last_dispatch).await;
    }

    async fn dispatch_batch(
        scorer: &Arc<dyn AnomalyScorer>,
        batch: Vec<BatchItem>,
        last_dispatch: &mut Option<Instant>,
        min_interval: Duration,
    ) {
        if batch.is_empty() {
            return;
        }

        if let Some(last) = *last_dispatch {
            let since = last.elapsed();
            if since < min_interval {
                tokio::time::sleep(min_interval - since).await;
            }
        }
        *last_dispatch = Some(Instant::now());

        let mut connections = Vec::with_capacity(batch.len());
        let mut replies = Vec::with_capacity(batch.len());
        for item in batch {
            connections.push(item.connection);
            replies.push(item.reply);
        }

        match scorer.analyze(&connections).await {
            Ok(scores) => {
                for (reply, score) in replies.into_iter().zip(scores) {
                    let _ = reply.send(Ok(score));
                }
            }
            Err(err) => {
                let message = err.to_string();
                for reply in replies {
                    let _ = reply.send(Err(FirewallError::ScorerFailed(message.clone())));
                }
            }
        }
    }

    /// Processes whatever is left in the queue in final, rate-limited
    /// batches (bypassing `batch_timeout`), then cancels any stragglers.
    async fn drain(
        scorer: &Arc<dyn AnomalyScorer>,
        rx: &mut mpsc::UnboundedReceiver<BatchItem>,
        config: &BatchConfig,
        last_dispatch: &mut Option<Instant>,
    ) {
        loop {
            let mut batch = Vec::new();
            while batch.len() < config.max_batch_size {
                match rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            Self::dispatch_batch(scorer, batch, last_dispatch, config.min_interval).await;
        }

        while let Ok(item) = rx.try_recv() {
            let _ = item.reply.send(Err(FirewallError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly_scorer::AnomalyScorer;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_connection(tag: &str) -> Connection {
        Connection {
            connection_id: tag.to_string(),
            source_ip: "1.1.1.1".to_string(),
            destination_ip: "8.8.8.8".to_string(),
            destination_port: 80,
            protocol: "TCP".to_string(),
            timestamp: Utc::now(),
        }
    }

    struct CountingScorer {
        calls: AtomicUsize,
        call_times: StdMutex<Vec<Instant>>,
        batch_sizes: StdMutex<Vec<usize>>,
    }

    impl CountingScorer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                call_times: StdMutex::new(Vec::new()),
                batch_sizes: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnomalyScorer for CountingScorer {
        async fn analyze(&self, connections: &[Connection]) -> Result<Vec<f64>, FirewallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            self.batch_sizes.lock().unwrap().push(connections.len());
            // Index position becomes the score so ordering is observable.
            Ok((0..connections.len()).map(|i| i as f64).collect())
        }
    }

    struct FailingScorer;

    #[async_trait]
    impl AnomalyScorer for FailingScorer {
        async fn analyze(&self, _connections: &[Connection]) -> Result<Vec<f64>, FirewallError> {
            Err(FirewallError::ScorerFailed("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn coalesces_concurrent_requests_into_one_batch() {
        let scorer = Arc::new(CountingScorer::new());
        let config = BatchConfig::new(10, Duration::from_millis(50), 1000.0);
        let client = Arc::new(AIBatchingClient::new(scorer.clone(), config));

        let mut handles = Vec::new();
        for i in 0..10 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .get_anomaly_score(test_connection(&i.to_string()))
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
        client.stop().await;
    }

    #[tokio::test]
    async fn batch_never_exceeds_max_size() {
        let scorer = Arc::new(CountingScorer::new());
        let config = BatchConfig::new(3, Duration::from_millis(20), 1000.0);
        let client = Arc::new(AIBatchingClient::new(scorer.clone(), config));

        let mut handles = Vec::new();
        for i in 0..10 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .get_anomaly_score(test_connection(&i.to_string()))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        client.stop().await;
        let sizes = scorer.batch_sizes.lock().unwrap();
        assert!(sizes.iter().all(|&s| s <= 3));
        assert_eq!(sizes.iter().sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn fifo_ordering_within_a_batch() {
        let scorer = Arc::new(CountingScorer::new());
        let config = BatchConfig::new(5, Duration::from_millis(50), 1000.0);
        let client = AIBatchingClient::new(scorer.clone(), config);

        let mut handles = Vec::new();
        for i in 0..5 {
            // sequential submission to preserve FIFO order deterministically
            let score = client.get_anomaly_score(test_connection(&i.to_string()));
            handles.push(score);
        }
        // Since max_batch_size=5 and submissions race concurrently via
        // separate futures below, drive them concurrently but submit in
        // order using join! equivalent:
        let results = futures::future::join_all(handles).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i as f64);
        }
        client.stop().await;
    }

    #[tokio::test]
    async fn rate_limit_spaces_out_batch_dispatch() {
        let scorer = Arc::new(CountingScorer::new());
        // 1 item per batch, 2 batches/sec => 500ms min interval.
        let config = BatchConfig::new(1, Duration::from_millis(5), 2.0);
        let client = AIBatchingClient::new(scorer.clone(), config);

        let start = Instant::now();
        for i in 0..3 {
            client
                .get_anomaly_score(test_connection(&i.to_string()))
                .await
                .unwrap();
        }
        let elapsed = start.elapsed();
        client.stop().await;

        assert_eq!(scorer.calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(950), "elapsed={elapsed:?}");
    }

    #[tokio::test]
    async fn scorer_failure_fails_every_waiter_in_the_batch() {
        let scorer = Arc::new(FailingScorer);
        let config = BatchConfig::new(10, Duration::from_millis(50), 1000.0);
        let client = Arc::new(AIBatchingClient::new(scorer, config));

        let mut handles = Vec::new();
        for i in 0..4 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .get_anomaly_score(test_connection(&i.to_string()))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
        client.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_safe_with_stop() {
        let scorer = Arc::new(CountingScorer::new());
        let config = BatchConfig::new(10, Duration::from_millis(20), 1000.0);
        let client = AIBatchingClient::new(scorer, config);

        client.start().await;
        client.start().await;
        client.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn auto_starts_on_first_call() {
        let scorer = Arc::new(CountingScorer::new());
        let config = BatchConfig::new(10, Duration::from_millis(20), 1000.0);
        let client = AIBatchingClient::new(scorer, config);

        let score = client.get_anomaly_score(test_connection("x")).await;
        assert!(score.is_ok());
        client.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_items_submitted_before_shutdown() {
        let scorer = Arc::new(CountingScorer::new());
        let config = BatchConfig::new(2, Duration::from_millis(200), 1000.0);
        let client = Arc::new(AIBatchingClient::new(scorer.clone(), config));

        // Submit one item so the first batch is waiting on its timeout, then
        // immediately stop: the item should still complete, not cancel.
        let client2 = client.clone();
        let handle = tokio::spawn(async move {
            client2.get_anomaly_score(test_connection("drain")).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.stop().await;

        assert!(handle.await.unwrap().is_ok());
    }
}
