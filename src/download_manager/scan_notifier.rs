//! Library scan notifier.
//!
//! Pokes the streaming server to rescan after batches settle. Settlements
//! arriving within the debounce window coalesce into a single trigger call;
//! a failed call is retried with backoff up to a small ceiling and never
//! re-runs any download work. The trigger endpoint is idempotent, so a
//! spurious extra call is harmless, merely wasteful.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScanNotifierSettings;

/// The streaming server's rescan endpoint, abstracted for testing.
#[async_trait]
pub trait ScanTrigger: Send + Sync {
    async fn trigger_scan(&self) -> Result<()>;
}

/// POSTs to the streaming server's scan endpoint (fire-and-forget).
pub struct HttpScanTrigger {
    client: reqwest::Client,
    url: String,
}

impl HttpScanTrigger {
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ScanTrigger for HttpScanTrigger {
    async fn trigger_scan(&self) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .send()
            .await
            .context("Failed to reach streaming server")?;

        if !response.status().is_success() {
            anyhow::bail!("Scan trigger failed with status: {}", response.status());
        }
        Ok(())
    }
}

/// No-op trigger used when no streaming server is configured.
pub struct NoOpScanTrigger;

#[async_trait]
impl ScanTrigger for NoOpScanTrigger {
    async fn trigger_scan(&self) -> Result<()> {
        Ok(())
    }
}

/// Debounced rescan notifier. `request_scan` is cheap and can be called for
/// every settled batch; the background task coalesces and fires.
pub struct ScanNotifier {
    tx: mpsc::Sender<()>,
    triggered: AtomicUsize,
}

impl ScanNotifier {
    /// Spawn the notifier loop. The returned handle completes on shutdown.
    pub fn spawn(
        trigger: Arc<dyn ScanTrigger>,
        settings: ScanNotifierSettings,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let notifier = Arc::new(Self {
            tx,
            triggered: AtomicUsize::new(0),
        });

        let handle = tokio::spawn(Self::run(
            notifier.clone(),
            trigger,
            settings,
            shutdown,
            rx,
        ));
        (notifier, handle)
    }

    /// Request a rescan. Coalesced with other requests in the debounce window.
    pub async fn request_scan(&self) {
        if self.tx.send(()).await.is_err() {
            warn!("Scan notifier is not running, rescan request dropped");
        }
    }

    /// Number of trigger calls actually made (after coalescing).
    pub fn trigger_count(&self) -> usize {
        self.triggered.load(Ordering::SeqCst)
    }

    async fn run(
        self: Arc<Self>,
        trigger: Arc<dyn ScanTrigger>,
        settings: ScanNotifierSettings,
        shutdown: CancellationToken,
        mut rx: mpsc::Receiver<()>,
    ) {
        debug!(
            "Scan notifier running (debounce={}s)",
            settings.debounce_secs
        );

        loop {
            tokio::select! {
                request = rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }

            // Debounce: swallow further requests until the window closes.
            let window = Duration::from_secs(settings.debounce_secs);
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    request = rx.recv() => {
                        if request.is_none() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            self.fire(trigger.as_ref(), &settings, &shutdown).await;

            if shutdown.is_cancelled() {
                break;
            }
        }

        debug!("Scan notifier stopped");
    }

    async fn fire(
        &self,
        trigger: &dyn ScanTrigger,
        settings: &ScanNotifierSettings,
        shutdown: &CancellationToken,
    ) {
        for attempt in 1..=settings.max_attempts {
            match trigger.trigger_scan().await {
                Ok(()) => {
                    self.triggered.fetch_add(1, Ordering::SeqCst);
                    info!("Triggered library rescan");
                    return;
                }
                Err(e) => {
                    warn!(
                        "Rescan trigger failed (attempt {}/{}): {}",
                        attempt, settings.max_attempts, e
                    );
                    if attempt < settings.max_attempts {
                        let backoff =
                            Duration::from_secs(settings.retry_backoff_secs * attempt as u64);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.cancelled() => return,
                        }
                    }
                }
            }
        }
        warn!("Giving up on rescan trigger after {} attempts", settings.max_attempts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTrigger {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl CountingTrigger {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl ScanTrigger for CountingTrigger {
        async fn trigger_scan(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("scan endpoint unavailable");
            }
            Ok(())
        }
    }

    fn settings(debounce_secs: u64) -> ScanNotifierSettings {
        ScanNotifierSettings {
            debounce_secs,
            max_attempts: 3,
            retry_backoff_secs: 0,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn settlements_in_window_coalesce_to_one_trigger() {
        let trigger = CountingTrigger::new(0);
        let shutdown = CancellationToken::new();
        let (notifier, handle) =
            ScanNotifier::spawn(trigger.clone(), settings(1), shutdown.clone());

        for _ in 0..5 {
            notifier.request_scan().await;
        }

        wait_for(|| notifier.trigger_count() == 1).await;
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn failed_trigger_is_retried() {
        let trigger = CountingTrigger::new(2);
        let shutdown = CancellationToken::new();
        let (notifier, handle) =
            ScanNotifier::spawn(trigger.clone(), settings(0), shutdown.clone());

        notifier.request_scan().await;

        wait_for(|| notifier.trigger_count() == 1).await;
        // Two failures then one success
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn separate_windows_fire_separately() {
        let trigger = CountingTrigger::new(0);
        let shutdown = CancellationToken::new();
        let (notifier, handle) =
            ScanNotifier::spawn(trigger.clone(), settings(0), shutdown.clone());

        notifier.request_scan().await;
        wait_for(|| notifier.trigger_count() == 1).await;

        notifier.request_scan().await;
        wait_for(|| notifier.trigger_count() == 2).await;

        shutdown.cancel();
        let _ = handle.await;
    }
}
