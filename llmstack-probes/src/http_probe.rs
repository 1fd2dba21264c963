use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProbeError, ProbeResult};

/// Fixed pause between attempts of a quick probe.
pub const QUICK_PROBE_BACKOFF: Duration = Duration::from_secs(1);

/// Liveness check against an HTTP endpoint.
///
/// Non-2xx responses, refused connections and timeouts all collapse to
/// `false`: the caller reacts to each of them the same way.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, url: &str) -> bool;

    /// Fetch the JSON body served at `url`, used for verbose status output.
    async fn fetch_json(&self, url: &str) -> Option<serde_json::Value> {
        let _ = url;
        None
    }
}

/// [`HealthChecker`] backed by a shared `reqwest` client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(timeout: Duration) -> ProbeResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Health check succeeded at {} ({})", url, response.status());
                true
            }
            Ok(response) => {
                debug!("Health check returned {} at {}", response.status(), url);
                false
            }
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    debug!("Health check failed at {}: {}", url, e);
                } else {
                    warn!("Health check at {} unexpected error: {}", url, e);
                }
                false
            }
        }
    }

    async fn fetch_json(&self, url: &str) -> Option<serde_json::Value> {
        let response = self.client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }
}

/// Probe `url` up to `retries + 1` times, pausing [`QUICK_PROBE_BACKOFF`]
/// between attempts.
pub async fn check_with_retries(checker: &dyn HealthChecker, url: &str, retries: u32) -> bool {
    for attempt in 0..=retries {
        if attempt > 0 {
            tokio::time::sleep(QUICK_PROBE_BACKOFF).await;
        }
        if checker.check(url).await {
            return true;
        }
    }
    false
}

/// Readiness probe that polls a [`HealthChecker`] until it reports healthy.
///
/// Spawns a background task that checks `url` every `period`. Call `recv()`
/// to wait for the first success. Drop the probe to cancel the background task.
pub struct ReadinessProbe {
    rx: mpsc::Receiver<()>,
    task: JoinHandle<()>,
}

impl ReadinessProbe {
    pub fn spawn(
        checker: Arc<dyn HealthChecker>,
        url: String,
        name: String,
        period: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            debug!("Starting readiness probe for {} at {}", name, url);
            loop {
                if checker.check(&url).await {
                    info!("Readiness probe succeeded for {} at {}", name, url);
                    let _ = tx.send(()).await;
                    break;
                }
                tokio::time::sleep(period).await;
            }
        });
        Self { rx, task }
    }

    /// Returns `Some(())` once healthy, or `None` if the probe task died.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl Drop for ReadinessProbe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Outcome of [`wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub elapsed: Duration,
}

/// Poll `url` every `interval` until it is healthy or `timeout` has elapsed.
///
/// Returns as soon as a check succeeds. When the endpoint never becomes
/// healthy the call returns at `timeout`, abandoning any in-flight request.
/// Cancelling `cancel` aborts the wait with [`ProbeError::Cancelled`].
pub async fn wait_until_ready(
    checker: Arc<dyn HealthChecker>,
    url: &str,
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> ProbeResult<Readiness> {
    let started = Instant::now();
    let mut probe = ReadinessProbe::spawn(checker, url.to_string(), name.to_string(), interval);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        outcome = probe.recv() => Ok(Readiness {
            ready: outcome.is_some(),
            elapsed: started.elapsed(),
        }),
        _ = tokio::time::sleep(timeout) => Ok(Readiness {
            ready: false,
            elapsed: started.elapsed(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Spawn a minimal HTTP server that responds to the first `num_503` requests
    /// with 503 and then responds with 200.
    async fn spawn_test_server(num_503: usize) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;

                let response = if served < num_503 {
                    "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 37\r\nConnection: close\r\n\r\n{\"models\":[{\"name\":\"llama3:latest\"}]}"
                };
                let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, response.as_bytes()).await;
                served += 1;
            }
        });

        (url, handle)
    }

    /// Reports healthy from the `healthy_after`-th call on.
    struct CountingChecker {
        calls: AtomicUsize,
        healthy_after: usize,
    }

    impl CountingChecker {
        fn new(healthy_after: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                healthy_after,
            })
        }
    }

    #[async_trait]
    impl HealthChecker for CountingChecker {
        async fn check(&self, _url: &str) -> bool {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            call >= self.healthy_after
        }
    }

    #[tokio::test]
    async fn test_check_succeeds_on_200() {
        let (url, _server) = spawn_test_server(0).await;
        let checker = HttpHealthChecker::new(Duration::from_secs(5)).unwrap();
        assert!(checker.check(&url).await);
    }

    #[tokio::test]
    async fn test_check_fails_on_503() {
        let (url, _server) = spawn_test_server(usize::MAX).await;
        let checker = HttpHealthChecker::new(Duration::from_secs(5)).unwrap();
        assert!(!checker.check(&url).await);
    }

    #[tokio::test]
    async fn test_check_fails_on_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let checker = HttpHealthChecker::new(Duration::from_secs(5)).unwrap();
        assert!(!checker.check(&url).await);
    }

    #[tokio::test]
    async fn test_check_with_retries_recovers_from_non_2xx() {
        let (url, _server) = spawn_test_server(2).await;
        let checker = HttpHealthChecker::new(Duration::from_secs(5)).unwrap();
        assert!(check_with_retries(&checker, &url, 2).await);
    }

    #[tokio::test]
    async fn test_check_without_retries_gives_up_immediately() {
        let (url, _server) = spawn_test_server(1).await;
        let checker = HttpHealthChecker::new(Duration::from_secs(5)).unwrap();
        assert!(!check_with_retries(&checker, &url, 0).await);
    }

    #[tokio::test]
    async fn test_fetch_json_returns_body() {
        let (url, _server) = spawn_test_server(0).await;
        let checker = HttpHealthChecker::new(Duration::from_secs(5)).unwrap();
        let body = checker.fetch_json(&url).await.expect("JSON body");
        assert_eq!(body["models"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_returns_when_healthy() {
        let checker = CountingChecker::new(3);
        let cancel = CancellationToken::new();

        let readiness = wait_until_ready(
            checker.clone(),
            "http://unused",
            "test",
            Duration::from_secs(60),
            Duration::from_secs(2),
            &cancel,
        )
        .await
        .unwrap();

        assert!(readiness.ready);
        assert_eq!(readiness.elapsed, Duration::from_secs(4));
        assert_eq!(checker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_times_out_within_bound() {
        let checker = CountingChecker::new(usize::MAX);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(10);
        let interval = Duration::from_secs(3);

        let readiness = wait_until_ready(checker, "http://unused", "test", timeout, interval, &cancel)
            .await
            .unwrap();

        assert!(!readiness.ready);
        assert!(readiness.elapsed >= timeout);
        assert!(readiness.elapsed <= timeout + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_is_cancellable() {
        let checker = CountingChecker::new(usize::MAX);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = wait_until_ready(
            checker,
            "http://unused",
            "test",
            Duration::from_secs(60),
            Duration::from_secs(2),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(ProbeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(6));
    }
}
