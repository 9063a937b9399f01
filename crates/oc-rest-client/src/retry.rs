//! Request retry with capped exponential backoff

use async_trait::async_trait;
use reqwest::{Request, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{exponential_delay, MAX_RETRY_DELAY};
use crate::error::{RestClientError, RestClientResult};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Wait before retry number `attempt + 1`: `base * 2^attempt`, at most 30s.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        exponential_delay(self.base_delay, attempt, MAX_RETRY_DELAY)
    }

    /// Transport errors and 5xx responses are retried; anything below 500 is final.
    pub fn should_retry(result: &RestClientResult<Response>) -> bool {
        match result {
            Ok(response) => response.status().as_u16() >= 500,
            Err(_) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Transport decorator re-issuing failed requests.
///
/// The policy is the same for every HTTP method. Requests whose body cannot be
/// replayed (streaming bodies) get exactly one attempt.
#[derive(Debug, Clone)]
pub struct RetryingTransport<T> {
    policy: RetryPolicy,
    inner: T,
    cancel: Option<CancellationToken>,
}

impl<T> RetryingTransport<T> {
    pub fn new(policy: RetryPolicy, inner: T) -> Self {
        Self {
            policy,
            inner,
            cancel: None,
        }
    }

    /// Abort backoff waits as soon as `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn wait(&self, delay: Duration) -> RestClientResult<()> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(RestClientError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn execute(&self, mut request: Request) -> RestClientResult<Response> {
        let mut attempt = 0;

        loop {
            let replay = if attempt < self.policy.max_retries {
                let copy = request.try_clone();
                if copy.is_none() {
                    debug!(url = %request.url(), "request body cannot be replayed, single attempt only");
                }
                copy
            } else {
                None
            };

            let result = self.inner.execute(request).await;
            if !RetryPolicy::should_retry(&result) {
                return result;
            }

            let Some(next) = replay else {
                return result;
            };

            let delay = self.policy.delay_for_attempt(attempt);
            match &result {
                Ok(response) => warn!(
                    attempt = attempt + 1,
                    status = response.status().as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "server error, retrying request"
                ),
                Err(e) => warn!(
                    attempt = attempt + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "request failed, retrying"
                ),
            }
            drop(result);

            self.wait(delay).await?;
            request = next;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays a fixed list of statuses (0 means transport error), recording
    /// when each attempt happened.
    struct Scripted {
        statuses: Mutex<VecDeque<u16>>,
        attempts: AtomicU32,
        at: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                attempts: AtomicU32::new(0),
                at: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn execute(&self, _request: Request) -> RestClientResult<Response> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.at.lock().unwrap().push(Instant::now());
            let status = self.statuses.lock().unwrap().pop_front().unwrap_or(500);
            if status == 0 {
                return Err(RestClientError::Timeout);
            }
            let response = http::Response::builder().status(status).body("").unwrap();
            Ok(Response::from(response))
        }
    }

    fn get() -> Request {
        Request::new(Method::GET, "http://localhost/session".parse().unwrap())
    }

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        let delays: Vec<_> = (0..7).map(|n| policy.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        for status in [200, 201, 302, 400, 404, 429, 499] {
            let transport = RetryingTransport::new(
                RetryPolicy::new(3, Duration::from_secs(1)),
                Scripted::new(&[status]),
            );
            let response = transport.execute(get()).await.unwrap();
            assert_eq!(response.status().as_u16(), status);
            assert_eq!(transport.inner().attempts(), 1, "status {status}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_server_error_exhausts_retries() {
        let transport = RetryingTransport::new(
            RetryPolicy::new(3, Duration::from_secs(1)),
            Scripted::new(&[500, 502, 503, 504]),
        );
        let response = transport.execute(get()).await.unwrap();

        assert_eq!(response.status().as_u16(), 504);
        assert_eq!(transport.inner().attempts(), 4);

        let at = transport.inner().at.lock().unwrap();
        let gaps: Vec<_> = at.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_retried_and_surfaced() {
        let transport = RetryingTransport::new(
            RetryPolicy::new(2, Duration::from_millis(100)),
            Scripted::new(&[0, 0, 0]),
        );
        let err = transport.execute(get()).await.unwrap_err();

        assert!(matches!(err, RestClientError::Timeout));
        assert_eq!(transport.inner().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_server_errors() {
        let transport = RetryingTransport::new(
            RetryPolicy::new(3, Duration::from_secs(1)),
            Scripted::new(&[503, 503, 200]),
        );
        let started = Instant::now();
        let response = transport.execute(get()).await.unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(transport.inner().attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let transport = RetryingTransport::new(
            RetryPolicy::new(0, Duration::from_secs(1)),
            Scripted::new(&[503, 200]),
        );
        let response = transport.execute(get()).await.unwrap();

        assert_eq!(response.status().as_u16(), 503);
        assert_eq!(transport.inner().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_backoff_wait() {
        let token = CancellationToken::new();
        let transport = RetryingTransport::new(
            RetryPolicy::new(5, Duration::from_secs(20)),
            Scripted::new(&[503, 503, 503]),
        )
        .with_cancellation(token.clone());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let err = transport.execute(get()).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, RestClientError::Cancelled));
        assert_eq!(transport.inner().attempts(), 1);
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
