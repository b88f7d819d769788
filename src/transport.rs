//! Outbound HTTP plumbing shared by every worker.
//!
//! - [`UreqTransport`] performs a single blocking GET through a shared `ureq` agent.
//! - [`ResilientTransport`] wraps any [`HttpTransport`] with a [`RetryPolicy`].
//!
//! Both are `Send + Sync` and hold no per-request state, so one instance is used
//! from all worker threads at once.

use http::StatusCode;
use log::{debug, warn};
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

/// Largest response body we are willing to buffer (one page of sensor data).
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Upper bound for honouring a server supplied `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GetRequest<'a> {
    pub url: &'a str,
    pub query: &'a [(&'a str, String)],
    pub bearer: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// Parsed `Retry-After` header, seconds form only.
    pub retry_after: Option<Duration>,
    pub body: String,
}

#[derive(Debug)]
pub enum TransportError {
    /// Connection, TLS, timeout or body read failure.
    Io(String),
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::Io(s) => write!(f, "transport error: {}", s),
        }
    }
}

impl std::error::Error for TransportError {}

/// A blocking, idempotent GET. Non-2xx statuses are returned as responses, not errors.
pub trait HttpTransport: Send + Sync {
    fn get(&self, request: &GetRequest<'_>) -> Result<HttpResponse, TransportError>;
}

/// Clock seam so retry and pagination delays can be observed in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        UreqTransport { agent: config.into() }
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, request: &GetRequest<'_>) -> Result<HttpResponse, TransportError> {
        let mut req = self.agent.get(request.url).header("Accept", "application/json");
        for (k, v) in request.query {
            req = req.query(*k, v);
        }
        if let Some(token) = request.bearer {
            req = req.header("Authorization", &format!("Bearer {}", token));
        }

        let mut res = req.call().map_err(|e| TransportError::Io(e.to_string()))?;
        let status = res.status();
        let retry_after = res
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = res
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_string()
            .map_err(|e| TransportError::Io(format!("reading body failed: {}", e)))?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// When and how long to retry a GET.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    /// Delay before the first retry; doubles for every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter (0 disables).
    pub jitter: f64,
    pub retryable_statuses: Vec<StatusCode>,
    pub retry_transport_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            retryable_statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            retry_transport_errors: true,
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Delay after failed attempt number `attempt` (1-based), before any jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(server) = retry_after {
            return server.min(MAX_RETRY_AFTER);
        }
        let base = self.backoff(attempt);
        if self.jitter > 0.0 {
            base.mul_f64(1.0 + self.jitter * rand::random::<f64>())
        } else {
            base
        }
    }
}

pub struct ResilientTransport<T, S = ThreadSleeper> {
    inner: T,
    policy: RetryPolicy,
    sleeper: S,
}

impl<T: HttpTransport> ResilientTransport<T, ThreadSleeper> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self::with_sleeper(inner, policy, ThreadSleeper)
    }
}

impl<T: HttpTransport, S: Sleeper> ResilientTransport<T, S> {
    pub fn with_sleeper(inner: T, policy: RetryPolicy, sleeper: S) -> Self {
        ResilientTransport { inner, policy, sleeper }
    }
}

impl<T: HttpTransport, S: Sleeper> HttpTransport for ResilientTransport<T, S> {
    fn get(&self, request: &GetRequest<'_>) -> Result<HttpResponse, TransportError> {
        let max = self.policy.max_attempts.get();
        let mut attempt = 1;
        loop {
            let outcome = self.inner.get(request);
            let retry_after = match &outcome {
                Ok(res) if self.policy.is_retryable(res.status) => res.retry_after,
                Err(_) if self.policy.retry_transport_errors => None,
                _ => return outcome,
            };
            if attempt >= max {
                warn!("GET {} still failing after {} attempt(s); giving up", request.url, attempt);
                return outcome;
            }

            let delay = self.policy.delay_for(attempt, retry_after);
            match &outcome {
                Ok(res) => debug!(
                    "GET {} answered {} (attempt {}/{}); retrying in {:?}",
                    request.url, res.status, attempt, max, delay
                ),
                Err(e) => debug!(
                    "GET {} failed: {} (attempt {}/{}); retrying in {:?}",
                    request.url, e, attempt, max, delay
                ),
            }
            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }
}
