//! Delivery of finished archives to the upstream endpoint.
//!
//! The `ArchiveSender` trait hides HTTP so the pipeline and its tests only
//! see "send these bytes with this digest". The production sender POSTs
//! with bearer auth and an `X-Checksum` header; transient failures are
//! retried with doubling backoff, a 4xx fails fast.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use crate::error::TransmitError;

/// Structured acknowledgment from the endpoint, when it sends one.
#[derive(Debug, Default, Deserialize)]
pub struct SendAck {
    pub message: Option<String>,
}

/// One delivery attempt. Implementations must not retry internally; the
/// retry budget lives in `send_with_retry`.
#[async_trait]
pub trait ArchiveSender: Send + Sync + 'static {
    async fn send(&self, body: &[u8], digest: &str) -> Result<SendAck, TransmitError>;
}

/// Retry schedule: `backoff_base * 2^n` between attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    fn delay_for(&self, completed_attempts: u32) -> Duration {
        // Shift is clamped; a budget that large would never be configured,
        // but an overflow panic inside a dispatch must be impossible.
        self.backoff_base
            .saturating_mul(1u32 << completed_attempts.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Drives `sender` until success, a non-transient error, or an exhausted
/// budget. Backoff sleeps suspend only the calling dispatch task.
pub async fn send_with_retry<S: ArchiveSender + ?Sized>(
    sender: &S,
    body: &[u8],
    digest: &str,
    policy: &RetryPolicy,
) -> Result<SendAck, TransmitError> {
    let mut attempt: u32 = 0;

    loop {
        match sender.send(body, digest).await {
            Ok(ack) => {
                if attempt > 0 {
                    debug!(target: "transmit", attempt = attempt + 1, "delivery recovered after retry");
                }
                return Ok(ack);
            }
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    error!(
                        target: "transmit",
                        attempts = attempt,
                        error = %err,
                        "delivery budget exhausted"
                    );
                    return Err(TransmitError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }

                let delay = policy.delay_for(attempt - 1);
                warn!(
                    target: "transmit",
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient delivery failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(target: "transmit", error = %err, "non-retriable delivery failure");
                return Err(err);
            }
        }
    }
}

/// Production sender: POST to a fixed endpoint with bearer-token auth.
#[derive(Clone)]
pub struct HttpArchiveSender {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl HttpArchiveSender {
    pub fn new(
        endpoint: String,
        api_key: String,
        request_timeout: Duration,
    ) -> Result<Self, TransmitError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl ArchiveSender for HttpArchiveSender {
    #[instrument(
        skip(self, body, digest),
        target = "transmit",
        fields(endpoint = %self.endpoint, bytes = body.len())
    )]
    async fn send(&self, body: &[u8], digest: &str) -> Result<SendAck, TransmitError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Checksum", digest)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.to_vec())
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            // The ack body is optional; an empty or non-JSON 2xx still
            // counts as delivered.
            let ack = resp.json::<SendAck>().await.unwrap_or_default();
            debug!(target: "transmit", %status, "archive accepted upstream");
            return Ok(ack);
        }

        if status.is_server_error() {
            Err(TransmitError::Upstream { status })
        } else {
            Err(TransmitError::Rejected { status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use tokio::time::Instant;

    /// Sender scripted to fail transiently `failures` times, then succeed
    /// (or reject outright when `reject` is set).
    struct ScriptedSender {
        failures: u32,
        reject: bool,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedSender {
        fn transient(failures: u32) -> Self {
            Self {
                failures,
                reject: false,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn rejecting() -> Self {
            Self {
                failures: 0,
                reject: true,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl ArchiveSender for ScriptedSender {
        async fn send(&self, _body: &[u8], _digest: &str) -> Result<SendAck, TransmitError> {
            let n = {
                let mut attempts = self.attempts.lock();
                attempts.push(Instant::now());
                attempts.len() as u32
            };

            if self.reject {
                return Err(TransmitError::Rejected {
                    status: StatusCode::UNAUTHORIZED,
                });
            }
            if n <= self.failures {
                return Err(TransmitError::Upstream {
                    status: StatusCode::BAD_GATEWAY,
                });
            }
            Ok(SendAck {
                message: Some("ok".into()),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover_with_doubling_backoff() {
        let sender = ScriptedSender::transient(3);
        let policy = RetryPolicy::new(5, Duration::from_secs(1));

        let ack = send_with_retry(&sender, b"body", "digest", &policy)
            .await
            .unwrap();
        assert_eq!(ack.message.as_deref(), Some("ok"));

        let times = sender.attempt_times();
        assert_eq!(times.len(), 4);

        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_surfaces_terminal_error() {
        let sender = ScriptedSender::transient(u32::MAX);
        let policy = RetryPolicy::new(5, Duration::from_secs(1));

        let err = send_with_retry(&sender, b"body", "digest", &policy)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransmitError::RetriesExhausted { attempts: 5, .. }
        ));
        assert_eq!(sender.attempt_times().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_fails_fast_without_burning_budget() {
        let sender = ScriptedSender::rejecting();
        let policy = RetryPolicy::new(5, Duration::from_secs(1));

        let err = send_with_retry(&sender, b"body", "digest", &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, TransmitError::Rejected { .. }));
        assert_eq!(sender.attempt_times().len(), 1);
    }

    #[test]
    fn delay_shift_is_clamped() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_millis(1));
        // Pathological attempt counts must not panic.
        assert!(policy.delay_for(200) >= policy.delay_for(16));
    }

    #[test]
    fn zero_attempt_budget_is_bumped_to_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }
}
