//! Delivery of readings to the remote collector.
//!
//! Each reading is POSTed as JSON. Transport failures and non-2xx responses
//! are retried with exponential backoff (`base^n` seconds after the n-th
//! failure) until `max_retries` attempts have been made, after which the
//! reading is dropped and reported.

use crate::reading::SensorReading;
use crate::shutdown::Shutdown;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// A single failed delivery attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
    #[error("collector responded with status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Sends one encoded reading to the collector.
///
/// Returns the 2xx status on success. Implementations must map non-2xx
/// responses to [`TransportError::Status`].
pub trait Transport: Send + Sync {
    fn post<'a>(
        &'a self,
        body: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>>;
}

/// HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// Build a transport whose requests time out after `timeout`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn post<'a>(
        &'a self,
        body: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_owned())
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                Ok(status.as_u16())
            } else {
                Err(TransportError::Status(status.as_u16()))
            }
        })
    }
}

/// Retry bounds for a single reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_retries: u32,
    /// Wait after the n-th failure is `backoff_base^n` seconds
    pub backoff_base: f64,
    /// Optional upper bound on a single wait
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failure number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.backoff_base.powi(exponent);
        let wait = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_backoff {
            Some(cap) => wait.min(cap),
            None => wait,
        }
    }
}

/// Retry-loop state for one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt<'a> {
    pub reading: &'a SensorReading,
    pub attempt_count: u32,
    pub last_error: Option<TransportError>,
}

/// Final result of delivering one reading.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        status: u16,
        attempts: u32,
    },
    /// Retries exhausted; the reading is lost.
    DroppedAfterRetries {
        attempts: u32,
        last_error: TransportError,
    },
    /// Shutdown arrived while waiting to retry; the reading is handed back.
    Interrupted {
        attempts: u32,
        reading: SensorReading,
    },
    /// The reading could not be encoded as JSON, so nothing was posted.
    Unencodable { error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Delivers readings through a [`Transport`] under a [`RetryPolicy`].
#[derive(Debug)]
pub struct DeliveryClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> DeliveryClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver one reading, retrying until success, exhaustion or shutdown.
    ///
    /// Blocks the calling task for the full backoff between attempts.
    pub async fn deliver(
        &self,
        reading: SensorReading,
        shutdown: &mut Shutdown,
    ) -> DeliveryOutcome {
        let body = match reading.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, ?reading, "failed to encode reading, dropping it");
                return DeliveryOutcome::Unencodable {
                    error: e.to_string(),
                };
            }
        };

        let mut state = DeliveryAttempt {
            reading: &reading,
            attempt_count: 0,
            last_error: None,
        };

        loop {
            debug!(attempt = state.attempt_count + 1, %body, "posting reading");

            match self.transport.post(&body).await {
                Ok(status) => {
                    let attempts = state.attempt_count + 1;
                    info!(status, attempts, "reading delivered");
                    return DeliveryOutcome::Delivered { status, attempts };
                }
                Err(e) => {
                    state.attempt_count += 1;
                    let last_error = state.last_error.insert(e);

                    if state.attempt_count >= self.policy.max_retries {
                        error!(
                            attempts = state.attempt_count,
                            error = %last_error,
                            %body,
                            "all delivery attempts failed, reading dropped"
                        );
                        return DeliveryOutcome::DroppedAfterRetries {
                            attempts: state.attempt_count,
                            last_error: last_error.clone(),
                        };
                    }

                    let wait = self.policy.backoff(state.attempt_count);
                    warn!(
                        attempt = state.attempt_count,
                        max_retries = self.policy.max_retries,
                        error = %last_error,
                        wait = ?wait,
                        "delivery attempt failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown.requested() => {
                            let attempts = state.attempt_count;
                            return DeliveryOutcome::Interrupted { attempts, reading };
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}
