//! Resilient delivery of line protocol payloads.

use std::{fmt, time::Duration};

use bytes::Bytes;
use http::{
    header::{HeaderValue, CONTENT_TYPE},
    Method, Request, StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    retry::{RetryExecutor, RetryLifecycle, RetryResult, RetrySchedule},
    telemetry::Telemetry,
};

type WriteResult = Result<TransportResponse, TransportError>;
type WriteClassifier = fn(&WriteResult) -> bool;

mod endpoint;
pub use self::endpoint::{InvalidEndpoint, SanitizedUri, WriteEndpoint, WriteEndpointBuilder};

mod client;
pub use self::client::{HttpTransport, HttpTransportBuilder};

mod transport;
pub use self::transport::{BoxError, Transport, TransportError, TransportResponse};

const LINE_PROTOCOL_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

// Response bodies are only logged up to this many bytes.
const MAX_LOGGED_BODY_LEN: usize = 512;

/// The final outcome of publishing a payload.
#[derive(Debug)]
pub enum Outcome {
    /// The server accepted the payload with a 2xx status.
    Success {
        /// Status code returned by the server.
        status: StatusCode,
    },

    /// The server responded with a non-2xx status.
    ///
    /// The payload was not retried.
    ServerError {
        /// Status code returned by the server.
        status: StatusCode,

        /// Response body, decoded lossily as UTF-8.
        body: String,
    },

    /// No response was received, even after retrying.
    TransportError(TransportError),
}

impl Outcome {
    /// Returns `true` if the payload was accepted.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { status } => write!(f, "accepted with status {}", status.as_u16()),
            Self::ServerError { status, body } => {
                write!(f, "rejected with status {}: {}", status.as_u16(), truncated(body))
            }
            Self::TransportError(e) => write!(f, "{}", e),
        }
    }
}

fn truncated(body: &str) -> &str {
    if body.len() <= MAX_LOGGED_BODY_LEN {
        return body;
    }

    let mut end = MAX_LOGGED_BODY_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

fn is_retryable(result: &WriteResult) -> bool {
    // Only failures to get a response at all are retried. A response with any status, including 5xx, is final.
    matches!(result, Err(e) if !e.is_cancelled())
}

/// Retry lifecycle that logs failed write attempts against a sanitized endpoint.
#[derive(Clone)]
struct WriteRetryLifecycle {
    endpoint: String,
}

impl RetryLifecycle<WriteResult> for WriteRetryLifecycle {
    fn before_retry(&self, outcome: &WriteResult, backoff: Duration, attempts: u32) {
        if let Err(e) = outcome {
            warn!(attempts, endpoint = %self.endpoint, error = %e, "Write failed. Retrying after {:?}.", backoff);
        }
    }

    fn after_completion(&self, outcome: &WriteResult, attempts: u32) {
        if let Ok(response) = outcome {
            if response.status.is_success() {
                debug!(attempts, endpoint = %self.endpoint, status = response.status.as_u16(), "Write succeeded.");
            }
        }
    }

    fn after_exhausted(&self, outcome: &WriteResult, attempts: u32) {
        if let Err(e) = outcome {
            error!(
                attempts,
                endpoint = %self.endpoint,
                error = %e,
                "Write failed after {} attempts. Giving up.",
                attempts
            );
        }
    }
}

/// Publishes payloads to a write endpoint, retrying transport failures on a fixed schedule.
///
/// A payload is retried only when no response was received at all: connection failures, TLS failures, and timeouts.
/// Any response from the server is final, so a payload rejected with a 4xx or 5xx status is never resent. With the
/// default schedule, a payload is attempted at most four times, with delays of 200ms, 400ms, and 600ms between
/// attempts.
///
/// Publishing can be cancelled at any point, including in the middle of a request or while waiting to retry.
pub struct Publisher<T> {
    transport: T,
    endpoint: WriteEndpoint,
    executor: RetryExecutor<WriteClassifier, WriteRetryLifecycle>,
    telemetry: Telemetry,
}

impl<T: Transport> Publisher<T> {
    /// Creates a new `Publisher` sending to `endpoint` over `transport`, with the default retry schedule.
    pub fn new(transport: T, endpoint: WriteEndpoint) -> Self {
        Self {
            transport,
            executor: build_executor(RetrySchedule::default(), &endpoint),
            endpoint,
            telemetry: Telemetry::new(),
        }
    }

    /// Sets the retry schedule.
    pub fn with_retry_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.executor = build_executor(schedule, &self.endpoint);
        self
    }

    /// Sets the telemetry handle used to record attempts and bytes sent.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Returns the endpoint payloads are sent to.
    pub fn endpoint(&self) -> &WriteEndpoint {
        &self.endpoint
    }

    /// Sends `payload` to the write endpoint.
    ///
    /// Transport failures are retried according to the retry schedule. If `cancel` is triggered before an outcome is
    /// reached, in-flight work is abandoned and a [`TransportError::Cancelled`] outcome is returned.
    pub async fn send(&self, payload: Bytes, cancel: &CancellationToken) -> Outcome {
        let payload_len = payload.len() as u64;
        let result = self
            .executor
            .run(cancel, |_| {
                self.telemetry.publish_attempts().increment(1);
                self.transport.send(self.build_request(payload.clone()))
            })
            .await;

        match result {
            RetryResult::Finished { outcome: Ok(response), .. } => {
                if response.status.is_success() {
                    self.telemetry.bytes_sent().increment(payload_len);
                    Outcome::Success {
                        status: response.status,
                    }
                } else {
                    let body = String::from_utf8_lossy(&response.body).into_owned();
                    warn!(
                        endpoint = %self.endpoint.sanitized(),
                        status = response.status.as_u16(),
                        body = truncated(&body),
                        "Server rejected write."
                    );
                    Outcome::ServerError {
                        status: response.status,
                        body,
                    }
                }
            }
            RetryResult::Finished { outcome: Err(e), .. } | RetryResult::Exhausted { outcome: Err(e), .. } => {
                Outcome::TransportError(e)
            }
            // Responses are never retried, so the schedule can't be exhausted by one.
            RetryResult::Exhausted { outcome: Ok(response), .. } => Outcome::ServerError {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            },
            RetryResult::Cancelled { attempts } => {
                debug!(attempts, endpoint = %self.endpoint.sanitized(), "Write cancelled.");
                Outcome::TransportError(TransportError::Cancelled)
            }
        }
    }

    fn build_request(&self, payload: Bytes) -> Request<Bytes> {
        let mut request = Request::new(payload);
        *request.method_mut() = Method::POST;
        *request.uri_mut() = self.endpoint.uri().clone();
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(LINE_PROTOCOL_CONTENT_TYPE));
        request
    }
}

fn build_executor(
    schedule: RetrySchedule, endpoint: &WriteEndpoint,
) -> RetryExecutor<WriteClassifier, WriteRetryLifecycle> {
    let classifier: WriteClassifier = is_retryable;
    RetryExecutor::new(schedule, classifier).with_retry_lifecycle(WriteRetryLifecycle {
        endpoint: endpoint.sanitized().to_string(),
    })
}
