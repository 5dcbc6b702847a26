use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode};
use snafu::Snafu;

/// A boxed error that can be sent across threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A response received from the server.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    /// Status code of the response.
    pub status: StatusCode,

    /// Collected response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Creates a new `TransportResponse`.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Errors raised while exchanging a request with the server.
///
/// These cover every failure where no response was received at all. A response with an error status is not a
/// transport error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum TransportError {
    /// The request could not be sent, or the response could not be read.
    #[snafu(display("Request failed: {}", source))]
    RequestFailed {
        /// Underlying connection, TLS, or protocol error.
        source: BoxError,
    },

    /// No response was received within the request timeout.
    #[snafu(display("Request timed out after {:?}.", timeout))]
    TimedOut {
        /// Configured request timeout.
        timeout: Duration,
    },

    /// The request was abandoned because the publisher was cancelled.
    #[snafu(display("Request was cancelled."))]
    Cancelled,
}

impl TransportError {
    /// Returns `true` if the error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Sends write requests to the server.
///
/// Implementations perform exactly one exchange per call and never retry on their own: retries are driven by
/// [`Publisher`][super::Publisher].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and waits for the full response.
    ///
    /// # Errors
    ///
    /// If no response could be received, an error is returned.
    async fn send(&self, request: Request<Bytes>) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T> Transport for std::sync::Arc<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, request: Request<Bytes>) -> Result<TransportResponse, TransportError> {
        (**self).send(request).await
    }
}
