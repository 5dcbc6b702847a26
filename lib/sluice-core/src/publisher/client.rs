use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::Request;
use http_body_util::{BodyExt as _, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use super::{TransportError, TransportResponse};
use crate::{error::GenericError, publisher::Transport};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 5;

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl HttpTransportBuilder {
    /// Sets the timeout for establishing new connections.
    ///
    /// Defaults to 30 seconds.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the timeout for a single request, from sending it to having read the full response.
    ///
    /// `None` disables the timeout. Defaults to 30 seconds.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long idle connections are kept in the pool.
    ///
    /// Defaults to 45 seconds.
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Sets the maximum number of idle connections kept per host.
    ///
    /// Defaults to 5.
    pub fn with_pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    /// Builds the transport.
    ///
    /// # Errors
    ///
    /// If the TLS configuration could not be built, an error is returned.
    pub fn build(self) -> Result<HttpTransport, GenericError> {
        let tls_config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(load_native_roots())
            .with_no_client_auth();

        // The HTTPS connector takes care of plain HTTP as well, so the inner connector must not enforce it.
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(self.connect_timeout));

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Ok(HttpTransport {
            client,
            request_timeout: self.request_timeout,
        })
    }
}

/// Loads the platform's root certificates.
///
/// A missing or partly unreadable certificate store is not fatal, since plain HTTP endpoints need no roots at all, but
/// HTTPS endpoints will then fail to verify.
fn load_native_roots() -> RootCertStore {
    let mut store = RootCertStore::empty();

    let result = rustls_native_certs::load_native_certs();
    for error in &result.errors {
        warn!(%error, "Failed to load certificates from the platform's native certificate store.");
    }

    let (added, failed) = store.add_parsable_certificates(result.certs);
    if added == 0 {
        warn!("No root certificates were loaded. HTTPS endpoints will fail to verify.");
    } else {
        debug!(added, failed, "Loaded root certificates from the platform's native certificate store.");
    }

    store
}

/// A [`Transport`] backed by a pooled HTTP/1.1 client.
///
/// ## Features
///
/// - TLS support (HTTPS) using the platform's native certificate store
/// - connection pooling, with idle connections reaped after a timeout
/// - an overall per-request timeout covering both the response head and body
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    request_timeout: Option<Duration>,
}

impl HttpTransport {
    /// Creates a new builder with default settings.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }

    async fn exchange(&self, request: Request<Bytes>) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .request(request.map(Full::new))
            .await
            .map_err(|e| TransportError::RequestFailed { source: e.into() })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::RequestFailed { source: e.into() })?
            .to_bytes();

        Ok(TransportResponse::new(parts.status, body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<TransportResponse, TransportError> {
        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.exchange(request))
                .await
                .unwrap_or(Err(TransportError::TimedOut { timeout })),
            None => self.exchange(request).await,
        }
    }
}
