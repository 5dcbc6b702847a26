use std::fmt;

use http::Uri;
use snafu::{ResultExt as _, Snafu};
use url::Url;

use crate::encoder::Precision;

/// Errors raised while building a write endpoint.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum InvalidEndpoint {
    /// The base URL could not be parsed.
    #[snafu(display("Failed to parse URL '{}': {}", url, source))]
    Parse {
        /// URL as given.
        url: String,

        /// Underlying parse error.
        source: url::ParseError,
    },

    /// The base URL uses a scheme other than `http` or `https`.
    #[snafu(display("Unsupported URL scheme '{}'. Expected 'http' or 'https'.", scheme))]
    UnsupportedScheme {
        /// Scheme found in the URL.
        scheme: String,
    },

    /// The base URL has no host.
    #[snafu(display("URL '{}' has no host.", url))]
    MissingHost {
        /// URL as given.
        url: String,
    },

    /// The composed URL was not accepted as a request URI.
    #[snafu(display("Failed to build request URI: {}", source))]
    RequestUri {
        /// Underlying URI error.
        source: http::uri::InvalidUri,
    },
}

/// Builder for [`WriteEndpoint`].
#[derive(Clone, Debug)]
pub struct WriteEndpointBuilder {
    base_url: String,
    database: String,
    precision: Precision,
    retention_policy: Option<String>,
    credentials: Option<(String, String)>,
}

impl WriteEndpointBuilder {
    /// Sets the timestamp precision announced to the server.
    ///
    /// Defaults to milliseconds.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Sets the retention policy to write into.
    pub fn with_retention_policy<S: Into<String>>(mut self, retention_policy: Option<S>) -> Self {
        self.retention_policy = retention_policy.map(Into::into);
        self
    }

    /// Sets the credentials sent with every write.
    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Builds the endpoint.
    ///
    /// # Errors
    ///
    /// If the base URL is not a valid `http` or `https` URL, an error is returned.
    pub fn build(self) -> Result<WriteEndpoint, InvalidEndpoint> {
        let mut url = Url::parse(&self.base_url).context(Parse { url: &self.base_url })?;
        match url.scheme() {
            "http" | "https" => {}
            other => return UnsupportedScheme { scheme: other }.fail(),
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return MissingHost { url: self.base_url }.fail(),
        }

        // `http` and `https` URLs always have a path that can be extended.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("write");
        }

        url.set_query(None);
        url.set_fragment(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("db", &self.database);
            query.append_pair("precision", self.precision.as_str());
            if let Some(rp) = &self.retention_policy {
                query.append_pair("rp", rp);
            }
            if let Some((username, password)) = &self.credentials {
                query.append_pair("u", username);
                query.append_pair("p", password);
            }
        }

        let uri = Uri::try_from(url.as_str()).context(RequestUri)?;
        Ok(WriteEndpoint { uri })
    }
}

/// The URI that line protocol payloads are posted to.
///
/// Composed from a base URL as `{base}/write?db=..&precision=..`, with the retention policy and credentials appended
/// when configured.
#[derive(Clone, Debug)]
pub struct WriteEndpoint {
    uri: Uri,
}

impl WriteEndpoint {
    /// Creates a builder for an endpoint writing into `database` on the server at `base_url`.
    pub fn builder<U: Into<String>, D: Into<String>>(base_url: U, database: D) -> WriteEndpointBuilder {
        WriteEndpointBuilder {
            base_url: base_url.into(),
            database: database.into(),
            precision: Precision::default(),
            retention_policy: None,
            credentials: None,
        }
    }

    /// Returns the full request URI, including credentials.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns a displayable form of the URI that is safe to log.
    ///
    /// Only the scheme, host, port, and path are shown. The query string, which may carry credentials, is left out.
    pub fn sanitized(&self) -> SanitizedUri<'_> {
        SanitizedUri(&self.uri)
    }
}

/// Loggable form of a request URI, without its query string.
pub struct SanitizedUri<'a>(&'a Uri);

impl fmt::Display for SanitizedUri<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(scheme), Some(authority)) = (self.0.scheme_str(), self.0.authority()) {
            // Drop any userinfo from the authority.
            let host_port = authority.as_str().rsplit('@').next().unwrap_or_default();
            write!(f, "{}://{}", scheme, host_port)?;
        }

        write!(f, "{}", self.0.path())
    }
}
