//! Blocking HTTP transport wrapper.
//!
//! [`HttpClient`] wraps a shared `reqwest` blocking client with the
//! conventions the rest of the crate relies on:
//!
//! - a per-request timeout taken from the settings,
//! - the `|header=value&header2=value2` URL suffix convention: anything after
//!   an unescaped `|` in a URL is split off and applied as request headers,
//! - non-cached requests (`Cache-Control: no-cache`), matching how segment
//!   fetches are issued.
//!
//! Automatic content decompression stays disabled; gzip bodies are detected
//! and inflated explicitly by the downloader.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::error::{HlsError, HlsResult};

/// Shared blocking HTTP client. Cloning is cheap (the underlying connection
/// pool is reference-counted).
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> HlsResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HlsError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetch a URL into a string (playlist bodies).
    pub fn get_text(&self, url: &str) -> HlsResult<String> {
        let response = self.open_request(url)?;
        response
            .text()
            .map_err(|e| HlsError::transport(format!("failed to read body of {url}: {e}")))
    }

    /// Open a streaming GET. Returns the response plus its content type, if
    /// the server sent one.
    pub fn open_stream(&self, url: &str) -> HlsResult<(Response, Option<String>)> {
        let response = self.open_request(url)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Ok((response, content_type))
    }

    /// Best-effort HEAD used to keep origin connections warm while the
    /// consumer is behind. Failures are only logged.
    pub fn ping(&self, url: &str) -> bool {
        let (base, headers) = split_header_suffix(url);
        let mut request = self.client.head(base);
        if let Some(suffix) = headers {
            request = request.headers(headers_from_suffix(suffix));
        }
        match request.send() {
            Ok(_) => true,
            Err(e) => {
                debug!(url = base, "ping failed: {e}");
                false
            }
        }
    }

    fn open_request(&self, url: &str) -> HlsResult<Response> {
        let (base, headers) = split_header_suffix(url);
        let mut request = self
            .client
            .get(base)
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(suffix) = headers {
            request = request.headers(headers_from_suffix(suffix));
        }
        let response = request
            .send()
            .map_err(|e| HlsError::transport(format!("failed to open {base}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HlsError::http_status(status.as_u16(), base));
        }
        Ok(response)
    }
}

/// Split a user-supplied URL into the fetchable part and the optional
/// `|`-separated header fragment.
pub fn split_header_suffix(url: &str) -> (&str, Option<&str>) {
    match url.find('|') {
        Some(pos) => (&url[..pos], Some(&url[pos + 1..])),
        None => (url, None),
    }
}

/// Parse a `name=value&name2=value2` header fragment (percent-encoded per
/// the usual convention) into a header map. Invalid entries are skipped.
pub fn headers_from_suffix(suffix: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in url::form_urlencoded::parse(suffix.as_bytes()) {
        let parsed_name = HeaderName::from_bytes(name.as_bytes());
        let parsed_value = HeaderValue::from_str(&value);
        match (parsed_name, parsed_value) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => {
                warn!(header = %name, "ignoring invalid header override");
            }
        }
    }
    headers
}
