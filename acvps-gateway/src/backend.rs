//! HTTP client for the LLM backend.
//!
//! Requests are buffered in full: the response stage needs the whole body
//! before anything can be released to the caller.
//!
//! The caller's `Accept-Encoding` is not forwarded. The client advertises
//! only the codings it decodes (gzip, brotli, deflate) and hands back a
//! decoded body, so mitigation always sees plain bytes. A response still
//! carrying a `Content-Encoding` is refused.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, Method, StatusCode, header};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use acvps_core::config::BackendSection;

/// Connection-scoped headers that must not be forwarded (RFC 9110 §7.6.1),
/// plus framing headers the client recomputes.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("failed to connect to backend {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend response exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("backend response uses unsupported content encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),
}

/// A fully read backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct BackendClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    max_body_bytes: usize,
}

impl BackendClient {
    pub fn new(config: &BackendSection, max_body_bytes: usize) -> Result<Self, BackendError> {
        if let Err(e) = reqwest::Url::parse(&config.url) {
            return Err(BackendError::Config(format!(
                "invalid backend url '{}': {e}",
                config.url
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            max_body_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Forward a request to `{base_url}{path_and_query}`.
    pub async fn forward(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<BackendResponse, BackendError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(method = %method, url = %url, "Forwarding to backend");

        let response = self
            .client
            .request(method.clone(), &url)
            .headers(outbound(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify_error(e))?;

        let status = response.status();
        if let Some(encoding) = remaining_encoding(response.headers()) {
            warn!(encoding = %encoding, "Backend response encoding cannot be decoded");
            return Err(BackendError::UnsupportedEncoding(encoding));
        }
        let headers = forwardable(response.headers());
        let body = self.read_body_limited(response).await?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }

    async fn read_body_limited(&self, mut response: reqwest::Response) -> Result<Bytes, BackendError> {
        let limit = self.max_body_bytes;
        if let Some(length) = response.content_length()
            && length as usize > limit
        {
            warn!(content_length = length, limit, "Backend response exceeds size limit");
            return Err(BackendError::TooLarge { limit });
        }

        let mut buf = Vec::with_capacity(
            response
                .content_length()
                .map(|n| n as usize)
                .unwrap_or(8192)
                .min(limit),
        );
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.classify_error(e))?
        {
            if buf.len() + chunk.len() > limit {
                warn!(accumulated = buf.len(), limit, "Backend response exceeds size limit while streaming");
                return Err(BackendError::TooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.into())
    }

    fn classify_error(&self, error: reqwest::Error) -> BackendError {
        if error.is_timeout() {
            warn!(url = %self.base_url, timeout_secs = self.timeout.as_secs(), "Backend request timed out");
            BackendError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else if error.is_connect() {
            warn!(url = %self.base_url, "Failed to connect to backend");
            BackendError::Connect {
                url: self.base_url.clone(),
                reason: error.to_string(),
            }
        } else {
            warn!(error = %error, "Backend request failed");
            BackendError::Request(error.to_string())
        }
    }
}

/// Copy of `headers` without hop-by-hop, host and length headers.
pub fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Request headers for the backend: forwardable, minus `Accept-Encoding`.
fn outbound(headers: &HeaderMap) -> HeaderMap {
    let mut out = forwardable(headers);
    out.remove(header::ACCEPT_ENCODING);
    out
}

/// A `Content-Encoding` left on a response after the client's decoders ran.
fn remaining_encoding(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_ENCODING)?;
    let value = value.to_str().unwrap_or("invalid").trim();
    (!value.is_empty() && !value.eq_ignore_ascii_case("identity")).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use wiremock::matchers::{body_string, header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(url: &str, limit: usize) -> BackendClient {
        let config = BackendSection {
            url: url.to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        BackendClient::new(&config, limit).unwrap()
    }

    #[test]
    fn test_forwardable_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(header::HOST, HeaderValue::from_static("gw"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        headers.insert("x-contract-id", HeaderValue::from_static("dc-1"));

        let out = forwardable(&headers);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key(header::AUTHORIZATION));
        assert!(out.contains_key("x-contract-id"));
    }

    #[test]
    fn test_outbound_drops_accept_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));

        let out = outbound(&headers);
        assert!(!out.contains_key(header::ACCEPT_ENCODING));
        assert!(out.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn test_remaining_encoding() {
        let mut headers = HeaderMap::new();
        assert_eq!(remaining_encoding(&headers), None);
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert_eq!(remaining_encoding(&headers), None);
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        assert_eq!(remaining_encoding(&headers).as_deref(), Some("zstd"));
    }

    #[tokio::test]
    async fn test_gzip_response_is_decoded() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"answer\":\"hello\"}").unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_bytes(compressed),
            )
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let response = client(&server.uri(), 1024)
            .forward(&Method::GET, "/", &headers, Bytes::new())
            .await
            .unwrap();

        assert_eq!(response.body, Bytes::from_static(b"{\"answer\":\"hello\"}"));
        assert!(!response.headers.contains_key(header::CONTENT_ENCODING));
    }

    #[tokio::test]
    async fn test_undecodable_encoding_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "zstd")
                    .set_body_bytes(vec![0x28, 0xb5, 0x2f, 0xfd]),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri(), 1024)
            .forward(&Method::GET, "/", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedEncoding(ref e) if e == "zstd"));
    }

    #[test]
    fn test_rejects_invalid_url() {
        let config = BackendSection {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            BackendClient::new(&config, 1024),
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_forwards_method_path_query_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .and(query_param("stream", "false"))
            .and(header_is("x-tenant-id", "acme"))
            .and(body_string("{\"query\":\"hi\"}"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-backend", "yes")
                    .set_body_string("{\"answer\":\"hello\"}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", HeaderValue::from_static("acme"));
        let response = client(&format!("{}/", server.uri()), 1024)
            .forward(
                &Method::POST,
                "/v1/chat?stream=false",
                &headers,
                Bytes::from_static(b"{\"query\":\"hi\"}"),
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["x-backend"], "yes");
        assert_eq!(response.body, Bytes::from_static(b"{\"answer\":\"hello\"}"));
    }

    #[tokio::test]
    async fn test_response_size_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(100)))
            .mount(&server)
            .await;

        let err = client(&server.uri(), 10)
            .forward(&Method::GET, "/", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::TooLarge { limit: 10 }));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let err = client("http://127.0.0.1:1", 1024)
            .forward(&Method::GET, "/", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Connect { .. } | BackendError::Request(_)
        ));
    }
}
