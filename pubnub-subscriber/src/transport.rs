use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::types::{Error, Operation, Result};

pub(crate) const PNSDK: &str = concat!("PubNub-Rust-Subscriber/", env!("CARGO_PKG_VERSION"));

/// A REST call described independently of the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub operation: Operation,
    /// Unencoded path segments; the transport percent-encodes each one.
    pub path: Vec<String>,
    pub query: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// HTTP seam. Implementations must be cancel-safe: the client drops the
/// future to abort a call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(e.to_string())
        }
    }
}

/// Default transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: url::Url,
    use_request_id: bool,
}

impl ReqwestTransport {
    pub fn new(config: &ResolvedConfig) -> Result<Self> {
        let base_url = url::Url::parse(&config.base_url())?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Validation(format!(
                "origin {} cannot be used as a base URL",
                config.origin
            )));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Validation(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            use_request_id: config.use_request_id,
        })
    }

    pub(crate) fn url_for(&self, request: &TransportRequest) -> Result<url::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Validation("origin cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(&request.path);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("pnsdk", PNSDK);
            if self.use_request_id {
                pairs.append_pair("requestid", &uuid::Uuid::new_v4().to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let url = self.url_for(&request)?;
        debug!(operation = ?request.operation, path = %url.path(), "sending request");

        let response = self
            .client
            .get(url)
            .timeout(request.timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(TransportResponse { status, body })
    }
}
