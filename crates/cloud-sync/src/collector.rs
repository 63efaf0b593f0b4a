//! Remote collector client

use crate::config::UploadConfig;
use crate::UploadError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use storage::UploadRequest;
use tracing::debug;

/// Delivers one upload attempt. Ok means the collector acknowledged it.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn send(&self, request: &UploadRequest) -> Result<(), UploadError>;
}

/// Collector reached over HTTP
pub struct HttpCollector {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpCollector {
    pub fn new(config: &UploadConfig) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| UploadError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn send(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UploadError::Http(format!("invalid method {}", request.method)))?;
        let url = format!("{}{}", self.base_url, request.endpoint);

        let mut builder = self
            .client
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| UploadError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!("Collector accepted {} {}", request.method, url);
        Ok(())
    }
}
