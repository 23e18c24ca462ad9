use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use url::{Origin, Url};

use super::request::{Request, Response, ResponseType};

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to precache {url}: {reason}")]
    Install { url: String, reason: String },

    #[error("Cannot {action} while the cache manager is {state}")]
    InvalidState { action: &'static str, state: String },
}

/// Network access used by the cache manager.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Fetcher backed by reqwest.
///
/// Responses whose final URL shares the application origin are `basic`,
/// everything else is `cors`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: Origin,
}

impl HttpFetcher {
    pub fn new(app_origin: &Url) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            origin: app_origin.origin(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let response_type = if response.url().origin() == self.origin {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        };
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .to_vec();

        Ok(Response {
            status,
            response_type,
            url,
            headers,
            body,
        })
    }
}
