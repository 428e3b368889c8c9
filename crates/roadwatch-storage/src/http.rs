use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Used when the response's `Content-Type` does not name a charset.
    pub default_charset: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            default_charset: "utf-8".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL after redirects; relative references in the body resolve against it.
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Network seam between the pipeline and the monitored site.
///
/// Implementations make exactly one attempt per call; a failed call is
/// retried only by the next scheduled invocation.
#[async_trait]
pub trait HttpSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    default_charset: String,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            default_charset: config.default_charset,
        })
    }

    async fn get_success(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?;

        let status = resp.status();
        debug!(status = status.as_u16(), final_url = %resp.url(), "response received");
        if !status.is_success() {
            return Err(http_status_error(status, resp.url().as_str()));
        }
        Ok(resp)
    }
}

fn http_status_error(status: StatusCode, url: &str) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

#[async_trait]
impl HttpSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        async {
            let resp = self.get_success(url).await?;
            let final_url = resp.url().to_string();
            let body = resp
                .text_with_charset(&self.default_charset)
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;
            if body.trim().is_empty() {
                return Err(FetchError::EmptyBody {
                    url: final_url,
                });
            }
            Ok::<_, FetchError>(FetchedPage { final_url, body })
        }
        .instrument(tracing::info_span!("fetch_page", url))
        .await
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        async {
            let resp = self.get_success(url).await?;
            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;
            if body.is_empty() {
                return Err(FetchError::EmptyBody {
                    url: url.to_string(),
                });
            }
            Ok::<_, FetchError>(body.to_vec())
        }
        .instrument(tracing::info_span!("fetch_bytes", url))
        .await
    }
}
