//! HTTP client abstraction, so the pipeline can run against an in-memory
//! server in tests.

use clap::crate_version;
use std::{future::Future, time::Duration};
use tracing::trace;

const ZERO_DURATION: Duration = Duration::from_secs(0);

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
}

/// Asynchronous GET requests returning the whole body.
pub trait HttpClient: Send + Sync {
    /// Performs a GET request with the given extra headers. Non-success
    /// status codes are errors.
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> impl Future<Output = Result<Vec<u8>, HttpError>> + Send;
}

/// The production client, backed by reqwest.
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client with the given per-request timeout. Pass the zero
    /// duration to disable the timeout.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder();
        if timeout > ZERO_DURATION {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .user_agent(format!("mapillary-downloader_rs_{}", crate_version!()))
            .build()
            .map_err(|e| HttpError::Transport {
                url: String::new(),
                reason: format!("failed creating HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> impl Future<Output = Result<Vec<u8>, HttpError>> + Send {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let url = url.to_owned();

        async move {
            let transport = |e: reqwest::Error| HttpError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            };

            let response = request.send().await.map_err(transport)?;
            let status = response.status();
            trace!(%status, url = %url, "received response");

            if !status.is_success() {
                return Err(HttpError::Status {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await.map_err(transport)?;
            Ok(body.to_vec())
        }
    }
}
