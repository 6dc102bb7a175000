use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::retry::{RetryError, RetryPolicy};
use crate::url::{UrlFormat, IMAGE_URL};

const SNIPPET_LEN: usize = 200;

#[derive(Debug, Deserialize)]
struct ImageUrlResponse {
    thumb_original_url: Option<String>,
}

/// Looks up the original-resolution download URL of an image through the
/// authenticated Graph API.
pub struct ImageResolver<C> {
    client: Arc<C>,
    url: UrlFormat,
    token: String,
    policy: RetryPolicy,
}

impl<C: HttpClient> ImageResolver<C> {
    pub fn new(client: Arc<C>, token: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            client,
            url: UrlFormat::from_str(IMAGE_URL),
            token: token.into(),
            policy,
        }
    }

    pub fn with_url(mut self, url: UrlFormat) -> Self {
        self.url = url;
        self
    }

    /// Resolves `image_id`, retrying transport errors, unparseable responses
    /// and responses without a URL until the retry budget is spent.
    #[instrument(skip(self, cancel))]
    pub async fn resolve(&self, image_id: u64, cancel: &CancellationToken) -> Result<String> {
        let url = self.url.image_url(image_id)?;
        let auth = format!("OAuth {}", self.token);
        let (url, auth) = (url.as_str(), auth.as_str());

        let res = self
            .policy
            .run(cancel, |attempt| async move {
                debug!(attempt, "requesting image URL");
                let body = self
                    .client
                    .get(url, &[("Authorization", auth)])
                    .await
                    .map_err(|e| e.to_string())?;

                let parsed: ImageUrlResponse = serde_json::from_slice(&body)
                    .map_err(|e| format!("unparseable response ({}): {}", e, snippet(&body)))?;

                parsed
                    .thumb_original_url
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| format!("thumb_original_url not found in {}", snippet(&body)))
            })
            .await;

        match res {
            Ok(url) => Ok(url),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(Error::ResolveExhausted {
                image_id,
                attempts,
                reason: last,
            }),
        }
    }
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(SNIPPET_LEN) {
        Some((i, _)) => format!("{}...", &text[..i]),
        None => text.into_owned(),
    }
}
