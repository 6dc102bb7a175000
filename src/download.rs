use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::retry::{RetryError, RetryPolicy};
use crate::store::validate_image;

/// What to do when an image can't be downloaded within the retry budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownloadFailurePolicy {
    #[default]
    /// Stop the whole run and exit with an error.
    Abort,
    /// Record the image as failed and carry on with the next one.
    Record,
}

impl std::str::FromStr for DownloadFailurePolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(DownloadFailurePolicy::Abort),
            "record" => Ok(DownloadFailurePolicy::Record),
            _ => Err("expected `abort` or `record`"),
        }
    }
}

/// Fetches image payloads, retrying until they validate as JPEGs.
pub struct ImageDownloader<C> {
    client: Arc<C>,
    policy: RetryPolicy,
}

impl<C: HttpClient> ImageDownloader<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Downloads the image behind `url`. Transport errors and payloads that
    /// aren't a decodable JPEG count as failed attempts.
    #[instrument(skip(self, url, cancel))]
    pub async fn download(
        &self,
        image_id: u64,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let res = self
            .policy
            .run(cancel, |attempt| async move {
                debug!(attempt, "downloading image");
                let data = self.client.get(url, &[]).await.map_err(|e| e.to_string())?;

                match validate_image(&data) {
                    Ok(()) => Ok(data),
                    Err(e) => {
                        warn!(attempt, error = %e, "downloaded data is not a JPEG");
                        Err(e.to_string())
                    }
                }
            })
            .await;

        match res {
            Ok(data) => Ok(data),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(Error::DownloadExhausted {
                image_id,
                attempts,
                reason: last,
            }),
        }
    }
}
