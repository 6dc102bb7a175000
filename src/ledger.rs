use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};

use crate::error::Result;

/// Appends the ids of images that could not be fetched to a plain-text file,
/// one per line, so a later run can be pointed at just those.
#[derive(Debug)]
pub struct FailureRecorder {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl FailureRecorder {
    /// With no path, failures are only logged.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn record(&self, image_id: u64) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => {
                warn!(image_id, "image failed (no failure file configured)");
                return Ok(());
            }
        };

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(format!("{}\n", image_id).as_bytes()).await?;
        file.flush().await?;

        info!(image_id, path = %path.display(), "recorded failed image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_id_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.txt");
        std::fs::write(&path, "1\n").unwrap();

        let recorder = FailureRecorder::new(Some(path.clone()));
        assert_eq!(recorder.path(), Some(path.as_path()));
        recorder.record(2).await.unwrap();
        recorder.record(2).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n2\n");
    }

    #[tokio::test]
    async fn without_path_is_a_noop() {
        let recorder = FailureRecorder::new(None);
        assert!(recorder.path().is_none());
        assert!(recorder.record(5).await.is_ok());
    }
}
