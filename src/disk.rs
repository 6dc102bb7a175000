use std::{io, path::Path, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// Measures the free space of the file system hosting a path.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Asks the OS via `statvfs(3)`. Reports the space available to
/// unprivileged users.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

/// Refuses writes once free space on the destination drops below a floor.
#[derive(Clone)]
pub struct DiskSpaceGuard {
    required: u64,
    probe: Arc<dyn SpaceProbe>,
    lock: Arc<Mutex<()>>,
}

impl DiskSpaceGuard {
    pub fn new(required: u64) -> Self {
        Self::with_probe(required, StatvfsProbe)
    }

    pub fn with_probe(required: u64, probe: impl SpaceProbe + 'static) -> Self {
        Self {
            required,
            probe: Arc::new(probe),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// Pre-flight check: is there at least the floor left on `path`'s file
    /// system?
    pub fn check(&self, path: &Path) -> Result<()> {
        self.ensure(path, 0)
    }

    /// Runs `write` only if `len` more bytes still leave the floor free.
    /// Admissions are serialized, so concurrent writers can't jointly pass the
    /// check and overdraw the floor.
    pub async fn admit<T, F, Fut>(&self, path: &Path, len: u64, write: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.lock.lock().await;
        self.ensure(path, len)?;
        write().await
    }

    fn ensure(&self, path: &Path, len: u64) -> Result<()> {
        let available = self.probe.available(path)?;
        let required = self.required.saturating_add(len);

        if available < required {
            warn!(
                available = %pretty_bytes::converter::convert(available as f64),
                required = %pretty_bytes::converter::convert(required as f64),
                "insufficient free disk space",
            );
            return Err(Error::InsufficientSpace {
                available,
                required,
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for DiskSpaceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSpaceGuard")
            .field("required", &self.required)
            .finish()
    }
}
