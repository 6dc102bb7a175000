use std::{io, path::PathBuf, sync::Arc};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::feature::{decode_vector_tile, FeatureCollection};
use crate::http::HttpClient;
use crate::store::write_atomic;
use crate::tile::Tile;
use crate::url::{UrlFormat, TILE_URL};

/// Coverage tileset the images are published in.
pub const COVERAGE: &str = "mly1_public";

/// Layer of the coverage tiles holding one point per image.
pub const IMAGE_LAYER: &str = "image";

/// Read-through cache of decoded coverage tiles, one JSON file per tile
/// named after [`Tile::cache_key`].
pub struct TileCache<C> {
    dir: PathBuf,
    client: Arc<C>,
    url: UrlFormat,
    token: String,
}

impl<C: HttpClient> TileCache<C> {
    pub fn new(dir: impl Into<PathBuf>, client: Arc<C>, token: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            client,
            url: UrlFormat::from_str(TILE_URL),
            token: token.into(),
        }
    }

    /// Fetch tiles from somewhere other than the public endpoint.
    pub fn with_url(mut self, url: UrlFormat) -> Self {
        self.url = url;
        self
    }

    pub fn path(&self, tile: &Tile) -> PathBuf {
        self.dir.join(tile.cache_key(COVERAGE))
    }

    /// Returns the tile's features, from disk if present and non-empty, from
    /// the tile server otherwise (or when `force_refresh` is set).
    ///
    /// Tiles without any images are never written to the cache.
    #[instrument(skip(self, tile), fields(tile = %tile))]
    pub async fn fetch(&self, tile: Tile, force_refresh: bool) -> Result<FeatureCollection> {
        if !force_refresh {
            if let Some(cached) = self.load(&tile).await? {
                debug!(features = cached.features.len(), "loaded tile from cache");
                return Ok(cached);
            }
        }

        info!("fetching tile from Mapillary");
        let url = self.url.tile_url(&tile, COVERAGE, &self.token)?;
        let data = self
            .client
            .get(&url, &[])
            .await
            .map_err(|e| Error::TileFetch {
                tile,
                reason: self.redact(e.to_string()),
            })?;

        let collection = decode_vector_tile(&data, tile, IMAGE_LAYER)?;
        if collection.is_empty() {
            debug!("tile holds no images, not caching it");
            return Ok(collection);
        }

        fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.dir, &self.path(&tile), collection.to_json()?).await?;
        debug!(features = collection.features.len(), "cached tile");

        Ok(collection)
    }

    fn redact(&self, msg: String) -> String {
        if self.token.is_empty() {
            msg
        } else {
            msg.replace(&self.token, "<token>")
        }
    }

    async fn load(&self, tile: &Tile) -> Result<Option<FeatureCollection>> {
        let path = self.path(tile);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match FeatureCollection::from_json(&data) {
            Ok(collection) if !collection.is_empty() => Ok(Some(collection)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable cache entry");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::tests::encode_tile;
    use crate::http::testing::FakeClient;

    const URL: &str = "https://tiles.example/{coverage}/{z}/{x}/{y}?access_token={token}";

    fn cache(dir: &std::path::Path, client: &Arc<FakeClient>) -> TileCache<FakeClient> {
        TileCache::new(dir, client.clone(), "secret").with_url(UrlFormat::from_str(URL))
    }

    fn tile_url(tile: Tile) -> String {
        format!(
            "https://tiles.example/mly1_public/{}/{}/{}?access_token=secret",
            tile.z, tile.x, tile.y
        )
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::default());
        let tile = Tile::new(10, 20, 14);
        client.respond(&tile_url(tile), Ok(encode_tile(&[(1, "s", 100, 100)])));

        let cache = cache(dir.path(), &client);
        let first = cache.fetch(tile, false).await.unwrap();
        assert_eq!(client.calls().len(), 1);
        assert!(dir.path().join("mly1_public_10_20_14").is_file());

        // the remote tile changes, the cached copy wins
        client.respond(&tile_url(tile), Ok(encode_tile(&[(2, "s", 5, 5)])));
        let second = cache.fetch(tile, false).await.unwrap();
        assert_eq!(client.calls().len(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn force_refresh_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::default());
        let tile = Tile::new(10, 20, 14);
        client.respond(&tile_url(tile), Ok(encode_tile(&[(1, "s", 100, 100)])));
        client.respond(&tile_url(tile), Ok(encode_tile(&[(2, "s", 5, 5)])));

        let cache = cache(dir.path(), &client);
        cache.fetch(tile, false).await.unwrap();
        let refreshed = cache.fetch(tile, true).await.unwrap();
        assert_eq!(client.calls().len(), 2);
        assert_eq!(refreshed.features[0].properties.id, 2);

        let reloaded = cache.fetch(tile, false).await.unwrap();
        assert_eq!(reloaded, refreshed);
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn empty_tiles_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::default());
        let tile = Tile::new(1, 2, 14);
        client.respond(&tile_url(tile), Ok(encode_tile(&[])));

        let cache = cache(dir.path(), &client);
        assert!(cache.fetch(tile, false).await.unwrap().is_empty());
        assert!(!cache.path(&tile).exists());
        cache.fetch(tile, false).await.unwrap();
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn remote_failure_hides_token() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::default());
        let tile = Tile::new(3, 4, 14);
        client.respond(&tile_url(tile), Err(500));

        let err = cache(dir.path(), &client).fetch(tile, false).await.unwrap_err();
        match err {
            Error::TileFetch { tile: t, reason } => {
                assert_eq!(t, tile);
                assert!(!reason.contains("secret"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreadable_entry_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::default());
        let tile = Tile::new(5, 6, 14);
        client.respond(&tile_url(tile), Ok(encode_tile(&[(9, "s", 1, 1)])));

        let cache = cache(dir.path(), &client);
        std::fs::write(cache.path(&tile), "{\"type\":").unwrap();
        let collection = cache.fetch(tile, false).await.unwrap();
        assert_eq!(collection.features[0].properties.id, 9);
        assert_eq!(client.calls().len(), 1);
    }
}
