use image::{ImageFormat, ImageReader};
use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
};
use tokio::fs;

use crate::error::{Error, Result};
use crate::feature::Feature;

/// Extension of stored images.
pub const IMAGE_EXT: &str = "jpg";

/// Checks that `data` decodes as a JPEG image (which includes MPO, the
/// multi-picture variant some cameras produce).
pub fn validate_image(data: &[u8]) -> Result<()> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| Error::DownloadValidation(e.to_string()))?;

    match reader.format() {
        Some(ImageFormat::Jpeg) => {}
        Some(other) => {
            return Err(Error::DownloadValidation(format!(
                "expected a JPEG, got {:?}",
                other
            )))
        }
        None => return Err(Error::DownloadValidation("unknown image format".to_owned())),
    }

    // a cut-off download can still decode, but loses the EOI marker that
    // closes the scan. Data after that marker is fine.
    let complete = scan_start(data)
        .and_then(|start| data.get(start..))
        .map_or(false, |scan| scan.windows(2).any(|w| w == [0xFF, 0xD9]));
    if !complete {
        return Err(Error::DownloadValidation(
            "JPEG is missing its end marker".to_owned(),
        ));
    }

    reader
        .decode()
        .map(|_| ())
        .map_err(|e| Error::DownloadValidation(e.to_string()))
}

/// Offset of the entropy-coded data of the first scan, found by walking the
/// marker segments after SOI.
fn scan_start(data: &[u8]) -> Option<usize> {
    let mut pos = 2;
    loop {
        while data.get(pos..pos + 2) == Some(&[0xFF, 0xFF][..]) {
            pos += 1;
        }
        if *data.get(pos)? != 0xFF {
            return None;
        }
        let marker = *data.get(pos + 1)?;
        let len = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]) as usize;
        if len < 2 {
            return None;
        }
        pos += 2 + len;
        if marker == 0xDA {
            return Some(pos);
        }
    }
}

/// Writes `data` to `path` through a temporary file in `dir` (which must be
/// on the same file system), so `path` never holds partial content.
pub(crate) async fn write_atomic(dir: &Path, path: &Path, data: Vec<u8>) -> Result<()> {
    let (dir, path) = (dir.to_owned(), path.to_owned());
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Images on disk, grouped into one directory per sequence:
/// `<root>/<sequence id>/<image id>.jpg`.
#[derive(Clone, Debug)]
pub struct SequenceStore {
    root: PathBuf,
}

impl SequenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, feature: &Feature) -> PathBuf {
        let mut target = self.root.join(&feature.sequence_id);
        target.push(format!("{}.{}", feature.image_id, IMAGE_EXT));
        target
    }

    /// Whether a valid image is already stored for the feature. Unreadable,
    /// truncated or otherwise corrupt files count as absent.
    pub async fn exists(&self, feature: &Feature) -> bool {
        match fs::read(self.path(feature)).await {
            Ok(data) => validate_image(&data).is_ok(),
            Err(_) => false,
        }
    }

    /// Writes the image to its canonical path, creating the sequence
    /// directory if needed.
    pub async fn commit(&self, feature: &Feature, data: &[u8]) -> Result<PathBuf> {
        let target = self.path(feature);
        let dir = self.root.join(&feature.sequence_id);
        fs::create_dir_all(&dir).await?;

        write_atomic(&dir, &target, data.to_vec()).await?;

        Ok(target)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    pub(crate) fn encode(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb([200, 30, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    pub(crate) fn jpeg() -> Vec<u8> {
        encode(ImageFormat::Jpeg)
    }

    fn feature(image_id: u64, sequence_id: &str) -> Feature {
        Feature {
            image_id,
            sequence_id: sequence_id.to_owned(),
            lng: 4.5,
            lat: 52.5,
            is_pano: false,
        }
    }

    #[test]
    fn accepts_jpeg_only() {
        assert!(validate_image(&jpeg()).is_ok());
        assert!(matches!(
            validate_image(&encode(ImageFormat::Png)),
            Err(Error::DownloadValidation(_))
        ));
        assert!(validate_image(b"<html>rate limited</html>").is_err());
        assert!(validate_image(&[]).is_err());
    }

    #[test]
    fn rejects_truncated_jpeg() {
        let data = jpeg();
        assert!(validate_image(&data[..data.len() / 3]).is_err());
        assert!(validate_image(&data[..data.len() - 2]).is_err());
    }

    #[test]
    fn accepts_data_after_end_marker() {
        let mut data = jpeg();
        data.extend_from_slice(b"trailer-data");
        assert!(validate_image(&data).is_ok());

        let mut padded = jpeg();
        padded.extend_from_slice(&[0; 16]);
        assert!(validate_image(&padded).is_ok());
    }

    #[test]
    fn cut_mid_scan_fails() {
        let full = jpeg();
        let start = scan_start(&full).unwrap();
        assert!(start < full.len() - 2);

        let mut cut = full[..(start + full.len()) / 2].to_vec();
        assert!(validate_image(&cut).is_err());
        cut.extend_from_slice(&[0; 8]);
        assert!(validate_image(&cut).is_err());
    }

    #[tokio::test]
    async fn image_with_trailer_counts_as_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::new(dir.path());
        let f = feature(9, "seq");

        let mut data = jpeg();
        data.extend_from_slice(b"motion-photo");
        store.commit(&f, &data).await.unwrap();
        assert!(store.exists(&f).await);
    }

    #[test]
    fn layout() {
        let store = SequenceStore::new("/data/seqs");
        assert_eq!(
            store.path(&feature(42, "abc")),
            PathBuf::from("/data/seqs/abc/42.jpg")
        );
    }

    #[tokio::test]
    async fn commit_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::new(dir.path());
        let f = feature(42, "abc");

        assert!(!store.exists(&f).await);
        let path = store.commit(&f, &jpeg()).await.unwrap();
        assert_eq!(path, dir.path().join("abc").join("42.jpg"));
        assert!(store.exists(&f).await);

        let leftovers = std::fs::read_dir(dir.path().join("abc")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::new(dir.path());
        let f = feature(7, "seq");

        std::fs::create_dir_all(dir.path().join("seq")).unwrap();
        let data = jpeg();
        std::fs::write(store.path(&f), &data[..data.len() / 2]).unwrap();
        assert!(!store.exists(&f).await);
    }
}
