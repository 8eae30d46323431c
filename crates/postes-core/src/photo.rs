//! Photo preparation for captured records.
//!
//! A capture is shrunk to a bounded width and re-encoded as JPEG before the
//! record references it, so queued uploads stay small.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PhotoConfig;
use crate::remote::PhotoUpload;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to process image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Resize `source` to at most `config.max_width` pixels wide and write it as
/// a JPEG into `dest_dir`. Returns the path of the new file.
pub fn prepare(source: &Path, dest_dir: &Path, config: &PhotoConfig) -> Result<PathBuf, PhotoError> {
    let img = image::open(source).map_err(|source_err| PhotoError::Image {
        path: source.to_path_buf(),
        source: source_err,
    })?;

    let img = if img.width() > config.max_width {
        let height = (u64::from(img.height()) * u64::from(config.max_width) / u64::from(img.width())).max(1);
        img.resize_exact(config.max_width, height as u32, FilterType::Triangle)
    } else {
        img
    };

    std::fs::create_dir_all(dest_dir).map_err(|e| PhotoError::Io {
        path: dest_dir.to_path_buf(),
        source: e,
    })?;
    let dest = dest_dir.join(format!("{}.jpg", Uuid::new_v4()));
    let file = File::create(&dest).map_err(|e| PhotoError::Io {
        path: dest.clone(),
        source: e,
    })?;

    let quality = config.jpeg_quality.clamp(1, 100);
    let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
    // JPEG has no alpha channel
    img.to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| PhotoError::Image {
            path: dest.clone(),
            source: e,
        })?;

    Ok(dest)
}

/// Read a prepared photo for upload.
pub async fn load(path: &Path) -> Result<PhotoUpload, PhotoError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| PhotoError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "foto.jpg".to_string());
    Ok(PhotoUpload {
        mime: mime_for(path),
        file_name,
        bytes,
    })
}

fn mime_for(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "jpeg".to_string());
    match ext.as_str() {
        "jpg" => "image/jpeg".to_string(),
        other => format!("image/{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_png(path: &Path, width: u32, height: u32) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn wide_images_are_shrunk_to_max_width() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("capture.png");
        write_png(&source, 1600, 1200);

        let out = prepare(&source, &dir.path().join("photos"), &PhotoConfig::default()).unwrap();
        assert_eq!(out.extension().unwrap(), "jpg");

        let resized = image::open(&out).unwrap();
        assert_eq!((resized.width(), resized.height()), (800, 600));
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("small.png");
        write_png(&source, 320, 240);

        let out = prepare(&source, dir.path(), &PhotoConfig::default()).unwrap();
        let kept = image::open(&out).unwrap();
        assert_eq!((kept.width(), kept.height()), (320, 240));
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = prepare(&dir.path().join("nope.png"), dir.path(), &PhotoConfig::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn load_derives_name_and_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p1.jpg");
        std::fs::write(&path, b"jpeg-bytes").unwrap();

        let upload = load(&path).await.unwrap();
        assert_eq!(upload.file_name, "p1.jpg");
        assert_eq!(upload.mime, "image/jpeg");
        assert_eq!(upload.bytes, b"jpeg-bytes");
    }
}
