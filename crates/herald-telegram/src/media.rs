//! Media acquisition for album sends — download into a scratch directory,
//! with an optional re-encode toward photo-compatible JPEG.

use herald_core::{HeraldError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Downloads media references into a scratch directory.
///
/// A reference that names an existing local file is used as-is. Downloads
/// go through a shared client first; on failure a fresh one-shot client
/// retries once before the reference is given up.
pub struct MediaFetcher {
    client: reqwest::Client,
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Materialize `reference` as a file path, downloading into `dir` when
    /// it is not already a local file.
    pub async fn fetch(&self, reference: &str, dir: &Path) -> Result<PathBuf> {
        let local = Path::new(reference);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }

        let dest = dir.join(scratch_name(reference));
        match self.download(&self.client, reference, &dest).await {
            Ok(path) => Ok(path),
            Err(e) => {
                tracing::debug!("Primary download of {reference} failed ({e}), one-shot retry");
                let fallback = reqwest::Client::new();
                self.download(&fallback, reference, &dest).await
            }
        }
    }

    async fn download(
        &self,
        client: &reqwest::Client,
        url: &str,
        dest: &Path,
    ) -> Result<PathBuf> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| HeraldError::Http(format!("download {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(HeraldError::Http(format!(
                "download {url} failed: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HeraldError::Http(format!("download {url} truncated: {e}")))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(dest.to_path_buf())
    }
}

/// Scratch filename for a reference: content-addressed on the URL, keeping
/// a recognizable image extension when the URL carries one.
fn scratch_name(reference: &str) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    let mut hex = String::with_capacity(32);
    for b in &digest[..16] {
        hex.push_str(&format!("{b:02x}"));
    }
    let ext = reference
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| matches!(e.as_str(), "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif"))
        .unwrap_or_else(|| "jpg".into());
    format!("{hex}.{ext}")
}

/// Re-encode `src` as a baseline RGB JPEG (quality 90) in `dir`.
///
/// Any decode or encode failure falls back to the original file; a bad
/// re-encode must never cost the upload attempt.
#[cfg(feature = "transcode")]
pub fn normalize_photo(src: &Path, dir: &Path) -> PathBuf {
    match transcode_jpeg(src, dir) {
        Ok(out) => out,
        Err(e) => {
            tracing::debug!("Transcode of {} skipped: {e}", src.display());
            src.to_path_buf()
        }
    }
}

#[cfg(not(feature = "transcode"))]
pub fn normalize_photo(src: &Path, _dir: &Path) -> PathBuf {
    src.to_path_buf()
}

#[cfg(feature = "transcode")]
fn transcode_jpeg(src: &Path, dir: &Path) -> anyhow::Result<PathBuf> {
    let img = image::ImageReader::open(src)?.with_guessed_format()?.decode()?;
    let rgb = img.to_rgb8();

    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo".into());
    let out = dir.join(format!("{stem}.norm.jpg"));
    let mut file = std::fs::File::create(&out)?;
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut file, 90);
    rgb.write_with_encoder(encoder)?;
    Ok(out)
}
