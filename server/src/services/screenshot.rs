//! Screenshot post-processing hook.
//!
//! Results that look like a base64-wrapped gzip stream are screenshots; the
//! result path hands them to a pluggable processor before storing. The
//! default implementation archives the decoded PNG under the downloads
//! directory and stores a pointer note instead of megabytes of pixels.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use flate2::read::GzDecoder;

/// Hook invoked with the raw base64 blob of a screenshot result.
pub trait ScreenshotProcessor: Send + Sync {
    /// Returns the string to store as the task result.
    fn process(&self, implant_id: &str, raw: &str) -> anyhow::Result<String>;
}

/// Default processor: gunzip and archive the PNG, return its location.
pub struct PngArchiver {
    downloads_dir: PathBuf,
}

impl PngArchiver {
    #[must_use]
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self { downloads_dir }
    }
}

impl ScreenshotProcessor for PngArchiver {
    fn process(&self, implant_id: &str, raw: &str) -> anyhow::Result<String> {
        let compressed = BASE64
            .decode(raw.trim())
            .context("screenshot blob is not valid base64")?;

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut png = Vec::new();
        decoder
            .read_to_end(&mut png)
            .context("screenshot blob is not a gzip stream")?;

        let dir = self.downloads_dir.join(implant_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;

        let path = dir.join(format!(
            "screenshot_{}.png",
            Utc::now().format("%Y%m%d_%H%M%S%.3f")
        ));
        std::fs::write(&path, &png).with_context(|| format!("cannot write {}", path.display()))?;

        Ok(format!(
            "Screenshot saved to '{}' ({} bytes)",
            path.display(),
            png.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn gzipped_b64(payload: &[u8]) -> String {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        BASE64.encode(encoder.finish().unwrap())
    }

    #[test]
    fn test_archives_png_and_returns_pointer() {
        let dir = TempDir::new().unwrap();
        let archiver = PngArchiver::new(dir.path().to_path_buf());
        let payload = b"\x89PNG\r\n\x1a\nfakepixels";

        let note = archiver
            .process("abcd1234", &gzipped_b64(payload))
            .unwrap();
        assert!(note.starts_with("Screenshot saved to"));

        let implant_dir = dir.path().join("abcd1234");
        let entries: Vec<_> = std::fs::read_dir(&implant_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let stored = std::fs::read(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_rejects_bad_base64() {
        let dir = TempDir::new().unwrap();
        let archiver = PngArchiver::new(dir.path().to_path_buf());
        assert!(archiver.process("abcd1234", "!!! not base64 !!!").is_err());
    }

    #[test]
    fn test_rejects_non_gzip_payload() {
        let dir = TempDir::new().unwrap();
        let archiver = PngArchiver::new(dir.path().to_path_buf());
        let blob = BASE64.encode(b"plain bytes, no gzip header");
        assert!(archiver.process("abcd1234", &blob).is_err());
    }
}
