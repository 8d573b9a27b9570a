// Retrieval and decoding of remote or on-disk audio files.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use super::decode::{decode_audio, PcmBuffer};
use crate::error::{Result, VisualizerError};

/// Fetches the raw bytes behind a URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// `http(s)://` over reqwest, `file://` and bare paths from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn fetch_error(url: &str, reason: impl ToString) -> VisualizerError {
    VisualizerError::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            debug!("GET {}", url);
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| fetch_error(url, e))?;
            let bytes = response.bytes().await.map_err(|e| fetch_error(url, e))?;
            return Ok(bytes.to_vec());
        }

        let path = url.strip_prefix("file://").unwrap_or(url);
        tokio::fs::read(Path::new(path))
            .await
            .map_err(|e| fetch_error(url, e))
    }
}

/// Decoded buffers keyed by URL, shared across sources of one visualizer.
#[derive(Default)]
pub struct DecodeCache {
    entries: Mutex<HashMap<String, Arc<PcmBuffer>>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<Arc<PcmBuffer>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    pub fn insert(&self, url: &str, buffer: Arc<PcmBuffer>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), buffer);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns a URL into a decoded buffer at the context rate, going through the
/// cache first.
pub struct SourceLoader {
    fetcher: Arc<dyn AssetFetcher>,
    cache: DecodeCache,
    sample_rate: u32,
}

impl SourceLoader {
    pub fn new(fetcher: Arc<dyn AssetFetcher>, sample_rate: u32) -> Self {
        Self {
            fetcher,
            cache: DecodeCache::new(),
            sample_rate,
        }
    }

    pub fn cache(&self) -> &DecodeCache {
        &self.cache
    }

    pub async fn load(&self, url: &str) -> Result<Arc<PcmBuffer>> {
        if let Some(buffer) = self.cache.get(url) {
            debug!("Decode cache hit for {}", url);
            return Ok(buffer);
        }

        let bytes = self.fetcher.fetch(url).await?;
        let owned_url = url.to_string();
        let rate = self.sample_rate;
        let pcm = tokio::task::spawn_blocking(move || decode_audio(bytes, &owned_url, rate))
            .await
            .map_err(|e| VisualizerError::Decode {
                url: url.to_string(),
                reason: format!("decoder task failed: {}", e),
            })??;

        info!(
            "Decoded {} ({:.1}s at {} Hz)",
            url,
            pcm.duration_secs(),
            pcm.sample_rate
        );
        let buffer = Arc::new(pcm);
        self.cache.insert(url, Arc::clone(&buffer));
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav(samples: usize, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..samples {
                writer.write_sample((i % 100) as i16 * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_reads_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, b"abc").unwrap();

        let fetcher = HttpFetcher::new();
        let plain = fetcher.fetch(path.to_str().unwrap()).await.unwrap();
        let url = format!("file://{}", path.display());
        let prefixed = fetcher.fetch(&url).await.unwrap();
        assert_eq!(plain, b"abc");
        assert_eq!(prefixed, b"abc");
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let fetcher = HttpFetcher::new();
        let result = fetcher.fetch("/definitely/not/here.mp3").await;
        assert!(matches!(result, Err(VisualizerError::Fetch { .. })));
    }

    #[tokio::test]
    async fn test_loader_decodes_once_per_url() {
        let mut fetcher = MockAssetFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url: &str| url == "mem://tone.wav")
            .times(1)
            .returning(|_| Ok(wav(800, 8000)));

        let loader = SourceLoader::new(Arc::new(fetcher), 8000);
        let first = loader.load("mem://tone.wav").await.unwrap();
        let second = loader.load("mem://tone.wav").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.samples.len(), 800);
        assert_eq!(loader.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_loader_does_not_cache_failures() {
        let mut fetcher = MockAssetFetcher::new();
        fetcher
            .expect_fetch()
            .times(2)
            .returning(|_| Ok(b"not audio".to_vec()));

        let loader = SourceLoader::new(Arc::new(fetcher), 8000);
        for _ in 0..2 {
            let result = loader.load("mem://broken.wav").await;
            assert!(matches!(result, Err(VisualizerError::Decode { .. })));
        }
        assert!(loader.cache().is_empty());
    }
}
