//! Image metadata probing and the post-extraction enrichment pass shared by
//! both extraction paths.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ScrapeError;
use crate::images::{ImageRecord, RemoteImage};
use crate::utils::{DEFAULT_USER_AGENT, read_body_capped};

pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub image_type: String,
    pub byte_length: u64,
}

/// Fetches width, height, type and byte length for an image URL.
#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ImageMeta, ScrapeError>;
}

/// Downloads the image (bounded) and sniffs it with the `image` crate.
pub struct HttpImageProbe {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpImageProbe {
    pub fn new(timeout: Duration, max_bytes: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client, max_bytes }
    }
}

impl Default for HttpImageProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), MAX_IMAGE_BYTES)
    }
}

#[async_trait]
impl ImageProbe for HttpImageProbe {
    async fn probe(&self, url: &str) -> Result<ImageMeta, ScrapeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::Probe(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ScrapeError::Probe(format!("HTTP {}", response.status())));
        }

        let bytes = read_body_capped(response, self.max_bytes)
            .await
            .map_err(|e| ScrapeError::Probe(e.to_string()))?;

        sniff_image(&bytes)
    }
}

/// Read format and dimensions from an in-memory image.
pub fn sniff_image(bytes: &[u8]) -> Result<ImageMeta, ScrapeError> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ScrapeError::Probe(e.to_string()))?;

    let image_type = reader
        .format()
        .and_then(|f| f.extensions_str().first().copied())
        .ok_or_else(|| ScrapeError::Probe("unrecognised image format".to_string()))?
        .to_string();

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ScrapeError::Probe(e.to_string()))?;

    Ok(ImageMeta {
        width,
        height,
        image_type,
        byte_length: bytes.len() as u64,
    })
}

/// True when a `Content-Length` header announces more than `limit` bytes.
pub fn content_length_exceeds(headers: &HeaderMap, limit: u64) -> bool {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|len| len > limit)
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub head_timeout: Duration,
    pub max_image_bytes: u64,
    pub concurrency: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            head_timeout: Duration::from_secs(8),
            max_image_bytes: MAX_IMAGE_BYTES,
            concurrency: 8,
        }
    }
}

/// Fills in metadata for every remote image: HEAD size guard, then the probe,
/// then extension inference when either of those gave up.
#[derive(Clone)]
pub struct ImageEnricher {
    client: reqwest::Client,
    probe: Arc<dyn ImageProbe>,
    config: EnrichConfig,
}

impl ImageEnricher {
    pub fn new(probe: Arc<dyn ImageProbe>, config: EnrichConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.head_timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            probe,
            config,
        }
    }

    pub async fn enrich(&self, records: Vec<ImageRecord>) -> Vec<ImageRecord> {
        stream::iter(records)
            .map(|record| async move {
                match record {
                    ImageRecord::Remote(remote) => ImageRecord::Remote(self.enrich_one(remote).await),
                    inline => inline,
                }
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    async fn enrich_one(&self, mut image: RemoteImage) -> RemoteImage {
        if self.too_large(&image.url).await {
            log::debug!("Skipping probe for oversized image {}", image.url);
            image.infer_type();
            return image;
        }

        match self.probe.probe(&image.url).await {
            Ok(meta) => {
                image.width = Some(meta.width);
                image.height = Some(meta.height);
                image.image_type = Some(meta.image_type);
                image.size = Some(meta.byte_length);
            }
            Err(e) => {
                log::debug!("Probe failed for {}: {}", image.url, e);
                image.infer_type();
            }
        }
        image
    }

    /// Best-effort HEAD check. Any failure counts as "not too large".
    async fn too_large(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) => content_length_exceeds(resp.headers(), self.config.max_image_bytes),
            Err(_) => false,
        }
    }
}
