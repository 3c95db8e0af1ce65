//! Frame sources.

use image::RgbImage;
use reqwest::Client;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CameraError, CameraProperty};

/// Something that can produce camera images.
///
/// Sources are owned by a single feed task, so methods take `&mut self`.
pub trait FrameSource: Send + 'static {
    /// Read the next image.
    fn read_frame(&mut self) -> impl Future<Output = Result<RgbImage, CameraError>> + Send;

    /// Re-open the underlying device after a read failure.
    fn reconnect(&mut self) -> impl Future<Output = Result<(), CameraError>> + Send;

    /// Set a property in hardware. Sources without hardware controls return
    /// [`CameraError::UnsupportedProperty`] and the feed adjusts in software.
    fn set_property(&mut self, property: CameraProperty, _value: f32) -> Result<(), CameraError> {
        Err(CameraError::UnsupportedProperty(property))
    }

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// A camera that serves single JPEG/PNG snapshots over HTTP, such as
/// mjpg-streamer's `?action=snapshot`.
pub struct SnapshotSource {
    url: String,
    timeout: Duration,
    client: Client,
}

impl SnapshotSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CameraError> {
        Ok(Self {
            url: url.into(),
            timeout,
            client: Self::build_client(timeout)?,
        })
    }

    fn build_client(timeout: Duration) -> Result<Client, CameraError> {
        Ok(Client::builder().timeout(timeout).build()?)
    }
}

impl FrameSource for SnapshotSource {
    async fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(CameraError::ReadFailed(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        Ok(image::load_from_memory(&bytes)?.to_rgb8())
    }

    async fn reconnect(&mut self) -> Result<(), CameraError> {
        debug!(url = %self.url, "rebuilding snapshot client");
        self.client = Self::build_client(self.timeout)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("snapshot camera at {}", self.url)
    }
}

#[derive(Debug, Clone)]
enum Still {
    File(PathBuf),
    Image(Arc<RgbImage>),
}

/// Cycles through still images, from disk or memory.
#[derive(Debug, Clone)]
pub struct StillSource {
    stills: Vec<Still>,
    next: usize,
}

impl StillSource {
    /// Images loaded from files on every read.
    pub fn from_files<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            stills: paths.into_iter().map(|p| Still::File(p.into())).collect(),
            next: 0,
        }
    }

    /// Images already in memory.
    pub fn from_images(images: Vec<RgbImage>) -> Self {
        Self {
            stills: images.into_iter().map(|i| Still::Image(Arc::new(i))).collect(),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.stills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stills.is_empty()
    }
}

impl FrameSource for StillSource {
    async fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        if self.stills.is_empty() {
            return Err(CameraError::Unavailable("no still images configured".to_string()));
        }
        let still = self.stills[self.next % self.stills.len()].clone();
        self.next = (self.next + 1) % self.stills.len();
        match still {
            Still::Image(image) => Ok((*image).clone()),
            Still::File(path) => {
                let bytes = tokio::fs::read(&path).await?;
                Ok(image::load_from_memory(&bytes)?.to_rgb8())
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), CameraError> {
        self.next = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} still image(s)", self.stills.len())
    }
}
