//! Continuous frame acquisition on a background task.

use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{CameraAdjustments, CameraError, CameraProperty, Frame, FrameSource};

/// Feed timing.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Delay between reads.
    pub poll_interval: Duration,
    /// Attempts to obtain the first frame before the camera is declared unavailable.
    pub open_attempts: u32,
    /// Pause before reconnecting after a failed read.
    pub reconnect_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(40),
            open_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

impl FeedConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_open_attempts(mut self, attempts: u32) -> Self {
        self.open_attempts = attempts.max(1);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

#[derive(Debug)]
enum FeedControl {
    SetProperty(CameraProperty, f32),
    ResetProperties,
    Reconnect,
}

/// Handle to a running frame feed.
///
/// Only the latest frame is retained; unread frames are replaced. The
/// resolution of the first frame is frozen and frames of any other size are
/// dropped.
pub struct FrameFeed {
    frames: watch::Receiver<Option<Frame>>,
    control: mpsc::UnboundedSender<FeedControl>,
    resolution: (u32, u32),
    task: JoinHandle<()>,
}

impl FrameFeed {
    /// Open the source and start the acquisition task.
    ///
    /// Fails with [`CameraError::Unavailable`] when no frame can be read
    /// within the configured number of attempts.
    pub async fn start<S: FrameSource>(mut source: S, config: FeedConfig) -> Result<Self, CameraError> {
        let description = source.describe();
        let mut first = None;
        for attempt in 1..=config.open_attempts.max(1) {
            let started = Instant::now();
            match source.read_frame().await {
                Ok(image) => {
                    first = Some(Frame::new(image, started, 0));
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, source = %description, "camera open failed");
                    if attempt < config.open_attempts {
                        sleep(config.reconnect_delay).await;
                        if let Err(e) = source.reconnect().await {
                            debug!(error = %e, "reconnect failed");
                        }
                    }
                }
            }
        }
        let first = first.ok_or_else(|| {
            CameraError::Unavailable(format!(
                "{} produced no frame after {} attempt(s)",
                description, config.open_attempts
            ))
        })?;

        let resolution = first.resolution();
        info!(source = %description, width = resolution.0, height = resolution.1, "camera opened");

        let (frame_tx, frame_rx) = watch::channel(Some(first));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_feed(source, config, resolution, frame_tx, control_rx));

        Ok(Self {
            frames: frame_rx,
            control: control_tx,
            resolution,
            task,
        })
    }

    /// Resolution frozen at start.
    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    /// Most recent frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.frames.borrow().clone()
    }

    /// A receiver for preview consumers.
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.frames.clone()
    }

    /// Wait for a frame newer than the last one returned.
    pub async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        loop {
            self.frames.changed().await.map_err(|_| CameraError::Closed)?;
            if let Some(frame) = self.frames.borrow_and_update().clone() {
                return Ok(frame);
            }
        }
    }

    /// Wait for a frame whose capture started strictly after `instant`.
    pub async fn next_frame_after(&mut self, instant: Instant) -> Result<Frame, CameraError> {
        if let Some(frame) = self.frames.borrow_and_update().clone() {
            if frame.captured_at() > instant {
                return Ok(frame);
            }
        }
        loop {
            let frame = self.next_frame().await?;
            if frame.captured_at() > instant {
                return Ok(frame);
            }
        }
    }

    pub fn set_property(&self, property: CameraProperty, value: f32) {
        let _ = self.control.send(FeedControl::SetProperty(property, value));
    }

    pub fn reset_properties(&self) {
        let _ = self.control.send(FeedControl::ResetProperties);
    }

    pub fn request_reconnect(&self) {
        let _ = self.control.send(FeedControl::Reconnect);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_feed<S: FrameSource>(
    mut source: S,
    config: FeedConfig,
    resolution: (u32, u32),
    frames: watch::Sender<Option<Frame>>,
    mut control: mpsc::UnboundedReceiver<FeedControl>,
) {
    let mut adjustments = CameraAdjustments::default();
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(FeedControl::SetProperty(property, value)) => {
                    if source.set_property(property, value).is_err() {
                        adjustments.set(property, value);
                    }
                    debug!(%property, value, "camera property set");
                }
                Some(FeedControl::ResetProperties) => {
                    adjustments.reset();
                    debug!("camera properties reset");
                }
                Some(FeedControl::Reconnect) => {
                    if let Err(e) = source.reconnect().await {
                        warn!(error = %e, "camera reconnect failed");
                    }
                }
                None => break,
            },
            _ = sleep(config.poll_interval) => {
                let started = Instant::now();
                match source.read_frame().await {
                    Ok(image) => {
                        if image.dimensions() != resolution {
                            warn!(
                                expected = ?resolution,
                                got = ?image.dimensions(),
                                "dropping frame with changed resolution"
                            );
                            continue;
                        }
                        sequence += 1;
                        let frame = Frame::new(adjustments.apply(image), started, sequence);
                        if frames.send(Some(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "frame read failed, reconnecting");
                        sleep(config.reconnect_delay).await;
                        if let Err(e) = source.reconnect().await {
                            warn!(error = %e, "camera reconnect failed");
                        }
                    }
                }
            }
        }
    }
    debug!("frame feed stopped");
}
