//! Events published by an alignment run and the handle used to cancel it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbImage;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::offset::ToolOffsetResult;

/// Something the display/status sink should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentEvent {
    /// Short text describing the current phase.
    Status(String),
    /// Human-readable progress or warning.
    Message(String),
    /// A trial finished.
    Result(ToolOffsetResult),
    /// The run finished, successfully or not.
    Complete { run_id: Uuid, trials: usize },
}

/// Fan-out for events and preview frames.
///
/// Both channels are optional; a sink with neither still mirrors every
/// event to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    events: Option<mpsc::UnboundedSender<AlignmentEvent>>,
    previews: Option<Arc<watch::Sender<Option<Arc<RgbImage>>>>>,
}

impl EventSink {
    /// A sink that only logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink and the receiver for its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AlignmentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: Some(tx),
                previews: None,
            },
            rx,
        )
    }

    /// Also publish annotated preview frames; only the latest is kept.
    pub fn with_previews(mut self) -> (Self, watch::Receiver<Option<Arc<RgbImage>>>) {
        let (tx, rx) = watch::channel(None);
        self.previews = Some(Arc::new(tx));
        (self, rx)
    }

    /// Whether anyone is watching previews; rendering is skipped otherwise.
    pub fn wants_previews(&self) -> bool {
        self.previews
            .as_ref()
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    pub fn preview(&self, image: RgbImage) {
        if let Some(tx) = &self.previews {
            tx.send_replace(Some(Arc::new(image)));
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(status = %text);
        self.emit(AlignmentEvent::Status(text));
    }

    pub fn message(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!(message = %text);
        self.emit(AlignmentEvent::Message(text));
    }

    pub fn result(&self, result: ToolOffsetResult) {
        tracing::info!(
            tool = result.tool,
            cycle = result.cycle,
            x = result.x,
            y = result.y,
            mpp = result.mpp,
            "trial complete"
        );
        self.emit(AlignmentEvent::Result(result));
    }

    pub fn complete(&self, run_id: Uuid, trials: usize) {
        tracing::info!(%run_id, trials, "alignment run finished");
        self.emit(AlignmentEvent::Complete { run_id, trials });
    }

    fn emit(&self, event: AlignmentEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening any more.
            let _ = tx.send(event);
        }
    }
}

/// Cooperative cancellation flag shared between a run and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before starting another run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_receiver_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.status("Calibrating T0");
        sink.message("No circles found.");
        assert_eq!(rx.try_recv().unwrap(), AlignmentEvent::Status("Calibrating T0".into()));
        assert_eq!(rx.try_recv().unwrap(), AlignmentEvent::Message("No circles found.".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_previews_keep_latest_only() {
        let (sink, rx) = EventSink::new().with_previews();
        assert!(sink.wants_previews());
        sink.preview(RgbImage::new(2, 2));
        sink.preview(RgbImage::new(4, 4));
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.dimensions(), (4, 4));
        drop(rx);
        assert!(!sink.wants_previews());
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        handle.reset();
        assert!(!clone.is_cancelled());
    }
}
