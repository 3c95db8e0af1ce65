// Copyright 2025 nozzle-align contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # nozzle-align
//!
//! Camera-based XY (and optional Z) tool offset alignment for multi-tool
//! machines driven by Duet/RepRapFirmware controllers.
//!
//! An upward-facing camera looks at a fixed point on the machine (the
//! controlled point). Each tool is brought over the camera, the mapping
//! between image pixels and machine millimetres is fitted from a short
//! circle of moves, and the carriage is then nudged until the nozzle sits
//! at the image centre. The distance travelled is the tool's offset.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nozzle_align::{AlignerConfig, DuetClient, DuetConfig, FeedConfig, FrameFeed, SnapshotSource, ToolAligner};
//! use nozzle_align::RepeatabilityReport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let machine = DuetClient::connect(DuetConfig::default().with_base_url("http://duet.local")).await?;
//!     let source = SnapshotSource::new("http://camera.local:8080/?action=snapshot", Duration::from_secs(5))?;
//!     let feed = FrameFeed::start(source, FeedConfig::default()).await?;
//!
//!     let mut aligner = ToolAligner::new(Arc::new(machine), feed, AlignerConfig::default().with_cycles(3));
//!     let control_point = aligner.capture_control_point().await?;
//!     let session = aligner.run(control_point).await?;
//!
//!     println!("{}", RepeatabilityReport::from_results(session.results()));
//!     Ok(())
//! }
//! ```
//!
//! ## Offline Detection
//!
//! ```rust,no_run
//! use nozzle_align::{FeatureDetector, NozzleDetector};
//!
//! let frame = image::open("nozzle.png").unwrap().to_rgb8();
//! let detector = NozzleDetector::default();
//! println!("{:?}", detector.detect(&frame));
//! ```

pub mod analysis;
pub mod calibration;
pub mod camera;
pub mod event_log;
pub mod machine;
pub mod settings;
pub mod vision;

pub use analysis::{read_results, write_results, RepeatabilityReport};
pub use calibration::{
    AlignError, AlignerConfig, AlignmentEvent, CancelHandle, ControlPoint, EventSink, SessionContext,
    ToolAligner, ToolOffsetResult, TransformCadence,
};
pub use camera::{CameraError, FeedConfig, Frame, FrameFeed, FrameSource, SnapshotSource, StillSource};
pub use event_log::EventLog;
pub use machine::{DuetClient, DuetConfig, MachineControl, MachineError, SimulatedMachine};
pub use settings::AppSettings;
pub use vision::{Detection, DetectionOutcome, DetectorConfig, FeatureDetector, NozzleDetector};
