//! Runs that align every tool to the controlled point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::camera::{CalibrationStep, CameraCalibration, TransformCalibrator};
use super::convergence::{ConvergenceLoop, ConvergenceStep, DEFAULT_GAIN, DEFAULT_MOVE_BUDGET};
use super::coords::FrameGeometry;
use super::events::{CancelHandle, EventSink};
use super::offset::{apply_offset, resolve_offset, ToolOffsetResult};
use super::session::{ControlPoint, SessionContext, TransformCadence};
use super::zprobe::{self, NoPrompt, OperatorPrompt, ZOutcome};
use super::{AlignError, ErrorScope};
use crate::camera::{Frame, FrameFeed};
use crate::machine::{format_coord, wait_until_idle, MachineControl, MachineError, MachinePosition, MotionCommand};
use crate::vision::{
    render_preview, Detection, DetectionOutcome, EndstopDetector, FeatureDetector, NozzleDetector,
    OverlayFont, OverlayOptions,
};

/// Run parameters.
#[derive(Debug, Clone)]
pub struct AlignerConfig {
    /// Passes over the tool list.
    pub cycles: u32,
    /// Tools to align, in order. `None` aligns every tool on the machine.
    pub tools: Option<Vec<u32>>,
    pub gain: f64,
    /// Corrective moves per tool before it is abandoned.
    pub move_budget: u32,
    /// Single-candidate detections averaged into one sample.
    pub samples_per_position: usize,
    /// Failed detections tolerated per sample; `None` keeps trying until
    /// cancelled.
    pub max_detection_attempts: Option<u32>,
    /// Backoff between status polls.
    pub poll_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub calibration_feedrate: f64,
    pub convergence_feedrate: f64,
    /// Feedrate restored after convergence and used for travel.
    pub travel_feedrate: f64,
    pub cadence: TransformCadence,
    /// Probe Z against the knob sensor when one is fitted.
    pub probe_z: bool,
    /// Write each result to the tool table as it is found.
    pub apply_offsets: bool,
    /// Persist the tool table at the end of a successful run.
    pub save_offsets: bool,
    pub overlay: OverlayOptions,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            cycles: 1,
            tools: None,
            gain: DEFAULT_GAIN,
            move_budget: DEFAULT_MOVE_BUDGET,
            samples_per_position: 5,
            max_detection_attempts: None,
            poll_interval: Duration::from_millis(500),
            idle_timeout: None,
            calibration_feedrate: 3000.0,
            convergence_feedrate: 1000.0,
            travel_feedrate: 13200.0,
            cadence: TransformCadence::default(),
            probe_z: true,
            apply_offsets: true,
            save_offsets: false,
            overlay: OverlayOptions {
                crosshair: true,
                xray: false,
            },
        }
    }
}

impl AlignerConfig {
    pub fn with_cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles.max(1);
        self
    }

    pub fn with_tools(mut self, tools: Vec<u32>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_cadence(mut self, cadence: TransformCadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_samples_per_position(mut self, samples: usize) -> Self {
        self.samples_per_position = samples.max(1);
        self
    }

    pub fn with_max_detection_attempts(mut self, attempts: u32) -> Self {
        self.max_detection_attempts = Some(attempts);
        self
    }

    pub fn with_move_budget(mut self, budget: u32) -> Self {
        self.move_budget = budget;
        self
    }

    pub fn with_save_offsets(mut self, save: bool) -> Self {
        self.save_offsets = save;
        self
    }
}

/// Drives alignment runs on one machine through one camera feed.
///
/// All motion is sequential: every move is confirmed idle before the next
/// frame is trusted, and only frames captured after that confirmation are
/// analysed.
pub struct ToolAligner<M: MachineControl> {
    machine: Arc<M>,
    feed: FrameFeed,
    geometry: FrameGeometry,
    detector: Arc<dyn FeatureDetector>,
    endstop: Arc<dyn FeatureDetector>,
    config: AlignerConfig,
    events: EventSink,
    cancel: CancelHandle,
    prompt: Arc<dyn OperatorPrompt>,
    font: Option<Arc<OverlayFont>>,
}

impl<M: MachineControl> ToolAligner<M> {
    pub fn new(machine: Arc<M>, feed: FrameFeed, config: AlignerConfig) -> Self {
        let geometry = FrameGeometry::from_resolution(feed.resolution());
        Self {
            machine,
            feed,
            geometry,
            detector: Arc::new(NozzleDetector::default()),
            endstop: Arc::new(EndstopDetector::default()),
            config,
            events: EventSink::new(),
            cancel: CancelHandle::new(),
            prompt: Arc::new(NoPrompt),
            font: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn FeatureDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_endstop_detector(mut self, detector: Arc<dyn FeatureDetector>) -> Self {
        self.endstop = detector;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn OperatorPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_font(mut self, font: Arc<OverlayFont>) -> Self {
        self.font = Some(font);
        self
    }

    /// Handle that stops a run at its next detection.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &AlignerConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<M> {
        &self.machine
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    // ----- controlled point -----

    /// Use the current position as the controlled point.
    pub async fn capture_control_point(&mut self) -> Result<ControlPoint, AlignError> {
        self.wait_idle().await?;
        let position = self.machine.position().await?;
        self.finish_control_point(position, None).await
    }

    /// Move to the given coordinates and use them as the controlled point.
    pub async fn capture_control_point_at(
        &mut self,
        x: f64,
        y: f64,
        z: Option<f64>,
    ) -> Result<ControlPoint, AlignError> {
        self.machine
            .send(&MotionCommand::MoveAbsolute {
                x: Some(x),
                y: Some(y),
                z,
                feedrate: Some(self.config.travel_feedrate),
            })
            .await?;
        self.capture_control_point().await
    }

    /// Locate the endstop with the camera and use its centre as the
    /// controlled point. The calibration made on the way is kept for reuse.
    pub async fn auto_capture_control_point(&mut self) -> Result<ControlPoint, AlignError> {
        self.check_cancel()?;
        self.events.status("CP Autocalibration..");
        if self.machine.current_tool().await? >= 0 {
            self.machine.send(&MotionCommand::UnloadTool).await?;
            self.wait_idle().await?;
        }

        let endstop = Arc::clone(&self.endstop);
        let calibration = self.calibrate_camera(&endstop).await?;
        let position = self.converge(&calibration, &endstop).await?;
        self.events.status("CP Autocalibration complete.");
        self.finish_control_point(position, Some(calibration)).await
    }

    async fn finish_control_point(
        &mut self,
        position: MachinePosition,
        calibration: Option<CameraCalibration>,
    ) -> Result<ControlPoint, AlignError> {
        let z_reference = if self.config.probe_z {
            zprobe::capture_reference(&*self.machine, &position, self.config.poll_interval).await?
        } else {
            None
        };
        self.events.message(format!(
            "CP captured: X{} Y{} Z{}",
            format_coord(position.x()),
            format_coord(position.y()),
            format_coord(position.z())
        ));
        Ok(ControlPoint {
            position,
            z_reference,
            calibration,
        })
    }

    // ----- runs -----

    /// Align the configured tools for the configured number of cycles.
    ///
    /// Tool-scoped failures are reported and skipped. On success, or when
    /// cancelled, the tool is unloaded and the carriage returned to the
    /// controlled point; other run-scoped failures leave the machine where
    /// it stopped.
    pub async fn run(&mut self, control_point: ControlPoint) -> Result<SessionContext, AlignError> {
        let mut session = SessionContext::new(control_point, self.config.cadence);
        info!(run_id = %session.run_id(), cycles = self.config.cycles, "starting alignment run");

        let outcome = self.run_cycles(&mut session).await;
        let cp = session.control_point().position.clone();
        match outcome {
            Ok(()) => {
                self.events.status("Calibration complete: Resetting machine.");
                self.restore_carriage(&cp).await?;
                if self.config.apply_offsets && self.config.save_offsets {
                    self.machine.send(&MotionCommand::SaveOffsets).await?;
                }
                self.events.status("Calibration complete: Done.");
                self.events.complete(session.run_id(), session.results().len());
                Ok(session)
            }
            Err(e) => {
                if matches!(e, AlignError::Cancelled) {
                    self.events.status("Calibration cancelled.");
                    if let Err(restore) = self.restore_carriage(&cp).await {
                        warn!(error = %restore, "could not restore carriage after cancel");
                    }
                } else {
                    self.events.status(format!("Calibration failed: {}", e));
                }
                self.events.complete(session.run_id(), session.results().len());
                Err(e)
            }
        }
    }

    async fn run_cycles(&mut self, session: &mut SessionContext) -> Result<(), AlignError> {
        let tools = self.tool_list().await?;
        for &tool in &tools {
            let offset = self.machine.tool_offset(tool).await?;
            session.set_tool_z(tool, offset.z());
        }

        let cycles = self.config.cycles.max(1);
        for cycle in 0..cycles {
            for &tool in &tools {
                self.check_cancel()?;
                self.events
                    .status(format!("Calibrating T{}, cycle: {}/{}", tool, cycle + 1, cycles));
                match self.align_tool(session, tool, cycle).await {
                    Ok(result) => {
                        self.events.result(result.clone());
                        session.push_result(result);
                    }
                    Err(e) if e.scope() == ErrorScope::Tool => {
                        warn!(tool, cycle, error = %e, "tool abandoned");
                        self.events.status(format!("T{} abandoned: {}", tool, e));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn tool_list(&self) -> Result<Vec<u32>, AlignError> {
        let count = self.machine.tool_count().await?;
        let tools = match &self.config.tools {
            Some(tools) => tools.clone(),
            None => (0..count as u32).collect(),
        };
        if tools.is_empty() {
            return Err(AlignError::NoTools);
        }
        if let Some(&missing) = tools.iter().find(|&&t| t as usize >= count) {
            return Err(MachineError::UnknownTool(missing).into());
        }
        Ok(tools)
    }

    async fn align_tool(
        &mut self,
        session: &mut SessionContext,
        tool: u32,
        cycle: u32,
    ) -> Result<ToolOffsetResult, AlignError> {
        let cp = session.control_point().position.clone();
        self.machine.send(&MotionCommand::SelectTool(tool)).await?;
        self.wait_idle().await?;
        self.machine
            .send(&MotionCommand::MoveAbsolute {
                x: Some(cp.x()),
                y: Some(cp.y()),
                z: Some(cp.z()),
                feedrate: Some(self.config.travel_feedrate),
            })
            .await?;
        self.wait_idle().await?;

        let detector = Arc::clone(&self.detector);
        let calibration = match session.reusable_calibration() {
            Some(calibration) => calibration.clone(),
            None => {
                let calibration = self.calibrate_camera(&detector).await?;
                session.store_calibration(calibration.clone());
                calibration
            }
        };

        let started = Instant::now();
        let detected = self.converge(&calibration, &detector).await?;
        let existing = self.machine.tool_offset(tool).await?;
        let (x, y) = resolve_offset(&cp, &existing, &detected);
        let elapsed_secs = started.elapsed().as_secs_f64();
        self.events.message(format!(
            "Nozzle calibrated: offset coordinates X{} Y{}",
            format_coord(x),
            format_coord(y)
        ));

        let mut z = None;
        let reference = session.control_point().z_reference.filter(|_| self.config.probe_z);
        if let Some(reference) = reference {
            let tool_z = session.tool_z(tool).unwrap_or_else(|| existing.z());
            let outcome = zprobe::calibrate_tool_z(
                &*self.machine,
                &cp,
                &reference,
                tool_z,
                &*self.prompt,
                self.config.poll_interval,
            )
            .await?;
            match outcome {
                ZOutcome::Corrected(value) => {
                    session.set_tool_z(tool, value);
                    self.events
                        .message(format!("T{} Z offset: {}", tool, format_coord(value)));
                    z = Some(value);
                }
                ZOutcome::Skipped(reason) => {
                    self.events
                        .message(format!("T{}: Z calibration skipped, {}", tool, reason));
                }
            }
        }

        if self.config.apply_offsets {
            apply_offset(&*self.machine, tool, x, y, z).await?;
        }

        Ok(ToolOffsetResult {
            tool,
            cycle,
            mpp: calibration.mpp,
            x,
            y,
            elapsed_secs,
        })
    }

    // ----- calibration and convergence -----

    async fn calibrate_camera(
        &mut self,
        detector: &Arc<dyn FeatureDetector>,
    ) -> Result<CameraCalibration, AlignError> {
        self.events.status("Calibrating camera..");
        let mut calibrator = TransformCalibrator::new(self.geometry);
        loop {
            let (detection, position) = self.settled_detection(detector).await?;
            match calibrator.record((position.x(), position.y()), &detection)? {
                CalibrationStep::Move(moves) => {
                    self.events.message(format!(
                        "Calibrating rotation.. ({}%)",
                        calibrator.progress_percent()
                    ));
                    for (dx, dy) in moves {
                        self.machine
                            .send(&MotionCommand::relative_xy(dx, dy, self.config.calibration_feedrate))
                            .await?;
                    }
                    self.wait_idle().await?;
                }
                CalibrationStep::ReadyToFit => break,
            }
        }

        let calibration = calibrator.fit()?;
        let (cx, cy) = calibration.camera_center;
        info!(
            mpp = calibration.mpp,
            residual = calibration.transform.residual(),
            center_x = cx,
            center_y = cy,
            "camera calibrated"
        );
        self.events.message(format!(
            "Calibrating rotation.. (100%) - MPP = {:.4}",
            calibration.mpp
        ));

        self.machine
            .send(&MotionCommand::absolute_xy(cx, cy, Some(self.config.convergence_feedrate)))
            .await?;
        self.wait_idle().await?;
        Ok(calibration)
    }

    /// Centre the feature and return the machine position it was seen at.
    async fn converge(
        &mut self,
        calibration: &CameraCalibration,
        detector: &Arc<dyn FeatureDetector>,
    ) -> Result<MachinePosition, AlignError> {
        let mut convergence = ConvergenceLoop::new(calibration.transform.clone(), calibration.geometry)
            .with_gain(self.config.gain)
            .with_budget(self.config.move_budget);
        loop {
            let (detection, position) = self.settled_detection(detector).await?;
            match convergence.step(&detection) {
                ConvergenceStep::Converged { moves } => {
                    self.machine
                        .send(&MotionCommand::SetFeedrate(self.config.travel_feedrate))
                        .await?;
                    debug!(moves, position = %position, "converged");
                    return Ok(position);
                }
                ConvergenceStep::Move { dx, dy } => {
                    self.events.message(format!(
                        "Tool calibration move #{}: X{} Y{}",
                        convergence.moves(),
                        format_coord(dx),
                        format_coord(dy)
                    ));
                    self.machine.send(&MotionCommand::LimitAxes(true)).await?;
                    self.machine
                        .send(&MotionCommand::relative_xy(dx, dy, self.config.convergence_feedrate))
                        .await?;
                    self.wait_idle().await?;
                }
                ConvergenceStep::Exhausted { moves } => {
                    return Err(AlignError::ConvergenceExhausted { moves });
                }
            }
        }
    }

    /// Average of several single-candidate detections taken after the
    /// machine settled, with the position they were taken at.
    async fn settled_detection(
        &mut self,
        detector: &Arc<dyn FeatureDetector>,
    ) -> Result<(Detection, MachinePosition), AlignError> {
        let wanted = self.config.samples_per_position.max(1);
        let mut after = Instant::now();
        let (mut sum_x, mut sum_y, mut sum_r) = (0.0, 0.0, 0.0);
        let mut found = 0usize;
        let mut misses = 0u32;

        while found < wanted {
            self.check_cancel()?;
            let frame = self.feed.next_frame_after(after).await?;
            after = frame.captured_at();
            match self.analyze(detector, &frame).await? {
                DetectionOutcome::One(d) => {
                    sum_x += d.x;
                    sum_y += d.y;
                    sum_r += d.radius;
                    found += 1;
                }
                DetectionOutcome::None => {
                    misses += 1;
                    self.events.message("No circles found.");
                }
                DetectionOutcome::Many(n) => {
                    misses += 1;
                    self.events.message(format!(
                        "Too many circles found ({}). Please stop and clean the nozzle.",
                        n
                    ));
                }
            }
            if let Some(limit) = self.config.max_detection_attempts {
                if misses >= limit {
                    return Err(AlignError::DetectionFailed { attempts: misses });
                }
            }
        }

        let n = found as f64;
        let position = self.machine.position().await?;
        Ok((Detection::new(sum_x / n, sum_y / n, sum_r / n), position))
    }

    async fn analyze(
        &self,
        detector: &Arc<dyn FeatureDetector>,
        frame: &Frame,
    ) -> Result<DetectionOutcome, AlignError> {
        let detector = Arc::clone(detector);
        let image = frame.shared_image();
        let preview = self
            .events
            .wants_previews()
            .then(|| (self.config.overlay, self.font.clone()));

        let (outcome, rendered) = tokio::task::spawn_blocking(move || {
            let analysis = detector.analyze(&image);
            let rendered = preview.map(|(options, font)| {
                render_preview(&image, &analysis, options, font.as_deref())
            });
            (analysis.candidates.classify(), rendered)
        })
        .await
        .map_err(|e| AlignError::Worker(e.to_string()))?;

        if let Some(image) = rendered {
            self.events.preview(image);
        }
        Ok(outcome)
    }

    // ----- machine helpers -----

    /// Persist the tool table (`M500 P10`).
    pub async fn save_offsets(&self) -> Result<(), AlignError> {
        self.machine.send(&MotionCommand::SaveOffsets).await?;
        Ok(())
    }

    /// Write the last result of every tool in a session to the tool table,
    /// with its probed Z when there is one, and optionally persist it.
    pub async fn apply_session(&self, session: &SessionContext, save: bool) -> Result<(), AlignError> {
        let mut latest: Vec<&ToolOffsetResult> = Vec::new();
        for result in session.results() {
            match latest.iter_mut().find(|r| r.tool == result.tool) {
                Some(slot) => *slot = result,
                None => latest.push(result),
            }
        }
        let probed = session.control_point().z_reference.is_some();
        for result in latest {
            let z = if probed { session.tool_z(result.tool) } else { None };
            apply_offset(&*self.machine, result.tool, result.x, result.y, z).await?;
        }
        if save {
            self.save_offsets().await?;
        }
        Ok(())
    }

    async fn restore_carriage(&self, cp: &MachinePosition) -> Result<(), MachineError> {
        self.machine.send(&MotionCommand::UnloadTool).await?;
        self.wait_idle().await?;
        self.machine
            .send(&MotionCommand::absolute_xy(
                cp.x(),
                cp.y(),
                Some(self.config.travel_feedrate),
            ))
            .await?;
        self.wait_idle().await
    }

    async fn wait_idle(&self) -> Result<(), MachineError> {
        wait_until_idle(&*self.machine, self.config.poll_interval, self.config.idle_timeout).await
    }

    fn check_cancel(&self) -> Result<(), AlignError> {
        if self.cancel.is_cancelled() {
            Err(AlignError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::AlignmentEvent;
    use crate::camera::{FeedConfig, StillSource};
    use crate::machine::{SimulatedMachine, SimulatedProbe};
    use crate::vision::{Analysis, Candidates};
    use image::{GrayImage, RgbImage};

    const CAMERA_CENTER: (f64, f64) = (150.0, 80.0);

    /// Camera looking up at the nozzle: reads the simulated machine instead
    /// of the image. 100 px per mm, slightly rotated.
    struct SimCamera {
        machine: Arc<SimulatedMachine>,
        /// Where each tool's nozzle really sits relative to the carriage.
        nozzle_errors: Vec<(f64, f64)>,
    }

    impl FeatureDetector for SimCamera {
        fn analyze(&self, image: &RgbImage) -> Analysis {
            let position = self.machine.snapshot_position();
            let error = usize::try_from(self.machine.snapshot_tool())
                .ok()
                .and_then(|t| self.nozzle_errors.get(t).copied())
                .unwrap_or((0.0, 0.0));
            let dx = position.x() + error.0 - CAMERA_CENTER.0;
            let dy = position.y() + error.1 - CAMERA_CENTER.1;
            let (sin, cos) = 0.05f64.sin_cos();
            let px = image.width() as f64 / 2.0 + 100.0 * (cos * dx - sin * dy);
            let py = image.height() as f64 / 2.0 + 100.0 * (sin * dx + cos * dy);
            Analysis {
                candidates: Candidates::new(vec![Detection::new(px, py, 12.0)]),
                processed: GrayImage::new(1, 1),
            }
        }

        fn name(&self) -> &'static str {
            "sim"
        }
    }

    /// Always reports the same candidates.
    struct FixedDetector(Vec<Detection>);

    impl FeatureDetector for FixedDetector {
        fn analyze(&self, _image: &RgbImage) -> Analysis {
            Analysis {
                candidates: Candidates::new(self.0.clone()),
                processed: GrayImage::new(1, 1),
            }
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn machine() -> Arc<SimulatedMachine> {
        Arc::new(
            SimulatedMachine::new()
                .with_position(MachinePosition::xyz(148.0, 81.0, 20.0))
                .with_tools(vec![
                    MachinePosition::xyz(0.0, 0.0, 0.0),
                    MachinePosition::xyz(0.0, 0.0, 0.0),
                ])
                .with_busy_polls(1),
        )
    }

    fn config() -> AlignerConfig {
        AlignerConfig::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_samples_per_position(2)
    }

    async fn aligner(
        machine: Arc<SimulatedMachine>,
        config: AlignerConfig,
    ) -> ToolAligner<SimulatedMachine> {
        let source = StillSource::from_images(vec![RgbImage::new(320, 240)]);
        let feed = FrameFeed::start(source, FeedConfig::default().with_poll_interval(Duration::from_millis(2)))
            .await
            .unwrap();
        let camera = Arc::new(SimCamera {
            machine: Arc::clone(&machine),
            nozzle_errors: vec![(0.3, -0.2), (-0.15, 0.4)],
        });
        ToolAligner::new(machine, feed, config)
            .with_detector(camera.clone())
            .with_endstop_detector(camera)
    }

    fn count(machine: &SimulatedMachine, command: &str) -> usize {
        machine.commands().iter().filter(|c| c.as_str() == command).count()
    }

    #[tokio::test]
    async fn test_full_run_with_auto_control_point() {
        let machine = machine();
        let (events, mut rx) = EventSink::channel();
        let mut aligner = aligner(Arc::clone(&machine), config()).await.with_events(events);

        let cp = aligner.auto_capture_control_point().await.unwrap();
        assert!((cp.position.x() - CAMERA_CENTER.0).abs() < 0.002, "cp = {}", cp.position);
        assert!((cp.position.y() - CAMERA_CENTER.1).abs() < 0.002, "cp = {}", cp.position);
        assert!(cp.calibration.is_some());

        let session = aligner.run(cp).await.unwrap();
        let results = session.results();
        assert_eq!(results.len(), 2);
        assert!((results[0].x - 0.3).abs() < 0.003, "T0 x = {}", results[0].x);
        assert!((results[0].y - -0.2).abs() < 0.003, "T0 y = {}", results[0].y);
        assert!((results[1].x - -0.15).abs() < 0.003, "T1 x = {}", results[1].x);
        assert!((results[1].y - 0.4).abs() < 0.003, "T1 y = {}", results[1].y);
        assert_eq!(results[0].mpp, 0.01);

        // One camera calibration for the whole session.
        assert_eq!(count(&machine, "G91 G1 X0.000 Y-0.500 F3000 G90"), 1);
        // Offsets written to the tool table, tool parked at the end.
        let t1 = machine.offset_of(1).unwrap();
        assert_eq!((t1.x(), t1.y()), (results[1].x, results[1].y));
        assert_eq!(machine.snapshot_tool(), -1);

        let mut saw_complete = false;
        while let Ok(event) = rx.try_recv() {
            if let AlignmentEvent::Complete { trials, .. } = event {
                assert_eq!(trials, 2);
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn test_per_tool_cadence_recalibrates() {
        let machine = machine();
        let config = config()
            .with_cadence(TransformCadence::PerTool)
            .with_save_offsets(true);
        let mut aligner = aligner(Arc::clone(&machine), config).await;

        let cp = aligner
            .capture_control_point_at(CAMERA_CENTER.0, CAMERA_CENTER.1, None)
            .await
            .unwrap();
        let session = aligner.run(cp).await.unwrap();
        assert_eq!(session.results().len(), 2);
        assert_eq!(count(&machine, "G91 G1 X0.000 Y-0.500 F3000 G90"), 2);
        assert!(machine.offsets_saved());
    }

    #[tokio::test]
    async fn test_apply_session_uses_last_result_per_tool() {
        let machine = machine();
        let config = AlignerConfig {
            apply_offsets: false,
            ..config().with_cycles(2).with_tools(vec![1])
        };
        let mut aligner = aligner(Arc::clone(&machine), config).await;
        let cp = aligner
            .capture_control_point_at(CAMERA_CENTER.0, CAMERA_CENTER.1, None)
            .await
            .unwrap();
        let session = aligner.run(cp).await.unwrap();
        assert_eq!(session.results().len(), 2);
        assert_eq!(session.results()[1].cycle, 1);
        assert!(!machine.commands().iter().any(|c| c.starts_with("G10")));

        aligner.apply_session(&session, true).await.unwrap();
        let offset = machine.offset_of(1).unwrap();
        assert_eq!((offset.x(), offset.y()), (session.results()[1].x, session.results()[1].y));
        assert_eq!(count(&machine, "M500 P10"), 1);
    }

    #[tokio::test]
    async fn test_no_move_without_single_detection() {
        for candidates in [
            vec![],
            vec![
                Detection::new(10.0, 10.0, 5.0),
                Detection::new(50.0, 50.0, 5.0),
                Detection::new(90.0, 90.0, 5.0),
            ],
        ] {
            let machine = machine();
            let config = config().with_tools(vec![0]).with_max_detection_attempts(3);
            let (events, mut rx) = EventSink::channel();
            let mut aligner = aligner(Arc::clone(&machine), config)
                .await
                .with_detector(Arc::new(FixedDetector(candidates)))
                .with_events(events);

            let cp = ControlPoint::at(MachinePosition::xyz(150.0, 80.0, 20.0));
            let session = aligner.run(cp).await.unwrap();
            assert!(session.results().is_empty());
            assert!(!machine.commands().iter().any(|c| c.starts_with("G91")));

            let mut misses = 0;
            while let Ok(event) = rx.try_recv() {
                if let AlignmentEvent::Message(text) = event {
                    if text.starts_with("No circles") || text.starts_with("Too many") {
                        misses += 1;
                    }
                }
            }
            assert_eq!(misses, 3);
        }
    }

    #[tokio::test]
    async fn test_cancel_parks_tool_and_returns_to_cp() {
        let machine = machine();
        let mut aligner = aligner(Arc::clone(&machine), config()).await;
        machine.send(&MotionCommand::SelectTool(1)).await.unwrap();

        aligner.cancel_handle().cancel();
        let cp = ControlPoint::at(MachinePosition::xyz(150.0, 80.0, 20.0));
        let result = aligner.run(cp).await;
        assert!(matches!(result, Err(AlignError::Cancelled)));
        assert_eq!(machine.snapshot_tool(), -1);
        let position = machine.snapshot_position();
        assert_eq!((position.x(), position.y()), (150.0, 80.0));
    }

    #[tokio::test]
    async fn test_rejected_tool_change_abandons_only_that_tool() {
        let machine = machine();
        machine.reject_commands("T1");
        let (events, mut rx) = EventSink::channel();
        let mut aligner = aligner(Arc::clone(&machine), config()).await.with_events(events);

        let cp = aligner
            .capture_control_point_at(CAMERA_CENTER.0, CAMERA_CENTER.1, None)
            .await
            .unwrap();
        let session = aligner.run(cp).await.unwrap();
        let results = session.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool, 0);
        assert!((results[0].x - 0.3).abs() < 0.003, "T0 x = {}", results[0].x);
        assert!((results[0].y - -0.2).abs() < 0.003, "T0 y = {}", results[0].y);
        assert_eq!(machine.snapshot_tool(), -1);
        assert_eq!(machine.offset_of(1).unwrap(), MachinePosition::xyz(0.0, 0.0, 0.0));

        let mut abandoned = false;
        while let Ok(event) = rx.try_recv() {
            if let AlignmentEvent::Status(text) = event {
                abandoned |= text.starts_with("T1 abandoned");
            }
        }
        assert!(abandoned);
    }

    fn knob_machine() -> Arc<SimulatedMachine> {
        Arc::new(
            SimulatedMachine::new()
                .with_position(MachinePosition::xyz(148.0, 81.0, 20.0))
                .with_tools(vec![
                    MachinePosition::xyz(0.0, 0.0, -1.5),
                    MachinePosition::xyz(0.0, 0.0, -1.0),
                ])
                .with_busy_polls(1)
                .with_probe(SimulatedProbe {
                    trigger_height: 0.7,
                    endstop_z: 2.0,
                    knob_present: true,
                    knob_z: vec![2.4, 2.1],
                    knob_stuck_reads: 0,
                }),
        )
    }

    #[tokio::test]
    async fn test_knob_z_is_written_with_the_xy_offset() {
        let machine = knob_machine();
        let mut aligner = aligner(Arc::clone(&machine), config()).await;

        let cp = aligner
            .capture_control_point_at(CAMERA_CENTER.0, CAMERA_CENTER.1, None)
            .await
            .unwrap();
        assert_eq!(cp.z_reference.map(|r| r.endstop_z), Some(2.0));

        let session = aligner.run(cp).await.unwrap();
        assert_eq!(session.results().len(), 2);
        // (-1.5 - 0.7) - (2.4 - 2.0) and (-1.0 - 0.7) - (2.1 - 2.0)
        assert_eq!(session.tool_z(0), Some(-2.6));
        assert_eq!(session.tool_z(1), Some(-1.8));

        let t0 = machine.offset_of(0).unwrap();
        assert_eq!(t0.z(), -2.6);
        assert_eq!((t0.x(), t0.y()), (session.results()[0].x, session.results()[0].y));
        assert!(machine
            .commands()
            .iter()
            .any(|c| c.starts_with("G10 P1 ") && c.ends_with(" Z-1.800")));
    }

    #[tokio::test]
    async fn test_stuck_knob_keeps_the_xy_result() {
        let machine = knob_machine();
        let (events, mut rx) = EventSink::channel();
        let mut aligner = aligner(Arc::clone(&machine), config().with_tools(vec![0]))
            .await
            .with_events(events);

        let cp = aligner
            .capture_control_point_at(CAMERA_CENTER.0, CAMERA_CENTER.1, None)
            .await
            .unwrap();
        assert!(cp.z_reference.is_some());
        machine.stick_knob(10);

        let session = aligner.run(cp).await.unwrap();
        let results = session.results();
        assert_eq!(results.len(), 1);
        assert!((results[0].x - 0.3).abs() < 0.003, "T0 x = {}", results[0].x);
        assert!((results[0].y - -0.2).abs() < 0.003, "T0 y = {}", results[0].y);
        assert_eq!(session.tool_z(0), Some(-1.5));

        let t0 = machine.offset_of(0).unwrap();
        assert_eq!((t0.x(), t0.y(), t0.z()), (results[0].x, results[0].y, -1.5));
        assert!(!machine.commands().iter().any(|c| c.starts_with("G30 S-1 K3")));

        let mut skipped = false;
        while let Ok(event) = rx.try_recv() {
            if let AlignmentEvent::Message(text) = event {
                skipped |= text.starts_with("T0: Z calibration skipped");
            }
        }
        assert!(skipped);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let machine = machine();
        let mut aligner = aligner(Arc::clone(&machine), config().with_tools(vec![5])).await;
        let cp = ControlPoint::at(MachinePosition::xyz(150.0, 80.0, 20.0));
        let result = aligner.run(cp).await;
        assert!(matches!(
            result,
            Err(AlignError::Machine(MachineError::UnknownTool(5)))
        ));
    }
}
