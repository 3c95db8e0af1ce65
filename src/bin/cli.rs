//! nozzle-align - camera-based tool offset alignment
//!
//! This is the CLI entry point for the nozzle-align tool.
//! Run with: cargo run --bin nozzle-align -- align --cycles 3

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nozzle_align::analysis::{read_results, write_results, RepeatabilityReport};
use nozzle_align::calibration::{
    apply_offset, capture_manual_offset, AlignmentEvent, ControlPoint, EventSink, OperatorPrompt, ToolAligner,
    TransformCadence,
};
use nozzle_align::camera::{FrameFeed, SnapshotSource, StillSource};
use nozzle_align::event_log::{EventLog, LogEntry};
use nozzle_align::machine::{DuetClient, MachinePosition};
use nozzle_align::vision::{EndstopDetector, FeatureDetector, NozzleDetector, OverlayFont};
use nozzle_align::AppSettings;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Timeout for a single camera snapshot request.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "nozzle-align", version, about = "Camera-based XY/Z tool offset alignment")]
struct Cli {
    /// Controller URL (overrides settings and PRINTER_URL)
    #[arg(long, global = true)]
    printer: Option<String>,

    /// Camera snapshot URL (overrides settings and CAMERA_URL)
    #[arg(long, global = true)]
    camera: Option<String>,

    /// Use the loose circularity bound for dirty or odd-shaped nozzles
    #[arg(long, global = true)]
    loose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the controlled point and align every tool
    Align(AlignArgs),
    /// Run the detector on the live camera (or image files) and print results
    Detect(DetectArgs),
    /// Print the repeatability report of an exported result file
    Analyze {
        file: PathBuf,
    },
    /// Compute the active tool's offset from where it is centred now
    CaptureOffset {
        /// Controlled point X
        #[arg(long, allow_hyphen_values = true)]
        cp_x: f64,
        /// Controlled point Y
        #[arg(long, allow_hyphen_values = true)]
        cp_y: f64,
        /// Write the offset to the tool table
        #[arg(long)]
        apply: bool,
    },
    /// Show the effective settings, optionally saving them
    Settings {
        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CpMode {
    /// Use the current position
    Current,
    /// Move to --cp-x/--cp-y first
    At,
    /// Find the endstop with the camera
    Auto,
}

#[derive(Args, Debug)]
struct AlignArgs {
    #[arg(long, value_enum, default_value = "current")]
    cp: CpMode,
    #[arg(long, allow_hyphen_values = true, required_if_eq("cp", "at"))]
    cp_x: Option<f64>,
    #[arg(long, allow_hyphen_values = true, required_if_eq("cp", "at"))]
    cp_y: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    cp_z: Option<f64>,
    /// Passes over the tool list
    #[arg(long)]
    cycles: Option<u32>,
    /// Comma-separated tool numbers
    #[arg(long, value_delimiter = ',')]
    tools: Vec<u32>,
    /// Refit the camera transform for every tool
    #[arg(long)]
    per_tool: bool,
    /// Skip Z probing
    #[arg(long)]
    no_z: bool,
    /// Only write offsets after the run, using each tool's last result
    #[arg(long)]
    apply_at_end: bool,
    /// Do not touch the tool table
    #[arg(long, conflicts_with = "apply_at_end")]
    dry_run: bool,
    /// Persist offsets with M500 P10
    #[arg(long)]
    save: bool,
    /// Write results as JSON, to the settings' export path when no file is given
    #[arg(long, num_args = 0..=1)]
    export: Option<Option<PathBuf>>,
    /// Keep the latest annotated frame in this PNG
    #[arg(long)]
    preview: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Detect in these images instead of the camera
    #[arg(long, num_args = 1..)]
    files: Vec<PathBuf>,
    /// Stop after this many frames
    #[arg(long)]
    count: Option<usize>,
    /// Look for the endstop instead of a nozzle
    #[arg(long)]
    endstop: bool,
}

/// Operator prompt on the terminal.
struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    fn acknowledge<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let message = message.to_string();
        Box::pin(async move {
            let read = tokio::task::spawn_blocking(move || {
                print!("{} [press Enter to continue] ", message);
                let _ = io::stdout().flush();
                let mut line = String::new();
                io::stdin().lock().read_line(&mut line).map(|_| ())
            })
            .await;
            if !matches!(read, Ok(Ok(()))) {
                tracing::warn!("could not read operator acknowledgement");
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut settings = AppSettings::load();
    settings.apply_env()?;
    if let Some(url) = &cli.printer {
        settings.printer_url = url.clone();
    }
    if let Some(url) = &cli.camera {
        settings.camera_url = url.clone();
    }
    if cli.loose {
        settings.detector.loose = true;
    }

    match cli.command {
        Command::Align(args) => align(settings, args).await,
        Command::Detect(args) => detect(settings, args).await,
        Command::Analyze { file } => analyze(file),
        Command::CaptureOffset { cp_x, cp_y, apply } => capture_offset(settings, cp_x, cp_y, apply).await,
        Command::Settings { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                settings.save()?;
                if let Some(path) = AppSettings::settings_path() {
                    println!("Saved to {}", path.display());
                }
            }
            Ok(())
        }
    }
}

async fn connect(settings: &AppSettings) -> anyhow::Result<DuetClient> {
    let client = DuetClient::connect(settings.duet_config())
        .await
        .with_context(|| format!("connecting to {}", settings.printer_url))?;
    println!("Connected to {} ({})", client.base_url(), client.firmware());
    Ok(client)
}

async fn start_camera(settings: &AppSettings) -> anyhow::Result<FrameFeed> {
    let source = SnapshotSource::new(&settings.camera_url, SNAPSHOT_TIMEOUT)?;
    let feed = FrameFeed::start(source, settings.feed_config())
        .await
        .with_context(|| format!("opening camera {}", settings.camera_url))?;
    let (width, height) = feed.resolution();
    println!("Camera resolution {}x{}", width, height);
    Ok(feed)
}

/// Print and log events until the sink is dropped.
async fn record_events(mut rx: mpsc::UnboundedReceiver<AlignmentEvent>, mut log: EventLog) -> EventLog {
    while let Some(event) = rx.recv().await {
        println!("{}", LogEntry::from_event(&event).format_display());
        log.record(&event);
    }
    log
}

async fn align(mut settings: AppSettings, args: AlignArgs) -> anyhow::Result<()> {
    if let Some(cycles) = args.cycles {
        settings.cycles = cycles;
    }
    if !args.tools.is_empty() {
        settings.tools = args.tools.clone();
    }
    if args.per_tool {
        settings.cadence = TransformCadence::PerTool;
    }
    if args.no_z {
        settings.probe_z = false;
    }
    settings.save_offsets = args.save;

    let mut config = settings.aligner_config();
    config.apply_offsets = !(args.dry_run || args.apply_at_end);

    let machine = Arc::new(connect(&settings).await?);
    let feed = start_camera(&settings).await?;

    let (events, rx) = EventSink::channel();
    let log = EventLog::new();
    if let Some(path) = log.log_file_path() {
        println!("Session log: {}", path.display());
    }
    let recorder = tokio::spawn(record_events(rx, log));

    let mut aligner = ToolAligner::new(Arc::clone(&machine), feed, config)
        .with_detector(Arc::new(NozzleDetector::new(settings.detector.clone())))
        .with_prompt(Arc::new(StdinPrompt));

    let events = match &args.preview {
        Some(path) => {
            let (events, mut previews) = events.with_previews();
            let path = path.clone();
            tokio::spawn(async move {
                while previews.changed().await.is_ok() {
                    let latest = previews.borrow_and_update().clone();
                    if let Some(image) = latest {
                        if let Err(e) = image.save(&path) {
                            tracing::warn!(path = %path.display(), error = %e, "failed to write preview");
                        }
                    }
                }
            });
            if !settings.font_path.is_empty() {
                match OverlayFont::load(&settings.font_path) {
                    Ok(font) => aligner = aligner.with_font(Arc::new(font)),
                    Err(e) => tracing::warn!(path = %settings.font_path, error = %e, "overlay font not loaded"),
                }
            }
            events
        }
        None => events,
    };
    aligner = aligner.with_events(events);

    let cancel = aligner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Cancelling after the current step...");
            cancel.cancel();
        }
    });

    let control_point: ControlPoint = match args.cp {
        CpMode::Current => aligner.capture_control_point().await?,
        CpMode::At => match (args.cp_x, args.cp_y) {
            (Some(x), Some(y)) => aligner.capture_control_point_at(x, y, args.cp_z).await?,
            _ => bail!("--cp at needs --cp-x and --cp-y"),
        },
        CpMode::Auto => aligner.auto_capture_control_point().await?,
    };

    let result = aligner.run(control_point).await;
    let session = match result {
        Ok(session) => session,
        Err(e) => {
            drop(aligner);
            let mut log = recorder.await?;
            log.error(format!("Calibration failed: {}", e));
            return Err(e.into());
        }
    };

    let report = RepeatabilityReport::from_results(session.results());
    if args.apply_at_end {
        aligner.apply_session(&session, args.save).await?;
        println!("Offsets written for {} tools", report.tools.len());
    }
    drop(aligner);
    recorder.await?;

    if !report.is_empty() {
        println!("{}", report);
    }

    if let Some(path) = args.export {
        let path = path.unwrap_or_else(|| PathBuf::from(&settings.export_path));
        write_results(&path, session.results(), &settings.printer_url)?;
        println!("Results written to {}", path.display());
    }
    Ok(())
}

async fn detect(settings: AppSettings, args: DetectArgs) -> anyhow::Result<()> {
    let mut feed = if args.files.is_empty() {
        start_camera(&settings).await?
    } else {
        FrameFeed::start(StillSource::from_files(args.files.clone()), settings.feed_config()).await?
    };
    let detector: Arc<dyn FeatureDetector> = if args.endstop {
        Arc::new(EndstopDetector::default())
    } else {
        Arc::new(NozzleDetector::new(settings.detector.clone()))
    };
    println!("Detecting with {} (Ctrl-C to stop)", detector.name());

    let mut seen = 0usize;
    while args.count.map_or(true, |limit| seen < limit) {
        let frame = tokio::select! {
            frame = feed.next_frame() => frame?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let detector = Arc::clone(&detector);
        let image = frame.shared_image();
        let candidates = tokio::task::spawn_blocking(move || detector.detect(&image)).await?;
        seen += 1;
        let listed: Vec<String> = candidates.iter().map(|d| d.to_string()).collect();
        println!("#{:<5} {:?}: {}", frame.sequence(), candidates.classify(), listed.join(", "));
    }
    Ok(())
}

fn analyze(file: PathBuf) -> anyhow::Result<()> {
    let exported = read_results(&file).with_context(|| format!("reading {}", file.display()))?;
    if let Some(trailer) = &exported.trailer {
        println!("Printer {} at {}", trailer.printer, trailer.datetime);
    }
    let report = RepeatabilityReport::from_results(&exported.results);
    if report.is_empty() {
        bail!("{} contains no results", file.display());
    }
    println!("{}", report);
    Ok(())
}

async fn capture_offset(settings: AppSettings, cp_x: f64, cp_y: f64, apply: bool) -> anyhow::Result<()> {
    let machine = connect(&settings).await?;
    let cp = MachinePosition::xyz(cp_x, cp_y, 0.0);
    let Some(offset) = capture_manual_offset(&machine, &cp).await? else {
        bail!("no tool is loaded");
    };
    println!("T{}: X{:.3} Y{:.3}", offset.tool, offset.x, offset.y);
    if apply {
        apply_offset(&machine, offset.tool, offset.x, offset.y, None).await?;
        println!("Offset written to the tool table");
    }
    Ok(())
}
