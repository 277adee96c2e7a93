use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use opencv::{
    core::{Mat, Size},
    highgui,
    prelude::*,
    videoio::VideoWriter,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vehicle_counter::{
    visualization, BinaryMask, Config, Detector, FrameSource, PipelineController, PipelineEvent, PipelineState,
    ReplayDetector, StopReason, VideoFileSource,
};

const WINDOW: &str = "Vehicle Counter";

#[derive(Parser)]
#[command(
    name = "vehicle-counter",
    about = "Count vehicles crossing a line in a video",
    version
)]
struct Args {
    /// Path to the input video
    #[arg(short, long)]
    input: PathBuf,

    /// Binary mask image, same size as the video; detection only sees the white area
    #[arg(short, long)]
    mask: Option<PathBuf>,

    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Precomputed per-frame detections (JSON)
    #[arg(long, conflicts_with = "weights")]
    detections: Option<PathBuf>,

    /// TorchScript YOLO weights (needs the `torch` feature)
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Inference device for --weights: cpu or cuda
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Counting line as x1,y1,x2,y2
    #[arg(long, value_delimiter = ',', num_args = 4)]
    line: Option<Vec<i32>>,

    /// Half-height of the counting band in pixels
    #[arg(long)]
    band: Option<i32>,

    /// Annotated MP4 output
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show a window (space: pause/resume, q or Esc: stop)
    #[arg(short, long)]
    visualize: bool,

    /// Write a JSON summary of the run
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Output frame rate when the video does not report one
    #[arg(long, default_value_t = 30.0)]
    fps: f64,
}

#[derive(Serialize)]
struct Summary<'a> {
    input: &'a Path,
    frames: u64,
    count: usize,
    counted_ids: Vec<u64>,
    stop_reason: StopReason,
}

type CounterPipeline = PipelineController<VideoFileSource, Box<dyn Detector<Mat>>>;

fn build_detector(args: &Args) -> Result<Box<dyn Detector<Mat>>> {
    if let Some(path) = &args.detections {
        let replay = ReplayDetector::from_file(path)?;
        info!(frames = replay.frame_count(), "replaying detections from {}", path.display());
        return Ok(Box::new(replay));
    }
    if let Some(weights) = &args.weights {
        return torch_detector(weights, &args.device);
    }
    bail!("no detector: pass --detections or --weights")
}

#[cfg(feature = "torch")]
fn torch_detector(weights: &Path, device: &str) -> Result<Box<dyn Detector<Mat>>> {
    let detector = vehicle_counter::TorchDetector::new(&weights.to_string_lossy(), device, (640, 640))?;
    Ok(Box::new(detector))
}

#[cfg(not(feature = "torch"))]
fn torch_detector(_weights: &Path, _device: &str) -> Result<Box<dyn Detector<Mat>>> {
    bail!("--weights needs a build with the `torch` feature")
}

fn open_writer(path: &Path, fps: f64, size: Size) -> Result<Option<VideoWriter>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let writer = VideoWriter::new(&path.to_string_lossy(), fourcc, fps, size, true)?;
    if !writer.is_opened()? {
        warn!("could not open video writer for {}, output disabled", path.display());
        return Ok(None);
    }
    info!("writing annotated video to {}", path.display());
    Ok(Some(writer))
}

/// React to a key press. Returns `true` when the user asked to stop.
fn handle_key(pipeline: &mut CounterPipeline, key: i32, last_frame: Option<&Mat>) -> Result<bool> {
    match key {
        // q, Q, Esc
        113 | 81 | 27 => Ok(true),
        // space
        32 => {
            match pipeline.state() {
                PipelineState::Running => {
                    pipeline.pause()?;
                    if let Some(frame) = last_frame {
                        let mut shown = frame.clone();
                        visualization::draw_paused(&mut shown)?;
                        highgui::imshow(WINDOW, &shown)?;
                    }
                }
                PipelineState::Paused => pipeline.resume()?,
                _ => {}
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vehicle_counter=info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(&path.to_string_lossy())
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(line) = &args.line {
        config.line.limits = [line[0], line[1], line[2], line[3]];
    }
    if let Some(band) = args.band {
        config.line.band = band;
    }
    config.validate()?;
    info!(line = ?config.line.limits, band = config.line.band, "configuration ready");

    let detector = build_detector(&args)?;
    let mut pipeline: CounterPipeline = PipelineController::new(&config, detector)?;

    let input = args.input.to_string_lossy();
    let source = VideoFileSource::open(&input)?;
    let size = source.frame_size();
    let fps = if source.fps() > 0.0 { source.fps() } else { args.fps };
    pipeline.load(source)?;

    if let Some(mask_path) = &args.mask {
        let mask = BinaryMask::from_file(&mask_path.to_string_lossy())?;
        pipeline.set_mask(mask)?;
        info!("mask {} applied", mask_path.display());
    }

    let mut writer = match &args.output {
        Some(path) => open_writer(path, fps, Size::new(size.width as i32, size.height as i32))?,
        None => None,
    };
    if args.visualize {
        highgui::named_window(WINDOW, highgui::WINDOW_NORMAL)?;
        highgui::resize_window(WINDOW, size.width as i32, size.height as i32)?;
    }

    let events = pipeline.events();
    pipeline.start()?;

    let mut user_stop = false;
    let mut last_frame: Option<Mat> = None;
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PipelineEvent::Frame(event)) => {
                if let Some(writer) = writer.as_mut() {
                    writer.write(&event.frame)?;
                }
                if event.index % 100 == 0 {
                    info!(frame = event.index, count = event.count, "progress");
                }
                if args.visualize {
                    highgui::imshow(WINDOW, &event.frame)?;
                    last_frame = Some(event.frame);
                    let key = highgui::wait_key(1)?;
                    if handle_key(&mut pipeline, key, last_frame.as_ref())? {
                        user_stop = true;
                        break;
                    }
                }
            }
            Ok(PipelineEvent::Finished(reason)) => {
                info!(?reason, "run finished");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                // Paused or slow detector; keep the window responsive.
                if args.visualize {
                    let key = highgui::wait_key(1)?;
                    if handle_key(&mut pipeline, key, last_frame.as_ref())? {
                        user_stop = true;
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let outcome = if user_stop { pipeline.stop() } else { pipeline.wait() };
    let reason = outcome.context("video processing failed")?;

    if let Some(mut writer) = writer {
        writer.release()?;
    }
    if args.visualize {
        highgui::destroy_all_windows()?;
    }

    let counted_ids = pipeline
        .counting_line()
        .map(|line| line.counted_ids())
        .unwrap_or_default();
    info!(count = counted_ids.len(), frames = pipeline.position(), "done");
    println!("Total vehicles counted: {}", counted_ids.len());

    if let Some(path) = &args.summary {
        let summary = Summary {
            input: &args.input,
            frames: pipeline.position(),
            count: counted_ids.len(),
            counted_ids,
            stop_reason: reason,
        };
        fs::write(path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("writing summary {}", path.display()))?;
        info!("summary written to {}", path.display());
    }

    Ok(())
}
