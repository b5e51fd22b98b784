use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use avatar_core::{
    runtime::{configure_ort_dylib, AvatarPipeline, PipelineConfig},
    stream::CAPTURE_FPS,
    video::{remux, FileSource, Mp4Sink},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "avatarcam",
    version,
    about = "Landmark-driven avatar video pipeline",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: detect landmarks, deform, overlay, record.
    Run {
        /// Input video path (stands in for the live camera feed)
        #[arg(short, long)]
        input: PathBuf,

        /// Face-mesh ONNX model path
        #[arg(long, default_value = "face_mesh.onnx")]
        model: PathBuf,

        /// Output recording path
        #[arg(short, long, default_value = "avatar.mp4")]
        output: PathBuf,

        /// Smile strength (positive pull on the lip region)
        #[arg(long)]
        smile: Option<f32>,

        /// Grimace strength (downward pull; overrides --smile when both set)
        #[arg(long)]
        grimace: Option<f32>,

        /// Deformation falloff radius in UV units
        #[arg(long)]
        radius: Option<f32>,

        /// Horizontal offset of the deformation center
        #[arg(long)]
        anchor_x: Option<f32>,

        /// Vertical offset of the deformation center
        #[arg(long)]
        anchor_y: Option<f32>,

        /// Draw the red bounding box around the tracked face
        #[arg(long)]
        show_box: bool,

        /// Canvas width
        #[arg(long, default_value_t = 1280)]
        width: u32,

        /// Canvas height
        #[arg(long, default_value_t = 720)]
        height: u32,
    },

    /// Debug pass: draw the wireframe mesh and bounding box, no deformation.
    Detect {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Face-mesh ONNX model path
        #[arg(long, default_value = "face_mesh.onnx")]
        model: PathBuf,

        /// Output video path
        #[arg(short, long, default_value = "detected.mp4")]
        output: PathBuf,
    },

    /// Copy a recorded session to a new container without re-encoding.
    View {
        /// Recorded session path
        #[arg(short, long)]
        session: PathBuf,

        /// Output path
        #[arg(short, long, default_value = "session.mp4")]
        output: PathBuf,

        /// Drop the audio track
        #[arg(long)]
        mute: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            model,
            output,
            smile,
            grimace,
            radius,
            anchor_x,
            anchor_y,
            show_box,
            width,
            height,
        } => cmd_run(RunArgs {
            input,
            model,
            output,
            smile,
            grimace,
            radius,
            anchor_x,
            anchor_y,
            show_box,
            container: (width, height),
        }),
        Commands::Detect {
            input,
            model,
            output,
        } => cmd_detect(input, model, output),
        Commands::View {
            session,
            output,
            mute,
        } => cmd_view(session, output, mute),
    }
}

// ── Run: the full pipeline ────────────────────────────────────────────────────

struct RunArgs {
    input: PathBuf,
    model: PathBuf,
    output: PathBuf,
    smile: Option<f32>,
    grimace: Option<f32>,
    radius: Option<f32>,
    anchor_x: Option<f32>,
    anchor_y: Option<f32>,
    show_box: bool,
    container: (u32, u32),
}

fn cmd_run(args: RunArgs) -> Result<()> {
    info!("avatar pipeline");
    info!("  input  : {}", args.input.display());
    info!("  model  : {}", args.model.display());
    info!("  output : {}", args.output.display());

    configure_ort_dylib();

    let source = FileSource::open(&args.input)
        .with_context(|| format!("failed to open input: {}", args.input.display()))?;
    let (fps_num, fps_den) = source.frame_rate();
    let total_frames = source.total_frames();
    info!(fps_num, fps_den, total_frames, "input opened");

    let mut pipeline = AvatarPipeline::new(
        source,
        PipelineConfig {
            model_path: args.model,
            container: args.container,
        },
    );

    let controls = pipeline.controls();
    if let Some(v) = args.smile {
        controls.set_smile_intensity(v);
    }
    if let Some(v) = args.grimace {
        controls.set_grimace_intensity(v);
    }
    if let Some(v) = args.radius {
        controls.set_radius(v);
    }
    if let Some(v) = args.anchor_x {
        controls.set_anchor_offset_x(v);
    }
    if let Some(v) = args.anchor_y {
        controls.set_anchor_offset_y(v);
    }
    controls.set_show_bounding_box(args.show_box);

    let mut sink = Mp4Sink::create(&args.output, CAPTURE_FPS)
        .with_context(|| format!("failed to create output: {}", args.output.display()))?;

    let pb = if total_frames > 0 {
        progress(total_frames, "Rendering avatar…")
    } else {
        spinner("Rendering avatar…")
    };
    let pb2 = pb.clone();

    pipeline.run_to_end(
        &mut |_stream| info!("output stream acquired"),
        &mut |stream| {
            while let Some(frame) = stream.next_frame() {
                sink.push(&frame)?;
                pb2.inc(1);
            }
            Ok(())
        },
    )?;

    sink.finish().context("failed to finalise recording")?;
    pb.finish_with_message("Recording saved.");
    Ok(())
}

// ── Detect: overlays only ─────────────────────────────────────────────────────

fn cmd_detect(input: PathBuf, model: PathBuf, output: PathBuf) -> Result<()> {
    info!("landmark overlay pass");
    info!("  input  : {}", input.display());
    info!("  output : {}", output.display());

    configure_ort_dylib();

    let source = FileSource::open(&input)
        .with_context(|| format!("failed to open input: {}", input.display()))?;
    let (sw, sh) = source.native_dimensions();

    // Same pipeline, zero intensity: the warp is a passthrough and only the
    // wireframe and bounding box land on the video.
    let mut pipeline = AvatarPipeline::new(
        source,
        PipelineConfig {
            model_path: model,
            container: (sw, sh),
        },
    );
    pipeline.controls().set_show_bounding_box(true);

    let mut sink = Mp4Sink::create(&output, CAPTURE_FPS)
        .with_context(|| format!("failed to create output: {}", output.display()))?;

    let pb = spinner("Drawing landmarks…");
    let pb2 = pb.clone();

    pipeline.run_to_end(
        &mut |_stream| {},
        &mut |stream| {
            while let Some(frame) = stream.next_frame() {
                sink.push(&frame)?;
                pb2.tick();
            }
            Ok(())
        },
    )?;

    sink.finish().context("failed to finalise output")?;
    pb.finish_with_message("Done.");
    Ok(())
}

// ── View: remux a recorded session ────────────────────────────────────────────

fn cmd_view(session: PathBuf, output: PathBuf, mute: bool) -> Result<()> {
    info!("  session : {}", session.display());
    info!("  output  : {}", output.display());

    let pb = spinner("Copying session…");
    remux(&session, &output, mute).context("session remux failed")?;
    pb.finish_with_message("Session saved.");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress(total: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} [{elapsed_precise}]")
            .unwrap()
            .progress_chars("=> "),
    );
    pb.set_message(msg.to_string());
    pb
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
