use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use framewise_filter::{
    BackendKind, FilterError, FilterResult, FilterStage, PixelFormat, StageOptions, VideoFrame,
    available_backends, spawn_stream_from_channel,
};

#[derive(Debug, Parser)]
#[command(
    name = "framewise",
    about = "Run a DNN filter stage over a synthetic clip",
    disable_help_subcommand = true
)]
struct CliArgs {
    /// Inference backend
    #[arg(short = 'b', long = "backend", default_value = "native")]
    backend: String,

    /// Model file; a built-in identity model is generated when omitted
    #[arg(short = 'm', long = "model")]
    model: Option<PathBuf>,

    /// Model input tensor name
    #[arg(long = "input", default_value = "in")]
    input: String,

    /// Model output tensor name
    #[arg(long = "output", default_value = "out")]
    output: String,

    /// Run one inference per frame instead of the pooled engine
    #[arg(long = "sync")]
    sync: bool,

    /// Request slots in the pool
    #[arg(long = "nireq", default_value_t = 8)]
    nireq: usize,

    /// Frames packed per inference request
    #[arg(long = "batch-size", default_value_t = 4)]
    batch_size: usize,

    /// Frames to synthesize
    #[arg(long = "frames", default_value_t = 120)]
    frames: u64,

    /// Input pixel format
    #[arg(long = "pixel-format", default_value = "yuv420p")]
    pixel_format: String,

    #[arg(long = "width", default_value_t = 640)]
    width: u32,

    #[arg(long = "height", default_value_t = 360)]
    height: u32,

    /// Print the list of compiled backends
    #[arg(long = "list-backends")]
    list_backends: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), FilterError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();
    if args.list_backends {
        for backend in available_backends() {
            println!("{backend}");
        }
        return Ok(());
    }

    let format: PixelFormat = args.pixel_format.parse()?;
    let backend: BackendKind = args.backend.parse()?;
    if args.width == 0 || args.height == 0 {
        return Err(FilterError::configuration("frame geometry must be non-zero"));
    }

    let generated;
    let model_path = match &args.model {
        Some(path) => path.clone(),
        None => {
            generated = write_identity_model(format)?;
            generated.path().to_path_buf()
        }
    };

    let mut options = StageOptions::new(backend, model_path, args.input, args.output);
    options.async_mode = !args.sync;
    options.nireq = args.nireq;
    options.batch_size = args.batch_size;
    let stage = FilterStage::new(&options, format, args.width, args.height)?;

    let (total, width, height) = (args.frames, args.width, args.height);
    let input = spawn_stream_from_channel(8, move |tx| {
        for index in 0..total {
            let frame = synthesize_frame(format, width, height, index);
            if tx.blocking_send(Ok(frame)).is_err() {
                return;
            }
        }
    });

    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} frame {pos}/{len} ({per_sec})")
            .expect("static progress template"),
    );
    progress.enable_steady_tick(Duration::from_millis(100));

    let started_at = Instant::now();
    let mut emitted = 0u64;
    let mut last_timestamp = None;
    let mut output = stage.into_stream(input);
    while let Some(item) = output.next().await {
        let frame = item?;
        emitted += 1;
        last_timestamp = frame.timestamp().or(last_timestamp);
        progress.set_position(emitted);
    }
    progress.finish_and_clear();

    let elapsed = started_at.elapsed().as_secs_f64();
    println!(
        "processed {emitted}/{total} frames in {elapsed:.2}s ({:.1} fps), last pts {:?}",
        emitted as f64 / elapsed.max(f64::MIN_POSITIVE),
        last_timestamp
    );
    Ok(())
}

/// Identity model matching the pixel format's tensor shape, written next to
/// the run so the demo works without any model on disk.
fn write_identity_model(format: PixelFormat) -> FilterResult<tempfile::NamedTempFile> {
    use std::io::Write;

    let (channels, dtype) = match format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => (3, "uint8"),
        PixelFormat::Gray8 => (1, "uint8"),
        _ => (1, "float32"),
    };
    let json = format!(
        r#"{{
    "input": {{ "name": "in", "channels": {channels}, "dtype": "{dtype}" }},
    "output": {{ "name": "out" }},
    "op": {{ "type": "identity" }}
}}"#
    );
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(json.as_bytes())?;
    Ok(file)
}

/// Deterministic test clip: a rolling gradient on the first plane, mid-gray
/// chroma on the rest.
fn synthesize_frame(format: PixelFormat, width: u32, height: u32, index: u64) -> VideoFrame {
    let mut frame = VideoFrame::new(format, width, height).expect("geometry validated at startup");
    if format == PixelFormat::GrayF32 {
        let plane = frame.plane_mut(0);
        let stride = plane.stride();
        for row in 0..height as usize {
            let value = ((row + index as usize) % 256) as f32 / 255.0;
            let bytes = value.to_ne_bytes();
            for chunk in plane.data_mut()[row * stride..(row + 1) * stride].chunks_exact_mut(4) {
                chunk.copy_from_slice(&bytes);
            }
        }
    } else {
        let plane = frame.plane_mut(0);
        let stride = plane.stride();
        for (row, line) in plane.data_mut().chunks_mut(stride).enumerate() {
            line.fill(((row + index as usize) % 256) as u8);
        }
    }
    for plane_index in 1..frame.plane_count() {
        frame.plane_mut(plane_index).data_mut().fill(128);
    }
    frame
        .with_frame_index(Some(index))
        .with_timestamp(Some(Duration::from_millis(index * 1000 / 30)))
}
