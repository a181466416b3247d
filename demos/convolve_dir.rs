// demos/convolve_dir.rs: Convolve every image in a directory as one batch.
//
// Usage:
//   cargo run --release --example convolve_dir -- ./images
//   cargo run --release --example convolve_dir -- ./images --limit 8 --mode valid --out ./conv
//   cargo run --release --example convolve_dir -- ./images --host
//
// Images are cropped to the window every image covers, converted to a
// pitched volume, and sent through a single device call. The process exit
// code is the call's status code (0 on success).
//
// Set RUST_LOG=info to see device selection, allocations, and timings.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::{error, info};

use batchconv::gpu::{AdapterSelection, DeviceProfile, GpuConfig};
use batchconv::image::Image;
use batchconv::loader::{load_batch, LoaderConfig};
use batchconv::{Accelerator, ConvError, ConvRun, ConvolutionEngine, HostAccelerator, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Output the same size as the input.
    Same,
    /// Only positions where the filter fits: 2 smaller per axis.
    Valid,
    /// Every position the filter touches: 2 larger per axis.
    Full,
}

impl Mode {
    fn output_shape(self, rows: usize, cols: usize) -> (usize, usize) {
        match self {
            Mode::Same => (rows, cols),
            Mode::Valid => (rows.saturating_sub(2), cols.saturating_sub(2)),
            Mode::Full => (rows + 2, cols + 2),
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Batch 3×3 convolution of a directory of grayscale images")]
struct Args {
    /// Directory holding the input images.
    dir: PathBuf,

    /// Load at most this many files.
    #[arg(long)]
    limit: Option<usize>,

    /// Adapter index, or "auto". Overrides BATCHCONV_ADAPTER.
    #[arg(long)]
    adapter: Option<AdapterSelection>,

    /// Device profile: native or rpi. Overrides BATCHCONV_PROFILE.
    #[arg(long)]
    profile: Option<DeviceProfile>,

    /// Run on the host accelerator instead of a GPU.
    #[arg(long)]
    host: bool,

    /// Write each convolved sample as a PNG into this directory.
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Same)]
    mode: Mode,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut loader = LoaderConfig::new(&args.dir);
    loader.limit = args.limit;
    let batch = match load_batch(&loader) {
        Ok(batch) => batch,
        Err(e) => {
            error!("{e}");
            return exit_with(Status::InvalidInput);
        }
    };
    let Some((rows, cols)) = batch.common_shape() else {
        return exit_with(Status::InvalidInput);
    };
    if !batch.is_uniform() {
        info!("images differ in size, cropping all to {rows}×{cols}");
    }
    let (rows_out, cols_out) = args.mode.output_shape(rows, cols);

    let result = if args.host {
        run(ConvolutionEngine::new(HostAccelerator::default()), &batch.images, rows, cols, rows_out, cols_out)
    } else {
        gpu_config(&args).and_then(|config| {
            let engine = ConvolutionEngine::with_gpu(&config)?;
            run(engine, &batch.images, rows, cols, rows_out, cols_out)
        })
    };

    let status = Status::of(&result);
    match result {
        Ok(run) => {
            println!(
                "{} samples {rows}×{cols} → {rows_out}×{cols_out}, kernel {:.3} ms",
                run.output.len(),
                run.kernel_time.as_secs_f64() * 1e3
            );
            if let Some(out) = &args.out {
                if let Err(e) = write_outputs(out, &batch.paths, &run.output) {
                    error!("writing outputs: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        Err(e) => error!("convolution failed: {e}"),
    }
    exit_with(status)
}

fn gpu_config(args: &Args) -> Result<GpuConfig, ConvError> {
    let mut config = GpuConfig::from_env()?;
    if let Some(adapter) = args.adapter {
        config.adapter = adapter;
    }
    if let Some(profile) = args.profile {
        config.profile = profile;
    }
    Ok(config)
}

fn run<A: Accelerator>(
    engine: ConvolutionEngine<A>,
    images: &[Image<u8>],
    rows: usize,
    cols: usize,
    rows_out: usize,
    cols_out: usize,
) -> Result<ConvRun<Vec<Image<i32>>>, ConvError> {
    println!("device: {}", engine.accelerator().describe());
    engine.convolve_images(images, rows, cols, rows_out, cols_out)
}

fn write_outputs(dir: &Path, sources: &[PathBuf], outputs: &[Image<i32>]) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    for (src, img) in sources.iter().zip(outputs) {
        let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("sample");
        let pixels: Image<u8> = img.map_pixels();
        let gray = image::GrayImage::from_raw(
            pixels.width() as u32,
            pixels.height() as u32,
            pixels.as_slice().to_vec(),
        )
        .ok_or("output buffer does not match its dimensions")?;
        let path = dir.join(format!("{stem}_conv.png"));
        gray.save(&path)?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn exit_with(status: Status) -> ExitCode {
    ExitCode::from(status.code() as u8)
}
