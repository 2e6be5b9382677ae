//! Demo driver running the simulated DSLR and device-bus sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use astro_capture::bus::mock::SimulatedBus;
use astro_capture::bus::observatory::{FrameType, Observatory};
use astro_capture::capture::Trigger;
use astro_capture::sdk::mock::MockCaptureSdk;
use astro_capture::shutter::mock::ScriptedTransport;
use astro_capture::shutter::ShutterController;
use astro_capture::{logging, CameraModel, CameraOptions, DslrCamera, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated capture sessions")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture one frame from a simulated DSLR
    Dslr {
        /// Camera model number (750, 90 or 5300)
        #[arg(long, default_value_t = 750)]
        model: u32,
        /// ISO label, e.g. "800"
        #[arg(long)]
        iso: Option<String>,
        /// Exposure length in seconds
        #[arg(long, default_value_t = 1.0)]
        exposure: f64,
        /// Time the exposure with the external shutter release
        #[arg(long)]
        serial: bool,
        /// Directory the image is written to
        #[arg(long)]
        dest_dir: Option<PathBuf>,
    },
    /// Run a session against the simulated device bus
    Bus {
        /// Exposure length in seconds
        #[arg(long, default_value_t = 1.0)]
        exposure: f64,
        /// Slew target as RA hours and DEC degrees
        #[arg(long, num_args = 2, value_names = ["RA", "DEC"])]
        goto: Option<Vec<f64>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    logging::init(&settings.log_level);

    match args.command {
        Command::Dslr {
            model,
            iso,
            exposure,
            serial,
            dest_dir,
        } => {
            let exposure = Duration::try_from_secs_f64(exposure)
                .with_context(|| format!("invalid exposure {exposure}"))?;
            run_dslr(&settings, model, iso, exposure, serial, dest_dir).await
        }
        Command::Bus { exposure, goto } => run_bus(&settings, exposure, goto).await,
    }
}

async fn run_dslr(
    settings: &Settings,
    model: u32,
    iso: Option<String>,
    exposure: Duration,
    serial: bool,
    dest_dir: Option<PathBuf>,
) -> Result<()> {
    let model = CameraModel::from_number(model)
        .with_context(|| format!("unsupported camera model {model}"))?;
    let mut options = CameraOptions::new(model);
    if let Some(dir) = dest_dir {
        options = options.with_dest_dir(dir);
    }
    let trigger = if serial {
        Trigger::Serial(ShutterController::new(
            Box::new(ScriptedTransport::echoing()),
            settings.serial.retry_policy(),
        ))
    } else {
        Trigger::Vendor
    };

    let sdk = Arc::new(MockCaptureSdk::default());
    let mut camera = DslrCamera::open(sdk, options, trigger, &settings.capture)?;
    if let Some(label) = iso {
        camera.set_iso_label(&label)?;
    }

    info!("Exposing for {:?}", exposure);
    let image = camera.take_picture(exposure).await?;
    let path = camera
        .options()
        .dest_dir
        .as_ref()
        .map(|dir| dir.join(image.file_name()));
    camera.close().await?;

    let report = json!({
        "model": model.to_string(),
        "image_id": image.id,
        "captured_at": image.captured_at,
        "bytes": image.bytes.len(),
        "path": path,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_bus(settings: &Settings, exposure: f64, goto: Option<Vec<f64>>) -> Result<()> {
    let mut observatory = Observatory::new(Arc::new(SimulatedBus::new()), settings.bus.clone());
    observatory.initialize().await?;

    observatory.set_camera_frame_type(FrameType::Light)?;
    observatory.camera_start_exposure(exposure)?;
    let timeout =
        Duration::try_from_secs_f64(exposure).unwrap_or_default() + settings.bus.connect_timeout;
    observatory.wait_for_exposure(timeout).await?;

    if let Some([ra, dec]) = goto.as_deref() {
        observatory.mount_move_to(*ra, *dec)?;
    }

    let report = json!({
        "camera": observatory.camera(),
        "geometry": observatory.camera_geometry(),
        "mount": observatory.mount(),
        "focuser": observatory.focuser(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    observatory.close().await?;
    Ok(())
}
