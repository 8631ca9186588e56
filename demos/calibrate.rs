//! Calibration driver
//!
//! Loads the settings, the camera calibration file and (in live mode) a
//! correspondence CSV, then prints the calibration report as JSON.
//!
//! Usage:
//! ```bash
//! cargo run --example calibrate -- \
//!   --settings samples/settings.yaml \
//!   --camera samples/ocam_calib.txt \
//!   --correspondences samples/correspondences.csv
//! ```
//!
//! With `--range-scan` each correspondence file is paired with the range scan
//! given at the same position and the camera-to-range-sensor extrinsics are
//! calibrated instead. That needs at least three board poses:
//! ```bash
//! cargo run --example calibrate -- -s settings.yaml -c ocam_calib.txt \
//!   -p board0.csv -r scan0.csv -p board1.csv -r scan1.csv -p board2.csv -r scan2.csv
//! ```

use clap::Parser;
use fisheye_calib::camera::{CameraIntrinsics, CameraModel};
use fisheye_calib::{Calibrator, CorrespondenceSet, RangeFrame, RangeScan, Settings};
use log::info;
use std::path::PathBuf;
use std::time::Instant;

/// Target and cross-sensor pose calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings YAML file
    #[arg(short = 's', long)]
    settings: PathBuf,

    /// Camera calibration file (.txt for omnidirectional, .yaml for Kannala-Brandt)
    #[arg(short = 'c', long)]
    camera: PathBuf,

    /// Correspondence CSV with header x,y,z,u,v[,valid]; repeat once per frame
    #[arg(short = 'p', long)]
    correspondences: Vec<PathBuf>,

    /// Range scan CSV with header x,y,z; switches to camera-to-range calibration
    #[arg(short = 'r', long)]
    range_scan: Vec<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let settings = Settings::load(&cli.settings)?;
    let camera = CameraIntrinsics::load(&cli.camera)?;
    info!(
        "Loaded {} camera, field of view {:.1} deg",
        camera.model_name(),
        camera.field_of_view().to_degrees()
    );

    let calibrator = Calibrator::new(settings, camera)?;
    let correspondences = cli
        .correspondences
        .iter()
        .map(CorrespondenceSet::load_csv)
        .collect::<Result<Vec<_>, _>>()?;

    let start = Instant::now();
    let json = if cli.range_scan.is_empty() {
        if correspondences.len() > 1 {
            return Err("several correspondence files need matching --range-scan files".into());
        }
        calibrator.run(correspondences.first())?.to_json()?
    } else {
        if cli.range_scan.len() != correspondences.len() {
            return Err(format!(
                "{} range scans for {} correspondence files",
                cli.range_scan.len(),
                correspondences.len()
            )
            .into());
        }
        let frames = correspondences
            .into_iter()
            .zip(&cli.range_scan)
            .map(|(image, scan)| RangeScan::load_csv(scan).map(|scan| RangeFrame { image, scan }))
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_string_pretty(&calibrator.camera_range(&frames)?)?
    };
    info!("Calibration finished in {:.2} ms", start.elapsed().as_secs_f64() * 1000.0);

    match cli.output {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
