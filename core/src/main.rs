//! MAPMATCH: locate a camera-equipped aerial vehicle on a reference map image.
//!
//! The tool replays a recorded flight (a dataset directory with camera frames and a
//! `metadata.csv`) through the particle-filter localizer and writes per-frame localization
//! errors to `<dataset>/<results>/<timestamp>-<map>/data.csv`.
//!
//! Filter parameters come from the defaults, an optional configuration file (TOML/JSON/YAML) and
//! finally the individual command-line flags, in that order of precedence.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::{find_map_description, init_logger, load_config, map_name};
use log::info;

use mapmatch::config::ParticleFilterConfig;
use mapmatch::dataset::DatasetReader;
use mapmatch::earth::MapDescription;
use mapmatch::matching::SampledDistanceMatcher;
use mapmatch::preview::{HeadlessPreview, ImagePreview, PreviewStrategy};
use mapmatch::{ConversionMode, RunOptions, Runtime, run_dataset};

const LONG_ABOUT: &str = "MAPMATCH: particle-filter map matching on recorded flights.

Every dataset frame is compared against the reference map through an affine template matcher.
The first frame anchors the filter at the ground-truth location; every following frame moves the
particles with the visual odometry and re-weights them by match quality.

The map image needs a georeferencing file (north, south, west, east, width, height) either given
with --map-description or placed next to the image as <stem>.json, .yaml, .yml or .toml.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Particle-filter map matching on recorded flights.", long_about = LONG_ABOUT)]
struct Cli {
    /// Path to the map image
    #[arg(short = 'm', long)]
    map_image: PathBuf,

    /// Georeferencing of the map image (TOML/JSON/YAML)
    #[arg(long)]
    map_description: Option<PathBuf>,

    /// Path to the dataset directory
    #[arg(short, long)]
    dataset: PathBuf,

    /// Result directory name inside the dataset directory
    #[arg(short, long, default_value = "results")]
    results: String,

    /// Process every n-th dataset entry
    #[arg(short, long, default_value_t = 10)]
    skip_rate: usize,

    /// Write preview images to the result directory
    #[arg(short, long)]
    write_images: bool,

    /// Perform affine image matching when evaluating particles
    #[arg(short, long)]
    affine_matching: bool,

    /// Run without preview rendering
    #[arg(long)]
    no_gui: bool,

    /// Correlation activation bound
    #[arg(short, long, default_value_t = 0.2)]
    correlation_bound: f64,

    /// Correlation to probability conversion function
    #[arg(short = 'M', long, value_enum, default_value_t = ConversionMode::Glf)]
    conversion_method: ConversionMode,

    /// Write per-particle correlations to histograms.csv
    #[arg(short = 'H', long)]
    write_histograms: bool,

    /// Particle filter configuration file (TOML/JSON/YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Particle filter radius
    #[arg(long)]
    particle_radius: Option<f64>,

    /// Particle filter epsilon
    #[arg(long)]
    epsilon: Option<f64>,

    /// Particle filter particle count
    #[arg(long)]
    particle_count: Option<usize>,

    /// Particle filter quantile
    #[arg(long)]
    quantile: Option<f64>,

    /// Particle filter KLD error
    #[arg(long)]
    kld_error: Option<f64>,

    /// Particle filter bin size
    #[arg(long)]
    bin_size: Option<i32>,

    /// Use gaussian sampling when spreading the initial particles
    #[arg(long)]
    use_gaussian: Option<bool>,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Run the single-shot matcher in the background and show its result in the preview
    #[arg(long)]
    fast_matcher: bool,

    /// Derive positions from the camera ground intersection instead of the odometry fix
    #[arg(long)]
    ground_projection: bool,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Defaults, then the config file, then individual flags.
    fn filter_config(&self) -> Result<ParticleFilterConfig> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(radius) = self.particle_radius {
            config.radius = radius;
        }
        if let Some(epsilon) = self.epsilon {
            config.epsilon = epsilon;
        }
        if let Some(count) = self.particle_count {
            config.particle_count = count;
        }
        if let Some(quantile) = self.quantile {
            config.quantile = quantile;
        }
        if let Some(kld_error) = self.kld_error {
            config.kld_error = kld_error;
        }
        if let Some(bin_size) = self.bin_size {
            config.bin_size = bin_size;
        }
        if let Some(use_gaussian) = self.use_gaussian {
            config.use_gaussian_sampling = use_gaussian;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate()?;
        Ok(config)
    }

    fn run_options(&self, config: ParticleFilterConfig) -> RunOptions {
        RunOptions {
            results: self.results.clone(),
            map_name: map_name(&self.map_image),
            config,
            conversion_mode: self.conversion_method,
            correlation_bound: self.correlation_bound,
            write_images: self.write_images,
            write_histograms: self.write_histograms,
        }
    }
}

fn run<P: PreviewStrategy>(cli: &Cli, preview: P) -> Result<()> {
    let config = cli.filter_config()?;
    let description_path = match &cli.map_description {
        Some(path) => path.clone(),
        None => match find_map_description(&cli.map_image) {
            Some(path) => path,
            None => bail!(
                "No map description found for '{}'; pass --map-description",
                cli.map_image.display()
            ),
        },
    };
    let description = MapDescription::from_file(&description_path)
        .with_context(|| format!("Map description '{}' is corrupted", description_path.display()))?;
    let map = image::open(&cli.map_image)
        .with_context(|| format!("Failed to read map image '{}'", cli.map_image.display()))?
        .to_luma8();
    if map.dimensions() != (description.width, description.height) {
        log::warn!(
            "Map image is {}x{} but its description says {}x{}",
            map.width(),
            map.height(),
            description.width,
            description.height
        );
    }
    let mut reader = DatasetReader::open(&cli.dataset, cli.skip_rate)?;
    info!(
        "Dataset {} holds {} entries, {} will be processed",
        cli.dataset.display(),
        reader.records().len(),
        reader.frame_count()
    );

    let mut runtime = Runtime::new(
        map,
        Box::new(description),
        Arc::new(SampledDistanceMatcher::default()),
        preview,
    );
    runtime.set_affine_matching(cli.affine_matching);
    runtime.set_ground_projection(cli.ground_projection);
    if cli.fast_matcher {
        runtime.enable_fast_matcher();
    }
    let summary = run_dataset(&mut runtime, &mut reader, &cli.run_options(config))?;
    info!(
        "Wrote {} result rows to {}",
        summary.frames,
        summary.output_directory.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    if cli.no_gui {
        run(&cli, HeadlessPreview::default())
    } else {
        run(&cli, ImagePreview::default())
    }
}
