//! Dataset runtime
//!
//! [`Runtime`] drives a [`ParticleFastMatch`] through a recorded flight. On the first frame it
//! anchors the local tangent plane at the GNSS fix, spreads the particles around the ground-truth
//! map location and derives the search scale from the altitude. Every later frame runs
//!
//! ```text
//! odometry movement -> scale update -> heading update -> template update -> filter cycle
//! ```
//!
//! [`run_dataset`] feeds a [`DatasetReader`] through any [`LocalizationRuntime`] and records one
//! result row per frame under `<dataset>/<results>/<timestamp>[-<map name>]/`.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use image::GrayImage;
use image::imageops::{self, FilterType};
use log::{debug, info, warn};
use nalgebra::Point2;

use crate::config::ParticleFilterConfig;
use crate::dataset::{DatasetReader, Frame};
use crate::earth::{LocalTangentPlane, PixelMapper};
use crate::fast_matcher::FastMatcherThread;
use crate::filter::{DEFAULT_SCALE_STEPS, Particles};
use crate::localizer::{ConversionMode, DEFAULT_LOW_BOUND, FrameEstimate, ParticleFastMatch};
use crate::matching::AffineMatcher;
use crate::models::{DEFAULT_FIELD_OF_VIEW, MotionModelSvo, ScaleEstimate, ScaleModel};
use crate::preview::{PreviewContext, PreviewStrategy};
use crate::results::{
    DATA_FILE, FrameResult, HISTOGRAM_FILE, HistogramWriter, ResultRow, ResultWriter,
};
use crate::PixelPoint;

/// Capabilities [`run_dataset`] needs from a runtime.
pub trait LocalizationRuntime {
    fn initialize(&mut self, frame: &Frame, config: &ParticleFilterConfig) -> Result<()>;
    fn update(&mut self, frame: &Frame) -> Result<()>;
    /// # Returns
    /// `false` to stop the run.
    fn preview(&mut self, iteration: usize, frame: &Frame) -> Result<bool>;
    fn describe(&self) -> String;
    /// `None` before initialization.
    fn particles(&self) -> Option<&Particles>;
    /// `None` before initialization.
    fn frame_result(&self, frame: &Frame) -> Option<FrameResult>;
    fn set_conversion_method(&mut self, mode: ConversionMode);
    fn set_correlation_low_bound(&mut self, bound: f64);
    fn set_output_directory(&mut self, directory: &Path);
}

/// Geodesy and filter state that exists once the first frame was seen.
struct Session {
    engine: ParticleFastMatch,
    plane: LocalTangentPlane,
    start_location: PixelPoint,
}

pub struct Runtime<P: PreviewStrategy> {
    map: GrayImage,
    mapper: Box<dyn PixelMapper>,
    matcher: Arc<dyn AffineMatcher>,
    preview: P,
    session: Option<Session>,
    direction: f64,
    svo_position: PixelPoint,
    scale: Option<ScaleEstimate>,
    scale_model: ScaleModel,
    motion_model: MotionModelSvo,
    affine_matching: bool,
    ground_projection: bool,
    conversion_mode: ConversionMode,
    low_bound: f64,
    estimate: Option<FrameEstimate>,
    best_view: Option<GrayImage>,
    fast_matcher: Option<FastMatcherThread>,
    fast_match_origin: PixelPoint,
    fast_match: Option<Point2<f64>>,
}

impl<P: PreviewStrategy> Runtime<P> {
    pub fn new(
        map: GrayImage,
        mapper: Box<dyn PixelMapper>,
        matcher: Arc<dyn AffineMatcher>,
        preview: P,
    ) -> Self {
        Runtime {
            map,
            mapper,
            matcher,
            preview,
            session: None,
            direction: 0.0,
            svo_position: PixelPoint::origin(),
            scale: None,
            scale_model: ScaleModel,
            motion_model: MotionModelSvo,
            affine_matching: false,
            ground_projection: false,
            conversion_mode: ConversionMode::default(),
            low_bound: DEFAULT_LOW_BOUND,
            estimate: None,
            best_view: None,
            fast_matcher: None,
            fast_match_origin: PixelPoint::origin(),
            fast_match: None,
        }
    }

    pub fn set_affine_matching(&mut self, enabled: bool) {
        self.affine_matching = enabled;
    }

    /// Derive the position from the camera's ground intersection instead of the odometry fix.
    pub fn set_ground_projection(&mut self, enabled: bool) {
        self.ground_projection = enabled;
    }

    /// Runs the single-shot matcher in the background next to the particle filter.
    pub fn enable_fast_matcher(&mut self) {
        self.fast_matcher = Some(FastMatcherThread::new(Arc::clone(&self.matcher)));
    }

    pub fn preview_strategy(&self) -> &P {
        &self.preview
    }
    pub fn direction(&self) -> f64 {
        self.direction
    }
    pub fn svo_position(&self) -> PixelPoint {
        self.svo_position
    }
    pub fn scale(&self) -> Option<ScaleEstimate> {
        self.scale
    }
    pub fn estimate(&self) -> Option<&FrameEstimate> {
        self.estimate.as_ref()
    }
    pub fn engine(&self) -> Option<&ParticleFastMatch> {
        self.session.as_ref().map(|s| &s.engine)
    }
    pub fn start_location(&self) -> Option<PixelPoint> {
        self.session.as_ref().map(|s| s.start_location)
    }
    pub fn fast_match(&self) -> Option<Point2<f64>> {
        self.fast_match
    }

    /// Collects a finished background match and submits the current frame.
    fn poll_fast_matcher(&mut self, frame: &Frame) {
        let (Some(matcher), Some(session)) = (self.fast_matcher.as_mut(), self.session.as_ref())
        else {
            return;
        };
        if let Some(result) = matcher.result_if_available() {
            match result {
                Ok(location) => {
                    let origin = self.fast_match_origin;
                    let location =
                        Point2::new(location.x + origin.x as f64, location.y + origin.y as f64);
                    debug!("fast matcher located the vehicle at {:?}", location);
                    self.fast_match = Some(location);
                }
                Err(e) => warn!("fast matcher failed: {:#}", e),
            }
        }
        if matcher.is_running() {
            return;
        }

        let template = match self.scale {
            Some(scale) if scale.scale > 0.0 => {
                let width = ((frame.image.width() as f64 * scale.scale).round() as u32).max(1);
                let height = ((frame.image.height() as f64 * scale.scale).round() as u32).max(1);
                imageops::resize(&frame.image, width, height, FilterType::Triangle)
            }
            _ => frame.image.clone(),
        };
        // search the neighbourhood of the prediction rather than the whole map
        let prediction = session.engine.predicted_location();
        let reach = session.engine.config().radius as i64
            + template.width().max(template.height()) as i64;
        let (map_width, map_height) = self.map.dimensions();
        let x0 = (prediction.x as i64 - reach).clamp(0, map_width as i64);
        let y0 = (prediction.y as i64 - reach).clamp(0, map_height as i64);
        let x1 = (prediction.x as i64 + reach).clamp(0, map_width as i64);
        let y1 = (prediction.y as i64 + reach).clamp(0, map_height as i64);
        if x1 - x0 <= template.width() as i64 || y1 - y0 <= template.height() as i64 {
            return;
        }
        let window =
            imageops::crop_imm(&self.map, x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
                .to_image();
        if matcher.match_async(&window, &template, self.direction) {
            self.fast_match_origin = PixelPoint::new(x0 as i32, y0 as i32);
        }
    }
}

impl<P: PreviewStrategy> LocalizationRuntime for Runtime<P> {
    fn initialize(&mut self, frame: &Frame, config: &ParticleFilterConfig) -> Result<()> {
        info!("Initializing on {}", frame.record.image);
        let record = &frame.record;
        self.direction = record.yaw;
        self.svo_position = record.map_location();
        let plane = LocalTangentPlane::new(record.latitude, record.longitude, record.altitude);
        let mut engine = ParticleFastMatch::new(
            record.map_location(),
            self.map.clone(),
            config.clone(),
            Arc::clone(&self.matcher),
        )?;
        engine.set_direction(self.direction);
        engine.conversion_mode = self.conversion_mode;
        engine.set_low_bound(self.low_bound);
        self.scale = Some(self.scale_model.update_scale(
            DEFAULT_FIELD_OF_VIEW,
            record.altitude,
            frame.image.width(),
            |low, high| engine.set_scale(low, high, DEFAULT_SCALE_STEPS),
        ));
        let start_location = engine.predicted_location();
        self.session = Some(Session {
            engine,
            plane,
            start_location,
        });
        info!(
            "Initialized {} particles around {:?}",
            config.particle_count, start_location
        );
        Ok(())
    }

    fn update(&mut self, frame: &Frame) -> Result<()> {
        if self.affine_matching {
            bail!("Affine particle matching is available with GPU support only");
        }
        let Some(session) = self.session.as_mut() else {
            bail!("runtime updated before initialization");
        };
        let record = &frame.record;
        let pose = record.svo_pose();
        let movement = if self.ground_projection {
            self.motion_model.movement_from_ground_projection(
                &pose,
                &session.plane,
                self.mapper.as_ref(),
                &record.attitude(),
                record.altitude,
                self.direction,
                self.svo_position,
            )
        } else {
            self.motion_model.movement(
                &pose,
                &session.plane,
                self.mapper.as_ref(),
                self.direction,
                self.svo_position,
            )
        };
        self.svo_position = movement.position;

        let engine = &mut session.engine;
        self.scale = Some(self.scale_model.update_scale(
            DEFAULT_FIELD_OF_VIEW,
            record.altitude,
            frame.image.width(),
            |low, high| engine.set_scale(low, high, DEFAULT_SCALE_STEPS),
        ));
        self.direction = record.yaw;
        engine.set_direction(self.direction);
        engine.set_template(frame.image.clone());
        let estimate = engine
            .filter_particles(&movement.vector)
            .with_context(|| format!("filter update failed on {}", record.image))?;
        self.best_view = engine.best_particle_view(&self.map);
        self.estimate = Some(estimate);
        self.poll_fast_matcher(frame);
        Ok(())
    }

    fn preview(&mut self, iteration: usize, frame: &Frame) -> Result<bool> {
        let Some(session) = self.session.as_ref() else {
            return Ok(true);
        };
        let context = PreviewContext {
            iteration,
            view: &frame.image,
            map: &self.map,
            particles: session.engine.particles(),
            corners: self.estimate.as_ref().and_then(|e| e.corners),
            prediction: session.engine.predicted_location(),
            ground_truth: frame.record.map_location(),
            svo_position: self.svo_position,
            direction: self.direction,
            best_view: self.best_view.as_ref(),
            fast_match: self.fast_match,
        };
        self.preview.render(&context)
    }

    fn describe(&self) -> String {
        match &self.session {
            Some(session) => session.engine.describe(),
            None => "uninitialized runtime".to_string(),
        }
    }

    fn particles(&self) -> Option<&Particles> {
        self.session.as_ref().map(|s| s.engine.particles())
    }

    fn frame_result(&self, frame: &Frame) -> Option<FrameResult> {
        let session = self.session.as_ref()?;
        Some(FrameResult::new(
            session.engine.particles().len(),
            session.start_location,
            session.engine.predicted_location(),
            frame.record.map_location(),
            self.svo_position,
        ))
    }

    fn set_conversion_method(&mut self, mode: ConversionMode) {
        self.conversion_mode = mode;
        if let Some(session) = self.session.as_mut() {
            session.engine.conversion_mode = mode;
        }
    }

    fn set_correlation_low_bound(&mut self, bound: f64) {
        self.low_bound = bound;
        if let Some(session) = self.session.as_mut() {
            session.engine.set_low_bound(bound);
        }
    }

    fn set_output_directory(&mut self, directory: &Path) {
        self.preview.set_output_directory(directory);
    }
}

/// Settings of one dataset run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Name of the results directory inside the dataset directory.
    pub results: String,
    /// Appended to the timestamped output directory name.
    pub map_name: Option<String>,
    pub config: ParticleFilterConfig,
    pub conversion_mode: ConversionMode,
    pub correlation_bound: f64,
    pub write_images: bool,
    pub write_histograms: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            results: "results".to_string(),
            map_name: None,
            config: ParticleFilterConfig::default(),
            conversion_mode: ConversionMode::default(),
            correlation_bound: DEFAULT_LOW_BOUND,
            write_images: false,
            write_histograms: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub output_directory: PathBuf,
    /// Frames with a result row.
    pub frames: usize,
    /// The preview asked to stop before the dataset was exhausted.
    pub stopped_early: bool,
}

/// `<dataset>/<results>/<%Y%m%d-%H%M%S>[-<map name>]`
pub fn output_directory(
    dataset: &Path,
    results: &str,
    map_name: Option<&str>,
    time: &DateTime<Local>,
) -> PathBuf {
    let mut name = time.format("%Y%m%d-%H%M%S").to_string();
    if let Some(map_name) = map_name.filter(|n| !n.is_empty()) {
        name.push('-');
        name.push_str(map_name);
    }
    dataset.join(results).join(name)
}

/// Runs every frame of `reader` through `runtime`.
///
/// The first frame initializes the runtime, every later frame updates it. Each frame is then
/// previewed and, unless the preview stops the run, recorded in `data.csv`.
pub fn run_dataset<R: LocalizationRuntime + ?Sized>(
    runtime: &mut R,
    reader: &mut DatasetReader,
    options: &RunOptions,
) -> Result<RunSummary> {
    let directory = output_directory(
        reader.directory(),
        &options.results,
        options.map_name.as_deref(),
        &Local::now(),
    );
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("failed to create {}", directory.display()))?;
    info!("Writing results to {}", directory.display());
    let mut results = ResultWriter::create(directory.join(DATA_FILE))?;
    let mut histograms = if options.write_histograms {
        Some(HistogramWriter::create(directory.join(HISTOGRAM_FILE))?)
    } else {
        None
    };
    if options.write_images {
        runtime.set_output_directory(&directory);
    }

    let mut summary = RunSummary {
        output_directory: directory,
        frames: 0,
        stopped_early: false,
    };
    let mut initialized = false;
    for (iteration, frame) in reader.by_ref().enumerate() {
        let frame = frame?;
        if !initialized {
            runtime.initialize(&frame, &options.config)?;
            runtime.set_conversion_method(options.conversion_mode);
            runtime.set_correlation_low_bound(options.correlation_bound);
            runtime.describe();
            initialized = true;
        } else {
            runtime.update(&frame)?;
            if let (Some(writer), Some(particles)) = (histograms.as_mut(), runtime.particles()) {
                writer.write(particles)?;
            }
        }
        if !runtime.preview(iteration, &frame)? {
            info!("Preview stopped the run at iteration {}", iteration);
            summary.stopped_early = true;
            break;
        }
        if let Some(result) = runtime.frame_result(&frame) {
            results.write(&ResultRow::new(iteration, &frame.record.image, &result))?;
            debug!(
                "iteration {}: error {:.2} px, odometry error {:.2} px",
                iteration, result.location_error, result.svo_distance
            );
        }
        summary.frames += 1;
    }
    info!("Processed {} frames", summary.frames);
    Ok(summary)
}
