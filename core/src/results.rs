//! Result files of a dataset run
//!
//! Every processed frame produces one row in `data.csv`:
//!
//! ```text
//! "Iteration","ImageName","ParticleCount [count]","RelativePosX [map px]","RelativePosY [map px]","LocationError [map px]","SVODistance [map px]"
//! 0,"frame_000.png",200,0,0,3.00,0.00
//! ```
//!
//! Text fields are quoted, numbers are not, and the two distances carry two decimals. When
//! requested, `histograms.csv` receives one line per filter update with the match correlation of
//! every particle.
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Serialize, Serializer};

use crate::PixelPoint;
use crate::filter::Particles;

pub const DATA_FILE: &str = "data.csv";
pub const HISTOGRAM_FILE: &str = "histograms.csv";

/// Localization quality of one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameResult {
    pub particle_count: usize,
    /// Predicted location relative to the location predicted at start-up.
    pub relative_location: PixelPoint,
    /// Distance between the prediction and the ground truth.
    pub location_error: f64,
    /// Distance between the odometry position and the ground truth.
    pub svo_distance: f64,
}

impl FrameResult {
    pub fn new(
        particle_count: usize,
        start: PixelPoint,
        prediction: PixelPoint,
        ground_truth: PixelPoint,
        svo_position: PixelPoint,
    ) -> Self {
        FrameResult {
            particle_count,
            relative_location: PixelPoint::from(prediction - start),
            location_error: pixel_distance(ground_truth, prediction),
            svo_distance: pixel_distance(ground_truth, svo_position),
        }
    }
}

fn pixel_distance(a: PixelPoint, b: PixelPoint) -> f64 {
    (a - b).cast::<f64>().norm()
}

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:.2}", value))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultRow {
    #[serde(rename = "Iteration")]
    pub iteration: usize,
    #[serde(rename = "ImageName")]
    pub image_name: String,
    #[serde(rename = "ParticleCount [count]")]
    pub particle_count: usize,
    #[serde(rename = "RelativePosX [map px]")]
    pub relative_x: i32,
    #[serde(rename = "RelativePosY [map px]")]
    pub relative_y: i32,
    #[serde(rename = "LocationError [map px]", serialize_with = "two_decimals")]
    pub location_error: f64,
    #[serde(rename = "SVODistance [map px]", serialize_with = "two_decimals")]
    pub svo_distance: f64,
}

impl ResultRow {
    pub fn new(iteration: usize, image_name: &str, result: &FrameResult) -> Self {
        ResultRow {
            iteration,
            image_name: image_name.to_string(),
            particle_count: result.particle_count,
            relative_x: result.relative_location.x,
            relative_y: result.relative_location.y,
            location_error: result.location_error,
            svo_distance: result.svo_distance,
        }
    }
}

/// Writes [`ResultRow`]s with a header, flushing after every row.
pub struct ResultWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl ResultWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(ResultWriter::from_writer(file))
    }
}

impl<W: Write> ResultWriter<W> {
    pub fn from_writer(writer: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::NonNumeric)
            .from_writer(writer);
        ResultWriter { writer }
    }

    pub fn write(&mut self, row: &ResultRow) -> Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush results: {}", e.error()))
    }
}

/// Writes one headerless line of particle correlations per filter update.
pub struct HistogramWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl HistogramWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(HistogramWriter::from_writer(file))
    }
}

impl<W: Write> HistogramWriter<W> {
    pub fn from_writer(writer: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(writer);
        HistogramWriter { writer }
    }

    pub fn write(&mut self, particles: &Particles) -> Result<()> {
        self.writer
            .write_record(particles.iter().map(|p| p.correlation().to_string()))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush histograms: {}", e.error()))
    }
}
