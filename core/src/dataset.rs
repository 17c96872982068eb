//! Dataset reading
//!
//! A dataset is a directory holding camera frames and a `metadata.csv` file with one row per
//! frame. Each row carries the image file name, the GNSS fix, the ground-truth map location, the
//! visual odometry position, the IMU attitude quaternion and the compass heading:
//!
//! ```text
//! image,latitude,longitude,altitude,map_x,map_y,svo_x,svo_y,svo_z,qw,qx,qy,qz,yaw
//! ```
//!
//! [`DatasetReader`] yields every `skip_rate`-th row together with its grayscale image.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::GrayImage;
use nalgebra::{Quaternion, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::PixelPoint;
use crate::models::SvoPose;

/// Name of the per-frame metadata file inside a dataset directory.
pub const METADATA_FILE: &str = "metadata.csv";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Image file name relative to the dataset directory.
    pub image: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Barometric altitude above ground in meters.
    pub altitude: f64,
    /// Ground-truth location in map pixels.
    pub map_x: i32,
    pub map_y: i32,
    pub svo_x: f64,
    pub svo_y: f64,
    pub svo_z: f64,
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    /// Compass heading in radians, clockwise from north.
    pub yaw: f64,
}

impl FrameRecord {
    pub fn svo_pose(&self) -> SvoPose {
        SvoPose {
            x: self.svo_x,
            y: self.svo_y,
            z: self.svo_z,
        }
    }
    pub fn attitude(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(Quaternion::new(self.qw, self.qx, self.qy, self.qz))
    }
    pub fn map_location(&self) -> PixelPoint {
        PixelPoint::new(self.map_x, self.map_y)
    }
}

/// One dataset entry with its decoded image.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Row index in `metadata.csv`.
    pub index: usize,
    pub record: FrameRecord,
    pub image: GrayImage,
}

pub struct DatasetReader {
    directory: PathBuf,
    records: Vec<FrameRecord>,
    skip_rate: usize,
    position: usize,
}

impl DatasetReader {
    /// Reads `metadata.csv` from `directory`. A `skip_rate` of 0 is treated as 1.
    pub fn open<P: AsRef<Path>>(directory: P, skip_rate: usize) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let metadata = directory.join(METADATA_FILE);
        if !metadata.exists() {
            bail!(
                "dataset directory {} does not contain {}",
                directory.display(),
                METADATA_FILE
            );
        }
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&metadata)
            .with_context(|| format!("failed to open {}", metadata.display()))?;
        let mut records = Vec::new();
        for (row, result) in reader.deserialize().enumerate() {
            let record: FrameRecord =
                result.with_context(|| format!("malformed row {} in {}", row + 1, metadata.display()))?;
            records.push(record);
        }
        Ok(DatasetReader::from_records(directory, records, skip_rate))
    }

    pub fn from_records(directory: PathBuf, records: Vec<FrameRecord>, skip_rate: usize) -> Self {
        DatasetReader {
            directory,
            records,
            skip_rate: skip_rate.max(1),
            position: 0,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }
    /// Number of frames the reader yields in total.
    pub fn frame_count(&self) -> usize {
        self.records.len().div_ceil(self.skip_rate)
    }

    /// Loads the next frame, or `None` when the dataset is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let index = self.position;
        let Some(record) = self.records.get(index).cloned() else {
            return Ok(None);
        };
        self.position += self.skip_rate;
        let path = self.directory.join(&record.image);
        let image = image::open(&path)
            .with_context(|| format!("failed to read frame image {}", path.display()))?
            .to_luma8();
        Ok(Some(Frame {
            index,
            record,
            image,
        }))
    }
}

impl Iterator for DatasetReader {
    type Item = Result<Frame>;
    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
