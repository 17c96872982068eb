//! End-to-end tests of the dataset driver
//!
//! Each test writes a synthetic flight to a temporary directory: a textured map, a georeferencing
//! box around it, camera frames cropped from the map at the ground-truth location and a
//! `metadata.csv`. The flight is then replayed through [`run_dataset`] and the files it produces
//! are checked.
//!
//! The altitude is chosen so that the scale model yields a map scale of exactly 1 for the 32 px
//! frames, i.e. frames are pixel-for-pixel crops of the map.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use image::{GrayImage, Luma, imageops};
use nalgebra::Point2;

use mapmatch::dataset::{DatasetReader, METADATA_FILE};
use mapmatch::earth::MapDescription;
use mapmatch::matching::SampledDistanceMatcher;
use mapmatch::preview::{HeadlessPreview, ImagePreview, PreviewContext, PreviewStrategy};
use mapmatch::results::{DATA_FILE, HISTOGRAM_FILE};
use mapmatch::{ConversionMode, ParticleFilterConfig, RunOptions, Runtime, run_dataset};

const MAP_SIZE: u32 = 400;
const FRAME_SIZE: u32 = 32;
const HEADER: [&str; 7] = [
    "Iteration",
    "ImageName",
    "ParticleCount [count]",
    "RelativePosX [map px]",
    "RelativePosY [map px]",
    "LocationError [map px]",
    "SVODistance [map px]",
];

fn textured_map() -> GrayImage {
    GrayImage::from_fn(MAP_SIZE, MAP_SIZE, |x, y| {
        Luma([((x * 7 + y * 13 + (x * y) % 29) % 256) as u8])
    })
}

fn description() -> MapDescription {
    MapDescription {
        north: 50.004,
        south: 50.0,
        west: 8.0,
        east: 8.004,
        width: MAP_SIZE,
        height: MAP_SIZE,
        name: Some("synthetic".to_string()),
    }
}

/// Writes a hovering flight of `frames` frames over map pixel (200, 200).
fn write_flight(name: &str, map: &GrayImage, frames: usize) -> PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let (x, y) = (200, 200);
    let (latitude, longitude) = description().to_geodetic(&Point2::new(x as f64, y as f64));
    let altitude = (FRAME_SIZE / 2) as f64 / 0.5f64.tan();
    let mut metadata =
        String::from("image,latitude,longitude,altitude,map_x,map_y,svo_x,svo_y,svo_z,qw,qx,qy,qz,yaw\n");
    for i in 0..frames {
        let file = format!("frame_{i:03}.png");
        imageops::crop_imm(map, x - FRAME_SIZE / 2, y - FRAME_SIZE / 2, FRAME_SIZE, FRAME_SIZE)
            .to_image()
            .save(dir.join(&file))
            .unwrap();
        metadata.push_str(&format!(
            "{file},{latitude},{longitude},{altitude},{x},{y},0.0,0.0,0.0,1.0,0.0,0.0,0.0,0.0\n"
        ));
    }
    std::fs::write(dir.join(METADATA_FILE), metadata).unwrap();
    dir
}

fn options() -> RunOptions {
    RunOptions {
        map_name: Some("synthetic".to_string()),
        config: ParticleFilterConfig {
            radius: 10.0,
            epsilon: 0.5,
            particle_count: 16,
            seed: Some(5),
            ..ParticleFilterConfig::default()
        },
        ..RunOptions::default()
    }
}

fn runtime<P: PreviewStrategy>(map: &GrayImage, preview: P) -> Runtime<P> {
    Runtime::new(
        map.clone(),
        Box::new(description()),
        Arc::new(SampledDistanceMatcher::default()),
        preview,
    )
}

fn read_rows(path: &Path) -> (Vec<String>, Vec<csv::StringRecord>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
    (header, rows)
}

#[test]
fn headless_run_writes_one_row_per_frame() {
    let map = textured_map();
    let dir = write_flight("mapmatch_it_headless", &map, 5);
    let mut reader = DatasetReader::open(&dir, 1).unwrap();
    let mut runtime = runtime(&map, HeadlessPreview::default());
    let options = RunOptions {
        write_histograms: true,
        write_images: true,
        conversion_mode: ConversionMode::Softmax,
        ..options()
    };
    let summary = run_dataset(&mut runtime, &mut reader, &options).unwrap();

    assert_eq!(summary.frames, 5);
    assert!(!summary.stopped_early);
    assert!(summary.output_directory.starts_with(dir.join("results")));
    let name = summary.output_directory.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("-synthetic"));
    assert_eq!(name.len(), "YYYYmmdd-HHMMSS-synthetic".len());

    let (header, rows) = read_rows(&summary.output_directory.join(DATA_FILE));
    assert_eq!(header, HEADER);
    assert_eq!(rows.len(), 5);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row[0], i.to_string());
        assert_eq!(row[1], format!("frame_{i:03}.png"));
        assert_eq!(&row[2], "16");
        let error: f64 = row[5].parse().unwrap();
        assert!(error.is_finite() && error >= 0.0);
        // two decimals
        assert_eq!(row[5].split('.').nth(1).map(str::len), Some(2));
    }
    // the first frame is the reference for the relative position
    assert_eq!(&rows[0][3], "0");
    assert_eq!(&rows[0][4], "0");
    assert_eq!(&rows[0][6], "0.00");

    // one histogram line per update, one correlation per particle
    let histograms = std::fs::read_to_string(summary.output_directory.join(HISTOGRAM_FILE)).unwrap();
    let lines: Vec<&str> = histograms.lines().collect();
    assert_eq!(lines.len(), 4);
    for line in lines {
        let values: Vec<f64> = line.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(values.len(), 16);
    }
    // the headless preview never renders
    assert_eq!(std::fs::read_dir(&summary.output_directory).unwrap().count(), 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn skip_rate_thins_the_flight() {
    let map = textured_map();
    let dir = write_flight("mapmatch_it_skip", &map, 5);
    let mut reader = DatasetReader::open(&dir, 2).unwrap();
    let mut runtime = runtime(&map, HeadlessPreview::default());
    let summary = run_dataset(&mut runtime, &mut reader, &options()).unwrap();
    let (_, rows) = read_rows(&summary.output_directory.join(DATA_FILE));
    let images: Vec<&str> = rows.iter().map(|r| &r[1]).collect();
    assert_eq!(images, vec!["frame_000.png", "frame_002.png", "frame_004.png"]);
    assert!(!summary.output_directory.join(HISTOGRAM_FILE).exists());
    let _ = std::fs::remove_dir_all(&dir);
}

/// Stops the run once `limit` frames were shown.
struct StopAfter {
    limit: usize,
    shown: usize,
}

impl PreviewStrategy for StopAfter {
    fn render(&mut self, context: &PreviewContext) -> Result<bool> {
        assert_eq!(context.iteration, self.shown);
        assert_eq!(context.particles.len(), 16);
        self.shown += 1;
        Ok(self.shown <= self.limit)
    }
}

#[test]
fn preview_can_stop_the_run() {
    let map = textured_map();
    let dir = write_flight("mapmatch_it_stop", &map, 6);
    let mut reader = DatasetReader::open(&dir, 1).unwrap();
    let mut runtime = runtime(&map, StopAfter { limit: 2, shown: 0 });
    let summary = run_dataset(&mut runtime, &mut reader, &options()).unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.frames, 2);
    let (_, rows) = read_rows(&summary.output_directory.join(DATA_FILE));
    assert_eq!(rows.len(), 2);
    assert_eq!(runtime.preview_strategy().shown, 3);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn image_preview_writes_a_frame_per_iteration() {
    let map = textured_map();
    let dir = write_flight("mapmatch_it_images", &map, 3);
    let mut reader = DatasetReader::open(&dir, 1).unwrap();
    let mut runtime = runtime(&map, ImagePreview::new((160, 120), 10));
    let options = RunOptions {
        write_images: true,
        ..options()
    };
    let summary = run_dataset(&mut runtime, &mut reader, &options).unwrap();
    assert_eq!(runtime.preview_strategy().frames_written(), 3);
    for i in 0..3 {
        let path = summary.output_directory.join(format!("preview_{i:05}.png"));
        let preview = image::open(&path).unwrap();
        assert_eq!((preview.width(), preview.height()), (160, 120));
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn affine_matching_fails_on_the_first_update() {
    let map = textured_map();
    let dir = write_flight("mapmatch_it_affine", &map, 3);
    let mut reader = DatasetReader::open(&dir, 1).unwrap();
    let mut runtime = runtime(&map, HeadlessPreview::default());
    runtime.set_affine_matching(true);
    let err = run_dataset(&mut runtime, &mut reader, &options()).unwrap_err();
    assert!(err.to_string().contains("Affine particle matching"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_configuration_fails_before_any_row() {
    let map = textured_map();
    let dir = write_flight("mapmatch_it_invalid", &map, 2);
    let mut reader = DatasetReader::open(&dir, 1).unwrap();
    let mut runtime = runtime(&map, HeadlessPreview::default());
    let mut options = options();
    options.config.bin_size = 0;
    let err = run_dataset(&mut runtime, &mut reader, &options).unwrap_err();
    assert!(err.to_string().contains("bin_size"));
    let _ = std::fs::remove_dir_all(&dir);
}
