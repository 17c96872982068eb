//! Pose hypotheses for map matching
//!
//! A [`Particle`] is one position hypothesis in map pixels. It does not carry its own heading or
//! scale; instead it expands a combinatorial set of candidate configurations around its position
//! from two shared snapshots owned by the particle set:
//!
//! - [`ParticleConfig`]: the current heading estimate, the map centre and the fixed table of
//!   coarse rotation offsets. It is immutable once shared and is replaced wholesale (with a new
//!   `version`) whenever the heading or map changes, so parallel evaluation never observes a
//!   half-updated configuration.
//! - [`ScaleTable`]: the linearly spaced scales to test. Particles hold a [`Weak`] reference only;
//!   the particle set owns the table and rebinds every particle when it is rebuilt.
//!
//! Each particle smooths its raw match score over a short window before it is used as an
//! (unnormalized) probability.
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::sync::{Arc, Weak};

use image::{GrayImage, Luma};
use nalgebra::{Point2, Vector2};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::matching::{AffineMatcher, MatchConfig, configs_to_affine};
use crate::{AffineMatrix, PixelPoint, rotation_matrix_2d, transform_point};

/// Default spacing (radians) of the rotation hypotheses.
pub const ROTATION_STEP: f64 = 0.05;
/// Number of raw scores averaged by [`Particle::set_probability`].
pub const PROBABILITY_WINDOW: usize = 5;
/// Correlation value of a particle that has never been scored.
pub const CORRELATION_SENTINEL: f64 = -1.0;
/// Noise amplitude applied when odometry reports no movement at all.
pub const NOISE_ALPHA: f64 = 4.0;
/// Nominal displacement (pixels) assumed when odometry reports no movement.
pub const MIN_MOVEMENT: f64 = 10.0;
/// Movement components below this magnitude (pixels) are noised as if they had this magnitude.
pub const MIN_NOISE_LEVEL: f64 = 5.0;
/// Angle (degrees) between the map's up direction and the camera's heading reference.
pub const MAP_HEADING_OFFSET: f64 = 75.0;

/// Shared, versioned configuration read by every particle.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleConfig {
    pub version: u64,
    /// Current best heading estimate in radians.
    pub direction: f64,
    pub map_center: PixelPoint,
    pub rotation_step: f64,
    /// Thirteen coarse rotation deltas, `±{0.5, 1, …, 3}·rotation_step` around an exact zero.
    pub rotation_offsets: Vec<f64>,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        ParticleConfig::new(ROTATION_STEP)
    }
}

impl ParticleConfig {
    pub fn new(rotation_step: f64) -> Self {
        ParticleConfig {
            version: 0,
            direction: 0.0,
            map_center: PixelPoint::origin(),
            rotation_step,
            rotation_offsets: (-6..=6).map(|i| i as f64 * 0.5 * rotation_step).collect(),
        }
    }
    /// Copy with a new heading and the next version.
    pub fn with_direction(&self, direction: f64) -> Self {
        ParticleConfig {
            version: self.version + 1,
            direction,
            ..self.clone()
        }
    }
    /// Copy centred on a map of the given size and the next version.
    pub fn with_map_dimensions(&self, width: u32, height: u32) -> Self {
        ParticleConfig {
            version: self.version + 1,
            map_center: PixelPoint::new(width as i32 / 2, height as i32 / 2),
            ..self.clone()
        }
    }
    /// Coarse rotations tested around the current heading.
    pub fn coarse_rotations(&self) -> impl Iterator<Item = f64> + '_ {
        self.rotation_offsets.iter().map(|offset| self.direction + offset)
    }
    pub fn fine_rotations(&self) -> [f64; 3] {
        [-3.0 * self.rotation_step, 0.0, 3.0 * self.rotation_step]
    }
}

/// Linearly spaced scale factors shared by every particle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScaleTable {
    scales: Vec<f64>,
}

impl ScaleTable {
    /// `steps` values starting at `min`, spaced by `|max − min| / (steps − 1)`.
    ///
    /// A single step yields `[min]`; zero steps yield an empty table.
    pub fn linear(min: f64, max: f64, steps: usize) -> Self {
        let scales = match steps {
            0 => Vec::new(),
            1 => vec![min],
            _ => {
                let delta = (max - min).abs() / (steps - 1) as f64;
                (0..steps).map(|i| min + i as f64 * delta).collect()
            }
        };
        ScaleTable { scales }
    }
    pub fn scales(&self) -> &[f64] {
        &self.scales
    }
    pub fn len(&self) -> usize {
        self.scales.len()
    }
    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }
    /// Middle entry, used as the nominal scale.
    pub fn middle(&self) -> Option<f64> {
        self.scales.get(self.scales.len() / 2).copied()
    }
}

#[derive(Clone, Debug)]
pub struct Particle {
    pub id: usize,
    pub x: i32,
    pub y: i32,
    config: Arc<ParticleConfig>,
    scale_table: Weak<ScaleTable>,
    probability: f64,
    accumulated_probability: f64,
    recent_probabilities: VecDeque<f64>,
    weight: f64,
    sampling_factor: f64,
    correlation: f64,
    best_transform: Option<AffineMatrix>,
    candidates: Vec<MatchConfig>,
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("probability", &self.probability)
            .field("weight", &self.weight)
            .field("sampling_factor", &self.sampling_factor)
            .field("correlation", &self.correlation)
            .field("config_version", &self.config.version)
            .finish()
    }
}

impl PartialEq for Particle {
    fn eq(&self, other: &Self) -> bool {
        self.sampling_factor == other.sampling_factor
    }
}

impl PartialOrd for Particle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.sampling_factor.partial_cmp(&other.sampling_factor)
    }
}

impl Particle {
    pub fn new(
        id: usize,
        x: i32,
        y: i32,
        config: Arc<ParticleConfig>,
        scale_table: &Arc<ScaleTable>,
    ) -> Particle {
        let mut particle = Particle {
            id,
            x,
            y,
            config,
            scale_table: Arc::downgrade(scale_table),
            probability: 1.0,
            accumulated_probability: 0.0,
            recent_probabilities: VecDeque::with_capacity(PROBABILITY_WINDOW + 1),
            weight: 0.0,
            sampling_factor: 0.0,
            correlation: CORRELATION_SENTINEL,
            best_transform: None,
            candidates: Vec::new(),
        };
        particle.update_candidates();
        particle
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
    pub fn weight(&self) -> f64 {
        self.weight
    }
    pub fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }
    pub fn sampling_factor(&self) -> f64 {
        self.sampling_factor
    }
    pub fn set_sampling_factor(&mut self, sampling_factor: f64) {
        self.sampling_factor = sampling_factor;
    }
    /// Best distance of the last successful scoring, or [`CORRELATION_SENTINEL`].
    pub fn correlation(&self) -> f64 {
        self.correlation
    }
    pub fn best_transform(&self) -> Option<&AffineMatrix> {
        self.best_transform.as_ref()
    }
    pub fn candidates(&self) -> &[MatchConfig] {
        &self.candidates
    }
    pub fn config(&self) -> &Arc<ParticleConfig> {
        &self.config
    }
    pub fn direction(&self) -> f64 {
        self.config.direction
    }
    pub fn to_point(&self) -> PixelPoint {
        PixelPoint::new(self.x, self.y)
    }
    pub fn location_in_map_coords(&self) -> Point2<f64> {
        Point2::new(self.x as f64, self.y as f64)
    }
    /// Nominal scale: the middle entry of the current scale table, 1 when the table is gone.
    pub fn scale(&self) -> f64 {
        self.scale_table
            .upgrade()
            .and_then(|table| table.middle())
            .unwrap_or(1.0)
    }

    /// Binds a new configuration snapshot and regenerates the candidates.
    pub fn set_config(&mut self, config: Arc<ParticleConfig>) {
        self.config = config;
        self.update_candidates();
    }

    /// Binds a new scale table and regenerates the candidates.
    pub fn set_scale_table(&mut self, scale_table: &Arc<ScaleTable>) {
        self.scale_table = Arc::downgrade(scale_table);
        self.update_candidates();
    }

    /// Rebuilds the candidate list: scale × scale × coarse rotation × fine rotation, all
    /// translated to this particle's offset from the map centre.
    pub fn update_candidates(&mut self) {
        self.candidates.clear();
        let Some(table) = self.scale_table.upgrade() else {
            return;
        };
        let tx = (self.x - self.config.map_center.x) as f64;
        let ty = (self.y - self.config.map_center.y) as f64;
        let fine = self.config.fine_rotations();
        self.candidates.reserve(table.len() * table.len() * self.config.rotation_offsets.len() * fine.len());
        for &scale_x in table.scales() {
            for &scale_y in table.scales() {
                for coarse in self.config.coarse_rotations() {
                    for &fine_rotation in &fine {
                        self.candidates
                            .push(MatchConfig::new(tx, ty, fine_rotation, scale_x, scale_y, coarse));
                    }
                }
            }
        }
    }

    /// Moves the particle by `movement` plus noise and regenerates the candidates.
    ///
    /// Without any movement the particle diffuses by `N(0, 1)·MIN_MOVEMENT·NOISE_ALPHA` per axis.
    /// Otherwise each axis receives `N(0, NOISE_ALPHA)` noise scaled by that axis' movement,
    /// with [`MIN_NOISE_LEVEL`] as the scale for small components. Positions are truncated to
    /// whole pixels.
    pub fn propagate<R: Rng + ?Sized>(&mut self, movement: &Vector2<f64>, rng: &mut R) {
        let step = if movement.x == 0.0 && movement.y == 0.0 {
            Vector2::new(
                rng.sample::<f64, _>(StandardNormal) * MIN_MOVEMENT * NOISE_ALPHA,
                rng.sample::<f64, _>(StandardNormal) * MIN_MOVEMENT * NOISE_ALPHA,
            )
        } else {
            movement.map(|axis| {
                let level = if axis.abs() < MIN_NOISE_LEVEL {
                    MIN_NOISE_LEVEL
                } else {
                    axis.abs()
                };
                axis + rng.sample::<f64, _>(StandardNormal) * NOISE_ALPHA * level
            })
        };
        self.x = (self.x as f64 + step.x) as i32;
        self.y = (self.y as f64 + step.y) as i32;
        self.update_candidates();
    }

    /// Scores the candidates without touching the smoothing window.
    ///
    /// Candidates whose template corners leave the image are dropped from the list for good
    /// (until the next regeneration). The best transform and its distance are recorded.
    ///
    /// # Returns
    /// The best distance, or `None` when no candidate is in bounds.
    pub fn score(
        &mut self,
        image: &GrayImage,
        template: &GrayImage,
        xs: &[i32],
        ys: &[i32],
        matcher: &dyn AffineMatcher,
    ) -> Option<f64> {
        let (affines, insiders) =
            configs_to_affine(&self.candidates, image.dimensions(), template.dimensions());
        self.candidates = self
            .candidates
            .iter()
            .zip(&insiders)
            .filter(|(_, inside)| **inside)
            .map(|(candidate, _)| *candidate)
            .collect();
        if affines.is_empty() {
            return None;
        }
        let distances = matcher.evaluate_candidates(image, template, &affines, xs, ys, true);
        // a matcher returning the wrong number of distances only scores the paired prefix
        let (best, distance) = affines
            .iter()
            .zip(distances)
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        self.best_transform = Some(*best);
        self.correlation = distance;
        Some(distance)
    }

    /// [`Particle::score`] followed by [`Particle::set_probability`] with the best distance.
    ///
    /// A particle without in-bounds candidates keeps its previous probability.
    pub fn evaluate(
        &mut self,
        image: &GrayImage,
        template: &GrayImage,
        xs: &[i32],
        ys: &[i32],
        matcher: &dyn AffineMatcher,
    ) -> Option<f64> {
        let distance = self.score(image, template, xs, ys, matcher)?;
        self.set_probability(distance);
        Some(distance)
    }

    /// Pushes a raw score into the smoothing window.
    ///
    /// While fewer than [`PROBABILITY_WINDOW`] scores were seen the probability is their running
    /// mean; afterwards the oldest score is evicted and the probability is the mean of the last
    /// [`PROBABILITY_WINDOW`] scores.
    pub fn set_probability(&mut self, raw: f64) {
        self.accumulated_probability += raw;
        self.recent_probabilities.push_back(raw);
        if self.recent_probabilities.len() > PROBABILITY_WINDOW {
            if let Some(oldest) = self.recent_probabilities.pop_front() {
                self.accumulated_probability -= oldest;
            }
        }
        self.probability = self.accumulated_probability / self.recent_probabilities.len() as f64;
    }

    /// Spatial bucket key `"{x / bin}x{y / bin}"` with truncating integer division.
    pub fn serialize(&self, bin_size: i32) -> String {
        format!("{}x{}", self.x / bin_size, self.y / bin_size)
    }

    /// Map-to-view transform: rotation about the particle by `heading − 75°` with the particle's
    /// nominal scale.
    pub fn map_transformation(&self) -> AffineMatrix {
        rotation_matrix_2d(
            &self.location_in_map_coords(),
            self.direction().to_degrees() - MAP_HEADING_OFFSET,
            self.scale(),
        )
    }

    /// The map patch of `size` pixels seen by this particle, white outside the map.
    pub fn map_image(&self, map: &GrayImage, size: (u32, u32)) -> GrayImage {
        let transform = self.map_transformation();
        let (map_width, map_height) = map.dimensions();
        let (width, height) = size;
        let offset_x = self.x - width as i32 / 2;
        let offset_y = self.y - height as i32 / 2;
        GrayImage::from_fn(width, height, |u, v| {
            let source = Point2::new((offset_x + u as i32) as f64, (offset_y + v as i32) as f64);
            let mapped = transform_point(&transform, &source);
            let (mx, my) = (mapped.x as i64, mapped.y as i64);
            if mx >= 0 && my >= 0 && mx < map_width as i64 && my < map_height as i64 {
                *map.get_pixel(mx as u32, my as u32)
            } else {
                Luma([255])
            }
        })
    }
}
