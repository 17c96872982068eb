//! The particle set
//!
//! [`Particles`] owns the particles, the shared [`ParticleConfig`] snapshot, the shared
//! [`ScaleTable`] and the random number generator. It implements the filter steps:
//!
//! 1. [`Particles::init`] spreads distinct particles around a start location.
//! 2. [`Particles::propagate`] moves every particle by a randomly scaled copy of the odometry
//!    movement.
//! 3. [`Particles::evaluate`] (or [`Particles::score_all`]) scores every particle's candidates
//!    against the current image and template. Particles are scored in parallel with `rayon`; the
//!    global best is found with an order-independent min-reduction.
//! 4. [`Particles::normalize`] turns probabilities into weights and cumulative sampling factors.
//! 5. [`Particles::resample`] draws a new set with [`Particles::sample`].
//!
//! The random number generator is only touched on the calling thread, so seeded runs are fully
//! reproducible.
use std::collections::HashSet;
use std::f64::consts::TAU;
use std::ops::Index;
use std::sync::Arc;

use image::GrayImage;
use log::debug;
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::matching::{AffineMatcher, template_corners};
use crate::particle::{Particle, ParticleConfig, ScaleTable};
use crate::{AffineMatrix, Corners, PixelPoint};

/// Default number of scale steps.
pub const DEFAULT_SCALE_STEPS: usize = 5;
/// Default scale factor used until the first scale update.
pub const DEFAULT_SCALE: f64 = 1.0;
/// Default `alpha` of [`Particles::propagate`].
pub const DEFAULT_PROPAGATION_ALPHA: f64 = 2.0;

/// Per-particle distances of one scoring pass and the global best.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScoreSummary {
    /// Best distance of each particle, `None` for particles without in-bounds candidates.
    pub distances: Vec<Option<f64>>,
    /// `(particle index, distance)` of the global minimum.
    pub best: Option<(usize, f64)>,
}

pub struct Particles {
    particles: Vec<Particle>,
    config: Arc<ParticleConfig>,
    scale_table: Arc<ScaleTable>,
    rng: StdRng,
    next_id: usize,
}

impl Default for Particles {
    fn default() -> Self {
        Particles::from_rng(StdRng::from_os_rng())
    }
}

impl Particles {
    pub fn new() -> Self {
        Particles::default()
    }
    /// Particle set with a reproducible random number generator.
    pub fn with_seed(seed: u64) -> Self {
        Particles::from_rng(StdRng::seed_from_u64(seed))
    }
    fn from_rng(rng: StdRng) -> Self {
        Particles {
            particles: Vec::new(),
            config: Arc::new(ParticleConfig::default()),
            scale_table: Arc::new(ScaleTable::linear(DEFAULT_SCALE, DEFAULT_SCALE, 1)),
            rng,
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Particle> {
        self.particles.iter_mut()
    }
    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }
    pub fn config(&self) -> &Arc<ParticleConfig> {
        &self.config
    }
    pub fn scale_table(&self) -> &Arc<ScaleTable> {
        &self.scale_table
    }

    /// Appends a particle bound to the current configuration and scale table.
    pub fn add_particle(&mut self, mut particle: Particle) {
        particle.id = self.next_id();
        particle.set_config(self.config.clone());
        particle.set_scale_table(&self.scale_table);
        self.particles.push(particle);
    }

    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn replace_config(&mut self, config: ParticleConfig) {
        self.config = Arc::new(config);
        for particle in &mut self.particles {
            particle.set_config(self.config.clone());
        }
    }

    /// Replaces the configuration snapshot with one holding the new heading.
    pub fn set_direction(&mut self, direction: f64) {
        let config = self.config.with_direction(direction);
        self.replace_config(config);
    }

    /// Replaces the configuration snapshot with one centred on a map of the given size.
    pub fn set_map_dimensions(&mut self, width: u32, height: u32) {
        let config = self.config.with_map_dimensions(width, height);
        self.replace_config(config);
    }

    /// Rebuilds the shared scale table and rebinds every particle to it.
    pub fn set_scale(&mut self, min: f64, max: f64, steps: usize) {
        self.scale_table = Arc::new(ScaleTable::linear(min, max, steps));
        for particle in &mut self.particles {
            particle.set_scale_table(&self.scale_table);
        }
    }

    fn draw_radius(&mut self, radius: f64, use_gaussian: bool) -> f64 {
        let u = if use_gaussian {
            let a: f64 = self.rng.sample(StandardNormal);
            let b: f64 = self.rng.sample(StandardNormal);
            (a + b) * radius
        } else {
            (self.rng.random::<f64>() + self.rng.random::<f64>()) * radius
        };
        if u > radius { 2.0 * radius - u } else { u }
    }

    /// Replaces the set with `count` particles at distinct pixels around `start`.
    ///
    /// Angles are uniform in `[0, 2π)`. Radii are the sum of two Gaussian (or two uniform) draws
    /// scaled by `radius` and folded back below `radius`. Draws that land on an occupied pixel
    /// are repeated, so this only terminates if `count` distinct pixels are reachable within
    /// `radius` of `start`. Every particle starts with probability 0.5.
    pub fn init(
        &mut self,
        start: PixelPoint,
        map_size: (u32, u32),
        radius: f64,
        count: usize,
        use_gaussian: bool,
    ) {
        self.config = Arc::new(self.config.with_map_dimensions(map_size.0, map_size.1));
        self.particles.clear();
        self.particles.reserve(count);
        let mut occupied = HashSet::with_capacity(count);
        while self.particles.len() < count {
            let angle = self.rng.random_range(0.0..TAU);
            let r = self.draw_radius(radius, use_gaussian);
            let x = (start.x as f64 + r * angle.cos()) as i32;
            let y = (start.y as f64 + r * angle.sin()) as i32;
            if !occupied.insert((x, y)) {
                continue;
            }
            let id = self.next_id();
            let mut particle = Particle::new(id, x, y, self.config.clone(), &self.scale_table);
            particle.set_probability(0.5);
            self.particles.push(particle);
        }
        debug!("initialized {} particles around {}", count, start);
        self.normalize();
    }

    /// Moves every particle by `movement · alpha · U(−1, 1)` (independent factor per axis) plus
    /// the particle's own propagation noise.
    pub fn propagate(&mut self, movement: &Vector2<f64>, alpha: f64) {
        for particle in &mut self.particles {
            let perturbed = Vector2::new(
                movement.x * alpha * self.rng.random_range(-1.0..=1.0),
                movement.y * alpha * self.rng.random_range(-1.0..=1.0),
            );
            particle.propagate(&perturbed, &mut self.rng);
        }
    }

    /// Draws `count` template sample coordinates, `x ∈ [1, width − 1]` and `y ∈ [1, height − 1]`.
    pub fn sample_points(&mut self, template_dims: (u32, u32), count: usize) -> (Vec<i32>, Vec<i32>) {
        let max_x = (template_dims.0 as i32 - 1).max(1);
        let max_y = (template_dims.1 as i32 - 1).max(1);
        let xs = (0..count).map(|_| self.rng.random_range(1..=max_x)).collect();
        let ys = (0..count).map(|_| self.rng.random_range(1..=max_y)).collect();
        (xs, ys)
    }

    fn best_of(distances: &[Option<f64>]) -> Option<(usize, f64)> {
        distances
            .par_iter()
            .enumerate()
            .filter_map(|(i, d)| d.map(|d| (i, d)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    /// Scores every particle in parallel without touching the smoothing windows.
    pub fn score_all(
        &mut self,
        image: &GrayImage,
        template: &GrayImage,
        xs: &[i32],
        ys: &[i32],
        matcher: &dyn AffineMatcher,
    ) -> ScoreSummary {
        let distances: Vec<Option<f64>> = self
            .particles
            .par_iter_mut()
            .map(|particle| particle.score(image, template, xs, ys, matcher))
            .collect();
        let best = Self::best_of(&distances);
        ScoreSummary { distances, best }
    }

    /// Evaluates every particle against shared random sample points and returns the map corners
    /// of the best transform found, or `None` when no particle had an in-bounds candidate.
    pub fn evaluate(
        &mut self,
        image: &GrayImage,
        template: &GrayImage,
        sample_count: usize,
        matcher: &dyn AffineMatcher,
    ) -> Option<Corners> {
        let (xs, ys) = self.sample_points(template.dimensions(), sample_count);
        let distances: Vec<Option<f64>> = self
            .particles
            .par_iter_mut()
            .map(|particle| particle.evaluate(image, template, &xs, &ys, matcher))
            .collect();
        let (best, distance) = Self::best_of(&distances)?;
        debug!("best distance {:.4} from particle {}", distance, self.particles[best].id);
        self.best_transform(best)
            .map(|transform| template_corners(template.dimensions(), &transform))
    }

    /// Best transform of the particle at `index`.
    pub fn best_transform(&self, index: usize) -> Option<AffineMatrix> {
        self.particles.get(index).and_then(|p| p.best_transform().copied())
    }

    /// Weights proportional to probability and sampling factors `1 − Σ_{j≤i} weight_j`.
    ///
    /// When the probabilities do not sum to a positive finite number every particle gets the
    /// same weight.
    pub fn normalize(&mut self) {
        if self.particles.is_empty() {
            return;
        }
        let sum: f64 = self.particles.iter().map(|p| p.probability()).sum();
        let uniform = 1.0 / self.particles.len() as f64;
        let proportional = sum > 0.0 && sum.is_finite();
        let mut running = 0.0;
        for particle in &mut self.particles {
            let weight = if proportional {
                particle.probability() / sum
            } else {
                uniform
            };
            running += weight;
            particle.set_weight(weight);
            particle.set_sampling_factor(1.0 - running);
        }
    }

    /// Draws one particle with a single uniform threshold `t`.
    ///
    /// For `t < 0.5` the first particle (front to back) with `sampling_factor > t` is taken,
    /// otherwise the first particle (back to front) with `sampling_factor < t`. The last particle
    /// is the fallback.
    pub fn sample(&mut self) -> Option<Particle> {
        let t: f64 = self.rng.random();
        let found = if t < 0.5 {
            self.particles.iter().find(|p| p.sampling_factor() > t)
        } else {
            self.particles.iter().rev().find(|p| p.sampling_factor() < t)
        };
        found.or(self.particles.last()).cloned()
    }

    /// Sorts by descending sampling factor.
    pub fn sort_ascending(&mut self) {
        self.particles
            .sort_by(|a, b| b.sampling_factor().total_cmp(&a.sampling_factor()));
    }

    /// Replaces the set with as many particles drawn by [`Particles::sample`], each with a fresh
    /// id, and renormalizes.
    pub fn resample(&mut self) {
        if self.particles.is_empty() {
            return;
        }
        self.sort_ascending();
        let count = self.particles.len();
        let mut resampled = Vec::with_capacity(count);
        while resampled.len() < count {
            let Some(mut particle) = self.sample() else {
                break;
            };
            particle.id = self.next_id();
            resampled.push(particle);
        }
        self.particles = resampled;
        self.normalize();
    }

    /// Weighted centroid `Σ position · weight`, truncated to whole pixels.
    pub fn weighted_sum(&self) -> PixelPoint {
        let (x, y) = self.particles.iter().fold((0.0, 0.0), |(x, y), p| {
            (x + p.x as f64 * p.weight(), y + p.y as f64 * p.weight())
        });
        PixelPoint::new(x as i32, y as i32)
    }

    /// Number of distinct spatial bins occupied by the particles.
    pub fn occupied_bins(&self, bin_size: i32) -> usize {
        self.particles
            .iter()
            .map(|p| p.serialize(bin_size))
            .collect::<HashSet<_>>()
            .len()
    }
}

impl Index<usize> for Particles {
    type Output = Particle;
    fn index(&self, index: usize) -> &Particle {
        &self.particles[index]
    }
}

impl<'a> IntoIterator for &'a Particles {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;
    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}
