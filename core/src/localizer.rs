//! Per-frame localization engine
//!
//! [`ParticleFastMatch`] couples the particle set with an [`AffineMatcher`], the reference map
//! and the current camera template. One call to [`ParticleFastMatch::filter_particles`] runs a
//! full filter cycle:
//!
//! ```text
//! propagate -> score (parallel) -> distance to probability -> smooth -> normalize -> resample
//! ```
//!
//! Match distances are turned into probabilities through a [`ConversionMode`] and a correlation
//! low bound. After resampling, the spread of the particles is summarized by the number of
//! occupied spatial bins and the KLD-sampling particle bound of Fox (2003); both are reported
//! for diagnostics while the particle count itself stays constant.
use std::fmt::{self, Display};
use std::sync::Arc;

use anyhow::{Result, bail};
use image::GrayImage;
use log::{debug, info};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::config::ParticleFilterConfig;
use crate::filter::{DEFAULT_PROPAGATION_ALPHA, Particles};
use crate::matching::{AffineMatcher, template_corners};
use crate::{AffineMatrix, Corners, PixelPoint};

/// Default correlation low bound.
pub const DEFAULT_LOW_BOUND: f64 = 0.2;
/// Steepness of the generalized logistic conversion.
pub const GLF_GROWTH: f64 = 10.0;
/// Slope applied below the low bound by the hinged conversion.
pub const HPRELU_SLOPE: f64 = 0.1;
/// Temperature of the softmax conversion.
pub const SOFTMAX_TEMPERATURE: f64 = 0.05;
/// Smallest probability handed out by the hinged conversion.
pub const MIN_PROBABILITY: f64 = 1e-6;

/// How a particle's best match distance becomes a probability.
///
/// All modes work on the similarity `s = 1 − distance` clamped to `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    /// Logistic curve centred on the low bound.
    #[default]
    Glf,
    /// Softmax over all scored particles of the frame.
    Softmax,
    /// Identity above the low bound, a shallow slope below it.
    Hprelu,
}

impl Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversionMode::Glf => "glf",
            ConversionMode::Softmax => "softmax",
            ConversionMode::Hprelu => "hprelu",
        };
        f.write_str(name)
    }
}

fn similarity(distance: f64) -> f64 {
    (1.0 - distance).clamp(0.0, 1.0)
}

impl ConversionMode {
    /// Converts per-particle distances; unscored particles stay `None`.
    pub fn convert(&self, distances: &[Option<f64>], low_bound: f64) -> Vec<Option<f64>> {
        match self {
            ConversionMode::Glf => distances
                .iter()
                .map(|d| {
                    d.map(|d| 1.0 / (1.0 + (-GLF_GROWTH * (similarity(d) - low_bound)).exp()))
                })
                .collect(),
            ConversionMode::Hprelu => distances
                .iter()
                .map(|d| {
                    d.map(|d| {
                        let s = similarity(d);
                        let p = if s >= low_bound { s } else { HPRELU_SLOPE * s };
                        p.max(MIN_PROBABILITY)
                    })
                })
                .collect(),
            ConversionMode::Softmax => {
                let max = distances
                    .iter()
                    .flatten()
                    .map(|d| similarity(*d))
                    .fold(f64::NEG_INFINITY, f64::max);
                let exps: Vec<Option<f64>> = distances
                    .iter()
                    .map(|d| d.map(|d| ((similarity(d) - max) / SOFTMAX_TEMPERATURE).exp()))
                    .collect();
                let total: f64 = exps.iter().flatten().sum();
                exps.into_iter().map(|e| e.map(|e| e / total)).collect()
            }
        }
    }
}

/// Inverse of the standard normal CDF (Acklam's rational approximation, relative error below
/// 1.2e-9).
pub fn standard_normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// Largest quantile used by the KLD bound; a quantile of exactly 1 has an infinite z-score.
const MAX_KLD_QUANTILE: f64 = 1.0 - 1e-9;

/// KLD-sampling bound: particles needed so that, with probability `quantile`, the KL divergence
/// between the sample-based and the true posterior stays below `kld_error`, given `bins`
/// occupied bins.
pub fn kld_particle_bound(bins: usize, kld_error: f64, quantile: f64) -> usize {
    if bins <= 1 {
        return 1;
    }
    let k = (bins - 1) as f64;
    let z = standard_normal_quantile(quantile.min(MAX_KLD_QUANTILE));
    let a = 2.0 / (9.0 * k);
    let n = k / (2.0 * kld_error) * (1.0 - a + a.sqrt() * z).powi(3);
    n.ceil().max(1.0) as usize
}

/// Spread of the particle set after resampling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KldDiagnostics {
    pub occupied_bins: usize,
    pub particle_bound: usize,
}

/// Outcome of one filter cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameEstimate {
    /// Map corners of the best match, `None` when no particle could be scored.
    pub corners: Option<Corners>,
    pub best_transform: Option<AffineMatrix>,
    pub best_distance: Option<f64>,
    /// Number of particles with at least one in-bounds candidate.
    pub scored_particles: usize,
    pub kld: KldDiagnostics,
}

pub struct ParticleFastMatch {
    particles: Particles,
    matcher: Arc<dyn AffineMatcher>,
    config: ParticleFilterConfig,
    image: GrayImage,
    template: GrayImage,
    pub conversion_mode: ConversionMode,
    low_bound: f64,
}

impl ParticleFastMatch {
    /// Validates `config` and spreads the particles around `start` on `map`.
    pub fn new(
        start: PixelPoint,
        map: GrayImage,
        config: ParticleFilterConfig,
        matcher: Arc<dyn AffineMatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let mut particles = match config.seed {
            Some(seed) => Particles::with_seed(seed),
            None => Particles::new(),
        };
        particles.init(
            start,
            map.dimensions(),
            config.radius,
            config.particle_count,
            config.use_gaussian_sampling,
        );
        Ok(ParticleFastMatch {
            particles,
            matcher,
            config,
            image: map,
            template: GrayImage::new(0, 0),
            conversion_mode: ConversionMode::default(),
            low_bound: DEFAULT_LOW_BOUND,
        })
    }

    pub fn particles(&self) -> &Particles {
        &self.particles
    }
    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }
    pub fn low_bound(&self) -> f64 {
        self.low_bound
    }
    pub fn set_low_bound(&mut self, low_bound: f64) {
        self.low_bound = low_bound;
    }
    pub fn set_direction(&mut self, direction: f64) {
        self.particles.set_direction(direction);
    }
    pub fn set_scale(&mut self, min: f64, max: f64, steps: usize) {
        self.particles.set_scale(min, max, steps);
    }
    pub fn set_template(&mut self, template: GrayImage) {
        self.template = template;
    }
    pub fn template(&self) -> &GrayImage {
        &self.template
    }
    /// Replaces the map; the particles are re-centred on the new map dimensions.
    pub fn set_image(&mut self, image: GrayImage) {
        let (width, height) = image.dimensions();
        self.image = image;
        self.particles.set_map_dimensions(width, height);
    }
    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Runs one filter cycle with the given odometry movement.
    pub fn filter_particles(&mut self, movement: &Vector2<f64>) -> Result<FrameEstimate> {
        if self.template.width() == 0 || self.template.height() == 0 {
            bail!("no template set before filtering");
        }
        if self.image.width() == 0 || self.image.height() == 0 {
            bail!("no map image set before filtering");
        }
        self.particles.propagate(movement, DEFAULT_PROPAGATION_ALPHA);
        let (xs, ys) = self
            .particles
            .sample_points(self.template.dimensions(), self.config.sample_count());
        let summary = self.particles.score_all(
            &self.image,
            &self.template,
            &xs,
            &ys,
            self.matcher.as_ref(),
        );
        let best_transform = summary
            .best
            .and_then(|(index, _)| self.particles.best_transform(index));
        let corners = best_transform.map(|t| template_corners(self.template.dimensions(), &t));

        let probabilities = self.conversion_mode.convert(&summary.distances, self.low_bound);
        for (particle, probability) in self.particles.iter_mut().zip(&probabilities) {
            if let Some(probability) = probability {
                particle.set_probability(*probability);
            }
        }
        self.particles.normalize();
        self.particles.resample();

        let kld = self.kld_diagnostics();
        let scored_particles = summary.distances.iter().flatten().count();
        debug!(
            "scored {}/{} particles, best distance {:?}, {} bins, KLD bound {}",
            scored_particles,
            self.particles.len(),
            summary.best.map(|(_, d)| d),
            kld.occupied_bins,
            kld.particle_bound
        );
        Ok(FrameEstimate {
            corners,
            best_transform,
            best_distance: summary.best.map(|(_, d)| d),
            scored_particles,
            kld,
        })
    }

    pub fn kld_diagnostics(&self) -> KldDiagnostics {
        let occupied_bins = self.particles.occupied_bins(self.config.bin_size);
        KldDiagnostics {
            occupied_bins,
            particle_bound: kld_particle_bound(
                occupied_bins,
                self.config.kld_error,
                self.config.quantile,
            ),
        }
    }

    /// Weighted centroid of the particles.
    pub fn predicted_location(&self) -> PixelPoint {
        self.particles.weighted_sum()
    }

    /// Map patch seen by the highest-weight particle, sized like the template.
    pub fn best_particle_view(&self, map: &GrayImage) -> Option<GrayImage> {
        self.particles
            .iter()
            .max_by(|a, b| a.weight().total_cmp(&b.weight()))
            .map(|particle| particle.map_image(map, self.template.dimensions()))
    }

    /// Logs and returns a one-line summary of the conversion settings.
    pub fn describe(&self) -> String {
        let description = format!(
            "Using conversion mode: {}, conversion bound: {}",
            self.conversion_mode, self.low_bound
        );
        info!("{}", description);
        description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::SampledDistanceMatcher;
    use assert_approx_eq::assert_approx_eq;
    use image::Luma;

    fn textured_map(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 7 + y * 13 + (x * y) % 29) % 256) as u8])
        })
    }

    #[test]
    fn quantiles_of_the_standard_normal() {
        assert_approx_eq!(standard_normal_quantile(0.5), 0.0, 1e-12);
        assert_approx_eq!(standard_normal_quantile(0.975), 1.959964, 1e-6);
        assert_approx_eq!(standard_normal_quantile(0.99), 2.326348, 1e-6);
        assert_approx_eq!(standard_normal_quantile(0.01), -2.326348, 1e-6);
        assert_approx_eq!(standard_normal_quantile(0.1), -1.281552, 1e-6);
        assert!(standard_normal_quantile(1.0).is_infinite());
    }

    #[test]
    fn kld_bound_grows_with_bins() {
        assert_eq!(kld_particle_bound(0, 0.5, 0.99), 1);
        assert_eq!(kld_particle_bound(1, 0.5, 0.99), 1);
        assert_eq!(kld_particle_bound(2, 0.5, 0.99), 7);
        let small = kld_particle_bound(10, 0.5, 0.99);
        let large = kld_particle_bound(100, 0.5, 0.99);
        assert!(large > small);
        assert!(kld_particle_bound(10, 0.05, 0.99) > small);
        assert!(kld_particle_bound(10, 0.5, 1.0) < usize::MAX);
    }

    #[test]
    fn glf_is_centred_on_the_low_bound() {
        let converted = ConversionMode::Glf.convert(&[Some(0.8), Some(0.1), None, Some(0.9)], 0.2);
        assert_approx_eq!(converted[0].unwrap(), 0.5, 1e-12);
        assert!(converted[1].unwrap() > converted[0].unwrap());
        assert!(converted[3].unwrap() < converted[0].unwrap());
        assert!(converted[2].is_none());
    }

    #[test]
    fn hprelu_hinges_at_the_low_bound() {
        let converted = ConversionMode::Hprelu.convert(&[Some(0.25), Some(0.9), Some(1.0)], 0.2);
        assert_approx_eq!(converted[0].unwrap(), 0.75, 1e-12);
        assert_approx_eq!(converted[1].unwrap(), HPRELU_SLOPE * 0.1, 1e-12);
        assert_eq!(converted[2].unwrap(), MIN_PROBABILITY);
    }

    #[test]
    fn softmax_sums_to_one_over_scored_particles() {
        let converted = ConversionMode::Softmax.convert(&[Some(0.3), None, Some(0.5), Some(0.9)], 0.2);
        let total: f64 = converted.iter().flatten().sum();
        assert_approx_eq!(total, 1.0, 1e-12);
        assert!(converted[1].is_none());
        assert!(converted[0].unwrap() > converted[2].unwrap());
        assert!(converted[2].unwrap() > converted[3].unwrap());
    }

    #[test]
    fn conversion_mode_names() {
        assert_eq!(ConversionMode::default(), ConversionMode::Glf);
        assert_eq!(ConversionMode::Softmax.to_string(), "softmax");
        assert_eq!(serde_json::to_string(&ConversionMode::Hprelu).unwrap(), "\"hprelu\"");
    }

    #[test]
    fn invalid_config_fails_before_any_particle_exists() {
        let config = ParticleFilterConfig {
            epsilon: 1.5,
            ..ParticleFilterConfig::default()
        };
        let result = ParticleFastMatch::new(
            PixelPoint::new(10, 10),
            textured_map(20, 20),
            config,
            Arc::new(SampledDistanceMatcher::default()),
        );
        let err = result.err().unwrap();
        assert!(err.to_string().contains("epsilon"));
    }

    #[test]
    fn filtering_requires_a_template() {
        let config = ParticleFilterConfig {
            particle_count: 5,
            radius: 5.0,
            seed: Some(1),
            ..ParticleFilterConfig::default()
        };
        let mut pfm = ParticleFastMatch::new(
            PixelPoint::new(40, 40),
            textured_map(80, 80),
            config,
            Arc::new(SampledDistanceMatcher::default()),
        )
        .unwrap();
        assert!(pfm.filter_particles(&Vector2::zeros()).is_err());
    }

    #[test]
    fn filter_cycle_keeps_the_particle_count() {
        let map = textured_map(160, 160);
        let template = image::imageops::crop_imm(&map, 70, 70, 21, 21).to_image();
        let config = ParticleFilterConfig {
            particle_count: 12,
            radius: 4.0,
            epsilon: 0.5,
            seed: Some(3),
            ..ParticleFilterConfig::default()
        };
        let mut pfm = ParticleFastMatch::new(
            PixelPoint::new(80, 80),
            map.clone(),
            config,
            Arc::new(SampledDistanceMatcher::default()),
        )
        .unwrap();
        pfm.set_template(template);
        pfm.set_scale(0.95, 1.05, 3);
        let estimate = pfm.filter_particles(&Vector2::new(1.0, 0.0)).unwrap();
        assert_eq!(pfm.particles().len(), 12);
        assert!(estimate.corners.is_some());
        assert!(estimate.best_distance.unwrap() >= 0.0);
        assert!(estimate.kld.occupied_bins >= 1);
        let total: f64 = pfm.particles().iter().map(|p| p.weight()).sum();
        assert_approx_eq!(total, 1.0, 1e-5);
        let view = pfm.best_particle_view(&map).unwrap();
        assert_eq!(view.dimensions(), (21, 21));
        assert!(pfm.describe().contains("glf"));
    }
}
