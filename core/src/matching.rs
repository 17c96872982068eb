//! Affine template matching seam
//!
//! Particles do not score hypotheses themselves; they turn their candidate configurations into
//! affine transforms and hand them to an [`AffineMatcher`], which returns one distance per
//! transform (lower is better). The matcher also offers a single-shot best-match search used by
//! the asynchronous overlay in [`crate::fast_matcher`].
//!
//! [`SampledDistanceMatcher`] is a small brute-force implementation of the trait: the distance of
//! a transform is the mean absolute intensity difference between template and image at the
//! sampled template points, optionally after matching the means and standard deviations of the
//! two sample sets (photometric invariance).
use anyhow::{Result, bail};
use image::GrayImage;
use log::debug;
use nalgebra::{Matrix2, Point2, Vector2};

use crate::{AffineMatrix, BOUNDARY_PADDING, Corners, PixelPoint, is_within_bounds, transform_point};

/// One affine hypothesis: translation relative to the image centre, a fine rotation, an
/// anisotropic scale and a coarse rotation (radians).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchConfig {
    pub translation_x: f64,
    pub translation_y: f64,
    pub fine_rotation: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub coarse_rotation: f64,
}

fn rotation(angle: f64) -> Matrix2<f64> {
    let (sin, cos) = angle.sin_cos();
    Matrix2::new(cos, -sin, sin, cos)
}

fn center_of(dims: (u32, u32)) -> Vector2<f64> {
    Vector2::new(
        (dims.0 as f64 - 1.0) / 2.0,
        (dims.1 as f64 - 1.0) / 2.0,
    )
}

impl MatchConfig {
    pub fn new(
        translation_x: f64,
        translation_y: f64,
        fine_rotation: f64,
        scale_x: f64,
        scale_y: f64,
        coarse_rotation: f64,
    ) -> Self {
        MatchConfig {
            translation_x,
            translation_y,
            fine_rotation,
            scale_x,
            scale_y,
            coarse_rotation,
        }
    }

    /// `R(coarse) * diag(sx, sy) * R(fine)`
    pub fn linear_part(&self) -> Matrix2<f64> {
        rotation(self.coarse_rotation)
            * Matrix2::new(self.scale_x, 0.0, 0.0, self.scale_y)
            * rotation(self.fine_rotation)
    }

    /// Affine transform taking template pixels to image pixels: the template centre lands on the
    /// image centre shifted by the configuration's translation.
    pub fn affine(&self, image_dims: (u32, u32), template_dims: (u32, u32)) -> AffineMatrix {
        let linear = self.linear_part();
        let translation = center_of(image_dims)
            + Vector2::new(self.translation_x, self.translation_y)
            - linear * center_of(template_dims);
        AffineMatrix::new(
            linear[(0, 0)],
            linear[(0, 1)],
            translation.x,
            linear[(1, 0)],
            linear[(1, 1)],
            translation.y,
        )
    }
}

/// Corners of a template in its own pixel coordinates: top-left, top-right, bottom-right,
/// bottom-left.
pub fn template_corner_points(template_dims: (u32, u32)) -> [Point2<f64>; 4] {
    let w = template_dims.0 as f64 - 1.0;
    let h = template_dims.1 as f64 - 1.0;
    [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ]
}

/// Image-space corners of the template under `affine`, rounded to pixels.
pub fn template_corners(template_dims: (u32, u32), affine: &AffineMatrix) -> Corners {
    template_corner_points(template_dims).map(|corner| {
        let p = transform_point(affine, &corner);
        PixelPoint::new(p.x.round() as i32, p.y.round() as i32)
    })
}

/// Converts candidate configurations into affine transforms and drops those that would place a
/// template corner outside the (padded) image.
///
/// # Returns
/// The in-bounds affines in candidate order, and one flag per input configuration telling
/// whether it survived.
pub fn configs_to_affine(
    configs: &[MatchConfig],
    image_dims: (u32, u32),
    template_dims: (u32, u32),
) -> (Vec<AffineMatrix>, Vec<bool>) {
    let top_left = Point2::new(-BOUNDARY_PADDING, -BOUNDARY_PADDING);
    let bottom_right = Point2::new(
        image_dims.0 as f64 + BOUNDARY_PADDING,
        image_dims.1 as f64 + BOUNDARY_PADDING,
    );
    let corners = template_corner_points(template_dims);
    let mut affines = Vec::with_capacity(configs.len());
    let mut insiders = Vec::with_capacity(configs.len());
    for config in configs {
        let affine = config.affine(image_dims, template_dims);
        let inside = corners
            .iter()
            .all(|c| is_within_bounds(&transform_point(&affine, c), &top_left, &bottom_right));
        if inside {
            affines.push(affine);
        }
        insiders.push(inside);
    }
    (affines, insiders)
}

/// Result of a single-shot best-match search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchOutcome {
    pub corners: Corners,
    pub distance: f64,
}

impl MatchOutcome {
    /// Midpoint of the top-left and bottom-right corners.
    pub fn center(&self) -> Point2<f64> {
        Point2::new(
            (self.corners[0].x + self.corners[2].x) as f64 / 2.0,
            (self.corners[0].y + self.corners[2].y) as f64 / 2.0,
        )
    }
}

/// Scores affine placements of a template inside an image.
pub trait AffineMatcher: Send + Sync {
    /// One distance per affine, lower is better. `xs`/`ys` are template sample coordinates.
    fn evaluate_candidates(
        &self,
        image: &GrayImage,
        template: &GrayImage,
        affines: &[AffineMatrix],
        xs: &[i32],
        ys: &[i32],
        photometric_invariance: bool,
    ) -> Vec<f64>;

    /// Searches the best placement with a rotation in `[min_rotation, max_rotation]`.
    fn apply(
        &self,
        image: &GrayImage,
        template: &GrayImage,
        min_rotation: f64,
        max_rotation: f64,
    ) -> Result<MatchOutcome>;
}

/// Brute-force reference matcher.
#[derive(Clone, Debug)]
pub struct SampledDistanceMatcher {
    /// Number of rotations tried between the minimum and maximum rotation.
    pub rotation_steps: usize,
    /// Translation grid spacing (image pixels) of the single-shot search.
    pub translation_step: u32,
    /// Isotropic scales tried by the single-shot search.
    pub scales: Vec<f64>,
    /// Approximate number of template points sampled by the single-shot search.
    pub sample_count: usize,
}

impl Default for SampledDistanceMatcher {
    fn default() -> Self {
        SampledDistanceMatcher {
            rotation_steps: 9,
            translation_step: 4,
            scales: vec![0.9, 1.0, 1.1],
            sample_count: 400,
        }
    }
}

fn is_empty(image: &GrayImage) -> bool {
    image.width() == 0 || image.height() == 0
}

fn pixel_at(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (w, h) = image.dimensions();
    let x = (x.round().max(0.0) as u32).min(w.saturating_sub(1));
    let y = (y.round().max(0.0) as u32).min(h.saturating_sub(1));
    image.get_pixel(x, y).0[0] as f64
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

impl SampledDistanceMatcher {
    fn distance(
        image: &GrayImage,
        template: &GrayImage,
        affine: &AffineMatrix,
        xs: &[i32],
        ys: &[i32],
        photometric_invariance: bool,
    ) -> f64 {
        if xs.is_empty() || ys.is_empty() || is_empty(image) || is_empty(template) {
            return 1.0;
        }
        let mut template_values = Vec::with_capacity(xs.len());
        let mut image_values = Vec::with_capacity(xs.len());
        for (&x, &y) in xs.iter().zip(ys) {
            let point = Point2::new(x as f64, y as f64);
            template_values.push(pixel_at(template, point.x, point.y));
            let mapped = transform_point(affine, &point);
            image_values.push(pixel_at(image, mapped.x, mapped.y));
        }
        if photometric_invariance {
            let (template_mean, template_std) = mean_and_std(&template_values);
            let (image_mean, image_std) = mean_and_std(&image_values);
            let gain = if template_std > 1e-9 {
                image_std / template_std
            } else {
                1.0
            };
            for value in template_values.iter_mut() {
                *value = (*value - template_mean) * gain + image_mean;
            }
        }
        let total: f64 = template_values
            .iter()
            .zip(&image_values)
            .map(|(t, i)| (t - i).abs())
            .sum();
        total / (template_values.len() as f64 * 255.0)
    }

    fn sample_grid(&self, template_dims: (u32, u32)) -> (Vec<i32>, Vec<i32>) {
        let (w, h) = template_dims;
        let area = (w as f64 * h as f64).max(1.0);
        let stride = ((area / self.sample_count.max(1) as f64).sqrt().floor() as u32).max(1);
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for y in (0..h).step_by(stride as usize) {
            for x in (0..w).step_by(stride as usize) {
                xs.push(x as i32);
                ys.push(y as i32);
            }
        }
        (xs, ys)
    }
}

impl AffineMatcher for SampledDistanceMatcher {
    fn evaluate_candidates(
        &self,
        image: &GrayImage,
        template: &GrayImage,
        affines: &[AffineMatrix],
        xs: &[i32],
        ys: &[i32],
        photometric_invariance: bool,
    ) -> Vec<f64> {
        affines
            .iter()
            .map(|affine| Self::distance(image, template, affine, xs, ys, photometric_invariance))
            .collect()
    }

    fn apply(
        &self,
        image: &GrayImage,
        template: &GrayImage,
        min_rotation: f64,
        max_rotation: f64,
    ) -> Result<MatchOutcome> {
        let image_dims = image.dimensions();
        let template_dims = template.dimensions();
        if template_dims.0 == 0 || template_dims.1 == 0 {
            bail!("template is empty");
        }
        let (xs, ys) = self.sample_grid(template_dims);
        let steps = self.rotation_steps.max(1);
        let rotations: Vec<f64> = if steps == 1 {
            vec![(min_rotation + max_rotation) / 2.0]
        } else {
            (0..steps)
                .map(|i| min_rotation + (max_rotation - min_rotation) * i as f64 / (steps - 1) as f64)
                .collect()
        };
        let half_w = image_dims.0 as i32 / 2;
        let half_h = image_dims.1 as i32 / 2;
        let step = self.translation_step.max(1) as usize;
        let mut configs = Vec::new();
        for &r in &rotations {
            for &s in &self.scales {
                for ty in (-half_h..=half_h).step_by(step) {
                    for tx in (-half_w..=half_w).step_by(step) {
                        configs.push(MatchConfig::new(tx as f64, ty as f64, 0.0, s, s, r));
                    }
                }
            }
        }
        let (affines, _) = configs_to_affine(&configs, image_dims, template_dims);
        debug!(
            "single-shot search over {} of {} placements",
            affines.len(),
            configs.len()
        );
        let distances = self.evaluate_candidates(image, template, &affines, &xs, &ys, true);
        let Some((best, distance)) = distances
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            bail!("no candidate placement of the template fits inside the image");
        };
        Ok(MatchOutcome {
            corners: template_corners(template_dims, &affines[best]),
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use image::Luma;

    fn gradient_image(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 7 + y * 13 + (x * y) % 31) % 256) as u8])
        })
    }

    #[test]
    fn identity_config_centres_template() {
        let config = MatchConfig::new(0.0, 0.0, 0.0, 1.0, 1.0, 0.0);
        let affine = config.affine((101, 101), (21, 21));
        let corners = template_corners((21, 21), &affine);
        assert_eq!(corners[0], PixelPoint::new(40, 40));
        assert_eq!(corners[2], PixelPoint::new(60, 60));
    }

    #[test]
    fn linear_part_combines_rotations_and_scale() {
        let config = MatchConfig::new(0.0, 0.0, 0.1, 2.0, 2.0, 0.2);
        let linear = config.linear_part();
        let expected = rotation(0.3) * 2.0;
        for i in 0..2 {
            for j in 0..2 {
                assert_approx_eq!(linear[(i, j)], expected[(i, j)], 1e-12);
            }
        }
    }

    #[test]
    fn out_of_bounds_configs_are_flagged() {
        let configs = [
            MatchConfig::new(0.0, 0.0, 0.0, 1.0, 1.0, 0.0),
            MatchConfig::new(500.0, 0.0, 0.0, 1.0, 1.0, 0.0),
            MatchConfig::new(0.0, 0.0, 0.0, 4.0, 4.0, 0.0),
            MatchConfig::new(-5.0, 5.0, 0.0, 1.0, 1.0, 0.0),
        ];
        let (affines, insiders) = configs_to_affine(&configs, (100, 100), (40, 40));
        assert_eq!(insiders, vec![true, false, false, true]);
        assert_eq!(affines.len(), 2);
    }

    #[test]
    fn padding_admits_slight_overhang() {
        // template exactly as large as the image, shifted by less than the padding
        let configs = [
            MatchConfig::new(8.0, 0.0, 0.0, 1.0, 1.0, 0.0),
            MatchConfig::new(12.0, 0.0, 0.0, 1.0, 1.0, 0.0),
        ];
        let (_, insiders) = configs_to_affine(&configs, (50, 50), (50, 50));
        assert_eq!(insiders, vec![true, false]);
    }

    #[test]
    fn exact_placement_has_zero_distance() {
        let image = gradient_image(80, 60);
        let template = image::imageops::crop_imm(&image, 30, 20, 21, 21).to_image();
        let matcher = SampledDistanceMatcher::default();
        let xs: Vec<i32> = (1..20).collect();
        let ys: Vec<i32> = (1..20).rev().collect();
        // template centre (10, 10) sits at image (40, 30); image centre is (39.5, 29.5)
        let exact = MatchConfig::new(0.5, 0.5, 0.0, 1.0, 1.0, 0.0).affine((80, 60), (21, 21));
        let shifted = MatchConfig::new(6.5, -3.5, 0.0, 1.0, 1.0, 0.0).affine((80, 60), (21, 21));
        let distances =
            matcher.evaluate_candidates(&image, &template, &[exact, shifted], &xs, &ys, false);
        assert_approx_eq!(distances[0], 0.0, 1e-12);
        assert!(distances[1] > distances[0]);
    }

    #[test]
    fn photometric_invariance_ignores_brightness_offset() {
        let image = gradient_image(80, 60);
        let template = GrayImage::from_fn(21, 21, |x, y| {
            Luma([image.get_pixel(30 + x, 20 + y).0[0] / 2])
        });
        let matcher = SampledDistanceMatcher::default();
        let xs: Vec<i32> = (0..21).step_by(2).collect();
        let ys: Vec<i32> = (0..21).step_by(2).collect();
        let exact = MatchConfig::new(0.5, 0.5, 0.0, 1.0, 1.0, 0.0).affine((80, 60), (21, 21));
        let plain = matcher.evaluate_candidates(&image, &template, &[exact], &xs, &ys, false);
        let invariant = matcher.evaluate_candidates(&image, &template, &[exact], &xs, &ys, true);
        assert!(invariant[0] < plain[0]);
    }

    #[test]
    fn single_shot_search_finds_the_crop() {
        let image = gradient_image(64, 48);
        let template = image::imageops::crop_imm(&image, 20, 12, 17, 17).to_image();
        let matcher = SampledDistanceMatcher {
            rotation_steps: 1,
            translation_step: 1,
            scales: vec![1.0],
            sample_count: 300,
        };
        let outcome = matcher.apply(&image, &template, 0.0, 0.0).unwrap();
        assert_approx_eq!(outcome.distance, 0.0, 1e-9);
        let center = outcome.center();
        assert_approx_eq!(center.x, 28.0, 1.0);
        assert_approx_eq!(center.y, 20.0, 1.0);
    }

    #[test]
    fn single_shot_search_fails_when_nothing_fits() {
        let image = gradient_image(20, 20);
        let template = gradient_image(60, 60);
        let matcher = SampledDistanceMatcher::default();
        assert!(matcher.apply(&image, &template, 0.0, 0.0).is_err());
    }
}
