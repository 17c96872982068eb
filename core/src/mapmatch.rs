//! Particle-filter map matching toolbox
//!
//! This crate estimates the 2-D map position and heading of a camera-equipped aerial vehicle
//! by comparing each incoming camera frame against a large reference map image. A particle
//! filter carries the pose hypotheses; each particle expands a combinatorial set of affine
//! candidate configurations (scale × scale × rotation × fine rotation) around its position and
//! scores them with an affine template matcher. Lower match distances mean better agreement.
//!
//! # Modules
//! - [`models`]: scale and motion models that turn frame metadata into scale bounds and
//!   a planar movement vector.
//! - [`particle`]: the shared, versioned [`particle::ParticleConfig`], the shared scale table,
//!   and the per-particle hypothesis bookkeeping.
//! - [`filter`]: the particle set ([`filter::Particles`]) with initialization, propagation,
//!   evaluation, normalization and resampling.
//! - [`localizer`]: the production per-frame engine built on top of the particle set.
//! - [`fast_matcher`]: a non-blocking single-shot matcher wrapper used for a best-match overlay.
//! - [`matching`]: the matcher seam ([`matching::AffineMatcher`]) plus a reference brute-force
//!   implementation so that the binary and tests are self-contained.
//! - [`earth`]: local tangent plane projection and map pixel mapping.
//! - [`dataset`], [`results`], [`preview`], [`runtime`]: the dataset driver and its outputs.
//!
//! # Coordinate conventions
//! Map and image coordinates are pixel coordinates with the origin in the top-left corner,
//! X growing to the right and Y growing downwards. Headings are in radians measured clockwise
//! from north, so a movement of `d` pixels along heading `h` is `(d·sin h, −d·cos h)`.
pub mod config;
pub mod dataset;
pub mod earth;
pub mod fast_matcher;
pub mod filter;
pub mod localizer;
pub mod matching;
pub mod models;
pub mod particle;
pub mod preview;
pub mod results;
pub mod runtime;

use nalgebra::{Matrix2x3, Point2};

pub use config::ParticleFilterConfig;
pub use filter::Particles;
pub use localizer::{ConversionMode, ParticleFastMatch};
pub use particle::{Particle, ParticleConfig, ScaleTable};
pub use runtime::{LocalizationRuntime, Runtime, RunOptions, run_dataset};

/// Affine transform mapping template pixel coordinates to image pixel coordinates.
pub type AffineMatrix = Matrix2x3<f64>;
/// Integer pixel coordinate in map space.
pub type PixelPoint = Point2<i32>;
/// The four corners of a template placed in the image: top-left, top-right, bottom-right,
/// bottom-left.
pub type Corners = [PixelPoint; 4];

/// Margin (pixels) by which a transformed template corner may leave the image and still be
/// considered in bounds.
pub const BOUNDARY_PADDING: f64 = 10.0;

/// Strict containment test of `point` in the axis-aligned box spanned by `top_left` and
/// `bottom_right`.
pub fn is_within_bounds(
    point: &Point2<f64>,
    top_left: &Point2<f64>,
    bottom_right: &Point2<f64>,
) -> bool {
    point.x > top_left.x && point.x < bottom_right.x && point.y > top_left.y && point.y < bottom_right.y
}

/// Rotation about `center` by `angle_degrees` combined with an isotropic `scale`.
///
/// Positive angles rotate counter-clockwise on screen (Y pointing down), matching the usual
/// image-processing convention for 2-D rotation matrices.
///
/// # Arguments
/// * `center` - Fixed point of the rotation in pixel coordinates
/// * `angle_degrees` - Rotation angle in degrees
/// * `scale` - Isotropic scale factor
///
/// # Returns
/// The 2x3 affine matrix `[[α, β, (1−α)cx − β·cy], [−β, α, β·cx + (1−α)cy]]` with
/// `α = scale·cos θ` and `β = scale·sin θ`.
pub fn rotation_matrix_2d(center: &Point2<f64>, angle_degrees: f64, scale: f64) -> AffineMatrix {
    let (sin, cos) = angle_degrees.to_radians().sin_cos();
    let alpha = scale * cos;
    let beta = scale * sin;
    AffineMatrix::new(
        alpha,
        beta,
        (1.0 - alpha) * center.x - beta * center.y,
        -beta,
        alpha,
        beta * center.x + (1.0 - alpha) * center.y,
    )
}

/// Applies an affine transform to a point.
pub fn transform_point(affine: &AffineMatrix, point: &Point2<f64>) -> Point2<f64> {
    Point2::new(
        affine[(0, 0)] * point.x + affine[(0, 1)] * point.y + affine[(0, 2)],
        affine[(1, 0)] * point.x + affine[(1, 1)] * point.y + affine[(1, 2)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn rotation_without_angle_is_scaling_about_center() {
        let center = Point2::new(50.0, 20.0);
        let affine = rotation_matrix_2d(&center, 0.0, 2.0);
        let moved = transform_point(&affine, &center);
        assert_approx_eq!(moved.x, 50.0, 1e-12);
        assert_approx_eq!(moved.y, 20.0, 1e-12);
        let other = transform_point(&affine, &Point2::new(51.0, 20.0));
        assert_approx_eq!(other.x, 52.0, 1e-12);
        assert_approx_eq!(other.y, 20.0, 1e-12);
    }

    #[test]
    fn rotation_by_ninety_degrees() {
        let affine = rotation_matrix_2d(&Point2::origin(), 90.0, 1.0);
        let moved = transform_point(&affine, &Point2::new(1.0, 0.0));
        assert_approx_eq!(moved.x, 0.0, 1e-12);
        assert_approx_eq!(moved.y, -1.0, 1e-12);
    }

    #[test]
    fn bounds_are_strict() {
        let top_left = Point2::new(0.0, 0.0);
        let bottom_right = Point2::new(10.0, 10.0);
        assert!(is_within_bounds(&Point2::new(5.0, 5.0), &top_left, &bottom_right));
        assert!(!is_within_bounds(&Point2::new(0.0, 5.0), &top_left, &bottom_right));
        assert!(!is_within_bounds(&Point2::new(5.0, 10.0), &top_left, &bottom_right));
        assert!(!is_within_bounds(&Point2::new(-1.0, 5.0), &top_left, &bottom_right));
    }
}
