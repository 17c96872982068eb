//! Scale and motion models
//!
//! Both models are pure functions of the frame metadata. [`ScaleModel`] turns the camera field of
//! view, the flight altitude and the image width into the map scale at which the template should
//! be searched. [`MotionModelSvo`] turns the visual odometry pose and the compass heading into a
//! planar movement vector: the magnitude of the odometry displacement is trusted, its direction
//! is not, so the direction is rebuilt from the heading.
use std::f64::consts::FRAC_PI_2;

use nalgebra::{Rotation3, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::PixelPoint;
use crate::earth::{LocalTangentPlane, PixelMapper};

/// Lower search margin applied to the base scale.
pub const SCALE_MARGIN_LOW: f64 = 0.9;
/// Upper search margin applied to the base scale.
pub const SCALE_MARGIN_HIGH: f64 = 1.1;
/// Camera field of view (radians) used by the dataset runtime.
pub const DEFAULT_FIELD_OF_VIEW: f64 = 1.0;

/// Base scale and search range produced by [`ScaleModel::update_scale`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleEstimate {
    pub scale: f64,
    pub low: f64,
    pub high: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScaleModel;

impl ScaleModel {
    /// Computes `tan(fov/2) * altitude / (image_width/2)` and its search range.
    ///
    /// # Arguments
    /// * `fov` - Horizontal field of view in radians
    /// * `altitude` - Height above ground in meters
    /// * `image_width` - Camera image width in pixels
    /// * `set_scale` - Receives the low and high bounds of the search range
    pub fn update_scale<F: FnMut(f64, f64)>(
        &self,
        fov: f64,
        altitude: f64,
        image_width: u32,
        mut set_scale: F,
    ) -> ScaleEstimate {
        let scale = (fov / 2.0).tan() * altitude / (image_width as f64 / 2.0);
        let estimate = ScaleEstimate {
            scale,
            low: scale * SCALE_MARGIN_LOW,
            high: scale * SCALE_MARGIN_HIGH,
        };
        set_scale(estimate.low, estimate.high);
        estimate
    }
}

/// Visual odometry position in the local ENU tangent plane (meters).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SvoPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Planar movement and the position it was derived from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Movement {
    pub vector: Vector2<f64>,
    pub position: PixelPoint,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MotionModelSvo;

impl MotionModelSvo {
    /// Movement of `distance` pixels along `heading` (radians clockwise from north).
    pub fn heading_movement(distance: f64, heading: f64) -> Vector2<f64> {
        Vector2::new(distance * heading.sin(), -distance * heading.cos())
    }

    /// Map pixel position of an odometry pose.
    pub fn project(
        &self,
        pose: &SvoPose,
        plane: &LocalTangentPlane,
        mapper: &dyn PixelMapper,
    ) -> PixelPoint {
        let (latitude, longitude, _) = plane.reverse(pose.x, pose.y, pose.z);
        mapper.to_pixels(latitude, longitude)
    }

    fn between(previous: PixelPoint, position: PixelPoint, heading: f64) -> Movement {
        let delta = (position - previous).cast::<f64>();
        Movement {
            vector: Self::heading_movement(delta.norm(), heading),
            position,
        }
    }

    /// Movement since `previous`, with magnitude from odometry and direction from `heading`.
    ///
    /// # Returns
    /// The movement vector and the new planar position the caller carries to the next frame.
    pub fn movement(
        &self,
        pose: &SvoPose,
        plane: &LocalTangentPlane,
        mapper: &dyn PixelMapper,
        heading: f64,
        previous: PixelPoint,
    ) -> Movement {
        Self::between(previous, self.project(pose, plane, mapper), heading)
    }

    /// Like [`MotionModelSvo::movement`], but the new position is where the camera's optical axis
    /// hits the ground plane `z = 0`, seen from the odometry position at `altitude`.
    ///
    /// The camera looks along the body Y axis rotated by −π/2 about X, then by `attitude`. A look
    /// vector parallel to the ground keeps the odometry position.
    #[allow(clippy::too_many_arguments)]
    pub fn movement_from_ground_projection(
        &self,
        pose: &SvoPose,
        plane: &LocalTangentPlane,
        mapper: &dyn PixelMapper,
        attitude: &UnitQuaternion<f64>,
        altitude: f64,
        heading: f64,
        previous: PixelPoint,
    ) -> Movement {
        let current = self.project(pose, plane, mapper);
        let position = ground_intersection(current, attitude, altitude).unwrap_or(current);
        Self::between(previous, position, heading)
    }
}

fn ground_intersection(
    current: PixelPoint,
    attitude: &UnitQuaternion<f64>,
    altitude: f64,
) -> Option<PixelPoint> {
    let camera = Rotation3::from_euler_angles(-FRAC_PI_2, 0.0, 0.0);
    let look = attitude * (camera * Vector3::y());
    if look.z.abs() < 1e-9 {
        return None;
    }
    let origin = Vector3::new(current.x as f64, current.y as f64, altitude);
    let hit = origin + look * (-altitude / look.z);
    Some(PixelPoint::new(hit.x as i32, hit.y as i32))
}
