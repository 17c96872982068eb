//! Geodesy helpers for map matching
//!
//! The visual odometry pose arrives as metric offsets in a local East-North-Up (ENU) tangent
//! plane anchored at the first frame. This module converts those offsets back to WGS84 geodetic
//! coordinates and then to map pixels. The WGS84 <-> ECEF conversions come from the
//! [`nav-types`](https://crates.io/crates/nav-types) crate; the tangent plane is an ECEF anchor
//! point plus the ECEF -> ENU rotation at that point.
//!
//! Map images are georeferenced by their bounding box ([`MapDescription`]) and pixels are assumed
//! to be linearly spaced in latitude and longitude, which holds for the small areas covered by a
//! single flight.
use std::io;
use std::path::Path;

use ::nalgebra::{Matrix3, Point2, Vector3};
use ::nav_types::{ECEF, WGS84};
use serde::{Deserialize, Serialize};

use crate::PixelPoint;
use crate::config::read_file;

/// Local tangent plane anchored at a geodetic origin.
#[derive(Clone, Copy, Debug)]
pub struct LocalTangentPlane {
    origin: WGS84<f64>,
    origin_ecef: Vector3<f64>,
    ecef_to_enu: Matrix3<f64>,
}

/// Rotation from ECEF axes to the ENU axes at the given geodetic position (degrees).
pub fn ecef_to_enu(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let (sin_lat, cos_lat) = latitude.to_radians().sin_cos();
    let (sin_lon, cos_lon) = longitude.to_radians().sin_cos();
    Matrix3::new(
        -sin_lon, cos_lon, 0.0,
        -sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat,
        cos_lat * cos_lon, cos_lat * sin_lon, sin_lat,
    )
}

impl LocalTangentPlane {
    /// Anchors a tangent plane at the given WGS84 latitude and longitude (degrees) and altitude
    /// (meters).
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        let origin = WGS84::from_degrees_and_meters(latitude, longitude, altitude);
        let ecef = ECEF::from(origin);
        LocalTangentPlane {
            origin,
            origin_ecef: Vector3::new(ecef.x(), ecef.y(), ecef.z()),
            ecef_to_enu: ecef_to_enu(latitude, longitude),
        }
    }
    pub fn origin(&self) -> (f64, f64, f64) {
        (
            self.origin.latitude_degrees(),
            self.origin.longitude_degrees(),
            self.origin.altitude(),
        )
    }
    /// Geodetic position of a local ENU offset.
    ///
    /// # Returns
    /// `(latitude, longitude, altitude)` in degrees, degrees and meters.
    pub fn reverse(&self, east: f64, north: f64, up: f64) -> (f64, f64, f64) {
        let ecef = self.origin_ecef + self.ecef_to_enu.transpose() * Vector3::new(east, north, up);
        let position: WGS84<f64> = WGS84::from(ECEF::new(ecef.x, ecef.y, ecef.z));
        (
            position.latitude_degrees(),
            position.longitude_degrees(),
            position.altitude(),
        )
    }
    /// Local ENU offset of a geodetic position.
    pub fn forward(&self, latitude: f64, longitude: f64, altitude: f64) -> (f64, f64, f64) {
        let ecef = ECEF::from(WGS84::from_degrees_and_meters(latitude, longitude, altitude));
        let offset = self.ecef_to_enu * (Vector3::new(ecef.x(), ecef.y(), ecef.z()) - self.origin_ecef);
        (offset.x, offset.y, offset.z)
    }
}

/// Conversion from geodetic coordinates to map pixels.
pub trait PixelMapper {
    fn to_pixels(&self, latitude: f64, longitude: f64) -> PixelPoint;
}

/// Georeferencing of a map image by its bounding box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapDescription {
    /// Latitude of the top edge in degrees.
    pub north: f64,
    /// Latitude of the bottom edge in degrees.
    pub south: f64,
    /// Longitude of the left edge in degrees.
    pub west: f64,
    /// Longitude of the right edge in degrees.
    pub east: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub name: Option<String>,
}

impl MapDescription {
    /// Geodetic coordinates (degrees) of a map pixel.
    pub fn to_geodetic(&self, pixel: &Point2<f64>) -> (f64, f64) {
        let latitude = self.north - pixel.y / self.height as f64 * (self.north - self.south);
        let longitude = self.west + pixel.x / self.width as f64 * (self.east - self.west);
        (latitude, longitude)
    }
    /// Read the description from JSON, YAML or TOML chosen by file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_file(path)
    }
}

impl PixelMapper for MapDescription {
    fn to_pixels(&self, latitude: f64, longitude: f64) -> PixelPoint {
        let x = (longitude - self.west) / (self.east - self.west) * self.width as f64;
        let y = (self.north - latitude) / (self.north - self.south) * self.height as f64;
        PixelPoint::new(x as i32, y as i32)
    }
}
