//! Geographic helpers

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_MILES: f64 = 3958.8;
const MILES_PER_LATITUDE_DEGREE: f64 = 69.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in miles
    #[must_use]
    pub fn distance_miles(self, other: Self) -> f64 {
        let lat_a = self.latitude.to_radians();
        let lat_b = other.latitude.to_radians();
        let d_lat = lat_b - lat_a;
        let d_lng = (other.longitude - self.longitude).to_radians();
        let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_MILES * h.sqrt().min(1.0).asin()
    }
}

/// Axis-aligned latitude/longitude box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Box extending `radius_miles` from `center` in every direction
    #[must_use]
    pub fn around(center: LatLng, radius_miles: f64) -> Self {
        let lat_delta = radius_miles / MILES_PER_LATITUDE_DEGREE;
        let lng_scale = center.latitude.to_radians().cos().abs().max(0.01);
        let lng_delta = (radius_miles / (MILES_PER_LATITUDE_DEGREE * lng_scale)).min(180.0);
        Self {
            south: (center.latitude - lat_delta).max(-90.0),
            west: center.longitude - lng_delta,
            north: (center.latitude + lat_delta).min(90.0),
            east: center.longitude + lng_delta,
        }
    }

    #[must_use]
    pub fn contains(&self, point: LatLng) -> bool {
        (self.south..=self.north).contains(&point.latitude)
            && (self.west..=self.east).contains(&point.longitude)
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.east - self.west
    }
}
