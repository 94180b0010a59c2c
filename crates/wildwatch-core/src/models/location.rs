//! Spatial types for incident locations

use serde::{Deserialize, Serialize};
use serde_json::Value;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// WGS84 point, optionally with altitude (m) and accuracy (m)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl GeoPoint {
    /// Build a point, rejecting out-of-range coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, String> {
        let point = Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
        };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("latitude {} is outside [-90, 90]", self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!(
                "longitude {} is outside [-180, 180]",
                self.longitude
            ));
        }
        Ok(())
    }

    /// Read a location answer.
    ///
    /// Accepts the Kobo geopoint string (`"lat lon [alt [acc]]"`), a
    /// `"lat,lon"` pair, or an object with `latitude`/`lat` and
    /// `longitude`/`lng`/`lon` keys. Returns `None` for anything else or for
    /// out-of-range coordinates.
    pub fn from_answer(value: &Value) -> Option<Self> {
        let point = match value {
            Value::String(text) => {
                let parts: Vec<f64> = text
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|part| !part.is_empty())
                    .map(str::parse)
                    .collect::<Result<_, _>>()
                    .ok()?;
                if parts.len() < 2 {
                    return None;
                }
                Self {
                    latitude: parts[0],
                    longitude: parts[1],
                    altitude: parts.get(2).copied(),
                    accuracy: parts.get(3).copied(),
                }
            }
            Value::Object(map) => {
                let number = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|key| map.get(*key).and_then(Value::as_f64))
                };
                Self {
                    latitude: number(&["latitude", "lat"])?,
                    longitude: number(&["longitude", "lng", "lon"])?,
                    altitude: number(&["altitude", "alt"]),
                    accuracy: number(&["accuracy"]),
                }
            }
            Value::Array(items) if items.len() >= 2 => Self {
                latitude: items[0].as_f64()?,
                longitude: items[1].as_f64()?,
                altitude: items.get(2).and_then(Value::as_f64),
                accuracy: items.get(3).and_then(Value::as_f64),
            },
            _ => return None,
        };
        point.validate().ok().map(|()| point)
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Axis-aligned latitude/longitude box.
///
/// `min_longitude > max_longitude` describes a box crossing the 180th
/// meridian, covering `[min_longitude, 180]` and `[-180, max_longitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub min_longitude: f64,
    pub max_latitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    pub fn new(
        min_latitude: f64,
        min_longitude: f64,
        max_latitude: f64,
        max_longitude: f64,
    ) -> Result<Self, String> {
        GeoPoint::new(min_latitude, min_longitude)?;
        GeoPoint::new(max_latitude, max_longitude)?;
        if min_latitude > max_latitude {
            return Err("bounding box minimum latitude must not exceed maximum".to_string());
        }
        Ok(Self {
            min_latitude,
            min_longitude,
            max_latitude,
            max_longitude,
        })
    }

    /// Smallest box containing the circle of `radius_km` around `center`.
    /// Latitude is clamped at the poles; longitude wraps across the 180th
    /// meridian.
    pub fn around(center: &GeoPoint, radius_km: f64) -> Self {
        let lat_delta = (radius_km / EARTH_RADIUS_KM).to_degrees();
        let min_latitude = (center.latitude - lat_delta).max(-90.0);
        let max_latitude = (center.latitude + lat_delta).min(90.0);
        let cos_lat = center.latitude.to_radians().cos().abs();

        // Near a pole every longitude is in range
        let reaches_pole = max_latitude >= 90.0 || min_latitude <= -90.0;
        if reaches_pole || cos_lat < 1e-9 || lat_delta / cos_lat >= 180.0 {
            return Self {
                min_latitude,
                min_longitude: -180.0,
                max_latitude,
                max_longitude: 180.0,
            };
        }

        let lon_delta = lat_delta / cos_lat;
        let mut min_longitude = center.longitude - lon_delta;
        let mut max_longitude = center.longitude + lon_delta;
        if min_longitude < -180.0 {
            min_longitude += 360.0;
        }
        if max_longitude > 180.0 {
            max_longitude -= 360.0;
        }
        Self {
            min_latitude,
            min_longitude,
            max_latitude,
            max_longitude,
        }
    }

    /// Whether the box wraps across the 180th meridian
    pub fn crosses_antimeridian(&self) -> bool {
        self.min_longitude > self.max_longitude
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        let longitude_ok = if self.crosses_antimeridian() {
            point.longitude >= self.min_longitude || point.longitude <= self.max_longitude
        } else {
            (self.min_longitude..=self.max_longitude).contains(&point.longitude)
        };
        (self.min_latitude..=self.max_latitude).contains(&point.latitude) && longitude_ok
    }
}
