use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        validate_coordinates(self.lat, self.lon).is_ok()
    }

    /// (0,0) is what autopilots report before home has been recorded.
    pub fn is_null_island(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }

    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_m(self.lat, self.lon, other.lat, other.lon)
    }

    pub fn bearing_to(&self, other: &GeoPoint) -> f64 {
        bearing_deg(self.lat, self.lon, other.lat, other.lon)
    }
}

pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), String> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(format!("invalid latitude {} (must be -90 to 90)", lat));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("invalid longitude {} (must be -180 to 180)", lon));
    }
    Ok(())
}

// ----- Geometry -----

/// Great-circle distance in meters on a spherical Earth.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if lat1 == lat2 && lon1 == lon2 {
        return 0.0;
    }
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    // rounding can push a just past 1 for antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial bearing from the first point to the second, degrees in [0, 360).
/// Identical points yield 0.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dlon = (lon2 - lon1).to_radians();
    let y = dlon.sin() * p2.cos();
    let x = p1.cos() * p2.sin() - p1.sin() * p2.cos() * dlon.cos();
    let b = y.atan2(x).to_degrees();
    (b + 360.0) % 360.0
}

pub fn midpoint(a: &GeoPoint, b: &GeoPoint) -> GeoPoint {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let lat2 = b.lat.to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let bx = lat2.cos() * dlon.cos();
    let by = lat2.cos() * dlon.sin();
    let lat_mid = (lat1.sin() + lat2.sin()).atan2(((lat1.cos() + bx).powi(2) + by * by).sqrt());
    let lon_mid = lon1 + by.atan2(lat1.cos() + bx);
    GeoPoint::new(lat_mid.to_degrees(), lon_mid.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_points_are_zero_apart() {
        for (lat, lon) in [(0.0, 0.0), (47.3769, 8.5417), (-90.0, 180.0), (89.999, -179.5)] {
            assert_eq!(haversine_m(lat, lon, lat, lon), 0.0);
            assert_eq!(bearing_deg(lat, lon, lat, lon), 0.0);
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let a = GeoPoint::new(51.5007, -0.1246);
        let b = GeoPoint::new(48.8584, 2.2945);
        assert!((a.distance_to(&b) - b.distance_to(&a)).abs() < 1e-6);
    }

    #[test]
    fn landmark_distances_match_great_circle() {
        // Big Ben to the Eiffel Tower, ~340.6 km
        let d = haversine_m(51.5007, -0.1246, 48.8584, 2.2945);
        assert!((d - 340_600.0).abs() / 340_600.0 < 0.001, "got {}", d);

        // JFK to LAX, ~3974 km on a 6371 km sphere
        let d = haversine_m(40.6413, -73.7781, 33.9416, -118.4085);
        assert!((d - 3_974_000.0).abs() / 3_974_000.0 < 0.001, "got {}", d);

        // one degree of longitude on the equator
        let d = haversine_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_194.9).abs() < 1.0);
    }

    #[test]
    fn antipodal_points_do_not_produce_nan() {
        let d = haversine_m(0.0, 0.0, 0.0, 180.0);
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn cardinal_bearings() {
        assert!((bearing_deg(0.0, 0.0, 1.0, 0.0) - 0.0).abs() < 1e-9);
        assert!((bearing_deg(0.0, 0.0, 0.0, 1.0) - 90.0).abs() < 1e-9);
        assert!((bearing_deg(0.0, 0.0, -1.0, 0.0) - 180.0).abs() < 1e-9);
        assert!((bearing_deg(0.0, 0.0, 0.0, -1.0) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn midpoint_on_equator() {
        let m = midpoint(&GeoPoint::new(0.0, 0.0), &GeoPoint::new(0.0, 10.0));
        assert!(m.lat.abs() < 1e-9);
        assert!((m.lon - 5.0).abs() < 1e-9);
    }

    #[test]
    fn coordinate_bounds() {
        assert!(validate_coordinates(90.0, -180.0).is_ok());
        assert!(validate_coordinates(90.1, 0.0).is_err());
        assert!(validate_coordinates(0.0, 180.5).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(0.0, 0.0).is_null_island());
    }
}
