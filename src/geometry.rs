use geo::Coord;
use geo_types::Point;
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for all distance checks (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of longitude at the equator
const METERS_PER_DEG_LON: f64 = 111_320.0;
/// Meters per degree of latitude
const METERS_PER_DEG_LAT: f64 = 110_540.0;

/// A WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and inside the valid latitude/longitude ranges
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(p: GeoPoint) -> Self {
        Point::new(p.lon, p.lat)
    }
}

impl From<Point<f64>> for GeoPoint {
    fn from(p: Point<f64>) -> Self {
        GeoPoint::new(p.y(), p.x())
    }
}

impl From<GeoPoint> for Coord<f64> {
    fn from(p: GeoPoint) -> Self {
        Coord { x: p.lon, y: p.lat }
    }
}

/// Great-circle distance between two points in meters
pub fn haversine_distance(p1: GeoPoint, p2: GeoPoint) -> f64 {
    let d_lat = (p2.lat - p1.lat).to_radians();
    let d_lon = (p2.lon - p1.lon).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + p1.lat.to_radians().cos() * p2.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Equirectangular projection to local meters.
///
/// Only meaningful over a few hundred meters around `origin_lat`; projected
/// coordinates from different origins must not be mixed.
pub fn project_local(p: GeoPoint, origin_lat: f64) -> Coord<f64> {
    Coord {
        x: p.lon * METERS_PER_DEG_LON * origin_lat.to_radians().cos(),
        y: p.lat * METERS_PER_DEG_LAT,
    }
}

/// Inverse of [`project_local`] for the same origin latitude
pub fn unproject_local(c: Coord<f64>, origin_lat: f64) -> GeoPoint {
    GeoPoint {
        lat: c.y / METERS_PER_DEG_LAT,
        lon: c.x / (METERS_PER_DEG_LON * origin_lat.to_radians().cos()),
    }
}

/// Closest point to `p` on the segment `a`-`b` (not the infinite line).
///
/// The projection uses `p`'s latitude for the cosine correction. A degenerate
/// segment (`a == b`) yields `a`.
pub fn closest_point_on_segment(a: GeoPoint, b: GeoPoint, p: GeoPoint) -> GeoPoint {
    let origin_lat = p.lat;
    let a_xy = project_local(a, origin_lat);
    let b_xy = project_local(b, origin_lat);
    let p_xy = project_local(p, origin_lat);

    let ab = b_xy - a_xy;
    let ap = p_xy - a_xy;

    let ab2 = ab.x * ab.x + ab.y * ab.y;
    if ab2 == 0.0 {
        return a;
    }

    let t = ((ap.x * ab.x + ap.y * ab.y) / ab2).clamp(0.0, 1.0);
    unproject_local(a_xy + ab * t, origin_lat)
}

/// Planar bearing from `from` to `to` in degrees, `atan2(dlat, dlon)`,
/// 0 = east, counter-clockwise, normalized to `[0, 360)`
pub fn planar_bearing(from: GeoPoint, to: GeoPoint) -> f64 {
    normalize_degrees((to.lat - from.lat).atan2(to.lon - from.lon).to_degrees())
}

pub fn normalize_degrees(deg: f64) -> f64 {
    let d = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if d >= 360.0 { 0.0 } else { d }
}

/// Smallest absolute difference between two angles in degrees, `[0, 180]`
pub fn angle_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS_DEG: f64 = 1e-9;

    fn assert_close(a: GeoPoint, b: GeoPoint) {
        assert!(
            (a.lat - b.lat).abs() < EPS_DEG && (a.lon - b.lon).abs() < EPS_DEG,
            "{:?} != {:?}",
            a,
            b
        );
    }

    #[test]
    fn haversine_zero_for_same_point() {
        for p in [
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(52.5194, 13.4037),
            GeoPoint::new(-33.86, 151.21),
        ] {
            assert_eq!(haversine_distance(p, p), 0.0);
        }
    }

    #[test]
    fn haversine_is_symmetric() {
        let a = GeoPoint::new(52.5193794, 13.4037577);
        let b = GeoPoint::new(52.5199179, 13.4048107);
        assert_eq!(haversine_distance(a, b), haversine_distance(b, a));
    }

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_distance(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        // 2 * pi * R / 360
        assert!((d - 111_194.93).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn closest_point_between_endpoints_is_identity() {
        let a = GeoPoint::new(52.5190, 13.4030);
        let b = GeoPoint::new(52.5200, 13.4050);
        for t in [0.0, 0.25, 0.5, 0.9, 1.0] {
            let p = GeoPoint::new(a.lat + t * (b.lat - a.lat), a.lon + t * (b.lon - a.lon));
            assert_close(closest_point_on_segment(a, b, p), p);
        }
    }

    #[test]
    fn closest_point_clamps_to_endpoints() {
        let a = GeoPoint::new(52.0, 13.000);
        let b = GeoPoint::new(52.0, 13.001);

        let before = GeoPoint::new(52.0001, 12.999);
        assert_close(closest_point_on_segment(a, b, before), a);

        let after = GeoPoint::new(51.9999, 13.003);
        assert_close(closest_point_on_segment(a, b, after), b);
    }

    #[test]
    fn closest_point_perpendicular_foot() {
        let a = GeoPoint::new(48.0, 11.000);
        let b = GeoPoint::new(48.0, 11.002);
        let p = GeoPoint::new(48.0003, 11.001);
        assert_close(closest_point_on_segment(a, b, p), GeoPoint::new(48.0, 11.001));
    }

    #[test]
    fn degenerate_segment_returns_start() {
        let a = GeoPoint::new(10.0, 20.0);
        let p = GeoPoint::new(10.1, 20.1);
        assert_eq!(closest_point_on_segment(a, a, p), a);
    }

    #[test]
    fn bearings_follow_engineering_convention() {
        let o = GeoPoint::new(0.0, 0.0);
        assert!((planar_bearing(o, GeoPoint::new(0.0, 1.0)) - 0.0).abs() < 1e-9);
        assert!((planar_bearing(o, GeoPoint::new(1.0, 0.0)) - 90.0).abs() < 1e-9);
        assert!((planar_bearing(o, GeoPoint::new(0.0, -1.0)) - 180.0).abs() < 1e-9);
        assert!((planar_bearing(o, GeoPoint::new(-1.0, 0.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn angle_difference_wraps() {
        assert_eq!(angle_difference(350.0, 10.0), 20.0);
        assert_eq!(angle_difference(-90.0, 270.0), 0.0);
        assert_eq!(angle_difference(0.0, 180.0), 180.0);
    }
}
