//! Distance computations for location searches.
//!
//! Phase one runs in SQL and only needs to be cheap and generous: a bounding
//! box plus a spherical (haversine) distance against an inflated radius.
//! Phase two recomputes every candidate on the WGS-84 ellipsoid with
//! Vincenty's inverse formula and drops anything outside the true radius.

use crate::error::{Error, Result};
use std::cmp::Ordering;

/// Mean Earth radius used by the spherical approximation, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;
/// Default inflation applied to the phase-one radius.
pub const DEFAULT_SEARCH_INFLATION: f64 = 1.02;
/// Default iteration cap for Vincenty's inverse formula.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const CONVERGENCE_EPSILON: f64 = 1e-12;
const KM_PER_DEGREE_LATITUDE: f64 = 111.0;

/// A WGS-84 coordinate in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    /// Creates a validated point.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidCriteria(format!(
                "latitude {latitude} is out of range"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidCriteria(format!(
                "longitude {longitude} is out of range"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Latitude in degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Circle to search within.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LocationSearch {
    pub center: GeoPoint,
    pub radius_km: f64,
}

impl LocationSearch {
    /// Creates a search circle. The radius must be finite and non-negative.
    pub fn new(center: GeoPoint, radius_km: f64) -> Result<Self> {
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(Error::InvalidCriteria(format!(
                "search radius {radius_km} must be a non-negative number"
            )));
        }
        Ok(Self { center, radius_km })
    }
}

/// Latitude/longitude rectangle enclosing a search circle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    /// `None` when the box wraps the antimeridian or touches a pole, in
    /// which case only the latitude band is constrained.
    pub longitude: Option<(f64, f64)>,
}

/// Builds the phase-one rectangle around `center`.
pub fn bounding_box(center: GeoPoint, radius_km: f64) -> BoundingBox {
    let delta_latitude = radius_km / KM_PER_DEGREE_LATITUDE;
    let min_latitude = (center.latitude - delta_latitude).max(-90.0);
    let max_latitude = (center.latitude + delta_latitude).min(90.0);

    let widest = center.latitude.abs() + delta_latitude;
    let longitude = if widest >= 89.0 {
        None
    } else {
        let cos_latitude = widest.to_radians().cos();
        let delta_longitude = delta_latitude / cos_latitude;
        let west = center.longitude - delta_longitude;
        let east = center.longitude + delta_longitude;
        (west >= -180.0 && east <= 180.0).then_some((west, east))
    };

    BoundingBox {
        min_latitude,
        max_latitude,
        longitude,
    }
}

/// Great-circle distance on a sphere, in kilometres.
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let phi1 = from.latitude.to_radians();
    let phi2 = to.latitude.to_radians();
    let d_phi = (to.latitude - from.latitude).to_radians();
    let d_lambda = (to.longitude - from.longitude).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Geodesic distance on the WGS-84 ellipsoid, in kilometres.
///
/// Coincident points yield zero. Returns `None` when the iteration does not
/// converge within `max_iterations`, which happens for nearly antipodal points.
pub fn vincenty_km(from: GeoPoint, to: GeoPoint, max_iterations: u32) -> Option<f64> {
    let b = WGS84_A * (1.0 - WGS84_F);
    let l = (to.longitude - from.longitude).to_radians();
    let u1 = ((1.0 - WGS84_F) * from.latitude.to_radians().tan()).atan();
    let u2 = ((1.0 - WGS84_F) * to.latitude.to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    for _ in 0..max_iterations {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            return Some(0.0);
        }
        let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        // Both points on the equator.
        let cos_2sigma_m = if cos_sq_alpha == 0.0 {
            0.0
        } else {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        };
        let c = WGS84_F / 16.0 * cos_sq_alpha * (4.0 + WGS84_F * (4.0 - 3.0 * cos_sq_alpha));
        let previous = lambda;
        lambda = l
            + (1.0 - c)
                * WGS84_F
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m
                            + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

        if (lambda - previous).abs() < CONVERGENCE_EPSILON {
            let u_sq = cos_sq_alpha * (WGS84_A * WGS84_A - b * b) / (b * b);
            let big_a =
                1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
            let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
            let delta_sigma = big_b
                * sin_sigma
                * (cos_2sigma_m
                    + big_b / 4.0
                        * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                            - big_b / 6.0
                                * cos_2sigma_m
                                * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                                * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
            let meters = b * big_a * (sigma - delta_sigma);
            return Some(meters / 1000.0);
        }
    }
    None
}

/// A phase-one candidate awaiting exact measurement.
#[derive(Clone, Debug)]
pub struct Candidate<T> {
    pub item: T,
    pub id: i64,
    pub point: GeoPoint,
    /// Distance computed by phase one.
    pub coarse_km: f64,
}

/// Phase two: exact distances, true-radius filter, distance-then-id order.
///
/// Candidates whose geodesic does not converge keep their phase-one distance
/// for both the radius test and the sort.
pub fn refine<T>(
    candidates: Vec<Candidate<T>>,
    search: &LocationSearch,
    max_iterations: u32,
) -> Vec<(T, f64)> {
    let mut kept: Vec<(T, i64, f64)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let distance = vincenty_km(search.center, candidate.point, max_iterations)
                .unwrap_or(candidate.coarse_km);
            (distance <= search.radius_km).then_some((candidate.item, candidate.id, distance))
        })
        .collect();

    kept.sort_by(|left, right| {
        left.2
            .partial_cmp(&right.2)
            .unwrap_or(Ordering::Equal)
            .then(left.1.cmp(&right.1))
    });
    kept.into_iter()
        .map(|(item, _, distance)| (item, distance))
        .collect()
}
