//! Great-circle distance and proximity helpers over resolved coordinates.
//!
//! Spherical Earth with the IUGG mean radius; error versus the ellipsoid is
//! below 0.5% for any pair of points.

use crate::location::{Coordinate, GeocodeError};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between `a` and `b` in meters.
pub fn distance(a: &Coordinate, b: &Coordinate) -> Result<f64, GeocodeError> {
    a.validate()?;
    b.validate()?;

    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();
    Ok(EARTH_RADIUS_M * c)
}

/// Initial bearing from `a` towards `b`, degrees clockwise from north in [0, 360).
pub fn initial_bearing(a: &Coordinate, b: &Coordinate) -> Result<f64, GeocodeError> {
    a.validate()?;
    b.validate()?;

    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    Ok((y.atan2(x).to_degrees() + 360.0) % 360.0)
}

/// Points within `radius_m` of `center`, nearest first, paired with their distance.
pub fn within_radius<'a>(
    center: &Coordinate,
    points: &'a [Coordinate],
    radius_m: f64,
) -> Result<Vec<(&'a Coordinate, f64)>, GeocodeError> {
    let mut hits = Vec::new();
    for p in points {
        let d = distance(center, p)?;
        if d <= radius_m {
            hits.push((p, d));
        }
    }
    hits.sort_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
}

/// Index and distance of the point closest to `origin`, or None for an empty slice.
pub fn nearest(origin: &Coordinate, points: &[Coordinate]) -> Result<Option<(usize, f64)>, GeocodeError> {
    let mut best: Option<(usize, f64)> = None;
    for (i, p) in points.iter().enumerate() {
        let d = distance(origin, p)?;
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }
    Ok(best)
}
