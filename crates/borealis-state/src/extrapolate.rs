//! Dead-reckoning extrapolation for display
//!
//! Pure read-path helpers: they return projected copies and never touch
//! stored state.

use borealis_core::{Aircraft, Coordinate, Timestamp, NEVER};

/// Mean earth radius in nautical miles
pub const EARTH_RADIUS_NM: f64 = 3440.065;

/// Destination after `distance_nm` along great circle bearing `heading_deg`
pub fn project(origin: Coordinate, heading_deg: f64, distance_nm: f64) -> Coordinate {
    if distance_nm == 0.0 {
        return origin;
    }

    let lat1 = origin.latitude.to_radians();
    let lon1 = origin.longitude.to_radians();
    let bearing = heading_deg.to_radians();
    let delta = distance_nm / EARTH_RADIUS_NM;

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    Coordinate {
        latitude: lat2.to_degrees(),
        longitude: normalize_longitude(lon2.to_degrees()),
    }
}

/// Wrap into [-180, 180)
fn normalize_longitude(lon: f64) -> f64 {
    (lon + 540.0).rem_euclid(360.0) - 180.0
}

/// Seconds elapsed from `since` to `now`, never negative
pub fn elapsed_seconds(since: Timestamp, now: Timestamp) -> f64 {
    let elapsed = now.signed_duration_since(since);
    (elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0).max(0.0)
}

/// Aircraft as it would be at `now`, flying straight since its last update
pub fn extrapolate(aircraft: &Aircraft, now: Timestamp) -> Aircraft {
    if aircraft.time == NEVER {
        return aircraft.clone();
    }

    let hours = elapsed_seconds(aircraft.time, now) / 3600.0;
    let distance = f64::from(aircraft.movement.speed) * hours;

    let mut projected = aircraft.clone();
    projected.state.position = project(
        aircraft.state.position,
        f64::from(aircraft.state.heading),
        distance,
    );
    projected
}
