//! Coordinate to timezone resolution.
//!
//! Solar events are computed in UTC and presented in the zone that governs
//! the location, which is looked up from timezone boundary data.

use chrono_tz::Tz;
use std::sync::OnceLock;
use tzf_rs::DefaultFinder;

/// Determine the timezone for given coordinates using timezone boundary data.
///
/// Falls back to the `TZ` environment variable and then UTC when the
/// boundary data yields a name chrono-tz does not know (open ocean zones
/// such as `Etc/GMT+5` parse fine, so this is rare).
pub fn timezone_for(latitude: f64, longitude: f64) -> Tz {
    static FINDER: OnceLock<DefaultFinder> = OnceLock::new();
    let finder = FINDER.get_or_init(DefaultFinder::new);

    // tzf-rs takes (longitude, latitude)
    let tz_name = finder.get_tz_name(longitude, latitude);

    match tz_name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => match std::env::var("TZ") {
            Ok(tz_str) => tz_str.parse().unwrap_or(Tz::UTC),
            Err(_) => Tz::UTC,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_cities_resolve() {
        assert_eq!(timezone_for(40.7128, -74.0060), chrono_tz::America::New_York);
        assert_eq!(timezone_for(51.5074, -0.1278), chrono_tz::Europe::London);
        assert_eq!(timezone_for(35.6762, 139.6503), chrono_tz::Asia::Tokyo);
    }

    #[test]
    fn test_extreme_coordinates_do_not_panic() {
        for (lat, lon) in [(90.0, 0.0), (-90.0, 180.0), (0.0, -180.0), (66.5, 0.0)] {
            let _ = timezone_for(lat, lon);
        }
    }
}
