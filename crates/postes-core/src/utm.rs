//! WGS84 latitude/longitude to UTM conversion.
//!
//! Field records are stored and submitted as UTM zone + easting/northing,
//! so the capture flow converts the device's GPS fix before anything is
//! persisted. The series expansion is the usual Krüger form used by most
//! UTM libraries and is accurate to well below a metre inside a zone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const K0: f64 = 0.9996;
const E: f64 = 0.00669438;
const E2: f64 = E * E;
const E3: f64 = E2 * E;
const E_P2: f64 = E / (1.0 - E);

const M1: f64 = 1.0 - E / 4.0 - 3.0 * E2 / 64.0 - 5.0 * E3 / 256.0;
const M2: f64 = 3.0 * E / 8.0 + 3.0 * E2 / 32.0 + 45.0 * E3 / 1024.0;
const M3: f64 = 15.0 * E2 / 256.0 + 45.0 * E3 / 1024.0;
const M4: f64 = 35.0 * E3 / 3072.0;

const EQUATORIAL_RADIUS: f64 = 6_378_137.0;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

const ZONE_LETTERS: &[u8] = b"CDEFGHJKLMNPQRSTUVWXX";

#[derive(Debug, Error, PartialEq)]
pub enum UtmError {
    #[error("latitude {0} out of UTM range [-80, 84]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A projected grid reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtmCoordinate {
    pub zone: u8,
    pub band: char,
    pub easting: f64,
    pub northing: f64,
}

impl UtmCoordinate {
    pub fn is_southern(&self) -> bool {
        self.band < 'N'
    }
}

/// Convert a geodetic position to UTM.
pub fn from_lat_lon(latitude: f64, longitude: f64) -> Result<UtmCoordinate, UtmError> {
    if !latitude.is_finite() || !(-80.0..=84.0).contains(&latitude) {
        return Err(UtmError::LatitudeOutOfRange(latitude));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(UtmError::LongitudeOutOfRange(longitude));
    }

    let lat_rad = latitude.to_radians();
    let lat_sin = lat_rad.sin();
    let lat_cos = lat_rad.cos();
    let lat_tan = lat_sin / lat_cos;
    let lat_tan2 = lat_tan * lat_tan;
    let lat_tan4 = lat_tan2 * lat_tan2;

    let zone = zone_number(latitude, longitude);
    let band = zone_letter(latitude);

    let central_lon = f64::from(zone - 1) * 6.0 - 180.0 + 3.0;
    let lon_delta = longitude.to_radians() - central_lon.to_radians();

    let n = EQUATORIAL_RADIUS / (1.0 - E * lat_sin * lat_sin).sqrt();
    let c = E_P2 * lat_cos * lat_cos;

    let a = lat_cos * lon_delta;
    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let m = EQUATORIAL_RADIUS
        * (M1 * lat_rad - M2 * (2.0 * lat_rad).sin() + M3 * (4.0 * lat_rad).sin()
            - M4 * (6.0 * lat_rad).sin());

    let easting = K0
        * n
        * (a + a3 / 6.0 * (1.0 - lat_tan2 + c)
            + a5 / 120.0 * (5.0 - 18.0 * lat_tan2 + lat_tan4 + 72.0 * c - 58.0 * E_P2))
        + FALSE_EASTING;

    let mut northing = K0
        * (m + n
            * lat_tan
            * (a2 / 2.0
                + a4 / 24.0 * (5.0 - lat_tan2 + 9.0 * c + 4.0 * c * c)
                + a6 / 720.0 * (61.0 - 58.0 * lat_tan2 + lat_tan4 + 600.0 * c - 330.0 * E_P2)));

    if latitude < 0.0 {
        northing += FALSE_NORTHING_SOUTH;
    }

    Ok(UtmCoordinate { zone, band, easting, northing })
}

fn zone_number(latitude: f64, longitude: f64) -> u8 {
    // Norway
    if (56.0..64.0).contains(&latitude) && (3.0..12.0).contains(&longitude) {
        return 32;
    }

    // Svalbard
    if (72.0..=84.0).contains(&latitude) && longitude >= 0.0 {
        if longitude < 9.0 {
            return 31;
        } else if longitude < 21.0 {
            return 33;
        } else if longitude < 33.0 {
            return 35;
        } else if longitude < 42.0 {
            return 37;
        }
    }

    let zone = ((longitude + 180.0) / 6.0).floor() as u8 + 1;
    zone.min(60)
}

fn zone_letter(latitude: f64) -> char {
    let index = ((latitude + 80.0) as usize) >> 3;
    ZONE_LETTERS[index.min(ZONE_LETTERS.len() - 1)] as char
}
