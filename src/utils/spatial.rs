use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flare::spatial::{great_circle_distance, radec2lb};

/// Julian date of the Unix epoch.
pub const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(thiserror::Error, Debug)]
pub enum TimeParseError {
    #[error("could not parse '{0}' as an ISO-8601 timestamp")]
    InvalidIso(String),
}

/// Great circle distance between two points in degrees
pub fn great_circle_distance_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    great_circle_distance(ra1, dec1, ra2, dec2)
}

/// Galactic latitude (degrees) of an equatorial position (degrees).
pub fn galactic_latitude(ra: f64, dec: f64) -> f64 {
    let (_l, b) = radec2lb(ra, dec);
    b
}

/// Normalize a right ascension to [0, 360).
pub fn wrap_ra(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed difference `ra - reference` folded into [-180, 180).
pub fn ra_offset(ra: f64, reference: f64) -> f64 {
    (ra - reference + 180.0).rem_euclid(360.0) - 180.0
}

/// Convert a UTC datetime to a Julian date.
pub fn datetime_to_jd(dt: &DateTime<Utc>) -> f64 {
    UNIX_EPOCH_JD + dt.timestamp_millis() as f64 / MS_PER_DAY
}

/// Convert a Julian date to a UTC datetime (millisecond precision).
pub fn jd_to_datetime(jd: f64) -> Option<DateTime<Utc>> {
    let millis = ((jd - UNIX_EPOCH_JD) * MS_PER_DAY).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse an ISO-8601 UTC timestamp (with or without an offset) into a
/// Julian date.
pub fn iso_to_jd(value: &str) -> Result<f64, TimeParseError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime_to_jd(&dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(datetime_to_jd(&naive.and_utc()));
        }
    }
    Err(TimeParseError::InvalidIso(value.to_string()))
}

/// Current time as a Julian date.
pub fn now_jd() -> f64 {
    flare::Time::now().to_jd()
}

/// Name of a ZTF filter id.
pub fn band_name(fid: i32) -> &'static str {
    match fid {
        1 => "g",
        2 => "r",
        3 => "i",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_to_jd() {
        // J2000.0
        let jd = iso_to_jd("2000-01-01T12:00:00").unwrap();
        assert!((jd - 2_451_545.0).abs() < 1e-9);

        let jd = iso_to_jd("2019-04-25T08:18:05.017553").unwrap();
        assert!((jd - 2_458_598.845_891_4).abs() < 1e-6);

        let jd = iso_to_jd("2000-01-01T12:00:00+00:00").unwrap();
        assert!((jd - 2_451_545.0).abs() < 1e-9);

        assert!(iso_to_jd("not a date").is_err());
    }

    #[test]
    fn test_jd_roundtrip_to_datetime() {
        let dt = jd_to_datetime(2_451_545.0).unwrap();
        assert_eq!(dt.to_rfc3339(), "2000-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_ra_helpers() {
        assert_eq!(wrap_ra(-10.0), 350.0);
        assert_eq!(wrap_ra(370.0), 10.0);
        assert!((ra_offset(1.0, 359.0) - 2.0).abs() < 1e-12);
        assert!((ra_offset(359.0, 1.0) + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_galactic_latitude() {
        // galactic north pole
        let b = galactic_latitude(192.859508, 27.128336);
        assert!((b - 90.0).abs() < 0.01);
    }
}
