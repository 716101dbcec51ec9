//! Magnitude and distance conversions.

const SPEED_OF_LIGHT_KMS: f64 = 299_792.458;
/// Flat Lambda-CDM with the Planck 2018 parameters.
const HUBBLE_CONSTANT: f64 = 67.66;
const OMEGA_MATTER: f64 = 0.30966;
/// Simpson steps over [0, z], must be even.
const INTEGRATION_STEPS: usize = 1000;

/// Luminosity distance in Mpc of a redshift, or `None` for a negative or
/// non-finite redshift.
pub fn luminosity_distance_mpc(redshift: f64) -> Option<f64> {
    if !redshift.is_finite() || redshift < 0.0 {
        return None;
    }
    let omega_lambda = 1.0 - OMEGA_MATTER;
    let inverse_hubble =
        |z: f64| 1.0 / (OMEGA_MATTER * (1.0 + z).powi(3) + omega_lambda).sqrt();

    let step = redshift / INTEGRATION_STEPS as f64;
    let mut sum = inverse_hubble(0.0) + inverse_hubble(redshift);
    for i in 1..INTEGRATION_STEPS {
        let weight = if i % 2 == 0 { 2.0 } else { 4.0 };
        sum += weight * inverse_hubble(i as f64 * step);
    }
    let comoving_mpc = SPEED_OF_LIGHT_KMS / HUBBLE_CONSTANT * step / 3.0 * sum;
    Some((1.0 + redshift) * comoving_mpc)
}

pub fn distance_modulus(distance_mpc: f64) -> f64 {
    5.0 * ((distance_mpc * 1e6).log10() - 1.0)
}

/// Absolute magnitude of a source at `distance_mpc`, if the distance is
/// usable.
pub fn absolute_magnitude(apparent_mag: f64, distance_mpc: f64) -> Option<f64> {
    (distance_mpc.is_finite() && distance_mpc > 0.0)
        .then(|| apparent_mag - distance_modulus(distance_mpc))
}
