//! Physical conversions: local gravity, stage angle to sensor input, and
//! thermistor resistance to temperature.

use crate::sensor::SensorType;

/// International gravity formula (1967) at geodetic latitude `latitude_deg`, m/s².
pub fn international_gravity(latitude_deg: f64) -> f64 {
    let phi = latitude_deg.to_radians();
    9.780_327 * (1.0 + 0.005_302_4 * phi.sin().powi(2) - 0.000_005_8 * (2.0 * phi).sin().powi(2))
}

/// Free-air correction for `height_m` above the geoid, m/s².
pub fn free_air_correction(height_m: f64) -> f64 {
    -3.086e-6 * height_m
}

/// Local gravity at a site, used by the misalignment reductions.
pub fn local_gravity(latitude_deg: f64, height_m: f64) -> f64 {
    international_gravity(latitude_deg) + free_air_correction(height_m)
}

/// Converts a stage angle to the sensor's input quantity: g for
/// accelerometers, degrees for inclinometers.
pub fn stage_angle_to_input(angle_deg: f64, sensor_type: SensorType) -> f64 {
    match sensor_type {
        SensorType::Accelerometer => angle_deg.to_radians().sin(),
        SensorType::Inclinometer => angle_deg,
    }
}

/// NTC thermistor B-parameter equation.
///
/// `r0_ohms` is the resistance at `t0_c`; returns °C.
pub fn thermistor_to_celsius(resistance_ohms: f64, r0_ohms: f64, t0_c: f64, beta: f64) -> f64 {
    let t0_k = t0_c + 273.15;
    let inv_t = 1.0 / t0_k + (resistance_ohms / r0_ohms).ln() / beta;
    1.0 / inv_t - 273.15
}
