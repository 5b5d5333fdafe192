//! Physical unit conversions for Tilt readings.

/// Round to `digits` decimal places.
pub fn round_digits(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Convert a Fahrenheit temperature to Celsius, rounded to 2 decimals.
pub fn deg_f_to_c(value_f: f64) -> f64 {
    round_digits((value_f - 32.0) * 5.0 / 9.0, 2)
}

/// Convert specific gravity to degrees Plato, rounded to 3 decimals.
///
/// Empirical cubic from
/// <https://www.brewersfriend.com/plato-to-sg-conversion-chart/>
pub fn sg_to_plato(sg: f64) -> f64 {
    let plato = -616.868 + (1111.14 * sg) - (630.272 * sg * sg) + (135.997 * sg * sg * sg);
    round_digits(plato, 3)
}
