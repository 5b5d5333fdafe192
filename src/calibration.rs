//! Per-device calibration curves.
//!
//! Calibration files are CSV-like: each row is `key, rawValue,
//! calibratedValue` where the key is either a normalized device address or a
//! display name. Rows are grouped per key and a cubic least-squares
//! polynomial is fit mapping raw to calibrated readings. Keys are matched
//! case-insensitively.

use crate::units::round_digits;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Minimum samples per key. A cubic fit through fewer than 4 points is
/// underdetermined, so such keys are skipped at load time.
pub const MIN_SAMPLES: usize = 4;

/// A fitted cubic polynomial.
///
/// Samples are centered and scaled before fitting so the normal equations
/// stay well conditioned for the tight clusters typical of gravity
/// calibration (raw values all near 1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Polynomial {
    coeffs: [f64; 4],
    x_mean: f64,
    x_scale: f64,
}

impl Polynomial {
    /// Fit a cubic least-squares polynomial through `(xs, ys)` samples.
    ///
    /// Returns `None` for fewer than [`MIN_SAMPLES`] samples or for
    /// degenerate input (all raw values identical).
    pub fn fit(xs: &[f64], ys: &[f64]) -> Option<Polynomial> {
        let n = xs.len();
        if n < MIN_SAMPLES || n != ys.len() {
            return None;
        }

        let x_mean = xs.iter().sum::<f64>() / n as f64;
        let variance = xs.iter().map(|x| (x - x_mean).powi(2)).sum::<f64>() / n as f64;
        let x_scale = variance.sqrt();
        if x_scale == 0.0 {
            return None;
        }

        // Power sums S_k = sum(u^k) and moments T_k = sum(y * u^k)
        // over the normalized samples u.
        let mut s = [0.0f64; 7];
        let mut t = [0.0f64; 4];
        for (x, y) in xs.iter().zip(ys) {
            let u = (x - x_mean) / x_scale;
            let mut p = 1.0;
            for k in 0..7 {
                s[k] += p;
                if k < 4 {
                    t[k] += y * p;
                }
                p *= u;
            }
        }

        // Normal equations: M a = t with M[i][j] = S[i+j]
        let mut m = [[0.0f64; 5]; 4];
        for i in 0..4 {
            for j in 0..4 {
                m[i][j] = s[i + j];
            }
            m[i][4] = t[i];
        }

        solve(&mut m).map(|coeffs| Polynomial {
            coeffs,
            x_mean,
            x_scale,
        })
    }

    /// Evaluate the polynomial at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.x_mean) / self.x_scale;
        let c = &self.coeffs;
        ((c[3] * u + c[2]) * u + c[1]) * u + c[0]
    }

    pub fn degree(&self) -> usize {
        3
    }
}

/// Gaussian elimination with partial pivoting on an augmented 4x5 matrix.
fn solve(m: &mut [[f64; 5]; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|a, b| m[*a][col].abs().total_cmp(&m[*b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in col + 1..4 {
            let factor = m[row][col] / m[col][col];
            for c in col..5 {
                m[row][c] -= factor * m[col][c];
            }
        }
    }

    let mut a = [0.0f64; 4];
    for row in (0..4).rev() {
        let mut acc = m[row][4];
        for c in row + 1..4 {
            acc -= m[row][c] * a[c];
        }
        a[row] = acc / m[row][row];
    }
    Some(a)
}

/// Split one calibration row into fields.
///
/// Keys may be double-quoted to carry spaces; legal key characters never
/// include commas, so a plain split is sufficient.
fn split_row(line: &str) -> Vec<String> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"').to_string())
        .collect()
}

/// Calibration table for one measurement type, loaded once at startup and
/// immutable afterwards.
#[derive(Debug, Default)]
pub struct Calibrator {
    cal_polys: BTreeMap<String, Polynomial>,
}

impl Calibrator {
    /// Load a calibration table from `path`, creating an empty file when
    /// missing so users have something to edit.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Calibrator> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().append(true).create(true).open(path)?;

        let content = fs::read_to_string(path)?;
        let calibrator = Self::from_content(&content);
        info!(
            "Calibration values loaded from `{}`: keys={:?}",
            path.display(),
            calibrator.cal_polys.keys().collect::<Vec<_>>()
        );
        Ok(calibrator)
    }

    /// Build a table from raw file content. Malformed rows are logged and
    /// skipped; keys with too few samples are logged and skipped.
    pub fn from_content(content: &str) -> Calibrator {
        let mut tables: BTreeMap<String, (Vec<f64>, Vec<f64>)> = BTreeMap::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let fields = split_row(line);
            if fields.len() < 3 {
                warn!("Calibration line `{}` has too few fields. Ignoring line.", line);
                continue;
            }

            let key = fields[0].to_lowercase();

            let Ok(uncal) = fields[1].parse::<f64>() else {
                warn!("Uncalibrated value `{}` not a float. Ignoring line.", fields[1]);
                continue;
            };
            let Ok(cal) = fields[2].parse::<f64>() else {
                warn!("Calibrated value `{}` not a float. Ignoring line.", fields[2]);
                continue;
            };

            let (uncals, cals) = tables.entry(key).or_default();
            uncals.push(uncal);
            cals.push(cal);
        }

        let mut cal_polys = BTreeMap::new();
        for (key, (uncals, cals)) in tables {
            match Polynomial::fit(&uncals, &cals) {
                Some(poly) => {
                    cal_polys.insert(key, poly);
                }
                None => {
                    warn!(
                        "Calibration for `{}` skipped: {} samples are not enough for a cubic fit.",
                        key,
                        uncals.len()
                    );
                }
            }
        }

        Calibrator { cal_polys }
    }

    /// Map a raw value through the first candidate key present in the table.
    ///
    /// Both addresses and display names are valid keys; callers pass
    /// `[address, name]` so an address-keyed calibration always wins.
    /// Returns `None` when no candidate has a calibration curve.
    pub fn calibrated_value(&self, candidates: &[&str], value: f64, digits: i32) -> Option<f64> {
        candidates
            .iter()
            .find_map(|key| self.cal_polys.get(&key.trim().to_lowercase()))
            .map(|poly| round_digits(poly.eval(value), digits))
    }

    /// The fitted polynomial for a key, if any.
    pub fn get(&self, key: &str) -> Option<&Polynomial> {
        self.cal_polys.get(&key.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.cal_polys.is_empty()
    }
}
