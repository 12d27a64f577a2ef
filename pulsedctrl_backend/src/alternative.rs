//! Secondary views of the analysed signal: the difference of alternating rows or the magnitude
//! spectrum of every row.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use pulsecompiler_backend::error::{PulsedError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlternativeDataType {
    #[default]
    None,
    /// First minus second row of an alternating measurement.
    Delta,
    /// Magnitude spectrum over the controlled variable.
    Fft,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlternativeData {
    pub data_type: AlternativeDataType,
    /// The controlled variable for `Delta`, frequencies in inverse controlled variable units for
    /// `Fft`.
    pub x: Array1<f64>,
    pub y: Array2<f64>,
}

/// Returns `None` when `data_type` is `None` or the data can not carry it (`Delta` on a single
/// row, `Fft` on fewer than two points).
pub fn compute_alternative_data(
    data_type: AlternativeDataType,
    controlled_variable: &Array1<f64>,
    signal: &Array2<f64>,
) -> Result<Option<AlternativeData>> {
    match data_type {
        AlternativeDataType::None => Ok(None),
        AlternativeDataType::Delta => {
            if signal.nrows() < 2 {
                return Ok(None);
            }
            let delta = &signal.row(0) - &signal.row(1);
            Ok(Some(AlternativeData {
                data_type,
                x: controlled_variable.clone(),
                y: delta.insert_axis(Axis(0)),
            }))
        }
        AlternativeDataType::Fft => {
            if controlled_variable.len() < 2 || signal.ncols() != controlled_variable.len() {
                return Ok(None);
            }
            let step = controlled_variable[1] - controlled_variable[0];
            if step == 0.0 || !step.is_finite() {
                return Err(PulsedError::Processing(
                    "FFT needs an evenly stepped controlled variable".to_string(),
                ));
            }
            let mut planner = FftPlanner::new();
            let mut rows = Vec::with_capacity(signal.nrows());
            let mut x = Array1::zeros(0);
            for row in signal.outer_iter() {
                let (freqs, magnitudes) = magnitude_spectrum(&mut planner, row, step.abs());
                x = freqs;
                rows.push(magnitudes);
            }
            let bins = x.len();
            let y = Array2::from_shape_fn((rows.len(), bins), |(r, k)| rows[r][k]);
            Ok(Some(AlternativeData { data_type, x, y }))
        }
    }
}

/// Mean-corrected spectrum `|X_k|` of the non-negative frequencies `k / (n * step)`.
fn magnitude_spectrum(planner: &mut FftPlanner<f64>, values: ArrayView1<f64>, step: f64) -> (Array1<f64>, Array1<f64>) {
    let n = values.len();
    let mean = values.mean().unwrap_or(0.0);
    let mut buffer: Vec<Complex<f64>> = values.iter().map(|&v| Complex::new(v - mean, 0.0)).collect();
    planner.plan_fft_forward(n).process(&mut buffer);

    let half = (n + 1) / 2;
    let freqs = Array1::from_shape_fn(half, |k| k as f64 / (n as f64 * step));
    let magnitudes = buffer.iter().take(half).map(|c| c.norm()).collect();
    (freqs, magnitudes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::f64::consts::PI;

    #[test]
    fn delta_needs_two_rows() {
        let x = array![1.0, 2.0, 3.0];
        let single = array![[1.0, 2.0, 3.0]];
        assert_eq!(compute_alternative_data(AlternativeDataType::Delta, &x, &single).unwrap(), None);

        let pair = array![[5.0, 5.0, 5.0], [1.0, 2.0, 3.0]];
        let alt = compute_alternative_data(AlternativeDataType::Delta, &x, &pair).unwrap().unwrap();
        assert_eq!(alt.y, array![[4.0, 3.0, 2.0]]);
        assert_eq!(alt.x, x);
        assert_eq!(compute_alternative_data(AlternativeDataType::None, &x, &pair).unwrap(), None);
    }

    #[test]
    fn fft_finds_the_oscillation_frequency() {
        // 64 taus 10 ns apart with a 12.5 MHz oscillation, exactly bin 8
        let n = 64;
        let step = 10e-9;
        let x = Array1::from_shape_fn(n, |i| i as f64 * step);
        let signal = Array2::from_shape_fn((2, n), |(row, i)| {
            1.0 + (row as f64 + 1.0) * (2.0 * PI * 12.5e6 * i as f64 * step).cos()
        });
        let alt = compute_alternative_data(AlternativeDataType::Fft, &x, &signal).unwrap().unwrap();
        assert_eq!(alt.x.len(), n / 2);
        assert_eq!(alt.y.shape(), &[2, n / 2]);
        assert!((alt.x[8] - 12.5e6).abs() < 1.0);

        for row in 0..2 {
            let peak = alt
                .y
                .row(row)
                .iter()
                .enumerate()
                .fold((0, 0.0), |best, (k, &m)| if m > best.1 { (k, m) } else { best });
            assert_eq!(peak.0, 8);
            // A cosine of amplitude a puts a * n / 2 into its bin
            assert!((peak.1 - (row as f64 + 1.0) * n as f64 / 2.0).abs() < 1e-9);
            // The offset is removed before the transform
            assert!(alt.y[[row, 0]].abs() < 1e-9);
        }
    }

    #[test]
    fn fft_rejects_a_constant_axis() {
        let x = array![1.0, 1.0, 1.0];
        let signal = array![[1.0, 2.0, 3.0]];
        assert!(matches!(
            compute_alternative_data(AlternativeDataType::Fft, &x, &signal),
            Err(PulsedError::Processing(_))
        ));
        let short = array![[1.0]];
        assert_eq!(
            compute_alternative_data(AlternativeDataType::Fft, &array![0.0], &short).unwrap(),
            None
        );
    }
}
