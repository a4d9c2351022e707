//! Hann-window RMS utilities shared by both analysis phases.

use std::f64::consts::PI;

/// Fills `coeffs` with Hann window coefficients for its length.
pub fn hann_window(coeffs: &mut [f64]) {
    let n = coeffs.len();
    if n == 1 {
        coeffs[0] = 1.0;
        return;
    }
    for (i, c) in coeffs.iter_mut().enumerate() {
        *c = 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos());
    }
}

/// Windowed RMS amplitude of `signal`: the window-weighted mean is removed
/// and the residual's root mean square is taken with Bessel's correction.
///
/// `signal` and `window` must be the same length; fewer than two samples
/// measure as silence.
pub fn windowed_rms(signal: &[f64], window: &[f64]) -> f64 {
    debug_assert_eq!(signal.len(), window.len());
    let length = signal.len();
    if length < 2 {
        return 0.0;
    }

    let mut mean = 0.0;
    for i in 0..length {
        mean += window[i] * signal[i];
    }
    mean /= length as f64;

    let mut rms = 0.0;
    for i in 0..length {
        let diff = window[i] * signal[i] - mean;
        rms += diff * diff;
    }
    (rms / (length - 1) as f64).sqrt()
}
