//! Shot-synchronous signal extraction.
//!
//! Converts one [`DetectorReading`] into per-pixel statistics and the
//! chopper-locked differential absorption in milli-OD:
//!
//! ```text
//! signal[p] = sign * 1000 * log10( mean(a[0::2, p]) / mean(a[1::2, p]) )
//! sign      = +1 if chopper[0] else -1
//! ```
//!
//! Everything here is pure. Non-finite intermediate results (empty means,
//! zero denominators) are replaced by `0.0` instead of being propagated.

use chrono::{DateTime, Utc};
use ndarray::{s, stack, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PpError, PpResult};
use crate::reading::DetectorReading;

/// What to do with the unmatched last shot of an odd-sized batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OddShotPolicy {
    /// Ignore the last shot when the shot count is odd.
    #[default]
    Truncate,
    /// Fail with `InvalidArgument`.
    Reject,
}

/// Derived statistics of one reading.
///
/// Built whole by [`SignalExtractor::extract`]; holders swap complete values
/// instead of patching fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRead {
    pub probe_mean: Array1<f64>,
    /// Relative standard deviation in percent.
    pub probe_std_pct: Array1<f64>,
    pub reference_mean: Array1<f64>,
    pub reference_std_pct: Array1<f64>,
    /// Differential absorption in mOD.
    pub differential_signal: Array1<f64>,
    /// `[probe_mean, reference_mean]` stacked as a `2 x pixels` matrix.
    pub spectrum_pair: Array2<f64>,
    pub aux_mean: Array1<f64>,
    pub shots: usize,
    pub acquired_at: DateTime<Utc>,
}

impl ProcessedRead {
    pub fn empty(pixels: usize) -> Self {
        Self {
            probe_mean: Array1::zeros(pixels),
            probe_std_pct: Array1::zeros(pixels),
            reference_mean: Array1::zeros(pixels),
            reference_std_pct: Array1::zeros(pixels),
            differential_signal: Array1::zeros(pixels),
            spectrum_pair: Array2::zeros((2, pixels)),
            aux_mean: Array1::zeros(0),
            shots: 0,
            acquired_at: Utc::now(),
        }
    }

    pub fn pixels(&self) -> usize {
        self.probe_mean.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalExtractor {
    pub odd_shots: OddShotPolicy,
}

impl SignalExtractor {
    pub fn new(odd_shots: OddShotPolicy) -> Self {
        Self { odd_shots }
    }

    pub fn extract(&self, reading: &DetectorReading) -> PpResult<ProcessedRead> {
        let (probe_mean, probe_std_pct) = mean_and_std_pct(reading.channel_a());
        let (reference_mean, reference_std_pct) = mean_and_std_pct(reading.channel_b());
        let signal = differential_signal(reading.channel_a(), reading.chopper(), self.odd_shots)?;

        let spectrum_pair = stack(Axis(0), &[probe_mean.view(), reference_mean.view()])
            .map_err(|e| PpError::InvalidArgument(format!("cannot stack spectra: {}", e)))?;

        let aux_mean = column_mean(reading.aux());

        Ok(ProcessedRead {
            probe_mean,
            probe_std_pct,
            reference_mean,
            reference_std_pct,
            differential_signal: signal,
            spectrum_pair,
            aux_mean,
            shots: reading.shots(),
            acquired_at: Utc::now(),
        })
    }
}

/// Replace NaN and +-Inf with zero.
#[inline]
pub fn nan_to_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn column_mean(m: &Array2<f64>) -> Array1<f64> {
    m.mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(m.ncols()))
        .mapv(nan_to_zero)
}

/// Per-column mean and relative population std (`100 * std / |mean|`).
///
/// A zero mean yields a zero std percentage. An empty batch yields zeros.
pub fn mean_and_std_pct(m: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let cols = m.ncols();
    if m.nrows() == 0 {
        return (Array1::zeros(cols), Array1::zeros(cols));
    }
    let mean = column_mean(m);
    let std = m.std_axis(Axis(0), 0.0);
    let std_pct = ndarray::Zip::from(&std)
        .and(&mean)
        .map_collect(|s, mu| nan_to_zero(100.0 * s / mu.abs()));
    (mean, std_pct)
}

/// Chopper-locked differential signal of a `shots x pixels` matrix.
///
/// Shots are split into even and odd indices. With an odd shot count the
/// last shot is ignored (`Truncate`) or the call fails (`Reject`). Fewer than
/// two usable shots produce zeros.
pub fn differential_signal(
    channel: &Array2<f64>,
    chopper: &[bool],
    policy: OddShotPolicy,
) -> PpResult<Array1<f64>> {
    let shots = channel.nrows();
    let pixels = channel.ncols();

    if shots % 2 == 1 && policy == OddShotPolicy::Reject {
        return Err(PpError::InvalidArgument(format!(
            "differential signal needs an even shot count, got {}",
            shots
        )));
    }
    let usable = shots - shots % 2;
    if usable == 0 {
        return Ok(Array1::zeros(pixels));
    }

    let sign = if chopper.first().copied().unwrap_or(true) {
        1.0
    } else {
        -1.0
    };

    let even = channel.slice(s![0..usable;2, ..]);
    let odd = channel.slice(s![1..usable;2, ..]);
    let even_mean = even
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(pixels));
    let odd_mean = odd
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(pixels));

    Ok(ndarray::Zip::from(&even_mean)
        .and(&odd_mean)
        .map_collect(|e, o| nan_to_zero(sign * 1000.0 * (e / o).log10())))
}
