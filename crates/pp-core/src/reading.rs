//! Raw detector batches.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PpError, PpResult};

/// One batch of shot-resolved traces from a line camera.
///
/// Rows are shots, columns are pixels (or aux channels). The shot count of
/// every matrix matches the chopper vector; construction fails otherwise.
/// A reading is never mutated after construction: background subtraction
/// produces a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorReading {
    channel_a: Array2<f64>,
    channel_b: Array2<f64>,
    aux: Array2<f64>,
    chopper: Vec<bool>,
    provides_frame_data: bool,
}

impl DetectorReading {
    /// Validate shapes and build a reading.
    ///
    /// `aux` is `shots x k`; pass an `Array2::zeros((shots, 0))` when the
    /// camera has no auxiliary channels.
    pub fn new(
        channel_a: Array2<f64>,
        channel_b: Array2<f64>,
        aux: Array2<f64>,
        chopper: Vec<bool>,
    ) -> PpResult<Self> {
        let shots = channel_a.nrows();
        if channel_b.nrows() != shots {
            return Err(PpError::InvalidArgument(format!(
                "channel_b has {} shots, channel_a has {}",
                channel_b.nrows(),
                shots
            )));
        }
        if channel_b.ncols() != channel_a.ncols() {
            return Err(PpError::InvalidArgument(format!(
                "channel_b has {} pixels, channel_a has {}",
                channel_b.ncols(),
                channel_a.ncols()
            )));
        }
        if aux.nrows() != shots {
            return Err(PpError::InvalidArgument(format!(
                "aux channels have {} shots, expected {}",
                aux.nrows(),
                shots
            )));
        }
        if chopper.len() != shots {
            return Err(PpError::InvalidArgument(format!(
                "chopper vector has {} entries, expected {}",
                chopper.len(),
                shots
            )));
        }
        Ok(Self {
            channel_a,
            channel_b,
            aux,
            chopper,
            provides_frame_data: false,
        })
    }

    pub fn with_frame_data(mut self, provides_frame_data: bool) -> Self {
        self.provides_frame_data = provides_frame_data;
        self
    }

    pub fn shots(&self) -> usize {
        self.channel_a.nrows()
    }

    pub fn pixels(&self) -> usize {
        self.channel_a.ncols()
    }

    pub fn channel_a(&self) -> &Array2<f64> {
        &self.channel_a
    }

    pub fn channel_b(&self) -> &Array2<f64> {
        &self.channel_b
    }

    pub fn aux(&self) -> &Array2<f64> {
        &self.aux
    }

    pub fn chopper(&self) -> &[bool] {
        &self.chopper
    }

    pub fn provides_frame_data(&self) -> bool {
        self.provides_frame_data
    }

    /// Return a copy with a per-pixel background removed from both channels.
    pub fn subtract_background(&self, background: &Background) -> PpResult<Self> {
        if background.pixels() != self.pixels() {
            return Err(PpError::InvalidArgument(format!(
                "background has {} pixels, reading has {}",
                background.pixels(),
                self.pixels()
            )));
        }
        Ok(Self {
            channel_a: &self.channel_a - &background.channel_a,
            channel_b: &self.channel_b - &background.channel_b,
            aux: self.aux.clone(),
            chopper: self.chopper.clone(),
            provides_frame_data: self.provides_frame_data,
        })
    }
}

/// Per-pixel dark level for both detector rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Background {
    pub channel_a: Array1<f64>,
    pub channel_b: Array1<f64>,
}

impl Background {
    pub fn zeros(pixels: usize) -> Self {
        Self {
            channel_a: Array1::zeros(pixels),
            channel_b: Array1::zeros(pixels),
        }
    }

    /// Shot-averaged spectra of a reading taken with the beams blocked.
    pub fn from_reading(reading: &DetectorReading) -> Self {
        let pixels = reading.pixels();
        Self {
            channel_a: reading
                .channel_a()
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(pixels)),
            channel_b: reading
                .channel_b()
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(pixels)),
        }
    }

    pub fn pixels(&self) -> usize {
        self.channel_a.len()
    }
}
