//! Capture geometry: how acquisition records are packed into DMA buffers.
//!
//! An acquisition is `nbr_round_robins` repetitions of
//! `nbr_segments * nbr_waveforms` records of `record_length` samples, two
//! channels per sample, one byte per channel. The calculator prefers to put
//! a whole number of round robins in each buffer ("complete" packing). When
//! even one round robin is larger than the preferred buffer size it splits
//! each round robin across several buffers ("partial" packing).
//!
//! Both searches pick the *largest* divisor that fits. This changes how many
//! buffers are in flight, so it is part of the observable behaviour.

use crate::config::{AcquireMode, ValidatedConfig};
use crate::error::{AlazarError, Result};

/// Channels interleaved in every DMA buffer.
pub const NUM_CHANNELS: usize = 2;

/// Acquisition shape requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionShape {
    /// Samples per record
    pub record_length: usize,
    /// Segments per waveform
    pub nbr_segments: usize,
    /// Waveforms per round robin
    pub nbr_waveforms: usize,
    /// Round robins per acquisition
    pub nbr_round_robins: usize,
}

impl From<&ValidatedConfig> for AcquisitionShape {
    fn from(config: &ValidatedConfig) -> Self {
        Self {
            record_length: config.record_length,
            nbr_segments: config.nbr_segments,
            nbr_waveforms: config.nbr_waveforms,
            nbr_round_robins: config.nbr_round_robins,
        }
    }
}

/// Derived packing for one acquisition.
///
/// Exactly one of `round_robins_per_buffer >= 1` and `partial_buffer` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureGeometry {
    /// Samples per record
    pub record_length: usize,
    /// Copied from the shape
    pub nbr_segments: usize,
    /// Copied from the shape
    pub nbr_waveforms: usize,
    /// Copied from the shape
    pub nbr_round_robins: usize,
    /// Always [`NUM_CHANNELS`]
    pub num_channels: usize,
    /// Bytes per DMA buffer
    pub buffer_len: usize,
    /// Buffers needed for the whole acquisition
    pub nbr_buffers: usize,
    /// Records in one DMA buffer
    pub records_per_buffer: usize,
    /// Records over all buffers
    pub records_per_acquisition: usize,
    /// Zero in partial mode
    pub round_robins_per_buffer: usize,
    /// Zero in complete mode
    pub buffers_per_round_robin: usize,
    /// One round robin spans several buffers
    pub partial_buffer: bool,
}

/// What the caller receives from `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionParams {
    /// Length of each channel array handed out per completed unit
    pub samples_per_acquisition: usize,
    /// Completed units per acquisition
    pub number_acquisitions: usize,
}

fn divisors_desc(n: usize) -> impl Iterator<Item = usize> {
    (1..=n).rev().filter(move |d| n % d == 0)
}

fn product(factors: &[usize]) -> Result<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| AlazarError::Configuration("acquisition size overflows".to_string()))
}

impl CaptureGeometry {
    /// Pack `shape` into buffers of at most `preferred_buffer_size` bytes.
    ///
    /// `max_buffer_size` bounds a single record and, in partial mode, the
    /// round-robin work buffer.
    pub fn compute(
        shape: AcquisitionShape,
        preferred_buffer_size: usize,
        max_buffer_size: usize,
    ) -> Result<Self> {
        let AcquisitionShape {
            record_length: l,
            nbr_segments: s,
            nbr_waveforms: w,
            nbr_round_robins: r,
        } = shape;

        if l == 0 || s == 0 || w == 0 || r == 0 {
            return Err(AlazarError::Configuration(format!(
                "acquisition shape {shape:?} has a zero dimension"
            )));
        }
        if product(&[l, NUM_CHANNELS])? > max_buffer_size {
            return Err(AlazarError::Configuration(format!(
                "record length {l} does not fit the {max_buffer_size} byte buffer limit"
            )));
        }

        let round_robin_bytes = product(&[l, s, w, NUM_CHANNELS])?;
        let fitting_rr = divisors_desc(r).find(|&rr| {
            round_robin_bytes
                .checked_mul(rr)
                .is_some_and(|bytes| bytes <= preferred_buffer_size)
        });

        if let Some(rr) = fitting_rr {
            let records_per_buffer = s * w * rr;
            let nbr_buffers = r / rr;
            return Ok(Self {
                record_length: l,
                nbr_segments: s,
                nbr_waveforms: w,
                nbr_round_robins: r,
                num_channels: NUM_CHANNELS,
                buffer_len: round_robin_bytes * rr,
                nbr_buffers,
                records_per_buffer,
                records_per_acquisition: records_per_buffer * nbr_buffers,
                round_robins_per_buffer: rr,
                buffers_per_round_robin: 0,
                partial_buffer: false,
            });
        }

        let records_per_round_robin = s * w;
        let record_bytes = l * NUM_CHANNELS;
        let rec = divisors_desc(records_per_round_robin)
            .find(|&rec| record_bytes * rec <= preferred_buffer_size)
            .ok_or_else(|| {
                AlazarError::Configuration(format!(
                    "no record count fits a {preferred_buffer_size} byte buffer \
                     (record length {l})"
                ))
            })?;

        let records_per_acquisition = product(&[s, w, r])?;
        let nbr_buffers = records_per_acquisition / rec;
        let buffers_per_round_robin = nbr_buffers / r;
        if product(&[buffers_per_round_robin, rec, l])? > max_buffer_size {
            return Err(AlazarError::Configuration(format!(
                "round robin of {records_per_round_robin} records exceeds the \
                 {max_buffer_size} byte work buffer limit"
            )));
        }

        Ok(Self {
            record_length: l,
            nbr_segments: s,
            nbr_waveforms: w,
            nbr_round_robins: r,
            num_channels: NUM_CHANNELS,
            buffer_len: record_bytes * rec,
            nbr_buffers,
            records_per_buffer: rec,
            records_per_acquisition,
            round_robins_per_buffer: 0,
            buffers_per_round_robin,
            partial_buffer: true,
        })
    }

    /// Samples per channel in one round robin.
    #[must_use]
    pub fn samples_per_round_robin(&self) -> usize {
        self.record_length * self.nbr_segments * self.nbr_waveforms
    }

    /// Per-channel output length for `mode`.
    #[must_use]
    pub fn samples_per_acquisition(&self, mode: AcquireMode) -> usize {
        match mode {
            AcquireMode::Averager => self.record_length * self.nbr_segments,
            AcquireMode::Digitizer if self.partial_buffer => self.samples_per_round_robin(),
            AcquireMode::Digitizer => {
                self.samples_per_round_robin() * self.round_robins_per_buffer
            }
        }
    }

    /// Output array length and unit count for `mode`.
    #[must_use]
    pub fn acquisition_params(&self, mode: AcquireMode) -> AcquisitionParams {
        AcquisitionParams {
            samples_per_acquisition: self.samples_per_acquisition(mode),
            number_acquisitions: if self.partial_buffer {
                self.nbr_round_robins
            } else {
                self.nbr_buffers
            },
        }
    }
}
