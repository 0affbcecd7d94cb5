//! Raw DMA buffer to per-channel voltage arrays.
//!
//! # Buffer layout
//!
//! A buffer holds consecutive records; within a record the two channels are
//! byte-interleaved per sample (`A0 B0 A1 B1 ...`). Records are ordered
//! waveform-fastest, then segment, then round robin:
//!
//! ```text
//! record = waveform + nbr_waveforms * (segment + nbr_segments * round_robin)
//! byte   = 2 * (sample + record_length * record) + channel
//! ```
//!
//! Codes are unsigned with 128 at 0 V:
//! `volts = counts_to_volts * (code - 128) - offset`.

use tracing::trace;

use crate::config::{AcquireMode, ValidatedConfig};
use crate::error::{AlazarError, Result};
use crate::geometry::CaptureGeometry;

const CODE_ZERO: f32 = 128.0;

/// Outcome of feeding one buffer to the [`Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reassembly {
    /// The channel arrays hold a finished acquisition unit
    Complete,
    /// More buffers of the current round robin are needed
    Incomplete,
}

impl Reassembly {
    /// True once a whole unit was written to the outputs.
    #[must_use]
    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

/// Per-configuration reassembly state.
#[derive(Debug, Clone)]
pub struct Reassembler {
    geometry: CaptureGeometry,
    mode: AcquireMode,
    counts_to_volts: f32,
    offset: f32,
    buffer_counter: u64,
    /// Round-robin scratch for the partial averager, one region per channel
    work: [Vec<f32>; 2],
}

impl Reassembler {
    /// Reassembler with volts = `counts_to_volts` * (code - 128) - `offset`.
    #[must_use]
    pub fn new(
        geometry: CaptureGeometry,
        mode: AcquireMode,
        counts_to_volts: f32,
        offset: f32,
    ) -> Self {
        let work_len = if geometry.partial_buffer && mode == AcquireMode::Averager {
            geometry.samples_per_round_robin()
        } else {
            0
        };
        Self {
            geometry,
            mode,
            counts_to_volts,
            offset,
            buffer_counter: 0,
            work: [vec![0.0; work_len], vec![0.0; work_len]],
        }
    }

    /// Reassembler using the range and offset of `config`.
    #[must_use]
    pub fn from_config(geometry: CaptureGeometry, config: &ValidatedConfig) -> Self {
        Self::new(
            geometry,
            config.mode,
            config.input_range.counts_to_volts(),
            config.vertical_offset,
        )
    }

    /// Per-channel output length.
    #[must_use]
    pub fn samples_per_acquisition(&self) -> usize {
        self.geometry.samples_per_acquisition(self.mode)
    }

    /// Buffers processed since the last [`reset`](Self::reset).
    #[must_use]
    pub fn buffer_counter(&self) -> u64 {
        self.buffer_counter
    }

    /// Restart at the first slice of a round robin.
    pub fn reset(&mut self) {
        self.buffer_counter = 0;
    }

    /// Reassemble one filled buffer into `ch1`/`ch2`.
    ///
    /// Both outputs must hold at least
    /// [`samples_per_acquisition`](Self::samples_per_acquisition) values;
    /// only that prefix is written.
    pub fn process(&mut self, raw: &[u8], ch1: &mut [f32], ch2: &mut [f32]) -> Result<Reassembly> {
        if raw.len() != self.geometry.buffer_len {
            return Err(AlazarError::Resource(format!(
                "buffer holds {} bytes, geometry expects {}",
                raw.len(),
                self.geometry.buffer_len
            )));
        }
        let needed = self.samples_per_acquisition();
        if ch1.len() < needed || ch2.len() < needed {
            return Err(AlazarError::Resource(format!(
                "channel arrays hold {}/{} samples, need {needed}",
                ch1.len(),
                ch2.len()
            )));
        }
        let ch1 = &mut ch1[..needed];
        let ch2 = &mut ch2[..needed];

        let outcome = if self.geometry.partial_buffer {
            self.process_partial(raw, ch1, ch2)
        } else {
            self.process_complete(raw, ch1, ch2);
            Reassembly::Complete
        };
        self.buffer_counter += 1;
        trace!(counter = self.buffer_counter, ?outcome, "buffer reassembled");
        Ok(outcome)
    }

    #[inline]
    fn volts(&self, code: u8) -> f32 {
        self.counts_to_volts * (f32::from(code) - CODE_ZERO) - self.offset
    }

    fn process_complete(&self, raw: &[u8], ch1: &mut [f32], ch2: &mut [f32]) {
        let g = &self.geometry;
        let l = g.record_length;

        match self.mode {
            AcquireMode::Digitizer => {
                for (i, pair) in raw.chunks_exact(2).enumerate() {
                    ch1[i] = self.volts(pair[0]);
                    ch2[i] = self.volts(pair[1]);
                }
            }
            AcquireMode::Averager => {
                ch1.fill(0.0);
                ch2.fill(0.0);
                for rr in 0..g.round_robins_per_buffer {
                    for seg in 0..g.nbr_segments {
                        let out = seg * l;
                        for wf in 0..g.nbr_waveforms {
                            let record = wf + g.nbr_waveforms * (seg + g.nbr_segments * rr);
                            let base = 2 * l * record;
                            let samples = raw[base..base + 2 * l].chunks_exact(2);
                            for (k, pair) in samples.enumerate() {
                                ch1[out + k] += self.volts(pair[0]);
                                ch2[out + k] += self.volts(pair[1]);
                            }
                        }
                    }
                }
                let n = (g.nbr_waveforms * g.round_robins_per_buffer) as f32;
                ch1.iter_mut().chain(ch2.iter_mut()).for_each(|v| *v /= n);
            }
        }
    }

    fn process_partial(&mut self, raw: &[u8], ch1: &mut [f32], ch2: &mut [f32]) -> Reassembly {
        let g = self.geometry;
        let slice = (self.buffer_counter % g.buffers_per_round_robin as u64) as usize;
        let start = slice * g.records_per_buffer * g.record_length;
        let end = start + raw.len() / 2;

        match self.mode {
            AcquireMode::Digitizer => {
                for (i, pair) in raw.chunks_exact(2).enumerate() {
                    ch1[start + i] = self.volts(pair[0]);
                    ch2[start + i] = self.volts(pair[1]);
                }
            }
            AcquireMode::Averager => {
                let [work_a, work_b] = &mut self.work;
                let pairs = raw.chunks_exact(2);
                for ((a, b), pair) in work_a[start..end]
                    .iter_mut()
                    .zip(work_b[start..end].iter_mut())
                    .zip(pairs)
                {
                    *a = self.counts_to_volts * (f32::from(pair[0]) - CODE_ZERO) - self.offset;
                    *b = self.counts_to_volts * (f32::from(pair[1]) - CODE_ZERO) - self.offset;
                }
            }
        }

        if slice + 1 < g.buffers_per_round_robin {
            return Reassembly::Incomplete;
        }

        if self.mode == AcquireMode::Averager {
            let l = g.record_length;
            ch1.fill(0.0);
            ch2.fill(0.0);
            for seg in 0..g.nbr_segments {
                let out = seg * l;
                for wf in 0..g.nbr_waveforms {
                    let src = (wf + g.nbr_waveforms * seg) * l;
                    for k in 0..l {
                        ch1[out + k] += self.work[0][src + k];
                        ch2[out + k] += self.work[1][src + k];
                    }
                }
            }
            let n = g.nbr_waveforms as f32;
            ch1.iter_mut().chain(ch2.iter_mut()).for_each(|v| *v /= n);
        }
        Reassembly::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::AcquisitionShape;
    use daq_core::limits::MAX_BUFFER_SIZE;

    const SCALE: f32 = 4.0;
    const C2V: f32 = 2.0 * SCALE / 256.0;

    fn geometry(l: usize, s: usize, w: usize, r: usize, preferred: usize) -> CaptureGeometry {
        CaptureGeometry::compute(
            AcquisitionShape {
                record_length: l,
                nbr_segments: s,
                nbr_waveforms: w,
                nbr_round_robins: r,
            },
            preferred,
            MAX_BUFFER_SIZE,
        )
        .unwrap()
    }

    /// Buffer whose every record `r` holds code `r % 256` on A and `r + 1` on B.
    fn record_ramp(g: &CaptureGeometry, first_record: usize) -> Vec<u8> {
        let mut raw = vec![0u8; g.buffer_len];
        for (i, record) in raw.chunks_exact_mut(2 * g.record_length).enumerate() {
            let code = ((first_record + i) % 256) as u8;
            for pair in record.chunks_exact_mut(2) {
                pair[0] = code;
                pair[1] = code.wrapping_add(1);
            }
        }
        raw
    }

    fn expected(code: f32) -> f32 {
        (code - 128.0) * SCALE / 128.0
    }

    #[test]
    fn test_digitizer_midscale_is_zero() {
        let g = geometry(256, 2, 2, 2, 1 << 20);
        let mut re = Reassembler::new(g, AcquireMode::Digitizer, C2V, 0.0);
        let n = re.samples_per_acquisition();
        let (mut a, mut b) = (vec![1.0; n], vec![1.0; n]);

        let raw = vec![128u8; g.buffer_len];
        assert_eq!(re.process(&raw, &mut a, &mut b).unwrap(), Reassembly::Complete);
        assert!(a.iter().chain(b.iter()).all(|&v| v == 0.0));
    }

    #[test]
    fn test_digitizer_passes_every_record() {
        let g = geometry(256, 1, 3, 2, 1 << 20);
        let mut re = Reassembler::new(g, AcquireMode::Digitizer, C2V, 0.0);
        let n = re.samples_per_acquisition();
        assert_eq!(n, 256 * 6);
        let (mut a, mut b) = (vec![0.0; n], vec![0.0; n]);

        re.process(&record_ramp(&g, 0), &mut a, &mut b).unwrap();
        for r in 0..6 {
            assert_eq!(a[r * 256], expected(r as f32));
            assert_eq!(b[r * 256 + 255], expected(r as f32 + 1.0));
        }
    }

    #[test]
    fn test_averager_complete_buffer() {
        // records: rr0 -> (s0: w0=0, w1=1) (s1: w0=2, w1=3); rr1 -> 4..7
        let g = geometry(256, 2, 2, 2, 1 << 20);
        assert_eq!(g.round_robins_per_buffer, 2);
        let mut re = Reassembler::new(g, AcquireMode::Averager, C2V, 0.0);
        let n = re.samples_per_acquisition();
        let (mut a, mut b) = (vec![0.0; n], vec![0.0; n]);

        re.process(&record_ramp(&g, 0), &mut a, &mut b).unwrap();
        // segment 0 averages records 0, 1, 4, 5
        assert!((a[0] - expected(2.5)).abs() < 1e-6);
        assert!((b[255] - expected(3.5)).abs() < 1e-6);
        // segment 1 averages records 2, 3, 6, 7
        assert!((a[256] - expected(4.5)).abs() < 1e-6);
    }

    #[test]
    fn test_offset_is_subtracted() {
        let g = geometry(256, 1, 1, 1, 1 << 20);
        let mut re = Reassembler::new(g, AcquireMode::Averager, C2V, 0.25);
        let (mut a, mut b) = (vec![0.0; 256], vec![0.0; 256]);
        re.process(&vec![128u8; g.buffer_len], &mut a, &mut b).unwrap();
        assert!(a.iter().all(|&v| (v + 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_averager_is_order_independent() {
        let g = geometry(256, 1, 1, 4, 1 << 20);
        let mut re = Reassembler::new(g, AcquireMode::Averager, C2V, 0.0);
        let (mut a1, mut b1) = (vec![0.0; 256], vec![0.0; 256]);
        let (mut a2, mut b2) = (vec![0.0; 256], vec![0.0; 256]);

        let forward = record_ramp(&g, 10);
        let record = 2 * 256;
        let mut reversed = Vec::with_capacity(forward.len());
        for chunk in forward.chunks_exact(record).rev() {
            reversed.extend_from_slice(chunk);
        }

        re.process(&forward, &mut a1, &mut b1).unwrap();
        re.process(&reversed, &mut a2, &mut b2).unwrap();
        for (x, y) in a1.iter().zip(&a2).chain(b1.iter().zip(&b2)) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_partial_digitizer_completes_on_last_slice() {
        // 4 records per round robin, 2 per buffer
        let g = geometry(256, 2, 2, 2, 1024);
        assert!(g.partial_buffer);
        assert_eq!(g.buffers_per_round_robin, 2);
        let mut re = Reassembler::new(g, AcquireMode::Digitizer, C2V, 0.0);
        let n = re.samples_per_acquisition();
        let (mut a, mut b) = (vec![0.0; n], vec![0.0; n]);

        let first = re.process(&record_ramp(&g, 0), &mut a, &mut b).unwrap();
        assert_eq!(first, Reassembly::Incomplete);
        let second = re.process(&record_ramp(&g, 2), &mut a, &mut b).unwrap();
        assert_eq!(second, Reassembly::Complete);
        for r in 0..4 {
            assert_eq!(a[r * 256 + 7], expected(r as f32));
        }

        // next round robin starts over at slice 0
        assert!(!re.process(&record_ramp(&g, 4), &mut a, &mut b).unwrap().is_complete());
        assert_eq!(re.buffer_counter(), 3);
    }

    #[test]
    fn test_partial_averager_keeps_channels_separate() {
        let g = geometry(256, 2, 2, 1, 1024);
        let mut re = Reassembler::new(g, AcquireMode::Averager, C2V, 0.0);
        let (mut a, mut b) = (vec![0.0; 512], vec![0.0; 512]);

        re.process(&record_ramp(&g, 0), &mut a, &mut b).unwrap();
        let done = re.process(&record_ramp(&g, 2), &mut a, &mut b).unwrap();
        assert!(done.is_complete());

        // segment 0 = mean(records 0, 1), segment 1 = mean(records 2, 3)
        assert!((a[0] - expected(0.5)).abs() < 1e-6);
        assert!((a[300] - expected(2.5)).abs() < 1e-6);
        assert!((b[0] - expected(1.5)).abs() < 1e-6);
        assert!((b[300] - expected(3.5)).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_short_outputs_and_wrong_buffer() {
        let g = geometry(256, 1, 1, 1, 1 << 20);
        let mut re = Reassembler::new(g, AcquireMode::Averager, C2V, 0.0);
        let (mut a, mut b) = (vec![0.0; 100], vec![0.0; 256]);
        let raw = vec![128u8; g.buffer_len];
        assert!(matches!(
            re.process(&raw, &mut a, &mut b),
            Err(AlazarError::Resource(_))
        ));

        let mut a = vec![0.0; 256];
        assert!(re.process(&raw[..10], &mut a, &mut b).is_err());
        assert_eq!(re.buffer_counter(), 0);
    }
}
