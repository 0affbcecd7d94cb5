//! Acquisition configuration: loading, defaults and validation.
//!
//! [`AcquisitionConfig`] is the user-facing, string-keyed form (what a TOML
//! file or the CLI provides). [`AcquisitionConfig::validate`] checks every
//! key once and produces a [`ValidatedConfig`] whose fields are already in
//! the units and register codes the SDK expects, so the board never parses
//! strings again.
//!
//! # Layering
//!
//! [`AcquisitionConfig::load`] merges, lowest priority first:
//! 1. Built-in defaults ([`AcquisitionConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `ALAZAR_`
//!    (`ALAZAR_RECORD_LENGTH=1024` sets `record_length`)

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::consts;
use crate::error::{AlazarError, Result};

/// Full range of the external trigger input (`ETR_5V`), in millivolts.
const EXTERNAL_TRIGGER_RANGE_MV: f64 = 5000.0;

/// Reference clock rate after which decimation is applied.
const REFERENCE_SAMPLE_RATE: f64 = 1.0e9;

/// Raw acquisition settings, keyed as the instrument configuration files are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// `digitizer` or `averager`
    pub acquire_mode: String,
    /// `Full` or `20MHz`
    pub bandwidth: String,
    /// Only the 10 MHz reference clock is wired up; any other value is ignored
    pub clock_type: String,
    /// Trigger delay in seconds
    pub delay: f64,
    /// Carried through for the caller; the board ignores it
    pub enabled: bool,
    /// Free-form name echoed in logs
    pub label: String,
    /// Samples per record; at least 256 and a multiple of 64
    pub record_length: u32,
    /// Segments per waveform
    pub nbr_segments: u32,
    /// Waveforms per round robin
    pub nbr_waveforms: u32,
    /// Round robins per acquisition
    pub nbr_round_robins: u32,
    /// Samples per second
    pub sampling_rate: f64,
    /// `AC` or `DC`
    pub trigger_coupling: String,
    /// Millivolts
    pub trigger_level: f64,
    /// `rising` or `falling`
    pub trigger_slope: String,
    /// `Ext` or `Int`
    pub trigger_source: String,
    /// `AC` or `DC`
    pub vertical_coupling: String,
    /// Volts, subtracted after scaling
    pub vertical_offset: f64,
    /// Full-scale input range in volts
    pub vertical_scale: f64,
    /// Preferred DMA buffer size in bytes
    pub buffer_size: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            acquire_mode: "averager".to_string(),
            bandwidth: "Full".to_string(),
            clock_type: "ref".to_string(),
            delay: 0.0,
            enabled: true,
            label: "myAlazar".to_string(),
            record_length: 4096,
            nbr_segments: 1,
            nbr_waveforms: 1,
            nbr_round_robins: 1,
            sampling_rate: 500.0e6,
            trigger_coupling: "DC".to_string(),
            trigger_level: 1000.0,
            trigger_slope: "rising".to_string(),
            trigger_source: "Ext".to_string(),
            vertical_coupling: "AC".to_string(),
            vertical_offset: 0.0,
            vertical_scale: 4.0,
            buffer_size: 8192,
        }
    }
}

impl AcquisitionConfig {
    /// Load defaults, then `path` (if given), then `ALAZAR_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(AlazarError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("ALAZAR_"));

        let config: Self = figment.extract()?;
        debug!(?config, "acquisition configuration loaded");
        Ok(config)
    }

    /// Check every field and convert it to SDK units.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        let mode: AcquireMode = self.acquire_mode.parse()?;
        let bandwidth: Bandwidth = self.bandwidth.parse()?;
        let vertical_coupling: Coupling = self.vertical_coupling.parse()?;
        let trigger_coupling: Coupling = self.trigger_coupling.parse()?;
        let trigger_slope: TriggerSlope = self.trigger_slope.parse()?;
        let trigger_source: TriggerSource = self.trigger_source.parse()?;
        let input_range = InputRange::from_scale(self.vertical_scale)?;

        if self.record_length < 256 || self.record_length % 64 != 0 {
            return Err(AlazarError::Configuration(format!(
                "record length {} must be at least 256 and a multiple of 64",
                self.record_length
            )));
        }
        for (name, value) in [
            ("nbr_segments", self.nbr_segments),
            ("nbr_waveforms", self.nbr_waveforms),
            ("nbr_round_robins", self.nbr_round_robins),
        ] {
            if value == 0 {
                return Err(AlazarError::Configuration(format!("{name} must be at least 1")));
            }
        }
        if self.buffer_size == 0 {
            return Err(AlazarError::Configuration(
                "buffer size must be greater than 0".to_string(),
            ));
        }
        if !self.vertical_offset.is_finite() {
            return Err(AlazarError::Configuration(
                "vertical offset must be finite".to_string(),
            ));
        }
        if !self.clock_type.eq_ignore_ascii_case("ref") {
            warn!(
                clock_type = %self.clock_type,
                "only the 10 MHz reference clock is supported; ignoring clock type"
            );
        }

        let decimation = decimation_for(self.sampling_rate)?;
        let trigger_level_code = trigger_level_code(self.trigger_level)?;
        let trigger_delay_samples = trigger_delay_samples(self.delay, self.sampling_rate)?;

        Ok(ValidatedConfig {
            label: self.label.clone(),
            enabled: self.enabled,
            mode,
            bandwidth,
            record_length: self.record_length as usize,
            nbr_segments: self.nbr_segments as usize,
            nbr_waveforms: self.nbr_waveforms as usize,
            nbr_round_robins: self.nbr_round_robins as usize,
            buffer_size: self.buffer_size as usize,
            sampling_rate: self.sampling_rate,
            decimation,
            vertical_coupling,
            input_range,
            vertical_offset: self.vertical_offset as f32,
            trigger_coupling,
            trigger_slope,
            trigger_source,
            trigger_level_code,
            trigger_delay_samples,
        })
    }
}

fn decimation_for(sampling_rate: f64) -> Result<u32> {
    let unsupported = || {
        AlazarError::Configuration(format!(
            "sampling rate {sampling_rate} S/s is not 1 GS/s divided by a whole number"
        ))
    };
    if !(sampling_rate.is_finite() && sampling_rate > 0.0 && sampling_rate <= REFERENCE_SAMPLE_RATE)
    {
        return Err(unsupported());
    }
    let ratio = REFERENCE_SAMPLE_RATE / sampling_rate;
    let decimation = ratio.round();
    if (ratio - decimation).abs() > 1e-9 * ratio || decimation > f64::from(u32::MAX) {
        return Err(unsupported());
    }
    Ok(decimation as u32)
}

/// Map millivolts to the 8-bit trigger level code (128 = 0 V) of the
/// ±5 V external trigger range.
fn trigger_level_code(level_mv: f64) -> Result<u32> {
    if !level_mv.is_finite() {
        return Err(AlazarError::Configuration(format!(
            "trigger level {level_mv} mV is not a number"
        )));
    }
    let code = (128.0 + 127.0 * level_mv / EXTERNAL_TRIGGER_RANGE_MV).round();
    Ok(code.clamp(0.0, 255.0) as u32)
}

fn trigger_delay_samples(delay_s: f64, sampling_rate: f64) -> Result<u32> {
    if !delay_s.is_finite() || delay_s < 0.0 {
        return Err(AlazarError::Configuration(format!(
            "trigger delay {delay_s} s must be zero or positive"
        )));
    }
    let samples = (delay_s * sampling_rate).round();
    if samples > f64::from(u32::MAX) {
        return Err(AlazarError::Configuration(format!(
            "trigger delay {delay_s} s is too long"
        )));
    }
    Ok(samples as u32)
}

/// Configuration after validation, in SDK units.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    /// Free-form name echoed in logs
    pub label: String,
    /// Carried through unchanged
    pub enabled: bool,
    /// Averaged or per-record output
    pub mode: AcquireMode,
    /// Low-pass filter setting for both channels
    pub bandwidth: Bandwidth,
    /// Samples per record
    pub record_length: usize,
    /// Segments per waveform
    pub nbr_segments: usize,
    /// Waveforms per round robin
    pub nbr_waveforms: usize,
    /// Round robins per acquisition
    pub nbr_round_robins: usize,
    /// Preferred DMA buffer size in bytes
    pub buffer_size: usize,
    /// Samples per second after decimation
    pub sampling_rate: f64,
    /// Reference clock divider
    pub decimation: u32,
    /// Input coupling for both channels
    pub vertical_coupling: Coupling,
    /// Full-scale range for both channels
    pub input_range: InputRange,
    /// Volts, subtracted after scaling
    pub vertical_offset: f32,
    /// External trigger coupling
    pub trigger_coupling: Coupling,
    /// Edge the trigger fires on
    pub trigger_slope: TriggerSlope,
    /// External input or channel A
    pub trigger_source: TriggerSource,
    /// Trigger level as an 8-bit code, 128 is 0 V
    pub trigger_level_code: u32,
    /// Trigger delay in samples
    pub trigger_delay_samples: u32,
}

/// Averaged traces or every record passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Every record converted and handed out as captured
    Digitizer,
    /// Waveforms of each round robin averaged per segment
    Averager,
}

impl FromStr for AcquireMode {
    type Err = AlazarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "digitizer" => Ok(Self::Digitizer),
            "averager" => Ok(Self::Averager),
            _ => Err(invalid("acquire mode", s)),
        }
    }
}

impl fmt::Display for AcquireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digitizer => write!(f, "digitizer"),
            Self::Averager => write!(f, "averager"),
        }
    }
}

/// Input or trigger coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    /// AC coupled
    Ac,
    /// DC coupled
    Dc,
}

impl Coupling {
    /// `*_COUPLING` register value.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Ac => consts::AC_COUPLING,
            Self::Dc => consts::DC_COUPLING,
        }
    }
}

impl FromStr for Coupling {
    type Err = AlazarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AC" => Ok(Self::Ac),
            "DC" => Ok(Self::Dc),
            _ => Err(invalid("coupling", s)),
        }
    }
}

/// Channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    /// No filter
    Full,
    /// 20 MHz low-pass filter
    Limit20MHz,
}

impl Bandwidth {
    /// Whether the 20 MHz low-pass filter is switched in.
    #[must_use]
    pub fn limited(self) -> bool {
        self == Self::Limit20MHz
    }
}

impl FromStr for Bandwidth {
    type Err = AlazarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "20mhz" => Ok(Self::Limit20MHz),
            _ => Err(invalid("bandwidth", s)),
        }
    }
}

/// Trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSlope {
    /// Fire on a rising edge
    Rising,
    /// Fire on a falling edge
    Falling,
}

impl TriggerSlope {
    /// `TRIGGER_SLOPE_*` register value.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Rising => consts::TRIGGER_SLOPE_POSITIVE,
            Self::Falling => consts::TRIGGER_SLOPE_NEGATIVE,
        }
    }
}

impl FromStr for TriggerSlope {
    type Err = AlazarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rising" => Ok(Self::Rising),
            "falling" => Ok(Self::Falling),
            _ => Err(invalid("trigger slope", s)),
        }
    }
}

/// Where the trigger comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// External trigger input
    External,
    /// Channel A
    Internal,
}

impl TriggerSource {
    /// Trigger engine J source register value.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::External => consts::TRIG_EXTERNAL,
            Self::Internal => consts::TRIG_CHAN_A,
        }
    }
}

impl FromStr for TriggerSource {
    type Err = AlazarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ext" => Ok(Self::External),
            "int" => Ok(Self::Internal),
            _ => Err(invalid("trigger source", s)),
        }
    }
}

/// Input range selected from the vertical scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputRange {
    /// Full-scale volts (±)
    pub volts: f64,
    /// `INPUT_RANGE_*` register value
    pub code: u32,
}

impl InputRange {
    const TABLE: [(f64, u32); 7] = [
        (0.04, consts::INPUT_RANGE_PM_40_MV),
        (0.1, consts::INPUT_RANGE_PM_100_MV),
        (0.2, consts::INPUT_RANGE_PM_200_MV),
        (0.4, consts::INPUT_RANGE_PM_400_MV),
        (1.0, consts::INPUT_RANGE_PM_1_V),
        (2.0, consts::INPUT_RANGE_PM_2_V),
        (4.0, consts::INPUT_RANGE_PM_4_V),
    ];

    /// Range whose full scale is exactly `volts`.
    pub fn from_scale(volts: f64) -> Result<Self> {
        Self::TABLE
            .iter()
            .find(|(v, _)| (v - volts).abs() < 1e-9)
            .map(|&(volts, code)| Self { volts, code })
            .ok_or_else(|| invalid("vertical scale", &volts.to_string()))
    }

    /// Volts per ADC count: full scale spans 256 codes.
    #[must_use]
    pub fn counts_to_volts(&self) -> f32 {
        (2.0 * self.volts / 256.0) as f32
    }
}

fn invalid(what: &str, value: &str) -> AlazarError {
    AlazarError::Configuration(format!("invalid {what} '{value}'"))
}
