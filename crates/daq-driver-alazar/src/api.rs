//! Vendor SDK capability surface.
//!
//! [`AlazarApi`] lists every ATS-SDK call the pipeline consumes. The real
//! library and [`SimulatedAlazar`](crate::sim::SimulatedAlazar) both
//! implement it; nothing else in the crate talks to the SDK directly.
//!
//! Calls return [`ApiResult`]: `Ok` for `ApiSuccess`, otherwise the raw
//! [`ApiStatus`] so callers can tell an expected wait timeout apart from a
//! hard failure.

use std::fmt;
use std::time::Duration;

use daq_pool::{BufferHandle, DmaBuffer};

/// Result of a single SDK call.
pub type ApiResult<T> = std::result::Result<T, ApiStatus>;

/// Vendor `RETURN_CODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiStatus(pub u32);

impl ApiStatus {
    /// `ApiSuccess`
    pub const SUCCESS: Self = Self(512);
    /// `ApiFailed`: generic failure
    pub const FAILED: Self = Self(513);
    /// `ApiNullParam`
    pub const NULL_PARAM: Self = Self(531);
    /// `ApiNotInitialized`: board not opened
    pub const NOT_INITIALIZED: Self = Self(556);
    /// `ApiInvalidHandle`
    pub const INVALID_HANDLE: Self = Self(572);
    /// `ApiBufferNotReady`: buffer was not posted
    pub const BUFFER_NOT_READY: Self = Self(573);
    /// `ApiWaitTimeout`: the buffer did not complete in time
    pub const WAIT_TIMEOUT: Self = Self(579);
    /// `ApiWaitCanceled`: the acquisition was aborted
    pub const WAIT_CANCELED: Self = Self(580);
    /// `ApiBufferOverflow`: the board ran out of posted buffers
    pub const BUFFER_OVERFLOW: Self = Self(582);
    /// `ApiInvalidBuffer`
    pub const INVALID_BUFFER: Self = Self(583);
    /// `ApiDmaPending`
    pub const DMA_PENDING: Self = Self(585);
    /// Highest code in the vendor table
    pub const LAST_ERROR: Self = Self(592);

    /// Raw numeric value.
    #[must_use]
    pub fn code(self) -> u32 {
        self.0
    }

    /// True for `ApiSuccess`.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// The wait elapsed without the buffer completing; retry.
    #[must_use]
    pub fn is_timeout(self) -> bool {
        self == Self::WAIT_TIMEOUT
    }

    /// Symbolic name, as `AlazarErrorToText` reports it.
    #[must_use]
    pub fn text(self) -> &'static str {
        error_to_text(self)
    }

    /// Every code the vendor table knows, in numeric order.
    pub fn all() -> impl Iterator<Item = ApiStatus> {
        (Self::SUCCESS.0..=Self::LAST_ERROR.0).map(ApiStatus)
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text(), self.0)
    }
}

const ERROR_TEXT: [&str; 81] = [
    "ApiSuccess",
    "ApiFailed",
    "ApiAccessDenied",
    "ApiDmaChannelUnavailable",
    "ApiDmaChannelInvalid",
    "ApiDmaChannelTypeError",
    "ApiDmaInProgress",
    "ApiDmaDone",
    "ApiDmaPaused",
    "ApiDmaNotPaused",
    "ApiDmaCommandInvalid",
    "ApiDmaManReady",
    "ApiDmaManNotReady",
    "ApiDmaInvalidChannelPriority",
    "ApiDmaManCorrupted",
    "ApiDmaInvalidElementIndex",
    "ApiDmaNoMoreElements",
    "ApiDmaSglInvalid",
    "ApiDmaSglQueueFull",
    "ApiNullParam",
    "ApiInvalidBusIndex",
    "ApiUnsupportedFunction",
    "ApiInvalidPciSpace",
    "ApiInvalidIopSpace",
    "ApiInvalidSize",
    "ApiInvalidAddress",
    "ApiInvalidAccessType",
    "ApiInvalidIndex",
    "ApiMuNotReady",
    "ApiMuFifoEmpty",
    "ApiMuFifoFull",
    "ApiInvalidRegister",
    "ApiDoorbellClearFailed",
    "ApiInvalidUserPin",
    "ApiInvalidUserState",
    "ApiEepromNotPresent",
    "ApiEepromTypeNotSupported",
    "ApiEepromBlank",
    "ApiConfigAccessFailed",
    "ApiInvalidDeviceInfo",
    "ApiNoActiveDriver",
    "ApiInsufficientResources",
    "ApiObjectAlreadyAllocated",
    "ApiAlreadyInitialized",
    "ApiNotInitialized",
    "ApiBadConfigRegEndianMode",
    "ApiInvalidPowerState",
    "ApiPowerDown",
    "ApiFlybyNotSupported",
    "ApiNotSupportThisChannel",
    "ApiNoAction",
    "ApiHSNotSupported",
    "ApiVPDNotSupported",
    "ApiVpdNotEnabled",
    "ApiNoMoreCap",
    "ApiInvalidOffset",
    "ApiBadPinDirection",
    "ApiPciTimeout",
    "ApiDmaChannelClosed",
    "ApiDmaChannelError",
    "ApiInvalidHandle",
    "ApiBufferNotReady",
    "ApiInvalidData",
    "ApiDoNothing",
    "ApiDmaSglBuildFailed",
    "ApiPMNotSupported",
    "ApiInvalidDriverVersion",
    "ApiWaitTimeout",
    "ApiWaitCanceled",
    "ApiBufferTooSmall",
    "ApiBufferOverflow",
    "ApiInvalidBuffer",
    "ApiInvalidRecordsPerBuffer",
    "ApiDmaPending",
    "ApiLockAndProbePagesFailed",
    "ApiWaitAbandoned",
    "ApiWaitFailed",
    "ApiTransferComplete",
    "ApiPllNotLocked",
    "ApiNotSupportedInDualChannelMode",
    "ApiLastError",
];

/// Human-readable name for a status code; `"Unknown"` outside the table.
#[must_use]
pub fn error_to_text(status: ApiStatus) -> &'static str {
    status
        .0
        .checked_sub(ApiStatus::SUCCESS.0)
        .and_then(|i| ERROR_TEXT.get(i as usize))
        .copied()
        .unwrap_or("Unknown")
}

/// Register values forwarded to the SDK, named after `AlazarCmd.h`.
pub mod consts {
    /// Channel A selector bit
    pub const CHANNEL_A: u8 = 0x01;
    /// Channel B selector bit
    pub const CHANNEL_B: u8 = 0x02;

    /// Clock source: 10 MHz external reference
    pub const EXTERNAL_CLOCK_10MHZ_REF: u32 = 0x07;
    /// 1 GS/s sample rate code
    pub const SAMPLE_RATE_1000MSPS: u32 = 0x35;
    /// Sample on the rising clock edge
    pub const CLOCK_EDGE_RISING: u32 = 0;

    /// AC input coupling
    pub const AC_COUPLING: u32 = 1;
    /// DC input coupling
    pub const DC_COUPLING: u32 = 2;
    /// 50 Ω input impedance
    pub const IMPEDANCE_50_OHM: u32 = 2;

    /// ±40 mV input range
    pub const INPUT_RANGE_PM_40_MV: u32 = 0x02;
    /// ±100 mV input range
    pub const INPUT_RANGE_PM_100_MV: u32 = 0x05;
    /// ±200 mV input range
    pub const INPUT_RANGE_PM_200_MV: u32 = 0x06;
    /// ±400 mV input range
    pub const INPUT_RANGE_PM_400_MV: u32 = 0x07;
    /// ±1 V input range
    pub const INPUT_RANGE_PM_1_V: u32 = 0x0A;
    /// ±2 V input range
    pub const INPUT_RANGE_PM_2_V: u32 = 0x0B;
    /// ±4 V input range
    pub const INPUT_RANGE_PM_4_V: u32 = 0x0C;

    /// External trigger input range ±5 V
    pub const ETR_5V: u32 = 0;
    /// Trigger whenever engine J fires
    pub const TRIG_ENGINE_OP_J: u32 = 0;
    /// Trigger engine J
    pub const TRIG_ENGINE_J: u32 = 0;
    /// Trigger engine K
    pub const TRIG_ENGINE_K: u32 = 1;
    /// Trigger on channel A
    pub const TRIG_CHAN_A: u32 = 0;
    /// Trigger on the external input
    pub const TRIG_EXTERNAL: u32 = 2;
    /// Engine disabled
    pub const TRIG_DISABLE: u32 = 3;
    /// Trigger on a rising edge
    pub const TRIGGER_SLOPE_POSITIVE: u32 = 1;
    /// Trigger on a falling edge
    pub const TRIGGER_SLOPE_NEGATIVE: u32 = 2;

    /// Capture starts on `AlazarStartCapture`
    pub const ADMA_EXTERNAL_STARTCAPTURE: u32 = 0x0000_0001;
    /// No-pre-trigger records
    pub const ADMA_NPT: u32 = 0x0000_0200;

    /// ATS9850 board kind
    pub const ATS9850: u32 = 15;
    /// ATS9870 board kind
    pub const ATS9870: u32 = 16;
}

/// Name of a board kind code.
#[must_use]
pub fn board_kind_name(kind: u32) -> &'static str {
    match kind {
        consts::ATS9850 => "ATS9850",
        consts::ATS9870 => "ATS9870",
        _ => "unknown",
    }
}

/// `major.minor.revision` triple returned by the version queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    /// Major release
    pub major: u8,
    /// Minor release
    pub minor: u8,
    /// Revision within the minor release
    pub revision: u8,
}

impl Version {
    /// Version `major.minor.revision`.
    #[must_use]
    pub const fn new(major: u8, minor: u8, revision: u8) -> Self {
        Self {
            major,
            minor,
            revision,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// On-board memory and sample width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Acquisition memory per channel
    pub memory_size_samples: u32,
    /// ADC resolution
    pub bits_per_sample: u8,
}

/// Arguments of `AlazarSetTriggerOperation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOperation {
    /// How the two engines combine, e.g. [`consts::TRIG_ENGINE_OP_J`]
    pub operation: u32,
    /// First engine id
    pub engine1: u32,
    /// First engine source
    pub source1: u32,
    /// First engine slope
    pub slope1: u32,
    /// First engine level code, 128 is 0 V
    pub level1: u32,
    /// Second engine id
    pub engine2: u32,
    /// Second engine source
    pub source2: u32,
    /// Second engine slope
    pub slope2: u32,
    /// Second engine level code
    pub level2: u32,
}

/// Arguments of `AlazarBeforeAsyncRead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncReadParams {
    /// OR of [`consts::CHANNEL_A`] and [`consts::CHANNEL_B`]
    pub channel_mask: u32,
    /// Samples relative to the trigger; zero without pre-trigger
    pub transfer_offset: i64,
    /// Samples in each record
    pub samples_per_record: u32,
    /// Records filling one DMA buffer
    pub records_per_buffer: u32,
    /// Records before the board stops on its own
    pub records_per_acquisition: u32,
    /// `ADMA_*` mode flags
    pub flags: u32,
}

/// The ATS-SDK calls the acquisition pipeline needs.
///
/// One implementor instance drives one board; [`open`](Self::open) binds it
/// to a system/board id pair before any other board call.
///
/// Buffer calls receive the arena handle next to the buffer so an
/// implementation can match completions to posts without comparing raw
/// pointers.
pub trait AlazarApi: Send + Sync + 'static {
    // Enumeration
    /// Number of board systems in the machine.
    fn num_systems(&self) -> u32;
    /// Number of boards in `system_id`.
    fn boards_in_system(&self, system_id: u32) -> u32;
    /// Bind this instance to one board; must precede every board call.
    fn open(&self, system_id: u32, board_id: u32) -> ApiResult<()>;
    /// Board kind code, see [`board_kind_name`].
    fn board_kind(&self) -> u32;
    /// Version of the SDK library.
    fn sdk_version(&self) -> ApiResult<Version>;
    /// Version of the kernel driver.
    fn driver_version(&self) -> ApiResult<Version>;
    /// Version of the board CPLD firmware.
    fn cpld_version(&self) -> ApiResult<Version>;
    /// Acquisition memory and sample width.
    fn channel_info(&self) -> ApiResult<ChannelInfo>;
    /// Switch the bracket LED.
    fn set_led(&self, on: bool) -> ApiResult<()>;

    // Configuration, forwarded as validated
    /// `AlazarSetCaptureClock`.
    fn set_capture_clock(&self, source: u32, rate: u32, edge: u32, decimation: u32)
        -> ApiResult<()>;
    /// `AlazarInputControl` for one channel.
    fn input_control(&self, channel: u8, coupling: u32, range: u32, impedance: u32)
        -> ApiResult<()>;
    /// Enable or disable the 20 MHz bandwidth limit.
    fn set_bw_limit(&self, channel: u8, enable: bool) -> ApiResult<()>;
    /// Coupling and range of the external trigger input.
    fn set_external_trigger(&self, coupling: u32, range: u32) -> ApiResult<()>;
    /// `AlazarSetTriggerOperation`.
    fn set_trigger_operation(&self, op: &TriggerOperation) -> ApiResult<()>;
    /// Samples to skip after each trigger.
    fn set_trigger_delay(&self, samples: u32) -> ApiResult<()>;
    /// Auto-trigger timeout in 10 µs ticks; zero waits forever.
    fn set_trigger_timeout(&self, ticks: u32) -> ApiResult<()>;
    /// Pre- and post-trigger samples per record.
    fn set_record_size(&self, pre_trigger: u32, post_trigger: u32) -> ApiResult<()>;

    // Acquisition lifecycle
    /// Arm an asynchronous DMA acquisition.
    fn before_async_read(&self, params: &AsyncReadParams) -> ApiResult<()>;
    /// Start capturing into the posted buffers.
    fn start_capture(&self) -> ApiResult<()>;
    /// Stop the acquisition and cancel every posted buffer.
    fn abort_async_read(&self) -> ApiResult<()>;
    /// Issue a software trigger.
    fn force_trigger(&self) -> ApiResult<()>;

    /// Submit a buffer for the next DMA fill.
    fn post_async_buffer(&self, handle: BufferHandle, buffer: &DmaBuffer) -> ApiResult<()>;

    /// Block up to `timeout` for `buffer` to complete.
    ///
    /// Returns [`ApiStatus::WAIT_TIMEOUT`] when the time elapses first.
    fn wait_async_buffer_complete(
        &self,
        handle: BufferHandle,
        buffer: &DmaBuffer,
        timeout: Duration,
    ) -> ApiResult<()>;
}
