//! One ATS9870 board: configuration, acquisition lifecycle and delivery.
//!
//! A board is driven from a single API thread. `configure` validates the
//! settings, programs the hardware and fixes the capture geometry; `start`
//! builds a fresh buffer pool and launches the [`Receiver`]. Data then
//! reaches the caller one of two ways:
//!
//! - **Polling**: [`AlazarBoard::poll`] pops a filled buffer, reassembles it
//!   into the caller's arrays and reposts it.
//! - **Streaming**: with both channels registered, the receive thread
//!   reassembles and transmits every finished unit itself.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use daq_core::limits::{pool_size_for, BUFFER_WAIT_TIMEOUT, MAX_BUFFER_SIZE};
use daq_pool::{DmaArena, QueueCensus, QueueSet};
use tracing::{debug, info};

use crate::api::{board_kind_name, consts, AlazarApi, AsyncReadParams, TriggerOperation, Version};
use crate::config::{AcquisitionConfig, ValidatedConfig};
use crate::error::{AlazarError, CheckStatus, Result};
use crate::geometry::{AcquisitionParams, CaptureGeometry};
use crate::reassembly::Reassembler;
use crate::receiver::{Receiver, ReceiverSettings, StreamSink};
use crate::transmit::{Connection, StreamTransmitter};

/// Result of a [`poll`](AlazarBoard::poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing new, or only part of a round robin arrived
    NoData,
    /// The channel arrays hold a finished acquisition unit
    DataReady,
}

/// Versions and capabilities reported by the SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    /// Board systems in the machine
    pub num_systems: u32,
    /// Boards in this board's system
    pub boards_in_system: u32,
    /// Model name, e.g. `ATS9870`
    pub board_kind: &'static str,
    /// SDK library version
    pub sdk_version: Version,
    /// Kernel driver version
    pub driver_version: Version,
    /// Board firmware version
    pub cpld_version: Version,
    /// Acquisition memory per channel
    pub memory_size_samples: u32,
    /// ADC resolution
    pub bits_per_sample: u8,
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} SDK {} driver {} CPLD {} memory {} samples {} bits/sample",
            self.board_kind,
            self.sdk_version,
            self.driver_version,
            self.cpld_version,
            self.memory_size_samples,
            self.bits_per_sample
        )
    }
}

struct Armed {
    config: ValidatedConfig,
    geometry: CaptureGeometry,
    params: AcquisitionParams,
    reassembler: Reassembler,
}

/// Handle on one digitizer board.
pub struct AlazarBoard<A: AlazarApi> {
    board_id: u32,
    api: Arc<A>,
    armed: Option<Armed>,
    receiver: Option<Receiver<A>>,
    channels: [Option<Connection>; 2],
    wait_timeout: Duration,
}

impl<A: AlazarApi> AlazarBoard<A> {
    /// Unconfigured board `board_id` driven through `api`.
    pub fn new(board_id: u32, api: Arc<A>) -> Self {
        Self {
            board_id,
            api,
            armed: None,
            receiver: None,
            channels: [None, None],
            wait_timeout: BUFFER_WAIT_TIMEOUT,
        }
    }

    /// Override the per-call hardware wait timeout (and so the worst-case
    /// stop latency).
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// 1-based id within the system.
    #[must_use]
    pub fn board_id(&self) -> u32 {
        self.board_id
    }

    /// The SDK binding, shared with the receive thread.
    #[must_use]
    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    /// Validate `config`, program the board and compute the capture geometry.
    pub fn configure(
        &mut self,
        system_id: u32,
        board_id: u32,
        config: &AcquisitionConfig,
    ) -> Result<(CaptureGeometry, AcquisitionParams)> {
        if self.receiver.is_some() {
            return Err(AlazarError::Busy);
        }
        self.armed = None;

        let validated = config.validate()?;
        self.api
            .open(system_id, board_id)
            .check("AlazarGetBoardBySystemID")?;
        let geometry = CaptureGeometry::compute(
            (&validated).into(),
            validated.buffer_size,
            MAX_BUFFER_SIZE,
        )?;
        self.program(&validated)?;

        let params = geometry.acquisition_params(validated.mode);
        let reassembler = Reassembler::from_config(geometry, &validated);

        info!(
            board_id = self.board_id,
            label = %validated.label,
            mode = %validated.mode,
            buffer_len = geometry.buffer_len,
            nbr_buffers = geometry.nbr_buffers,
            partial = geometry.partial_buffer,
            samples_per_acquisition = params.samples_per_acquisition,
            number_acquisitions = params.number_acquisitions,
            "board configured"
        );

        self.armed = Some(Armed {
            config: validated,
            geometry,
            params,
            reassembler,
        });
        Ok((geometry, params))
    }

    fn program(&self, cfg: &ValidatedConfig) -> Result<()> {
        let api = &*self.api;
        api.set_capture_clock(
            consts::EXTERNAL_CLOCK_10MHZ_REF,
            consts::SAMPLE_RATE_1000MSPS,
            consts::CLOCK_EDGE_RISING,
            cfg.decimation,
        )
        .check("AlazarSetCaptureClock")?;

        for channel in [consts::CHANNEL_A, consts::CHANNEL_B] {
            api.input_control(
                channel,
                cfg.vertical_coupling.code(),
                cfg.input_range.code,
                consts::IMPEDANCE_50_OHM,
            )
            .check("AlazarInputControl")?;
            api.set_bw_limit(channel, cfg.bandwidth.limited())
                .check("AlazarSetBWLimit")?;
        }

        api.set_trigger_operation(&TriggerOperation {
            operation: consts::TRIG_ENGINE_OP_J,
            engine1: consts::TRIG_ENGINE_J,
            source1: cfg.trigger_source.code(),
            slope1: cfg.trigger_slope.code(),
            level1: cfg.trigger_level_code,
            engine2: consts::TRIG_ENGINE_K,
            source2: consts::TRIG_DISABLE,
            slope2: consts::TRIGGER_SLOPE_POSITIVE,
            level2: 128,
        })
        .check("AlazarSetTriggerOperation")?;
        api.set_external_trigger(cfg.trigger_coupling.code(), consts::ETR_5V)
            .check("AlazarSetExternalTrigger")?;
        api.set_trigger_delay(cfg.trigger_delay_samples)
            .check("AlazarSetTriggerDelay")?;
        // 0 = wait for a trigger forever
        api.set_trigger_timeout(0).check("AlazarSetTriggerTimeOut")?;
        api.set_record_size(0, to_u32(cfg.record_length, "record length")?)
            .check("AlazarSetRecordSize")?;

        debug!(
            decimation = cfg.decimation,
            input_range = cfg.input_range.code,
            trigger_level = cfg.trigger_level_code,
            trigger_delay = cfg.trigger_delay_samples,
            "board programmed"
        );
        Ok(())
    }

    /// Arm the capture and start the receive thread.
    pub fn start(&mut self) -> Result<()> {
        if self.receiver.is_some() {
            return Err(AlazarError::Busy);
        }
        let armed = self.armed.as_mut().ok_or(AlazarError::NotConfigured)?;
        let g = armed.geometry;

        let streaming = match &self.channels {
            [Some(_), Some(_)] => true,
            [None, None] => false,
            _ => {
                return Err(AlazarError::Configuration(
                    "streaming needs both channels registered".to_string(),
                ))
            }
        };

        let read = AsyncReadParams {
            channel_mask: u32::from(consts::CHANNEL_A | consts::CHANNEL_B),
            transfer_offset: 0,
            samples_per_record: to_u32(g.record_length, "record length")?,
            records_per_buffer: to_u32(g.records_per_buffer, "records per buffer")?,
            records_per_acquisition: to_u32(g.records_per_acquisition, "records per acquisition")?,
            flags: consts::ADMA_EXTERNAL_STARTCAPTURE | consts::ADMA_NPT,
        };
        self.api
            .before_async_read(&read)
            .check("AlazarBeforeAsyncRead")?;

        armed.reassembler.reset();
        let pool_size = pool_size_for(g.nbr_buffers);
        let queues = Arc::new(QueueSet::new(DmaArena::new(pool_size, g.buffer_len)?));

        // connections leave `channels` only once nothing else can fail first
        let sink = if streaming {
            let [a, b] = std::mem::take(&mut self.channels);
            a.zip(b).map(|(a, b)| {
                StreamSink::new(armed.reassembler.clone(), StreamTransmitter::new(a, b))
            })
        } else {
            None
        };

        let settings = ReceiverSettings {
            pool_size,
            target_buffers: g.nbr_buffers as u64,
            wait_timeout: self.wait_timeout,
        };
        match Receiver::start(Arc::clone(&self.api), queues, settings, sink) {
            Ok(receiver) => self.receiver = Some(receiver),
            Err(failure) => {
                restore_channels(&mut self.channels, failure.sink);
                return Err(failure.error);
            }
        }
        info!(board_id = self.board_id, label = %armed.config.label, "acquisition running");
        Ok(())
    }

    /// Reassemble the next filled buffer into `ch1`/`ch2`, if there is one.
    ///
    /// Both arrays must hold at least `samples_per_acquisition` values.
    pub fn poll(&mut self, ch1: &mut [f32], ch2: &mut [f32]) -> Result<PollStatus> {
        let armed = self.armed.as_mut().ok_or(AlazarError::NotConfigured)?;
        let needed = armed.params.samples_per_acquisition;
        if ch1.len() < needed || ch2.len() < needed {
            return Err(AlazarError::Resource(format!(
                "channel arrays must hold {needed} samples"
            )));
        }
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(PollStatus::NoData);
        };
        if receiver.is_streaming() {
            return Err(AlazarError::Configuration(
                "poll is not available while channels are registered".to_string(),
            ));
        }
        if let Some(fault) = receiver.take_fault() {
            return Err(fault);
        }

        let queues = receiver.queues();
        let Some(handle) = queues.pop_ready()? else {
            return Ok(PollStatus::NoData);
        };
        let outcome = {
            let data = queues.buffer(handle)?.lock();
            armed.reassembler.process(&data, ch1, ch2)
        };
        receiver.repost(handle)?;

        Ok(if outcome?.is_complete() {
            PollStatus::DataReady
        } else {
            PollStatus::NoData
        })
    }

    /// Stop the acquisition and release every buffer.
    ///
    /// Returns the failure that ended the receive loop, if there was one.
    /// Registered connections survive a stop.
    pub fn stop(&mut self) -> Result<()> {
        let Some(receiver) = self.receiver.take() else {
            return Ok(());
        };
        let (sink, outcome) = receiver.stop().into_result();
        restore_channels(&mut self.channels, sink);
        match &outcome {
            Ok(completed) => info!(board_id = self.board_id, completed, "board stopped"),
            Err(e) => info!(board_id = self.board_id, error = %e, "board stopped after failure"),
        }
        outcome.map(|_| ())
    }

    /// Issue one software trigger.
    pub fn force_trigger(&self) -> Result<()> {
        self.api.force_trigger().check("AlazarForceTrigger")
    }

    /// Attach the connection channel `channel` (1 or 2) streams to.
    pub fn register_channel(&mut self, channel: usize, connection: Connection) -> Result<()> {
        if self.receiver.is_some() {
            return Err(AlazarError::Busy);
        }
        let slot = match channel {
            1 | 2 => &mut self.channels[channel - 1],
            _ => {
                return Err(AlazarError::Configuration(format!(
                    "channel {channel} does not exist; use 1 or 2"
                )))
            }
        };
        debug!(board_id = self.board_id, channel, window = connection.window(), "channel registered");
        *slot = Some(connection);
        Ok(())
    }

    /// Drop both streaming connections; later acquisitions poll.
    pub fn unregister_channels(&mut self) -> Result<()> {
        if self.receiver.is_some() {
            return Err(AlazarError::Busy);
        }
        self.channels = [None, None];
        Ok(())
    }

    /// Query and log the SDK, driver and board details.
    pub fn sys_info(&self) -> Result<SystemInfo> {
        let api = &*self.api;
        let channel = api.channel_info().check("AlazarGetChannelInfo")?;
        let info = SystemInfo {
            num_systems: api.num_systems(),
            boards_in_system: api.boards_in_system(1),
            board_kind: board_kind_name(api.board_kind()),
            sdk_version: api.sdk_version().check("AlazarGetSDKVersion")?,
            driver_version: api.driver_version().check("AlazarGetDriverVersion")?,
            cpld_version: api.cpld_version().check("AlazarGetCPLDVersion")?,
            memory_size_samples: channel.memory_size_samples,
            bits_per_sample: channel.bits_per_sample,
        };

        info!(
            board_id = self.board_id,
            systems = info.num_systems,
            boards = info.boards_in_system,
            kind = info.board_kind,
            sdk = %info.sdk_version,
            driver = %info.driver_version,
            cpld = %info.cpld_version,
            memory_samples = info.memory_size_samples,
            bits_per_sample = info.bits_per_sample,
            "board information"
        );
        Ok(info)
    }

    /// Blink the front-panel LED `times` times.
    pub fn flash_led(&self, times: u32, period: Duration) -> Result<()> {
        let half = period / 2;
        for _ in 0..times {
            self.api.set_led(true).check("AlazarSetLED")?;
            thread::sleep(half);
            self.api.set_led(false).check("AlazarSetLED")?;
            thread::sleep(half);
        }
        Ok(())
    }

    /// An acquisition was started and not yet stopped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// The receive thread is still looping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.receiver.as_ref().is_some_and(Receiver::is_running)
    }

    /// Buffers completed in the current acquisition.
    #[must_use]
    pub fn completed_buffers(&self) -> u64 {
        self.receiver.as_ref().map_or(0, Receiver::completed)
    }

    /// Geometry of the last successful `configure`.
    #[must_use]
    pub fn geometry(&self) -> Option<&CaptureGeometry> {
        self.armed.as_ref().map(|a| &a.geometry)
    }

    /// Array length and unit count of the last successful `configure`.
    #[must_use]
    pub fn acquisition_params(&self) -> Option<AcquisitionParams> {
        self.armed.as_ref().map(|a| a.params)
    }

    /// Where the pool buffers are while an acquisition is active.
    #[must_use]
    pub fn census(&self) -> Option<QueueCensus> {
        self.receiver.as_ref().map(|r| r.queues().census())
    }
}

/// Put a returned sink's connections back for the next acquisition.
fn restore_channels(channels: &mut [Option<Connection>; 2], sink: Option<StreamSink>) {
    if let Some(sink) = sink {
        let [a, b] = sink.into_transmitter().into_connections();
        *channels = [Some(a), Some(b)];
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| AlazarError::Configuration(format!("{what} {value} exceeds the SDK range")))
}
