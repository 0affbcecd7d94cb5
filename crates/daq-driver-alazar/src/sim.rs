//! Simulated ATS9870 implementing [`AlazarApi`] without hardware.
//!
//! Posted buffers complete strictly in post order. Every record of a
//! completed buffer is filled with a running record counter (mod 256) on
//! channel A and counter + 1 on channel B, sample-interleaved, and the
//! counter restarts at `before_async_read`. Waiting on any buffer other than
//! the oldest posted one fails with `ApiInvalidBuffer`, as the real driver
//! does for out-of-order waits.
//!
//! Test hooks: [`stall`](SimulatedAlazar::stall) makes every wait time out,
//! [`fail_next`](SimulatedAlazar::fail_next) injects one failing status, and
//! [`counters`](SimulatedAlazar::counters) exposes call counts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use daq_pool::{BufferHandle, DmaBuffer};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::api::{
    consts, AlazarApi, ApiResult, ApiStatus, AsyncReadParams, ChannelInfo, TriggerOperation,
    Version,
};

/// SDK calls a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCall {
    /// `AlazarGetBoardBySystemID`
    Open,
    /// Any of the configuration calls
    Configure,
    /// `AlazarBeforeAsyncRead`
    BeforeAsyncRead,
    /// `AlazarStartCapture`
    StartCapture,
    /// `AlazarAbortAsyncRead`
    Abort,
    /// `AlazarForceTrigger`
    ForceTrigger,
    /// `AlazarPostAsyncBuffer`
    Post,
    /// `AlazarWaitAsyncBufferComplete`
    Wait,
}

/// Call counts observed by the simulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    /// Buffers posted
    pub posts: u64,
    /// Wait calls, including timed-out ones
    pub waits: u64,
    /// Buffers filled and completed
    pub completions: u64,
    /// Successful `start_capture` calls
    pub starts: u64,
    /// `abort_async_read` calls
    pub aborts: u64,
    /// Software triggers issued
    pub force_triggers: u64,
}

#[derive(Default)]
struct SimState {
    posted: VecDeque<BufferHandle>,
    record_counter: u32,
    samples_per_record: u32,
    record_size: u32,
    capturing: bool,
    led: bool,
}

/// In-process stand-in for one ATS9870 board.
pub struct SimulatedAlazar {
    state: Mutex<SimState>,
    failure: Mutex<Option<(SimCall, ApiStatus)>>,
    stalled: AtomicBool,
    posts: AtomicU64,
    waits: AtomicU64,
    completions: AtomicU64,
    starts: AtomicU64,
    aborts: AtomicU64,
    force_triggers: AtomicU64,
}

impl Default for SimulatedAlazar {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAlazar {
    /// Reported acquisition memory per channel
    pub const MEMORY_SIZE_SAMPLES: u32 = 256_000_000;
    /// Reported SDK version
    pub const SDK_VERSION: Version = Version::new(6, 0, 3);
    /// Reported driver version
    pub const DRIVER_VERSION: Version = Version::new(5, 10, 6);
    /// Reported firmware version
    pub const CPLD_VERSION: Version = Version::new(1, 0, 0);

    /// Idle board with every call succeeding.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            failure: Mutex::new(None),
            stalled: AtomicBool::new(false),
            posts: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            starts: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            force_triggers: AtomicU64::new(0),
        }
    }

    /// While stalled, every wait sleeps for its full timeout and reports
    /// `ApiWaitTimeout`, as a board that never sees a trigger would.
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Make the next call of kind `call` return `status`.
    pub fn fail_next(&self, call: SimCall, status: ApiStatus) {
        *self.failure.lock() = Some((call, status));
    }

    /// Snapshot of the call counters.
    #[must_use]
    pub fn counters(&self) -> SimCounters {
        SimCounters {
            posts: self.posts.load(Ordering::SeqCst),
            waits: self.waits.load(Ordering::SeqCst),
            completions: self.completions.load(Ordering::SeqCst),
            starts: self.starts.load(Ordering::SeqCst),
            aborts: self.aborts.load(Ordering::SeqCst),
            force_triggers: self.force_triggers.load(Ordering::SeqCst),
        }
    }

    /// Buffers currently posted and not yet completed.
    #[must_use]
    pub fn posted_len(&self) -> usize {
        self.state.lock().posted.len()
    }

    /// Post-trigger record size last set through `set_record_size`.
    #[must_use]
    pub fn record_size(&self) -> u32 {
        self.state.lock().record_size
    }

    /// Between a successful `start_capture` and the next abort.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    fn injected(&self, call: SimCall) -> ApiResult<()> {
        let mut failure = self.failure.lock();
        match *failure {
            Some((target, status)) if target == call => {
                *failure = None;
                debug!(?call, %status, "simulated failure");
                Err(status)
            }
            _ => Ok(()),
        }
    }

    fn fill(state: &mut SimState, data: &mut [u8]) {
        let record_bytes = 2 * state.samples_per_record as usize;
        for record in data.chunks_exact_mut(record_bytes) {
            let value = (state.record_counter % 256) as u8;
            for pair in record.chunks_exact_mut(2) {
                pair[0] = value;
                pair[1] = value.wrapping_add(1);
            }
            state.record_counter = state.record_counter.wrapping_add(1);
        }
    }
}

impl AlazarApi for SimulatedAlazar {
    fn num_systems(&self) -> u32 {
        1
    }

    fn boards_in_system(&self, _system_id: u32) -> u32 {
        1
    }

    fn open(&self, system_id: u32, board_id: u32) -> ApiResult<()> {
        self.injected(SimCall::Open)?;
        if system_id == 0
            || system_id > self.num_systems()
            || board_id == 0
            || board_id > self.boards_in_system(system_id)
        {
            return Err(ApiStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn board_kind(&self) -> u32 {
        consts::ATS9870
    }

    fn sdk_version(&self) -> ApiResult<Version> {
        Ok(Self::SDK_VERSION)
    }

    fn driver_version(&self) -> ApiResult<Version> {
        Ok(Self::DRIVER_VERSION)
    }

    fn cpld_version(&self) -> ApiResult<Version> {
        Ok(Self::CPLD_VERSION)
    }

    fn channel_info(&self) -> ApiResult<ChannelInfo> {
        Ok(ChannelInfo {
            memory_size_samples: Self::MEMORY_SIZE_SAMPLES,
            bits_per_sample: 8,
        })
    }

    fn set_led(&self, on: bool) -> ApiResult<()> {
        self.state.lock().led = on;
        Ok(())
    }

    fn set_capture_clock(&self, _source: u32, _rate: u32, _edge: u32, _decimation: u32)
        -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn input_control(&self, _channel: u8, _coupling: u32, _range: u32, _impedance: u32)
        -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn set_bw_limit(&self, _channel: u8, _enable: bool) -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn set_external_trigger(&self, _coupling: u32, _range: u32) -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn set_trigger_operation(&self, _op: &TriggerOperation) -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn set_trigger_delay(&self, _samples: u32) -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn set_trigger_timeout(&self, _ticks: u32) -> ApiResult<()> {
        self.injected(SimCall::Configure)
    }

    fn set_record_size(&self, _pre_trigger: u32, post_trigger: u32) -> ApiResult<()> {
        self.injected(SimCall::Configure)?;
        self.state.lock().record_size = post_trigger;
        Ok(())
    }

    fn before_async_read(&self, params: &AsyncReadParams) -> ApiResult<()> {
        self.injected(SimCall::BeforeAsyncRead)?;
        if params.samples_per_record == 0 {
            return Err(ApiStatus::NULL_PARAM);
        }
        let mut state = self.state.lock();
        state.record_counter = 0;
        state.samples_per_record = params.samples_per_record;
        Ok(())
    }

    fn start_capture(&self) -> ApiResult<()> {
        self.injected(SimCall::StartCapture)?;
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.state.lock().capturing = true;
        Ok(())
    }

    fn abort_async_read(&self) -> ApiResult<()> {
        self.injected(SimCall::Abort)?;
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.capturing = false;
        state.posted.clear();
        Ok(())
    }

    fn force_trigger(&self) -> ApiResult<()> {
        self.injected(SimCall::ForceTrigger)?;
        self.force_triggers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn post_async_buffer(&self, handle: BufferHandle, _buffer: &DmaBuffer) -> ApiResult<()> {
        self.injected(SimCall::Post)?;
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.state.lock().posted.push_back(handle);
        trace!(%handle, "simulated post");
        Ok(())
    }

    fn wait_async_buffer_complete(
        &self,
        handle: BufferHandle,
        buffer: &DmaBuffer,
        timeout: Duration,
    ) -> ApiResult<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        self.injected(SimCall::Wait)?;

        if self.stalled.load(Ordering::SeqCst) {
            thread::sleep(timeout);
            return Err(ApiStatus::WAIT_TIMEOUT);
        }

        let mut state = self.state.lock();
        if state.samples_per_record == 0 {
            return Err(ApiStatus::NOT_INITIALIZED);
        }
        let Some(oldest) = state.posted.pop_front() else {
            drop(state);
            thread::sleep(timeout.min(Duration::from_millis(1)));
            return Err(ApiStatus::WAIT_TIMEOUT);
        };
        if oldest != handle {
            debug!(%handle, %oldest, "wait on a buffer that is not the oldest posted");
            return Err(ApiStatus::INVALID_BUFFER);
        }

        Self::fill(&mut state, &mut buffer.lock());
        self.completions.fetch_add(1, Ordering::SeqCst);
        trace!(%handle, records = state.record_counter, "simulated completion");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_pool::{DmaArena, QueueSet};

    fn read_params(samples_per_record: u32) -> AsyncReadParams {
        AsyncReadParams {
            channel_mask: u32::from(consts::CHANNEL_A | consts::CHANNEL_B),
            transfer_offset: 0,
            samples_per_record,
            records_per_buffer: 2,
            records_per_acquisition: 4,
            flags: consts::ADMA_EXTERNAL_STARTCAPTURE | consts::ADMA_NPT,
        }
    }

    #[test]
    fn test_fills_record_counter_pattern() {
        let sim = SimulatedAlazar::new();
        sim.before_async_read(&read_params(4)).unwrap();

        let queues = QueueSet::new(DmaArena::new(2, 2 * 4 * 2).unwrap());
        let a = queues.lease_and_post().unwrap();
        let b = queues.lease_and_post().unwrap();
        for h in [a, b] {
            sim.post_async_buffer(h, queues.buffer(h).unwrap()).unwrap();
        }

        let timeout = Duration::from_millis(10);
        sim.wait_async_buffer_complete(a, queues.buffer(a).unwrap(), timeout)
            .unwrap();
        sim.wait_async_buffer_complete(b, queues.buffer(b).unwrap(), timeout)
            .unwrap();

        let first = queues.buffer(a).unwrap().lock().clone();
        assert_eq!(first, vec![0, 1, 0, 1, 0, 1, 0, 1, 1, 2, 1, 2, 1, 2, 1, 2]);
        let second = queues.buffer(b).unwrap().lock().clone();
        assert_eq!(&second[..2], &[2, 3]);
        assert_eq!(&second[8..10], &[3, 4]);
        assert_eq!(sim.counters().completions, 2);
    }

    #[test]
    fn test_out_of_order_wait_is_rejected() {
        let sim = SimulatedAlazar::new();
        sim.before_async_read(&read_params(4)).unwrap();

        let queues = QueueSet::new(DmaArena::new(2, 16).unwrap());
        let a = queues.lease_and_post().unwrap();
        let b = queues.lease_and_post().unwrap();
        sim.post_async_buffer(a, queues.buffer(a).unwrap()).unwrap();
        sim.post_async_buffer(b, queues.buffer(b).unwrap()).unwrap();

        let err = sim
            .wait_async_buffer_complete(b, queues.buffer(b).unwrap(), Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err, ApiStatus::INVALID_BUFFER);
    }

    #[test]
    fn test_stall_times_out() {
        let sim = SimulatedAlazar::new();
        sim.before_async_read(&read_params(4)).unwrap();
        sim.stall(true);

        let queues = QueueSet::new(DmaArena::new(1, 16).unwrap());
        let a = queues.lease_and_post().unwrap();
        sim.post_async_buffer(a, queues.buffer(a).unwrap()).unwrap();

        let err = sim
            .wait_async_buffer_complete(a, queues.buffer(a).unwrap(), Duration::from_millis(5))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(sim.posted_len(), 1);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let sim = SimulatedAlazar::new();
        sim.fail_next(SimCall::StartCapture, ApiStatus::FAILED);
        assert_eq!(sim.start_capture(), Err(ApiStatus::FAILED));
        assert_eq!(sim.start_capture(), Ok(()));
        assert_eq!(sim.counters().starts, 1);
    }

    #[test]
    fn test_open_rejects_unknown_board() {
        let sim = SimulatedAlazar::new();
        assert!(sim.open(1, 1).is_ok());
        assert_eq!(sim.open(1, 2), Err(ApiStatus::INVALID_HANDLE));
        assert_eq!(sim.open(0, 1), Err(ApiStatus::INVALID_HANDLE));
    }
}
