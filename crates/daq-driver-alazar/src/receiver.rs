//! Background receive loop keeping the DMA buffer pool in flight.
//!
//! # State machine
//!
//! ```text
//! Idle ──start──► Posting ──capture started──► Running ──stop──► Draining ──► Idle
//! ```
//!
//! - **Posting** (caller thread): lease and post the whole pool, then start
//!   the capture. Capture is never started with a partially posted pool.
//! - **Running** (receive thread): pop the oldest posted buffer, wait for it
//!   in bounded slices, then hand it on. In polling mode the buffer goes to
//!   the `ready` queue and the API thread reposts it after reassembly; in
//!   streaming mode the receive thread reassembles, transmits and reposts it
//!   itself. The loop ends once `target` buffers completed, on stop, or on
//!   the first hard failure.
//! - **Draining** (caller thread): raise the stop flag, join the thread,
//!   abort the capture and only then drain the queues, so no buffer is
//!   released while the board may still write into it.
//!
//! The stop flag is checked before every pop and before every wait slice,
//! so a stop is observed within one wait timeout.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use daq_pool::{BufferHandle, DmaBuffer, QueueSet};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::api::AlazarApi;
use crate::error::{AlazarError, CheckStatus, Result};
use crate::reassembly::Reassembler;
use crate::transmit::StreamTransmitter;

/// Sleep between polls of an empty `posted` queue.
const IDLE_POLL: Duration = Duration::from_micros(100);

/// Lifecycle of the receive loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// No acquisition; the pool is empty
    Idle = 0,
    /// Initial buffers are being posted
    Posting = 1,
    /// The receive thread is waiting on buffers
    Running = 2,
    /// Stop requested; buffers are being reclaimed
    Draining = 3,
}

impl ReceiverState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Posting,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Posting => "posting",
            Self::Running => "running",
            Self::Draining => "draining",
        };
        write!(f, "{}", label)
    }
}

/// Pool and loop parameters for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverSettings {
    /// Buffers leased and posted before capture starts
    pub pool_size: usize,
    /// Completed buffers after which the loop ends
    pub target_buffers: u64,
    /// Per-call hardware wait timeout
    pub wait_timeout: Duration,
}

/// Reassembly state and output arrays owned by the receive thread when
/// streaming.
#[derive(Debug)]
pub struct StreamSink {
    reassembler: Reassembler,
    transmitter: StreamTransmitter,
    ch1: Vec<f32>,
    ch2: Vec<f32>,
}

impl StreamSink {
    /// Sink reassembling into its own arrays before each send.
    #[must_use]
    pub fn new(reassembler: Reassembler, transmitter: StreamTransmitter) -> Self {
        let samples = reassembler.samples_per_acquisition();
        Self {
            reassembler,
            transmitter,
            ch1: vec![0.0; samples],
            ch2: vec![0.0; samples],
        }
    }

    /// Give back the transmitter and its connections.
    #[must_use]
    pub fn into_transmitter(self) -> StreamTransmitter {
        self.transmitter
    }

    fn consume(&mut self, buffer: &DmaBuffer) -> Result<()> {
        let outcome = {
            let data = buffer.lock();
            self.reassembler
                .process(&data, &mut self.ch1, &mut self.ch2)?
        };
        if outcome.is_complete() {
            self.transmitter.send(&self.ch1, &self.ch2)?;
        }
        Ok(())
    }
}

/// What a stopped receiver hands back.
#[derive(Debug)]
pub struct Stopped {
    /// Streaming state, returned so its connections can be reused
    pub sink: Option<StreamSink>,
    /// Failure that ended the loop, if it was not already taken
    pub fault: Option<AlazarError>,
    /// `AlazarAbortAsyncRead` failure during the stop itself
    pub abort: Option<AlazarError>,
    /// Buffers completed before the loop ended
    pub completed: u64,
}

impl Stopped {
    /// The abort failure if there was one, otherwise the loop fault.
    #[must_use]
    pub fn into_result(self) -> (Option<StreamSink>, Result<u64>) {
        let Self {
            sink,
            fault,
            abort,
            completed,
        } = self;
        let outcome = match (abort, fault) {
            (Some(abort), fault) => {
                if let Some(fault) = fault {
                    warn!(error = %fault, "receive loop fault superseded by abort failure");
                }
                Err(abort)
            }
            (None, Some(fault)) => Err(fault),
            (None, None) => Ok(completed),
        };
        (sink, outcome)
    }
}

/// A [`Receiver::start`] that did not get the loop running.
///
/// The capture has been aborted and the queues drained; `sink` hands the
/// streaming state back so its connections are not lost.
#[derive(Debug)]
pub struct StartFailure {
    /// Why the start failed
    pub error: AlazarError,
    /// The sink passed to `start`, if the thread never took it
    pub sink: Option<StreamSink>,
}

impl From<StartFailure> for AlazarError {
    fn from(failure: StartFailure) -> Self {
        failure.error
    }
}

struct Shared {
    stop: AtomicBool,
    running: AtomicBool,
    streaming: bool,
    completed: AtomicU64,
    state: AtomicU8,
    fault: Mutex<Option<AlazarError>>,
}

impl Shared {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ReceiverState) {
        let previous = ReceiverState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        debug!(from = %previous, to = %state, "receiver state");
    }
}

/// Handle on a running acquisition's receive thread and buffer queues.
pub struct Receiver<A: AlazarApi> {
    api: Arc<A>,
    queues: Arc<QueueSet>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Option<StreamSink>>>,
}

impl<A: AlazarApi> Receiver<A> {
    /// Post the pool, start the capture and spawn the receive thread.
    ///
    /// On failure the capture is aborted and the queues drained before
    /// returning.
    pub fn start(
        api: Arc<A>,
        queues: Arc<QueueSet>,
        settings: ReceiverSettings,
        sink: Option<StreamSink>,
    ) -> std::result::Result<Self, StartFailure> {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            streaming: sink.is_some(),
            completed: AtomicU64::new(0),
            state: AtomicU8::new(ReceiverState::Idle as u8),
            fault: Mutex::new(None),
        });

        shared.set_state(ReceiverState::Posting);
        if let Err(error) = Self::post_pool(&*api, &queues, settings.pool_size) {
            Self::abandon(&*api, &queues, &shared);
            return Err(StartFailure { error, sink });
        }

        // the thread takes the sink out; a failed spawn leaves it here
        let handoff = Arc::new(Mutex::new(sink));
        shared.running.store(true, Ordering::SeqCst);
        let spawned = {
            let api = Arc::clone(&api);
            let queues = Arc::clone(&queues);
            let shared = Arc::clone(&shared);
            let handoff = Arc::clone(&handoff);
            thread::Builder::new()
                .name("alazar-rx".to_string())
                .spawn(move || {
                    let sink = handoff.lock().take();
                    run(&*api, &queues, &shared, settings, sink)
                })
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                Self::abandon(&*api, &queues, &shared);
                let sink = handoff.lock().take();
                return Err(StartFailure {
                    error: e.into(),
                    sink,
                });
            }
        };

        info!(
            pool_size = settings.pool_size,
            target = settings.target_buffers,
            streaming = shared.streaming,
            "acquisition started"
        );

        Ok(Self {
            api,
            queues,
            shared,
            worker: Some(worker),
        })
    }

    fn post_pool(api: &A, queues: &QueueSet, pool_size: usize) -> Result<()> {
        for _ in 0..pool_size {
            post_buffer(api, queues)?;
        }
        api.start_capture().check("AlazarStartCapture")
    }

    fn abandon(api: &A, queues: &QueueSet, shared: &Shared) {
        shared.set_state(ReceiverState::Draining);
        if let Err(e) = api.abort_async_read().check("AlazarAbortAsyncRead") {
            warn!(error = %e, "abort after failed start also failed");
        }
        queues.drain();
        shared.set_state(ReceiverState::Idle);
    }

    /// Queue set the loop posts from and publishes to.
    #[must_use]
    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReceiverState {
        ReceiverState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Buffers completed by the hardware so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Whether the receive thread is still looping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True when filled buffers go to a sink instead of `ready`.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming
    }

    /// Failure that ended the receive loop, if any; reported once.
    pub fn take_fault(&self) -> Option<AlazarError> {
        self.shared.fault.lock().take()
    }

    /// Give a processed buffer back to the hardware.
    pub fn repost(&self, handle: BufferHandle) -> Result<()> {
        self.queues.push_posted(handle)?;
        self.api
            .post_async_buffer(handle, self.queues.buffer(handle)?)
            .check("AlazarPostAsyncBuffer")?;
        trace!(%handle, "buffer reposted");
        Ok(())
    }

    /// Stop the thread, abort the capture and release every buffer.
    pub fn stop(mut self) -> Stopped {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Stopped {
        self.shared.set_state(ReceiverState::Draining);
        self.shared.stop.store(true, Ordering::SeqCst);

        let mut sink = None;
        let mut panicked = false;
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(returned) => sink = returned,
                Err(e) => {
                    error!("Receive thread panicked: {:?}", e);
                    panicked = true;
                }
            }
        }

        let abort = self
            .api
            .abort_async_read()
            .check("AlazarAbortAsyncRead")
            .err();
        let released = self.queues.drain();
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_state(ReceiverState::Idle);

        let completed = self.completed();
        info!(completed, released, "acquisition stopped");
        let fault = self
            .take_fault()
            .or_else(|| panicked.then_some(AlazarError::WorkerPanicked));
        Stopped {
            sink,
            fault,
            abort,
            completed,
        }
    }
}

impl<A: AlazarApi> Drop for Receiver<A> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let (_, outcome) = self.shutdown().into_result();
            if let Err(e) = outcome {
                warn!(error = %e, "receiver shutdown on drop failed");
            }
        }
    }
}

/// Lease a buffer into `owner` + `posted`, then hand it to the hardware.
fn post_buffer<A: AlazarApi>(api: &A, queues: &QueueSet) -> Result<BufferHandle> {
    let handle = queues.lease_and_post()?;
    api.post_async_buffer(handle, queues.buffer(handle)?)
        .check("AlazarPostAsyncBuffer")?;
    debug!(%handle, "buffer posted");
    Ok(handle)
}

fn run<A: AlazarApi>(
    api: &A,
    queues: &QueueSet,
    shared: &Shared,
    settings: ReceiverSettings,
    mut sink: Option<StreamSink>,
) -> Option<StreamSink> {
    shared.set_state(ReceiverState::Running);
    match receive_loop(api, queues, shared, settings, sink.as_mut()) {
        Ok(()) => debug!(
            completed = shared.completed.load(Ordering::SeqCst),
            stopped = shared.stop_requested(),
            "receive loop finished"
        ),
        Err(e) => {
            error!(
                error = %e,
                completed = shared.completed.load(Ordering::SeqCst),
                "receive loop failed"
            );
            *shared.fault.lock() = Some(e);
        }
    }
    shared.running.store(false, Ordering::SeqCst);
    sink
}

fn receive_loop<A: AlazarApi>(
    api: &A,
    queues: &QueueSet,
    shared: &Shared,
    settings: ReceiverSettings,
    mut sink: Option<&mut StreamSink>,
) -> Result<()> {
    while shared.completed.load(Ordering::SeqCst) < settings.target_buffers {
        if shared.stop_requested() {
            return Ok(());
        }
        let Some(handle) = queues.pop_posted()? else {
            thread::sleep(IDLE_POLL);
            continue;
        };
        let buffer = queues.buffer(handle)?;

        if !wait_for_buffer(api, shared, handle, buffer, settings.wait_timeout)? {
            return Ok(());
        }

        match sink.as_deref_mut() {
            None => queues.push_ready(handle)?,
            Some(sink) => {
                queues.complete_in_place(handle)?;
                sink.consume(buffer)?;
                if shared.completed.load(Ordering::SeqCst) + 1 < settings.target_buffers {
                    queues.push_posted(handle)?;
                    api.post_async_buffer(handle, buffer)
                        .check("AlazarPostAsyncBuffer")?;
                }
            }
        }

        let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(%handle, completed, "buffer complete");
    }
    Ok(())
}

/// Wait for `buffer` in `timeout` slices. `Ok(false)` means a stop was
/// requested first.
fn wait_for_buffer<A: AlazarApi>(
    api: &A,
    shared: &Shared,
    handle: BufferHandle,
    buffer: &DmaBuffer,
    timeout: Duration,
) -> Result<bool> {
    loop {
        if shared.stop_requested() {
            return Ok(false);
        }
        match api.wait_async_buffer_complete(handle, buffer, timeout) {
            Ok(()) => return Ok(true),
            Err(status) if status.is_timeout() => {
                trace!(%handle, "wait timed out, retrying");
            }
            Err(status) => {
                return Err(AlazarError::hardware(
                    "AlazarWaitAsyncBufferComplete",
                    status,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{consts, ApiStatus, AsyncReadParams};
    use crate::sim::{SimCall, SimulatedAlazar};
    use daq_pool::DmaArena;
    use std::time::Instant;

    const RECORD: usize = 256;

    fn armed_sim() -> Arc<SimulatedAlazar> {
        let sim = Arc::new(SimulatedAlazar::new());
        sim.before_async_read(&AsyncReadParams {
            channel_mask: u32::from(consts::CHANNEL_A | consts::CHANNEL_B),
            transfer_offset: 0,
            samples_per_record: RECORD as u32,
            records_per_buffer: 1,
            records_per_acquisition: 1,
            flags: 0,
        })
        .unwrap();
        sim
    }

    fn settings(pool_size: usize, target: u64) -> ReceiverSettings {
        ReceiverSettings {
            pool_size,
            target_buffers: target,
            wait_timeout: Duration::from_millis(20),
        }
    }

    fn queues(pool: usize) -> Arc<QueueSet> {
        Arc::new(QueueSet::new(DmaArena::new(pool, 2 * RECORD).unwrap()))
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_polling_path_fills_ready_queue() {
        let sim = armed_sim();
        let rx = Receiver::start(sim.clone(), queues(4), settings(4, 4), None).unwrap();

        wait_until(|| !rx.is_running());
        assert_eq!(rx.completed(), 4);
        let census = rx.queues().census();
        assert_eq!(census.ready, 4);
        assert_eq!(census.posted, 0);
        assert_eq!(sim.counters().starts, 1);

        let stopped = rx.stop();
        assert!(stopped.fault.is_none());
        assert_eq!(stopped.completed, 4);
    }

    #[test]
    fn test_reposted_buffers_keep_loop_going() {
        let sim = armed_sim();
        let rx = Receiver::start(sim.clone(), queues(4), settings(4, 10), None).unwrap();

        let mut consumed = 0;
        while consumed < 10 {
            if let Some(handle) = rx.queues().pop_ready().unwrap() {
                consumed += 1;
                rx.repost(handle).unwrap();
            } else {
                thread::sleep(Duration::from_micros(200));
            }
        }
        wait_until(|| !rx.is_running());
        assert_eq!(rx.completed(), 10);

        let q = Arc::clone(rx.queues());
        rx.stop();
        assert!(q.census().is_empty());
    }

    #[test]
    fn test_stop_while_stalled_exits_within_a_timeout() {
        let sim = armed_sim();
        sim.stall(true);
        let q = queues(4);
        let rx = Receiver::start(sim.clone(), Arc::clone(&q), settings(4, 100), None).unwrap();
        wait_until(|| sim.counters().waits > 0);

        let begin = Instant::now();
        let stopped = rx.stop();
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert!(stopped.fault.is_none());
        assert_eq!(stopped.completed, 0);
        assert!(q.census().is_empty());
        assert_eq!(sim.counters().aborts, 1);
        assert_eq!(sim.posted_len(), 0);
    }

    #[test]
    fn test_wait_failure_ends_loop_with_fault() {
        let sim = armed_sim();
        sim.fail_next(SimCall::Wait, ApiStatus::BUFFER_OVERFLOW);
        let rx = Receiver::start(sim.clone(), queues(4), settings(4, 8), None).unwrap();

        wait_until(|| !rx.is_running());
        let fault = rx.take_fault().unwrap();
        assert_eq!(fault.status(), Some(ApiStatus::BUFFER_OVERFLOW));
        assert!(rx.stop().fault.is_none());
    }

    #[test]
    fn test_failed_start_capture_drains_pool() {
        let sim = armed_sim();
        sim.fail_next(SimCall::StartCapture, ApiStatus::FAILED);
        let q = queues(4);
        let failure = Receiver::start(sim.clone(), Arc::clone(&q), settings(4, 4), None)
            .err()
            .unwrap();
        assert_eq!(failure.error.status(), Some(ApiStatus::FAILED));
        assert!(failure.sink.is_none());
        assert!(q.census().is_empty());
        assert_eq!(sim.counters().aborts, 1);
    }

    #[test]
    fn test_drop_stops_the_thread() {
        let sim = armed_sim();
        sim.stall(true);
        let q = queues(4);
        {
            let _rx = Receiver::start(sim.clone(), Arc::clone(&q), settings(4, 100), None).unwrap();
            wait_until(|| sim.counters().waits > 0);
        }
        assert!(q.census().is_empty());
        assert_eq!(sim.counters().aborts, 1);
    }
}
