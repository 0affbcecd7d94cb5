//! AlazarTech ATS9870 digitizer driver.
//!
//! The board streams interleaved 8-bit samples for channels A and B into a
//! small pool of DMA buffers. A dedicated receive thread keeps those buffers
//! posted to the hardware, waits on them in submission order and hands each
//! filled one on. Filled buffers are reassembled into per-channel voltage
//! arrays, either averaged or passed through record by record, and either
//! polled by the caller or streamed over a pair of byte connections.
//!
//! # Architecture
//!
//! ```text
//! AcquisitionConfig ──validate──► ValidatedConfig ──► CaptureGeometry
//!                                                          │
//!  AlazarBoard::start ──► DmaArena + QueueSet ──► Receiver (alazar-rx thread)
//!                                                    │            │
//!                                           polling: ready     streaming:
//!                                                    │         Reassembler
//!                            AlazarBoard::poll ◄─────┘              │
//!                              (Reassembler)              StreamTransmitter
//! ```
//!
//! All hardware access goes through the [`AlazarApi`] trait.
//! [`SimulatedAlazar`] implements it in-process for tests and demos.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use daq_driver_alazar::{AcquisitionConfig, AlazarBoard, PollStatus, SimulatedAlazar};
//!
//! # fn main() -> daq_driver_alazar::Result<()> {
//! let mut board = AlazarBoard::new(1, Arc::new(SimulatedAlazar::new()));
//! let config = AcquisitionConfig {
//!     record_length: 256,
//!     buffer_size: 512,
//!     ..AcquisitionConfig::default()
//! };
//! let (_, params) = board.configure(1, 1, &config)?;
//!
//! let mut ch1 = vec![0.0; params.samples_per_acquisition];
//! let mut ch2 = vec![0.0; params.samples_per_acquisition];
//! board.start()?;
//! while board.poll(&mut ch1, &mut ch2)? != PollStatus::DataReady {
//!     std::thread::yield_now();
//! }
//! board.stop()?;
//! # Ok(())
//! # }
//! ```

/// SDK trait and status codes
pub mod api;
/// One board: configure, start, poll, stream, stop
pub mod board;
/// Acquisition settings and validation
pub mod config;
/// Driver error type
pub mod error;
/// Buffer layout derived from the acquisition shape
pub mod geometry;
/// Raw buffers to per-channel volts
pub mod reassembly;
/// Receive thread and its lifecycle
pub mod receiver;
/// Connected boards by id
pub mod registry;
/// In-process board simulator
pub mod sim;
/// Length-prefixed streaming over byte connections
pub mod transmit;

pub use api::{error_to_text, AlazarApi, ApiResult, ApiStatus, Version};
pub use board::{AlazarBoard, PollStatus, SystemInfo};
pub use config::{AcquireMode, AcquisitionConfig, ValidatedConfig};
pub use error::{AlazarError, Result};
pub use geometry::{AcquisitionParams, AcquisitionShape, CaptureGeometry};
pub use reassembly::{Reassembler, Reassembly};
pub use receiver::{Receiver, ReceiverSettings, ReceiverState, StartFailure, Stopped, StreamSink};
pub use registry::BoardRegistry;
pub use sim::{SimCall, SimCounters, SimulatedAlazar};
pub use transmit::{Connection, StreamTransmitter};
