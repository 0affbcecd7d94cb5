//! `alazar-acq`: command-line front end for the ATS9870 acquisition pipeline.
//!
//! # Usage
//!
//! Acquire two averaged round robins to `ch1.dat`/`ch2.dat`:
//! ```bash
//! alazar-acq acquire --mode averager --roundrobins 2 --out-dir /tmp/run1
//! ```
//!
//! Stream every finished unit to two TCP listeners:
//! ```bash
//! alazar-acq stream --ch1 127.0.0.1:5001 --ch2 127.0.0.1:5002
//! ```
//!
//! Print the SDK status table:
//! ```bash
//! alazar-acq errors
//! ```
//!
//! Boards are simulated in-process; `RUST_LOG` controls verbosity.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | hardware, resource or transmission failure |
//! | 2 | invalid configuration |
//! | 3 | board busy |
//! | 4 | timed out; rerunning unchanged may succeed |

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use daq_core::error::{AppResult, DaqError, DriverError, DriverErrorKind};
use daq_driver_alazar::{
    AcquisitionConfig, AlazarBoard, ApiStatus, BoardRegistry, Connection, PollStatus,
    SimulatedAlazar,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "alazar-acq")]
#[command(about = "Acquire or stream from an AlazarTech ATS9870 digitizer", long_about = None)]
struct Cli {
    /// Append log output to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll finished units and write them to ch1.dat / ch2.dat
    Acquire {
        #[command(flatten)]
        acquisition: AcquisitionArgs,

        /// Directory for the channel files
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Stream finished units over two TCP connections
    Stream {
        #[command(flatten)]
        acquisition: AcquisitionArgs,

        /// Channel A destination (host:port)
        #[arg(long)]
        ch1: String,

        /// Channel B destination (host:port)
        #[arg(long)]
        ch2: String,

        /// Chunk size in bytes; defaults to the socket receive buffer
        #[arg(long)]
        window: Option<usize>,
    },

    /// Print every SDK status code with its name
    Errors,
}

/// Options shared by `acquire` and `stream`. Flags override the config file.
#[derive(Args)]
struct AcquisitionArgs {
    /// TOML acquisition configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Board id (1-based)
    #[arg(long, default_value = "1")]
    board: u32,

    /// `averager` or `digitizer`
    #[arg(long)]
    mode: Option<String>,

    #[arg(long)]
    segments: Option<u32>,

    #[arg(long)]
    waveforms: Option<u32>,

    #[arg(long)]
    roundrobins: Option<u32>,

    /// Samples per record
    #[arg(long)]
    recordlength: Option<u32>,

    /// Preferred DMA buffer size in bytes
    #[arg(long)]
    buffer: Option<u32>,

    /// Samples per second
    #[arg(long)]
    sampling_rate: Option<f64>,

    /// Give up after this many 1 ms polls
    #[arg(long, default_value = "10000")]
    timeout: u64,
}

impl AcquisitionArgs {
    fn load(&self) -> AppResult<AcquisitionConfig> {
        let mut config = AcquisitionConfig::load(self.config.as_deref())?;
        if let Some(mode) = &self.mode {
            config.acquire_mode.clone_from(mode);
        }
        if let Some(v) = self.segments {
            config.nbr_segments = v;
        }
        if let Some(v) = self.waveforms {
            config.nbr_waveforms = v;
        }
        if let Some(v) = self.roundrobins {
            config.nbr_round_robins = v;
        }
        if let Some(v) = self.recordlength {
            config.record_length = v;
        }
        if let Some(v) = self.buffer {
            config.buffer_size = v;
        }
        if let Some(v) = self.sampling_rate {
            config.sampling_rate = v;
        }
        Ok(config)
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let outcome = match cli.command {
        Commands::Acquire {
            acquisition,
            out_dir,
        } => acquire(&acquisition, &out_dir),
        Commands::Stream {
            acquisition,
            ch1,
            ch2,
            window,
        } => stream(&acquisition, &ch1, &ch2, window),
        Commands::Errors => {
            print_error_table(&mut std::io::stdout().lock()).map_err(DaqError::from)
        }
    };
    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, kind = ?e.driver_kind(), "command failed");
            eprintln!("Error: {e}");
            Ok(ExitCode::from(exit_status(&e)))
        }
    }
}

/// Process exit status for a failed command.
fn exit_status(err: &DaqError) -> u8 {
    match err {
        DaqError::Configuration(_) => 2,
        DaqError::DeviceBusy => 3,
        DaqError::Driver(e) if e.kind == DriverErrorKind::Configuration => 2,
        DaqError::Driver(e) if e.is_retryable() => 4,
        DaqError::Driver(_) | DaqError::Io(_) => 1,
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn connect_board<'a>(
    registry: &'a mut BoardRegistry<SimulatedAlazar>,
    args: &AcquisitionArgs,
) -> AppResult<(&'a mut AlazarBoard<SimulatedAlazar>, AcquisitionConfig)> {
    let config = args.load()?;
    let board = registry.connect(args.board)?;
    Ok((board, config))
}

fn timed_out(message: String) -> DaqError {
    DaqError::Driver(DriverError::new("alazar", DriverErrorKind::Timeout, message))
}

fn acquire(args: &AcquisitionArgs, out_dir: &Path) -> AppResult<()> {
    let mut registry = BoardRegistry::simulated();
    let (board, config) = connect_board(&mut registry, args)?;

    let (_, params) = board.configure(1, args.board, &config)?;
    let mut ch1 = vec![0.0f32; params.samples_per_acquisition];
    let mut ch2 = vec![0.0f32; params.samples_per_acquisition];
    let mut out1 = BufWriter::new(File::create(out_dir.join("ch1.dat"))?);
    let mut out2 = BufWriter::new(File::create(out_dir.join("ch2.dat"))?);

    board.start()?;
    let mut received = 0;
    let mut polls = 0;
    while received < params.number_acquisitions && polls < args.timeout {
        board.force_trigger()?;
        match board.poll(&mut ch1, &mut ch2)? {
            PollStatus::DataReady => {
                write_samples(&mut out1, &ch1)?;
                write_samples(&mut out2, &ch2)?;
                received += 1;
                info!(received, total = params.number_acquisitions, "acquisition received");
            }
            PollStatus::NoData => {
                polls += 1;
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
    board.stop()?;
    out1.flush()?;
    out2.flush()?;
    registry.disconnect(args.board)?;

    if received < params.number_acquisitions {
        return Err(timed_out(format!(
            "{polls} polls returned {received} of {} acquisitions",
            params.number_acquisitions
        )));
    }
    println!(
        "wrote {received} acquisitions of {} samples to {}",
        params.samples_per_acquisition,
        out_dir.display()
    );
    Ok(())
}

fn write_samples(out: &mut impl Write, samples: &[f32]) -> AppResult<()> {
    for v in samples {
        out.write_all(&v.to_ne_bytes())?;
    }
    Ok(())
}

fn open_channel(addr: &str, window: Option<usize>) -> AppResult<Connection> {
    let socket = TcpStream::connect(addr).map_err(|e| {
        DaqError::Driver(DriverError::new(
            "alazar",
            DriverErrorKind::Communication,
            format!("connecting to {addr}: {e}"),
        ))
    })?;
    socket.set_nodelay(true)?;
    let connection = match window {
        Some(bytes) => Connection::new(socket, bytes)?,
        #[cfg(unix)]
        None => Connection::from_socket(socket)?,
        #[cfg(not(unix))]
        None => Connection::new(socket, 64 * 1024)?,
    };
    Ok(connection)
}

fn stream(args: &AcquisitionArgs, ch1: &str, ch2: &str, window: Option<usize>) -> AppResult<()> {
    let mut registry = BoardRegistry::simulated();
    let (board, config) = connect_board(&mut registry, args)?;

    let (_, params) = board.configure(1, args.board, &config)?;
    board.register_channel(1, open_channel(ch1, window)?)?;
    board.register_channel(2, open_channel(ch2, window)?)?;
    board.start()?;

    let deadline = Instant::now() + Duration::from_millis(args.timeout);
    while board.is_running() {
        if Instant::now() > deadline {
            warn!(completed = board.completed_buffers(), "stream timed out");
            break;
        }
        board.force_trigger()?;
        thread::sleep(Duration::from_millis(1));
    }
    let completed = board.completed_buffers();
    board.stop()?;
    // closes both connections
    registry.disconnect(args.board)?;

    println!(
        "streamed {completed} buffers ({} units of {} samples expected)",
        params.number_acquisitions, params.samples_per_acquisition
    );
    Ok(())
}

fn print_error_table(out: &mut impl Write) -> std::io::Result<()> {
    for status in ApiStatus::all() {
        writeln!(out, "{}\t{}", status.code(), status.text())?;
    }
    Ok(())
}
