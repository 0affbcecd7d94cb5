#![cfg(unix)]
//! Streaming acquisitions over TCP loopback.
//!
//! Each channel gets its own socket pair; the board writes into the client
//! side and a reader thread collects the length-prefixed chunks from the
//! accepted side until the board drops its connections.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use daq_driver_alazar::{
    AcquisitionConfig, AlazarBoard, AlazarError, BoardRegistry, Connection, SimulatedAlazar,
};

const C2V: f32 = 8.0 / 256.0;

fn volts(code: f32) -> f32 {
    C2V * (code - 128.0)
}

/// Connect a client socket and spawn a reader on the accepted end.
fn loopback() -> (TcpStream, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut server, _) = listener.accept().unwrap();
    let reader = thread::spawn(move || {
        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).unwrap();
        bytes
    });
    (client, reader)
}

/// Split a byte stream into its length-prefixed chunks.
fn chunks(bytes: &[u8]) -> Vec<Vec<f32>> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (len, tail) = rest.split_at(8);
        let len = u64::from_ne_bytes(len.try_into().unwrap()) as usize;
        let (payload, tail) = tail.split_at(len);
        out.push(
            payload
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes(b.try_into().unwrap()))
                .collect(),
        );
        rest = tail;
    }
    out
}

fn wait_until_idle(board: &AlazarBoard<SimulatedAlazar>) {
    let start = Instant::now();
    while board.is_running() {
        assert!(start.elapsed() < Duration::from_secs(5), "acquisition never finished");
        thread::sleep(Duration::from_millis(1));
    }
}

fn averager(record_length: u32, round_robins: u32) -> AcquisitionConfig {
    AcquisitionConfig {
        record_length,
        nbr_round_robins: round_robins,
        buffer_size: 2 * record_length,
        ..AcquisitionConfig::default()
    }
}

#[test]
fn test_stream_every_unit_in_order() {
    let mut board = AlazarBoard::new(1, Arc::new(SimulatedAlazar::new()))
        .with_wait_timeout(Duration::from_millis(50));
    let (_, params) = board.configure(1, 1, &averager(256, 4)).unwrap();

    let (a, reader_a) = loopback();
    let (b, reader_b) = loopback();
    board
        .register_channel(1, Connection::from_socket(a).unwrap())
        .unwrap();
    board
        .register_channel(2, Connection::from_socket(b).unwrap())
        .unwrap();

    board.start().unwrap();
    let mut ch1 = vec![0.0; params.samples_per_acquisition];
    let mut ch2 = vec![0.0; params.samples_per_acquisition];
    assert!(matches!(
        board.poll(&mut ch1, &mut ch2),
        Err(AlazarError::Configuration(_))
    ));

    wait_until_idle(&board);
    board.stop().unwrap();
    // closes both sockets so the readers see EOF
    board.unregister_channels().unwrap();

    let a = chunks(&reader_a.join().unwrap()).concat();
    let b = chunks(&reader_b.join().unwrap()).concat();
    assert_eq!(a.len(), 4 * 256);
    assert_eq!(b.len(), 4 * 256);
    for unit in 0..4 {
        let code = unit as f32;
        assert!((a[unit * 256] - volts(code)).abs() < 1e-5);
        assert!((b[unit * 256 + 255] - volts(code + 1.0)).abs() < 1e-5);
    }
}

#[test]
fn test_chunks_respect_transfer_window() {
    let mut board = AlazarBoard::new(1, Arc::new(SimulatedAlazar::new()))
        .with_wait_timeout(Duration::from_millis(50));
    board.configure(1, 1, &averager(1024, 1)).unwrap();

    let (a, reader_a) = loopback();
    let (b, reader_b) = loopback();
    board
        .register_channel(1, Connection::new(a, 1000).unwrap())
        .unwrap();
    board
        .register_channel(2, Connection::new(b, 4096).unwrap())
        .unwrap();

    board.start().unwrap();
    wait_until_idle(&board);
    board.stop().unwrap();
    drop(board);

    let a = chunks(&reader_a.join().unwrap());
    assert!(a.iter().all(|c| c.len() * 4 <= 1000));
    assert_eq!(a.iter().map(Vec::len).sum::<usize>(), 1024);
    assert_eq!(chunks(&reader_b.join().unwrap()).len(), 1);
}

#[test]
fn test_connections_survive_stop() {
    let mut registry = BoardRegistry::simulated();
    let board = registry.connect(1).unwrap();
    board.configure(1, 1, &averager(256, 1)).unwrap();

    let (a, reader_a) = loopback();
    let (b, reader_b) = loopback();
    board
        .register_channel(1, Connection::from_socket(a).unwrap())
        .unwrap();
    board
        .register_channel(2, Connection::from_socket(b).unwrap())
        .unwrap();

    for _ in 0..2 {
        board.start().unwrap();
        wait_until_idle(board);
        board.stop().unwrap();
    }
    registry.disconnect(1).unwrap();

    assert_eq!(chunks(&reader_a.join().unwrap()).concat().len(), 2 * 256);
    assert_eq!(chunks(&reader_b.join().unwrap()).concat().len(), 2 * 256);
}

#[test]
fn test_partial_round_robin_is_sent_after_last_slice() {
    let mut board = AlazarBoard::new(1, Arc::new(SimulatedAlazar::new()))
        .with_wait_timeout(Duration::from_millis(50));
    let config = AcquisitionConfig {
        record_length: 256,
        nbr_segments: 2,
        nbr_waveforms: 2,
        nbr_round_robins: 3,
        buffer_size: 1024,
        ..AcquisitionConfig::default()
    };
    let (geometry, params) = board.configure(1, 1, &config).unwrap();
    assert!(geometry.partial_buffer);
    assert_eq!(geometry.buffers_per_round_robin, 2);
    assert_eq!(geometry.nbr_buffers, 6);

    let (a, reader_a) = loopback();
    let (b, reader_b) = loopback();
    board
        .register_channel(1, Connection::new(a, 1 << 16).unwrap())
        .unwrap();
    board
        .register_channel(2, Connection::new(b, 1 << 16).unwrap())
        .unwrap();

    board.start().unwrap();
    wait_until_idle(&board);
    assert_eq!(board.completed_buffers(), 6);
    board.stop().unwrap();
    board.unregister_channels().unwrap();

    // six buffers, but only the three last slices produce a frame
    let bytes_a = reader_a.join().unwrap();
    assert_eq!(bytes_a.len(), 3 * (8 + 4 * params.samples_per_acquisition));
    let frames = chunks(&bytes_a);
    assert_eq!(frames.len(), 3);
    for (unit, frame) in frames.iter().enumerate() {
        let first = 4.0 * unit as f32;
        assert_eq!(frame.len(), 512);
        assert!((frame[0] - volts(first + 0.5)).abs() < 1e-4);
        assert!((frame[256] - volts(first + 2.5)).abs() < 1e-4);
    }
    assert_eq!(chunks(&reader_b.join().unwrap()).len(), 3);
}

/// Accepts at most `limit` bytes per write.
struct Trickle {
    limit: usize,
}

impl Write for Trickle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len().min(self.limit))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_short_write_ends_acquisition_with_transmission_error() {
    let mut board = AlazarBoard::new(1, Arc::new(SimulatedAlazar::new()))
        .with_wait_timeout(Duration::from_millis(50));
    board.configure(1, 1, &averager(256, 4)).unwrap();
    board
        .register_channel(1, Connection::new(Trickle { limit: 3 }, 1024).unwrap())
        .unwrap();
    board
        .register_channel(2, Connection::new(io::sink(), 1024).unwrap())
        .unwrap();

    board.start().unwrap();
    wait_until_idle(&board);
    assert_eq!(board.completed_buffers(), 0);

    match board.stop().unwrap_err() {
        AlazarError::Transmission { channel, message } => {
            assert_eq!(channel, 1);
            assert!(message.contains("short write"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!board.is_active());
}
