//! Integration tests for the `alazar-acq` binary
//!
//! Run with: cargo test -p daq-bin --test cli

use std::io::Read;
use std::net::TcpListener;
use std::process::Command;
use std::thread;

fn alazar_acq() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_alazar-acq"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

// =============================================================================
// CLI Tests
// =============================================================================

#[test]
fn test_help_lists_subcommands() {
    let output = alazar_acq().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["acquire", "stream", "errors"] {
        assert!(stdout.contains(sub), "help should mention {sub}");
    }
}

#[test]
fn test_errors_prints_table() {
    let output = alazar_acq().arg("errors").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().next().unwrap().starts_with("512\tApiSuccess"));
    assert!(stdout.contains("583\tApiInvalidBuffer"));
}

// =============================================================================
// Acquisition Tests
// =============================================================================

#[test]
fn test_acquire_writes_channel_files() {
    let dir = tempfile::tempdir().unwrap();
    let output = alazar_acq()
        .args([
            "acquire",
            "--mode",
            "averager",
            "--recordlength",
            "256",
            "--roundrobins",
            "3",
            "--buffer",
            "512",
            "--out-dir",
        ])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "acquire failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    for name in ["ch1.dat", "ch2.dat"] {
        let bytes = std::fs::read(dir.path().join(name)).unwrap();
        assert_eq!(bytes.len(), 3 * 256 * 4, "{name} size");
    }
    let ch1 = std::fs::read(dir.path().join("ch1.dat")).unwrap();
    let first = f32::from_ne_bytes(ch1[..4].try_into().unwrap());
    assert!((first - (-4.0)).abs() < 1e-6);
}

#[test]
fn test_acquire_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "record_length = 100\n").unwrap();

    let output = alazar_acq()
        .args(["acquire", "--out-dir"])
        .arg(dir.path())
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("record length"));
}

// =============================================================================
// Streaming Tests
// =============================================================================

/// Bind a listener and collect everything the first client sends.
fn listen() -> (String, thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let reader = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut bytes = Vec::new();
        socket.read_to_end(&mut bytes).unwrap();
        bytes
    });
    (addr, reader)
}

#[test]
fn test_stream_sends_every_unit_to_both_listeners() {
    let (ch1, reader1) = listen();
    let (ch2, reader2) = listen();
    let output = alazar_acq()
        .args([
            "stream",
            "--recordlength",
            "256",
            "--roundrobins",
            "2",
            "--buffer",
            "512",
            "--window",
            "4096",
            "--ch1",
            &ch1,
            "--ch2",
            &ch2,
        ])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stream failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("streamed 2 buffers"));

    // two units, each an 8-byte length prefix and 256 floats
    for reader in [reader1, reader2] {
        let bytes = reader.join().unwrap();
        assert_eq!(bytes.len(), 2 * (8 + 256 * 4));
        assert_eq!(u64::from_ne_bytes(bytes[..8].try_into().unwrap()), 1024);
    }
}

#[test]
fn test_stream_to_closed_port_fails() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let addr = format!("127.0.0.1:{port}");
    let output = alazar_acq()
        .args(["stream", "--ch1", &addr, "--ch2", &addr])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connecting to"));
}
