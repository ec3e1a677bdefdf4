//! Test Infrastructure: a scripted fake bus daemon
//!
//! [`FakeBus`] listens on a socket in a temp dir and plays the daemon side
//! of one connection by hand, so tests control exactly which bytes arrive
//! and when.

#![allow(dead_code)]

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use busway_core::protocol::{
    BUS_DAEMON_INTERFACE, BUS_DAEMON_NAME, BUS_DAEMON_PATH, NAME_ACQUIRED_SIGNAL,
};
use busway_core::transport::frame::{encode, FrameDecoder, HEADER_SIZE};
use busway_core::{BusConfig, BusKind, Connection, Delivery, Envelope, Frame, NameFlags};

/// How long any single expectation may take before the test fails
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Unique name handed out by the fake daemon
pub const UNIQUE_NAME: &str = ":1.7";

// =============================================================================
// Fake Daemon
// =============================================================================

pub struct FakeBus {
    _dir: TempDir,
    path: PathBuf,
    listener: UnixListener,
}

impl FakeBus {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock");
        let listener = UnixListener::bind(&path).unwrap();
        Self {
            _dir: dir,
            path,
            listener,
        }
    }

    pub fn config(&self) -> BusConfig {
        BusConfig {
            connect_timeout_ms: 2000,
            call_timeout_ms: 2000,
            ..BusConfig::with_socket(&self.path)
        }
    }

    /// Accept one client and answer its hello
    pub fn accept(&self) -> FakePeer {
        let (stream, _) = self.listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut peer = FakePeer {
            stream,
            decoder: FrameDecoder::new(),
        };

        match peer.recv() {
            Envelope::Hello { serial } => peer.send(&Envelope::HelloReply {
                reply_serial: serial,
                unique_name: UNIQUE_NAME.to_string(),
                bus_id: "fake-bus".to_string(),
            }),
            other => panic!("Expected hello, got {other:?}"),
        }
        peer
    }

    /// Open a session bus connection and the daemon side of it
    pub fn connect(&self) -> (Connection, FakePeer) {
        self.connect_with(self.config())
    }

    pub fn connect_with(&self, config: BusConfig) -> (Connection, FakePeer) {
        let opener = thread::spawn(move || Connection::open(&config, BusKind::Session));
        let peer = self.accept();
        let connection = opener.join().unwrap().unwrap();
        (connection, peer)
    }
}

/// Daemon end of one connection
pub struct FakePeer {
    stream: UnixStream,
    decoder: FrameDecoder,
}

impl FakePeer {
    /// Read the next envelope sent by the connection
    pub fn recv(&mut self) -> Envelope {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(envelope) = self.decoder.decode::<Envelope>().unwrap() {
                return envelope;
            }
            let n = self.stream.read(&mut buf).unwrap();
            assert!(n > 0, "Connection closed while an envelope was expected");
            self.decoder.push(&buf[..n]);
        }
    }

    pub fn send(&mut self, envelope: &Envelope) {
        self.send_raw(&encode(envelope).unwrap());
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn deliver(&mut self, frame: Frame) {
        self.send(&Envelope::Message(frame));
    }

    /// Deliver a test signal whose body is `label`
    pub fn deliver_signal(&mut self, label: &str) {
        self.deliver(tick(label));
    }

    /// Deliver a frame whose checksum does not match its payload
    pub fn deliver_corrupted(&mut self, label: &str) {
        let mut bytes = encode(&Envelope::Message(tick(label))).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        self.send_raw(&bytes);
    }

    /// Tell the connection it was promoted to owner of `name`
    pub fn announce_name_acquired(&mut self, name: &str) {
        let mut frame = Frame::signal(BUS_DAEMON_PATH, BUS_DAEMON_INTERFACE, NAME_ACQUIRED_SIGNAL)
            .with_body(name.as_bytes().to_vec())
            .with_destination(UNIQUE_NAME);
        frame.sender = Some(BUS_DAEMON_NAME.to_string());
        self.deliver(frame);
    }

    pub fn expect_request_name(&mut self) -> (u32, String, NameFlags) {
        match self.recv() {
            Envelope::RequestName {
                serial,
                name,
                flags,
            } => (serial, name, flags),
            other => panic!("Expected name request, got {other:?}"),
        }
    }

    pub fn expect_release_name(&mut self) -> (u32, String) {
        match self.recv() {
            Envelope::ReleaseName { serial, name } => (serial, name),
            other => panic!("Expected name release, got {other:?}"),
        }
    }

    pub fn expect_message(&mut self) -> Frame {
        match self.recv() {
            Envelope::Message(frame) => frame,
            other => panic!("Expected message, got {other:?}"),
        }
    }

    /// Wait for the connection to close its end
    pub fn expect_closed(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) if e.kind() == IoErrorKind::WouldBlock || e.kind() == IoErrorKind::TimedOut => {
                    panic!("Connection did not close its socket")
                }
                Err(_) => return,
            }
        }
    }
}

/// Test signal with `label` as its body
pub fn tick(label: &str) -> Frame {
    let mut frame = Frame::signal("/org/example/Test", "org.example.Test", "Tick")
        .with_body(label.as_bytes().to_vec());
    frame.sender = Some(":1.99".to_string());
    frame
}

// =============================================================================
// Dispatch Recorder
// =============================================================================

/// Collects deliveries from a dispatch handler
#[derive(Clone, Default)]
pub struct Recorder {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl FnMut(Delivery) + Send + 'static {
        let deliveries = Arc::clone(&self.deliveries);
        move |delivery| deliveries.lock().push(delivery)
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Wait until at least `count` deliveries were recorded
    pub fn wait_for(&self, count: usize) -> Vec<Delivery> {
        wait_until(|| self.len() >= count, "deliveries");
        self.snapshot()
    }

    /// Bodies of delivered frames as strings; errors show as `<error>`
    pub fn labels(&self) -> Vec<String> {
        self.snapshot().iter().map(label).collect()
    }
}

pub fn label(delivery: &Delivery) -> String {
    match delivery {
        Ok(frame) => String::from_utf8_lossy(&frame.body).into_owned(),
        Err(_) => "<error>".to_string(),
    }
}

/// Poll `condition` until it holds, panicking after [`TIMEOUT`]
pub fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}
