//! Transport Handle
//!
//! The exclusively owned Unix socket to a bus daemon.
//!
//! The socket is split on connect. Writes are queued to a writer task so
//! that frames can be sent from any thread, including from inside the
//! dispatch callback. Reads go through a [`FrameReader`] behind an async
//! mutex: whoever holds it (the processing loop, or a caller waiting for a
//! control reply while no loop runs) is the only reader.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, MutexGuard};
use tokio::task::JoinHandle;

use super::config::BusKind;
use super::frame::{encode, FrameDecoder};
use super::TransportError;
use crate::protocol::Envelope;

/// Serial used by the hello handshake
pub(crate) const HELLO_SERIAL: u32 = 1;

/// How long closing waits for queued writes to reach the socket
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity assigned by the bus daemon during the handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    /// Unique name of this connection (e.g. `:1.42`)
    pub unique_name: String,
    /// Identity of the bus daemon instance
    pub bus_id: String,
}

/// Read side of the transport
///
/// Owns the read half and the decoder buffer, so a partially received frame
/// survives between successive readers.
pub struct FrameReader {
    half: OwnedReadHalf,
    decoder: FrameDecoder,
    buf: Box<[u8]>,
}

impl FrameReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; 8192].into_boxed_slice(),
        }
    }

    /// Read the next complete envelope
    ///
    /// Cancel-safe: bytes read before cancellation stay in the decoder.
    ///
    /// # Errors
    ///
    /// Non-fatal errors (see [`TransportError::is_fatal`]) mean one bad frame
    /// was skipped; reading may continue.
    pub async fn next_envelope(&mut self) -> Result<Envelope, TransportError> {
        loop {
            if let Some(envelope) = self.decoder.decode::<Envelope>()? {
                return Ok(envelope);
            }

            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                let buffered = self.decoder.available();
                return Err(if buffered > 0 {
                    TransportError::Truncated(buffered)
                } else {
                    TransportError::ConnectionClosed
                });
            }
            self.decoder.push(&self.buf[..n]);
        }
    }
}

/// Await `future`, bounded by `limit` when one is set
async fn within<F: std::future::Future>(
    limit: Option<Duration>,
    future: F,
) -> Result<F::Output, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| TransportError::Timeout(limit)),
        None => Ok(future.await),
    }
}

/// Exclusive channel to a bus daemon
pub struct TransportHandle {
    address: PathBuf,
    reader: tokio::sync::Mutex<FrameReader>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    open: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl TransportHandle {
    /// Connect to the daemon at `address` and perform the hello handshake
    ///
    /// Must be called within a tokio runtime; the writer task is spawned on it.
    pub async fn connect(
        bus: BusKind,
        address: &Path,
        timeout: Option<Duration>,
    ) -> Result<(Self, Greeting), TransportError> {
        let stream = within(timeout, UnixStream::connect(address))
            .await?
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to connect to {bus} bus at {address:?}: {e}"
                ))
            })?;

        let (read_half, write_half) = stream.into_split();

        let open = Arc::new(AtomicBool::new(true));
        let failure = Arc::new(Mutex::new(None));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_task(
            write_half,
            outbound_rx,
            Arc::clone(&open),
            Arc::clone(&failure),
        ));

        let handle = Self {
            address: address.to_path_buf(),
            reader: tokio::sync::Mutex::new(FrameReader::new(read_half)),
            outbound: Mutex::new(Some(outbound)),
            writer: Mutex::new(Some(writer)),
            open,
            failure,
        };

        let greeting = within(timeout, handle.handshake()).await??;

        tracing::info!(
            bus = %bus,
            path = ?address,
            unique_name = %greeting.unique_name,
            "Connected to bus daemon"
        );

        Ok((handle, greeting))
    }

    async fn handshake(&self) -> Result<Greeting, TransportError> {
        self.send(&Envelope::Hello {
            serial: HELLO_SERIAL,
        })?;

        let mut reader = self.reader.lock().await;
        match reader.next_envelope().await {
            Ok(Envelope::HelloReply {
                reply_serial: HELLO_SERIAL,
                unique_name,
                bus_id,
            }) => Ok(Greeting {
                unique_name,
                bus_id,
            }),
            Ok(other) => Err(TransportError::Protocol(format!(
                "Expected hello reply, got {other:?}"
            ))),
            Err(e) => Err(self.mark_broken(e)),
        }
    }

    /// Whether the socket is still usable
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue an envelope for writing
    ///
    /// Returns once the frame is queued; write failures close the handle and
    /// are reported by the next operation.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let data = encode(envelope)?;
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| self.closed_error()),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Acquire the read side
    ///
    /// Waits while another context is reading.
    pub async fn reader(&self) -> MutexGuard<'_, FrameReader> {
        self.reader.lock().await
    }

    /// Record a fatal error and close the handle
    ///
    /// Returns the error for convenient propagation.
    pub fn mark_broken(&self, err: TransportError) -> TransportError {
        if err.is_fatal() {
            self.open.store(false, Ordering::SeqCst);
            self.failure.lock().get_or_insert_with(|| err.to_string());
        }
        err
    }

    /// Stop accepting writes, flush queued frames and close the write side
    pub async fn close(&self) {
        self.outbound.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
                tracing::warn!(path = ?self.address, "Timed out flushing outbound frames");
            }
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn closed_error(&self) -> TransportError {
        match self.failure.lock().as_ref() {
            Some(reason) => TransportError::ConnectionFailed(reason.clone()),
            None => TransportError::ConnectionClosed,
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        // Unflushed writer (close() was not awaited): stop it with the handle
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
    }
}

/// Drain queued frames to the socket until the sender is dropped
async fn write_task(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    open: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
) {
    while let Some(data) = outbound_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            tracing::warn!(error = %e, "Write error");
            open.store(false, Ordering::SeqCst);
            failure
                .lock()
                .get_or_insert_with(|| format!("Write failed: {e}"));
            return;
        }
    }

    if let Err(e) = write_half.shutdown().await {
        tracing::debug!(error = %e, "Shutdown of write half failed");
    }
}
