//! Processing Loop Engine
//!
//! One loop body serves both execution modes. [`Engine::run`] waits for the
//! transport to become readable or for a stop signal, reads exactly one
//! envelope, and either hands the frame to the dispatch surface or routes a
//! control reply to the caller waiting for it. The connection decides where
//! the body runs: inline on the caller (`RunningSync`) or on a dedicated
//! thread (`RunningAsync`).
//!
//! # Ordering
//!
//! Frames are dispatched one at a time, synchronously, in arrival order.
//! Frames read by a name request while no loop was running are parked in a
//! backlog that the next loop drains before touching the socket.
//!
//! # State Machine
//!
//! ```text
//!          begin(RunningSync)            finish()
//!   Idle ──────────────────────► RunningSync ──────► Idle
//!     │                                               ▲
//!     └──────────────────────► RunningAsync ──────────┘
//!          begin(RunningAsync)           finish()
//! ```
//!
//! `begin` fails with `AlreadyRunning` unless the state is `Idle`.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Delivery, DiscardHandler, DispatchHandler};
use crate::error::BusError;
use crate::names::NameRegistry;
use crate::protocol::{Envelope, Frame, NAME_ACQUIRED_SIGNAL};
use crate::transport::handle::HELLO_SERIAL;
use crate::transport::{Greeting, TransportError, TransportHandle};

/// Processing loop state of a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoopState {
    /// No loop is running
    #[default]
    Idle,
    /// Blocking loop on the caller's thread
    RunningSync,
    /// Loop on the connection's background thread
    RunningAsync,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::RunningSync => f.write_str("running synchronously"),
            Self::RunningAsync => f.write_str("running in background"),
        }
    }
}

/// Loop state plus the stop signal
pub(crate) struct LoopControl {
    state: Mutex<LoopState>,
    stop_tx: watch::Sender<bool>,
}

impl LoopControl {
    pub(crate) fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(LoopState::Idle),
            stop_tx,
        }
    }

    /// Transition `Idle -> mode`, returning the stop receiver for the new loop
    pub(crate) fn begin(&self, mode: LoopState) -> Result<watch::Receiver<bool>, BusError> {
        let mut state = self.state.lock();
        if *state != LoopState::Idle {
            return Err(BusError::AlreadyRunning(*state));
        }
        *state = mode;
        self.stop_tx.send_replace(false);
        Ok(self.stop_tx.subscribe())
    }

    /// Signal the active loop to stop; returns the state at the time of the request
    pub(crate) fn request_stop(&self) -> LoopState {
        let state = self.state.lock();
        self.stop_tx.send_replace(true);
        *state
    }

    /// Settle to `Idle` once the loop body has returned
    pub(crate) fn finish(&self) {
        *self.state.lock() = LoopState::Idle;
    }

    pub(crate) fn state(&self) -> LoopState {
        *self.state.lock()
    }
}

thread_local! {
    /// Address of the engine whose dispatch handler runs on this thread (0 = none)
    static DISPATCHING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running `engine`'s dispatch handler
///
/// Restores the previous marker on drop, so a handler of one connection
/// may drive the loop of another.
struct DispatchScope {
    previous: usize,
}

impl DispatchScope {
    fn enter(engine: &Engine) -> Self {
        let previous = DISPATCHING.with(|marker| marker.replace(engine.address()));
        Self { previous }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|marker| marker.set(self.previous));
    }
}

/// Where frames read by the current reader go
#[derive(Clone, Copy, Debug)]
enum Sink {
    /// Straight to the dispatch surface (processing loop)
    Dispatch,
    /// Parked for the next processing loop (name request pumping while idle)
    Backlog,
}

/// Shared state of one connection, used by both loop modes and by callers
pub(crate) struct Engine {
    pub(crate) transport: TransportHandle,
    pub(crate) names: Mutex<NameRegistry>,
    dispatcher: Mutex<Box<dyn DispatchHandler>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Envelope>>>,
    backlog: Mutex<VecDeque<Delivery>>,
    fault: Mutex<Option<BusError>>,
    next_serial: AtomicU32,
}

impl Engine {
    pub(crate) fn new(transport: TransportHandle, greeting: &Greeting) -> Self {
        Self {
            transport,
            names: Mutex::new(NameRegistry::new(greeting.unique_name.clone())),
            dispatcher: Mutex::new(Box::new(DiscardHandler)),
            pending: Mutex::new(HashMap::new()),
            backlog: Mutex::new(VecDeque::new()),
            fault: Mutex::new(None),
            next_serial: AtomicU32::new(HELLO_SERIAL + 1),
        }
    }

    /// Allocate a serial for an outgoing envelope
    pub(crate) fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
            // 0 and the hello serial are never reused after wrap-around
            if serial > HELLO_SERIAL {
                return serial;
            }
        }
    }

    pub(crate) fn set_dispatcher(&self, handler: Box<dyn DispatchHandler>) {
        *self.dispatcher.lock() = handler;
    }

    /// The recorded fatal transport failure, if any
    pub(crate) fn fault(&self) -> Option<BusError> {
        self.fault.lock().clone()
    }

    pub(crate) fn check_fault(&self) -> Result<(), BusError> {
        match self.fault() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record a fatal transport failure, fail every waiting request and
    /// forget every name held through the transport
    fn record_fault(&self, err: TransportError) -> BusError {
        let err = BusError::from(self.transport.mark_broken(err));
        error!(error = %err, "Transport to bus daemon failed");
        self.fault.lock().get_or_insert_with(|| err.clone());
        // Dropping the reply slots wakes their waiters
        self.pending.lock().clear();

        let dropped = self.names.lock().clear();
        for entry in dropped {
            warn!(name = %entry.name, status = ?entry.status, "Bus name lost with the transport");
        }
        err
    }

    fn fail(&self, err: TransportError) -> BusError {
        if err.is_fatal() {
            self.record_fault(err)
        } else {
            err.into()
        }
    }

    /// The processing loop body
    ///
    /// Returns `Ok(())` once a stop is observed, or the fatal transport error
    /// that ended the loop.
    pub(crate) async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), BusError> {
        let mut reader = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
            reader = self.transport.reader() => reader,
        };

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let parked = self.backlog.lock().pop_front();
            if let Some(delivery) = parked {
                self.dispatch(delivery);
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                next = reader.next_envelope() => next,
            };

            match next {
                Ok(envelope) => self.route(envelope, Sink::Dispatch),
                Err(e) if e.is_fatal() => return Err(self.record_fault(e)),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed frame");
                    self.dispatch(Err(e.into()));
                }
            }
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let _scope = DispatchScope::enter(self);
        self.dispatcher.lock().dispatch(delivery);
    }

    fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Whether the calling thread is inside this engine's dispatch handler
    pub(crate) fn is_dispatching(&self) -> bool {
        DISPATCHING.with(|marker| marker.get() == self.address())
    }

    fn route(&self, envelope: Envelope, sink: Sink) {
        match envelope {
            Envelope::Message(frame) => {
                debug!(kind = ?frame.kind, serial = frame.serial, sender = ?frame.sender, "Received frame");
                if frame.is_bus_signal(NAME_ACQUIRED_SIGNAL) {
                    self.note_name_acquired(&frame);
                }
                match sink {
                    Sink::Dispatch => self.dispatch(Ok(frame)),
                    Sink::Backlog => self.backlog.lock().push_back(Ok(frame)),
                }
            }
            reply => match reply.reply_serial() {
                Some(serial) => {
                    let slot = self.pending.lock().remove(&serial);
                    match slot {
                        Some(tx) => {
                            if tx.send(reply).is_err() {
                                debug!(serial, "Requester gave up before the reply arrived");
                            }
                        }
                        None => debug!(serial, "Dropping reply with no waiting request"),
                    }
                }
                None => warn!(envelope = ?reply, "Ignoring unexpected envelope from bus daemon"),
            },
        }
    }

    fn note_name_acquired(&self, frame: &Frame) {
        match std::str::from_utf8(&frame.body) {
            Ok(name) => {
                self.names.lock().record_owner(name);
                info!(name, "Acquired queued bus name");
            }
            Err(e) => warn!(error = %e, "NameAcquired signal with non-UTF-8 name"),
        }
    }

    /// Send a control request and wait for the envelope answering `serial`
    pub(crate) async fn call(
        &self,
        request: Envelope,
        serial: u32,
        timeout: Option<Duration>,
    ) -> Result<Envelope, BusError> {
        self.check_fault()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(serial, tx);

        if let Err(e) = self.transport.send(&request) {
            self.pending.lock().remove(&serial);
            return Err(self.fail(e));
        }

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.await_reply(rx))
                .await
                .unwrap_or_else(|_| Err(TransportError::Timeout(limit).into())),
            None => self.await_reply(rx).await,
        };

        if result.is_err() {
            self.pending.lock().remove(&serial);
        }
        result
    }

    /// Wait for a reply slot to be filled
    ///
    /// While a processing loop holds the reader, the loop fills the slot. If
    /// the reader is free (or becomes free), this caller reads the socket
    /// itself and parks any frames it meets in the backlog.
    async fn await_reply(
        &self,
        mut rx: oneshot::Receiver<Envelope>,
    ) -> Result<Envelope, BusError> {
        let mut reader = tokio::select! {
            biased;
            reply = &mut rx => return reply.map_err(|_| self.lost_reply()),
            reader = self.transport.reader() => reader,
        };

        loop {
            match rx.try_recv() {
                Ok(reply) => return Ok(reply),
                Err(oneshot::error::TryRecvError::Closed) => return Err(self.lost_reply()),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            match reader.next_envelope().await {
                Ok(envelope) => self.route(envelope, Sink::Backlog),
                Err(e) if e.is_fatal() => return Err(self.record_fault(e)),
                Err(e) => {
                    warn!(error = %e, "Parking malformed frame for the processing loop");
                    self.backlog.lock().push_back(Err(e.into()));
                }
            }
        }
    }

    fn lost_reply(&self) -> BusError {
        self.fault().unwrap_or_else(|| {
            BusError::Transport("Reply slot dropped before an answer arrived".to_string())
        })
    }

    /// Send a frame, returning the serial it was stamped with
    pub(crate) fn send_frame(&self, mut frame: Frame) -> Result<u32, BusError> {
        self.check_fault()?;
        let serial = self.next_serial();
        frame.serial = serial;
        self.transport
            .send(&Envelope::Message(frame))
            .map_err(|e| self.fail(e))?;
        Ok(serial)
    }
}
