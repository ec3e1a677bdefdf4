//! Bus Connection
//!
//! [`Connection`] is the single owning façade over a transport handle, its
//! name registry and its processing loop. It is the only object the rest of
//! an application holds.
//!
//! # Execution Model
//!
//! The API is blocking. Each connection owns a small tokio runtime that
//! drives its socket. Blocking calls made from a thread that already carries
//! a tokio context (an async task or a `spawn_blocking` worker) are driven
//! on a short-lived helper thread. Blocking calls on a connection from inside
//! that connection's own dispatch handler are refused. The processing
//! loop runs either on the caller ([`Connection::enter_processing_loop`]) or
//! on a thread managed by the connection
//! ([`Connection::enter_processing_loop_async`]), never both at once.
//!
//! # Shutdown
//!
//! Dropping a connection stops and joins a background loop, flushes queued
//! frames and closes the socket, in that order. A blocking loop must be left
//! before the connection is dropped.

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchHandler;
use crate::error::BusError;
use crate::names::{validate_bus_name, NameEntry};
use crate::processing_loop::{Engine, LoopControl, LoopState};
use crate::protocol::{
    error_names, Envelope, Frame, NameFlags, ReleaseNameReply, RequestNameReply,
};
use crate::transport::{BusConfig, BusKind, Greeting, TransportHandle};

type LoopThread = thread::JoinHandle<Result<(), BusError>>;

/// Capability interface of a bus connection
///
/// Implemented by [`Connection`] for both the system and the session bus;
/// the bus is chosen when the connection is opened.
pub trait BusConnection: Send + Sync {
    /// Ask the bus daemon to assign `name` to this connection
    fn request_name(&self, name: &str) -> Result<(), BusError>;

    /// Give up a previously acquired `name`
    fn release_name(&self, name: &str) -> Result<(), BusError>;

    /// Run the processing loop on the calling thread until it is left
    fn enter_processing_loop(&self) -> Result<(), BusError>;

    /// Run the processing loop on a background thread and return immediately
    fn enter_processing_loop_async(&self) -> Result<(), BusError>;

    /// Stop the active processing loop
    fn leave_processing_loop(&self) -> Result<(), BusError>;

    /// Which bus this connection talks to
    fn bus_kind(&self) -> BusKind;
}

/// Handle for stopping a connection's processing loop from any thread
///
/// Obtained from [`Connection::stop_handle`]. Cloning is cheap; the handle
/// does not keep the transport open.
#[derive(Clone)]
pub struct LoopStopper {
    control: Arc<LoopControl>,
    worker: Arc<Mutex<Option<LoopThread>>>,
}

impl LoopStopper {
    /// Stop the active loop
    ///
    /// A blocking loop is signalled and finishes its current iteration on its
    /// own thread. A background loop is signalled and joined before this
    /// returns, unless this is called from the loop thread itself (e.g. from a
    /// dispatch handler), in which case it only signals. Idle: no-op.
    ///
    /// # Errors
    ///
    /// Returns the fatal transport error that ended a background loop.
    pub fn leave_processing_loop(&self) -> Result<(), BusError> {
        let state = self.control.request_stop();

        let worker = {
            let mut slot = self.worker.lock();
            match slot.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => {
                    debug!("Leave requested from the processing loop thread");
                    return Ok(());
                }
                _ => slot.take(),
            }
        };

        let Some(worker) = worker else {
            if state == LoopState::RunningSync {
                debug!("Signalled blocking processing loop to stop");
            }
            return Ok(());
        };

        debug!("Waiting for background processing loop to stop");
        let result = worker.join().unwrap_or_else(|_| {
            Err(BusError::Transport(
                "Processing loop thread panicked".to_string(),
            ))
        });
        info!("Background processing loop stopped");
        result
    }

    /// Current loop state
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.control.state()
    }
}

/// Connection to a bus daemon
pub struct Connection {
    engine: Arc<Engine>,
    control: Arc<LoopControl>,
    worker: Arc<Mutex<Option<LoopThread>>>,
    runtime: Option<Runtime>,
    bus: BusKind,
    greeting: Greeting,
    call_timeout: Option<Duration>,
}

impl Connection {
    /// Open a connection to `bus` as described by `config`
    ///
    /// # Errors
    ///
    /// `BusError::Transport` if the daemon cannot be reached or the
    /// handshake fails.
    pub fn open(config: &BusConfig, bus: BusKind) -> Result<Self, BusError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("busway-io")
            .enable_all()
            .build()
            .map_err(|e| BusError::Transport(format!("Failed to start I/O runtime: {e}")))?;

        let address = config.socket_for(bus);
        let connected = drive(&runtime, || {
            TransportHandle::connect(bus, address, config.connect_timeout())
        });
        let (transport, greeting) = match connected.and_then(|result| result.map_err(BusError::from)) {
            Ok(connected) => connected,
            Err(e) => {
                // Dropping a runtime inside an async context panics
                runtime.shutdown_background();
                return Err(e);
            }
        };

        Ok(Self {
            engine: Arc::new(Engine::new(transport, &greeting)),
            control: Arc::new(LoopControl::new()),
            worker: Arc::new(Mutex::new(None)),
            runtime: Some(runtime),
            bus,
            greeting,
            call_timeout: config.call_timeout(),
        })
    }

    /// Unique name assigned by the bus daemon
    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.greeting.unique_name
    }

    /// Identity of the bus daemon instance
    #[must_use]
    pub fn bus_id(&self) -> &str {
        &self.greeting.bus_id
    }

    /// Whether the transport is still usable
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.engine.transport.is_open() && self.engine.fault().is_none()
    }

    /// Current loop state
    #[must_use]
    pub fn loop_state(&self) -> LoopState {
        self.control.state()
    }

    /// Names this connection owns, in acquisition order
    #[must_use]
    pub fn owned_names(&self) -> Vec<String> {
        self.engine.names.lock().owned_names()
    }

    /// All name registry entries (owned and queued), in acquisition order
    #[must_use]
    pub fn name_entries(&self) -> Vec<NameEntry> {
        self.engine.names.lock().entries()
    }

    /// Install the dispatch surface that receives every incoming frame
    ///
    /// Must not be called from inside a dispatch handler.
    pub fn set_dispatch_handler(&self, handler: impl DispatchHandler + 'static) {
        self.engine.set_dispatcher(Box::new(handler));
    }

    /// Handle for leaving the processing loop from another thread
    #[must_use]
    pub fn stop_handle(&self) -> LoopStopper {
        LoopStopper {
            control: Arc::clone(&self.control),
            worker: Arc::clone(&self.worker),
        }
    }

    /// Send a frame to the bus
    ///
    /// The frame's serial is assigned here and returned. Safe to call from
    /// any thread, including from a dispatch handler.
    pub fn send(&self, frame: Frame) -> Result<u32, BusError> {
        self.engine.send_frame(frame)
    }

    /// Request `name` with explicit flags
    ///
    /// Returns how the daemon answered. With [`NameFlags::queue`], a taken
    /// name yields `InQueue` and is recorded as queued until the daemon
    /// promotes this connection.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if `name` is malformed
    /// - `NameUnavailable` if another peer owns it and queueing was not requested
    /// - `Transport` on I/O failure or timeout
    pub fn request_name_with(
        &self,
        name: &str,
        flags: NameFlags,
    ) -> Result<RequestNameReply, BusError> {
        validate_bus_name(name)?;

        if self.engine.names.lock().is_owner(name) {
            debug!(name, "Name already owned, nothing to request");
            return Ok(RequestNameReply::AlreadyOwner);
        }

        let serial = self.engine.next_serial();
        let request = Envelope::RequestName {
            serial,
            name: name.to_string(),
            flags,
        };
        let reply = self.block_on("request a name", || {
            self.engine.call(request, serial, self.call_timeout)
        })??;

        match reply {
            Envelope::RequestNameReply { reply, .. } => match reply {
                RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {
                    self.engine.names.lock().record_owner(name);
                    info!(name, unique_name = %self.unique_name(), "Acquired bus name");
                    Ok(reply)
                }
                RequestNameReply::InQueue => {
                    self.engine.names.lock().record_queued(name);
                    info!(name, "Queued for bus name");
                    Ok(reply)
                }
                RequestNameReply::Exists => Err(BusError::NameUnavailable(name.to_string())),
            },
            Envelope::ControlError {
                name: error_name,
                message,
                ..
            } => Err(control_error(name, &error_name, message)),
            other => Err(unexpected_reply("name request", &other)),
        }
    }

    /// Ask the bus daemon to assign `name` to this connection
    ///
    /// Re-requesting an owned name succeeds without contacting the daemon.
    pub fn request_name(&self, name: &str) -> Result<(), BusError> {
        self.request_name_with(name, NameFlags::default())
            .map(|_| ())
    }

    /// Release a name owned by (or queued for) this connection
    ///
    /// # Errors
    ///
    /// - `NotOwned` if the registry has no record of `name`, or the daemon
    ///   says this connection does not hold it
    /// - `Transport` on I/O failure or timeout
    pub fn release_name(&self, name: &str) -> Result<(), BusError> {
        if !self.engine.names.lock().contains(name) {
            return Err(BusError::NotOwned(name.to_string()));
        }

        let serial = self.engine.next_serial();
        let request = Envelope::ReleaseName {
            serial,
            name: name.to_string(),
        };
        let reply = self.block_on("release a name", || {
            self.engine.call(request, serial, self.call_timeout)
        })??;

        match reply {
            Envelope::ReleaseNameReply {
                reply: ReleaseNameReply::Released,
                ..
            } => {
                self.engine.names.lock().forget(name);
                info!(name, "Released bus name");
                Ok(())
            }
            Envelope::ReleaseNameReply { reply, .. } => {
                self.engine.names.lock().forget(name);
                warn!(name, reply = ?reply, "Bus daemon did not consider the name ours");
                Err(BusError::NotOwned(name.to_string()))
            }
            Envelope::ControlError {
                name: error_name,
                message,
                ..
            } => Err(control_error(name, &error_name, message)),
            other => Err(unexpected_reply("name release", &other)),
        }
    }

    /// Run the processing loop on the calling thread
    ///
    /// Blocks until [`leave_processing_loop`](Self::leave_processing_loop) is
    /// called (from a dispatch handler or through a [`LoopStopper`]) or the
    /// transport fails.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if a loop of either kind is active
    /// - `Transport` if the transport became unusable
    pub fn enter_processing_loop(&self) -> Result<(), BusError> {
        self.engine.check_fault()?;
        let stop = self.control.begin(LoopState::RunningSync)?;

        info!(unique_name = %self.unique_name(), "Entering processing loop");
        let result = self.block_on("enter the processing loop", || self.engine.run(stop));
        self.control.finish();
        info!("Left processing loop");

        result?
    }

    /// Run the processing loop on a background thread
    ///
    /// Returns as soon as the thread is started.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if a loop of either kind is active
    /// - `Transport` if the transport already failed or the thread cannot start
    pub fn enter_processing_loop_async(&self) -> Result<(), BusError> {
        self.engine.check_fault()?;
        let stop = self.control.begin(LoopState::RunningAsync)?;

        let Some(runtime) = self.runtime.as_ref().map(|rt| rt.handle().clone()) else {
            self.control.finish();
            return Err(closed());
        };
        let engine = Arc::clone(&self.engine);
        let control = Arc::clone(&self.control);

        // Held until the handle is stored, so a concurrent leave joins this thread
        let mut worker = self.worker.lock();

        // A previous loop that was left from its own thread is still unjoined
        if let Some(stale) = worker.take() {
            if let Ok(Err(e)) = stale.join() {
                debug!(error = %e, "Reaped previous processing loop");
            }
        }

        let spawned = thread::Builder::new()
            .name("busway-loop".to_string())
            .spawn(move || {
                let result = runtime.block_on(engine.run(stop));
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "Background processing loop failed");
                }
                control.finish();
                result
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(unique_name = %self.unique_name(), "Processing loop started in background");
                Ok(())
            }
            Err(e) => {
                self.control.finish();
                Err(BusError::Transport(format!(
                    "Failed to spawn processing loop thread: {e}"
                )))
            }
        }
    }

    /// Stop the active processing loop
    ///
    /// See [`LoopStopper::leave_processing_loop`].
    pub fn leave_processing_loop(&self) -> Result<(), BusError> {
        self.stop_handle().leave_processing_loop()
    }

    fn block_on<F, M>(&self, operation: &str, make: M) -> Result<F::Output, BusError>
    where
        M: FnOnce() -> F + Send,
        F: Future,
        F::Output: Send,
    {
        if self.engine.is_dispatching() {
            return Err(BusError::Transport(format!(
                "Cannot {operation} from this connection's dispatch handler"
            )));
        }
        let runtime = self.runtime.as_ref().ok_or_else(closed)?;
        drive(runtime, make)
    }
}

impl BusConnection for Connection {
    fn request_name(&self, name: &str) -> Result<(), BusError> {
        Connection::request_name(self, name)
    }

    fn release_name(&self, name: &str) -> Result<(), BusError> {
        Connection::release_name(self, name)
    }

    fn enter_processing_loop(&self) -> Result<(), BusError> {
        Connection::enter_processing_loop(self)
    }

    fn enter_processing_loop_async(&self) -> Result<(), BusError> {
        Connection::enter_processing_loop_async(self)
    }

    fn leave_processing_loop(&self) -> Result<(), BusError> {
        Connection::leave_processing_loop(self)
    }

    fn bus_kind(&self) -> BusKind {
        self.bus
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.control.state() == LoopState::RunningSync {
            warn!("Connection dropped while a blocking processing loop is running");
        }

        if let Err(e) = self.leave_processing_loop() {
            debug!(error = %e, "Processing loop had failed before close");
        }

        if let Some(runtime) = self.runtime.take() {
            if self.engine.is_dispatching() {
                debug!("Connection dropped from its own dispatch handler, skipping flush");
            } else if let Err(e) = drive(&runtime, || self.engine.transport.close()) {
                warn!(error = %e, "Failed to flush outbound frames on close");
            }
            runtime.shutdown_background();
        }

        info!(unique_name = %self.greeting.unique_name, bus = %self.bus, "Connection closed");
    }
}

/// Run the future built by `make` to completion on `runtime`
///
/// A thread that already carries a tokio context cannot block on another
/// runtime, so the future is built and driven on a scoped helper thread.
fn drive<F, M>(runtime: &Runtime, make: M) -> Result<F::Output, BusError>
where
    M: FnOnce() -> F + Send,
    F: Future,
    F::Output: Send,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return Ok(runtime.block_on(make()));
    }

    thread::scope(|scope| {
        let helper = thread::Builder::new()
            .name("busway-call".to_string())
            .spawn_scoped(scope, || runtime.block_on(make()))
            .map_err(|e| BusError::Transport(format!("Failed to spawn helper thread: {e}")))?;
        helper
            .join()
            .map_err(|_| BusError::Transport("Blocking call panicked".to_string()))
    })
}

fn closed() -> BusError {
    BusError::Transport("Connection is closed".to_string())
}

fn control_error(name: &str, error_name: &str, message: String) -> BusError {
    match error_name {
        error_names::INVALID_ARGS => BusError::InvalidName {
            name: name.to_string(),
            reason: message,
        },
        error_names::NAME_EXISTS => BusError::NameUnavailable(name.to_string()),
        error_names::NAME_HAS_NO_OWNER => BusError::NotOwned(name.to_string()),
        _ => BusError::Transport(format!("{error_name}: {message}")),
    }
}

fn unexpected_reply(operation: &str, reply: &Envelope) -> BusError {
    BusError::Transport(format!("Unexpected reply to {operation}: {reply:?}"))
}
