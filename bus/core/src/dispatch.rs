//! Dispatch Callback Surface
//!
//! The processing loop hands every received frame, in arrival order, to one
//! [`DispatchHandler`]. Frames that failed integrity checks arrive as
//! `Err(BusError::MalformedFrame)` so the handler can account for them; the
//! loop keeps running.
//!
//! Handlers run on the loop's thread and block further reads while they
//! run. They may call [`Connection::send`](crate::Connection::send) and
//! [`leave_processing_loop`](crate::Connection::leave_processing_loop), but
//! must not enter a loop, request or release names, or replace the handler.

use crate::error::BusError;
use crate::protocol::Frame;

/// One delivery to the dispatch surface
pub type Delivery = Result<Frame, BusError>;

/// Receiver of frames pumped by the processing loop
pub trait DispatchHandler: Send {
    /// Handle one delivery
    fn dispatch(&mut self, delivery: Delivery);
}

impl<F> DispatchHandler for F
where
    F: FnMut(Delivery) + Send,
{
    fn dispatch(&mut self, delivery: Delivery) {
        self(delivery);
    }
}

/// Handler installed until the caller provides one: logs and drops
#[derive(Debug, Default)]
pub struct DiscardHandler;

impl DispatchHandler for DiscardHandler {
    fn dispatch(&mut self, delivery: Delivery) {
        match delivery {
            Ok(frame) => tracing::debug!(
                kind = ?frame.kind,
                serial = frame.serial,
                member = ?frame.member,
                "No dispatch handler installed, dropping frame"
            ),
            Err(e) => tracing::debug!(error = %e, "No dispatch handler installed, dropping error"),
        }
    }
}
