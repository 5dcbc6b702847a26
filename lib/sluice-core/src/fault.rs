//! Reporting of non-fatal faults to the host.

use std::fmt;

use http::StatusCode;
use tracing::{error, warn};

use crate::{event::RecordError, publisher::TransportError};

/// Why a batch was lost.
#[derive(Debug)]
pub enum LossCause {
    /// The server rejected the batch.
    Rejected {
        /// Status code returned by the server.
        status: StatusCode,

        /// Response body.
        body: String,
    },

    /// The server could not be reached, even after retrying.
    Unreachable(TransportError),
}

/// A non-fatal problem encountered by a sink.
///
/// Faults never stop the sink: the affected events are dropped and processing continues.
#[derive(Debug)]
pub enum Fault {
    /// An event was refused because the pending buffer was full.
    CapacityExceeded {
        /// Maximum number of pending events.
        capacity: usize,
    },

    /// A record could not be converted into a metric event.
    InvalidRecord(RecordError),

    /// A batch of events could not be delivered.
    BatchLost {
        /// Number of events in the lost batch.
        events: usize,

        /// Why the batch was lost.
        cause: LossCause,
    },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { capacity } => {
                write!(f, "pending buffer is full ({} events); event dropped", capacity)
            }
            Self::InvalidRecord(e) => write!(f, "invalid record: {}", e),
            Self::BatchLost { events, cause } => match cause {
                LossCause::Rejected { status, body } => write!(
                    f,
                    "batch of {} events rejected with status {}: {}",
                    events,
                    status.as_u16(),
                    body
                ),
                LossCause::Unreachable(e) => write!(f, "batch of {} events lost: {}", events, e),
            },
        }
    }
}

/// Receives faults raised by a sink.
///
/// Handlers are called inline from whichever task raised the fault, including the task submitting events, so they
/// should return quickly.
pub trait FaultHandler: Send + Sync {
    /// Handles a fault.
    fn on_fault(&self, fault: Fault);
}

impl<F> FaultHandler for F
where
    F: Fn(Fault) + Send + Sync,
{
    fn on_fault(&self, fault: Fault) {
        self(fault)
    }
}

/// A fault handler that logs every fault.
///
/// Lost batches are logged at the error level and everything else as a warning.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingFaultHandler;

impl FaultHandler for LoggingFaultHandler {
    fn on_fault(&self, fault: Fault) {
        match &fault {
            Fault::BatchLost { events, .. } => error!(events, "{}", fault),
            Fault::CapacityExceeded { capacity } => warn!(capacity, "{}", fault),
            Fault::InvalidRecord(_) => warn!("{}", fault),
        }
    }
}
