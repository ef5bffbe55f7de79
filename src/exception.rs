//! Handler failure policy.
//!
//! Event handlers report failures as `anyhow::Error`; an exception handler
//! decides whether the processing loop keeps going or halts. Whatever the
//! decision, the processor's sequence advances past the failing event so a
//! poison event can never wedge the ring.

use tracing::{error, warn};

use crate::{Error, Result};

/// Policy for failures escaping an event or work handler.
pub trait ExceptionHandler<E>: Send + Sync {
    /// Called with the failing event still in the ring.
    ///
    /// # Errors
    /// Return an error to halt the owning processor; return `Ok(())` to
    /// skip the event and continue.
    fn handle_event_exception(&self, cause: &anyhow::Error, sequence: i64, event: &E)
        -> Result<()>;

    /// Called when a handler's timeout notification fails.
    ///
    /// # Errors
    /// Return an error to halt the owning processor; the default logs and
    /// continues.
    fn handle_timeout_exception(&self, cause: &anyhow::Error, sequence: i64) -> Result<()> {
        error!(%cause, sequence, "handler failed during timeout notification");
        Ok(())
    }

    /// Called when a handler's startup notification fails.
    fn handle_on_start_exception(&self, cause: &anyhow::Error) {
        error!(%cause, "handler failed during startup");
    }

    /// Called when a handler's shutdown notification fails.
    fn handle_on_shutdown_exception(&self, cause: &anyhow::Error) {
        error!(%cause, "handler failed during shutdown");
    }
}

/// Log the failure and halt the processor.
///
/// The safe default: a handler that throws is assumed to be in an unknown
/// state, and silently skipping events hides corruption.
#[derive(Debug, Default, Clone, Copy)]
pub struct FatalExceptionHandler;

impl<E: std::fmt::Debug> ExceptionHandler<E> for FatalExceptionHandler {
    fn handle_event_exception(
        &self,
        cause: &anyhow::Error,
        sequence: i64,
        event: &E,
    ) -> Result<()> {
        error!(%cause, sequence, ?event, "fatal handler failure, halting processor");
        Err(Error::FatalEventHandler(sequence))
    }
}

/// Log the failure and keep processing.
///
/// For pipelines where dropping one event is cheaper than stopping.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreExceptionHandler;

impl<E: std::fmt::Debug> ExceptionHandler<E> for IgnoreExceptionHandler {
    fn handle_event_exception(
        &self,
        cause: &anyhow::Error,
        sequence: i64,
        event: &E,
    ) -> Result<()> {
        warn!(%cause, sequence, ?event, "handler failure ignored, skipping event");
        Ok(())
    }
}
