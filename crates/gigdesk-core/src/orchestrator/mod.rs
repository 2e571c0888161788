//! The Next Best Action engine.
//!
//! `Engine` owns two sweeps that the scheduler fires on independent tickers:
//!
//! - detection: expire stale actions, then for every user classify each lead,
//!   job and invoice, register detections and recommend at most one action
//!   per entity
//! - execution: pass each active auto-executable action through the
//!   `AutoExecutionGuard`, which delivers it and appends an execution log row
//!
//! Every store and delivery call is wrapped in [`bounded`] so a hung backend
//! only skips the current unit of work.

use std::future::Future;
use std::time::Duration;

use crate::error::{GigError, Result};

pub mod engine;
pub mod guard;
pub mod locks;
pub mod records;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{ActionView, DetectionReport, Engine, ExecutionReport};
pub use guard::{AutoExecutionGuard, GuardReport};
pub use locks::EntityLocks;
pub use records::{ActionState, AutoExecutionLog, NextAction, StallDetection};
pub use registry::{ActionOutcome, DetectionOutcome, ProcessOutcome, Registry};
pub use scheduler::{
    channel_ticker, start_engine, start_with_tickers, ChannelTicker, EngineHandle, IntervalTicker,
    Ticker,
};

/// Await `fut` for at most `limit`.
pub async fn bounded<T>(
    op: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GigError::Timeout {
            op: op.to_string(),
            secs: limit.as_secs(),
        }),
    }
}
