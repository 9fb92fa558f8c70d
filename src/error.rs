//! Crate-level error type.
//!
//! Recoverable protocol outcomes (stale diffs, gaps, unknown references)
//! are decision enums on the engine, not errors; only genuine misuse or
//! configuration problems surface here.

use thiserror::Error;

use crate::core::LimitsError;
use crate::engine::events::BroadcastError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Limits(#[from] LimitsError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

pub type Result<T> = std::result::Result<T, Error>;
