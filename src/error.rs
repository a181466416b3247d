// error.rs: Terminal status of a convolution call.
//
// Every device-facing step returns `Result<_, ConvError>`. The engine never
// retries and never recovers: the first error aborts the remaining steps,
// the device scope is released, and that same error is returned. `Status`
// is the flat, machine-readable projection of the outcome (exit codes,
// metrics labels).

use std::fmt;

use thiserror::Error;

/// Direction of a host↔device copy, named in transfer diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::HostToDevice => write!(f, "host→device"),
            Direction::DeviceToHost => write!(f, "device→host"),
        }
    }
}

/// Errors surfaced by a convolution call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvError {
    /// No accelerator could be selected or opened.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A device buffer could not be allocated.
    #[error("device allocation of {bytes} bytes failed: {reason}")]
    AllocationFailure { bytes: u64, reason: String },

    /// A host↔device copy failed or was issued with the wrong extent.
    #[error("{direction} transfer failed: {reason}")]
    TransferFailure { direction: Direction, reason: String },

    /// The convolution kernel could not be launched.
    #[error("conv2d launch failed: {0}")]
    LaunchFailure(String),

    /// The blocking wait after launch did not complete cleanly.
    #[error("device synchronization failed: {0}")]
    SynchronizationFailure(String),

    /// The batch was rejected before any device work.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// The declared output shape is inconsistent with the 3×3 filter.
    #[error(
        "output shape {rows_out}×{cols_out} is not reachable from input \
         {rows}×{cols} with a 3×3 filter (expected rows/cols ±2 or equal)"
    )]
    OutputShape {
        rows: usize,
        cols: usize,
        rows_out: usize,
        cols_out: usize,
    },
}

impl ConvError {
    pub(crate) fn upload(reason: impl Into<String>) -> Self {
        ConvError::TransferFailure {
            direction: Direction::HostToDevice,
            reason: reason.into(),
        }
    }

    pub(crate) fn download(reason: impl Into<String>) -> Self {
        ConvError::TransferFailure {
            direction: Direction::DeviceToHost,
            reason: reason.into(),
        }
    }

    /// The status code this error maps to.
    pub fn status(&self) -> Status {
        match self {
            ConvError::DeviceUnavailable(_) => Status::DeviceUnavailable,
            ConvError::AllocationFailure { .. } => Status::AllocationFailure,
            ConvError::TransferFailure { .. } => Status::TransferFailure,
            ConvError::LaunchFailure(_) => Status::LaunchFailure,
            ConvError::SynchronizationFailure(_) => Status::SynchronizationFailure,
            ConvError::InvalidBatch(_) | ConvError::OutputShape { .. } => Status::InvalidInput,
        }
    }
}

/// Flat outcome code of a convolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    DeviceUnavailable,
    AllocationFailure,
    TransferFailure,
    LaunchFailure,
    SynchronizationFailure,
    InvalidInput,
}

impl Status {
    /// Stable integer code, 0 on success.
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::DeviceUnavailable => 1,
            Status::AllocationFailure => 2,
            Status::TransferFailure => 3,
            Status::LaunchFailure => 4,
            Status::SynchronizationFailure => 5,
            Status::InvalidInput => 6,
        }
    }

    pub fn of<T>(result: &Result<T, ConvError>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
