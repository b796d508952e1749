// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for the command-submission core.

use core::fmt;

/// Command-submission result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Command-submission error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// DMA block allocation or device-memory mapping failed during bring-up.
    /// Fatal to device init; partial init is fully unwound.
    ResourceExhausted,
    /// Bad index, size or offset supplied at init; rejected before any
    /// allocation takes place.
    InvalidConfiguration,
    /// Another scheduling pass is in flight or the hardware lock is
    /// contended. Always retryable, never fatal.
    Busy,
    /// A bounded hardware wait exceeded its timeout. The current fire or
    /// quiescence attempt was aborted; the device remains usable.
    Lockup,
    /// A blocking wait was cancelled by an external signal.
    Interrupted,
    /// Internal consistency violation (double lock release, double reclaim,
    /// submit without the lock held). Logged loudly and counted; a single
    /// misbehaving client must not take the device down.
    ProtocolViolation,
}

impl Error {
    /// Whether the caller may simply retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => write!(f, "DMA allocation or mapping failed"),
            Error::InvalidConfiguration => write!(f, "Invalid configuration"),
            Error::Busy => write!(f, "Scheduler or lock busy"),
            Error::Lockup => write!(f, "Hardware lockup detected"),
            Error::Interrupted => write!(f, "Wait interrupted"),
            Error::ProtocolViolation => write!(f, "Internal consistency violation"),
        }
    }
}

impl std::error::Error for Error {}
