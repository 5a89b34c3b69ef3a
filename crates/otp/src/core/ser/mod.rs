// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire serialization helpers for OTP PDU encoding/decoding.

pub mod cursor;

pub use cursor::{Cursor, CursorMut};

use std::fmt;

/// Serialization error used within the wire codec.
///
/// Carries the buffer offset at which the failure was detected; the consumer
/// engine maps every variant to a dropped datagram and a statistics bump.
#[derive(Debug, Clone)]
pub enum SerError {
    WriteFailed { offset: usize, reason: String },
    ReadFailed { offset: usize, reason: String },
    InvalidData { reason: String },
}

impl fmt::Display for SerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerError::WriteFailed { offset, reason } => {
                write!(f, "write failed at offset {}: {}", offset, reason)
            }
            SerError::ReadFailed { offset, reason } => {
                write!(f, "read failed at offset {}: {}", offset, reason)
            }
            SerError::InvalidData { reason } => write!(f, "invalid data: {}", reason),
        }
    }
}

impl std::error::Error for SerError {}

pub type SerResult<T> = core::result::Result<T, SerError>;
