// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Public error type for the OTP API.
//!
//! Configuration errors are returned from the mutating call that caused them.
//! Wire-level violations never reach this type: malformed datagrams are
//! dropped and counted in [`crate::consumer::ConsumerStats`].

use crate::core::Address;
use crate::protocol::module::ModuleIdentifier;
use std::fmt;
use std::io;

/// OTP API error.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// System, group, or point number outside its protocol range.
    AddressOutOfRange { system: u8, group: u16, point: u32 },
    /// A point with this (address, priority) pair already exists.
    DuplicatePoint { address: Address, priority: u8 },
    /// Mutation targets an address with no matching point.
    NoSuchPoint { address: Address },
    /// Mutation targets a module identifier not present on the point.
    NoSuchModule { ident: ModuleIdentifier },
    /// Point name exceeds the 32-byte wire ceiling on a validated entry point.
    InvalidName { name: String },
    /// Priority outside 0..=200.
    PriorityOutOfRange { priority: u8 },
    /// Operation is illegal in the component's current lifecycle state.
    InvalidState(&'static str),

    // ========================================================================
    // Transport Errors (surface from start() only)
    // ========================================================================
    /// Failed to bind a socket to the selected interface.
    Bind(io::Error),
    /// Other I/O failure while bringing sockets up.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AddressOutOfRange {
                system,
                group,
                point,
            } => write!(
                f,
                "address out of range: system={} group={} point={}",
                system, group, point
            ),
            Error::DuplicatePoint { address, priority } => {
                write!(f, "duplicate point {} at priority {}", address, priority)
            }
            Error::NoSuchPoint { address } => write!(f, "no point at {}", address),
            Error::NoSuchModule { ident } => write!(f, "no module {}", ident),
            Error::InvalidName { name } => {
                write!(f, "name exceeds 32 bytes: {:?}", name)
            }
            Error::PriorityOutOfRange { priority } => {
                write!(f, "priority {} outside 0..=200", priority)
            }
            Error::InvalidState(what) => write!(f, "invalid state: {}", what),
            Error::Bind(err) => write!(f, "interface bind failed: {}", err),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind(err) | Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Address;

    #[test]
    fn test_display_variants() {
        let err = Error::AddressOutOfRange {
            system: 0,
            group: 1,
            point: 1,
        };
        assert_eq!(
            err.to_string(),
            "address out of range: system=0 group=1 point=1"
        );

        let address = Address::new(1, 2, 3).expect("valid address");
        let err = Error::DuplicatePoint {
            address,
            priority: 100,
        };
        assert_eq!(err.to_string(), "duplicate point 1/2/3 at priority 100");
    }

    #[test]
    fn test_io_error_source() {
        let err = Error::Bind(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(std::error::Error::source(&err).is_some());

        let err = Error::InvalidState("already running");
        assert!(std::error::Error::source(&err).is_none());
    }
}
