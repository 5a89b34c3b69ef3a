// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OTP CID (Component Identifier) implementation.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// OTP CID (Component Identifier)
///
/// 128-bit identifier, stable for the lifetime of a component instance
/// (ANSI E1.59-2021). Consumers compare CIDs as 128-bit big-endian unsigned
/// integers when breaking priority ties, which is exactly the byte-wise
/// ordering of the underlying array.
///
/// # Display Format
/// Hex with dots: "00.01.02.03.04.05.06.07.08.09.0a.0b.0c.0d.0e.0f"
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cid([u8; 16]);

impl Cid {
    /// Create a CID from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Convert to a 16-byte array.
    pub fn as_bytes(&self) -> [u8; 16] {
        self.0
    }

    /// All-zero CID (invalid/placeholder).
    pub fn zero() -> Self {
        Self([0; 16])
    }

    /// Check whether this is the all-zero placeholder.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Generate a fresh CID from the wall clock, process id, and a
    /// process-local counter.
    ///
    /// Applications that need identity continuity across runs should persist
    /// the generated value and feed it back through configuration.
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        static SEQUENCE: AtomicU32 = AtomicU32::new(0);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let mut bytes = nanos.to_be_bytes();
        let pid = std::process::id().to_be_bytes();
        for (i, b) in pid.iter().enumerate() {
            bytes[12 + i] ^= b;
        }
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed).to_be_bytes();
        for (i, b) in seq.iter().enumerate() {
            bytes[8 + i] ^= b;
        }

        Self(bytes)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}
