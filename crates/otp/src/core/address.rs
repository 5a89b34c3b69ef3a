// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point addressing: (system, group, point) triplets.

use crate::error::{Error, Result};
use std::fmt;

/// Lowest valid system number.
pub const SYSTEM_MIN: u8 = 1;
/// Highest valid system number.
pub const SYSTEM_MAX: u8 = 200;
/// Lowest valid group number.
pub const GROUP_MIN: u16 = 1;
/// Highest valid group number.
pub const GROUP_MAX: u16 = 60_000;
/// Lowest valid point number.
pub const POINT_MIN: u32 = 1;
/// Highest valid point number.
pub const POINT_MAX: u32 = 4_000_000_000;

/// Highest valid priority.
pub const PRIORITY_MAX: u8 = 200;
/// Default priority assigned when a producer does not specify one.
pub const PRIORITY_DEFAULT: u8 = 100;

/// A point address: (system, group, point).
///
/// Ordering is lexicographic in declaration order, which the derived `Ord`
/// provides directly.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub system: u8,
    pub group: u16,
    pub point: u32,
}

impl Address {
    /// Create an address, validating every component against its protocol
    /// range.
    pub fn new(system: u8, group: u16, point: u32) -> Result<Self> {
        let address = Self {
            system,
            group,
            point,
        };
        address.validate()?;
        Ok(address)
    }

    /// Range-check all three components.
    pub fn validate(&self) -> Result<()> {
        let system_ok = (SYSTEM_MIN..=SYSTEM_MAX).contains(&self.system);
        let group_ok = (GROUP_MIN..=GROUP_MAX).contains(&self.group);
        let point_ok = (POINT_MIN..=POINT_MAX).contains(&self.point);
        if system_ok && group_ok && point_ok {
            Ok(())
        } else {
            Err(Error::AddressOutOfRange {
                system: self.system,
                group: self.group,
                point: self.point,
            })
        }
    }
}

/// Range-check a priority value.
pub fn validate_priority(priority: u8) -> Result<()> {
    if priority <= PRIORITY_MAX {
        Ok(())
    } else {
        Err(Error::PriorityOutOfRange { priority })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.system, self.group, self.point)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_bounds() {
        assert!(Address::new(0, 1, 1).is_err()); // system below range
        assert!(Address::new(201, 1, 1).is_err());
        assert!(Address::new(1, 0, 1).is_err());
        assert!(Address::new(1, 60_001, 1).is_err());
        assert!(Address::new(1, 1, 0).is_err());
        assert!(Address::new(1, 1, 4_000_000_001).is_err());

        // Extremes of every range are valid.
        assert!(Address::new(1, 1, 1).is_ok());
        assert!(Address::new(200, 60_000, 4_000_000_000).is_ok());
    }

    #[test]
    fn test_address_ordering_lexicographic() {
        let a = Address::new(1, 2, 3).expect("valid address");
        let b = Address::new(1, 2, 4).expect("valid address");
        let c = Address::new(1, 3, 1).expect("valid address");
        let d = Address::new(2, 1, 1).expect("valid address");

        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_priority_bounds() {
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(200).is_ok());
        assert!(validate_priority(201).is_err());
    }

    #[test]
    fn test_address_display() {
        let address = Address::new(7, 42, 9001).expect("valid address");
        assert_eq!(address.to_string(), "7/42/9001");
    }
}
