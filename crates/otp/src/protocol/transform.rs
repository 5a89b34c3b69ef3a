// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transform layer and its nested point layers.
//!
//! A transform layer carries the point state of one system at one producer
//! timestamp. Point boundaries derive from declared PDU lengths, never from
//! sentinels; every declared length is cross-checked against the bytes
//! actually consumed.

use crate::core::address::{GROUP_MAX, GROUP_MIN, POINT_MAX, POINT_MIN, PRIORITY_MAX, SYSTEM_MAX, SYSTEM_MIN};
use crate::core::ser::{Cursor, CursorMut, SerError, SerResult};
use crate::core::Address;
use crate::protocol::constants::{
    OPTION_FULL_POINT_SET, POINT_HEADER_SIZE, TRANSFORM_HEADER_SIZE, VECTOR_POINT,
    VECTOR_TRANSFORM_POINT_SET,
};
use crate::protocol::module::{parse_module, Module, ModuleRegistry};

/// One point within a transform layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointLayer {
    pub priority: u8,
    pub group: u16,
    pub point: u32,
    pub timestamp: u64,
    pub modules: Vec<Module>,
}

impl PointLayer {
    /// The full address of this point within `system`.
    pub fn address(&self, system: u8) -> Address {
        Address {
            system,
            group: self.group,
            point: self.point,
        }
    }

    /// Size of the full point PDU including header.
    pub fn encoded_size(&self) -> usize {
        POINT_HEADER_SIZE + self.modules.iter().map(Module::encoded_size).sum::<usize>()
    }

    fn encode(&self, cursor: &mut CursorMut<'_>) -> SerResult<()> {
        cursor.write_u32_be(VECTOR_POINT)?;
        cursor.write_u16_be((self.encoded_size() - 6) as u16)?;
        cursor.write_u8(self.priority)?;
        cursor.write_u16_be(self.group)?;
        cursor.write_u32_be(self.point)?;
        cursor.write_u64_be(self.timestamp)?;
        for module in &self.modules {
            module.encode(cursor)?;
        }
        Ok(())
    }

    fn parse(cursor: &mut Cursor<'_>, registry: &ModuleRegistry) -> SerResult<Self> {
        let vector = cursor.read_u32_be()?;
        if vector != VECTOR_POINT {
            return Err(SerError::InvalidData {
                reason: format!("unknown point vector {:#010x}", vector),
            });
        }
        let declared = cursor.read_u16_be()? as usize;
        let body = cursor.read_bytes(declared)?;

        let mut inner = Cursor::new(body);
        let priority = inner.read_u8()?;
        if priority > PRIORITY_MAX {
            return Err(SerError::InvalidData {
                reason: format!("priority {} outside 0..=200", priority),
            });
        }
        let group = inner.read_u16_be()?;
        if !(GROUP_MIN..=GROUP_MAX).contains(&group) {
            return Err(SerError::InvalidData {
                reason: format!("group {} out of range", group),
            });
        }
        let point = inner.read_u32_be()?;
        if !(POINT_MIN..=POINT_MAX).contains(&point) {
            return Err(SerError::InvalidData {
                reason: format!("point {} out of range", point),
            });
        }
        let timestamp = inner.read_u64_be()?;

        let mut modules = Vec::new();
        while !inner.is_eof() {
            modules.push(parse_module(&mut inner, registry)?);
        }

        Ok(Self {
            priority,
            group,
            point,
            timestamp,
            modules,
        })
    }
}

/// Transform layer: the point set of one system at one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformLayer {
    pub system: u8,
    pub timestamp: u64,
    pub full_point_set: bool,
    pub points: Vec<PointLayer>,
}

impl TransformLayer {
    /// Size of the full transform PDU including header.
    pub fn encoded_size(&self) -> usize {
        TRANSFORM_HEADER_SIZE
            + self
                .points
                .iter()
                .map(PointLayer::encoded_size)
                .sum::<usize>()
    }

    /// Serialize as a root-layer payload.
    pub fn encode(&self) -> SerResult<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_size()];
        let mut cursor = CursorMut::new(&mut out);
        cursor.write_u32_be(VECTOR_TRANSFORM_POINT_SET)?;
        cursor.write_u16_be((self.encoded_size() - 6) as u16)?;
        cursor.write_u8(self.system)?;
        cursor.write_u64_be(self.timestamp)?;
        let options = if self.full_point_set {
            OPTION_FULL_POINT_SET
        } else {
            0
        };
        cursor.write_u8(options)?;
        for point in &self.points {
            point.encode(&mut cursor)?;
        }
        debug_assert_eq!(cursor.offset(), self.encoded_size());
        Ok(out)
    }

    /// Parse a root-layer payload; the payload must be exactly one
    /// transform PDU.
    pub fn parse(payload: &[u8], registry: &ModuleRegistry) -> SerResult<Self> {
        let mut cursor = Cursor::new(payload);
        let vector = cursor.read_u32_be()?;
        if vector != VECTOR_TRANSFORM_POINT_SET {
            return Err(SerError::InvalidData {
                reason: format!("unknown transform vector {:#010x}", vector),
            });
        }
        let declared = cursor.read_u16_be()? as usize;
        if declared != payload.len() - 6 {
            return Err(SerError::InvalidData {
                reason: format!(
                    "transform length {} disagrees with payload of {} bytes",
                    declared,
                    payload.len()
                ),
            });
        }

        let system = cursor.read_u8()?;
        if !(SYSTEM_MIN..=SYSTEM_MAX).contains(&system) {
            return Err(SerError::InvalidData {
                reason: format!("system {} out of range", system),
            });
        }
        let timestamp = cursor.read_u64_be()?;
        let options = cursor.read_u8()?;

        let mut points = Vec::new();
        while !cursor.is_eof() {
            points.push(PointLayer::parse(&mut cursor, registry)?);
        }

        Ok(Self {
            system,
            timestamp,
            full_point_set: options & OPTION_FULL_POINT_SET != 0,
            points,
        })
    }
}
