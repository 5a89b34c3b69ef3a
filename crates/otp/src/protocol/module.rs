// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Module layer: typed payloads attached to points, plus the decode registry.
//!
//! Standard modules (manufacturer 0x0000) form a closed enum; anything the
//! registry cannot decode passes through as [`Module::Opaque`] and is
//! reported to the application once per (CID, identifier).
//!
//! Module PDU layout: manufacturer u16, number u16, length u16 (counting the
//! whole PDU including this 6-byte header), then the payload.

use crate::core::ser::{Cursor, CursorMut, SerError, SerResult};
use crate::protocol::constants::{
    ESTA_MANUFACTURER_ID, MODULE_HEADER_SIZE, MODULE_PARENT, MODULE_POSITION,
    MODULE_POSITION_VEL_ACCEL, MODULE_ROTATION, MODULE_ROTATION_VEL_ACCEL, MODULE_SCALE,
    OPTION_PARENT_RELATIVE,
};
use std::collections::HashMap;
use std::fmt;

/// Rotation fields are 10^-5 degree units and wrap at 360 degrees.
pub const ROTATION_MODULUS: u32 = 36_000_000;

/// Scale fields use 1_000_000 as unity.
pub const SCALE_UNITY: i32 = 1_000_000;

/// (manufacturer, module number) pair identifying a module type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleIdentifier {
    pub manufacturer: u16,
    pub number: u16,
}

impl ModuleIdentifier {
    pub const fn new(manufacturer: u16, number: u16) -> Self {
        Self {
            manufacturer,
            number,
        }
    }

    pub const fn standard(number: u16) -> Self {
        Self::new(ESTA_MANUFACTURER_ID, number)
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.manufacturer, self.number)
    }
}

impl fmt::Debug for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleIdentifier({})", self)
    }
}

/// Position scaling selector.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Scaling {
    Micrometers,
    Millimeters,
}

impl Scaling {
    fn from_wire(value: u8) -> SerResult<Self> {
        match value {
            0 => Ok(Scaling::Micrometers),
            1 => Ok(Scaling::Millimeters),
            other => Err(SerError::InvalidData {
                reason: format!("unknown position scaling {}", other),
            }),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Scaling::Micrometers => 0,
            Scaling::Millimeters => 1,
        }
    }
}

/// A decoded module value.
///
/// Integer fields carry raw protocol units; semantic interpretation is left
/// to the consumer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Module {
    Position {
        scaling: Scaling,
        x: i32,
        y: i32,
        z: i32,
    },
    PositionVelAccel {
        vx: i32,
        vy: i32,
        vz: i32,
        ax: i32,
        ay: i32,
        az: i32,
    },
    Rotation {
        x: u32,
        y: u32,
        z: u32,
    },
    RotationVelAccel {
        vx: i32,
        vy: i32,
        vz: i32,
        ax: i32,
        ay: i32,
        az: i32,
    },
    Scale {
        x: i32,
        y: i32,
        z: i32,
    },
    Parent {
        relative: bool,
        system: u8,
        group: u16,
        point: u32,
    },
    Opaque {
        ident: ModuleIdentifier,
        payload: Vec<u8>,
    },
}

impl Module {
    /// Rotation constructor that wraps each axis into [0, 360 degrees).
    pub fn rotation(x: u32, y: u32, z: u32) -> Self {
        Module::Rotation {
            x: x % ROTATION_MODULUS,
            y: y % ROTATION_MODULUS,
            z: z % ROTATION_MODULUS,
        }
    }

    pub fn identifier(&self) -> ModuleIdentifier {
        match self {
            Module::Position { .. } => ModuleIdentifier::standard(MODULE_POSITION),
            Module::PositionVelAccel { .. } => {
                ModuleIdentifier::standard(MODULE_POSITION_VEL_ACCEL)
            }
            Module::Rotation { .. } => ModuleIdentifier::standard(MODULE_ROTATION),
            Module::RotationVelAccel { .. } => {
                ModuleIdentifier::standard(MODULE_ROTATION_VEL_ACCEL)
            }
            Module::Scale { .. } => ModuleIdentifier::standard(MODULE_SCALE),
            Module::Parent { .. } => ModuleIdentifier::standard(MODULE_PARENT),
            Module::Opaque { ident, .. } => *ident,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Module::Position { .. } => 13,
            Module::PositionVelAccel { .. } | Module::RotationVelAccel { .. } => 24,
            Module::Rotation { .. } | Module::Scale { .. } => 12,
            Module::Parent { .. } => 8,
            Module::Opaque { payload, .. } => payload.len(),
        }
    }

    /// Size of the full module PDU including its 6-byte header.
    pub fn encoded_size(&self) -> usize {
        MODULE_HEADER_SIZE + self.payload_size()
    }

    /// Write the full module PDU (header + payload).
    pub fn encode(&self, cursor: &mut CursorMut<'_>) -> SerResult<()> {
        let ident = self.identifier();
        cursor.write_u16_be(ident.manufacturer)?;
        cursor.write_u16_be(ident.number)?;
        cursor.write_u16_be(self.encoded_size() as u16)?;

        match self {
            Module::Position { scaling, x, y, z } => {
                cursor.write_u8(scaling.to_wire())?;
                cursor.write_i32_be(*x)?;
                cursor.write_i32_be(*y)?;
                cursor.write_i32_be(*z)?;
            }
            Module::PositionVelAccel {
                vx,
                vy,
                vz,
                ax,
                ay,
                az,
            }
            | Module::RotationVelAccel {
                vx,
                vy,
                vz,
                ax,
                ay,
                az,
            } => {
                for value in [vx, vy, vz, ax, ay, az] {
                    cursor.write_i32_be(*value)?;
                }
            }
            Module::Rotation { x, y, z } => {
                cursor.write_u32_be(*x)?;
                cursor.write_u32_be(*y)?;
                cursor.write_u32_be(*z)?;
            }
            Module::Scale { x, y, z } => {
                cursor.write_i32_be(*x)?;
                cursor.write_i32_be(*y)?;
                cursor.write_i32_be(*z)?;
            }
            Module::Parent {
                relative,
                system,
                group,
                point,
            } => {
                let options = if *relative { OPTION_PARENT_RELATIVE } else { 0 };
                cursor.write_u8(options)?;
                cursor.write_u8(*system)?;
                cursor.write_u16_be(*group)?;
                cursor.write_u32_be(*point)?;
            }
            Module::Opaque { payload, .. } => {
                cursor.write_bytes(payload)?;
            }
        }
        Ok(())
    }
}

/// Pure decode function from a payload view to a typed module value.
pub type ModuleDecoder = fn(&[u8]) -> SerResult<Module>;

/// Decode dispatch keyed by module identifier.
///
/// Read-only after component construction; unknown identifiers fall through
/// to [`Module::Opaque`].
pub struct ModuleRegistry {
    decoders: HashMap<ModuleIdentifier, ModuleDecoder>,
}

impl ModuleRegistry {
    /// Registry with no decoders; everything decodes opaquely.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with every standard module installed.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(ModuleIdentifier::standard(MODULE_POSITION), decode_position);
        registry.register(
            ModuleIdentifier::standard(MODULE_POSITION_VEL_ACCEL),
            decode_position_vel_accel,
        );
        registry.register(ModuleIdentifier::standard(MODULE_ROTATION), decode_rotation);
        registry.register(
            ModuleIdentifier::standard(MODULE_ROTATION_VEL_ACCEL),
            decode_rotation_vel_accel,
        );
        registry.register(ModuleIdentifier::standard(MODULE_SCALE), decode_scale);
        registry.register(ModuleIdentifier::standard(MODULE_PARENT), decode_parent);
        registry
    }

    /// Standard registry restricted to `idents`.
    pub fn standard_subset(idents: &[ModuleIdentifier]) -> Self {
        let full = Self::standard();
        let mut registry = Self::empty();
        for ident in idents {
            if let Some(decoder) = full.decoders.get(ident) {
                registry.register(*ident, *decoder);
            }
        }
        registry
    }

    pub fn register(&mut self, ident: ModuleIdentifier, decoder: ModuleDecoder) {
        self.decoders.insert(ident, decoder);
    }

    pub fn contains(&self, ident: ModuleIdentifier) -> bool {
        self.decoders.contains_key(&ident)
    }

    pub fn identifiers(&self) -> Vec<ModuleIdentifier> {
        let mut idents: Vec<_> = self.decoders.keys().copied().collect();
        idents.sort_unstable();
        idents
    }

    /// Decode a payload, falling back to an opaque module when the
    /// identifier has no registered decoder.
    pub fn decode(&self, ident: ModuleIdentifier, payload: &[u8]) -> SerResult<Module> {
        match self.decoders.get(&ident) {
            Some(decoder) => decoder(payload),
            None => Ok(Module::Opaque {
                ident,
                payload: payload.to_vec(),
            }),
        }
    }
}

/// Parse one module PDU at the cursor, dispatching through `registry`.
pub fn parse_module(cursor: &mut Cursor<'_>, registry: &ModuleRegistry) -> SerResult<Module> {
    let manufacturer = cursor.read_u16_be()?;
    let number = cursor.read_u16_be()?;
    let declared = cursor.read_u16_be()? as usize;
    if declared < MODULE_HEADER_SIZE {
        return Err(SerError::InvalidData {
            reason: format!("module length {} below header size", declared),
        });
    }
    let payload = cursor.read_bytes(declared - MODULE_HEADER_SIZE)?;
    registry.decode(ModuleIdentifier::new(manufacturer, number), payload)
}

fn expect_len(payload: &[u8], expected: usize, what: &str) -> SerResult<()> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(SerError::InvalidData {
            reason: format!(
                "{} payload is {} bytes, expected {}",
                what,
                payload.len(),
                expected
            ),
        })
    }
}

fn decode_position(payload: &[u8]) -> SerResult<Module> {
    expect_len(payload, 13, "position")?;
    let mut cursor = Cursor::new(payload);
    Ok(Module::Position {
        scaling: Scaling::from_wire(cursor.read_u8()?)?,
        x: cursor.read_i32_be()?,
        y: cursor.read_i32_be()?,
        z: cursor.read_i32_be()?,
    })
}

fn decode_position_vel_accel(payload: &[u8]) -> SerResult<Module> {
    expect_len(payload, 24, "position velocity/accel")?;
    let mut cursor = Cursor::new(payload);
    Ok(Module::PositionVelAccel {
        vx: cursor.read_i32_be()?,
        vy: cursor.read_i32_be()?,
        vz: cursor.read_i32_be()?,
        ax: cursor.read_i32_be()?,
        ay: cursor.read_i32_be()?,
        az: cursor.read_i32_be()?,
    })
}

fn decode_rotation(payload: &[u8]) -> SerResult<Module> {
    expect_len(payload, 12, "rotation")?;
    let mut cursor = Cursor::new(payload);
    Ok(Module::rotation(
        cursor.read_u32_be()?,
        cursor.read_u32_be()?,
        cursor.read_u32_be()?,
    ))
}

fn decode_rotation_vel_accel(payload: &[u8]) -> SerResult<Module> {
    expect_len(payload, 24, "rotation velocity/accel")?;
    let mut cursor = Cursor::new(payload);
    Ok(Module::RotationVelAccel {
        vx: cursor.read_i32_be()?,
        vy: cursor.read_i32_be()?,
        vz: cursor.read_i32_be()?,
        ax: cursor.read_i32_be()?,
        ay: cursor.read_i32_be()?,
        az: cursor.read_i32_be()?,
    })
}

fn decode_scale(payload: &[u8]) -> SerResult<Module> {
    expect_len(payload, 12, "scale")?;
    let mut cursor = Cursor::new(payload);
    Ok(Module::Scale {
        x: cursor.read_i32_be()?,
        y: cursor.read_i32_be()?,
        z: cursor.read_i32_be()?,
    })
}

fn decode_parent(payload: &[u8]) -> SerResult<Module> {
    expect_len(payload, 8, "parent")?;
    let mut cursor = Cursor::new(payload);
    let options = cursor.read_u8()?;
    Ok(Module::Parent {
        relative: options & OPTION_PARENT_RELATIVE != 0,
        system: cursor.read_u8()?,
        group: cursor.read_u16_be()?,
        point: cursor.read_u32_be()?,
    })
}
