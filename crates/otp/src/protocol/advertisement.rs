// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Advertisement layers: module, name, and system discovery listings.
//!
//! Each listing is one PDU; listings that exceed a single datagram's budget
//! are paginated through the root folio/page fields by the producer engine.

use crate::core::address::{SYSTEM_MAX, SYSTEM_MIN};
use crate::core::ser::{Cursor, CursorMut, SerError, SerResult};
use crate::core::Address;
use crate::protocol::constants::{
    ADVERTISEMENT_HEADER_SIZE, MODULE_AD_ENTRY_SIZE, NAME_AD_ENTRY_SIZE,
    OPTION_MODULE_AD_REQUEST, SYSTEM_AD_ENTRY_SIZE, VECTOR_ADVERTISEMENT_MODULE,
    VECTOR_ADVERTISEMENT_NAME, VECTOR_ADVERTISEMENT_SYSTEM,
};
use crate::protocol::module::ModuleIdentifier;

/// One (address, point name) pair in a name advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAdvertisement {
    pub address: Address,
    pub name: String,
}

/// A parsed advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementLayer {
    /// Supported module identifiers. With `request` set this is a consumer
    /// asking producers to answer with their own lists.
    Module {
        request: bool,
        modules: Vec<ModuleIdentifier>,
    },
    /// Point names exposed by a producer.
    Name { points: Vec<NameAdvertisement> },
    /// System numbers a producer publishes.
    System { systems: Vec<u8> },
}

impl AdvertisementLayer {
    /// Size of the full advertisement PDU including header.
    pub fn encoded_size(&self) -> usize {
        ADVERTISEMENT_HEADER_SIZE
            + match self {
                AdvertisementLayer::Module { modules, .. } => {
                    1 + modules.len() * MODULE_AD_ENTRY_SIZE
                }
                AdvertisementLayer::Name { points } => points.len() * NAME_AD_ENTRY_SIZE,
                AdvertisementLayer::System { systems } => systems.len() * SYSTEM_AD_ENTRY_SIZE,
            }
    }

    fn vector(&self) -> u32 {
        match self {
            AdvertisementLayer::Module { .. } => VECTOR_ADVERTISEMENT_MODULE,
            AdvertisementLayer::Name { .. } => VECTOR_ADVERTISEMENT_NAME,
            AdvertisementLayer::System { .. } => VECTOR_ADVERTISEMENT_SYSTEM,
        }
    }

    /// Serialize as a root-layer payload.
    pub fn encode(&self) -> SerResult<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_size()];
        let mut cursor = CursorMut::new(&mut out);
        cursor.write_u32_be(self.vector())?;
        cursor.write_u16_be((self.encoded_size() - 6) as u16)?;

        match self {
            AdvertisementLayer::Module { request, modules } => {
                let options = if *request { OPTION_MODULE_AD_REQUEST } else { 0 };
                cursor.write_u8(options)?;
                for ident in modules {
                    cursor.write_u16_be(ident.manufacturer)?;
                    cursor.write_u16_be(ident.number)?;
                }
            }
            AdvertisementLayer::Name { points } => {
                for entry in points {
                    cursor.write_u8(entry.address.system)?;
                    cursor.write_u16_be(entry.address.group)?;
                    cursor.write_u32_be(entry.address.point)?;
                    cursor.write_fixed_name(&entry.name)?;
                }
            }
            AdvertisementLayer::System { systems } => {
                for system in systems {
                    cursor.write_u8(*system)?;
                }
            }
        }
        debug_assert_eq!(cursor.offset(), self.encoded_size());
        Ok(out)
    }

    /// Parse a root-layer payload; the payload must be exactly one
    /// advertisement PDU.
    pub fn parse(payload: &[u8]) -> SerResult<Self> {
        let mut cursor = Cursor::new(payload);
        let vector = cursor.read_u32_be()?;
        let declared = cursor.read_u16_be()? as usize;
        if declared != payload.len() - 6 {
            return Err(SerError::InvalidData {
                reason: format!(
                    "advertisement length {} disagrees with payload of {} bytes",
                    declared,
                    payload.len()
                ),
            });
        }

        match vector {
            VECTOR_ADVERTISEMENT_MODULE => {
                let options = cursor.read_u8()?;
                let list = cursor.remaining();
                if list % MODULE_AD_ENTRY_SIZE != 0 {
                    return Err(SerError::InvalidData {
                        reason: format!("module list of {} bytes not a multiple of 4", list),
                    });
                }
                let mut modules = Vec::with_capacity(list / MODULE_AD_ENTRY_SIZE);
                while !cursor.is_eof() {
                    let manufacturer = cursor.read_u16_be()?;
                    let number = cursor.read_u16_be()?;
                    modules.push(ModuleIdentifier::new(manufacturer, number));
                }
                Ok(AdvertisementLayer::Module {
                    request: options & OPTION_MODULE_AD_REQUEST != 0,
                    modules,
                })
            }
            VECTOR_ADVERTISEMENT_NAME => {
                let list = cursor.remaining();
                if list % NAME_AD_ENTRY_SIZE != 0 {
                    return Err(SerError::InvalidData {
                        reason: format!("name list of {} bytes not a multiple of 39", list),
                    });
                }
                let mut points = Vec::with_capacity(list / NAME_AD_ENTRY_SIZE);
                while !cursor.is_eof() {
                    let system = cursor.read_u8()?;
                    let group = cursor.read_u16_be()?;
                    let point = cursor.read_u32_be()?;
                    let name = cursor.read_fixed_name()?;
                    let address =
                        Address::new(system, group, point).map_err(|_| SerError::InvalidData {
                            reason: format!(
                                "advertised address {}/{}/{} out of range",
                                system, group, point
                            ),
                        })?;
                    points.push(NameAdvertisement { address, name });
                }
                Ok(AdvertisementLayer::Name { points })
            }
            VECTOR_ADVERTISEMENT_SYSTEM => {
                let mut systems = Vec::with_capacity(cursor.remaining());
                while !cursor.is_eof() {
                    let system = cursor.read_u8()?;
                    if !(SYSTEM_MIN..=SYSTEM_MAX).contains(&system) {
                        return Err(SerError::InvalidData {
                            reason: format!("advertised system {} out of range", system),
                        });
                    }
                    systems.push(system);
                }
                Ok(AdvertisementLayer::System { systems })
            }
            other => Err(SerError::InvalidData {
                reason: format!("unknown advertisement vector {:#010x}", other),
            }),
        }
    }
}
