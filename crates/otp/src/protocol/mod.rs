// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OTP PDU layer stack (ANSI E1.59-2021).
//!
//! A datagram nests up to four layers:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  OTP root layer (identifier, CID, folio/page, name, footer)  |
//! |  +--------------------------------------------------------+  |
//! |  |  Transform layer (system, timestamp, options)          |  |
//! |  |  +--------------------------------------------------+  |  |
//! |  |  |  Point layer (priority, group, point, timestamp) |  |  |
//! |  |  |  +--------------------------------------------+  |  |  |
//! |  |  |  |  Module layer (manufacturer, number, data) |  |  |  |
//! |  |  |  +--------------------------------------------+  |  |  |
//! |  |  +--------------------------------------------------+  |  |
//! |  +--------------------------------------------------------+  |
//! |  ...or an Advertisement layer (module/name/system lists)     |
//! +--------------------------------------------------------------+
//! ```
//!
//! [`parse_datagram`] is the single receive-side entry point; any violation
//! anywhere in the stack rejects the whole datagram.

pub mod advertisement;
pub mod constants;
pub mod folio;
pub mod module;
pub mod root;
pub mod transform;

pub use advertisement::{AdvertisementLayer, NameAdvertisement};
pub use folio::{FolioAssembler, FolioOutcome, StreamKey};
pub use module::{Module, ModuleIdentifier, ModuleRegistry, Scaling};
pub use root::RootLayer;
pub use transform::{PointLayer, TransformLayer};

use crate::core::ser::{SerError, SerResult};
use constants::{VECTOR_ADVERTISEMENT, VECTOR_TRANSFORM};

/// The vector-coded payload of a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpPacket {
    Transform(TransformLayer),
    Advertisement(AdvertisementLayer),
}

/// A fully validated datagram: root header plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDatagram {
    pub root: RootLayer,
    pub packet: OtpPacket,
}

/// Parse and validate one datagram through the full layer stack.
///
/// Module payloads are resolved through `registry`; identifiers without a
/// decoder surface as [`Module::Opaque`].
pub fn parse_datagram(datagram: &[u8], registry: &ModuleRegistry) -> SerResult<ParsedDatagram> {
    let (root, payload) = RootLayer::parse(datagram)?;
    let packet = match root.vector {
        VECTOR_TRANSFORM => OtpPacket::Transform(TransformLayer::parse(payload, registry)?),
        VECTOR_ADVERTISEMENT => {
            OtpPacket::Advertisement(AdvertisementLayer::parse(payload)?)
        }
        other => {
            // RootLayer::parse only admits the two vectors above.
            return Err(SerError::InvalidData {
                reason: format!("unknown root vector {:#010x}", other),
            });
        }
    };
    Ok(ParsedDatagram { root, packet })
}

/// Serialize a packet under `root` into a complete datagram.
pub fn build_datagram(root: &RootLayer, packet: &OtpPacket) -> SerResult<Vec<u8>> {
    let payload = match packet {
        OtpPacket::Transform(layer) => layer.encode()?,
        OtpPacket::Advertisement(layer) => layer.encode()?,
    };
    root.build(&payload)
}
