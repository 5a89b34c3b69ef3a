// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OTP root layer: the outermost PDU of every datagram.
//!
//! Layout (big-endian):
//!
//! ```text
//! offset size field
//! 0      12   packet identifier "OTP-E1.59\0\0\0"
//! 12     2    flags (high nibble, zero) + length of the remainder
//! 14     4    vector (transform / advertisement)
//! 18     16   CID
//! 34     4    folio number
//! 38     2    page
//! 40     2    last page
//! 42     1    options (reserved zero)
//! 43     4    reserved
//! 47     32   component name (UTF-8, zero padded)
//! 79     1    footer length F
//! 80     F    footer bytes, then the vector-coded payload
//! ```
//!
//! The current protocol revision defines a zero-length footer; a non-zero
//! footer length is tolerated on receive by skipping the declared trailer
//! bytes, as long as the declared layer length accounts for them.

use crate::core::ser::{Cursor, CursorMut, SerError, SerResult};
use crate::core::Cid;
use crate::protocol::constants::{
    MAX_DATAGRAM_SIZE, PACKET_IDENTIFIER, ROOT_FLAGS_MASK, ROOT_LAYER_SIZE,
    ROOT_LENGTH_FIELD_END, ROOT_LENGTH_MASK, ROOT_LENGTH_OFFSET, VECTOR_ADVERTISEMENT,
    VECTOR_TRANSFORM,
};

/// Parsed OTP root layer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayer {
    pub vector: u32,
    pub cid: Cid,
    pub folio: u32,
    pub page: u16,
    pub last_page: u16,
    pub options: u8,
    pub name: String,
}

impl RootLayer {
    /// Parse the root layer of `datagram`, returning the header and the
    /// payload slice that follows the footer.
    ///
    /// Every validation failure is a `SerError`; the caller drops the
    /// datagram and bumps a counter.
    pub fn parse(datagram: &[u8]) -> SerResult<(Self, &[u8])> {
        if datagram.len() < ROOT_LAYER_SIZE {
            return Err(SerError::InvalidData {
                reason: format!("datagram too short: {} bytes", datagram.len()),
            });
        }
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(SerError::InvalidData {
                reason: format!("datagram too long: {} bytes", datagram.len()),
            });
        }

        let mut cursor = Cursor::new(datagram);
        let ident = cursor.read_bytes(PACKET_IDENTIFIER.len())?;
        if ident != PACKET_IDENTIFIER {
            return Err(SerError::InvalidData {
                reason: "packet identifier mismatch".into(),
            });
        }

        let flags_length = cursor.read_u16_be()?;
        if flags_length & ROOT_FLAGS_MASK != 0 {
            return Err(SerError::InvalidData {
                reason: "reserved root flags set".into(),
            });
        }
        let declared = (flags_length & ROOT_LENGTH_MASK) as usize;
        if ROOT_LENGTH_FIELD_END + declared != datagram.len() {
            return Err(SerError::InvalidData {
                reason: format!(
                    "root length {} disagrees with datagram of {} bytes",
                    declared,
                    datagram.len()
                ),
            });
        }

        let vector = cursor.read_u32_be()?;
        if vector != VECTOR_TRANSFORM && vector != VECTOR_ADVERTISEMENT {
            return Err(SerError::InvalidData {
                reason: format!("unknown root vector {:#010x}", vector),
            });
        }

        let cid = cursor.read_cid()?;
        let folio = cursor.read_u32_be()?;
        let page = cursor.read_u16_be()?;
        let last_page = cursor.read_u16_be()?;
        if page > last_page {
            return Err(SerError::InvalidData {
                reason: format!("page {} beyond last page {}", page, last_page),
            });
        }

        let options = cursor.read_u8()?;
        cursor.read_bytes(4)?; // reserved
        let name = cursor.read_fixed_name()?;

        let footer_len = cursor.read_u8()? as usize;
        debug_assert_eq!(cursor.offset(), ROOT_LAYER_SIZE);
        if ROOT_LAYER_SIZE + footer_len > datagram.len() {
            return Err(SerError::InvalidData {
                reason: format!(
                    "footer length {} exceeds declared layer length",
                    footer_len
                ),
            });
        }
        cursor.read_bytes(footer_len)?; // tolerated trailer, skipped

        Ok((
            Self {
                vector,
                cid,
                folio,
                page,
                last_page,
                options,
                name,
            },
            &datagram[ROOT_LAYER_SIZE + footer_len..],
        ))
    }

    /// Serialize the root layer around `payload` into a fresh datagram.
    ///
    /// Always writes a zero-length footer. Fails when the result would
    /// exceed the datagram ceiling.
    pub fn build(&self, payload: &[u8]) -> SerResult<Vec<u8>> {
        let total = ROOT_LAYER_SIZE + payload.len();
        if total > MAX_DATAGRAM_SIZE {
            return Err(SerError::WriteFailed {
                offset: total,
                reason: "datagram would exceed 1472 bytes".into(),
            });
        }

        let mut out = vec![0u8; total];
        let mut cursor = CursorMut::new(&mut out);
        cursor.write_bytes(PACKET_IDENTIFIER)?;
        let remainder = (total - ROOT_LENGTH_FIELD_END) as u16;
        debug_assert_eq!(remainder & ROOT_FLAGS_MASK, 0);
        cursor.write_u16_be(remainder)?;
        cursor.write_u32_be(self.vector)?;
        cursor.write_cid(self.cid)?;
        cursor.write_u32_be(self.folio)?;
        cursor.write_u16_be(self.page)?;
        cursor.write_u16_be(self.last_page)?;
        cursor.write_u8(self.options)?;
        cursor.write_bytes(&[0u8; 4])?; // reserved
        cursor.write_fixed_name(&self.name)?;
        cursor.write_u8(0)?; // footer length
        debug_assert_eq!(cursor.offset(), ROOT_LAYER_SIZE);
        cursor.write_bytes(payload)?;
        debug_assert_eq!(cursor.offset(), ROOT_LENGTH_OFFSET + 2 + remainder as usize);

        Ok(out)
    }
}
