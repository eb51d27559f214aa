//! ASN.1 DER decoder (C3), used to sanity-check SPNEGO tokens carried inside
//! auth-phase packets. This is a validator, not a general-purpose parser: it
//! walks the tag/length tree and confirms it is well-formed without building
//! up a value tree, restoring the caller's cursor regardless of outcome.

use crate::error::{Asn1Error, Result};
use crate::packet::NetworkPacket;

/// Universal tag number for SEQUENCE, the only universal tag this decoder
/// treats as constructed-and-recursable.
const UNIVERSAL_SEQUENCE_TAG: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl From<u8> for Class {
    fn from(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Class::Universal,
            1 => Class::Application,
            2 => Class::ContextSpecific,
            _ => Class::Private,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Identifier {
    pub class: Class,
    pub constructed: bool,
    pub tag: u8,
}

/// Reads one identifier octet. High-tag-number form (`tag == 0x1f`) is
/// rejected as unsupported; this decoder only needs to walk SPNEGO-shaped
/// trees, which never use it.
pub fn read_id(packet: &mut NetworkPacket) -> Result<Identifier> {
    let b = packet.get(1)?[0];
    let tag = b & 0x1f;
    if tag == 0x1f {
        return Err(Asn1Error::Unsupported("high-tag-number form").into());
    }
    Ok(Identifier {
        class: Class::from(b >> 6),
        constructed: (b & 0x20) != 0,
        tag,
    })
}

/// Reads a DER length: short form is a single byte with the high bit clear;
/// long form is a length-of-length byte (high bit set, low 7 bits = N)
/// followed by N big-endian bytes. `N == 0` (indefinite length) and `N > 8`
/// (would not fit in a u64) are both rejected.
pub fn read_length(packet: &mut NetworkPacket) -> Result<u64> {
    let b = packet.get(1)?[0];
    if b & 0x80 == 0 {
        return Ok(b as u64);
    }

    let len_len = b & 0x7f;
    if len_len == 0 {
        return Err(Asn1Error::Invalid("extended length can't be 0").into());
    }
    if len_len > 8 {
        return Err(Asn1Error::Unsupported("length exceeds 64 bits").into());
    }

    let bytes = packet.get(len_len as usize)?;
    let mut val: u64 = 0;
    for &byte in bytes {
        val = (val << 8) | byte as u64;
    }
    Ok(val)
}

pub fn read_header(packet: &mut NetworkPacket) -> Result<(Identifier, u64)> {
    let id = read_id(packet)?;
    let len = read_length(packet)?;
    Ok((id, len))
}

/// Decodes an OID from its contents octets (the bytes following the tag and
/// length, i.e. what `read_header` would hand you the length of).
///
/// The first octet encodes two arc values per X.690 8.19.4: `b / 40` and
/// `b % 40`. Remaining octets are base-128 varints, most-significant-group
/// first, with the continuation bit (0x80) set on every octet but the last
/// of a segment. A segment longer than 9 octets cannot fit in a u64 and is
/// rejected.
pub fn read_oid(data: &[u8]) -> Result<String> {
    if data.is_empty() {
        return Err(Asn1Error::Eof("OID first octet").into());
    }

    let first = data[0];
    let mut out = format!("{}.{}", first / 40, first % 40);

    let mut val: u64 = 0;
    let mut octets_in_segment = 0u8;
    let mut in_segment = false;

    for &byte in &data[1..] {
        in_segment = true;
        octets_in_segment += 1;
        if octets_in_segment > 9 {
            return Err(Asn1Error::Unsupported(
                "OID segment does not fit in 64 bits",
            )
            .into());
        }
        val = (val << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            out.push('.');
            out.push_str(&val.to_string());
            val = 0;
            octets_in_segment = 0;
            in_segment = false;
        }
    }

    if in_segment {
        return Err(Asn1Error::Eof("truncated OID segment").into());
    }

    Ok(out)
}

fn is_recursable(id: &Identifier) -> bool {
    matches!(id.class, Class::Application | Class::ContextSpecific)
        || (id.class == Class::Universal && id.tag == UNIVERSAL_SEQUENCE_TAG)
}

fn validate_internal(packet: &mut NetworkPacket) -> Result<()> {
    let (id, len) = read_header(packet)?;
    let len = usize::try_from(len).map_err(|_| Asn1Error::Unsupported("length overflows usize"))?;

    if !is_recursable(&id) {
        packet.skip(len)?;
        return Ok(());
    }

    let sub_bytes = packet.get(len)?;
    let mut sub = NetworkPacket::new(sub_bytes);

    if id.class == Class::Universal && id.tag == UNIVERSAL_SEQUENCE_TAG {
        // A SEQUENCE's contents are a run of sibling fields; keep recursing
        // until the subview is exhausted.
        while sub.has_more(1) {
            validate_internal(&mut sub)?;
        }
    } else {
        validate_internal(&mut sub)?;
    }

    if sub.has_more(1) {
        return Err(Asn1Error::Invalid("trailing bytes inside tagged construct").into());
    }

    Ok(())
}

/// Validates a DER tree starting at the packet's current cursor. Restores
/// the cursor to its original position regardless of outcome; this is a
/// read-only sanity check, not a parse that advances the caller's packet.
pub fn validate(packet: &mut NetworkPacket) -> Result<()> {
    let start = packet.cursor();
    let result = validate_internal(packet);
    packet.set_cursor(start);
    result
}
