//! Wire codec (C2) for the backend protocol.
//!
//! [`RawFrameCodec`] only understands framing: `[3-byte LE length][1-byte
//! sequence id][payload]`. It hands the session state machine an opaque
//! `(sequence_id, payload)` pair per packet; the session then calls the
//! appropriate `decode_*` function below based on where it is in the
//! handshake/auth/query lifecycle. This mirrors the protocol itself, which
//! has no self-describing packet type byte outside of the command phase —
//! the *position* in the conversation determines how a packet is read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{Result, WireError};

// Capability flags (CLIENT_*), as published by the protocol.
pub const CLIENT_LONG_PASSWORD: u32 = 1;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

/// A framed packet with its framing stripped: sequence id plus raw payload.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub sequence_id: u8,
    pub payload: BytesMut,
}

/// Splits the byte stream into `[len][seq][payload]` frames. Carries no
/// interpretation of the payload — see the module docs.
#[derive(Debug, Default)]
pub struct RawFrameCodec;

impl Decoder for RawFrameCodec {
    type Item = RawPacket;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let payload_len = (src[0] as usize) | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        let total_len = 4 + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(total_len);
        let sequence_id = packet[3];
        packet.advance(4);
        Ok(Some(RawPacket {
            sequence_id,
            payload: packet,
        }))
    }
}

impl Encoder<RawPacket> for RawFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: RawPacket, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        write_packet_header(dst, item.payload.len(), item.sequence_id);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// The fixed column-type-to-name mapping from the protocol's published
/// field types. Types the proxy does not recognize still decode (the proxy
/// must stay transparent to protocol extensions) and report as `"UNKNOWN"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType(pub u8);

impl ColumnType {
    pub fn name(self) -> &'static str {
        match self.0 {
            0x01 => "TINYINT",
            0x02 => "SMALLINT",
            0x09 => "MEDIUMINT",
            0x03 => "INT",
            0x00 | 0xf6 => "DECIMAL",
            0x07 | 0x12 => "TIMESTAMP",
            0x0a => "DATE",
            0x0c => "DATETIME",
            0xfd => "VARCHAR",
            0xfc | 0xf9 | 0xfa | 0xfb => "BLOB",
            0xfe => "CHAR",
            0xf7 => "ENUM",
            other => {
                warn!(column_type = other, "unrecognized column type, reporting as UNKNOWN");
                "UNKNOWN"
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    pub sequence_id: u8,
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sequence_id: u8,
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryPacket {
    pub sequence_id: u8,
    pub query: Bytes,
}

#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub sequence_id: u8,
    pub catalog: Bytes,
    pub schema: Bytes,
    pub table: Bytes,
    pub org_table: Bytes,
    pub name: Bytes,
    pub org_name: Bytes,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub sequence_id: u8,
    pub values: Vec<Option<Bytes>>,
}

#[derive(Debug, Clone)]
pub struct OkPacket {
    pub sequence_id: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: Bytes,
}

#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub sequence_id: u8,
    pub error_code: u16,
    pub sql_state: [u8; 5],
    pub error_message: String,
}

#[derive(Debug, Clone)]
pub struct EofPacket {
    pub sequence_id: u8,
    pub warnings: u16,
    pub status_flags: u16,
}

// ============================================================================
// Length-encoded primitives
// ============================================================================

fn read_lenenc_int(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf.first().ok_or(WireError::Eof("lenenc int"))?;
    match first {
        0..=0xfa => Ok((first as u64, 1)),
        0xfb => Ok((0, 1)), // NULL marker in row data; caller distinguishes context
        0xfc => {
            if buf.len() < 3 {
                return Err(WireError::Eof("2-byte lenenc int").into());
            }
            Ok(((buf[1] as u64) | ((buf[2] as u64) << 8), 3))
        }
        0xfd => {
            if buf.len() < 4 {
                return Err(WireError::Eof("3-byte lenenc int").into());
            }
            Ok((
                (buf[1] as u64) | ((buf[2] as u64) << 8) | ((buf[3] as u64) << 16),
                4,
            ))
        }
        0xfe => {
            if buf.len() < 9 {
                return Err(WireError::Eof("8-byte lenenc int").into());
            }
            let mut val = 0u64;
            for i in (1..9).rev() {
                val = (val << 8) | buf[i] as u64;
            }
            Ok((val, 9))
        }
        0xff => Err(WireError::Invalid("lenenc int marker 0xff").into()),
    }
}

fn read_lenenc_int_from_buf(buf: &mut BytesMut) -> Result<u64> {
    let (val, consumed) = read_lenenc_int(buf)?;
    if buf.len() < consumed {
        return Err(WireError::Eof("lenenc int").into());
    }
    buf.advance(consumed);
    Ok(val)
}

fn read_lenenc_string(buf: &mut BytesMut) -> Result<Bytes> {
    let len = read_lenenc_int_from_buf(buf)? as usize;
    if buf.len() < len {
        return Err(WireError::Eof("lenenc string").into());
    }
    Ok(buf.split_to(len).freeze())
}

fn read_null_terminated_string(buf: &mut BytesMut) -> Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::Eof("null-terminated string"))?;
    let s = String::from_utf8(buf.split_to(pos).to_vec())
        .map_err(|_| WireError::Invalid("non-UTF8 string"))?;
    buf.advance(1);
    Ok(s)
}

pub fn write_packet_header(dst: &mut BytesMut, payload_len: usize, sequence_id: u8) {
    dst.put_u8((payload_len & 0xff) as u8);
    dst.put_u8(((payload_len >> 8) & 0xff) as u8);
    dst.put_u8(((payload_len >> 16) & 0xff) as u8);
    dst.put_u8(sequence_id);
}

pub fn write_lenenc_int(dst: &mut BytesMut, val: u64) {
    if val < 251 {
        dst.put_u8(val as u8);
    } else if val < 65536 {
        dst.put_u8(0xfc);
        dst.put_u16_le(val as u16);
    } else if val < 16_777_216 {
        dst.put_u8(0xfd);
        dst.put_u8((val & 0xff) as u8);
        dst.put_u8(((val >> 8) & 0xff) as u8);
        dst.put_u8(((val >> 16) & 0xff) as u8);
    } else {
        dst.put_u8(0xfe);
        dst.put_u64_le(val);
    }
}

pub fn write_lenenc_string(dst: &mut BytesMut, s: &[u8]) {
    write_lenenc_int(dst, s.len() as u64);
    dst.put_slice(s);
}

// ============================================================================
// decode_header
// ============================================================================

/// Parses the 4-byte packet header. The wire codec splits this out from the
/// per-phase decoders so the session can learn how many more bytes it needs
/// before attempting a full decode.
pub fn decode_header(buf: &[u8]) -> Result<(u32, u8)> {
    if buf.len() < 4 {
        return Err(WireError::Eof("packet header").into());
    }
    let payload_len = (buf[0] as u32) | ((buf[1] as u32) << 8) | ((buf[2] as u32) << 16);
    Ok((payload_len, buf[3]))
}

// ============================================================================
// decode_handshake_v10 / encode_handshake_v10
// ============================================================================

pub fn decode_handshake_v10(payload: &[u8], sequence_id: u8) -> Result<HandshakeV10> {
    let mut buf = BytesMut::from(payload);
    if buf.is_empty() {
        return Err(WireError::Eof("handshake protocol version").into());
    }
    let protocol_version = buf.get_u8();
    let server_version = read_null_terminated_string(&mut buf)?;
    if buf.len() < 4 {
        return Err(WireError::Eof("handshake connection id").into());
    }
    let connection_id = buf.get_u32_le();

    if buf.len() < 9 {
        return Err(WireError::Eof("handshake auth plugin data part 1").into());
    }
    let mut auth_plugin_data_part1 = [0u8; 8];
    buf.copy_to_slice(&mut auth_plugin_data_part1);
    buf.advance(1); // filler

    if buf.len() < 15 {
        return Err(WireError::Eof("handshake capability/charset/status").into());
    }
    let capability_flags_lower = buf.get_u16_le() as u32;
    let character_set = buf.get_u8();
    let status_flags = buf.get_u16_le();
    let capability_flags_upper = buf.get_u16_le() as u32;
    let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

    let auth_plugin_data_len = buf.get_u8();
    if buf.len() < 10 {
        return Err(WireError::Eof("handshake reserved bytes").into());
    }
    buf.advance(10);

    let part2_len = if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        std::cmp::max(13, auth_plugin_data_len.saturating_sub(8)) as usize
    } else {
        0
    };
    let auth_plugin_data_part2 = if part2_len > 0 {
        if buf.len() < part2_len {
            return Err(WireError::Eof("handshake auth plugin data part 2").into());
        }
        let data = buf.split_to(part2_len).to_vec();
        data.into_iter().take_while(|&b| b != 0).collect()
    } else {
        vec![]
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && buf.has_remaining() {
        read_null_terminated_string(&mut buf).unwrap_or_default()
    } else {
        String::new()
    };

    Ok(HandshakeV10 {
        sequence_id,
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data_part1,
        capability_flags,
        character_set,
        status_flags,
        auth_plugin_data_part2,
        auth_plugin_name,
    })
}

pub fn encode_handshake_v10(h: &HandshakeV10) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(h.protocol_version);
    payload.put_slice(h.server_version.as_bytes());
    payload.put_u8(0);
    payload.put_u32_le(h.connection_id);
    payload.put_slice(&h.auth_plugin_data_part1);
    payload.put_u8(0);
    payload.put_u16_le((h.capability_flags & 0xffff) as u16);
    payload.put_u8(h.character_set);
    payload.put_u16_le(h.status_flags);
    payload.put_u16_le(((h.capability_flags >> 16) & 0xffff) as u16);
    payload.put_u8((h.auth_plugin_data_part2.len() + 8 + 1) as u8);
    payload.put_slice(&[0u8; 10]);
    payload.put_slice(&h.auth_plugin_data_part2);
    payload.put_u8(0);
    if !h.auth_plugin_name.is_empty() {
        payload.put_slice(h.auth_plugin_name.as_bytes());
        payload.put_u8(0);
    }

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), h.sequence_id);
    dst.put_slice(&payload);
    dst
}

// ============================================================================
// decode_auth_response / encode_auth_response
// ============================================================================

pub fn decode_auth_response(payload: &[u8], sequence_id: u8) -> Result<HandshakeResponse> {
    let mut buf = BytesMut::from(payload);
    if buf.len() < 32 {
        return Err(WireError::Eof("handshake response fixed fields").into());
    }
    let capability_flags = buf.get_u32_le();
    let max_packet_size = buf.get_u32_le();
    let character_set = buf.get_u8();
    buf.advance(23);

    let username = read_null_terminated_string(&mut buf)?;

    let auth_response = if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        let len = buf.first().copied().ok_or(WireError::Eof("auth response length"))? as usize;
        buf.advance(1);
        if buf.len() < len {
            return Err(WireError::Eof("auth response bytes").into());
        }
        buf.split_to(len).to_vec()
    } else {
        let pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let data = buf.split_to(pos).to_vec();
        if buf.has_remaining() {
            buf.advance(1);
        }
        data
    };

    let database = if buf.has_remaining() {
        Some(read_null_terminated_string(&mut buf).unwrap_or_default())
    } else {
        None
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && buf.has_remaining() {
        Some(read_null_terminated_string(&mut buf).unwrap_or_default())
    } else {
        None
    };

    Ok(HandshakeResponse {
        sequence_id,
        capability_flags,
        max_packet_size,
        character_set,
        username,
        auth_response,
        database,
        auth_plugin_name,
    })
}

pub fn encode_auth_response(r: &HandshakeResponse) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u32_le(r.capability_flags);
    payload.put_u32_le(r.max_packet_size);
    payload.put_u8(r.character_set);
    payload.put_slice(&[0u8; 23]);
    payload.put_slice(r.username.as_bytes());
    payload.put_u8(0);

    if r.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        payload.put_u8(r.auth_response.len() as u8);
        payload.put_slice(&r.auth_response);
    } else {
        payload.put_slice(&r.auth_response);
        payload.put_u8(0);
    }

    if let Some(ref db) = r.database {
        payload.put_slice(db.as_bytes());
        payload.put_u8(0);
    }

    if let Some(ref plugin) = r.auth_plugin_name {
        payload.put_slice(plugin.as_bytes());
        payload.put_u8(0);
    }

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), r.sequence_id);
    dst.put_slice(&payload);
    dst
}

// ============================================================================
// decode_query / encode_query
// ============================================================================

const COM_QUERY: u8 = 0x03;

pub fn decode_query(payload: &[u8], sequence_id: u8) -> Result<QueryPacket> {
    if payload.first().copied() != Some(COM_QUERY) {
        return Err(WireError::Invalid("expected COM_QUERY command byte").into());
    }
    Ok(QueryPacket {
        sequence_id,
        query: Bytes::copy_from_slice(&payload[1..]),
    })
}

pub fn encode_query(q: &QueryPacket) -> BytesMut {
    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, 1 + q.query.len(), q.sequence_id);
    dst.put_u8(COM_QUERY);
    dst.put_slice(&q.query);
    dst
}

// ============================================================================
// decode_ok / encode_ok
// ============================================================================

pub fn decode_ok(payload: &[u8], sequence_id: u8, capability_flags: u32) -> Result<OkPacket> {
    let mut buf = BytesMut::from(payload);
    if buf.first().copied() != Some(0x00) {
        return Err(WireError::Invalid("expected OK packet marker").into());
    }
    buf.advance(1);
    let affected_rows = read_lenenc_int_from_buf(&mut buf)?;
    let last_insert_id = read_lenenc_int_from_buf(&mut buf)?;

    let (status_flags, warnings) = if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        if buf.len() < 4 {
            return Err(WireError::Eof("OK packet status/warnings").into());
        }
        (buf.get_u16_le(), buf.get_u16_le())
    } else {
        (0, 0)
    };

    let info = buf.split().freeze();

    Ok(OkPacket {
        sequence_id,
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

pub fn encode_ok(o: &OkPacket, capability_flags: u32) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(0x00);
    write_lenenc_int(&mut payload, o.affected_rows);
    write_lenenc_int(&mut payload, o.last_insert_id);

    if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        payload.put_u16_le(o.status_flags);
        payload.put_u16_le(o.warnings);
    }
    payload.put_slice(&o.info);

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), o.sequence_id);
    dst.put_slice(&payload);
    dst
}

// ============================================================================
// decode_err / encode_err
// ============================================================================

pub fn decode_err(payload: &[u8], sequence_id: u8, capability_flags: u32) -> Result<ErrPacket> {
    let mut buf = BytesMut::from(payload);
    if buf.first().copied() != Some(0xff) {
        return Err(WireError::Invalid("expected ERR packet marker").into());
    }
    buf.advance(1);
    if buf.len() < 2 {
        return Err(WireError::Eof("ERR packet error code").into());
    }
    let error_code = buf.get_u16_le();

    let sql_state = if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        if buf.len() < 6 {
            return Err(WireError::Eof("ERR packet sql state").into());
        }
        buf.advance(1); // '#' marker
        let mut state = [0u8; 5];
        buf.copy_to_slice(&mut state);
        state
    } else {
        [0u8; 5]
    };

    let error_message = String::from_utf8_lossy(&buf.split()).to_string();

    Ok(ErrPacket {
        sequence_id,
        error_code,
        sql_state,
        error_message,
    })
}

pub fn encode_err(e: &ErrPacket, capability_flags: u32) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(0xff);
    payload.put_u16_le(e.error_code);

    if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        payload.put_u8(b'#');
        payload.put_slice(&e.sql_state);
    }
    payload.put_slice(e.error_message.as_bytes());

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), e.sequence_id);
    dst.put_slice(&payload);
    dst
}

// ============================================================================
// decode_eof / encode_eof
// ============================================================================

pub fn decode_eof(payload: &[u8], sequence_id: u8) -> Result<EofPacket> {
    let mut buf = BytesMut::from(payload);
    if buf.first().copied() != Some(0xfe) {
        return Err(WireError::Invalid("expected EOF packet marker").into());
    }
    buf.advance(1);
    let warnings = if buf.len() >= 2 { buf.get_u16_le() } else { 0 };
    let status_flags = if buf.len() >= 2 { buf.get_u16_le() } else { 0 };

    Ok(EofPacket {
        sequence_id,
        warnings,
        status_flags,
    })
}

pub fn encode_eof(e: &EofPacket) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(0xfe);
    payload.put_u16_le(e.warnings);
    payload.put_u16_le(e.status_flags);

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), e.sequence_id);
    dst.put_slice(&payload);
    dst
}

// ============================================================================
// decode_column_defs / encode_column_defs
// ============================================================================

pub fn decode_column_defs(payload: &[u8], sequence_id: u8) -> Result<ColumnDefinition> {
    let mut buf = BytesMut::from(payload);
    let catalog = read_lenenc_string(&mut buf)?;
    let schema = read_lenenc_string(&mut buf)?;
    let table = read_lenenc_string(&mut buf)?;
    let org_table = read_lenenc_string(&mut buf)?;
    let name = read_lenenc_string(&mut buf)?;
    let org_name = read_lenenc_string(&mut buf)?;
    if buf.len() < 13 {
        return Err(WireError::Eof("column definition fixed fields").into());
    }
    buf.advance(1); // length of fixed fields, always 0x0c
    let character_set = buf.get_u16_le();
    let column_length = buf.get_u32_le();
    let column_type = ColumnType(buf.get_u8());
    let flags = buf.get_u16_le();
    let decimals = buf.get_u8();

    Ok(ColumnDefinition {
        sequence_id,
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        character_set,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

pub fn encode_column_defs(c: &ColumnDefinition) -> BytesMut {
    let mut payload = BytesMut::new();
    write_lenenc_string(&mut payload, &c.catalog);
    write_lenenc_string(&mut payload, &c.schema);
    write_lenenc_string(&mut payload, &c.table);
    write_lenenc_string(&mut payload, &c.org_table);
    write_lenenc_string(&mut payload, &c.name);
    write_lenenc_string(&mut payload, &c.org_name);
    payload.put_u8(0x0c);
    payload.put_u16_le(c.character_set);
    payload.put_u32_le(c.column_length);
    payload.put_u8(c.column_type.0);
    payload.put_u16_le(c.flags);
    payload.put_u8(c.decimals);
    payload.put_u16(0);

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), c.sequence_id);
    dst.put_slice(&payload);
    dst
}

// ============================================================================
// decode_row / encode_row
// ============================================================================

pub fn decode_row(payload: &[u8], sequence_id: u8, column_count: usize) -> Result<ResultRow> {
    let mut buf = BytesMut::from(payload);
    let mut values = Vec::with_capacity(column_count);

    for _ in 0..column_count {
        if buf.first().copied() == Some(0xfb) {
            buf.advance(1);
            values.push(None);
        } else {
            values.push(Some(read_lenenc_string(&mut buf)?));
        }
    }

    Ok(ResultRow { sequence_id, values })
}

pub fn encode_row(r: &ResultRow) -> BytesMut {
    let mut payload = BytesMut::new();
    for val in &r.values {
        match val {
            Some(v) => write_lenenc_string(&mut payload, v),
            None => payload.put_u8(0xfb),
        }
    }

    let mut dst = BytesMut::new();
    write_packet_header(&mut dst, payload.len(), r.sequence_id);
    dst.put_slice(&payload);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenenc_int_roundtrip() {
        for val in [0u64, 100, 300, 70_000, 20_000_000, u32::MAX as u64 + 1] {
            let mut buf = BytesMut::new();
            write_lenenc_int(&mut buf, val);
            let (decoded, _) = read_lenenc_int(&buf).unwrap();
            assert_eq!(decoded, val);
        }
    }

    #[test]
    fn packet_header_roundtrip() {
        let mut buf = BytesMut::new();
        write_packet_header(&mut buf, 1000, 5);
        let (len, seq) = decode_header(&buf).unwrap();
        assert_eq!(len, 1000);
        assert_eq!(seq, 5);
    }

    #[test]
    fn decode_header_on_truncated_input_is_eof() {
        let buf = [0x01, 0x00];
        assert!(decode_header(&buf).is_err());
    }

    #[test]
    fn ok_packet_roundtrip() {
        let ok = OkPacket {
            sequence_id: 2,
            affected_rows: 1,
            last_insert_id: 42,
            status_flags: 0x0002,
            warnings: 0,
            info: Bytes::new(),
        };
        let encoded = encode_ok(&ok, CLIENT_PROTOCOL_41);
        let (len, seq) = decode_header(&encoded).unwrap();
        assert_eq!(seq, 2);
        let decoded = decode_ok(&encoded[4..4 + len as usize], seq, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(decoded.affected_rows, 1);
        assert_eq!(decoded.last_insert_id, 42);
        assert_eq!(decoded.status_flags, 0x0002);
    }

    #[test]
    fn err_packet_roundtrip() {
        let err = ErrPacket {
            sequence_id: 1,
            error_code: 1045,
            sql_state: *b"28000",
            error_message: "Access denied".to_string(),
        };
        let encoded = encode_err(&err, CLIENT_PROTOCOL_41);
        let (len, seq) = decode_header(&encoded).unwrap();
        let decoded = decode_err(&encoded[4..4 + len as usize], seq, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(decoded.error_code, 1045);
        assert_eq!(&decoded.sql_state, b"28000");
        assert_eq!(decoded.error_message, "Access denied");
    }

    #[test]
    fn query_packet_roundtrip() {
        let q = QueryPacket {
            sequence_id: 0,
            query: Bytes::from_static(b"SELECT 1"),
        };
        let encoded = encode_query(&q);
        let (len, seq) = decode_header(&encoded).unwrap();
        let decoded = decode_query(&encoded[4..4 + len as usize], seq).unwrap();
        assert_eq!(decoded.query, q.query);
    }

    #[test]
    fn decode_query_rejects_wrong_command_byte() {
        assert!(decode_query(&[0x02], 0).is_err());
    }

    #[test]
    fn column_definition_roundtrip() {
        let col = ColumnDefinition {
            sequence_id: 3,
            catalog: Bytes::from_static(b"def"),
            schema: Bytes::from_static(b"test"),
            table: Bytes::from_static(b"t"),
            org_table: Bytes::from_static(b"t"),
            name: Bytes::from_static(b"id"),
            org_name: Bytes::from_static(b"id"),
            character_set: 33,
            column_length: 11,
            column_type: ColumnType(0x03),
            flags: 0,
            decimals: 0,
        };
        let encoded = encode_column_defs(&col);
        let (len, seq) = decode_header(&encoded).unwrap();
        let decoded = decode_column_defs(&encoded[4..4 + len as usize], seq).unwrap();
        assert_eq!(decoded.name, col.name);
        assert_eq!(decoded.column_type.name(), "INT");
    }

    #[test]
    fn unknown_column_type_reports_unknown_without_failing() {
        assert_eq!(ColumnType(0xde).name(), "UNKNOWN");
    }

    #[test]
    fn row_roundtrip_with_null() {
        let row = ResultRow {
            sequence_id: 4,
            values: vec![Some(Bytes::from_static(b"1")), None],
        };
        let encoded = encode_row(&row);
        let (len, seq) = decode_header(&encoded).unwrap();
        let decoded = decode_row(&encoded[4..4 + len as usize], seq, 2).unwrap();
        assert_eq!(decoded.values[0].as_deref(), Some(&b"1"[..]));
        assert_eq!(decoded.values[1], None);
    }
}
