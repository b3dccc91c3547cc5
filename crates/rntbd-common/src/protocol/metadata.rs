//! Typed metadata tokens carried between the fixed frame header and the
//! payload.
//!
//! Each token is `u16 id | u8 type tag | value`, where the tag alone
//! determines the value's length. That lets a decoder skip ids it does not
//! know while still rejecting corrupt input.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use super::error::{Result, RntbdError};
use super::types::ConsistencyLevel;

/// Value encodings a token may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenType {
    Byte = 0x00,
    ULong = 0x01,
    LongLong = 0x02,
    Double = 0x03,
    SmallString = 0x04,
    Bytes = 0x05,
    Guid = 0x06,
    HeaderPair = 0x07,
}

impl TokenType {
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0x00 => TokenType::Byte,
            0x01 => TokenType::ULong,
            0x02 => TokenType::LongLong,
            0x03 => TokenType::Double,
            0x04 => TokenType::SmallString,
            0x05 => TokenType::Bytes,
            0x06 => TokenType::Guid,
            0x07 => TokenType::HeaderPair,
            other => {
                return Err(RntbdError::MalformedFrame(format!(
                    "invalid token type tag {:#04x}",
                    other
                )))
            }
        })
    }
}

/// Well-known token ids.
pub mod token_ids {
    pub const STATUS_CODE: u16 = 0x0001;
    pub const SUB_STATUS_CODE: u16 = 0x0002;
    pub const LSN: u16 = 0x0003;
    pub const QUORUM_ACKED_LSN: u16 = 0x0004;
    pub const GLOBAL_COMMITTED_LSN: u16 = 0x0005;
    pub const ITEM_LSN: u16 = 0x0006;
    pub const NUMBER_OF_READ_REGIONS: u16 = 0x0007;
    pub const REPLICA_SET_SIZE: u16 = 0x0008;
    pub const WRITE_QUORUM: u16 = 0x0009;
    pub const REQUEST_CHARGE: u16 = 0x000A;
    pub const SESSION_TOKEN: u16 = 0x000B;
    pub const PARTITION_KEY_RANGE_ID: u16 = 0x000C;
    pub const RESOURCE_ADDRESS: u16 = 0x000D;
    pub const CONSISTENCY_LEVEL: u16 = 0x000E;
    pub const RESPONSE_HEADER: u16 = 0x000F;
    pub const ERROR_MESSAGE: u16 = 0x0010;
}

#[derive(Debug, Clone, PartialEq)]
enum TokenValue {
    Byte(u8),
    ULong(u32),
    LongLong(i64),
    Double(f64),
    SmallString(String),
    Bytes(Vec<u8>),
    Guid(Uuid),
    HeaderPair(String, String),
}

impl TokenValue {
    fn token_type(&self) -> TokenType {
        match self {
            TokenValue::Byte(_) => TokenType::Byte,
            TokenValue::ULong(_) => TokenType::ULong,
            TokenValue::LongLong(_) => TokenType::LongLong,
            TokenValue::Double(_) => TokenType::Double,
            TokenValue::SmallString(_) => TokenType::SmallString,
            TokenValue::Bytes(_) => TokenType::Bytes,
            TokenValue::Guid(_) => TokenType::Guid,
            TokenValue::HeaderPair(..) => TokenType::HeaderPair,
        }
    }
}

/// Decoded metadata. Absent tokens are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub status_code: Option<u32>,
    pub sub_status_code: Option<u32>,
    pub lsn: Option<i64>,
    pub quorum_acked_lsn: Option<i64>,
    pub global_committed_lsn: Option<i64>,
    pub item_lsn: Option<i64>,
    pub number_of_read_regions: Option<u32>,
    pub replica_set_size: Option<u32>,
    pub write_quorum: Option<u32>,
    pub request_charge: Option<f64>,
    pub session_token: Option<String>,
    pub partition_key_range_id: Option<String>,
    pub resource_address: Option<String>,
    pub consistency_level: Option<ConsistencyLevel>,
    pub response_headers: Vec<(String, String)>,
    pub error_message: Option<String>,
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(RntbdError::MalformedFrame(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_utf8(buf: &mut &[u8], len: usize, what: &str) -> Result<String> {
    need(buf, len, what)?;
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|e| RntbdError::MalformedFrame(format!("{} is not utf-8: {}", what, e)))?
        .to_string();
    buf.advance(len);
    Ok(text)
}

fn put_small_string(dst: &mut BytesMut, value: &str, what: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        RntbdError::MalformedFrame(format!("{} exceeds {} bytes", what, u16::MAX))
    })?;
    dst.put_u16_le(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn read_value(buf: &mut &[u8], token_type: TokenType) -> Result<TokenValue> {
    Ok(match token_type {
        TokenType::Byte => {
            need(buf, 1, "byte token")?;
            TokenValue::Byte(buf.get_u8())
        }
        TokenType::ULong => {
            need(buf, 4, "ulong token")?;
            TokenValue::ULong(buf.get_u32_le())
        }
        TokenType::LongLong => {
            need(buf, 8, "longlong token")?;
            TokenValue::LongLong(buf.get_i64_le())
        }
        TokenType::Double => {
            need(buf, 8, "double token")?;
            TokenValue::Double(buf.get_f64_le())
        }
        TokenType::SmallString => {
            need(buf, 2, "string length")?;
            let len = buf.get_u16_le() as usize;
            TokenValue::SmallString(read_utf8(buf, len, "string token")?)
        }
        TokenType::Bytes => {
            need(buf, 4, "bytes length")?;
            let len = buf.get_u32_le() as usize;
            need(buf, len, "bytes token")?;
            let value = buf[..len].to_vec();
            buf.advance(len);
            TokenValue::Bytes(value)
        }
        TokenType::Guid => {
            need(buf, 16, "guid token")?;
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            TokenValue::Guid(Uuid::from_bytes(raw))
        }
        TokenType::HeaderPair => {
            need(buf, 2, "header name length")?;
            let name_len = buf.get_u16_le() as usize;
            let name = read_utf8(buf, name_len, "header name")?;
            need(buf, 2, "header value length")?;
            let value_len = buf.get_u16_le() as usize;
            let value = read_utf8(buf, value_len, "header value")?;
            TokenValue::HeaderPair(name, value)
        }
    })
}

fn write_token(dst: &mut BytesMut, id: u16, value: &TokenValue) -> Result<()> {
    dst.put_u16_le(id);
    dst.put_u8(value.token_type() as u8);
    match value {
        TokenValue::Byte(v) => dst.put_u8(*v),
        TokenValue::ULong(v) => dst.put_u32_le(*v),
        TokenValue::LongLong(v) => dst.put_i64_le(*v),
        TokenValue::Double(v) => dst.put_f64_le(*v),
        TokenValue::SmallString(v) => put_small_string(dst, v, "string token")?,
        TokenValue::Bytes(v) => {
            let len = u32::try_from(v.len())
                .map_err(|_| RntbdError::MalformedFrame("bytes token too large".to_string()))?;
            dst.put_u32_le(len);
            dst.put_slice(v);
        }
        TokenValue::Guid(v) => dst.put_slice(v.as_bytes()),
        TokenValue::HeaderPair(name, value) => {
            put_small_string(dst, name, "header name")?;
            put_small_string(dst, value, "header value")?;
        }
    }
    Ok(())
}

fn mismatch(id: u16, expected: TokenType, actual: &TokenValue) -> RntbdError {
    RntbdError::MalformedFrame(format!(
        "token {:#06x} expected {:?}, found {:?}",
        id,
        expected,
        actual.token_type()
    ))
}

macro_rules! expect_token {
    ($id:expr, $value:expr, $variant:ident) => {
        match $value {
            TokenValue::$variant(v) => v,
            other => return Err(mismatch($id, TokenType::$variant, &other)),
        }
    };
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }

    /// Case-insensitive lookup in the response headers.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends every present token to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        use token_ids::*;

        let mut scalars: Vec<(u16, TokenValue)> = Vec::new();
        if let Some(v) = self.status_code {
            scalars.push((STATUS_CODE, TokenValue::ULong(v)));
        }
        if let Some(v) = self.sub_status_code {
            scalars.push((SUB_STATUS_CODE, TokenValue::ULong(v)));
        }
        if let Some(v) = self.lsn {
            scalars.push((LSN, TokenValue::LongLong(v)));
        }
        if let Some(v) = self.quorum_acked_lsn {
            scalars.push((QUORUM_ACKED_LSN, TokenValue::LongLong(v)));
        }
        if let Some(v) = self.global_committed_lsn {
            scalars.push((GLOBAL_COMMITTED_LSN, TokenValue::LongLong(v)));
        }
        if let Some(v) = self.item_lsn {
            scalars.push((ITEM_LSN, TokenValue::LongLong(v)));
        }
        if let Some(v) = self.number_of_read_regions {
            scalars.push((NUMBER_OF_READ_REGIONS, TokenValue::ULong(v)));
        }
        if let Some(v) = self.replica_set_size {
            scalars.push((REPLICA_SET_SIZE, TokenValue::ULong(v)));
        }
        if let Some(v) = self.write_quorum {
            scalars.push((WRITE_QUORUM, TokenValue::ULong(v)));
        }
        if let Some(v) = self.request_charge {
            scalars.push((REQUEST_CHARGE, TokenValue::Double(v)));
        }
        if let Some(v) = self.consistency_level {
            scalars.push((CONSISTENCY_LEVEL, TokenValue::Byte(v.to_wire())));
        }
        for (id, value) in &scalars {
            write_token(dst, *id, value)?;
        }

        let strings = [
            (SESSION_TOKEN, &self.session_token),
            (PARTITION_KEY_RANGE_ID, &self.partition_key_range_id),
            (RESOURCE_ADDRESS, &self.resource_address),
        ];
        for (id, value) in strings {
            if let Some(text) = value {
                write_token(dst, id, &TokenValue::SmallString(text.clone()))?;
            }
        }

        for (name, value) in &self.response_headers {
            write_token(
                dst,
                RESPONSE_HEADER,
                &TokenValue::HeaderPair(name.clone(), value.clone()),
            )?;
        }

        if let Some(message) = &self.error_message {
            write_token(dst, ERROR_MESSAGE, &TokenValue::Bytes(message.as_bytes().to_vec()))?;
        }

        Ok(())
    }

    /// Decodes a complete token region. Unknown token ids are skipped; a
    /// truncated token, invalid tag or tag/id mismatch is malformed.
    pub fn decode(mut buf: &[u8]) -> Result<Metadata> {
        use token_ids::*;

        let mut metadata = Metadata::default();
        while buf.has_remaining() {
            need(&buf, 3, "token header")?;
            let id = buf.get_u16_le();
            let token_type = TokenType::from_tag(buf.get_u8())?;
            let value = read_value(&mut buf, token_type)?;

            match id {
                STATUS_CODE => metadata.status_code = Some(expect_token!(id, value, ULong)),
                SUB_STATUS_CODE => metadata.sub_status_code = Some(expect_token!(id, value, ULong)),
                LSN => metadata.lsn = Some(expect_token!(id, value, LongLong)),
                QUORUM_ACKED_LSN => {
                    metadata.quorum_acked_lsn = Some(expect_token!(id, value, LongLong))
                }
                GLOBAL_COMMITTED_LSN => {
                    metadata.global_committed_lsn = Some(expect_token!(id, value, LongLong))
                }
                ITEM_LSN => metadata.item_lsn = Some(expect_token!(id, value, LongLong)),
                NUMBER_OF_READ_REGIONS => {
                    metadata.number_of_read_regions = Some(expect_token!(id, value, ULong))
                }
                REPLICA_SET_SIZE => metadata.replica_set_size = Some(expect_token!(id, value, ULong)),
                WRITE_QUORUM => metadata.write_quorum = Some(expect_token!(id, value, ULong)),
                REQUEST_CHARGE => metadata.request_charge = Some(expect_token!(id, value, Double)),
                SESSION_TOKEN => {
                    metadata.session_token = Some(expect_token!(id, value, SmallString))
                }
                PARTITION_KEY_RANGE_ID => {
                    metadata.partition_key_range_id = Some(expect_token!(id, value, SmallString))
                }
                RESOURCE_ADDRESS => {
                    metadata.resource_address = Some(expect_token!(id, value, SmallString))
                }
                CONSISTENCY_LEVEL => {
                    let raw = expect_token!(id, value, Byte);
                    metadata.consistency_level = Some(ConsistencyLevel::from_wire(raw)?);
                }
                RESPONSE_HEADER => match value {
                    TokenValue::HeaderPair(name, value) => metadata.response_headers.push((name, value)),
                    other => return Err(mismatch(id, TokenType::HeaderPair, &other)),
                },
                ERROR_MESSAGE => {
                    let raw = expect_token!(id, value, Bytes);
                    metadata.error_message = Some(String::from_utf8_lossy(&raw).into_owned());
                }
                _ => {
                    // unknown id, value already consumed
                }
            }
        }
        Ok(metadata)
    }
}
