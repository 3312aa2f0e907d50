//! MySQL JSON 바이너리 포맷 디코딩
//!
//! 행 이벤트의 JSON 컬럼은 서버 내부 바이너리 포맷으로 기록된다.
//! 첫 바이트가 값 타입이고 나머지가 값 본문이다.
//!
//! 타입 코드:
//! - 0x00/0x01: small/large object
//! - 0x02/0x03: small/large array
//! - 0x04: literal (null/true/false)
//! - 0x05..0x0a: int16, uint16, int32, uint32, int64, uint64
//! - 0x0b: double
//! - 0x0c: utf8 string
//! - 0x0f: opaque (decimal, 날짜 등 MySQL 고유 타입)

use crate::error::{BinlogSqlError, Result};
use serde_json::{json, Map, Value as JsonValue};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

fn truncated(what: &str) -> BinlogSqlError {
    BinlogSqlError::BinlogParseError(format!("JSON 바이너리 데이터가 잘림: {}", what))
}

fn read_le(data: &[u8], offset: usize, width: usize, what: &str) -> Result<u64> {
    let bytes = data
        .get(offset..offset + width)
        .ok_or_else(|| truncated(what))?;
    Ok(bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// 바이너리 JSON을 JSON 텍스트로 변환
///
/// 바이너리 파싱에 실패하면 텍스트 JSON으로 한 번 더 시도한다.
pub fn decode_to_string(data: &[u8]) -> Result<String> {
    if data.is_empty() {
        return Ok("null".to_string());
    }
    let value = match parse_typed(data[0], &data[1..]) {
        Ok(v) => v,
        Err(err) => serde_json::from_slice::<JsonValue>(data).map_err(|_| err)?,
    };
    Ok(serde_json::to_string(&value)?)
}

fn parse_typed(type_byte: u8, data: &[u8]) -> Result<JsonValue> {
    match type_byte {
        SMALL_OBJECT => parse_container(data, false, true),
        LARGE_OBJECT => parse_container(data, true, true),
        SMALL_ARRAY => parse_container(data, false, false),
        LARGE_ARRAY => parse_container(data, true, false),
        LITERAL => Ok(literal(read_le(data, 0, 1, "literal")?)),
        INT16 => Ok(json!(read_le(data, 0, 2, "int16")? as u16 as i16)),
        UINT16 => Ok(json!(read_le(data, 0, 2, "uint16")? as u16)),
        INT32 => Ok(json!(read_le(data, 0, 4, "int32")? as u32 as i32)),
        UINT32 => Ok(json!(read_le(data, 0, 4, "uint32")? as u32)),
        INT64 => Ok(json!(read_le(data, 0, 8, "int64")? as i64)),
        UINT64 => Ok(json!(read_le(data, 0, 8, "uint64")?)),
        DOUBLE => Ok(json!(f64::from_bits(read_le(data, 0, 8, "double")?))),
        STRING => {
            let (len, prefix) = read_variable_length(data)?;
            let bytes = data.get(prefix..prefix + len).ok_or_else(|| truncated("string"))?;
            Ok(JsonValue::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => {
            let rest = data.get(1..).ok_or_else(|| truncated("opaque"))?;
            let (len, prefix) = read_variable_length(rest)?;
            let bytes = rest.get(prefix..prefix + len).ok_or_else(|| truncated("opaque"))?;
            match std::str::from_utf8(bytes) {
                Ok(s) => Ok(JsonValue::String(s.to_string())),
                Err(_) => Ok(JsonValue::String(format!("0x{}", hex(bytes)))),
            }
        }
        other => Err(BinlogSqlError::BinlogParseError(format!(
            "알 수 없는 JSON 바이너리 타입 0x{:02x}",
            other
        ))),
    }
}

fn literal(code: u64) -> JsonValue {
    match code {
        0x01 => JsonValue::Bool(true),
        0x02 => JsonValue::Bool(false),
        _ => JsonValue::Null,
    }
}

/// object/array 공통 파싱. large면 오프셋/크기가 4바이트, 아니면 2바이트
fn parse_container(data: &[u8], large: bool, is_object: bool) -> Result<JsonValue> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_le(data, 0, offset_size, "element count")? as usize;
    let header = offset_size * 2;
    let key_entry = offset_size + 2;
    let value_entry = offset_size + 1;

    let value_entries_start = if is_object {
        header + count * key_entry
    } else {
        header
    };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let entry = value_entries_start + i * value_entry;
        let type_byte = *data.get(entry).ok_or_else(|| truncated("value entry"))?;
        values.push(resolve_value(data, type_byte, entry + 1, large)?);
    }

    if !is_object {
        return Ok(JsonValue::Array(values));
    }

    let mut map = Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let entry = header + i * key_entry;
        let key_offset = read_le(data, entry, offset_size, "key offset")? as usize;
        let key_len = read_le(data, entry + offset_size, 2, "key length")? as usize;
        let key = data
            .get(key_offset..key_offset + key_len)
            .ok_or_else(|| truncated("key"))?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(JsonValue::Object(map))
}

/// 작은 스칼라는 엔트리 안에 바로 저장되고, 나머지는 오프셋을 따라간다.
fn resolve_value(data: &[u8], type_byte: u8, at: usize, large: bool) -> Result<JsonValue> {
    match type_byte {
        LITERAL => return Ok(literal(read_le(data, at, 2, "inline literal")?)),
        INT16 => return Ok(json!(read_le(data, at, 2, "inline int16")? as u16 as i16)),
        UINT16 => return Ok(json!(read_le(data, at, 2, "inline uint16")? as u16)),
        INT32 if large => return Ok(json!(read_le(data, at, 4, "inline int32")? as u32 as i32)),
        UINT32 if large => return Ok(json!(read_le(data, at, 4, "inline uint32")? as u32)),
        _ => {}
    }

    let offset_size = if large { 4 } else { 2 };
    let value_offset = read_le(data, at, offset_size, "value offset")? as usize;
    let body = data
        .get(value_offset..)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| truncated("value offset out of bounds"))?;
    parse_typed(type_byte, body)
}

/// 문자열 길이용 가변 길이 정수 (7비트씩, 상위 비트는 계속 표시)
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for i in 0..5 {
        let b = *data.get(i).ok_or_else(|| truncated("variable length"))? as usize;
        length |= (b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(truncated("variable length too long"))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(decode_to_string(&[LITERAL, 0x01]).unwrap(), "true");
        assert_eq!(decode_to_string(&[LITERAL, 0x00]).unwrap(), "null");
        assert_eq!(decode_to_string(&[INT16, 0xfe, 0xff]).unwrap(), "-2");
        assert_eq!(decode_to_string(&[STRING, 0x03, b'a', b'b', b'c']).unwrap(), "\"abc\"");
        assert_eq!(decode_to_string(&[]).unwrap(), "null");
    }

    #[test]
    fn test_small_object() {
        // {"a": 1}
        // header: count=1, size=12
        // key entry: offset=11, len=1
        // value entry: INT16 inline 1
        let data = [
            SMALL_OBJECT,
            0x01, 0x00, 0x0c, 0x00,
            0x0b, 0x00, 0x01, 0x00,
            INT16, 0x01, 0x00,
            b'a',
        ];
        assert_eq!(decode_to_string(&data).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_small_array_with_string() {
        // ["xy", true]
        let data = [
            SMALL_ARRAY,
            0x02, 0x00, 0x0d, 0x00,
            STRING, 0x0a, 0x00,
            LITERAL, 0x01, 0x00,
            0x02, b'x', b'y',
        ];
        assert_eq!(decode_to_string(&data).unwrap(), r#"["xy",true]"#);
    }

    #[test]
    fn test_text_json_fallback() {
        assert_eq!(decode_to_string(br#"{"k":"v"}"#).unwrap(), r#"{"k":"v"}"#);
        assert!(decode_to_string(&[0x7f, 0x00]).is_err());
    }
}
