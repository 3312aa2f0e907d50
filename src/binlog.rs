//! MySQL Binlog 이벤트 디코더
//!
//! Binlog 파일의 바이너리 형식을 파싱합니다.
//! 헤더: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e)
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, 체크섬이 켜진 경우)
//!
//! 행 이벤트는 앞선 테이블 맵 이벤트의 컬럼 타입/메타데이터가 있어야 해석할 수 있으므로
//! 파서는 table_id별 테이블 맵을 들고 있다.

use crate::error::{BinlogSqlError, Result};
use crate::events::*;
use crate::json_binary;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::DateTime;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

pub const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII
pub const EVENT_HEADER_SIZE: usize = 19;
const CHECKSUM_SIZE: usize = 4;

/// 상태를 가진 Binlog 이벤트 파서
#[derive(Debug, Default)]
pub struct BinlogParser {
    tables: HashMap<u64, TableMapData>,
    checksum: bool,
    /// 설정되어 있으면 FDE 값보다 우선
    fixed_checksum: Option<bool>,
}

impl BinlogParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < 4 {
            return Err(BinlogSqlError::BinlogParseError(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(BinlogSqlError::BinlogParseError(
                "Invalid binlog magic number".to_string(),
            ))
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(BinlogSqlError::BinlogParseError(
                "Invalid event header: too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(event_type),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// 체크섬 사용 여부를 직접 지정 (라이브 스트림에서 NONE으로 협상한 경우)
    pub fn set_checksum(&mut self, enabled: bool) {
        self.checksum = enabled;
        self.fixed_checksum = Some(enabled);
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum
    }

    /// 헤더를 포함한 이벤트 하나를 디코딩
    pub fn decode(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let header = Self::parse_header(data)?;

        if header.event_type == EventType::FormatDescriptionEvent {
            self.checksum = self
                .fixed_checksum
                .unwrap_or_else(|| fde_has_checksum(&data[EVENT_HEADER_SIZE..]));
        }

        let end = if self.checksum && data.len() >= EVENT_HEADER_SIZE + CHECKSUM_SIZE {
            data.len() - CHECKSUM_SIZE
        } else {
            data.len()
        };
        let payload = &data[EVENT_HEADER_SIZE..end];

        trace!(
            "Decoding {:?} event at {}, {} bytes payload",
            header.event_type,
            header.next_pos,
            payload.len()
        );

        let event_data = match header.event_type {
            EventType::FormatDescriptionEvent => {
                let mut fde = parse_format_description(payload)?;
                fde.checksum_type = u8::from(self.checksum);
                debug!(
                    "Format description: server {}, checksum {}",
                    fde.server_version, self.checksum
                );
                BinlogEventData::FormatDescription(fde)
            }
            EventType::TableMapEvent => {
                let table_map = parse_table_map_event(payload)?;
                self.tables.insert(table_map.table_id, table_map.clone());
                BinlogEventData::TableMap(table_map)
            }
            EventType::WriteRowsEventV1
            | EventType::UpdateRowsEventV1
            | EventType::DeleteRowsEventV1
            | EventType::WriteRowsEventV2
            | EventType::UpdateRowsEventV2
            | EventType::DeleteRowsEventV2 => {
                BinlogEventData::Rows(self.parse_rows_event(header.event_type, payload)?)
            }
            EventType::QueryEvent => BinlogEventData::Query(parse_query_event(payload)?),
            EventType::XidEvent => {
                let mut cursor = Cursor::new(payload);
                BinlogEventData::Xid(cursor.read_u64::<LittleEndian>()?)
            }
            EventType::RotateEvent => BinlogEventData::Rotate(parse_rotate_event(payload)?),
            EventType::GtidEvent | EventType::AnonymousGtidEvent => {
                BinlogEventData::Gtid(parse_gtid_event(payload)?)
            }
            EventType::MariadbGtidEvent => BinlogEventData::MariadbGtid,
            EventType::HeartbeatEvent => BinlogEventData::Heartbeat,
            _ => BinlogEventData::Unknown(payload.to_vec()),
        };

        Ok(BinlogEvent {
            header,
            data: event_data,
        })
    }

    /// WRITE/UPDATE/DELETE_ROWS 이벤트 파싱 (v1, v2)
    fn parse_rows_event(&self, event_type: EventType, data: &[u8]) -> Result<RowsEventData> {
        let kind = event_type.statement_kind().ok_or_else(|| {
            BinlogSqlError::BinlogParseError(format!("행 이벤트가 아님: {:?}", event_type))
        })?;

        let mut cursor = Cursor::new(data);
        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        if event_type.is_rows_v2() {
            // extra data 길이는 자기 자신 2바이트를 포함
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            if extra_len > 2 {
                cursor.set_position(cursor.position() + extra_len - 2);
            }
        }

        let table_map = self.tables.get(&table_id).ok_or_else(|| {
            BinlogSqlError::BinlogParseError(format!(
                "table_id {}에 대한 테이블 맵 이벤트가 없음",
                table_id
            ))
        })?;

        let column_count = read_lcb(&mut cursor)? as usize;
        let bitmap_len = column_count.div_ceil(8);

        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;

        let present_after = if kind == StatementKind::Update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            bitmap
        } else {
            present.clone()
        };

        let mut rows = Vec::new();
        while (cursor.position() as usize) < data.len() {
            rows.push(parse_row_image(&mut cursor, table_map, column_count, &present)?);
            if kind == StatementKind::Update {
                rows.push(parse_row_image(&mut cursor, table_map, column_count, &present_after)?);
            }
        }

        Ok(RowsEventData {
            kind,
            table_id,
            database: table_map.database.clone(),
            table: table_map.table.clone(),
            column_types: table_map.column_types.clone(),
            rows,
        })
    }
}

/// 포맷 설명 이벤트 끝의 checksum_alg 바이트로 CRC32 사용 여부 판단
///
/// `[binlog_version:2][server_version:50][create_timestamp:4][header_length:1]
///  [post_header_lengths:N][checksum_alg:1][crc32:4]`
fn fde_has_checksum(payload: &[u8]) -> bool {
    if payload.len() < 58 {
        return false;
    }
    let version = String::from_utf8_lossy(&payload[2..52]);
    let version = version.trim_end_matches('\0');
    version_supports_checksum(version) && payload[payload.len() - 5] == 1
}

/// MySQL 5.6.1+, MariaDB 5.3+ 에서 체크섬 지원
fn version_supports_checksum(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    if version.contains("MariaDB") {
        return major > 5 || (major == 5 && minor >= 3);
    }
    major > 5 || (major == 5 && minor >= 6)
}

/// 포맷 설명 이벤트 파싱 (15)
fn parse_format_description(data: &[u8]) -> Result<FormatDescriptionData> {
    if data.len() < 57 {
        return Err(BinlogSqlError::BinlogParseError(
            "Invalid format description event".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let binlog_version = cursor.read_u16::<LittleEndian>()?;

    let mut version_bytes = [0u8; 50];
    cursor.read_exact(&mut version_bytes)?;
    let server_version = String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string();

    let _create_timestamp = cursor.read_u32::<LittleEndian>()?;
    let header_length = cursor.read_u8()?;

    Ok(FormatDescriptionData {
        binlog_version,
        server_version,
        header_length,
        checksum_type: 0,
    })
}

/// 테이블 맵 이벤트 파싱 (19)
pub fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
    if data.len() < 8 {
        return Err(BinlogSqlError::BinlogParseError(
            "Invalid table map event".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let table_id = cursor.read_u48::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;

    // 데이터베이스명 (길이 + 이름 + NUL)
    let database = read_short_string(&mut cursor)?;
    cursor.read_u8()?;

    // 테이블명
    let table = read_short_string(&mut cursor)?;
    cursor.read_u8()?;

    // 컬럼 개수 + 타입
    let column_count = read_lcb(&mut cursor)? as usize;
    let mut type_bytes = vec![0u8; column_count];
    cursor.read_exact(&mut type_bytes)?;
    let column_types: Vec<ColumnType> = type_bytes.into_iter().map(ColumnType::from_u8).collect();

    // 타입별 메타데이터
    let metadata_length = read_lcb(&mut cursor)? as usize;
    let mut metadata = vec![0u8; metadata_length];
    cursor.read_exact(&mut metadata)?;
    let column_meta = parse_column_meta(&column_types, &metadata)?;

    // nullable bitmap
    let mut nullable_bitmap = vec![0u8; column_count.div_ceil(8)];
    cursor.read_exact(&mut nullable_bitmap)?;

    Ok(TableMapData {
        table_id,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    })
}

fn parse_column_meta(column_types: &[ColumnType], metadata: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(metadata);
    let mut meta = Vec::with_capacity(column_types.len());

    for column_type in column_types {
        let value = match column_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Blob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => cursor.read_u8()? as u16,
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                cursor.read_u16::<LittleEndian>()?
            }
            // (real_type, length) 또는 (precision, scale) 순서
            ColumnType::NewDecimal | ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                cursor.read_u16::<BigEndian>()?
            }
            _ => 0,
        };
        meta.push(value);
    }

    Ok(meta)
}

/// 행 이미지 하나 파싱. 이미지에 없는 컬럼은 Null로 채운다.
fn parse_row_image(
    cursor: &mut Cursor<&[u8]>,
    table_map: &TableMapData,
    column_count: usize,
    present: &[u8],
) -> Result<Vec<Value>> {
    let present_count = (0..column_count).filter(|i| is_bit_set(present, *i)).count();
    let mut null_bitmap = vec![0u8; present_count.div_ceil(8)];
    cursor.read_exact(&mut null_bitmap)?;

    let mut row = Vec::with_capacity(column_count);
    let mut null_idx = 0;

    for col in 0..column_count {
        if !is_bit_set(present, col) {
            row.push(Value::Null);
            continue;
        }

        let is_null = is_bit_set(&null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            row.push(Value::Null);
            continue;
        }

        let column_type = table_map
            .column_types
            .get(col)
            .copied()
            .ok_or_else(|| {
                BinlogSqlError::BinlogParseError(format!(
                    "{}.{}: 행 이벤트 컬럼 수 {}가 테이블 맵 컬럼 수 {}보다 많음",
                    table_map.database,
                    table_map.table,
                    column_count,
                    table_map.column_types.len()
                ))
            })?;
        let meta = table_map.column_meta.get(col).copied().unwrap_or(0);
        row.push(decode_value(cursor, column_type, meta)?);
    }

    Ok(row)
}

/// 컬럼 타입별 값 디코딩
fn decode_value(cursor: &mut Cursor<&[u8]>, column_type: ColumnType, meta: u16) -> Result<Value> {
    let value = match column_type {
        ColumnType::Tiny => Value::Int(cursor.read_i8()? as i64),
        ColumnType::Short => Value::Int(cursor.read_i16::<LittleEndian>()? as i64),
        ColumnType::Int24 => Value::Int(cursor.read_i24::<LittleEndian>()? as i64),
        ColumnType::Long => Value::Int(cursor.read_i32::<LittleEndian>()? as i64),
        ColumnType::LongLong => Value::Int(cursor.read_i64::<LittleEndian>()?),
        ColumnType::Float => Value::Float32(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => Value::Float(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Year => {
            let year = cursor.read_u8()? as i64;
            Value::Int(if year == 0 { 0 } else { year + 1900 })
        }
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xff) as usize;
            Value::Text(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            Value::Text(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0f,
                packed & 0x1f
            ))
        }
        ColumnType::Time => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            Value::Text(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed % 10000) / 100,
                packed % 100
            ))
        }
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let d = packed / 1_000_000;
            let t = packed % 1_000_000;
            Value::Text(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                d / 10000,
                (d % 10000) / 100,
                d % 100,
                t / 10000,
                (t % 10000) / 100,
                t % 100
            ))
        }
        ColumnType::Timestamp => {
            let secs = cursor.read_u32::<LittleEndian>()?;
            Value::Text(format_utc_timestamp(secs, 0, 0))
        }
        ColumnType::Timestamp2 => {
            let secs = cursor.read_u32::<BigEndian>()?;
            let micros = read_fraction(cursor, meta as u8)?;
            Value::Text(format_utc_timestamp(secs, micros, meta as u8))
        }
        ColumnType::DateTime2 => Value::Text(decode_datetime2(cursor, meta as u8)?),
        ColumnType::Time2 => Value::Text(decode_time2(cursor, meta as u8)?),
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            Value::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::String | ColumnType::Enum | ColumnType::Set => {
            decode_string_family(cursor, column_type, meta)?
        }
        ColumnType::Bit => {
            let nbits = (meta >> 8) as usize * 8 + (meta & 0xff) as usize;
            let bytes = read_bytes(cursor, nbits.div_ceil(8))?;
            Value::Unsigned(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
        }
        ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Blob
        | ColumnType::Geometry => {
            let len = read_uint_le(cursor, meta as usize)?;
            Value::Bytes(read_bytes(cursor, len as usize)?)
        }
        ColumnType::Json => {
            let len = read_uint_le(cursor, meta as usize)?;
            let bytes = read_bytes(cursor, len as usize)?;
            Value::Text(json_binary::decode_to_string(&bytes)?)
        }
        other => {
            return Err(BinlogSqlError::BinlogParseError(format!(
                "지원하지 않는 컬럼 타입: {:?}",
                other
            )))
        }
    };
    Ok(value)
}

/// CHAR/BINARY/ENUM/SET: 메타데이터 상위 바이트가 실제 타입
fn decode_string_family(cursor: &mut Cursor<&[u8]>, column_type: ColumnType, meta: u16) -> Result<Value> {
    let (real_type, length) = if meta >= 256 {
        let b0 = (meta >> 8) as u8;
        let b1 = (meta & 0xff) as usize;
        if b0 & 0x30 != 0x30 {
            (
                ColumnType::from_u8(b0 | 0x30),
                b1 | ((((b0 & 0x30) ^ 0x30) as usize) << 4),
            )
        } else {
            (ColumnType::from_u8(b0), b1)
        }
    } else {
        (column_type, meta as usize)
    };

    match real_type {
        ColumnType::Enum => {
            let index = read_uint_le(cursor, length)?;
            Ok(Value::Int(index as i64))
        }
        ColumnType::Set => Ok(Value::Unsigned(read_uint_le(cursor, length)?)),
        _ => {
            let len = if length < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            Ok(Value::Bytes(read_bytes(cursor, len)?))
        }
    }
}

fn decode_datetime2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<String> {
    let packed = read_uint_be(cursor, 5)? as i64 - 0x80_0000_0000;
    let micros = read_fraction(cursor, fsp)?;

    if packed == 0 {
        return Ok(with_fraction("0000-00-00 00:00:00".to_string(), micros, fsp));
    }

    let ymd = packed >> 17;
    let ym = ymd >> 5;
    let hms = packed % (1 << 17);

    let text = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6)
    );
    Ok(with_fraction(text, micros, fsp))
}

fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<String> {
    const TIMEF_INT_OFS: i64 = 0x80_0000;
    const TIMEF_OFS: i64 = 0x8000_0000_0000;

    let mut tmp = match fsp {
        1 | 2 => {
            let mut int_part = read_uint_be(cursor, 3)? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10000
        }
        3 | 4 => {
            let mut int_part = read_uint_be(cursor, 3)? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => read_uint_be(cursor, 6)? as i64 - TIMEF_OFS,
        _ => (read_uint_be(cursor, 3)? as i64 - TIMEF_INT_OFS) << 24,
    };

    let sign = if tmp < 0 {
        tmp = -tmp;
        "-"
    } else {
        ""
    };

    let hms = tmp >> 24;
    let micros = (tmp % (1 << 24)) as u32;
    let text = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6)
    );
    Ok(with_fraction(text, micros, fsp))
}

/// 소수 초 (fsp 1-2: 1바이트, 3-4: 2바이트, 5-6: 3바이트, big-endian) -> 마이크로초
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let nbytes = (fsp as usize).div_ceil(2);
    if nbytes == 0 {
        return Ok(0);
    }
    let raw = read_uint_be(cursor, nbytes)? as u32;
    Ok(raw * 10u32.pow(6 - 2 * nbytes as u32))
}

fn with_fraction(mut text: String, micros: u32, fsp: u8) -> String {
    if fsp > 0 && fsp <= 6 {
        let digits = micros / 10u32.pow(6 - fsp as u32);
        text.push_str(&format!(".{:0width$}", digits, width = fsp as usize));
    }
    text
}

fn format_utc_timestamp(secs: u32, micros: u32, fsp: u8) -> String {
    let text = if secs == 0 {
        "0000-00-00 00:00:00".to_string()
    } else {
        match DateTime::from_timestamp(secs as i64, 0) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => secs.to_string(),
        }
    };
    with_fraction(text, micros, fsp)
}

/// DECIMAL 바이너리 (9자리씩 4바이트, 나머지 자리는 가변 바이트, 부호 비트 반전)
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    if scale > precision {
        return Err(BinlogSqlError::BinlogParseError(format!(
            "잘못된 DECIMAL 메타데이터: precision {}, scale {}",
            precision, scale
        )));
    }

    let integral = precision - scale;
    let int_words = integral / 9;
    let int_leftover = integral % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let size = DIG_TO_BYTES[int_leftover] + int_words * 4 + frac_words * 4 + DIG_TO_BYTES[frac_leftover];
    let mut bytes = read_bytes(cursor, size)?;
    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let mut body = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    let lead = DIG_TO_BYTES[int_leftover];
    if lead > 0 {
        let v = read_uint_be(&mut body, lead)?;
        if v > 0 {
            int_part.push_str(&v.to_string());
        }
    }
    for _ in 0..int_words {
        let v = body.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            if v > 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", v));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    text.push_str(&int_part);

    if scale > 0 {
        text.push('.');
        for _ in 0..frac_words {
            let v = body.read_u32::<BigEndian>()?;
            text.push_str(&format!("{:09}", v));
        }
        let tail = DIG_TO_BYTES[frac_leftover];
        if tail > 0 {
            let v = read_uint_be(&mut body, tail)?;
            text.push_str(&format!("{:0width$}", v, width = frac_leftover));
        }
    }

    Ok(text)
}

/// QUERY 이벤트 파싱 (2)
pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
    if data.len() < 13 {
        return Err(BinlogSqlError::BinlogParseError(
            "Invalid query event".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let thread_id = cursor.read_u32::<LittleEndian>()?;
    let exec_time = cursor.read_u32::<LittleEndian>()?;
    let db_len = cursor.read_u8()? as usize;
    let _error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as u64;

    // Status variables skip
    cursor.set_position(cursor.position() + status_len);

    let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len)?).to_string();

    // null terminator skip
    cursor.read_u8()?;

    let remaining = data.get(cursor.position() as usize..).unwrap_or_default();
    let query = String::from_utf8_lossy(remaining).to_string();

    Ok(QueryEventData {
        thread_id,
        exec_time,
        database,
        query,
    })
}

/// ROTATE 이벤트 파싱 (4)
pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
    if data.len() < 8 {
        return Err(BinlogSqlError::BinlogParseError(
            "Invalid rotate event".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let position = cursor.read_u64::<LittleEndian>()?;
    let next_binlog_name = String::from_utf8_lossy(&data[8..])
        .trim_end_matches('\0')
        .to_string();

    Ok(RotateEventData {
        next_binlog_name,
        position,
    })
}

/// GTID 이벤트 파싱 (33)
pub fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
    if data.len() < 25 {
        return Err(BinlogSqlError::BinlogParseError(
            "Invalid GTID event".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let _flags = cursor.read_u8()?;
    let mut uuid_bytes = [0u8; 16];
    cursor.read_exact(&mut uuid_bytes)?;
    let sequence = cursor.read_u64::<LittleEndian>()?;

    Ok(GtidEventData {
        gtid: format!("{}:{}", format_uuid(&uuid_bytes), sequence),
    })
}

/// LCB (Length-Coded Binary) 읽기
pub(crate) fn read_lcb<R: Read>(reader: &mut R) -> Result<u64> {
    let byte = reader.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(reader.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(reader.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(reader.read_u64::<LittleEndian>()?),
        0xff => Err(BinlogSqlError::BinlogParseError("Invalid LCB value".to_string())),
    }
}

fn read_short_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    Ok(String::from_utf8_lossy(&read_bytes(cursor, len)?).to_string())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_uint_le(cursor: &mut Cursor<&[u8]>, width: usize) -> Result<u64> {
    if width == 0 || width > 8 {
        return Err(BinlogSqlError::BinlogParseError(format!(
            "잘못된 길이 바이트 수: {}",
            width
        )));
    }
    Ok(cursor.read_uint::<LittleEndian>(width)?)
}

fn read_uint_be(cursor: &mut Cursor<&[u8]>, width: usize) -> Result<u64> {
    if width == 0 || width > 8 {
        return Err(BinlogSqlError::BinlogParseError(format!(
            "잘못된 길이 바이트 수: {}",
            width
        )));
    }
    Ok(cursor.read_uint::<BigEndian>(width)?)
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|b| b & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

/// UUID 바이트 배열을 문자열로 변환
fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex = json_binary::hex(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
