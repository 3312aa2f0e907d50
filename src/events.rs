//! MySQL Binlog 이벤트 타입 및 파이프라인 데이터 구조 정의
//!
//! 원본 binlog 이벤트(`BinlogEvent`)는 이벤트 소스가 만들고,
//! 분류기가 이를 `MutationEvent`(SQL 생성용)와 `Observation`(통계용)으로 나눈다.

use crate::error::BinlogSqlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN 등)
    QueryEvent = 2,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트 (체크섬 정보 포함)
    FormatDescriptionEvent = 15,
    /// XID 이벤트 (트랜잭션 커밋)
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    /// 하트비트 (라이브 스트림 전용)
    HeartbeatEvent = 27,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEventV2 = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEventV2 = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEventV2 = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    /// MariaDB GTID 이벤트 (트랜잭션 시작 표시)
    MariadbGtidEvent = 162,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            162 => EventType::MariadbGtidEvent,
            _ => EventType::Unknown,
        }
    }

    /// 행 변경 이벤트의 SQL 종류
    pub fn statement_kind(&self) -> Option<StatementKind> {
        match self {
            EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2 => Some(StatementKind::Insert),
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2 => Some(StatementKind::Update),
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2 => Some(StatementKind::Delete),
            _ => None,
        }
    }

    pub fn is_rows_v2(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2 | EventType::UpdateRowsEventV2 | EventType::DeleteRowsEventV2
        )
    }
}

/// MySQL 컬럼 타입 (테이블 맵 이벤트 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::Null,
        }
    }

    /// 정수 타입의 바이트 폭
    pub fn integer_width(&self) -> Option<u32> {
        match self {
            ColumnType::Tiny => Some(1),
            ColumnType::Short => Some(2),
            ColumnType::Int24 => Some(3),
            ColumnType::Long => Some(4),
            ColumnType::LongLong => Some(8),
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ColumnType::Float | ColumnType::Double)
    }

    /// 값이 바이트 열로 전달되는 타입 (blob/json/geometry/알 수 없음)
    pub fn is_byte_sequence(&self) -> bool {
        matches!(
            self,
            ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Blob
                | ColumnType::Json
                | ColumnType::Geometry
                | ColumnType::Null
        )
    }

    pub fn is_blob(&self) -> bool {
        matches!(
            self,
            ColumnType::TinyBlob | ColumnType::MediumBlob | ColumnType::LongBlob | ColumnType::Blob
        )
    }
}

/// 셀 값
///
/// 디코딩 시점에 한 번 만들어지고 SQL 생성기가 그대로 소비한다.
/// 날짜/시간/decimal은 `Text`로 전달된다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Unsigned(u64),
    /// FLOAT 컬럼. 출력할 때 f32 최단 표현을 쓴다
    Float32(f32),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// 바이트 비교용 원시 표현
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatementKind {
    type Err = BinlogSqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(StatementKind::Insert),
            "update" => Ok(StatementKind::Update),
            "delete" => Ok(StatementKind::Delete),
            other => Err(BinlogSqlError::InvalidConfig(format!(
                "지원하지 않는 SQL 종류: {} (insert, update, delete 중 하나)",
                other
            ))),
        }
    }
}

/// 트랜잭션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrxStatus {
    Begin,
    InProgress,
    Commit,
    Rollback,
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치 (= 이 이벤트의 끝 위치)
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    /// 이벤트 시작 위치
    pub fn start_pos(&self) -> u64 {
        (self.next_pos as u64).saturating_sub(self.event_length as u64)
    }
}

/// 포맷 설명 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub header_length: u8,
    /// 0 = NONE, 1 = CRC32
    pub checksum_type: u8,
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<ColumnType>,
    /// 컬럼 메타데이터
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터
///
/// UPDATE는 (before, after) 순서로 두 행씩 번갈아 들어 있다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEventData {
    pub kind: StatementKind,
    pub table_id: u64,
    pub database: String,
    pub table: String,
    /// 테이블 맵 이벤트가 보고한 컬럼 타입
    pub column_types: Vec<ColumnType>,
    pub rows: Vec<Vec<Value>>,
}

impl RowsEventData {
    /// 영향받은 행 수
    pub fn affected_rows(&self) -> u64 {
        match self.kind {
            StatementKind::Update => (self.rows.len() / 2) as u64,
            _ => self.rows.len() as u64,
        }
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    /// 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    /// GTID 문자열 (format: uuid:sequence-number)
    pub gtid: String,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    FormatDescription(FormatDescriptionData),
    TableMap(TableMapData),
    Rows(RowsEventData),
    Query(QueryEventData),
    /// 트랜잭션 커밋
    Xid(u64),
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    /// MariaDB 트랜잭션 시작 표시
    MariadbGtid,
    Heartbeat,
    Unknown(Vec<u8>),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
}

/// SQL 생성 대상 행 변경 이벤트
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// 분류기가 부여한 연속 순번 (1부터)
    pub seq: u64,
    pub binlog: String,
    /// 앞선 테이블 맵 이벤트의 시작 위치
    pub start_pos: u64,
    /// 행 이벤트 자체의 끝 위치
    pub end_pos: u64,
    pub kind: StatementKind,
    pub database: String,
    pub table: String,
    pub column_types: Vec<ColumnType>,
    pub rows: Vec<Vec<Value>>,
    pub timestamp: u32,
    pub trx_id: u64,
    pub trx_status: TrxStatus,
}

impl MutationEvent {
    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    pub fn position_str(&self) -> String {
        crate::offset::position_range(&self.binlog, self.start_pos, self.end_pos)
    }
}

/// 같은 이벤트에서 생성된 SQL 묶음
#[derive(Debug, Clone)]
pub struct StatementBatch {
    pub seq: u64,
    pub statements: Vec<String>,
    pub database: String,
    pub table: String,
    pub binlog: String,
    pub start_pos: u64,
    pub end_pos: u64,
    pub timestamp: u32,
    pub trx_id: u64,
    pub trx_status: TrxStatus,
}

/// 통계 집계용 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedKind {
    Rows(StatementKind),
    Query,
}

/// 통계 경로로 보내는 가벼운 이벤트 기록
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: u32,
    pub binlog: String,
    pub start_pos: u64,
    pub end_pos: u64,
    pub database: String,
    pub table: String,
    pub kind: ObservedKind,
    pub row_count: u64,
    /// 행 이벤트가 아닌 경우의 원본 쿼리
    pub query: Option<String>,
    pub trx_status: TrxStatus,
}
