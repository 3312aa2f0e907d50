//! binlog2sql 에러 타입
//!
//! 테이블 구조를 찾지 못한 경우(`TableNotFound`)만 복구 가능한 에러이고,
//! 나머지는 모두 파이프라인 전체를 중단시킨다.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinlogSqlError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("테이블 구조를 찾을 수 없음: {schema}.{table} (삭제된 테이블일 수 있음)")]
    TableNotFound { schema: String, table: String },

    #[error(
        "{table}: binlog 컬럼 수 {binlog_columns} > 테이블 구조 컬럼 수 {table_columns} (중간에 DDL이 실행된 것으로 보임)"
    )]
    SchemaDrift {
        table: String,
        binlog_columns: usize,
        table_columns: usize,
    },

    #[error("{table} {position} SQL 생성 실패: {detail}\n\trows data: {row}")]
    Encoding {
        table: String,
        position: String,
        detail: String,
        row: String,
    },

    #[error("{table}: 키 컬럼 {column}을(를) 컬럼 목록에서 찾을 수 없음")]
    KeyColumnMissing { table: String, column: String },

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("다른 작업자의 치명적 에러로 중단됨")]
    Aborted,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl BinlogSqlError {
    /// 파이프라인을 멈춰야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BinlogSqlError::TableNotFound { .. })
    }

    /// 다른 단계의 실패 때문에 뒤따라 발생한 에러인지 여부
    pub(crate) fn is_secondary(&self) -> bool {
        matches!(self, BinlogSqlError::ChannelClosed | BinlogSqlError::Aborted)
    }
}

impl From<io::Error> for BinlogSqlError {
    fn from(err: io::Error) -> Self {
        BinlogSqlError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BinlogSqlError>;
