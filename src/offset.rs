//! Binlog 위치 추적
//!
//! Binlog 파일명 + 바이트 위치로 이벤트 위치를 표현합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::error::{BinlogSqlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// binlog 파일의 첫 이벤트 위치 (4 바이트 매직 넘버 다음)
pub const BINLOG_FIRST_EVENT_POS: u64 = 4;

/// Binlog 파일 위치 정보
///
/// 파일명을 먼저, 같은 파일 안에서는 바이트 위치를 비교한다.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        binlog_index(&self.filename).ok()
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// "mysql-bin.000123" -> 123
pub fn binlog_index(binlog: &str) -> Result<u64> {
    let name = Path::new(binlog)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binlog);

    name.rsplit('.')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BinlogSqlError::BinlogParseError(format!(
                "binlog 파일명에서 인덱스를 읽을 수 없음: {}",
                binlog
            ))
        })
}

/// "mysql-bin.000123" -> "mysql-bin.000124"
pub fn next_binlog_name(binlog: &str) -> Result<String> {
    let index = binlog_index(binlog)?;
    let (base, suffix) = binlog
        .rsplit_once('.')
        .ok_or_else(|| BinlogSqlError::BinlogParseError(format!("잘못된 binlog 파일명: {}", binlog)))?;
    let width = suffix.len().max(6);
    Ok(format!("{}.{:0width$}", base, index + 1, width = width))
}

/// 로그 메시지용 "binlog start-end" 표기
pub fn position_range(binlog: &str, start: u64, end: u64) -> String {
    format!("{} {}-{}", binlog, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.000009", 9000);
        let b = BinlogPosition::new("mysql-bin.000010", 4);
        let c = BinlogPosition::new("mysql-bin.000010", 120);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.cmp(&c.clone()), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_next_binlog_name() {
        assert_eq!(next_binlog_name("mysql-bin.000009").unwrap(), "mysql-bin.000010");
        assert_eq!(next_binlog_name("binlog.999999").unwrap(), "binlog.1000000");
        assert!(next_binlog_name("no-index").is_err());
    }

    #[test]
    fn test_binlog_index_ignores_directory() {
        assert_eq!(binlog_index("/var/lib/mysql/mysql-bin.000042").unwrap(), 42);
    }
}
