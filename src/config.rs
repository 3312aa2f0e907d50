//! 엔진 설정
//!
//! `main`에서 한 번 만들어 각 단계 생성자에 넘긴다. 전역 상태는 두지 않는다.

use crate::error::{BinlogSqlError, Result};
use crate::events::StatementKind;
use crate::offset::BinlogPosition;
use chrono::{Local, NaiveDateTime, TimeZone};
use regex::Regex;
use std::path::PathBuf;

pub const MIN_THREADS: usize = 1;
pub const MAX_THREADS: usize = 8;
pub const DEFAULT_THREADS: usize = 2;

pub const DEFAULT_PRINT_INTERVAL: u32 = 30;
pub const DEFAULT_BIG_TRX_ROWS: u64 = 500;
pub const DEFAULT_LONG_TRX_SECS: u32 = 300;
pub const DEFAULT_INSERT_ROWS: usize = 1;

/// 날짜 입력/출력 형식
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// SQL 파일 주석 줄처럼 공백이 들어가면 안 되는 곳에 쓰는 형식
pub const DATETIME_FORMAT_NOSPACE: &str = "%Y-%m-%d_%H:%M:%S";

/// 작업 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    /// 정방향 SQL ("2sql")
    Forward,
    /// 롤백 SQL
    Rollback,
    /// 통계만
    Stats,
}

impl WorkType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2sql" | "forward" => Ok(WorkType::Forward),
            "rollback" => Ok(WorkType::Rollback),
            "stats" => Ok(WorkType::Stats),
            other => Err(BinlogSqlError::InvalidConfig(format!(
                "work type은 2sql, rollback, stats 중 하나여야 함: {}",
                other
            ))),
        }
    }

    /// SQL 생성 경로가 필요한지 여부
    pub fn generates_sql(&self) -> bool {
        !matches!(self, WorkType::Stats)
    }
}

/// 이름 매칭 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// 대소문자를 구분하는 완전 일치
    #[default]
    Exact,
    /// 소문자로 바꾼 이름에 정규식 매칭
    Regex,
}

/// 스키마/테이블 필터
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    pub mode: FilterMode,
    pub databases: Vec<String>,
    pub tables: Vec<String>,
    pub ignore_databases: Vec<String>,
    pub ignore_tables: Vec<String>,
    compiled: Option<CompiledPatterns>,
}

#[derive(Debug, Clone)]
struct CompiledPatterns {
    databases: Vec<Regex>,
    tables: Vec<Regex>,
    ignore_databases: Vec<Regex>,
    ignore_tables: Vec<Regex>,
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                BinlogSqlError::InvalidConfig(format!("잘못된 정규식 {}: {}", p, e))
            })
        })
        .collect()
}

impl TableFilter {
    pub fn new(
        mode: FilterMode,
        databases: Vec<String>,
        tables: Vec<String>,
        ignore_databases: Vec<String>,
        ignore_tables: Vec<String>,
    ) -> Result<Self> {
        let compiled = match mode {
            FilterMode::Exact => None,
            FilterMode::Regex => Some(CompiledPatterns {
                databases: compile_all(&databases)?,
                tables: compile_all(&tables)?,
                ignore_databases: compile_all(&ignore_databases)?,
                ignore_tables: compile_all(&ignore_tables)?,
            }),
        };

        Ok(TableFilter {
            mode,
            databases,
            tables,
            ignore_databases,
            ignore_tables,
            compiled,
        })
    }

    /// 처리 대상 테이블인지 확인
    pub fn matches(&self, database: &str, table: &str) -> bool {
        match &self.compiled {
            Some(c) => {
                let db = database.to_lowercase();
                let tb = table.to_lowercase();
                let hit = |list: &[Regex], name: &str| list.iter().any(|r| r.is_match(name));

                (c.databases.is_empty() || hit(&c.databases, &db))
                    && (c.tables.is_empty() || hit(&c.tables, &tb))
                    && !hit(&c.ignore_databases, &db)
                    && !hit(&c.ignore_tables, &tb)
            }
            None => {
                let hit = |list: &[String], name: &str| list.iter().any(|s| s == name);

                (self.databases.is_empty() || hit(&self.databases, database))
                    && (self.tables.is_empty() || hit(&self.tables, table))
                    && !hit(&self.ignore_databases, database)
                    && !hit(&self.ignore_tables, table)
            }
        }
    }
}

/// SQL 생성 옵션
#[derive(Debug, Clone)]
pub struct GenOptions {
    pub rollback: bool,
    pub prefer_unique_key: bool,
    pub full_image: bool,
    pub ignore_primary_key_for_insert: bool,
    pub rows_per_statement: usize,
    pub prefix_database: bool,
}

impl Default for GenOptions {
    fn default() -> Self {
        GenOptions {
            rollback: false,
            prefer_unique_key: false,
            full_image: false,
            ignore_primary_key_for_insert: false,
            rows_per_statement: DEFAULT_INSERT_ROWS,
            prefix_database: true,
        }
    }
}

/// 파이프라인 전체 설정
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub work_type: WorkType,
    pub filter: TableFilter,
    /// 비어 있으면 모든 종류
    pub statement_kinds: Vec<StatementKind>,
    pub start_position: Option<BinlogPosition>,
    pub stop_position: Option<BinlogPosition>,
    /// unix timestamp (초)
    pub start_datetime: Option<u32>,
    pub stop_datetime: Option<u32>,
    pub output_dir: PathBuf,
    pub output_to_screen: bool,
    pub file_per_table: bool,
    pub print_extra_info: bool,
    pub keep_trx: bool,
    pub threads: usize,
    pub gen: GenOptions,
    pub print_interval: u32,
    pub big_trx_rows: u64,
    pub long_trx_secs: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            work_type: WorkType::Forward,
            filter: TableFilter::default(),
            statement_kinds: Vec::new(),
            start_position: None,
            stop_position: None,
            start_datetime: None,
            stop_datetime: None,
            output_dir: PathBuf::from("."),
            output_to_screen: false,
            file_per_table: false,
            print_extra_info: false,
            keep_trx: false,
            threads: DEFAULT_THREADS,
            gen: GenOptions::default(),
            print_interval: DEFAULT_PRINT_INTERVAL,
            big_trx_rows: DEFAULT_BIG_TRX_ROWS,
            long_trx_secs: DEFAULT_LONG_TRX_SECS,
        }
    }
}

impl EngineConfig {
    /// 값 범위와 상호 제약 검사. rollback 여부는 work type을 따른다.
    pub fn validate(&mut self) -> Result<()> {
        check_range("threads", self.threads as u64, MIN_THREADS as u64, MAX_THREADS as u64)?;
        check_range("print interval", self.print_interval as u64, 1, 600)?;
        check_range("big trx row limit", self.big_trx_rows, 10, 30000)?;
        check_range("long trx seconds", self.long_trx_secs as u64, 1, 3600)?;
        check_range("insert rows", self.gen.rows_per_statement as u64, 1, 500)?;

        if let (Some(start), Some(stop)) = (&self.start_position, &self.stop_position) {
            if start >= stop {
                return Err(BinlogSqlError::InvalidConfig(format!(
                    "시작 위치 {}가 종료 위치 {}보다 작아야 함",
                    start, stop
                )));
            }
        }

        if let (Some(start), Some(stop)) = (self.start_datetime, self.stop_datetime) {
            if start >= stop {
                return Err(BinlogSqlError::InvalidConfig(
                    "시작 시각이 종료 시각보다 빨라야 함".to_string(),
                ));
            }
        }

        self.gen.rollback = self.work_type == WorkType::Rollback;
        if self.gen.rollback {
            // 롤백 INSERT는 원래 행을 그대로 되살려야 함
            self.gen.ignore_primary_key_for_insert = false;
        }

        Ok(())
    }

    /// 통계 출력 외에 SQL 파일/화면 출력이 있는지
    pub fn writes_sql(&self) -> bool {
        self.work_type.generates_sql()
    }

    pub fn wants_kind(&self, kind: StatementKind) -> bool {
        self.statement_kinds.is_empty() || self.statement_kinds.contains(&kind)
    }

    /// 파일 모드에서 다음 binlog 파일로 넘어갈지 여부
    pub fn has_stop_bound(&self) -> bool {
        self.stop_position.is_some() || self.stop_datetime.is_some()
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(BinlogSqlError::InvalidConfig(format!(
            "{}는 [{}, {}] 범위여야 함: {}",
            name, min, max, value
        )));
    }
    Ok(())
}

/// "2024-01-02 03:04:05" (로컬 시간) -> unix timestamp
pub fn parse_datetime(s: &str) -> Result<u32> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), DATETIME_FORMAT).map_err(|e| {
        BinlogSqlError::InvalidConfig(format!("날짜 형식은 {} 이어야 함: {} ({})", DATETIME_FORMAT, s, e))
    })?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| BinlogSqlError::InvalidConfig(format!("존재하지 않는 로컬 시각: {}", s)))?;
    u32::try_from(local.timestamp())
        .map_err(|_| BinlogSqlError::InvalidConfig(format!("범위를 벗어난 시각: {}", s)))
}

/// unix timestamp -> 로컬 시간 문자열
pub fn format_timestamp(ts: u32, fmt: &str) -> String {
    match Local.timestamp_opt(ts as i64, 0).single() {
        Some(dt) => dt.format(fmt).to_string(),
        None => ts.to_string(),
    }
}
