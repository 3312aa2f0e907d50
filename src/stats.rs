//! 테이블별 통계와 큰/긴 트랜잭션 집계
//!
//! 분류기가 보낸 `Observation`을 하나의 스레드에서 도착 순서대로 소비한다.
//! - `binlog_status.txt`: binlog가 바뀌거나 출력 간격이 지날 때마다 테이블별 누적 건수
//! - `biglong_trx.txt`: 행 수나 실행 시간이 기준을 넘는 트랜잭션
//! - `ddl_info.txt`: 트랜잭션 표시가 아닌 쿼리 이벤트

use crate::config::{format_timestamp, EngineConfig, DATETIME_FORMAT};
use crate::error::{BinlogSqlError, Result};
use crate::events::{ObservedKind, Observation, StatementKind, TrxStatus};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

pub const STATUS_FILE: &str = "binlog_status.txt";
pub const BIGLONG_TRX_FILE: &str = "biglong_trx.txt";
pub const DDL_FILE: &str = "ddl_info.txt";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl KindCounts {
    fn add(&mut self, kind: StatementKind, rows: u64) {
        match kind {
            StatementKind::Insert => self.inserts += rows,
            StatementKind::Update => self.updates += rows,
            StatementKind::Delete => self.deletes += rows,
        }
    }
}

/// 출력 간격 동안의 테이블 하나의 통계
#[derive(Debug, Clone)]
struct TableStats {
    binlog: String,
    start_time: u32,
    stop_time: u32,
    start_pos: u64,
    stop_pos: u64,
    counts: KindCounts,
}

/// 진행 중인 트랜잭션
#[derive(Debug, Clone, Default)]
struct TrxAccumulator {
    open: bool,
    binlog: String,
    start_pos: u64,
    begin_time: u32,
    rows: u64,
    tables: BTreeMap<String, KindCounts>,
}

/// 기준을 넘은 트랜잭션 한 건
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrxRecord {
    pub binlog: String,
    pub start_time: u32,
    pub stop_time: u32,
    pub start_pos: u64,
    pub stop_pos: u64,
    pub rows: u64,
    pub duration: u32,
    pub tables: BTreeMap<String, KindCounts>,
}

impl TrxRecord {
    /// `[db.t(inserts=N, updates=N, deletes=N) ...]`
    pub fn tables_str(&self) -> String {
        let parts: Vec<String> = self
            .tables
            .iter()
            .map(|(name, c)| {
                format!(
                    "{}(inserts={}, updates={}, deletes={})",
                    name, c.inserts, c.updates, c.deletes
                )
            })
            .collect();
        format!("[{}]", parts.join(" "))
    }
}

fn status_header() -> String {
    format!(
        "{:<17} {:<19} {:<19} {:<10} {:<10} {:<8} {:<8} {:<8} {:<15} {:<20}\n",
        "binlog", "starttime", "stoptime", "startpos", "stoppos", "inserts", "updates", "deletes", "database", "table"
    )
}

fn biglong_header() -> String {
    format!(
        "{:<17} {:<19} {:<19} {:<10} {:<10} {:<8} {:<10} {}\n",
        "binlog", "starttime", "stoptime", "startpos", "stoppos", "rows", "duration", "tables"
    )
}

fn ddl_header() -> String {
    format!(
        "{:<19} {:<17} {:<10} {:<10} {}\n",
        "datetime", "binlog", "startpos", "stoppos", "sql"
    )
}

fn write_err(name: &str, e: std::io::Error) -> BinlogSqlError {
    BinlogSqlError::IoError(format!("{} 쓰기 실패: {}", name, e))
}

pub struct StatsAggregator<W: Write> {
    status: W,
    biglong: W,
    ddl: W,
    print_interval: u32,
    big_trx_rows: u64,
    long_trx_secs: u32,
    tables: BTreeMap<String, TableStats>,
    last_binlog: String,
    last_flush: Option<u32>,
    trx: TrxAccumulator,
    big_long_count: u64,
}

impl StatsAggregator<BufWriter<File>> {
    /// 출력 디렉터리에 세 파일을 만들고 헤더를 쓴다
    pub fn create(config: &EngineConfig) -> Result<Self> {
        let open = |name: &str| -> Result<BufWriter<File>> {
            let path = Path::new(&config.output_dir).join(name);
            let file = File::create(&path).map_err(|e| {
                BinlogSqlError::IoError(format!("파일 {} 열기 실패: {}", path.display(), e))
            })?;
            Ok(BufWriter::new(file))
        };
        Self::new(open(STATUS_FILE)?, open(BIGLONG_TRX_FILE)?, open(DDL_FILE)?, config)
    }
}

impl<W: Write> StatsAggregator<W> {
    pub fn new(mut status: W, mut biglong: W, mut ddl: W, config: &EngineConfig) -> Result<Self> {
        status
            .write_all(status_header().as_bytes())
            .map_err(|e| write_err(STATUS_FILE, e))?;
        biglong
            .write_all(biglong_header().as_bytes())
            .map_err(|e| write_err(BIGLONG_TRX_FILE, e))?;
        ddl.write_all(ddl_header().as_bytes())
            .map_err(|e| write_err(DDL_FILE, e))?;

        Ok(StatsAggregator {
            status,
            biglong,
            ddl,
            print_interval: config.print_interval,
            big_trx_rows: config.big_trx_rows,
            long_trx_secs: config.long_trx_secs,
            tables: BTreeMap::new(),
            last_binlog: String::new(),
            last_flush: None,
            trx: TrxAccumulator::default(),
            big_long_count: 0,
        })
    }

    pub fn observe(&mut self, obs: &Observation) -> Result<()> {
        let last_flush = *self.last_flush.get_or_insert(obs.timestamp);
        if self.last_binlog.is_empty() {
            self.last_binlog = obs.binlog.clone();
        }
        if obs.binlog != self.last_binlog
            || obs.timestamp >= last_flush.saturating_add(self.print_interval)
        {
            self.flush_tables()?;
            self.last_flush = Some(obs.timestamp);
            self.last_binlog = obs.binlog.clone();
        }

        match obs.kind {
            ObservedKind::Rows(kind) => {
                self.count_rows(obs, kind);
                Ok(())
            }
            ObservedKind::Query => self.track_query(obs),
        }
    }

    fn count_rows(&mut self, obs: &Observation, kind: StatementKind) {
        let name = format!("{}.{}", obs.database, obs.table);
        let entry = self.tables.entry(name.clone()).or_insert_with(|| TableStats {
            binlog: obs.binlog.clone(),
            start_time: obs.timestamp,
            stop_time: obs.timestamp,
            start_pos: obs.start_pos,
            stop_pos: obs.end_pos,
            counts: KindCounts::default(),
        });
        entry.stop_time = obs.timestamp;
        entry.stop_pos = obs.end_pos;
        entry.counts.add(kind, obs.row_count);

        if self.trx.open {
            self.trx.rows += obs.row_count;
            self.trx.tables.entry(name).or_default().add(kind, obs.row_count);
        }
    }

    fn track_query(&mut self, obs: &Observation) -> Result<()> {
        match obs.trx_status {
            TrxStatus::Begin => {
                self.trx = TrxAccumulator {
                    open: true,
                    binlog: obs.binlog.clone(),
                    start_pos: obs.start_pos,
                    begin_time: obs.timestamp,
                    ..Default::default()
                };
            }
            TrxStatus::Commit | TrxStatus::Rollback => {
                if let Some(record) = self.close_trx(obs) {
                    self.write_trx(&record)?;
                }
            }
            TrxStatus::InProgress => {
                if let Some(sql) = &obs.query {
                    self.write_ddl(obs, sql)?;
                }
            }
        }
        Ok(())
    }

    /// 트랜잭션을 닫고 기준을 넘으면 기록을 돌려준다
    fn close_trx(&mut self, obs: &Observation) -> Option<TrxRecord> {
        let trx = std::mem::take(&mut self.trx);
        if !trx.open {
            return None;
        }
        let duration = obs.timestamp.saturating_sub(trx.begin_time);
        if trx.rows < self.big_trx_rows && duration < self.long_trx_secs {
            return None;
        }
        Some(TrxRecord {
            binlog: trx.binlog,
            start_time: trx.begin_time,
            stop_time: obs.timestamp,
            start_pos: trx.start_pos,
            stop_pos: obs.end_pos,
            rows: trx.rows,
            duration,
            tables: trx.tables,
        })
    }

    fn write_trx(&mut self, record: &TrxRecord) -> Result<()> {
        self.big_long_count += 1;
        debug!(
            "big/long trx at {} {}-{}: rows={} duration={}",
            record.binlog, record.start_pos, record.stop_pos, record.rows, record.duration
        );
        let line = format!(
            "{:<17} {:<19} {:<19} {:<10} {:<10} {:<8} {:<10} {}\n",
            record.binlog,
            format_timestamp(record.start_time, DATETIME_FORMAT),
            format_timestamp(record.stop_time, DATETIME_FORMAT),
            record.start_pos,
            record.stop_pos,
            record.rows,
            record.duration,
            record.tables_str()
        );
        self.biglong
            .write_all(line.as_bytes())
            .map_err(|e| write_err(BIGLONG_TRX_FILE, e))
    }

    fn write_ddl(&mut self, obs: &Observation, sql: &str) -> Result<()> {
        let line = format!(
            "{:<19} {:<17} {:<10} {:<10} {}\n",
            format_timestamp(obs.timestamp, DATETIME_FORMAT),
            obs.binlog,
            obs.start_pos,
            obs.end_pos,
            sql
        );
        self.ddl
            .write_all(line.as_bytes())
            .map_err(|e| write_err(DDL_FILE, e))
    }

    /// 간격 동안 건드린 테이블마다 한 줄씩 쓰고 비운다
    fn flush_tables(&mut self) -> Result<()> {
        for (name, stats) in std::mem::take(&mut self.tables) {
            let (database, table) = name.split_once('.').unwrap_or((name.as_str(), ""));
            let line = format!(
                "{:<17} {:<19} {:<19} {:<10} {:<10} {:<8} {:<8} {:<8} {:<15} {:<20}\n",
                stats.binlog,
                format_timestamp(stats.start_time, DATETIME_FORMAT),
                format_timestamp(stats.stop_time, DATETIME_FORMAT),
                stats.start_pos,
                stats.stop_pos,
                stats.counts.inserts,
                stats.counts.updates,
                stats.counts.deletes,
                database,
                table
            );
            self.status
                .write_all(line.as_bytes())
                .map_err(|e| write_err(STATUS_FILE, e))?;
        }
        Ok(())
    }

    /// 남은 통계를 쓰고 출력들을 돌려준다
    pub fn finish(mut self) -> Result<(W, W, W)> {
        self.flush_tables()?;
        self.status.flush().map_err(|e| write_err(STATUS_FILE, e))?;
        self.biglong.flush().map_err(|e| write_err(BIGLONG_TRX_FILE, e))?;
        self.ddl.flush().map_err(|e| write_err(DDL_FILE, e))?;
        info!("Stats finished, {} big/long transactions", self.big_long_count);
        Ok((self.status, self.biglong, self.ddl))
    }
}
