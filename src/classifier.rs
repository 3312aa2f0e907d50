//! 이벤트 분류기
//!
//! 원본 이벤트를 순서대로 한 번 훑으면서 위치/시간 범위와 필터를 적용하고,
//! 트랜잭션 번호와 상태를 매긴다. 살아남은 행 이벤트에는 1부터 빈틈 없이 증가하는
//! 순번을 붙여 SQL 생성으로 보내고, 모든 살아남은 이벤트는 통계 경로로도 보낸다.

use crate::config::EngineConfig;
use crate::error::{BinlogSqlError, Result};
use crate::events::{
    BinlogEvent, BinlogEventData, EventHeader, MutationEvent, ObservedKind, Observation,
    QueryEventData, RowsEventData, TrxStatus,
};
use crate::offset::BinlogPosition;
use crate::schema::{Catalog, DescriptorCache, TableDescriptor};
use std::sync::Arc;
use tracing::{debug, warn};

/// 분류 결과
#[derive(Debug)]
pub enum Classified {
    /// 범위 밖이거나 필터에 걸린 이벤트
    Skip,
    /// 종료 위치/시각에 도달
    Stop,
    Event {
        /// SQL 생성 대상. 통계 전용 모드이거나 테이블 구조가 없으면 None
        mutation: Option<(MutationEvent, Arc<TableDescriptor>)>,
        observation: Observation,
    },
}

enum Bound {
    Before,
    Within,
    Reached,
}

/// 단일 스레드 분류기
pub struct Classifier<'a, C> {
    config: &'a EngineConfig,
    cache: &'a DescriptorCache<C>,
    current_binlog: String,
    /// 직전 테이블 맵 이벤트의 시작 위치 (= 다음 행 이벤트의 실제 시작 위치)
    table_start_pos: u64,
    trx_id: u64,
    next_seq: u64,
}

impl<'a, C: Catalog> Classifier<'a, C> {
    pub fn new(config: &'a EngineConfig, cache: &'a DescriptorCache<C>, start_binlog: &str) -> Self {
        Classifier {
            config,
            cache,
            current_binlog: start_binlog.to_string(),
            table_start_pos: 0,
            trx_id: 0,
            next_seq: 1,
        }
    }

    pub fn current_binlog(&self) -> &str {
        &self.current_binlog
    }

    /// 지금까지 SQL 생성으로 보낸 이벤트 수
    pub fn forwarded(&self) -> u64 {
        self.next_seq - 1
    }

    pub async fn classify(&mut self, event: BinlogEvent) -> Result<Classified> {
        let BinlogEvent { header, data } = event;

        // 테이블 맵/로테이션은 범위 검사 전에 상태만 갱신한다
        match &data {
            BinlogEventData::TableMap(_) => {
                self.table_start_pos = header.start_pos();
                return Ok(Classified::Skip);
            }
            BinlogEventData::Rotate(rotate) => {
                if rotate.next_binlog_name != self.current_binlog {
                    debug!("Rotate to {} at {}", rotate.next_binlog_name, rotate.position);
                }
                self.current_binlog = rotate.next_binlog_name.clone();
                return Ok(Classified::Skip);
            }
            _ => {}
        }

        match self.check_bounds(&header) {
            Bound::Before => return Ok(Classified::Skip),
            Bound::Reached => {
                debug!(
                    "Stop bound reached at {}:{}",
                    self.current_binlog, header.next_pos
                );
                return Ok(Classified::Stop);
            }
            Bound::Within => {}
        }

        match data {
            BinlogEventData::Rows(rows) => self.classify_rows(&header, rows).await,
            BinlogEventData::Query(query) => Ok(self.classify_query(&header, query)),
            BinlogEventData::Xid(_) => Ok(Classified::Event {
                mutation: None,
                observation: self.marker(&header, TrxStatus::Commit),
            }),
            BinlogEventData::MariadbGtid => {
                self.trx_id += 1;
                Ok(Classified::Event {
                    mutation: None,
                    observation: self.marker(&header, TrxStatus::Begin),
                })
            }
            _ => Ok(Classified::Skip),
        }
    }

    fn check_bounds(&self, header: &EventHeader) -> Bound {
        let config = self.config;
        let position = BinlogPosition::new(self.current_binlog.clone(), header.next_pos as u64);

        if let Some(start) = &config.start_position {
            if position < *start {
                return Bound::Before;
            }
        }
        if let Some(stop) = &config.stop_position {
            if position >= *stop {
                return Bound::Reached;
            }
        }
        if let Some(start) = config.start_datetime {
            if header.timestamp < start {
                return Bound::Before;
            }
        }
        if let Some(stop) = config.stop_datetime {
            if header.timestamp >= stop {
                return Bound::Reached;
            }
        }
        Bound::Within
    }

    async fn classify_rows(&mut self, header: &EventHeader, rows: RowsEventData) -> Result<Classified> {
        if !self.config.wants_kind(rows.kind) {
            return Ok(Classified::Skip);
        }
        if !self.config.filter.matches(&rows.database, &rows.table) {
            return Ok(Classified::Skip);
        }
        if rows.database.contains('#') || rows.table.contains('#') {
            return Err(BinlogSqlError::BinlogParseError(format!(
                "'#'이 들어간 이름은 지원하지 않음: {}.{} ({})",
                rows.database,
                rows.table,
                self.position_str(self.table_start_pos, header.next_pos as u64)
            )));
        }

        let observation = Observation {
            timestamp: header.timestamp,
            binlog: self.current_binlog.clone(),
            start_pos: self.table_start_pos,
            end_pos: header.next_pos as u64,
            database: rows.database.clone(),
            table: rows.table.clone(),
            kind: ObservedKind::Rows(rows.kind),
            row_count: rows.affected_rows(),
            query: None,
            trx_status: TrxStatus::InProgress,
        };

        if !self.config.work_type.generates_sql() {
            return Ok(Classified::Event {
                mutation: None,
                observation,
            });
        }

        let descriptor = match self.cache.describe(&rows.database, &rows.table).await {
            Ok(descriptor) => descriptor,
            Err(e) if !e.is_fatal() => {
                warn!(
                    "{}, skip {} event at {}",
                    e,
                    rows.kind,
                    self.position_str(self.table_start_pos, header.next_pos as u64)
                );
                return Ok(Classified::Event {
                    mutation: None,
                    observation,
                });
            }
            Err(e) => return Err(e),
        };

        let mutation = MutationEvent {
            seq: self.next_seq,
            binlog: self.current_binlog.clone(),
            start_pos: self.table_start_pos,
            end_pos: header.next_pos as u64,
            kind: rows.kind,
            database: rows.database,
            table: rows.table,
            column_types: rows.column_types,
            rows: rows.rows,
            timestamp: header.timestamp,
            trx_id: self.trx_id,
            trx_status: TrxStatus::InProgress,
        };
        self.next_seq += 1;

        Ok(Classified::Event {
            mutation: Some((mutation, descriptor)),
            observation,
        })
    }

    fn classify_query(&mut self, header: &EventHeader, query: QueryEventData) -> Classified {
        let (trx_status, row_count) = match query.query.trim().to_ascii_lowercase().as_str() {
            "begin" => {
                self.trx_id += 1;
                (TrxStatus::Begin, 0)
            }
            "commit" => (TrxStatus::Commit, 0),
            "rollback" => (TrxStatus::Rollback, 0),
            _ => (TrxStatus::InProgress, 1),
        };

        Classified::Event {
            mutation: None,
            observation: Observation {
                timestamp: header.timestamp,
                binlog: self.current_binlog.clone(),
                start_pos: header.start_pos(),
                end_pos: header.next_pos as u64,
                database: query.database,
                table: String::new(),
                kind: ObservedKind::Query,
                row_count,
                query: Some(query.query),
                trx_status,
            },
        }
    }

    /// XID / MariaDB GTID 같은 트랜잭션 경계 표시
    fn marker(&self, header: &EventHeader, trx_status: TrxStatus) -> Observation {
        Observation {
            timestamp: header.timestamp,
            binlog: self.current_binlog.clone(),
            start_pos: header.start_pos(),
            end_pos: header.next_pos as u64,
            database: String::new(),
            table: String::new(),
            kind: ObservedKind::Query,
            row_count: 0,
            query: None,
            trx_status,
        }
    }

    fn position_str(&self, start: u64, end: u64) -> String {
        crate::offset::position_range(&self.current_binlog, start, end)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{TableFilter, WorkType};
    use crate::events::{ColumnType, EventType, RotateEventData, StatementKind, TableMapData, Value};
    use crate::schema::{ColumnDef, MemoryCatalog, TableDefinition};

    pub(crate) fn header(event_type: EventType, timestamp: u32, start: u32, end: u32) -> EventHeader {
        EventHeader {
            timestamp,
            event_type,
            server_id: 1,
            event_length: end - start,
            next_pos: end,
            flags: 0,
        }
    }

    pub(crate) fn rotate(binlog: &str) -> BinlogEvent {
        BinlogEvent {
            header: header(EventType::RotateEvent, 0, 0, 0),
            data: BinlogEventData::Rotate(RotateEventData {
                next_binlog_name: binlog.to_string(),
                position: 4,
            }),
        }
    }

    pub(crate) fn table_map(db: &str, table: &str, start: u32, end: u32) -> BinlogEvent {
        BinlogEvent {
            header: header(EventType::TableMapEvent, 1_700_000_000, start, end),
            data: BinlogEventData::TableMap(TableMapData {
                table_id: 1,
                database: db.to_string(),
                table: table.to_string(),
                column_types: vec![ColumnType::Long, ColumnType::Varchar],
                column_meta: vec![0, 32],
                nullable_bitmap: vec![0],
            }),
        }
    }

    pub(crate) fn rows(
        kind: StatementKind,
        db: &str,
        table: &str,
        timestamp: u32,
        start: u32,
        end: u32,
        images: Vec<Vec<Value>>,
    ) -> BinlogEvent {
        let event_type = match kind {
            StatementKind::Insert => EventType::WriteRowsEventV2,
            StatementKind::Update => EventType::UpdateRowsEventV2,
            StatementKind::Delete => EventType::DeleteRowsEventV2,
        };
        BinlogEvent {
            header: header(event_type, timestamp, start, end),
            data: BinlogEventData::Rows(RowsEventData {
                kind,
                table_id: 1,
                database: db.to_string(),
                table: table.to_string(),
                column_types: vec![ColumnType::Long, ColumnType::Varchar],
                rows: images,
            }),
        }
    }

    pub(crate) fn query(sql: &str, timestamp: u32, start: u32, end: u32) -> BinlogEvent {
        BinlogEvent {
            header: header(EventType::QueryEvent, timestamp, start, end),
            data: BinlogEventData::Query(QueryEventData {
                thread_id: 7,
                exec_time: 0,
                database: "db1".to_string(),
                query: sql.to_string(),
            }),
        }
    }

    pub(crate) fn xid(timestamp: u32, start: u32, end: u32) -> BinlogEvent {
        BinlogEvent {
            header: header(EventType::XidEvent, timestamp, start, end),
            data: BinlogEventData::Xid(99),
        }
    }

    pub(crate) fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::Bytes(name.as_bytes().to_vec())]
    }

    /// db1.t1 (id int primary key, name varchar(32))
    pub(crate) fn t1_catalog() -> MemoryCatalog {
        MemoryCatalog::from_definitions(vec![TableDefinition {
            database: "db1".to_string(),
            table: "t1".to_string(),
            columns: vec![ColumnDef::new("id", "int(11)"), ColumnDef::new("name", "varchar(32)")],
            primary_key: vec!["id".to_string()],
            unique_keys: vec![],
        }])
    }

    async fn run(config: &EngineConfig, events: Vec<BinlogEvent>) -> Result<Vec<Classified>> {
        let cache = DescriptorCache::new(t1_catalog());
        let mut classifier = Classifier::new(config, &cache, "mysql-bin.000001");
        let mut out = Vec::new();
        for event in events {
            let classified = classifier.classify(event).await?;
            let stop = matches!(classified, Classified::Stop);
            out.push(classified);
            if stop {
                break;
            }
        }
        Ok(out)
    }

    fn mutations(classified: &[Classified]) -> Vec<&MutationEvent> {
        classified
            .iter()
            .filter_map(|c| match c {
                Classified::Event { mutation: Some((m, _)), .. } => Some(m),
                _ => None,
            })
            .collect()
    }

    fn observations(classified: &[Classified]) -> Vec<&Observation> {
        classified
            .iter()
            .filter_map(|c| match c {
                Classified::Event { observation, .. } => Some(observation),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_rows_take_start_from_table_map() {
        let config = EngineConfig::default();
        let out = run(
            &config,
            vec![
                rotate("mysql-bin.000001"),
                table_map("db1", "t1", 100, 150),
                rows(StatementKind::Insert, "db1", "t1", 10, 150, 200, vec![row(1, "a")]),
                table_map("db1", "t1", 200, 250),
                rows(StatementKind::Delete, "db1", "t1", 10, 250, 300, vec![row(1, "a"), row(2, "b")]),
            ],
        )
        .await
        .unwrap();

        let m = mutations(&out);
        assert_eq!(m.len(), 2);
        assert_eq!((m[0].seq, m[0].start_pos, m[0].end_pos), (1, 100, 200));
        assert_eq!((m[1].seq, m[1].start_pos, m[1].end_pos), (2, 200, 300));
        assert_eq!(m[1].binlog, "mysql-bin.000001");
        assert_eq!(observations(&out)[1].row_count, 2);
    }

    #[tokio::test]
    async fn test_filters_do_not_consume_sequence() {
        let config = EngineConfig {
            statement_kinds: vec![StatementKind::Insert, StatementKind::Update],
            filter: TableFilter::new(Default::default(), vec![], vec![], vec![], vec!["tmp".to_string()])
                .unwrap(),
            ..Default::default()
        };
        let out = run(
            &config,
            vec![
                table_map("db1", "t1", 100, 150),
                rows(StatementKind::Delete, "db1", "t1", 10, 150, 200, vec![row(1, "a")]),
                table_map("db1", "tmp", 200, 250),
                rows(StatementKind::Insert, "db1", "tmp", 10, 250, 300, vec![row(1, "a")]),
                table_map("db1", "t1", 300, 350),
                rows(StatementKind::Insert, "db1", "t1", 10, 350, 400, vec![row(2, "b")]),
            ],
        )
        .await
        .unwrap();

        let m = mutations(&out);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].seq, 1);
        assert_eq!(m[0].start_pos, 300);
        assert_eq!(observations(&out).len(), 1);
    }

    #[tokio::test]
    async fn test_position_bounds() {
        let config = EngineConfig {
            start_position: Some(BinlogPosition::new("mysql-bin.000001", 200)),
            stop_position: Some(BinlogPosition::new("mysql-bin.000001", 400)),
            ..Default::default()
        };
        let out = run(
            &config,
            vec![
                table_map("db1", "t1", 100, 150),
                rows(StatementKind::Insert, "db1", "t1", 10, 150, 199, vec![row(1, "a")]),
                table_map("db1", "t1", 199, 250),
                rows(StatementKind::Insert, "db1", "t1", 10, 250, 300, vec![row(2, "b")]),
                table_map("db1", "t1", 300, 350),
                rows(StatementKind::Insert, "db1", "t1", 10, 350, 400, vec![row(3, "c")]),
                rows(StatementKind::Insert, "db1", "t1", 10, 400, 450, vec![row(4, "d")]),
            ],
        )
        .await
        .unwrap();

        let m = mutations(&out);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].rows[0][0], Value::Int(2));
        assert!(matches!(out.last(), Some(Classified::Stop)));
        assert_eq!(out.len(), 6);
    }

    #[tokio::test]
    async fn test_datetime_bounds() {
        let config = EngineConfig {
            start_datetime: Some(100),
            stop_datetime: Some(200),
            ..Default::default()
        };
        let out = run(
            &config,
            vec![
                query("CREATE TABLE a (id int)", 50, 4, 100),
                query("CREATE TABLE b (id int)", 150, 100, 200),
                query("CREATE TABLE c (id int)", 200, 200, 300),
                query("CREATE TABLE d (id int)", 150, 300, 400),
            ],
        )
        .await
        .unwrap();

        let obs = observations(&out);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].query.as_deref(), Some("CREATE TABLE b (id int)"));
        assert!(matches!(out.last(), Some(Classified::Stop)));
    }

    #[tokio::test]
    async fn test_transaction_tracking() {
        let config = EngineConfig::default();
        let out = run(
            &config,
            vec![
                query("BEGIN", 10, 4, 80),
                table_map("db1", "t1", 80, 130),
                rows(StatementKind::Insert, "db1", "t1", 10, 130, 180, vec![row(1, "a")]),
                xid(11, 180, 211),
                query("alter table t1 add c int", 12, 211, 300),
                query("BEGIN", 13, 300, 380),
                table_map("db1", "t1", 380, 430),
                rows(StatementKind::Insert, "db1", "t1", 13, 430, 480, vec![row(2, "b")]),
                query("ROLLBACK", 14, 480, 550),
            ],
        )
        .await
        .unwrap();

        let obs = observations(&out);
        let statuses: Vec<TrxStatus> = obs.iter().map(|o| o.trx_status).collect();
        assert_eq!(
            statuses,
            vec![
                TrxStatus::Begin,
                TrxStatus::InProgress,
                TrxStatus::Commit,
                TrxStatus::InProgress,
                TrxStatus::Begin,
                TrxStatus::InProgress,
                TrxStatus::Rollback,
            ]
        );
        assert_eq!(obs[3].row_count, 1);
        assert_eq!(obs[2].start_pos, 180);

        let m = mutations(&out);
        assert_eq!((m[0].trx_id, m[1].trx_id), (1, 2));
    }

    #[tokio::test]
    async fn test_missing_table_is_observed_but_not_forwarded() {
        let config = EngineConfig::default();
        let out = run(
            &config,
            vec![
                table_map("db1", "dropped", 100, 150),
                rows(StatementKind::Insert, "db1", "dropped", 10, 150, 200, vec![row(1, "a")]),
                table_map("db1", "t1", 200, 250),
                rows(StatementKind::Insert, "db1", "t1", 10, 250, 300, vec![row(1, "a")]),
            ],
        )
        .await
        .unwrap();

        assert_eq!(observations(&out).len(), 2);
        let m = mutations(&out);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].seq, 1);
    }

    #[tokio::test]
    async fn test_stats_mode_never_describes() {
        let config = EngineConfig {
            work_type: WorkType::Stats,
            ..Default::default()
        };
        let cache = DescriptorCache::new(t1_catalog());
        let mut classifier = Classifier::new(&config, &cache, "mysql-bin.000001");
        classifier.classify(table_map("db1", "t1", 100, 150)).await.unwrap();
        let out = classifier
            .classify(rows(StatementKind::Update, "db1", "t1", 10, 150, 200, vec![row(1, "a"), row(1, "b")]))
            .await
            .unwrap();

        match out {
            Classified::Event { mutation, observation } => {
                assert!(mutation.is_none());
                assert_eq!(observation.row_count, 1);
                assert_eq!(observation.kind, ObservedKind::Rows(StatementKind::Update));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cache.cached_tables(), 0);
        assert_eq!(classifier.forwarded(), 0);
    }

    #[tokio::test]
    async fn test_rotate_changes_binlog_and_hash_name_is_fatal() {
        let config = EngineConfig::default();
        let cache = DescriptorCache::new(t1_catalog());
        let mut classifier = Classifier::new(&config, &cache, "mysql-bin.000001");

        classifier.classify(rotate("mysql-bin.000002")).await.unwrap();
        assert_eq!(classifier.current_binlog(), "mysql-bin.000002");

        let err = classifier
            .classify(rows(StatementKind::Insert, "db1", "t#1", 10, 150, 200, vec![row(1, "a")]))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
