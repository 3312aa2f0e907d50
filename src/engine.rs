//! 파이프라인 실행
//!
//! ```text
//! source -> classifier --work--> worker x N --gate--> writer -> (reverse)
//!                      \--observations--> stats
//! ```
//!
//! 분류기는 호출한 태스크에서 돌고, 나머지 단계는 `spawn_blocking` 스레드에서 돈다.
//! 어느 단계든 치명적 에러가 나면 게이트를 중단시키고 채널을 닫아 전체를 멈춘다.

use crate::classifier::{Classified, Classifier};
use crate::config::EngineConfig;
use crate::error::{BinlogSqlError, Result};
use crate::events::{MutationEvent, Observation, StatementBatch};
use crate::gate::OrderingGate;
use crate::reverse;
use crate::schema::{Catalog, DescriptorCache, TableDescriptor};
use crate::source::EventSource;
use crate::sqlgen;
use crate::stats::StatsAggregator;
use crate::writer::{RollbackFile, SqlWriter};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info};

/// 통계 채널 크기
pub const OBSERVATION_CHANNEL_SIZE: usize = 10000;

type Job = (MutationEvent, Arc<TableDescriptor>);

/// 실행 결과 요약
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// SQL 생성으로 보낸 행 이벤트 수
    pub forwarded: u64,
    /// 마지막으로 읽은 binlog 파일
    pub last_binlog: String,
    /// 뒤집은 롤백 파일 수
    pub rollback_files: usize,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    screen: Option<Box<dyn Write + Send>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config: Arc::new(config),
            screen: None,
        }
    }

    /// 화면 출력 대신 주어진 출력으로 SQL을 보낸다
    pub fn with_screen(mut self, out: Box<dyn Write + Send>) -> Self {
        self.screen = Some(out);
        self
    }

    /// 소스가 끝나거나 종료 위치에 닿을 때까지 실행한다.
    ///
    /// 여러 단계가 실패하면 다른 단계의 실패로 뒤따라 생긴 에러(`ChannelClosed`, `Aborted`)보다
    /// 처음 원인이 된 에러를 돌려준다.
    pub async fn run<S, C>(self, mut source: S, catalog: C, start_binlog: &str) -> Result<RunSummary>
    where
        S: EventSource,
        C: Catalog,
    {
        let Engine { config, screen } = self;
        let generate = config.writes_sql();
        let threads = config.threads.max(1);
        let gate = Arc::new(OrderingGate::new(1));

        info!(
            "Start {:?} from {} with {} threads",
            config.work_type, start_binlog, threads
        );

        let (obs_tx, obs_rx) = mpsc::channel::<Observation>(OBSERVATION_CHANNEL_SIZE);
        let stats = spawn_stats(Arc::clone(&config), obs_rx);

        let mut workers = Vec::new();
        let mut writer = None;
        let mut work_tx = None;
        if generate {
            let (tx, rx) = mpsc::channel::<Job>(threads * 2);
            let (batch_tx, batch_rx) = mpsc::channel::<StatementBatch>(threads * 2);
            let rx = Arc::new(Mutex::new(rx));
            for id in 1..=threads {
                workers.push(spawn_worker(
                    id,
                    Arc::clone(&config),
                    Arc::clone(&rx),
                    batch_tx.clone(),
                    Arc::clone(&gate),
                ));
            }
            writer = Some(spawn_writer(Arc::clone(&config), screen, batch_rx, Arc::clone(&gate)));
            work_tx = Some(tx);
        }

        // 분류 단계
        let cache = DescriptorCache::new(catalog);
        let mut classifier = Classifier::new(&config, &cache, start_binlog);
        let mut errors = Vec::new();
        loop {
            if gate.is_aborted() {
                debug!("Pipeline aborted, stop reading events");
                break;
            }
            let event = match source.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    errors.push(e);
                    break;
                }
            };
            match classifier.classify(event).await {
                Ok(Classified::Skip) => {}
                Ok(Classified::Stop) => break,
                Ok(Classified::Event { mutation, observation }) => {
                    if let (Some(job), Some(tx)) = (mutation, work_tx.as_ref()) {
                        if tx.send(job).await.is_err() {
                            errors.push(BinlogSqlError::ChannelClosed);
                            break;
                        }
                    }
                    if obs_tx.send(observation).await.is_err() {
                        errors.push(BinlogSqlError::ChannelClosed);
                        break;
                    }
                }
                Err(e) => {
                    errors.push(e);
                    break;
                }
            }
        }

        if !errors.is_empty() {
            gate.abort();
        }
        let summary_binlog = classifier.current_binlog().to_string();
        let forwarded = classifier.forwarded();
        drop(work_tx);
        drop(obs_tx);

        for handle in workers {
            if let Err(e) = join("worker", handle).await {
                errors.push(e);
            }
        }

        let mut rollback_files = Vec::new();
        if let Some(handle) = writer {
            match join("writer", handle).await {
                Ok(files) => rollback_files = files,
                Err(e) => errors.push(e),
            }
        }

        let mut reversed = 0;
        if errors.is_empty() && config.gen.rollback && !rollback_files.is_empty() {
            reversed = rollback_files.len();
            let keep_trx = config.keep_trx;
            let files = rollback_files;
            let result = task::spawn_blocking(move || reverse::reverse_all(files, threads, keep_trx));
            if let Err(e) = join("reverse", result).await {
                errors.push(e);
            }
        }

        if let Err(e) = join("stats", stats).await {
            errors.push(e);
        }

        if let Some(e) = primary_error(errors) {
            error!("Pipeline failed: {}", e);
            return Err(e);
        }

        info!(
            "Finished at {}, {} row events sent to sql generation",
            summary_binlog, forwarded
        );
        Ok(RunSummary {
            forwarded,
            last_binlog: summary_binlog,
            rollback_files: reversed,
        })
    }
}

fn spawn_stats(config: Arc<EngineConfig>, mut rx: mpsc::Receiver<Observation>) -> JoinHandle<Result<()>> {
    task::spawn_blocking(move || {
        let mut aggregator = StatsAggregator::create(&config)?;
        while let Some(observation) = rx.blocking_recv() {
            aggregator.observe(&observation)?;
        }
        aggregator.finish()?;
        Ok(())
    })
}

fn spawn_worker(
    id: usize,
    config: Arc<EngineConfig>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    batch_tx: mpsc::Sender<StatementBatch>,
    gate: Arc<OrderingGate>,
) -> JoinHandle<Result<()>> {
    task::spawn_blocking(move || {
        info!("start thread {} to generate sql", id);
        let result = generate_loop(&config, &rx, &batch_tx, &gate);
        if let Err(e) = &result {
            if !e.is_secondary() {
                error!("thread {} failed: {}", id, e);
            }
            gate.abort();
        }
        info!("exit thread {} to generate sql", id);
        result
    })
}

fn generate_loop(
    config: &EngineConfig,
    rx: &Mutex<mpsc::Receiver<Job>>,
    batch_tx: &mpsc::Sender<StatementBatch>,
    gate: &OrderingGate,
) -> Result<()> {
    loop {
        // 한 작업자만 채널에서 기다리고 나머지는 잠금에서 기다린다
        let job = rx.lock().blocking_recv();
        let Some((event, descriptor)) = job else {
            return Ok(());
        };
        let statements = sqlgen::generate(&event, &descriptor, &config.gen)?;
        let batch = StatementBatch {
            seq: event.seq,
            statements,
            database: event.database,
            table: event.table,
            binlog: event.binlog,
            start_pos: event.start_pos,
            end_pos: event.end_pos,
            timestamp: event.timestamp,
            trx_id: event.trx_id,
            trx_status: event.trx_status,
        };
        gate.release(event.seq, || {
            batch_tx
                .blocking_send(batch)
                .map_err(|_| BinlogSqlError::ChannelClosed)
        })?;
    }
}

fn spawn_writer(
    config: Arc<EngineConfig>,
    screen: Option<Box<dyn Write + Send>>,
    mut rx: mpsc::Receiver<StatementBatch>,
    gate: Arc<OrderingGate>,
) -> JoinHandle<Result<Vec<RollbackFile>>> {
    task::spawn_blocking(move || {
        let mut writer = SqlWriter::new(&config);
        if let Some(out) = screen {
            writer = writer.with_screen(out);
        }
        while let Some(batch) = rx.blocking_recv() {
            if let Err(e) = writer.write_batch(&batch) {
                error!("fail to write sql of {}: {}", batch.seq, e);
                // 채널을 먼저 닫아 전달 중인 작업자를 깨운다
                drop(rx);
                gate.abort();
                return Err(e);
            }
        }
        writer.finish()
    })
}

async fn join<T>(stage: &str, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(BinlogSqlError::Other(format!("{} 스레드 join 실패: {}", stage, e))),
    }
}

/// 원인 에러를 먼저 고른다
fn primary_error(mut errors: Vec<BinlogSqlError>) -> Option<BinlogSqlError> {
    if errors.is_empty() {
        return None;
    }
    let index = errors.iter().position(|e| !e.is_secondary()).unwrap_or(0);
    Some(errors.swap_remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::{query, rotate, row, rows, t1_catalog, table_map, xid};
    use crate::config::WorkType;
    use crate::events::{BinlogEvent, BinlogEventData, ColumnType, StatementKind};
    use crate::source::VecSource;
    use crate::stats::{BIGLONG_TRX_FILE, DDL_FILE, STATUS_FILE};
    use std::fs;
    use std::path::Path;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn config(dir: &Path, work_type: WorkType, threads: usize) -> EngineConfig {
        let mut config = EngineConfig {
            work_type,
            output_dir: dir.to_path_buf(),
            threads,
            ..Default::default()
        };
        config.validate().unwrap();
        config
    }

    /// 트랜잭션 두 개: (insert 1, insert 2), (delete 1)
    fn two_transactions() -> Vec<BinlogEvent> {
        vec![
            rotate("mysql-bin.000001"),
            query("BEGIN", 1000, 100, 150),
            table_map("db1", "t1", 150, 200),
            rows(StatementKind::Insert, "db1", "t1", 1000, 200, 250, vec![row(1, "a")]),
            table_map("db1", "t1", 250, 300),
            rows(StatementKind::Insert, "db1", "t1", 1000, 300, 350, vec![row(2, "b")]),
            xid(1000, 350, 380),
            query("BEGIN", 1001, 380, 430),
            table_map("db1", "t1", 430, 480),
            rows(StatementKind::Delete, "db1", "t1", 1001, 480, 530, vec![row(1, "a")]),
            xid(1001, 530, 560),
        ]
    }

    #[tokio::test]
    async fn test_forward_sql_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config(dir.path(), WorkType::Forward, 2));
        let summary = engine
            .run(VecSource::new(two_transactions()), t1_catalog(), "mysql-bin.000001")
            .await
            .unwrap();

        assert_eq!(summary.forwarded, 3);
        assert_eq!(summary.last_binlog, "mysql-bin.000001");
        assert_eq!(
            fs::read_to_string(dir.path().join("forward.1.sql")).unwrap(),
            "INSERT INTO db1.t1 (id,name) VALUES (1,'a');\n\
             INSERT INTO db1.t1 (id,name) VALUES (2,'b');\n\
             DELETE FROM db1.t1 WHERE id=1;\n"
        );
        for name in [STATUS_FILE, BIGLONG_TRX_FILE, DDL_FILE] {
            assert!(dir.path().join(name).exists());
        }
    }

    #[tokio::test]
    async fn test_rollback_keeps_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), WorkType::Rollback, 3);
        config.keep_trx = true;
        let summary = Engine::new(config)
            .run(VecSource::new(two_transactions()), t1_catalog(), "mysql-bin.000001")
            .await
            .unwrap();

        assert_eq!(summary.rollback_files, 1);
        assert!(!dir.path().join(".rollback.1.sql").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("rollback.1.sql")).unwrap(),
            "begin;\n\
             INSERT INTO db1.t1 (id,name) VALUES (1,'a');\n\
             commit;\n\
             begin;\n\
             DELETE FROM db1.t1 WHERE id=2;\n\
             DELETE FROM db1.t1 WHERE id=1;\n\
             commit;\n"
        );
    }

    #[tokio::test]
    async fn test_many_workers_keep_event_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut events = vec![rotate("mysql-bin.000001")];
        let mut expected = String::new();
        let mut pos = 100;
        for i in 0..200i64 {
            // 이벤트마다 행 수를 다르게 해서 작업 시간이 고르지 않게 한다
            let images: Vec<_> = (0..(i % 7 + 1)).map(|j| row(i * 10 + j, "x")).collect();
            for image in &images {
                expected.push_str(&format!("INSERT INTO db1.t1 (id,name) VALUES ({},'x');\n", image_id(image)));
            }
            events.push(table_map("db1", "t1", pos, pos + 40));
            events.push(rows(StatementKind::Insert, "db1", "t1", 1000, pos + 40, pos + 100, images));
            pos += 100;
        }

        let screen = Captured::default();
        let summary = Engine::new(config(dir.path(), WorkType::Forward, 8))
            .with_screen(Box::new(screen.clone()))
            .run(VecSource::new(events), t1_catalog(), "mysql-bin.000001")
            .await
            .unwrap();

        assert_eq!(summary.forwarded, 200);
        assert_eq!(screen.text(), expected);
        assert!(!dir.path().join("forward.1.sql").exists());
    }

    fn image_id(image: &[crate::events::Value]) -> i64 {
        match image[0] {
            crate::events::Value::Int(id) => id,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_missing_table_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![
            rotate("mysql-bin.000001"),
            table_map("db1", "gone", 100, 150),
            rows(StatementKind::Insert, "db1", "gone", 1000, 150, 200, vec![row(9, "z")]),
            table_map("db1", "t1", 200, 250),
            rows(StatementKind::Insert, "db1", "t1", 1000, 250, 300, vec![row(1, "a")]),
        ];
        let summary = Engine::new(config(dir.path(), WorkType::Forward, 2))
            .run(VecSource::new(events), t1_catalog(), "mysql-bin.000001")
            .await
            .unwrap();

        assert_eq!(summary.forwarded, 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("forward.1.sql")).unwrap(),
            "INSERT INTO db1.t1 (id,name) VALUES (1,'a');\n"
        );
        // 통계에는 남는다
        let status = fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap();
        assert!(status.contains("gone"));
    }

    #[tokio::test]
    async fn test_schema_drift_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut drifted = rows(
            StatementKind::Insert,
            "db1",
            "t1",
            1000,
            250,
            300,
            vec![vec![
                crate::events::Value::Int(2),
                crate::events::Value::Bytes(b"b".to_vec()),
                crate::events::Value::Int(0),
            ]],
        );
        if let BinlogEventData::Rows(data) = &mut drifted.data {
            data.column_types.push(ColumnType::Long);
        }
        let events = vec![
            rotate("mysql-bin.000001"),
            table_map("db1", "t1", 100, 150),
            rows(StatementKind::Insert, "db1", "t1", 1000, 150, 200, vec![row(1, "a")]),
            table_map("db1", "t1", 200, 250),
            drifted,
        ];

        let err = Engine::new(config(dir.path(), WorkType::Rollback, 4))
            .run(VecSource::new(events), t1_catalog(), "mysql-bin.000001")
            .await
            .unwrap_err();
        assert!(matches!(err, BinlogSqlError::SchemaDrift { .. }));
        assert!(!dir.path().join("rollback.1.sql").exists());
    }

    #[tokio::test]
    async fn test_stats_only_run() {
        let dir = tempfile::tempdir().unwrap();
        let summary = Engine::new(config(dir.path(), WorkType::Stats, 2))
            .run(VecSource::new(two_transactions()), t1_catalog(), "mysql-bin.000001")
            .await
            .unwrap();

        assert_eq!(summary.forwarded, 0);
        assert!(!dir.path().join("forward.1.sql").exists());
        let status = fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap();
        let line: Vec<&str> = status.lines().nth(1).unwrap().split_whitespace().collect();
        assert_eq!(&line[7..], &["2", "0", "1", "db1", "t1"]);
    }

    /// 몇 번 쓴 뒤부터 실패하는 화면 출력
    struct FailingScreen {
        writes: usize,
        fail_from: usize,
    }

    impl Write for FailingScreen {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            std::thread::sleep(std::time::Duration::from_millis(20));
            if self.writes >= self.fail_from {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// 주어진 이벤트를 낸 다음 에러를 돌려주는 소스
    struct BrokenSource {
        events: VecSource,
        remaining: usize,
    }

    impl EventSource for BrokenSource {
        async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
            if self.remaining == 0 {
                return Err(BinlogSqlError::BinlogParseError("truncated event".to_string()));
            }
            self.remaining -= 1;
            self.events.next_event().await
        }
    }

    fn many_inserts(count: u32) -> Vec<BinlogEvent> {
        let mut events = vec![rotate("mysql-bin.000001")];
        for i in 0..count {
            let pos = 100 + i * 100;
            events.push(table_map("db1", "t1", pos, pos + 40));
            events.push(rows(StatementKind::Insert, "db1", "t1", 1000, pos + 40, pos + 100, vec![row(i as i64, "x")]));
        }
        events
    }

    const RUN_LIMIT: std::time::Duration = std::time::Duration::from_secs(10);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_failure_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let screen = FailingScreen { writes: 0, fail_from: 4 };
        let run = Engine::new(config(dir.path(), WorkType::Forward, 2))
            .with_screen(Box::new(screen))
            .run(VecSource::new(many_inserts(200)), t1_catalog(), "mysql-bin.000001");

        let err = tokio::time::timeout(RUN_LIMIT, run).await.unwrap().unwrap_err();
        assert!(matches!(err, BinlogSqlError::IoError(ref m) if m.contains("disk full")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stats_failure_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let run = Engine::new(config(&missing, WorkType::Stats, 2))
            .run(VecSource::new(many_inserts(50)), t1_catalog(), "mysql-bin.000001");

        let err = tokio::time::timeout(RUN_LIMIT, run).await.unwrap().unwrap_err();
        assert!(matches!(err, BinlogSqlError::IoError(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_source_error_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let source = BrokenSource {
            events: VecSource::new(many_inserts(20)),
            remaining: 11,
        };
        let run = Engine::new(config(dir.path(), WorkType::Rollback, 3))
            .run(source, t1_catalog(), "mysql-bin.000001");

        let err = tokio::time::timeout(RUN_LIMIT, run).await.unwrap().unwrap_err();
        assert!(matches!(err, BinlogSqlError::BinlogParseError(_)));
        assert!(!dir.path().join("rollback.1.sql").exists());
    }

    #[test]
    fn test_primary_error_prefers_cause() {
        let errors = vec![
            BinlogSqlError::Aborted,
            BinlogSqlError::ChannelClosed,
            BinlogSqlError::IoError("disk full".to_string()),
        ];
        assert!(matches!(primary_error(errors), Some(BinlogSqlError::IoError(_))));
        assert!(matches!(
            primary_error(vec![BinlogSqlError::Aborted]),
            Some(BinlogSqlError::Aborted)
        ));
        assert!(primary_error(vec![]).is_none());
    }
}
