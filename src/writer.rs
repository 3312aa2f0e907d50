//! SQL 출력 및 파일 라우팅
//!
//! 순서 게이트를 통과한 `StatementBatch`를 받아 binlog 파일(또는 테이블)별 SQL 파일에 쓴다.
//! 롤백 모드에서는 임시 파일에 정방향 순서로 쓰고, 쓸 때마다 바이트 길이와 트랜잭션 번호를
//! 기록해 두었다가 `reverse` 단계에 넘긴다.

use crate::config::{format_timestamp, EngineConfig, DATETIME_FORMAT_NOSPACE};
use crate::error::{BinlogSqlError, Result};
use crate::events::StatementBatch;
use crate::offset::binlog_index;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const FORWARD_PREFIX: &str = "forward";
pub const ROLLBACK_PREFIX: &str = "rollback";

/// 이 바이트 수만큼 진행할 때마다 진행 로그
const PROGRESS_INTERVAL: u64 = 10 * 1024 * 1024;

/// 임시 파일에 한 번 쓴 단위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub len: u64,
    pub trx_id: u64,
}

/// 뒤집기 대기 중인 롤백 임시 파일
#[derive(Debug, Clone)]
pub struct RollbackFile {
    pub temp: PathBuf,
    pub target: PathBuf,
    pub chunks: Vec<ChunkRecord>,
}

/// 출력 파일 이름
///
/// `forward.3.sql`, `db1.t1.rollback.3.sql`, 임시 파일은 앞에 `.`이 붙는다.
pub fn sql_file_name(
    database: &str,
    table: &str,
    file_per_table: bool,
    rollback: bool,
    binlog: &str,
    temp: bool,
) -> Result<String> {
    let index = binlog_index(binlog)?;
    let prefix = if rollback { ROLLBACK_PREFIX } else { FORWARD_PREFIX };
    let name = if file_per_table {
        format!("{}.{}.{}.{}.sql", database, table, prefix, index)
    } else {
        format!("{}.{}.sql", prefix, index)
    };
    Ok(if temp { format!(".{}", name) } else { name })
}

/// 배치 하나를 출력 텍스트로 만든다. 문장마다 `;\n`을 붙인다.
pub fn render(batch: &StatementBatch, extra_info: bool) -> String {
    let mut out = String::new();
    if extra_info {
        let _ = writeln!(
            out,
            "# datetime={} database={} table={} binlog={} startpos={} stoppos={}",
            format_timestamp(batch.timestamp, DATETIME_FORMAT_NOSPACE),
            batch.database,
            batch.table,
            batch.binlog,
            batch.start_pos,
            batch.end_pos
        );
    }
    for statement in &batch.statements {
        out.push_str(statement);
        out.push_str(";\n");
    }
    out
}

fn create_file(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| {
        BinlogSqlError::IoError(format!("파일 {} 열기 실패: {}", path.display(), e))
    })
}

pub struct SqlWriter {
    output_dir: PathBuf,
    file_per_table: bool,
    extra_info: bool,
    rollback: bool,
    /// 설정되어 있으면 파일 대신 여기로 출력
    screen: Option<Box<dyn Write + Send>>,
    streams: HashMap<PathBuf, BufWriter<File>>,
    rollback_files: Vec<RollbackFile>,
    rollback_index: HashMap<PathBuf, usize>,
    last_binlog: String,
    last_logged_pos: u64,
    batches: u64,
}

impl SqlWriter {
    pub fn new(config: &EngineConfig) -> Self {
        let screen: Option<Box<dyn Write + Send>> = if config.output_to_screen {
            Some(Box::new(std::io::stdout()))
        } else {
            None
        };
        SqlWriter {
            output_dir: config.output_dir.clone(),
            file_per_table: config.file_per_table,
            extra_info: config.print_extra_info,
            rollback: config.gen.rollback,
            screen,
            streams: HashMap::new(),
            rollback_files: Vec::new(),
            rollback_index: HashMap::new(),
            last_binlog: String::new(),
            last_logged_pos: 0,
            batches: 0,
        }
    }

    /// 파일 대신 주어진 출력으로 쓴다
    pub fn with_screen(mut self, out: Box<dyn Write + Send>) -> Self {
        self.screen = Some(out);
        self
    }

    pub fn write_batch(&mut self, batch: &StatementBatch) -> Result<()> {
        if batch.statements.is_empty() {
            return Ok(());
        }
        let text = render(batch, self.extra_info);

        if let Some(out) = self.screen.as_mut() {
            out.write_all(text.as_bytes())?;
        } else {
            self.write_file(batch, &text)?;
        }
        self.batches += 1;
        self.log_progress(batch);
        Ok(())
    }

    fn write_file(&mut self, batch: &StatementBatch, text: &str) -> Result<()> {
        let name = sql_file_name(
            &batch.database,
            &batch.table,
            self.file_per_table,
            self.rollback,
            &batch.binlog,
            self.rollback,
        )?;
        let path = self.output_dir.join(&name);

        if !self.streams.contains_key(&path) {
            let file = create_file(&path)?;
            debug!("Opened sql file {}", path.display());
            if self.rollback {
                let target = sql_file_name(
                    &batch.database,
                    &batch.table,
                    self.file_per_table,
                    true,
                    &batch.binlog,
                    false,
                )?;
                self.rollback_index.insert(path.clone(), self.rollback_files.len());
                self.rollback_files.push(RollbackFile {
                    temp: path.clone(),
                    target: self.output_dir.join(target),
                    chunks: Vec::new(),
                });
            }
            self.streams.insert(path.clone(), BufWriter::new(file));
        }

        if let Some(stream) = self.streams.get_mut(&path) {
            stream.write_all(text.as_bytes()).map_err(|e| {
                BinlogSqlError::IoError(format!("파일 {} 쓰기 실패: {}", path.display(), e))
            })?;
        }

        if let Some(&i) = self.rollback_index.get(&path) {
            self.rollback_files[i].chunks.push(ChunkRecord {
                len: text.len() as u64,
                trx_id: batch.trx_id,
            });
        }
        Ok(())
    }

    fn log_progress(&mut self, batch: &StatementBatch) {
        if self.last_binlog.is_empty() {
            self.last_binlog = batch.binlog.clone();
        }
        if batch.binlog != self.last_binlog {
            self.last_binlog = batch.binlog.clone();
            self.last_logged_pos = 0;
            info!("finish processing {} {}", batch.binlog, batch.end_pos);
        } else if batch.end_pos.saturating_sub(self.last_logged_pos) >= PROGRESS_INTERVAL {
            self.last_logged_pos = batch.end_pos;
            info!("finish processing {} {}", batch.binlog, batch.end_pos);
        }
    }

    /// 모든 파일을 비우고 닫는다. 롤백 모드면 뒤집을 임시 파일 목록을 돌려준다.
    pub fn finish(mut self) -> Result<Vec<RollbackFile>> {
        for (path, mut stream) in self.streams.drain() {
            stream.flush().map_err(|e| {
                BinlogSqlError::IoError(format!("파일 {} flush 실패: {}", path.display(), e))
            })?;
        }
        if let Some(out) = self.screen.as_mut() {
            out.flush()?;
        }
        info!("Wrote {} sql batches", self.batches);
        Ok(self.rollback_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkType;
    use crate::events::TrxStatus;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn batch(binlog: &str, table: &str, trx_id: u64, statements: &[&str]) -> StatementBatch {
        StatementBatch {
            seq: 1,
            statements: statements.iter().map(|s| s.to_string()).collect(),
            database: "db1".to_string(),
            table: table.to_string(),
            binlog: binlog.to_string(),
            start_pos: 120,
            end_pos: 380,
            timestamp: 1_700_000_000,
            trx_id,
            trx_status: TrxStatus::InProgress,
        }
    }

    fn config(dir: &Path, work_type: WorkType) -> EngineConfig {
        let mut config = EngineConfig {
            work_type,
            output_dir: dir.to_path_buf(),
            ..Default::default()
        };
        config.validate().unwrap();
        config
    }

    /// 테스트에서 화면 출력을 잡아 두는 버퍼
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

    #[test]
    fn test_file_names() {
        assert_eq!(
            sql_file_name("db1", "t1", false, false, "mysql-bin.000012", false).unwrap(),
            "forward.12.sql"
        );
        assert_eq!(
            sql_file_name("db1", "t1", true, true, "mysql-bin.000012", true).unwrap(),
            ".db1.t1.rollback.12.sql"
        );
        assert!(sql_file_name("db1", "t1", false, false, "no-index", false).is_err());
    }

    #[test]
    fn test_render_with_extra_info() {
        let b = batch("mysql-bin.000001", "t1", 1, &["DELETE FROM db1.t1 WHERE id=1", "DELETE FROM db1.t1 WHERE id=2"]);
        assert_eq!(
            render(&b, false),
            "DELETE FROM db1.t1 WHERE id=1;\nDELETE FROM db1.t1 WHERE id=2;\n"
        );

        let with_info = render(&b, true);
        let first = with_info.lines().next().unwrap();
        assert!(first.starts_with("# datetime="));
        assert!(first.ends_with("database=db1 table=t1 binlog=mysql-bin.000001 startpos=120 stoppos=380"));
        assert_eq!(with_info.lines().count(), 3);
    }

    #[test]
    fn test_forward_files_per_binlog() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SqlWriter::new(&config(dir.path(), WorkType::Forward));

        writer.write_batch(&batch("mysql-bin.000001", "t1", 1, &["INSERT INTO db1.t1 (id) VALUES (1)"])).unwrap();
        writer.write_batch(&batch("mysql-bin.000001", "t2", 1, &["INSERT INTO db1.t2 (id) VALUES (2)"])).unwrap();
        writer.write_batch(&batch("mysql-bin.000002", "t1", 2, &["INSERT INTO db1.t1 (id) VALUES (3)"])).unwrap();
        writer.write_batch(&batch("mysql-bin.000002", "t1", 2, &[])).unwrap();
        assert!(writer.finish().unwrap().is_empty());

        let first = std::fs::read_to_string(dir.path().join("forward.1.sql")).unwrap();
        assert_eq!(
            first,
            "INSERT INTO db1.t1 (id) VALUES (1);\nINSERT INTO db1.t2 (id) VALUES (2);\n"
        );
        let second = std::fs::read_to_string(dir.path().join("forward.2.sql")).unwrap();
        assert_eq!(second, "INSERT INTO db1.t1 (id) VALUES (3);\n");
    }

    #[test]
    fn test_rollback_records_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), WorkType::Rollback);
        config.file_per_table = true;
        let mut writer = SqlWriter::new(&config);

        writer.write_batch(&batch("mysql-bin.000007", "t1", 1, &["DELETE FROM db1.t1 WHERE id=1"])).unwrap();
        writer
            .write_batch(&batch("mysql-bin.000007", "t1", 2, &["DELETE FROM db1.t1 WHERE id=2", "DELETE FROM db1.t1 WHERE id=3"]))
            .unwrap();
        let files = writer.finish().unwrap();

        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.temp, dir.path().join(".db1.t1.rollback.7.sql"));
        assert_eq!(file.target, dir.path().join("db1.t1.rollback.7.sql"));
        assert_eq!(
            file.chunks,
            vec![ChunkRecord { len: 31, trx_id: 1 }, ChunkRecord { len: 62, trx_id: 2 }]
        );
        assert_eq!(std::fs::metadata(&file.temp).unwrap().len(), 93);
    }

    #[test]
    fn test_screen_output() {
        let dir = tempfile::tempdir().unwrap();
        let captured = Captured::default();
        let mut writer =
            SqlWriter::new(&config(dir.path(), WorkType::Forward)).with_screen(Box::new(captured.clone()));

        writer.write_batch(&batch("mysql-bin.000001", "t1", 1, &["INSERT INTO db1.t1 (id) VALUES (1)"])).unwrap();
        writer.finish().unwrap();

        assert_eq!(
            String::from_utf8(captured.0.lock().clone()).unwrap(),
            "INSERT INTO db1.t1 (id) VALUES (1);\n"
        );
        assert!(!dir.path().join("forward.1.sql").exists());
    }
}
