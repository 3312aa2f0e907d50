//! 롤백 임시 파일 뒤집기
//!
//! 쓰기 단계가 남긴 (바이트 길이, 트랜잭션 번호) 기록을 뒤에서부터 따라가며
//! 한 덩어리씩 읽어 줄 순서를 뒤집어 최종 파일에 쓴다.
//! 파일 전체를 메모리에 올리지 않으며 가장 큰 덩어리 하나만큼만 읽는다.

use crate::error::{BinlogSqlError, Result};
use crate::writer::{ChunkRecord, RollbackFile};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{error, info};

const BEGIN: &[u8] = b"begin;\n";
const COMMIT: &[u8] = b"commit;\n";
const COMMIT_BEGIN: &[u8] = b"commit;\nbegin;\n";

fn io_error(action: &str, path: &Path, e: std::io::Error) -> BinlogSqlError {
    BinlogSqlError::IoError(format!("{} {} 실패: {}", path.display(), action, e))
}

/// `source`를 기록 역순으로 읽어 `target`에 쓴다. `source`는 지우지 않는다.
///
/// `keep_trx`면 첫 덩어리 앞에 `begin;`, 트랜잭션 번호가 바뀔 때마다 `commit;` `begin;`,
/// 맨 끝에 `commit;`을 넣는다.
pub fn reverse_file(source: &Path, target: &Path, chunks: &[ChunkRecord], keep_trx: bool) -> Result<()> {
    let mut input = File::open(source).map_err(|e| io_error("열기", source, e))?;
    let size = input
        .metadata()
        .map_err(|e| io_error("stat", source, e))?
        .len();
    let mut output = BufWriter::new(File::create(target).map_err(|e| io_error("열기", target, e))?);

    let mut cursor = size;
    let mut consumed = 0u64;
    let mut last_trx: Option<u64> = None;
    let mut buf = Vec::new();

    for chunk in chunks.iter().rev() {
        if chunk.len > cursor {
            return Err(BinlogSqlError::Other(format!(
                "{}: 기록된 길이 {}가 남은 크기 {}보다 큼",
                source.display(),
                chunk.len,
                cursor
            )));
        }
        cursor -= chunk.len;
        input
            .seek(SeekFrom::Start(cursor))
            .map_err(|e| io_error("seek", source, e))?;
        buf.resize(chunk.len as usize, 0);
        input
            .read_exact(&mut buf)
            .map_err(|e| io_error("읽기", source, e))?;
        consumed += chunk.len;

        if keep_trx {
            match last_trx {
                None => output.write_all(BEGIN),
                Some(id) if id != chunk.trx_id => output.write_all(COMMIT_BEGIN),
                Some(_) => Ok(()),
            }
            .map_err(|e| io_error("쓰기", target, e))?;
        }
        last_trx = Some(chunk.trx_id);

        for line in buf.split(|&b| b == b'\n').filter(|l| !l.is_empty()).rev() {
            output
                .write_all(line)
                .and_then(|_| output.write_all(b"\n"))
                .map_err(|e| io_error("쓰기", target, e))?;
        }

        if consumed == size || cursor == 0 {
            break;
        }
    }

    if keep_trx && last_trx.is_some() {
        output.write_all(COMMIT).map_err(|e| io_error("쓰기", target, e))?;
    }
    output.flush().map_err(|e| io_error("flush", target, e))?;
    Ok(())
}

/// 임시 파일 하나를 뒤집고 지운다
pub fn reverse_rollback_file(file: &RollbackFile, keep_trx: bool) -> Result<()> {
    info!(
        "start to revert tmp file {} into {}",
        file.temp.display(),
        file.target.display()
    );
    reverse_file(&file.temp, &file.target, &file.chunks, keep_trx)?;
    fs::remove_file(&file.temp).map_err(|e| io_error("삭제", &file.temp, e))?;
    info!(
        "finish reverting tmp file {} into {}",
        file.temp.display(),
        file.target.display()
    );
    Ok(())
}

/// min(threads, 파일 수)개의 스레드로 모든 임시 파일을 뒤집는다.
/// 하나라도 실패하면 남은 파일은 건너뛰고 첫 에러를 돌려준다.
pub fn reverse_all(files: Vec<RollbackFile>, threads: usize, keep_trx: bool) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    let workers = threads.max(1).min(files.len());
    let queue = Mutex::new(files.into_iter());
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<BinlogSqlError>> = Mutex::new(None);

    thread::scope(|scope| {
        for worker in 1..=workers {
            let queue = &queue;
            let failed = &failed;
            let first_error = &first_error;
            scope.spawn(move || {
                info!("start thread {} to revert rollback sql files", worker);
                while !failed.load(Ordering::Acquire) {
                    let Some(file) = queue.lock().next() else {
                        break;
                    };
                    if let Err(e) = reverse_rollback_file(&file, keep_trx) {
                        error!("fail to revert {}: {}", file.temp.display(), e);
                        failed.store(true, Ordering::Release);
                        first_error.lock().get_or_insert(e);
                    }
                }
                info!("exit thread {} to revert rollback sql files", worker);
            });
        }
    });

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 줄 묶음들을 임시 파일에 쓰고 기록을 돌려준다
    fn write_chunks(path: &Path, chunks: &[(u64, &[&str])]) -> Vec<ChunkRecord> {
        let mut content = String::new();
        let mut records = Vec::new();
        for (trx_id, lines) in chunks {
            let text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
            records.push(ChunkRecord {
                len: text.len() as u64,
                trx_id: *trx_id,
            });
            content.push_str(&text);
        }
        fs::write(path, content).unwrap();
        records
    }

    #[test]
    fn test_reverse_keeps_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(".rollback.1.sql");
        let target = dir.path().join("rollback.1.sql");
        let records = write_chunks(
            &temp,
            &[
                (1, &["a1;", "a2;", "a3;", "a4;", "a5;"][..]),
                (2, &["b1;", "b2;", "b3;"][..]),
            ],
        );

        reverse_file(&temp, &target, &records, true).unwrap();
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "begin;\nb3;\nb2;\nb1;\ncommit;\nbegin;\na5;\na4;\na3;\na2;\na1;\ncommit;\n"
        );
    }

    #[test]
    fn test_same_transaction_chunks_share_markers() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("in.sql");
        let target = dir.path().join("out.sql");
        let records = write_chunks(&temp, &[(3, &["x1;"][..]), (3, &["x2;", "x3;"][..]), (4, &["y1;"][..])]);

        reverse_file(&temp, &target, &records, true).unwrap();
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "begin;\ny1;\ncommit;\nbegin;\nx3;\nx2;\nx1;\ncommit;\n"
        );
    }

    #[test]
    fn test_reversing_twice_restores_order() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("in.sql");
        let once = dir.path().join("once.sql");
        let twice = dir.path().join("twice.sql");
        let written = [(1u64, &["a;", "b;"][..]), (2, &["c;"][..]), (3, &["d;", "e;", "f;"][..])];
        let records = write_chunks(&temp, &written);

        reverse_file(&temp, &once, &records, false).unwrap();
        assert_eq!(fs::read_to_string(&once).unwrap(), "f;\ne;\nd;\nc;\nb;\na;\n");

        let reversed: Vec<ChunkRecord> = records.iter().rev().copied().collect();
        reverse_file(&once, &twice, &reversed, false).unwrap();
        assert_eq!(fs::read(&twice).unwrap(), fs::read(&temp).unwrap());
    }

    #[test]
    fn test_reverse_all_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 1..=3 {
            let temp = dir.path().join(format!(".rollback.{}.sql", i));
            let chunks = write_chunks(&temp, &[(1, &["l1;", "l2;"][..])]);
            files.push(RollbackFile {
                temp,
                target: dir.path().join(format!("rollback.{}.sql", i)),
                chunks,
            });
        }

        reverse_all(files, 2, false).unwrap();
        for i in 1..=3 {
            assert!(!dir.path().join(format!(".rollback.{}.sql", i)).exists());
            assert_eq!(
                fs::read_to_string(dir.path().join(format!("rollback.{}.sql", i))).unwrap(),
                "l2;\nl1;\n"
            );
        }
    }

    #[test]
    fn test_bad_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("in.sql");
        fs::write(&temp, "a;\n").unwrap();
        let records = [ChunkRecord { len: 100, trx_id: 1 }];
        assert!(reverse_file(&temp, &dir.path().join("out.sql"), &records, false).is_err());
        assert!(reverse_all(
            vec![RollbackFile {
                temp: dir.path().join("missing.sql"),
                target: dir.path().join("out2.sql"),
                chunks: vec![],
            }],
            4,
            false
        )
        .is_err());
    }
}
