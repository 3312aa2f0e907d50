//! 원본 이벤트 소스
//!
//! 파이프라인은 이벤트를 하나씩 당겨 오는 인터페이스만 필요로 한다.
//! `Ok(None)`은 스트림 끝, `Err`는 소스 에러(치명적)이다.

use crate::binlog::{BinlogParser, EVENT_HEADER_SIZE};
use crate::error::{BinlogSqlError, Result};
use crate::events::{BinlogEvent, BinlogEventData, EventHeader, EventType, RotateEventData};
use crate::offset::{next_binlog_name, BINLOG_FIRST_EVENT_POS};
use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info};

/// 순차적으로 이벤트를 꺼내는 소스
pub trait EventSource: Send {
    fn next_event(&mut self) -> impl Future<Output = Result<Option<BinlogEvent>>> + Send;
}

/// 파일 이름을 알려 주는 가상 ROTATE 이벤트
pub fn rotate_event(binlog: &str, position: u64) -> BinlogEvent {
    BinlogEvent {
        header: EventHeader {
            timestamp: 0,
            event_type: EventType::RotateEvent,
            server_id: 0,
            event_length: 0,
            next_pos: 0,
            flags: 0,
        },
        data: BinlogEventData::Rotate(RotateEventData {
            next_binlog_name: binlog.to_string(),
            position,
        }),
    }
}

/// 디렉터리의 binlog 파일을 읽는 소스
pub struct BinlogFileSource {
    dir: PathBuf,
    current: String,
    follow: bool,
    reader: Option<BufReader<File>>,
    parser: BinlogParser,
    /// 첫 파일에서 FDE를 읽은 뒤 이동할 위치
    seek_to: Option<u64>,
    offset: u64,
}

impl BinlogFileSource {
    /// `start_file`부터 읽는다. `follow`가 켜져 있으면 다음 번호 파일로 계속 진행한다.
    pub fn new(dir: impl AsRef<Path>, start_file: &str, start_pos: u64, follow: bool) -> Self {
        BinlogFileSource {
            dir: dir.as_ref().to_path_buf(),
            current: start_file.to_string(),
            follow,
            reader: None,
            parser: BinlogParser::new(),
            seek_to: (start_pos > BINLOG_FIRST_EVENT_POS).then_some(start_pos),
            offset: 0,
        }
    }

    pub fn current_file(&self) -> &str {
        &self.current
    }

    async fn open_current(&mut self) -> Result<()> {
        let path = self.dir.join(&self.current);
        let file = File::open(&path).await.map_err(|e| {
            BinlogSqlError::IoError(format!("binlog 파일 {} 열기 실패: {}", path.display(), e))
        })?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;
        BinlogParser::verify_magic(&magic)?;

        info!("Start to parse binlog file {}", path.display());
        self.reader = Some(reader);
        self.offset = BINLOG_FIRST_EVENT_POS;
        Ok(())
    }

    /// 이벤트 하나를 통째로 읽는다. 파일 끝이면 None
    async fn read_raw_event(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let mut header = [0u8; EVENT_HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let parsed = BinlogParser::parse_header(&header)?;
        let length = parsed.event_length as usize;
        if length < EVENT_HEADER_SIZE {
            return Err(BinlogSqlError::BinlogParseError(format!(
                "{} {}: 잘못된 이벤트 길이 {}",
                self.current, self.offset, length
            )));
        }

        let mut data = Vec::with_capacity(length);
        data.extend_from_slice(&header);
        data.resize(length, 0);
        reader.read_exact(&mut data[EVENT_HEADER_SIZE..]).await.map_err(|e| {
            BinlogSqlError::BinlogParseError(format!(
                "{} {}: 이벤트 본문을 읽을 수 없음 ({})",
                self.current, self.offset, e
            ))
        })?;
        self.offset += length as u64;
        Ok(Some(data))
    }

    async fn next_file(&mut self) -> Result<bool> {
        if !self.follow {
            return Ok(false);
        }
        let next = next_binlog_name(&self.current)?;
        if !tokio::fs::try_exists(self.dir.join(&next)).await.unwrap_or(false) {
            info!("{} does not exist, finish reading binlog files", next);
            return Ok(false);
        }
        self.current = next;
        Ok(true)
    }
}

impl EventSource for BinlogFileSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        loop {
            if self.reader.is_none() {
                self.open_current().await?;
                return Ok(Some(rotate_event(&self.current, BINLOG_FIRST_EVENT_POS)));
            }

            match self.read_raw_event().await? {
                Some(raw) => {
                    let event = self.parser.decode(&raw)?;

                    if event.header.event_type == EventType::FormatDescriptionEvent {
                        if let (Some(pos), Some(reader)) = (self.seek_to.take(), self.reader.as_mut()) {
                            debug!("Seek {} to {}", self.current, pos);
                            reader.seek(SeekFrom::Start(pos)).await?;
                            self.offset = pos;
                        }
                    }

                    return Ok(Some(event));
                }
                None => {
                    self.reader = None;
                    if !self.next_file().await? {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// 메모리에 올린 이벤트 목록을 내보내는 소스
#[derive(Debug, Default)]
pub struct VecSource {
    events: VecDeque<BinlogEvent>,
}

impl VecSource {
    pub fn new(events: Vec<BinlogEvent>) -> Self {
        VecSource {
            events: events.into(),
        }
    }
}

impl EventSource for VecSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        Ok(self.events.pop_front())
    }
}
