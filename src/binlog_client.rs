//! MySQL 복제 프로토콜로 binlog를 받아 오는 이벤트 소스

use crate::auth;
use crate::binlog::BinlogParser;
use crate::connection::ConnectionConfig;
use crate::error::{BinlogSqlError, Result};
use crate::events::{BinlogEvent, BinlogEventData};
use crate::protocol::{self, ErrorPacket, GreetingPacket, PacketChannel};
use crate::source::EventSource;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// 파일로 출력할 때 이 시간 동안 이벤트가 없으면 스트림을 끝낸다
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const UTF8_GENERAL_CI: u8 = 33;
const AUTH_SWITCH: u8 = 0xfe;
const AUTH_MORE_DATA: u8 = 0x01;
const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;

/// 복제 연결 이벤트 소스
pub struct ReplicationSource {
    config: ConnectionConfig,
    binlog_filename: String,
    binlog_position: u64,
    idle_timeout: Option<Duration>,
    channel: Option<PacketChannel>,
    parser: BinlogParser,
    finished: bool,
    event_count: u64,
}

impl ReplicationSource {
    pub fn new(config: ConnectionConfig, binlog_filename: impl Into<String>, binlog_position: u64) -> Self {
        ReplicationSource {
            config,
            binlog_filename: binlog_filename.into(),
            binlog_position,
            idle_timeout: None,
            channel: None,
            parser: BinlogParser::new(),
            finished: false,
            event_count: 0,
        }
    }

    /// None이면 새 이벤트를 무기한 기다린다
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// 핸드셰이크, 인증, 체크섬 설정 후 COM_BINLOG_DUMP 전송
    async fn start(&mut self) -> Result<PacketChannel> {
        info!(
            "Connecting to {}:{} as replica (server id {})",
            self.config.hostname, self.config.port, self.config.server_id
        );

        let mut channel =
            PacketChannel::connect(&self.config.hostname, self.config.port, self.config.timeout).await?;

        let greeting_packet = channel.read_packet().await?;
        if protocol::is_error_packet(&greeting_packet) {
            return Err(BinlogSqlError::ConnectionError(format!(
                "Server refused connection: {}",
                ErrorPacket::parse(&greeting_packet)
            )));
        }
        let greeting = GreetingPacket::parse(&greeting_packet)?;

        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        self.authenticate(&mut channel, &greeting).await?;
        info!("Authentication successful");

        match channel.execute("SET @master_binlog_checksum='NONE'").await {
            Ok(()) => {
                self.parser.set_checksum(false);
                info!("Binlog checksum set to NONE");
            }
            Err(e) => warn!("Failed to set binlog checksum to NONE ({}), detecting from stream", e),
        }

        let dump_command = create_binlog_dump_command(
            self.config.server_id,
            &self.binlog_filename,
            self.binlog_position,
        )?;
        channel.write_command(&dump_command).await?;

        info!(
            "Sent COM_BINLOG_DUMP: file={}, position={}",
            self.binlog_filename, self.binlog_position
        );
        Ok(channel)
    }

    async fn authenticate(&self, channel: &mut PacketChannel, greeting: &GreetingPacket) -> Result<()> {
        let response = auth::create_handshake_response(
            &self.config.username,
            &self.config.password,
            &greeting.scramble,
            UTF8_GENERAL_CI,
            &greeting.auth_plugin,
        )?;
        channel.write_packet(&response).await?;

        let mut plugin = greeting.auth_plugin.clone();
        loop {
            let packet = channel.read_packet().await?;
            match packet.first().copied() {
                Some(protocol::OK_HEADER) => return Ok(()),
                Some(protocol::ERR_HEADER) => {
                    return Err(BinlogSqlError::ConnectionError(format!(
                        "Authentication failed: {}",
                        ErrorPacket::parse(&packet)
                    )))
                }
                Some(AUTH_SWITCH) => {
                    let mut cursor = std::io::Cursor::new(&packet[1..]);
                    plugin = protocol::read_null_terminated_string(&mut cursor)?;
                    let mut scramble = packet[1 + cursor.position() as usize..].to_vec();
                    if scramble.last() == Some(&0) {
                        scramble.pop();
                    }
                    debug!("Auth switch to {}", plugin);

                    let reply = auth::scramble_for(&plugin, &self.config.password, &scramble)
                        .ok_or_else(|| {
                            BinlogSqlError::ConnectionError(format!(
                                "Unsupported auth plugin: {}",
                                plugin
                            ))
                        })?;
                    channel.write_packet(&reply).await?;
                }
                Some(AUTH_MORE_DATA) if plugin == auth::CACHING_SHA2_PASSWORD => {
                    match packet.get(1).copied() {
                        Some(FAST_AUTH_SUCCESS) => continue,
                        Some(PERFORM_FULL_AUTH) => {
                            return Err(BinlogSqlError::ConnectionError(
                                "caching_sha2_password full authentication needs TLS or RSA; \
                                 log in once with a regular client to warm the cache or use mysql_native_password"
                                    .to_string(),
                            ))
                        }
                        other => {
                            return Err(BinlogSqlError::ProtocolError(format!(
                                "Unexpected caching_sha2_password state: {:?}",
                                other
                            )))
                        }
                    }
                }
                other => {
                    return Err(BinlogSqlError::ProtocolError(format!(
                        "Unexpected authentication packet header: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(None);
        };

        match self.idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, channel.read_packet()).await {
                Ok(packet) => packet.map(Some),
                Err(_) => {
                    info!(
                        "No binlog event for {:?}, treat as end of stream",
                        timeout
                    );
                    Ok(None)
                }
            },
            None => channel.read_packet().await.map(Some),
        }
    }
}

impl EventSource for ReplicationSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        if self.finished {
            return Ok(None);
        }
        if self.channel.is_none() {
            let channel = self.start().await?;
            self.channel = Some(channel);
        }

        loop {
            let Some(packet) = self.read_packet().await? else {
                self.finished = true;
                self.channel = None;
                return Ok(None);
            };

            if protocol::is_error_packet(&packet) {
                return Err(BinlogSqlError::ConnectionError(format!(
                    "Replication stream error: {}",
                    ErrorPacket::parse(&packet)
                )));
            }

            if protocol::is_eof_packet(&packet) {
                info!(
                    "Received EOF packet - stream ended after {} events",
                    self.event_count
                );
                self.finished = true;
                self.channel = None;
                return Ok(None);
            }

            // 첫 바이트 0x00은 OK 표시, 실제 이벤트 데이터는 그 다음부터
            let event_data = match packet.split_first() {
                Some((&protocol::OK_HEADER, rest)) => rest,
                _ => {
                    return Err(BinlogSqlError::ProtocolError(format!(
                        "Unexpected replication packet header: {:?}",
                        packet.first()
                    )))
                }
            };

            let event = self.parser.decode(event_data)?;
            if matches!(event.data, BinlogEventData::Heartbeat) {
                continue;
            }
            self.event_count += 1;
            return Ok(Some(event));
        }
    }
}

/// COM_BINLOG_DUMP 명령어 생성
fn create_binlog_dump_command(server_id: u32, binlog_filename: &str, binlog_position: u64) -> Result<Vec<u8>> {
    let position = u32::try_from(binlog_position).map_err(|_| {
        BinlogSqlError::InvalidConfig(format!("binlog 위치가 너무 큼: {}", binlog_position))
    })?;

    let mut buffer = Vec::with_capacity(11 + binlog_filename.len());
    buffer.write_u8(COM_BINLOG_DUMP)?;
    buffer.write_u32::<LittleEndian>(position)?;
    // Flags - 0: 새 이벤트가 올 때까지 대기
    buffer.write_u16::<LittleEndian>(0)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(binlog_filename.as_bytes())?;

    debug!(
        "Created COM_BINLOG_DUMP command: server_id={}, file={}, position={}",
        server_id, binlog_filename, binlog_position
    );

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_binlog_dump_command() {
        let cmd = create_binlog_dump_command(3320, "mysql-bin.000001", 4).unwrap();

        // COM_BINLOG_DUMP (1) + position (4) + flags (2) + server_id (4) + filename
        assert_eq!(cmd.len(), 11 + "mysql-bin.000001".len());
        assert_eq!(cmd[0], COM_BINLOG_DUMP);
        assert_eq!(u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]), 4);
        assert_eq!(u32::from_le_bytes([cmd[7], cmd[8], cmd[9], cmd[10]]), 3320);
        assert!(cmd.ends_with(b"mysql-bin.000001"));
    }

    #[test]
    fn test_dump_position_must_fit_u32() {
        assert!(create_binlog_dump_command(1, "mysql-bin.000001", u64::MAX).is_err());
    }

    #[test]
    fn test_source_starts_unconnected() {
        let source = ReplicationSource::new(ConnectionConfig::default(), "mysql-bin.000007", 120)
            .with_idle_timeout(Some(DEFAULT_IDLE_TIMEOUT));
        assert!(source.channel.is_none());
        assert_eq!(source.idle_timeout, Some(Duration::from_secs(5)));
    }
}
