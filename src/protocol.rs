//! MySQL 클라이언트/서버 프로토콜 패킷 처리
//!
//! 패킷 = 3바이트 길이 + 1바이트 시퀀스 + 본문.
//! 본문이 0xFFFFFF 바이트면 다음 패킷에 이어진다.

use crate::error::{BinlogSqlError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

pub const MAX_PACKET_SIZE: usize = 0xff_ffff;

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xfe;
pub const ERR_HEADER: u8 = 0xff;

pub const COM_QUERY: u8 = 0x03;

/// MySQL 패킷 채널
pub struct PacketChannel {
    stream: BufReader<TcpStream>,
    sequence: u8,
}

impl PacketChannel {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BinlogSqlError::ConnectionError(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| BinlogSqlError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel {
            stream: BufReader::new(stream),
            sequence: 0,
        })
    }

    async fn read_one(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.map_err(|e| {
            BinlogSqlError::IoError(format!("Failed to read packet header: {}", e))
        })?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.sequence = header[3].wrapping_add(1);

        let mut buffer = vec![0u8; length];
        self.stream.read_exact(&mut buffer).await.map_err(|e| {
            BinlogSqlError::IoError(format!("Failed to read packet body: {}", e))
        })?;
        Ok(buffer)
    }

    /// 패킷 읽기. 16MB 단위로 나뉜 패킷은 이어 붙인다.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = self.read_one().await?;
        let mut last = payload.len();
        while last == MAX_PACKET_SIZE {
            let next = self.read_one().await?;
            last = next.len();
            payload.extend_from_slice(&next);
        }
        Ok(payload)
    }

    /// 패킷 쓰기 (현재 시퀀스 번호 사용)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_SIZE).peekable();
        let mut wrote_any = false;

        while let Some(chunk) = chunks.next() {
            self.write_chunk(chunk).await?;
            wrote_any = true;
            if chunks.peek().is_none() && chunk.len() == MAX_PACKET_SIZE {
                self.write_chunk(&[]).await?;
            }
        }
        if !wrote_any {
            self.write_chunk(&[]).await?;
        }

        self.stream.get_mut().flush().await.map_err(|e| {
            BinlogSqlError::IoError(format!("Failed to flush: {}", e))
        })?;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let length = (chunk.len() as u32).to_le_bytes();
        let header = [length[0], length[1], length[2], self.sequence];
        self.sequence = self.sequence.wrapping_add(1);

        let stream = self.stream.get_mut();
        stream.write_all(&header).await.map_err(|e| {
            BinlogSqlError::IoError(format!("Failed to write header: {}", e))
        })?;
        stream.write_all(chunk).await.map_err(|e| {
            BinlogSqlError::IoError(format!("Failed to write data: {}", e))
        })?;
        Ok(())
    }

    /// 새 명령 전송 (시퀀스 0부터)
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.sequence = 0;
        self.write_packet(data).await
    }

    /// 결과셋이 없는 쿼리 실행
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut packet = Vec::with_capacity(sql.len() + 1);
        packet.push(COM_QUERY);
        packet.extend_from_slice(sql.as_bytes());
        self.write_command(&packet).await?;

        let response = self.read_packet().await?;
        if is_error_packet(&response) {
            return Err(BinlogSqlError::QueryError(format!(
                "{}: {}",
                sql,
                ErrorPacket::parse(&response)
            )));
        }
        Ok(())
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let protocol_version = ReadBytesExt::read_u8(&mut cursor)?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;

        // Auth plugin data part 1 (8 bytes) + filler
        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble)?;
        ReadBytesExt::read_u8(&mut cursor)?;

        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let server_collation = ReadBytesExt::read_u8(&mut cursor)?;
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = ReadBytesExt::read_u8(&mut cursor)?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)?;

        // Auth plugin data part 2 (최소 13 바이트, 마지막 NUL 제외)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        Read::read_exact(&mut cursor, &mut part2)?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin = read_null_terminated_string(&mut cursor).unwrap_or_default();

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

/// Error 패킷 (0xFF)
#[derive(Debug, Clone)]
pub struct ErrorPacket {
    pub code: u16,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Self {
        let code = data
            .get(1..3)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .unwrap_or(0);
        // '#' + 5바이트 SQL state가 있으면 건너뛴다
        let message_start = if data.get(3) == Some(&b'#') { 9 } else { 3 };
        let message = data
            .get(message_start..)
            .map(|m| String::from_utf8_lossy(m).to_string())
            .unwrap_or_default();
        ErrorPacket { code, message }
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

/// null로 끝나는 문자열 읽기
pub(crate) fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| BinlogSqlError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&ERR_HEADER)
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&OK_HEADER)
}

/// EOF 패킷 확인 (0xFE, 9바이트 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&EOF_HEADER) && data.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kinds() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(is_eof_packet(&[0xFE, 0x00, 0x00, 0x02, 0x00]));
        assert!(!is_eof_packet(&[0xFE; 20]));
        assert!(!is_ok_packet(&[]));
    }

    #[test]
    fn test_error_packet_parse() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1236u16.to_le_bytes());
        data.extend_from_slice(b"#HY000");
        data.extend_from_slice(b"Could not find first log file name");
        let err = ErrorPacket::parse(&data);
        assert_eq!(err.code, 1236);
        assert_eq!(err.message, "Could not find first log file name");
    }

    #[test]
    fn test_greeting_parse() {
        let mut data = vec![10];
        data.extend_from_slice(b"8.0.36\0");
        data.extend_from_slice(&42u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data.push(0);
        data.extend_from_slice(&0xffffu16.to_le_bytes());
        data.push(255);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&0x000fu16.to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        data.extend_from_slice(b"caching_sha2_password\0");

        let greeting = GreetingPacket::parse(&data).unwrap();
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.scramble, (1..=20).collect::<Vec<u8>>());
        assert_eq!(greeting.auth_plugin, "caching_sha2_password");
    }
}
