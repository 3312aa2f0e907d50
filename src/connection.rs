//! MySQL 데이터베이스 연결 관리 및 카탈로그 조회

use crate::error::{BinlogSqlError, Result};
use crate::schema::{Catalog, ColumnDef, KeyDef};
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool};
use std::time::Duration;
use tracing::{info, warn};

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 복제 클라이언트로 접속할 때 쓰는 server id
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            server_id: 3320,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some("information_schema"))
            .into()
    }
}

const COLUMNS_SQL: &str = "SELECT COLUMN_NAME, COLUMN_TYPE \
     FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

const KEYS_SQL: &str = "SELECT tc.CONSTRAINT_NAME, tc.CONSTRAINT_TYPE, kcu.COLUMN_NAME \
     FROM information_schema.TABLE_CONSTRAINTS tc \
     JOIN information_schema.KEY_COLUMN_USAGE kcu \
       ON tc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA \
      AND tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
      AND tc.TABLE_NAME = kcu.TABLE_NAME \
     WHERE tc.TABLE_SCHEMA = ? AND tc.TABLE_NAME = ? \
       AND tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE') \
     ORDER BY tc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION";

/// information_schema에서 테이블 구조를 읽는 카탈로그
pub struct MySqlCatalog {
    pool: Pool,
}

impl MySqlCatalog {
    pub fn new(config: &ConnectionConfig) -> Self {
        MySqlCatalog {
            pool: Pool::new(config.build_opts()),
        }
    }

    /// 접속 확인 + binlog_format 점검
    pub async fn check_server(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await.map_err(|e| {
            BinlogSqlError::ConnectionError(format!("Failed to connect to MySQL: {}", e))
        })?;

        let format: Option<(String, String)> = conn
            .query_first("SHOW GLOBAL VARIABLES LIKE 'binlog_format'")
            .await
            .map_err(|e| BinlogSqlError::QueryError(format!("Failed to query binlog_format: {}", e)))?;

        match format {
            Some((_, value)) if value.eq_ignore_ascii_case("ROW") => {
                info!("Connected to MySQL, binlog_format=ROW");
            }
            Some((_, value)) => warn!("binlog_format is {}, only ROW events can be converted", value),
            None => warn!("binlog_format not found"),
        }
        Ok(())
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .map_err(|e| BinlogSqlError::ConnectionError(format!("Failed to close pool: {}", e)))
    }
}

impl Catalog for MySqlCatalog {
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDef>> {
        let mut conn = self.pool.get_conn().await.map_err(|e| {
            BinlogSqlError::ConnectionError(format!("Failed to connect to MySQL: {}", e))
        })?;

        let rows: Vec<(String, String)> = conn
            .exec(COLUMNS_SQL, (schema, table))
            .await
            .map_err(|e| {
                BinlogSqlError::QueryError(format!(
                    "Failed to query columns of {}.{}: {}",
                    schema, table, e
                ))
            })?;

        Ok(rows
            .into_iter()
            .map(|(name, column_type)| ColumnDef::new(name, column_type))
            .collect())
    }

    async fn keys(&self, schema: &str, table: &str) -> Result<Vec<KeyDef>> {
        let mut conn = self.pool.get_conn().await.map_err(|e| {
            BinlogSqlError::ConnectionError(format!("Failed to connect to MySQL: {}", e))
        })?;

        let rows: Vec<(String, String, String)> = conn
            .exec(KEYS_SQL, (schema, table))
            .await
            .map_err(|e| {
                BinlogSqlError::QueryError(format!(
                    "Failed to query keys of {}.{}: {}",
                    schema, table, e
                ))
            })?;

        Ok(group_key_rows(rows))
    }
}

/// (제약 이름, 제약 타입, 컬럼) 행을 제약 단위로 묶는다. 입력 순서를 유지한다.
fn group_key_rows(rows: Vec<(String, String, String)>) -> Vec<KeyDef> {
    let mut keys: Vec<KeyDef> = Vec::new();
    for (name, kind, column) in rows {
        match keys.last_mut() {
            Some(last) if last.name == name => last.columns.push(column),
            _ => keys.push(KeyDef {
                primary: kind.eq_ignore_ascii_case("PRIMARY KEY"),
                name,
                columns: vec![column],
            }),
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("10.0.0.5", "repl");
        assert_eq!(config.hostname, "10.0.0.5");
        assert_eq!(config.username, "repl");
        assert_eq!(config.server_id, 3320);
    }

    #[test]
    fn test_group_key_rows() {
        let row = |n: &str, k: &str, c: &str| (n.to_string(), k.to_string(), c.to_string());
        let keys = group_key_rows(vec![
            row("PRIMARY", "PRIMARY KEY", "id"),
            row("uk_code", "UNIQUE", "tenant"),
            row("uk_code", "UNIQUE", "code"),
        ]);

        assert_eq!(keys.len(), 2);
        assert!(keys[0].primary);
        assert_eq!(keys[0].columns, vec!["id"]);
        assert!(!keys[1].primary);
        assert_eq!(keys[1].columns, vec!["tenant", "code"]);
    }
}
