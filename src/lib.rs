//! MySQL binlog을 SQL로 바꾸는 도구
//!
//! binlog 파일이나 복제 연결에서 행 변경 이벤트를 읽어 다음을 만든다.
//! - 정방향 SQL (`forward.N.sql`)
//! - 역순으로 되돌리는 롤백 SQL (`rollback.N.sql`)
//! - 테이블별 통계, 큰/긴 트랜잭션, DDL 목록

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod json_binary;
pub mod offset;
pub mod protocol;
pub mod reverse;
pub mod schema;
pub mod source;
pub mod sqlgen;
pub mod stats;
pub mod writer;

pub use binlog_client::ReplicationSource;
pub use config::{EngineConfig, GenOptions, TableFilter, WorkType};
pub use connection::{ConnectionConfig, MySqlCatalog};
pub use engine::{Engine, RunSummary};
pub use error::{BinlogSqlError, Result};
pub use events::{BinlogEvent, EventType, MutationEvent, Observation, StatementKind};
pub use offset::BinlogPosition;
pub use schema::{Catalog, DescriptorCache, FileCatalog, TableDescriptor};
pub use source::{BinlogFileSource, EventSource};
