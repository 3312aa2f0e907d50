//! 테이블 구조 캐시
//!
//! 처음 참조될 때 카탈로그에서 컬럼/키 정보를 읽어 `schema.table` 키로 보관한다.
//! 프로세스가 끝날 때까지 무효화하지 않는다.

use crate::error::{BinlogSqlError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// 컬럼 정의 (이름 + 선언 타입 원문)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    #[serde(rename = "column_name")]
    pub name: String,
    /// e.g. "int(10) unsigned", "varchar(64)", "mediumtext"
    pub column_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            column_type: column_type.into(),
        }
    }

    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    /// blob으로 저장되지만 문자열인 컬럼 (text 계열)
    pub fn is_textual(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("text")
    }
}

/// 카탈로그가 돌려주는 키 제약
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub name: String,
    pub primary: bool,
    pub columns: Vec<String>,
}

/// 테이블 구조
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub unique_keys: Vec<Vec<String>>,
}

impl TableDescriptor {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// 테이블 메타데이터 조회 인터페이스
///
/// 컬럼이 하나도 없으면 테이블이 없는 것으로 본다.
pub trait Catalog: Send + Sync {
    fn columns(&self, schema: &str, table: &str) -> impl Future<Output = Result<Vec<ColumnDef>>> + Send;

    fn keys(&self, schema: &str, table: &str) -> impl Future<Output = Result<Vec<KeyDef>>> + Send;
}

pub fn cache_key(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// 테이블 구조 캐시
pub struct DescriptorCache<C> {
    catalog: C,
    cache: RwLock<HashMap<String, Arc<TableDescriptor>>>,
}

impl<C: Catalog> DescriptorCache<C> {
    pub fn new(catalog: C) -> Self {
        DescriptorCache {
            catalog,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 캐시된 구조를 돌려주고, 없으면 카탈로그에서 읽어 채운다.
    pub async fn describe(&self, schema: &str, table: &str) -> Result<Arc<TableDescriptor>> {
        let key = cache_key(schema, table);
        let cached = self.cache.read().get(&key).cloned();
        if let Some(found) = cached {
            return Ok(found);
        }

        let columns = self.catalog.columns(schema, table).await?;
        if columns.is_empty() {
            return Err(BinlogSqlError::TableNotFound {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }
        let keys = self.catalog.keys(schema, table).await?;

        let mut primary_key = Vec::new();
        let mut unique_keys = Vec::new();
        for key in keys {
            if key.primary {
                primary_key = key.columns;
            } else {
                unique_keys.push(key.columns);
            }
        }

        debug!(
            "Loaded table structure {}: {} columns, primary key {:?}, {} unique keys",
            key,
            columns.len(),
            primary_key,
            unique_keys.len()
        );

        let descriptor = Arc::new(TableDescriptor {
            database: schema.to_string(),
            table: table.to_string(),
            columns,
            primary_key,
            unique_keys,
        });

        // 동시에 채운 경우 먼저 들어간 값을 유지
        let mut cache = self.cache.write();
        let entry = cache.entry(key).or_insert(descriptor);
        Ok(Arc::clone(entry))
    }

    pub fn cached_tables(&self) -> usize {
        self.cache.read().len()
    }
}

/// JSON 파일의 테이블 정의 한 건
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
}

/// 파일 또는 코드로 만든 테이블 정의를 쓰는 카탈로그 (서버 없이 실행)
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    tables: HashMap<String, TableDefinition>,
}

/// 테스트용 메모리 카탈로그
pub type MemoryCatalog = FileCatalog;

impl FileCatalog {
    pub fn from_definitions(definitions: Vec<TableDefinition>) -> Self {
        let tables = definitions
            .into_iter()
            .map(|d| (cache_key(&d.database, &d.table), d))
            .collect();
        FileCatalog { tables }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let definitions: Vec<TableDefinition> = serde_json::from_str(json)?;
        Ok(Self::from_definitions(definitions))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BinlogSqlError::IoError(format!("테이블 정의 파일 {} 읽기 실패: {}", path.display(), e))
        })?;
        let catalog = Self::from_json(&content)?;
        info!("Loaded {} table definitions from {}", catalog.tables.len(), path.display());
        Ok(catalog)
    }

    pub fn add(&mut self, definition: TableDefinition) {
        self.tables
            .insert(cache_key(&definition.database, &definition.table), definition);
    }
}

impl Catalog for FileCatalog {
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDef>> {
        Ok(self
            .tables
            .get(&cache_key(schema, table))
            .map(|d| d.columns.clone())
            .unwrap_or_default())
    }

    async fn keys(&self, schema: &str, table: &str) -> Result<Vec<KeyDef>> {
        let Some(def) = self.tables.get(&cache_key(schema, table)) else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::new();
        if !def.primary_key.is_empty() {
            keys.push(KeyDef {
                name: "PRIMARY".to_string(),
                primary: true,
                columns: def.primary_key.clone(),
            });
        }
        for (i, columns) in def.unique_keys.iter().enumerate() {
            keys.push(KeyDef {
                name: format!("uk_{}", i),
                primary: false,
                columns: columns.clone(),
            });
        }
        Ok(keys)
    }
}
