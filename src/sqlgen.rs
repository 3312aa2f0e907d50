//! 행 이벤트 -> SQL 텍스트 생성
//!
//! 상태가 없는 순수 함수라서 여러 작업자가 서로 다른 이벤트에 대해 동시에 호출한다.
//! 반환되는 문장에는 끝의 `;`가 붙지 않는다 (출력 단계에서 붙인다).

use crate::config::GenOptions;
use crate::error::{BinlogSqlError, Result};
use crate::events::{ColumnType, MutationEvent, StatementKind, Value};
use crate::json_binary::hex;
use crate::schema::TableDescriptor;
use std::fmt::Write;

/// 테이블 구조보다 긴 행 이미지에 붙이는 임시 컬럼명 접두어
pub const DROPPED_COLUMN_PREFIX: &str = "dropped_column_";
pub const UNKNOWN_COLUMN_TYPE: &str = "unknown_type";

/// 행 이미지 위치에 맞춘 컬럼 정보
#[derive(Debug, Clone)]
struct AlignedColumn {
    name: String,
    binlog_type: ColumnType,
    unsigned: bool,
    textual: bool,
}

impl AlignedColumn {
    /// 바이트 단위로 비교해야 하는 컬럼
    fn compares_bytes(&self) -> bool {
        self.binlog_type.is_byte_sequence() && !self.textual
    }
}

/// 이벤트 하나를 처리하는 동안의 문맥 (에러 메시지용 위치 포함)
struct Generator<'a> {
    event: &'a MutationEvent,
    options: &'a GenOptions,
    table_ref: String,
    columns: Vec<AlignedColumn>,
    /// WHERE 절에 쓸 컬럼 인덱스. 비어 있으면 전체 컬럼
    key: Vec<usize>,
    primary: Vec<usize>,
}

/// 이벤트 하나에 대한 정방향 또는 롤백 SQL 목록을 만든다.
pub fn generate(event: &MutationEvent, descriptor: &TableDescriptor, options: &GenOptions) -> Result<Vec<String>> {
    if event.column_types.len() > descriptor.columns.len() {
        return Err(BinlogSqlError::SchemaDrift {
            table: event.full_table_name(),
            binlog_columns: event.column_types.len(),
            table_columns: descriptor.columns.len(),
        });
    }

    if event.rows.is_empty() {
        return Ok(Vec::new());
    }

    let width = event.rows.first().map(|r| r.len()).unwrap_or(0);
    let columns = align_columns(event, descriptor, width);

    let key_names = select_key(descriptor, options.prefer_unique_key);
    let key = column_indexes(event, &columns, key_names)?;
    let primary = column_indexes(event, &columns, &descriptor.primary_key)?;

    let table_ref = if options.prefix_database {
        format!("{}.{}", event.database, event.table)
    } else {
        event.table.clone()
    };

    let gen = Generator {
        event,
        options,
        table_ref,
        columns,
        key,
        primary,
    };

    let rows = event
        .rows
        .iter()
        .map(|row| gen.normalize(row))
        .collect::<Result<Vec<_>>>()?;

    match (event.kind, options.rollback) {
        (StatementKind::Insert, false) => gen.inserts(&rows, options.ignore_primary_key_for_insert),
        (StatementKind::Insert, true) => gen.deletes(&rows),
        (StatementKind::Delete, false) => gen.deletes(&rows),
        (StatementKind::Delete, true) => gen.inserts(&rows, false),
        (StatementKind::Update, rollback) => gen.updates(&rows, rollback),
    }
}

/// 행 이미지 폭에 맞춰 컬럼 목록을 만든다. 구조보다 길면 임시 컬럼을 덧붙인다.
fn align_columns(event: &MutationEvent, descriptor: &TableDescriptor, width: usize) -> Vec<AlignedColumn> {
    (0..width)
        .map(|i| {
            let binlog_type = event.column_types.get(i).copied().unwrap_or(ColumnType::Null);
            match descriptor.columns.get(i) {
                Some(def) => AlignedColumn {
                    name: def.name.clone(),
                    binlog_type,
                    unsigned: def.is_unsigned(),
                    textual: binlog_type.is_blob() && def.is_textual(),
                },
                None => AlignedColumn {
                    name: format!("{}{}", DROPPED_COLUMN_PREFIX, i - descriptor.columns.len()),
                    binlog_type: ColumnType::Null,
                    unsigned: false,
                    textual: false,
                },
            }
        })
        .collect()
}

/// WHERE 절에 쓸 키 선택
///
/// unique 우선 옵션이 있으면 첫 unique 키, 아니면 기본키, 그것도 없으면 첫 unique 키.
/// 아무 키도 없으면 빈 목록 (전체 컬럼 비교).
pub fn select_key(descriptor: &TableDescriptor, prefer_unique: bool) -> &[String] {
    if prefer_unique {
        if let Some(unique) = descriptor.unique_keys.first() {
            return unique;
        }
    }
    if !descriptor.primary_key.is_empty() {
        return &descriptor.primary_key;
    }
    descriptor.unique_keys.first().map(|k| k.as_slice()).unwrap_or(&[])
}

fn column_indexes(event: &MutationEvent, columns: &[AlignedColumn], names: &[String]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| BinlogSqlError::KeyColumnMissing {
                    table: event.full_table_name(),
                    column: name.clone(),
                })
        })
        .collect()
}

impl<'a> Generator<'a> {
    fn encoding_error(&self, detail: impl Into<String>, row: &[Value]) -> BinlogSqlError {
        BinlogSqlError::Encoding {
            table: self.event.full_table_name(),
            position: self.event.position_str(),
            detail: detail.into(),
            row: format!("{:?}", row),
        }
    }

    /// unsigned 정수 재해석, text 컬럼 문자열 변환
    fn normalize(&self, row: &[Value]) -> Result<Vec<Value>> {
        if row.len() != self.columns.len() {
            return Err(self.encoding_error(
                format!("행 이미지 컬럼 수 {}가 {}와 다름", row.len(), self.columns.len()),
                row,
            ));
        }

        let mut out = Vec::with_capacity(row.len());
        for (value, column) in row.iter().zip(&self.columns) {
            let normalized = match value {
                Value::Null => Value::Null,
                _ if column.unsigned && column.binlog_type.integer_width().is_some() => {
                    let width = column.binlog_type.integer_width().unwrap_or(8);
                    match value {
                        Value::Int(v) => Value::Unsigned(to_unsigned(*v, width)),
                        Value::Unsigned(v) => Value::Unsigned(*v),
                        other => {
                            return Err(self.encoding_error(
                                format!("unsigned 컬럼 {}에 정수가 아닌 값 {:?}", column.name, other),
                                row,
                            ))
                        }
                    }
                }
                _ if column.textual => match value {
                    Value::Text(s) => Value::Text(s.clone()),
                    Value::Bytes(b) => match String::from_utf8(b.clone()) {
                        Ok(s) => Value::Text(s),
                        Err(e) => {
                            return Err(self.encoding_error(
                                format!("text 컬럼 {}를 문자열로 변환할 수 없음: {}", column.name, e),
                                row,
                            ))
                        }
                    },
                    other => {
                        return Err(self.encoding_error(
                            format!("text 컬럼 {}에 바이트가 아닌 값 {:?}", column.name, other),
                            row,
                        ))
                    }
                },
                other => other.clone(),
            };
            out.push(normalized);
        }
        Ok(out)
    }

    fn literal(&self, value: &Value, row: &[Value]) -> Result<String> {
        match value {
            Value::Null => Ok("NULL".to_string()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Unsigned(v) => Ok(v.to_string()),
            Value::Float32(v) if v.is_finite() => Ok(v.to_string()),
            Value::Float(v) if v.is_finite() => Ok(v.to_string()),
            Value::Float32(_) | Value::Float(_) => Err(self.encoding_error(
                format!("{:?}는 SQL 숫자로 표현할 수 없음", value),
                row,
            )),
            Value::Text(s) => Ok(quote(s)),
            Value::Bytes(b) => Ok(match std::str::from_utf8(b) {
                Ok(s) => quote(s),
                Err(_) => format!("0x{}", hex(b)),
            }),
        }
    }

    fn condition(&self, index: usize, row: &[Value]) -> Result<String> {
        let name = &self.columns[index].name;
        match &row[index] {
            Value::Null => Ok(format!("{} IS NULL", name)),
            value => Ok(format!("{}={}", name, self.literal(value, row)?)),
        }
    }

    fn where_clause(&self, row: &[Value]) -> Result<String> {
        let parts = if self.options.full_image || self.key.is_empty() {
            (0..self.columns.len())
                .map(|i| self.condition(i, row))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.key
                .iter()
                .map(|&i| self.condition(i, row))
                .collect::<Result<Vec<_>>>()?
        };
        Ok(parts.join(" AND "))
    }

    fn inserts(&self, rows: &[Vec<Value>], omit_primary: bool) -> Result<Vec<String>> {
        let omit_primary = omit_primary && !self.primary.is_empty();
        let included: Vec<usize> = (0..self.columns.len())
            .filter(|i| !(omit_primary && self.primary.contains(i)))
            .collect();
        let names: Vec<&str> = included.iter().map(|&i| self.columns[i].name.as_str()).collect();

        let mut statements = Vec::new();
        for chunk in rows.chunks(self.options.rows_per_statement.max(1)) {
            let mut sql = format!("INSERT INTO {} ({}) VALUES ", self.table_ref, names.join(","));
            for (n, row) in chunk.iter().enumerate() {
                if n > 0 {
                    sql.push(',');
                }
                let values = included
                    .iter()
                    .map(|&i| self.literal(&row[i], row))
                    .collect::<Result<Vec<_>>>()?;
                let _ = write!(sql, "({})", values.join(","));
            }
            statements.push(sql);
        }
        Ok(statements)
    }

    fn deletes(&self, rows: &[Vec<Value>]) -> Result<Vec<String>> {
        rows.iter()
            .map(|row| Ok(format!("DELETE FROM {} WHERE {}", self.table_ref, self.where_clause(row)?)))
            .collect()
    }

    /// (before, after) 쌍. 롤백이면 SET은 before, WHERE는 after 이미지를 쓴다.
    fn updates(&self, rows: &[Vec<Value>], rollback: bool) -> Result<Vec<String>> {
        if rows.len() % 2 != 0 {
            let last = rows.last().map(|r| r.as_slice()).unwrap_or(&[]);
            return Err(self.encoding_error(
                format!("update 이벤트의 행 이미지 수가 홀수: {}", rows.len()),
                last,
            ));
        }

        let mut statements = Vec::with_capacity(rows.len() / 2);
        for pair in rows.chunks_exact(2) {
            let (before, after) = (&pair[0], &pair[1]);
            let (set_row, where_row) = if rollback { (before, after) } else { (after, before) };

            let mut assignments = Vec::new();
            for (i, column) in self.columns.iter().enumerate() {
                if self.options.full_image || changed(column, &before[i], &after[i]) {
                    assignments.push(format!("{}={}", column.name, self.literal(&set_row[i], set_row)?));
                }
            }

            let mut sql = format!("UPDATE {} SET", self.table_ref);
            if !assignments.is_empty() {
                sql.push(' ');
                sql.push_str(&assignments.join(","));
            }
            let _ = write!(sql, " WHERE {}", self.where_clause(where_row)?);
            statements.push(sql);
        }
        Ok(statements)
    }
}

fn changed(column: &AlignedColumn, before: &Value, after: &Value) -> bool {
    if column.compares_bytes() {
        match (before.raw_bytes(), after.raw_bytes()) {
            (Some(a), Some(b)) => a != b,
            _ => !(before.is_null() && after.is_null()),
        }
    } else {
        before != after
    }
}

/// 부호 있는 표현을 컬럼 폭의 unsigned 값으로 재해석
fn to_unsigned(value: i64, width: u32) -> u64 {
    if width >= 8 {
        value as u64
    } else {
        (value as u64) & ((1u64 << (width * 8)) - 1)
    }
}

/// MySQL 문자열 리터럴
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
