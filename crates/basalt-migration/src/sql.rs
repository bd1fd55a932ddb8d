//! The narrow SQL connection abstraction that [`crate::catalog::SqlCatalogSource`]
//! drives to read a live database's catalog. Production callers wire this to
//! whatever driver their deployment already uses (`sqlx`, `tokio-postgres`,
//! a connection pool); [`crate::catalog::CatalogSource`] is the trait the
//! rest of the differ actually programs against, so tests can implement it
//! directly without a database at all.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;

/// One result row, column name to JSON-ish value. `BTreeMap` keeps column
/// order deterministic for logging and test assertions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub BTreeMap<String, Value>);

impl Row {
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    #[must_use]
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Value::as_bool)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(column.into(), value.into());
        self
    }
}

impl From<BTreeMap<String, Value>> for Row {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Row(map)
    }
}

/// A bound SQL parameter. Catalog queries only ever need these scalar kinds.
#[derive(Debug, Clone)]
pub enum Param {
    Text(String),
    Int(i64),
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

/// A live SQL connection: exec/query only, deliberately narrow. DbReader
/// never issues DDL or writes through this trait; [`crate::ddl::DdlGenerator`]
/// output is handed to the caller as text, not executed by the differ.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>>;

    async fn exec(&self, sql: &str, params: &[Param]) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_accessors_read_typed_values() {
        let mut row = Row::default();
        row.insert("name", Value::String("orders".to_string()));
        row.insert("ordinal_position", Value::from(3));
        row.insert("is_nullable", Value::Bool(true));

        assert_eq!(row.get_str("name"), Some("orders"));
        assert_eq!(row.get_i64("ordinal_position"), Some(3));
        assert_eq!(row.get_bool("is_nullable"), Some(true));
        assert_eq!(row.get_str("missing"), None);
    }
}
