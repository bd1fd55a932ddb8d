//! A table-driven [`CatalogSource`] for schema-differ tests: build up a
//! catalog as a set of [`TableSchema`]s and hand it to
//! [`basalt_migration::diff::compare_schemas`] without a real database.

use async_trait::async_trait;
use std::collections::HashMap;

use basalt_migration::{
    CatalogSource, ColumnSchema, ForeignKeySchema, IndexSchema, Result, TableSchema,
};

/// An in-memory [`CatalogSource`] seeded from [`TableSchema`] values.
///
/// Mirrors the `FakeCatalog` each `basalt-migration` test builds inline, but
/// exposed so coordination- and srpc-adjacent integration tests (or any
/// future crate) can assemble a catalog without duplicating it.
#[derive(Debug, Default)]
pub struct FixtureCatalog {
    tables: HashMap<String, TableSchema>,
}

impl FixtureCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a table, keyed by its own name.
    #[must_use]
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn insert_table(&mut self, table: TableSchema) {
        self.tables.insert(table.name.clone(), table);
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalog {
    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn indexes(&self, table: &str) -> Result<Vec<IndexSchema>> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.indexes.clone())
            .unwrap_or_default())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeySchema>> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.foreign_keys.clone())
            .unwrap_or_default())
    }

    async fn primary_key_constraint_name(&self, table: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .get(table)
            .and_then(|t| t.primary_key_constraint_name.clone()))
    }
}
