//! Reads a live database's catalog into canonical [`TableSchema`]s.
//!
//! [`CatalogSource`] is the trait the rest of the differ programs against —
//! tests implement it directly (see `basalt-test-harness`), production code
//! uses [`SqlCatalogSource`], which drives dialect-specific
//! `information_schema`/`pg_catalog` queries over a [`SqlConnection`].

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::schema::{
    normalize_type_alias, ColumnSchema, Dialect, ForeignKeySchema, IndexSchema, ReferentialAction,
    TableSchema,
};
use crate::sql::{Param, Row, SqlConnection};

/// The typed catalog-read surface [`DbReader`] needs. Implement this
/// directly for tests; production code gets it for free via
/// [`SqlCatalogSource`].
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn table_names(&self) -> Result<Vec<String>>;
    async fn columns(&self, table: &str) -> Result<Vec<ColumnSchema>>;
    async fn indexes(&self, table: &str) -> Result<Vec<IndexSchema>>;
    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeySchema>>;
    async fn primary_key_constraint_name(&self, table: &str) -> Result<Option<String>>;
}

/// Reads every non-internal table from a [`CatalogSource`] into canonical
/// form, ready for [`crate::diff::compare_schemas`].
pub struct DbReader;

impl DbReader {
    pub async fn read(source: &dyn CatalogSource) -> Result<Vec<TableSchema>> {
        let mut tables = Vec::new();
        for name in source.table_names().await? {
            if TableSchema::is_internal(&name) {
                continue;
            }
            let columns = source.columns(&name).await?;
            let indexes = dedup_indexes(source.indexes(&name).await?);
            let foreign_keys = source.foreign_keys(&name).await?;
            let primary_key_constraint_name = source.primary_key_constraint_name(&name).await?;
            tables.push(TableSchema {
                name,
                columns,
                indexes,
                foreign_keys,
                primary_key_constraint_name,
                skipped_columns: None,
            });
        }
        Ok(tables)
    }
}

fn dedup_indexes(indexes: Vec<IndexSchema>) -> Vec<IndexSchema> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    indexes
        .into_iter()
        .filter(|idx| seen.insert(idx.structural_key(), ()).is_none())
        .collect()
}

/// Adapts a raw [`SqlConnection`] into a [`CatalogSource`] by issuing the
/// dialect-appropriate catalog query for each call.
pub struct SqlCatalogSource<'a, C: SqlConnection> {
    conn: &'a C,
    dialect: Dialect,
    /// PostgreSQL only: the schema to restrict catalog reads to (defaults
    /// to `public` when unset).
    pg_schema: Option<String>,
}

impl<'a, C: SqlConnection> SqlCatalogSource<'a, C> {
    #[must_use]
    pub fn new(conn: &'a C, dialect: Dialect) -> Self {
        Self {
            conn,
            dialect,
            pg_schema: None,
        }
    }

    #[must_use]
    pub fn with_pg_schema(mut self, schema: impl Into<String>) -> Self {
        self.pg_schema = Some(schema.into());
        self
    }

    fn schema(&self) -> &str {
        self.pg_schema.as_deref().unwrap_or("public")
    }
}

#[async_trait]
impl<'a, C: SqlConnection> CatalogSource for SqlCatalogSource<'a, C> {
    async fn table_names(&self) -> Result<Vec<String>> {
        let rows = match self.dialect {
            Dialect::MySql => {
                self.conn
                    .query(
                        "SELECT table_name AS name FROM information_schema.tables \
                         WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'",
                        &[],
                    )
                    .await?
            }
            Dialect::Postgres => {
                self.conn
                    .query(
                        "SELECT table_name AS name FROM information_schema.tables \
                         WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
                        &[Param::from(self.schema())],
                    )
                    .await?
            }
        };
        rows.iter()
            .map(|row| {
                row.get_str("name").map(str::to_string).ok_or_else(|| {
                    Error::MalformedCatalogRow {
                        table: "<table list>".to_string(),
                        reason: "missing name column".to_string(),
                    }
                })
            })
            .collect()
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        let rows = match self.dialect {
            Dialect::MySql => {
                self.conn
                    .query(
                        "SELECT column_name, data_type, column_type, character_maximum_length, \
                         numeric_precision, numeric_scale, is_nullable, column_default, extra, \
                         ordinal_position, column_key \
                         FROM information_schema.columns \
                         WHERE table_schema = DATABASE() AND table_name = ? \
                         ORDER BY ordinal_position",
                        &[Param::from(table)],
                    )
                    .await?
            }
            Dialect::Postgres => {
                self.conn
                    .query(
                        "SELECT column_name, data_type, udt_name, character_maximum_length, \
                         numeric_precision, numeric_scale, is_nullable, column_default, \
                         is_identity, identity_generation, ordinal_position \
                         FROM information_schema.columns \
                         WHERE table_schema = $1 AND table_name = $2 \
                         ORDER BY ordinal_position",
                        &[Param::from(self.schema()), Param::from(table)],
                    )
                    .await?
            }
        };

        let pk_columns = self.primary_key_columns(table).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(match self.dialect {
                Dialect::MySql => mysql_column_from_row(table, &row, &pk_columns)?,
                Dialect::Postgres => postgres_column_from_row(table, &row, &pk_columns)?,
            });
        }
        Ok(columns)
    }

    async fn indexes(&self, table: &str) -> Result<Vec<IndexSchema>> {
        let rows = match self.dialect {
            Dialect::MySql => {
                self.conn
                    .query(
                        "SELECT index_name, column_name, non_unique, index_type, seq_in_index \
                         FROM information_schema.statistics \
                         WHERE table_schema = DATABASE() AND table_name = ? AND index_name <> 'PRIMARY' \
                         ORDER BY index_name, seq_in_index",
                        &[Param::from(table)],
                    )
                    .await?
            }
            Dialect::Postgres => {
                self.conn
                    .query(
                        "SELECT ix.relname AS index_name, a.attname AS column_name, \
                         idx.indisunique AS is_unique, am.amname AS index_method \
                         FROM pg_index idx \
                         JOIN pg_class t ON t.oid = idx.indrelid \
                         JOIN pg_class ix ON ix.oid = idx.indexrelid \
                         JOIN pg_am am ON am.oid = ix.relam \
                         JOIN unnest(idx.indkey) WITH ORDINALITY AS cols(attnum, ord) ON true \
                         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = cols.attnum \
                         WHERE t.relname = $1 AND NOT idx.indisprimary \
                         ORDER BY ix.relname, cols.ord",
                        &[Param::from(table)],
                    )
                    .await?
            }
        };

        let mut by_name: Vec<(String, Vec<String>, bool, bool)> = Vec::new();
        for row in rows {
            let name = row.get_str("index_name").unwrap_or_default().to_string();
            let column = row.get_str("column_name").unwrap_or_default().to_string();
            let unique = match self.dialect {
                Dialect::MySql => row.get_i64("non_unique").unwrap_or(1) == 0,
                Dialect::Postgres => row.get_bool("is_unique").unwrap_or(false),
            };
            let spatial = match self.dialect {
                Dialect::MySql => row.get_str("index_type") == Some("SPATIAL"),
                Dialect::Postgres => row.get_str("index_method") == Some("gist"),
            };
            match by_name.iter_mut().find(|(n, ..)| *n == name) {
                Some((_, columns, ..)) => columns.push(column),
                None => by_name.push((name, vec![column], unique, spatial)),
            }
        }

        Ok(by_name
            .into_iter()
            .map(|(name, columns, unique, spatial)| IndexSchema {
                name,
                columns,
                unique,
                spatial,
            })
            .collect())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeySchema>> {
        let rows = match self.dialect {
            Dialect::MySql => {
                self.conn
                    .query(
                        "SELECT kcu.constraint_name, kcu.column_name, kcu.referenced_table_name, \
                         kcu.referenced_column_name, rc.update_rule, rc.delete_rule, kcu.ordinal_position \
                         FROM information_schema.key_column_usage kcu \
                         JOIN information_schema.referential_constraints rc \
                           ON rc.constraint_name = kcu.constraint_name AND rc.constraint_schema = kcu.table_schema \
                         WHERE kcu.table_schema = DATABASE() AND kcu.table_name = ? \
                           AND kcu.referenced_table_name IS NOT NULL \
                         ORDER BY kcu.constraint_name, kcu.ordinal_position",
                        &[Param::from(table)],
                    )
                    .await?
            }
            Dialect::Postgres => {
                self.conn
                    .query(
                        "SELECT tc.constraint_name, kcu.column_name, ccu.table_name AS referenced_table_name, \
                         ccu.column_name AS referenced_column_name, rc.update_rule, rc.delete_rule, kcu.ordinal_position \
                         FROM information_schema.table_constraints tc \
                         JOIN information_schema.key_column_usage kcu ON kcu.constraint_name = tc.constraint_name \
                         JOIN information_schema.referential_constraints rc ON rc.constraint_name = tc.constraint_name \
                         JOIN information_schema.constraint_column_usage ccu ON ccu.constraint_name = tc.constraint_name \
                         WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 AND tc.table_name = $2 \
                         ORDER BY tc.constraint_name, kcu.ordinal_position",
                        &[Param::from(self.schema()), Param::from(table)],
                    )
                    .await?
            }
        };

        let mut by_name: Vec<(String, Vec<String>, String, Vec<String>, ReferentialAction, ReferentialAction)> =
            Vec::new();
        for row in rows {
            let name = row.get_str("constraint_name").unwrap_or_default().to_string();
            let column = row.get_str("column_name").unwrap_or_default().to_string();
            let ref_table = row
                .get_str("referenced_table_name")
                .unwrap_or_default()
                .to_string();
            let ref_column = row
                .get_str("referenced_column_name")
                .unwrap_or_default()
                .to_string();
            let on_update = parse_referential_action(row.get_str("update_rule").unwrap_or("NO ACTION"));
            let on_delete = parse_referential_action(row.get_str("delete_rule").unwrap_or("NO ACTION"));
            match by_name.iter_mut().find(|(n, ..)| *n == name) {
                Some((_, columns, _, ref_columns, ..)) => {
                    columns.push(column);
                    ref_columns.push(ref_column);
                }
                None => by_name.push((name, vec![column], ref_table, vec![ref_column], on_delete, on_update)),
            }
        }

        Ok(by_name
            .into_iter()
            .map(
                |(name, columns, referenced_table, referenced_columns, on_delete, on_update)| {
                    ForeignKeySchema {
                        name,
                        columns,
                        referenced_table,
                        referenced_columns,
                        on_delete,
                        on_update,
                    }
                },
            )
            .collect())
    }

    async fn primary_key_constraint_name(&self, table: &str) -> Result<Option<String>> {
        let rows = match self.dialect {
            Dialect::MySql => {
                self.conn
                    .query(
                        "SELECT constraint_name FROM information_schema.table_constraints \
                         WHERE table_schema = DATABASE() AND table_name = ? AND constraint_type = 'PRIMARY KEY'",
                        &[Param::from(table)],
                    )
                    .await?
            }
            Dialect::Postgres => {
                self.conn
                    .query(
                        "SELECT constraint_name FROM information_schema.table_constraints \
                         WHERE table_schema = $1 AND table_name = $2 AND constraint_type = 'PRIMARY KEY'",
                        &[Param::from(self.schema()), Param::from(table)],
                    )
                    .await?
            }
        };
        Ok(rows.first().and_then(|r| r.get_str("constraint_name")).map(str::to_string))
    }
}

impl<'a, C: SqlConnection> SqlCatalogSource<'a, C> {
    async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = match self.dialect {
            Dialect::MySql => {
                self.conn
                    .query(
                        "SELECT column_name FROM information_schema.key_column_usage \
                         WHERE table_schema = DATABASE() AND table_name = ? AND constraint_name = 'PRIMARY' \
                         ORDER BY ordinal_position",
                        &[Param::from(table)],
                    )
                    .await?
            }
            Dialect::Postgres => {
                self.conn
                    .query(
                        "SELECT kcu.column_name FROM information_schema.table_constraints tc \
                         JOIN information_schema.key_column_usage kcu ON kcu.constraint_name = tc.constraint_name \
                         WHERE tc.table_schema = $1 AND tc.table_name = $2 AND tc.constraint_type = 'PRIMARY KEY' \
                         ORDER BY kcu.ordinal_position",
                        &[Param::from(self.schema()), Param::from(table)],
                    )
                    .await?
            }
        };
        Ok(rows
            .iter()
            .filter_map(|r| r.get_str("column_name").map(str::to_string))
            .collect())
    }
}

fn parse_referential_action(raw: &str) -> ReferentialAction {
    match raw.to_uppercase().as_str() {
        "CASCADE" => ReferentialAction::Cascade,
        "SET NULL" => ReferentialAction::SetNull,
        "SET DEFAULT" => ReferentialAction::SetDefault,
        "RESTRICT" => ReferentialAction::Restrict,
        _ => ReferentialAction::NoAction,
    }
}

/// `information_schema.columns.extra` reports the whole MySQL "extra"
/// string, e.g. `"DEFAULT_GENERATED on update CURRENT_TIMESTAMP"`. The
/// entity side only ever declares the bare expression (`"CURRENT_TIMESTAMP"`),
/// so pull out just the part after `on update`, case-insensitively, and trim
/// it — otherwise every such column looks modified on every diff.
fn extract_on_update_expression(extra: &str) -> Option<String> {
    let lower = extra.to_lowercase();
    let marker = "on update";
    let start = lower.find(marker)? + marker.len();
    let expr = extra[start..].trim();
    if expr.is_empty() {
        None
    } else {
        Some(expr.to_string())
    }
}

fn mysql_column_from_row(table: &str, row: &Row, pk_columns: &[String]) -> Result<ColumnSchema> {
    let name = row
        .get_str("column_name")
        .ok_or_else(|| malformed(table, "missing column_name"))?
        .to_string();
    let data_type = row
        .get_str("data_type")
        .ok_or_else(|| malformed(table, "missing data_type"))?
        .to_lowercase();
    let column_type = row.get_str("column_type").unwrap_or_default().to_lowercase();
    let unsigned = column_type.contains("unsigned");
    // MySQL has no native boolean; convention is tinyint(1).
    let r#type = if data_type == "tinyint" && column_type.contains("tinyint(1)") {
        "boolean".to_string()
    } else {
        normalize_type_alias(&data_type).to_string()
    };
    let extra = row.get_str("extra").unwrap_or_default();
    let ordinal_position = row.get_i64("ordinal_position").unwrap_or(0) as u32;

    Ok(ColumnSchema {
        name: name.clone(),
        r#type,
        size: row
            .get_i64("character_maximum_length")
            .or_else(|| row.get_i64("numeric_precision"))
            .map(|v| v as u32),
        scale: row.get_i64("numeric_scale").map(|v| v as u32),
        unsigned,
        nullable: row.get_str("is_nullable") == Some("YES"),
        auto_increment: extra.contains("auto_increment"),
        is_primary_key: pk_columns.iter().any(|c| c == &name),
        default_value: row.get_str("column_default").map(str::to_string),
        default_expression: None,
        on_update_expression: extract_on_update_expression(&extra),
        enum_values: None,
        enum_type_name: None,
        is_identity: None,
        sequence_name: None,
        ordinal_position,
    })
}

fn postgres_column_from_row(table: &str, row: &Row, pk_columns: &[String]) -> Result<ColumnSchema> {
    let name = row
        .get_str("column_name")
        .ok_or_else(|| malformed(table, "missing column_name"))?
        .to_string();
    let data_type = row
        .get_str("udt_name")
        .or_else(|| row.get_str("data_type"))
        .ok_or_else(|| malformed(table, "missing data_type"))?
        .to_lowercase();
    let ordinal_position = row.get_i64("ordinal_position").unwrap_or(0) as u32;
    let is_identity = row.get_str("is_identity") == Some("YES");
    let default = row.get_str("column_default").map(str::to_string);
    let is_serial_sequence = default
        .as_deref()
        .map(|d| d.contains("nextval("))
        .unwrap_or(false);

    Ok(ColumnSchema {
        name,
        r#type: normalize_type_alias(&data_type).to_string(),
        size: row
            .get_i64("character_maximum_length")
            .or_else(|| row.get_i64("numeric_precision"))
            .map(|v| v as u32),
        scale: row.get_i64("numeric_scale").map(|v| v as u32),
        unsigned: false,
        nullable: row.get_str("is_nullable") == Some("YES"),
        auto_increment: is_identity || is_serial_sequence,
        is_primary_key: pk_columns.iter().any(|c| c == &row
            .get_str("column_name")
            .unwrap_or_default()
            .to_string()),
        default_value: if is_identity || is_serial_sequence {
            None
        } else {
            default.clone()
        },
        default_expression: None,
        on_update_expression: None,
        enum_values: None,
        enum_type_name: None,
        is_identity: if is_identity || is_serial_sequence {
            Some(is_identity)
        } else {
            None
        },
        sequence_name: None,
        ordinal_position,
    })
}

fn malformed(table: &str, reason: &str) -> Error {
    Error::MalformedCatalogRow {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct FakeCatalog {
        tables: Map<String, TableSchema>,
    }

    #[async_trait]
    impl CatalogSource for FakeCatalog {
        async fn table_names(&self) -> Result<Vec<String>> {
            Ok(self.tables.keys().cloned().collect())
        }

        async fn columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
            Ok(self.tables.get(table).map(|t| t.columns.clone()).unwrap_or_default())
        }

        async fn indexes(&self, table: &str) -> Result<Vec<IndexSchema>> {
            Ok(self.tables.get(table).map(|t| t.indexes.clone()).unwrap_or_default())
        }

        async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeySchema>> {
            Ok(self.tables.get(table).map(|t| t.foreign_keys.clone()).unwrap_or_default())
        }

        async fn primary_key_constraint_name(&self, table: &str) -> Result<Option<String>> {
            Ok(self.tables.get(table).and_then(|t| t.primary_key_constraint_name.clone()))
        }
    }

    #[tokio::test]
    async fn db_reader_excludes_internal_tables() {
        let mut tables = Map::new();
        tables.insert("users".to_string(), TableSchema::new("users"));
        tables.insert("_migrations".to_string(), TableSchema::new("_migrations"));
        let source = FakeCatalog { tables };

        let read = DbReader::read(&source).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].name, "users");
    }

    #[test]
    fn mysql_tinyint1_normalizes_to_boolean() {
        let mut row = Row::default();
        row.insert("column_name", "active");
        row.insert("data_type", "tinyint");
        row.insert("column_type", "tinyint(1)");
        row.insert("is_nullable", "NO");
        row.insert("ordinal_position", 1);
        let col = mysql_column_from_row("flags", &row, &[]).unwrap();
        assert_eq!(col.r#type, "boolean");
    }

    #[test]
    fn postgres_identity_column_has_no_literal_default() {
        let mut row = Row::default();
        row.insert("column_name", "id");
        row.insert("udt_name", "int4");
        row.insert("is_nullable", "NO");
        row.insert("is_identity", "YES");
        row.insert("ordinal_position", 1);
        let col = postgres_column_from_row("users", &row, &["id".to_string()]).unwrap();
        assert!(col.auto_increment);
        assert_eq!(col.is_identity, Some(true));
        assert!(col.default_value.is_none());
        assert!(col.is_primary_key);
    }

    #[test]
    fn referential_action_parsing_defaults_to_no_action() {
        assert_eq!(parse_referential_action("CASCADE"), ReferentialAction::Cascade);
        assert_eq!(parse_referential_action("bogus"), ReferentialAction::NoAction);
    }

    #[test]
    fn on_update_expression_is_extracted_from_the_extra_string() {
        assert_eq!(
            extract_on_update_expression("DEFAULT_GENERATED on update CURRENT_TIMESTAMP"),
            Some("CURRENT_TIMESTAMP".to_string())
        );
        assert_eq!(
            extract_on_update_expression("on update CURRENT_TIMESTAMP(3)"),
            Some("CURRENT_TIMESTAMP(3)".to_string())
        );
        assert_eq!(extract_on_update_expression("auto_increment"), None);
    }

    #[test]
    fn mysql_column_stores_bare_on_update_expression() {
        let mut row = Row::default();
        row.insert("column_name", "updated_at");
        row.insert("data_type", "timestamp");
        row.insert("is_nullable", "NO");
        row.insert("ordinal_position", 1);
        row.insert("extra", "DEFAULT_GENERATED on update CURRENT_TIMESTAMP");
        let col = mysql_column_from_row("events", &row, &[]).unwrap();
        assert_eq!(col.on_update_expression.as_deref(), Some("CURRENT_TIMESTAMP"));
    }
}
