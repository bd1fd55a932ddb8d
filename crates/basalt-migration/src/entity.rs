//! Canonicalizes declared entity metadata into [`TableSchema`].
//!
//! An [`EntityDef`] is the declarative, source-of-truth description of a
//! table that application code builds (by hand, or via its own derive
//! macro upstream of this crate); [`EntityReader`] turns a slice of them
//! into the same canonical shape [`crate::catalog::DbReader`] produces from
//! a live database, so [`crate::diff::compare_schemas`] can treat both sides
//! uniformly.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::schema::{
    normalize_type_alias, ColumnSchema, ForeignKeySchema, IndexSchema, ReferentialAction,
    TableSchema,
};

/// Declared column metadata, in source/declaration order.
#[derive(Debug, Clone)]
pub struct EntityColumn {
    pub name: String,
    pub r#type: String,
    pub size: Option<u32>,
    pub scale: Option<u32>,
    pub unsigned: bool,
    pub nullable: bool,
    pub auto_increment: bool,
    pub primary_key: bool,
    /// Always an expression, never a materialized literal — entity
    /// declarations describe behavior (`NOW()`), not a snapshot value.
    pub default_expression: Option<String>,
    pub on_update_expression: Option<String>,
    pub enum_values: Option<Vec<String>>,
}

impl EntityColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: r#type.into(),
            size: None,
            scale: None,
            unsigned: false,
            nullable: false,
            auto_increment: false,
            primary_key: false,
            default_expression: None,
            on_update_expression: None,
            enum_values: None,
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    #[must_use]
    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    #[must_use]
    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn scale(mut self, scale: u32) -> Self {
        self.scale = Some(scale);
        self
    }

    #[must_use]
    pub fn default_expression(mut self, expr: impl Into<String>) -> Self {
        self.default_expression = Some(expr.into());
        self
    }

    #[must_use]
    pub fn on_update_expression(mut self, expr: impl Into<String>) -> Self {
        self.on_update_expression = Some(expr.into());
        self
    }

    #[must_use]
    pub fn enum_values(mut self, values: Vec<String>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EntityIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub spatial: bool,
}

#[derive(Debug, Clone)]
pub struct EntityForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// A declared table, in the shape application code builds up-front.
/// Tables whose name starts with `_` are treated as internal bookkeeping
/// and are never diffed (distilled spec: `_`-prefixed table exclusion).
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: String,
    pub columns: Vec<EntityColumn>,
    pub indexes: Vec<EntityIndex>,
    pub foreign_keys: Vec<EntityForeignKey>,
}

impl EntityDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, column: EntityColumn) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn index(mut self, index: EntityIndex) -> Self {
        self.indexes.push(index);
        self
    }

    #[must_use]
    pub fn foreign_key(mut self, fk: EntityForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }
}

/// Reads a set of [`EntityDef`]s into canonical [`TableSchema`]s.
pub struct EntityReader;

impl EntityReader {
    /// Canonicalizes every non-internal entity. Indexes are deduplicated by
    /// structural key ([`IndexSchema::structural_key`]) before being
    /// attached, matching the live-catalog reader's behavior so the same
    /// index declared twice in application code doesn't produce a spurious
    /// diff against a database that only ever had one.
    pub fn read(entities: &[EntityDef]) -> Result<Vec<TableSchema>> {
        let mut tables = Vec::with_capacity(entities.len());
        for entity in entities {
            if TableSchema::is_internal(&entity.name) {
                continue;
            }
            tables.push(Self::read_one(entity)?);
        }
        Ok(tables)
    }

    fn read_one(entity: &EntityDef) -> Result<TableSchema> {
        let mut table = TableSchema::new(entity.name.clone());

        for (position, column) in entity.columns.iter().enumerate() {
            if column.enum_values.is_some() && column.r#type.to_lowercase() != "enum" {
                return Err(Error::InvalidEntity {
                    table: entity.name.clone(),
                    reason: format!(
                        "column {} declares enum_values but type is {}",
                        column.name, column.r#type
                    ),
                });
            }

            let is_pg_enum = column.r#type.to_lowercase() == "enum";
            table.columns.push(ColumnSchema {
                name: column.name.clone(),
                r#type: normalize_type_alias(&column.r#type.to_lowercase()).to_string(),
                size: column.size,
                scale: column.scale,
                unsigned: column.unsigned,
                nullable: column.nullable,
                auto_increment: column.auto_increment,
                is_primary_key: column.primary_key,
                default_value: None,
                default_expression: column.default_expression.clone(),
                on_update_expression: column.on_update_expression.clone(),
                enum_values: column.enum_values.clone(),
                enum_type_name: if is_pg_enum {
                    Some(format!("{}_{}_enum", entity.name, column.name))
                } else {
                    None
                },
                is_identity: None,
                sequence_name: None,
                ordinal_position: position as u32,
            });
        }

        if table.columns.iter().filter(|c| c.is_primary_key).count() > 0 {
            table.primary_key_constraint_name = Some(format!("pk_{}", entity.name));
        }

        let mut seen: HashMap<String, ()> = HashMap::new();
        for index in &entity.indexes {
            let schema = IndexSchema {
                name: index.name.clone(),
                columns: index.columns.clone(),
                unique: index.unique,
                spatial: index.spatial,
            };
            if seen.insert(schema.structural_key(), ()).is_none() {
                table.indexes.push(schema);
            }
        }

        for fk in &entity.foreign_keys {
            table.foreign_keys.push(ForeignKeySchema {
                name: fk.name.clone(),
                columns: fk.columns.clone(),
                referenced_table: fk.referenced_table.clone(),
                referenced_columns: fk.referenced_columns.clone(),
                on_delete: fk.on_delete,
                on_update: fk.on_update,
            });
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_entity() -> EntityDef {
        EntityDef::new("users")
            .column(
                EntityColumn::new("id", "int")
                    .primary_key()
                    .auto_increment(),
            )
            .column(EntityColumn::new("email", "varchar").size(255))
            .column(
                EntityColumn::new("created_at", "timestamp")
                    .default_expression("NOW()"),
            )
            .index(EntityIndex {
                name: "idx_users_email".to_string(),
                columns: vec!["email".to_string()],
                unique: true,
                spatial: false,
            })
    }

    #[test]
    fn reads_columns_in_declaration_order() {
        let tables = EntityReader::read(&[users_entity()]).unwrap();
        let users = &tables[0];
        assert_eq!(
            users.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["id", "email", "created_at"]
        );
        assert_eq!(users.columns[0].ordinal_position, 0);
        assert_eq!(users.columns[2].ordinal_position, 2);
    }

    #[test]
    fn default_expression_never_becomes_a_literal_default() {
        let tables = EntityReader::read(&[users_entity()]).unwrap();
        let created_at = tables[0].column("created_at").unwrap();
        assert_eq!(created_at.default_expression.as_deref(), Some("NOW()"));
        assert!(created_at.default_value.is_none());
    }

    #[test]
    fn primary_key_constraint_name_is_synthesized() {
        let tables = EntityReader::read(&[users_entity()]).unwrap();
        assert_eq!(
            tables[0].primary_key_constraint_name.as_deref(),
            Some("pk_users")
        );
    }

    #[test]
    fn internal_tables_are_excluded() {
        let tables = EntityReader::read(&[EntityDef::new("_migrations")]).unwrap();
        assert!(tables.is_empty());
    }

    #[test]
    fn duplicate_structural_indexes_are_deduplicated() {
        let entity = users_entity().index(EntityIndex {
            name: "idx_users_email_dup".to_string(),
            columns: vec!["email".to_string()],
            unique: true,
            spatial: false,
        });
        let tables = EntityReader::read(&[entity]).unwrap();
        assert_eq!(tables[0].indexes.len(), 1);
    }

    #[test]
    fn enum_type_name_is_deterministic() {
        let entity = EntityDef::new("orders").column(
            EntityColumn::new("status", "enum").enum_values(vec!["open".into(), "closed".into()]),
        );
        let tables = EntityReader::read(&[entity]).unwrap();
        assert_eq!(
            tables[0].column("status").unwrap().enum_type_name.as_deref(),
            Some("orders_status_enum")
        );
    }

    #[test]
    fn enum_values_on_non_enum_column_is_rejected() {
        let entity = EntityDef::new("orders")
            .column(EntityColumn::new("status", "varchar").enum_values(vec!["open".into()]));
        let err = EntityReader::read(&[entity]).unwrap_err();
        assert!(matches!(err, Error::InvalidEntity { .. }));
    }
}
