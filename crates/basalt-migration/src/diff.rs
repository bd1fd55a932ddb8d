//! Compares declared ([`crate::entity::EntityReader`]) against live
//! ([`crate::catalog::DbReader`]) schemas and produces a [`SchemaDiff`] that
//! [`crate::ddl::DdlGenerator`] turns into ordered DDL statements.

use std::collections::HashSet;

use console::style;
use dialoguer::{theme::ColorfulTheme, Select};

use crate::error::Result;
use crate::schema::{
    normalize_default_expression, normalize_type_alias, ColumnSchema, Dialect, ForeignKeySchema,
    IndexSchema, TableSchema,
};

/// Resolves column-rename ambiguity: a table lost column `removed` and
/// gained one or more candidate columns in the same pass; the resolver
/// decides whether one of the candidates is actually the same column
/// renamed, or whether this is a genuine drop-and-add.
pub trait RenameResolver {
    fn resolve_column_rename(&self, table: &str, removed: &str, candidates: &[String]) -> Option<String>;
}

/// Prompts on stdout/stdin via `dialoguer`. A single candidate is a yes/no
/// prompt; multiple candidates become a numbered choice with an explicit
/// "none of these" (index 0) option.
pub struct InteractiveResolver;

impl RenameResolver for InteractiveResolver {
    fn resolve_column_rename(&self, table: &str, removed: &str, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut items: Vec<String> = vec![format!("{}", style("none of these — drop and add separately").dim())];
        items.extend(candidates.iter().cloned());
        let prompt = format!(
            "table `{table}`: column `{removed}` was removed — did it become one of these?"
        );
        let choice = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .items(&items)
            .default(0)
            .interact_opt()
            .ok()
            .flatten();
        match choice {
            Some(0) | None => None,
            Some(i) => candidates.get(i - 1).cloned(),
        }
    }
}

/// Never resolves a rename — every ambiguity becomes a drop-and-add. Used
/// in non-interactive contexts (CI, scripted migration generation).
pub struct NullResolver;

impl RenameResolver for NullResolver {
    fn resolve_column_rename(&self, _table: &str, _removed: &str, _candidates: &[String]) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnChange {
    Type { from: String, to: String },
    Size { from: Option<u32>, to: Option<u32> },
    Scale { from: Option<u32>, to: Option<u32> },
    Unsigned { from: bool, to: bool },
    Nullable { from: bool, to: bool },
    Default { from: Option<String>, to: Option<String> },
    AutoIncrement { from: bool, to: bool },
    OnUpdate { from: Option<String>, to: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnModification {
    pub name: String,
    pub changes: Vec<ColumnChange>,
    /// The full target column, so the generator can emit a single
    /// `MODIFY`/`ALTER COLUMN` statement set instead of reconstructing it.
    pub target: ColumnSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyChange {
    pub old_constraint_name: Option<String>,
    pub old_columns: Vec<String>,
    pub new_constraint_name: Option<String>,
    pub new_columns: Vec<String>,
}

/// PostgreSQL only: an enum type that needs to be created, or have values
/// appended. A value *removal* or reordering can't be expressed as
/// `ALTER TYPE ... ADD VALUE`, so it's surfaced as `recreate` and the
/// generator drops and recreates the type (only safe when no column still
/// depends on the removed label; the generator filters these out rather
/// than emit a statement that would fail against live data).
#[derive(Debug, Clone, PartialEq)]
pub struct EnumTypeChange {
    pub type_name: String,
    pub old_values: Vec<String>,
    pub new_values: Vec<String>,
    pub recreate: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableDiff {
    pub name: String,
    pub added_columns: Vec<ColumnSchema>,
    pub removed_columns: Vec<String>,
    /// (old name, new name) — resolved separately from added/removed so the
    /// generator emits a `RENAME COLUMN` instead of drop+add.
    pub renamed_columns: Vec<(String, String)>,
    pub modified_columns: Vec<ColumnModification>,
    /// MySQL only: (column, after_column) pairs for `MODIFY ... AFTER`.
    pub reordered_columns: Vec<(String, String)>,
    pub added_indexes: Vec<IndexSchema>,
    pub removed_indexes: Vec<IndexSchema>,
    pub added_foreign_keys: Vec<ForeignKeySchema>,
    pub removed_foreign_keys: Vec<ForeignKeySchema>,
    pub primary_key_change: Option<PrimaryKeyChange>,
    pub enum_type_changes: Vec<EnumTypeChange>,
}

impl TableDiff {
    fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.renamed_columns.is_empty()
            && self.modified_columns.is_empty()
            && self.reordered_columns.is_empty()
            && self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
            && self.added_foreign_keys.is_empty()
            && self.removed_foreign_keys.is_empty()
            && self.primary_key_change.is_none()
            && self.enum_type_changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaDiff {
    pub added_tables: Vec<TableSchema>,
    pub removed_tables: Vec<String>,
    pub modified_tables: Vec<TableDiff>,
}

impl SchemaDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty() && self.removed_tables.is_empty() && self.modified_tables.is_empty()
    }
}

/// Compares declared entity schemas against a live database read and
/// produces the ordered diff [`crate::ddl::DdlGenerator`] consumes.
pub fn compare_schemas(
    entity: &[TableSchema],
    db: &[TableSchema],
    dialect: Dialect,
    resolver: &dyn RenameResolver,
) -> Result<SchemaDiff> {
    let mut diff = SchemaDiff::default();

    let entity_names: HashSet<&str> = entity.iter().map(|t| t.name.as_str()).collect();
    let db_names: HashSet<&str> = db.iter().map(|t| t.name.as_str()).collect();

    for table in entity {
        if !db_names.contains(table.name.as_str()) {
            diff.added_tables.push(table.clone());
        }
    }
    for table in db {
        if !entity_names.contains(table.name.as_str()) {
            diff.removed_tables.push(table.name.clone());
        }
    }

    for entity_table in entity {
        let Some(db_table) = db.iter().find(|t| t.name == entity_table.name) else {
            continue;
        };
        let table_diff = compare_table(entity_table, db_table, dialect, resolver);
        if !table_diff.is_empty() {
            diff.modified_tables.push(table_diff);
        }
    }

    Ok(diff)
}

fn compare_table(
    entity: &TableSchema,
    db: &TableSchema,
    dialect: Dialect,
    resolver: &dyn RenameResolver,
) -> TableDiff {
    let mut table_diff = TableDiff {
        name: entity.name.clone(),
        ..TableDiff::default()
    };

    let entity_col_names: HashSet<&str> = entity.columns.iter().map(|c| c.name.as_str()).collect();
    let db_col_names: HashSet<&str> = db.columns.iter().map(|c| c.name.as_str()).collect();

    let mut added: Vec<String> = entity
        .columns
        .iter()
        .map(|c| c.name.clone())
        .filter(|n| !db_col_names.contains(n.as_str()))
        .collect();
    let mut removed: Vec<String> = db
        .columns
        .iter()
        .map(|c| c.name.clone())
        .filter(|n| !entity_col_names.contains(n.as_str()))
        .collect();

    // Resolve renames before treating the rest as real adds/drops.
    for removed_name in removed.clone() {
        if added.is_empty() {
            break;
        }
        if let Some(new_name) = resolver.resolve_column_rename(&entity.name, &removed_name, &added) {
            table_diff.renamed_columns.push((removed_name.clone(), new_name.clone()));
            removed.retain(|n| n != &removed_name);
            added.retain(|n| n != &new_name);
        }
    }

    for name in &added {
        if let Some(col) = entity.column(name) {
            table_diff.added_columns.push(col.clone());
        }
    }
    table_diff.removed_columns = removed;

    // Columns present on both sides: compare for modification. Renamed
    // columns compare under their new (entity-side) name.
    let renamed_old: HashSet<&str> = table_diff
        .renamed_columns
        .iter()
        .map(|(old, _)| old.as_str())
        .collect();
    for db_col in &db.columns {
        if renamed_old.contains(db_col.name.as_str()) {
            continue;
        }
        let Some(entity_col) = entity.column(&db_col.name) else {
            continue;
        };
        if let Some(modification) = compare_column(entity_col, db_col) {
            table_diff.modified_columns.push(modification);
        }
    }
    for (old_name, new_name) in table_diff.renamed_columns.clone() {
        if let (Some(entity_col), Some(db_col)) = (entity.column(&new_name), db.column(&old_name)) {
            if let Some(mut modification) = compare_column(entity_col, db_col) {
                modification.name = new_name.clone();
                table_diff.modified_columns.push(modification);
            }
        }
    }

    if dialect == Dialect::MySql {
        table_diff.reordered_columns = detect_column_reorder(entity, db);
    }

    let (added_idx, removed_idx) = diff_by_structural_key(&entity.indexes, &db.indexes, IndexSchema::structural_key);
    table_diff.added_indexes = added_idx;
    table_diff.removed_indexes = removed_idx;

    let (added_fk, removed_fk) =
        diff_by_structural_key(&entity.foreign_keys, &db.foreign_keys, ForeignKeySchema::match_key);
    table_diff.added_foreign_keys = added_fk;
    table_diff.removed_foreign_keys = removed_fk;

    table_diff.primary_key_change = compare_primary_key(entity, db, &table_diff.renamed_columns);

    if dialect == Dialect::Postgres {
        table_diff.enum_type_changes = detect_enum_type_changes(entity, db);
    }

    table_diff
}

fn diff_by_structural_key<T: Clone>(
    entity_items: &[T],
    db_items: &[T],
    key_fn: impl Fn(&T) -> String,
) -> (Vec<T>, Vec<T>) {
    let entity_keys: HashSet<String> = entity_items.iter().map(&key_fn).collect();
    let db_keys: HashSet<String> = db_items.iter().map(&key_fn).collect();

    let added = entity_items
        .iter()
        .filter(|item| !db_keys.contains(&key_fn(item)))
        .cloned()
        .collect();
    let removed = db_items
        .iter()
        .filter(|item| !entity_keys.contains(&key_fn(item)))
        .cloned()
        .collect();
    (added, removed)
}

fn compare_column(entity: &ColumnSchema, db: &ColumnSchema) -> Option<ColumnModification> {
    let mut changes = Vec::new();

    let entity_type = normalize_type_alias(&entity.r#type);
    let db_type = normalize_type_alias(&db.r#type);
    if entity_type != db_type {
        changes.push(ColumnChange::Type {
            from: db_type.to_string(),
            to: entity_type.to_string(),
        });
    }
    if entity.size != db.size {
        changes.push(ColumnChange::Size { from: db.size, to: entity.size });
    }
    if entity.scale != db.scale {
        changes.push(ColumnChange::Scale { from: db.scale, to: entity.scale });
    }
    if entity.unsigned != db.unsigned {
        changes.push(ColumnChange::Unsigned { from: db.unsigned, to: entity.unsigned });
    }
    if entity.nullable != db.nullable {
        changes.push(ColumnChange::Nullable { from: db.nullable, to: entity.nullable });
    }

    // Auto-increment columns are exempt from default comparison: a live
    // auto-increment column never reports the entity's declared default
    // (it has none), so this would otherwise always look like a change.
    // If the entity declares no default at all, skip the comparison rather
    // than treat that as "drop the default" — the entity reader doesn't
    // materialize literal defaults, so absence here is "unknown", not "none".
    if !entity.auto_increment && !db.auto_increment {
        let entity_default = entity
            .default_expression
            .as_deref()
            .or(entity.default_value.as_deref())
            .map(normalize_default_expression);
        if let Some(entity_default) = entity_default {
            let db_default = db
                .default_value
                .as_deref()
                .or(db.default_expression.as_deref())
                .map(normalize_default_expression);
            if Some(&entity_default) != db_default.as_ref() {
                changes.push(ColumnChange::Default {
                    from: db_default,
                    to: Some(entity_default),
                });
            }
        }
    }

    if entity.auto_increment != db.auto_increment {
        changes.push(ColumnChange::AutoIncrement {
            from: db.auto_increment,
            to: entity.auto_increment,
        });
    }

    let entity_on_update = entity.on_update_expression.as_deref().map(normalize_default_expression);
    let db_on_update = db.on_update_expression.as_deref().map(normalize_default_expression);
    if entity_on_update != db_on_update {
        changes.push(ColumnChange::OnUpdate {
            from: db_on_update,
            to: entity_on_update,
        });
    }

    if changes.is_empty() {
        None
    } else {
        Some(ColumnModification {
            name: entity.name.clone(),
            changes,
            target: entity.clone(),
        })
    }
}

/// MySQL-only: detects a prefix of columns whose declared order no longer
/// matches the live order. Per the distilled spec, the first mismatch and
/// everything after it are emitted as `MODIFY ... AFTER`.
fn detect_column_reorder(entity: &TableSchema, db: &TableSchema) -> Vec<(String, String)> {
    let shared: Vec<&str> = entity
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|n| db.columns.iter().any(|c| c.name == *n))
        .collect();
    let db_shared: Vec<&str> = db
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|n| shared.contains(n))
        .collect();

    let first_mismatch = shared.iter().zip(db_shared.iter()).position(|(a, b)| a != b);
    let Some(start) = first_mismatch else {
        return Vec::new();
    };

    shared[start..]
        .iter()
        .enumerate()
        .map(|(offset, name)| {
            let after = if start + offset == 0 {
                String::new()
            } else {
                shared[start + offset - 1].to_string()
            };
            (name.to_string(), after)
        })
        .collect()
}

fn compare_primary_key(
    entity: &TableSchema,
    db: &TableSchema,
    renamed: &[(String, String)],
) -> Option<PrimaryKeyChange> {
    let db_pk: Vec<String> = db
        .primary_key_columns()
        .into_iter()
        .map(|c| {
            renamed
                .iter()
                .find(|(old, _)| old == c)
                .map(|(_, new)| new.clone())
                .unwrap_or_else(|| c.to_string())
        })
        .collect();
    let entity_pk: Vec<String> = entity.primary_key_columns().into_iter().map(str::to_string).collect();

    if db_pk == entity_pk {
        return None;
    }

    Some(PrimaryKeyChange {
        old_constraint_name: db.primary_key_constraint_name.clone(),
        old_columns: db.primary_key_columns().into_iter().map(str::to_string).collect(),
        new_constraint_name: entity.primary_key_constraint_name.clone(),
        new_columns: entity_pk,
    })
}

fn detect_enum_type_changes(entity: &TableSchema, db: &TableSchema) -> Vec<EnumTypeChange> {
    let mut changes = Vec::new();
    for entity_col in &entity.columns {
        let Some(new_values) = &entity_col.enum_values else {
            continue;
        };
        let Some(type_name) = &entity_col.enum_type_name else {
            continue;
        };
        let db_col = db.column(&entity_col.name);
        let old_values = db_col.and_then(|c| c.enum_values.clone()).unwrap_or_default();
        if &old_values == new_values {
            continue;
        }
        // A pure append (same prefix) can use ADD VALUE; anything else
        // (removal, reorder) requires recreating the type.
        let is_pure_append = new_values.starts_with(&old_values) && old_values.len() < new_values.len();
        changes.push(EnumTypeChange {
            type_name: type_name.clone(),
            old_values,
            new_values: new_values.clone(),
            recreate: !is_pure_append,
        });
    }
    changes
}
