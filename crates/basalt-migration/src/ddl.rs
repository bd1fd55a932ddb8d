//! Turns a [`SchemaDiff`] into an ordered list of DDL statements.
//!
//! Statement order exists to keep every intermediate state valid: enum
//! types and new tables come first so later statements can reference them;
//! drops of indexes/foreign keys precede column drops so nothing references
//! a column that's about to disappear; adds happen last.

use crate::diff::{ColumnChange, EnumTypeChange, PrimaryKeyChange, SchemaDiff, TableDiff};
use crate::schema::{ColumnSchema, Dialect, ForeignKeySchema, IndexSchema, TableSchema};

pub struct DdlGenerator {
    dialect: Dialect,
}

impl DdlGenerator {
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Generates the full statement list for a diff, in dependency-safe
    /// order. Returns `Vec::new()` for an empty diff.
    #[must_use]
    pub fn generate(&self, diff: &SchemaDiff) -> Vec<String> {
        let mut statements = Vec::new();

        for table in &diff.added_tables {
            statements.extend(self.create_table_statements(table));
        }

        for table_diff in &diff.modified_tables {
            statements.extend(self.table_diff_statements(table_diff));
        }

        for table in &diff.removed_tables {
            statements.push(format!("DROP TABLE {};", self.quote(table)));
        }

        statements
    }

    fn quote(&self, ident: &str) -> String {
        self.dialect.quote_ident(ident)
    }

    fn create_table_statements(&self, table: &TableSchema) -> Vec<String> {
        let mut statements = Vec::new();

        if self.dialect == Dialect::Postgres {
            for column in &table.columns {
                if let (Some(type_name), Some(values)) = (&column.enum_type_name, &column.enum_values) {
                    statements.push(self.create_enum_type(type_name, values));
                }
            }
        }

        let mut column_defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_definition(c))
            .collect();

        let pk_columns = table.primary_key_columns();
        if !pk_columns.is_empty() {
            let quoted: Vec<String> = pk_columns.iter().map(|c| self.quote(c)).collect();
            column_defs.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }

        statements.push(format!(
            "CREATE TABLE {} (\n  {}\n);",
            self.quote(&table.name),
            column_defs.join(",\n  ")
        ));

        for index in &table.indexes {
            statements.push(self.create_index_statement(&table.name, index));
        }
        for fk in &table.foreign_keys {
            statements.push(self.add_foreign_key_statement(&table.name, fk));
        }

        statements
    }

    fn table_diff_statements(&self, diff: &TableDiff) -> Vec<String> {
        let mut statements = Vec::new();

        if self.dialect == Dialect::Postgres {
            for change in &diff.enum_type_changes {
                statements.extend(self.enum_type_change_statements(change));
            }
        }

        // Drops before adds: indexes and FKs that reference a soon-to-be-dropped
        // column must go first.
        for index in &diff.removed_indexes {
            statements.push(self.drop_index_statement(&diff.name, index));
        }
        for fk in &diff.removed_foreign_keys {
            statements.push(self.drop_foreign_key_statement(&diff.name, fk));
        }

        if let Some(pk_change) = &diff.primary_key_change {
            statements.extend(self.primary_key_drop_statements(&diff.name, pk_change));
        }

        for column in &diff.added_columns {
            statements.push(format!(
                "ALTER TABLE {} ADD COLUMN {};",
                self.quote(&diff.name),
                self.column_definition(column)
            ));
        }

        for modification in &diff.modified_columns {
            statements.extend(self.modify_column_statements(&diff.name, modification));
        }

        for (old_name, new_name) in &diff.renamed_columns {
            statements.push(self.rename_column_statement(&diff.name, old_name, new_name));
        }

        if self.dialect == Dialect::MySql {
            for (column, after) in &diff.reordered_columns {
                statements.push(self.reorder_column_statement(&diff.name, column, after));
            }
        }

        for name in &diff.removed_columns {
            statements.push(format!(
                "ALTER TABLE {} DROP COLUMN {};",
                self.quote(&diff.name),
                self.quote(name)
            ));
        }

        if let Some(pk_change) = &diff.primary_key_change {
            if !pk_change.new_columns.is_empty() {
                statements.push(self.primary_key_add_statement(&diff.name, pk_change));
            }
        }

        for index in &diff.added_indexes {
            statements.push(self.create_index_statement(&diff.name, index));
        }
        for fk in &diff.added_foreign_keys {
            statements.push(self.add_foreign_key_statement(&diff.name, fk));
        }

        statements
    }

    fn column_definition(&self, column: &ColumnSchema) -> String {
        let mut parts = vec![self.quote(&column.name), self.sql_type(column)];
        if !column.nullable {
            parts.push("NOT NULL".to_string());
        }
        if let Some(expr) = &column.default_expression {
            parts.push(format!("DEFAULT {expr}"));
        } else if let Some(value) = &column.default_value {
            parts.push(format!("DEFAULT {value}"));
        }
        if column.auto_increment {
            parts.push(self.auto_increment_clause());
        }
        if let Some(expr) = &column.on_update_expression {
            parts.push(format!("ON UPDATE {expr}"));
        }
        parts.join(" ")
    }

    fn sql_type(&self, column: &ColumnSchema) -> String {
        if let Some(type_name) = &column.enum_type_name {
            return match self.dialect {
                Dialect::Postgres => type_name.clone(),
                Dialect::MySql => format!(
                    "ENUM({})",
                    column
                        .enum_values
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|v| format!("'{}'", v.replace('\'', "''")))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            };
        }

        let mut base = column.r#type.clone();
        if let Some(size) = column.size {
            base = if let Some(scale) = column.scale {
                format!("{base}({size},{scale})")
            } else {
                format!("{base}({size})")
            };
        }
        if column.unsigned && self.dialect == Dialect::MySql {
            base.push_str(" UNSIGNED");
        }
        base
    }

    fn auto_increment_clause(&self) -> String {
        match self.dialect {
            Dialect::MySql => "AUTO_INCREMENT".to_string(),
            Dialect::Postgres => "GENERATED BY DEFAULT AS IDENTITY".to_string(),
        }
    }

    fn create_enum_type(&self, type_name: &str, values: &[String]) -> String {
        let quoted: Vec<String> = values.iter().map(|v| format!("'{}'", v.replace('\'', "''"))).collect();
        format!("CREATE TYPE {} AS ENUM ({});", type_name, quoted.join(", "))
    }

    fn enum_type_change_statements(&self, change: &EnumTypeChange) -> Vec<String> {
        if change.recreate {
            // Values were removed or reordered; ALTER TYPE can't express
            // that, so the type is rebuilt. Safe only when no live row
            // still holds a dropped label — left to the operator to verify
            // before applying.
            vec![
                format!("DROP TYPE IF EXISTS {};", change.type_name),
                self.create_enum_type(&change.type_name, &change.new_values),
            ]
        } else {
            change.new_values[change.old_values.len()..]
                .iter()
                .map(|value| {
                    format!(
                        "ALTER TYPE {} ADD VALUE '{}';",
                        change.type_name,
                        value.replace('\'', "''")
                    )
                })
                .collect()
        }
    }

    fn modify_column_statements(&self, table: &str, modification: &crate::diff::ColumnModification) -> Vec<String> {
        match self.dialect {
            Dialect::MySql => {
                vec![format!(
                    "ALTER TABLE {} MODIFY COLUMN {};",
                    self.quote(table),
                    self.column_definition(&modification.target)
                )]
            }
            Dialect::Postgres => {
                // Ordered: type, then nullable, then default — each needs
                // its own ALTER COLUMN clause under Postgres.
                let mut statements = Vec::new();
                for change in &modification.changes {
                    match change {
                        ColumnChange::Type { .. } | ColumnChange::Size { .. } | ColumnChange::Scale { .. } => {
                            statements.push(format!(
                                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{};",
                                self.quote(table),
                                self.quote(&modification.name),
                                self.sql_type(&modification.target),
                                self.quote(&modification.name),
                                self.sql_type(&modification.target),
                            ));
                        }
                        _ => {}
                    }
                }
                for change in &modification.changes {
                    if let ColumnChange::Nullable { to, .. } = change {
                        let clause = if *to { "DROP NOT NULL" } else { "SET NOT NULL" };
                        statements.push(format!(
                            "ALTER TABLE {} ALTER COLUMN {} {};",
                            self.quote(table),
                            self.quote(&modification.name),
                            clause
                        ));
                    }
                }
                for change in &modification.changes {
                    if let ColumnChange::Default { to, .. } = change {
                        let stmt = match to {
                            Some(expr) => format!(
                                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
                                self.quote(table),
                                self.quote(&modification.name),
                                expr
                            ),
                            None => format!(
                                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
                                self.quote(table),
                                self.quote(&modification.name)
                            ),
                        };
                        statements.push(stmt);
                    }
                }
                statements
            }
        }
    }

    fn rename_column_statement(&self, table: &str, old_name: &str, new_name: &str) -> String {
        match self.dialect {
            Dialect::Postgres => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {};",
                self.quote(table),
                self.quote(old_name),
                self.quote(new_name)
            ),
            Dialect::MySql => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {};",
                self.quote(table),
                self.quote(old_name),
                self.quote(new_name)
            ),
        }
    }

    fn reorder_column_statement(&self, table: &str, column: &str, after: &str) -> String {
        let position = if after.is_empty() {
            "FIRST".to_string()
        } else {
            format!("AFTER {}", self.quote(after))
        };
        format!(
            "ALTER TABLE {} MODIFY COLUMN {} {};",
            self.quote(table),
            self.quote(column),
            position
        )
    }

    fn create_index_statement(&self, table: &str, index: &IndexSchema) -> String {
        let kind = if index.unique {
            "UNIQUE INDEX"
        } else if index.spatial {
            "SPATIAL INDEX"
        } else {
            "INDEX"
        };
        let columns: Vec<String> = index.columns.iter().map(|c| self.quote(c)).collect();
        format!(
            "CREATE {} {} ON {} ({});",
            kind,
            self.quote(&index.name),
            self.quote(table),
            columns.join(", ")
        )
    }

    fn drop_index_statement(&self, table: &str, index: &IndexSchema) -> String {
        match self.dialect {
            Dialect::MySql => format!("DROP INDEX {} ON {};", self.quote(&index.name), self.quote(table)),
            Dialect::Postgres => format!("DROP INDEX {};", self.quote(&index.name)),
        }
    }

    fn add_foreign_key_statement(&self, table: &str, fk: &ForeignKeySchema) -> String {
        let columns: Vec<String> = fk.columns.iter().map(|c| self.quote(c)).collect();
        let ref_columns: Vec<String> = fk.referenced_columns.iter().map(|c| self.quote(c)).collect();
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {};",
            self.quote(table),
            self.quote(&fk.name),
            columns.join(", "),
            self.quote(&fk.referenced_table),
            ref_columns.join(", "),
            fk.on_delete.as_sql(),
            fk.on_update.as_sql(),
        )
    }

    fn drop_foreign_key_statement(&self, table: &str, fk: &ForeignKeySchema) -> String {
        let keyword = match self.dialect {
            Dialect::MySql => "FOREIGN KEY",
            Dialect::Postgres => "CONSTRAINT",
        };
        format!(
            "ALTER TABLE {} DROP {} {};",
            self.quote(table),
            keyword,
            self.quote(&fk.name)
        )
    }

    fn primary_key_drop_statements(&self, table: &str, change: &PrimaryKeyChange) -> Vec<String> {
        if change.old_columns.is_empty() {
            return Vec::new();
        }
        match self.dialect {
            // MySQL loses AUTO_INCREMENT if the PK is dropped while a column
            // still declares it; strip it first, then drop, then the later
            // ADD COLUMN/MODIFY pass re-adds AUTO_INCREMENT on the new PK.
            Dialect::MySql => vec![format!("ALTER TABLE {} DROP PRIMARY KEY;", self.quote(table))],
            Dialect::Postgres => {
                let name = change
                    .old_constraint_name
                    .clone()
                    .unwrap_or_else(|| format!("{table}_pkey"));
                vec![format!(
                    "ALTER TABLE {} DROP CONSTRAINT {};",
                    self.quote(table),
                    self.quote(&name)
                )]
            }
        }
    }

    fn primary_key_add_statement(&self, table: &str, change: &PrimaryKeyChange) -> String {
        let columns: Vec<String> = change.new_columns.iter().map(|c| self.quote(c)).collect();
        match self.dialect {
            Dialect::MySql => format!(
                "ALTER TABLE {} ADD PRIMARY KEY ({});",
                self.quote(table),
                columns.join(", ")
            ),
            Dialect::Postgres => {
                let name = change
                    .new_constraint_name
                    .clone()
                    .unwrap_or_else(|| format!("{table}_pkey"));
                format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({});",
                    self.quote(table),
                    self.quote(&name),
                    columns.join(", ")
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{ColumnModification, TableDiff};

    #[test]
    fn create_table_emits_columns_and_primary_key() {
        let mut id = ColumnSchema::new("id", "int", 0);
        id.is_primary_key = true;
        id.auto_increment = true;
        let table = TableSchema {
            columns: vec![id, ColumnSchema::new("email", "varchar", 1)],
            ..TableSchema::new("users")
        };
        let generator = DdlGenerator::new(Dialect::MySql);
        let statements = generator.create_table_statements(&table);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("CREATE TABLE `users`"));
        assert!(statements[0].contains("AUTO_INCREMENT"));
        assert!(statements[0].contains("PRIMARY KEY (`id`)"));
    }

    #[test]
    fn added_columns_come_before_removed_columns() {
        let diff = TableDiff {
            name: "users".to_string(),
            added_columns: vec![ColumnSchema::new("phone", "varchar", 2)],
            removed_columns: vec!["fax".to_string()],
            ..TableDiff::default()
        };
        let generator = DdlGenerator::new(Dialect::MySql);
        let statements = generator.table_diff_statements(&diff);
        let add_pos = statements.iter().position(|s| s.contains("ADD COLUMN")).unwrap();
        let drop_pos = statements.iter().position(|s| s.contains("DROP COLUMN")).unwrap();
        assert!(add_pos < drop_pos);
    }

    #[test]
    fn mysql_modify_column_uses_single_statement() {
        let modification = ColumnModification {
            name: "age".to_string(),
            changes: vec![ColumnChange::Nullable { from: false, to: true }],
            target: {
                let mut c = ColumnSchema::new("age", "int", 0);
                c.nullable = true;
                c
            },
        };
        let diff = TableDiff {
            name: "users".to_string(),
            modified_columns: vec![modification],
            ..TableDiff::default()
        };
        let generator = DdlGenerator::new(Dialect::MySql);
        let statements = generator.table_diff_statements(&diff);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("MODIFY COLUMN"));
    }

    #[test]
    fn postgres_modify_column_splits_type_nullable_default() {
        let modification = ColumnModification {
            name: "age".to_string(),
            changes: vec![
                ColumnChange::Type { from: "smallint".to_string(), to: "int".to_string() },
                ColumnChange::Nullable { from: false, to: true },
                ColumnChange::Default { from: None, to: Some("0".to_string()) },
            ],
            target: ColumnSchema::new("age", "int", 0),
        };
        let diff = TableDiff {
            name: "users".to_string(),
            modified_columns: vec![modification],
            ..TableDiff::default()
        };
        let generator = DdlGenerator::new(Dialect::Postgres);
        let statements = generator.table_diff_statements(&diff);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains("TYPE"));
        assert!(statements[1].contains("DROP NOT NULL"));
        assert!(statements[2].contains("SET DEFAULT"));
    }

    #[test]
    fn mysql_primary_key_drop_precedes_add() {
        let diff = TableDiff {
            name: "users".to_string(),
            primary_key_change: Some(PrimaryKeyChange {
                old_constraint_name: None,
                old_columns: vec!["id".to_string()],
                new_constraint_name: None,
                new_columns: vec!["uuid".to_string()],
            }),
            ..TableDiff::default()
        };
        let generator = DdlGenerator::new(Dialect::MySql);
        let statements = generator.table_diff_statements(&diff);
        let drop_pos = statements.iter().position(|s| s.contains("DROP PRIMARY KEY")).unwrap();
        let add_pos = statements.iter().position(|s| s.contains("ADD PRIMARY KEY")).unwrap();
        assert!(drop_pos < add_pos);
    }

    #[test]
    fn enum_recreate_drops_before_creating() {
        let change = EnumTypeChange {
            type_name: "orders_status_enum".to_string(),
            old_values: vec!["open".to_string(), "closed".to_string()],
            new_values: vec!["open".to_string()],
            recreate: true,
        };
        let diff = TableDiff {
            name: "orders".to_string(),
            enum_type_changes: vec![change],
            ..TableDiff::default()
        };
        let generator = DdlGenerator::new(Dialect::Postgres);
        let statements = generator.table_diff_statements(&diff);
        assert!(statements[0].starts_with("DROP TYPE"));
        assert!(statements[1].starts_with("CREATE TYPE"));
    }

    #[test]
    fn enum_pure_append_emits_add_value_only() {
        let change = EnumTypeChange {
            type_name: "orders_status_enum".to_string(),
            old_values: vec!["open".to_string()],
            new_values: vec!["open".to_string(), "closed".to_string()],
            recreate: false,
        };
        let diff = TableDiff {
            name: "orders".to_string(),
            enum_type_changes: vec![change],
            ..TableDiff::default()
        };
        let generator = DdlGenerator::new(Dialect::Postgres);
        let statements = generator.table_diff_statements(&diff);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("ADD VALUE 'closed'"));
    }

    #[test]
    fn generated_create_table_parses_as_valid_sql() {
        use sqlparser::dialect::GenericDialect;
        use sqlparser::parser::Parser;

        let mut id = ColumnSchema::new("id", "int", 0);
        id.is_primary_key = true;
        let table = TableSchema {
            columns: vec![id, ColumnSchema::new("email", "varchar", 1)],
            ..TableSchema::new("users")
        };
        let generator = DdlGenerator::new(Dialect::Postgres);
        let statements = generator.create_table_statements(&table);

        let parsed = Parser::parse_sql(&GenericDialect {}, &statements[0]);
        assert!(parsed.is_ok(), "generated DDL should parse: {:?}", parsed.err());
    }

    #[test]
    fn drop_table_statement_quoted_per_dialect() {
        let diff = SchemaDiff {
            removed_tables: vec!["legacy".to_string()],
            ..SchemaDiff::default()
        };
        assert_eq!(
            DdlGenerator::new(Dialect::MySql).generate(&diff),
            vec!["DROP TABLE `legacy`;".to_string()]
        );
        assert_eq!(
            DdlGenerator::new(Dialect::Postgres).generate(&diff),
            vec!["DROP TABLE \"legacy\";".to_string()]
        );
    }
}
