//! Canonical schema data model shared by [`crate::entity`] (declared schema),
//! [`crate::catalog`] (live database schema) and [`crate::diff`] (the
//! comparison between the two).
//!
//! Both readers normalize into the same [`TableSchema`]/[`ColumnSchema`]
//! shape so the comparator never has to know which side of the diff a given
//! table came from.

use serde::{Deserialize, Serialize};

/// `mysql` or `postgres` — drives catalog queries, quoting, and DDL shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    MySql,
    Postgres,
}

impl Dialect {
    /// Quotes an identifier (table, column, index, constraint or type name)
    /// for this dialect: backticks for MySQL, double quotes for PostgreSQL.
    /// Embedded quote characters are doubled, matching each dialect's own
    /// escaping rule.
    #[must_use]
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }
}

/// A single column, canonicalized from either declared entity metadata or a
/// live catalog read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Lowercase canonical type name (e.g. `varchar`, `int`, `timestamp`).
    pub r#type: String,
    pub size: Option<u32>,
    pub scale: Option<u32>,
    /// MySQL only; always `false` under PostgreSQL.
    pub unsigned: bool,
    pub nullable: bool,
    pub auto_increment: bool,
    pub is_primary_key: bool,
    /// A materialized literal default, when known.
    pub default_value: Option<String>,
    /// A default expression (e.g. `NOW()`), as opposed to a literal value.
    /// The entity reader only ever populates this field, never
    /// `default_value` — see [`crate::entity::EntityReader`].
    pub default_expression: Option<String>,
    pub on_update_expression: Option<String>,
    /// Declaration-order enum labels, for `enum` columns.
    pub enum_values: Option<Vec<String>>,
    /// PostgreSQL only: the generated enum type name (`CREATE TYPE` target).
    pub enum_type_name: Option<String>,
    /// PostgreSQL only: `true` for `GENERATED ... AS IDENTITY`, `false` for
    /// a classic `SERIAL`/sequence-default column.
    pub is_identity: Option<bool>,
    /// PostgreSQL only: the backing sequence name, when known.
    pub sequence_name: Option<String>,
    /// Declaration order (entity) or ordinal position (catalog read).
    pub ordinal_position: u32,
}

impl ColumnSchema {
    /// A column with every optional field unset, for terse test fixtures and
    /// as a starting point for entity/catalog readers to fill in.
    #[must_use]
    pub fn new(name: impl Into<String>, r#type: impl Into<String>, ordinal_position: u32) -> Self {
        Self {
            name: name.into(),
            r#type: r#type.into(),
            size: None,
            scale: None,
            unsigned: false,
            nullable: false,
            auto_increment: false,
            is_primary_key: false,
            default_value: None,
            default_expression: None,
            on_update_expression: None,
            enum_values: None,
            enum_type_name: None,
            is_identity: None,
            sequence_name: None,
            ordinal_position,
        }
    }
}

/// An index, deduplicated by `(sorted columns, unique, spatial)` — the same
/// structural key the comparator matches on across entity and DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub spatial: bool,
}

impl IndexSchema {
    /// The structural key used for add/drop matching: name is deliberately
    /// excluded, since a rename-only index is not a material change.
    #[must_use]
    pub fn structural_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.columns.join(","),
            self.unique,
            self.spatial
        )
    }
}

/// A referential action, normalized so `NO ACTION` and `RESTRICT` compare
/// equal (distilled spec section 4.9, FK structural key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    NoAction,
}

impl ReferentialAction {
    /// Collapses `NoAction` into `Restrict` for structural-key comparison.
    #[must_use]
    fn normalized(self) -> Self {
        match self {
            ReferentialAction::NoAction => ReferentialAction::Restrict,
            other => other,
        }
    }

    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl ForeignKeySchema {
    #[must_use]
    pub fn structural_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{:?}:{:?}",
            self.columns.join(","),
            self.referenced_table,
            self.referenced_columns.join(","),
            self.name, // name participates only to disambiguate otherwise-identical multi-FK cases, not as the primary match key
            self.on_delete.normalized(),
            self.on_update.normalized(),
        )
    }

    /// The match key the comparator actually uses: everything but the FK's
    /// own name, since FKs match structurally, not by name.
    #[must_use]
    pub fn match_key(&self) -> String {
        format!(
            "{}:{}:{}:{:?}:{:?}",
            self.columns.join(","),
            self.referenced_table,
            self.referenced_columns.join(","),
            self.on_delete.normalized(),
            self.on_update.normalized(),
        )
    }
}

/// A canonical table, as produced by either [`crate::entity::EntityReader`]
/// or [`crate::catalog::DbReader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
    pub foreign_keys: Vec<ForeignKeySchema>,
    pub primary_key_constraint_name: Option<String>,
    /// Columns the reader deliberately could not canonicalize (unsupported
    /// type, etc); carried through so a diff never silently drops them.
    pub skipped_columns: Option<Vec<String>>,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            primary_key_constraint_name: None,
            skipped_columns: None,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// `true` for catalog/internal tables (`_`-prefixed), excluded from
    /// schema diffing entirely.
    #[must_use]
    pub fn is_internal(name: &str) -> bool {
        name.starts_with('_')
    }
}

/// Normalizes a declared or read column type to the alias set the comparator
/// treats as equivalent (distilled spec section 4.9: `integer` -> `int`,
/// `numeric` -> `decimal`).
#[must_use]
pub fn normalize_type_alias(type_name: &str) -> &str {
    match type_name {
        "integer" => "int",
        "numeric" => "decimal",
        other => other,
    }
}

/// Normalizes a default expression so `NOW()` and `CURRENT_TIMESTAMP()`
/// compare equal regardless of casing or the trailing-parens convention a
/// particular dialect uses.
#[must_use]
pub fn normalize_default_expression(expr: &str) -> String {
    let upper = expr.trim().to_uppercase();
    match upper.as_str() {
        "NOW()" | "CURRENT_TIMESTAMP" | "CURRENT_TIMESTAMP()" => "CURRENT_TIMESTAMP".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_matches_dialect() {
        assert_eq!(Dialect::MySql.quote_ident("orders"), "`orders`");
        assert_eq!(Dialect::Postgres.quote_ident("orders"), "\"orders\"");
    }

    #[test]
    fn quote_ident_escapes_embedded_quote() {
        assert_eq!(Dialect::MySql.quote_ident("a`b"), "`a``b`");
        assert_eq!(Dialect::Postgres.quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn index_structural_key_ignores_name() {
        let a = IndexSchema {
            name: "idx_a".to_string(),
            columns: vec!["email".to_string()],
            unique: true,
            spatial: false,
        };
        let b = IndexSchema {
            name: "idx_b".to_string(),
            columns: vec!["email".to_string()],
            unique: true,
            spatial: false,
        };
        assert_eq!(a.structural_key(), b.structural_key());
    }

    #[test]
    fn fk_match_key_normalizes_no_action_to_restrict() {
        let fk_no_action = ForeignKeySchema {
            name: "fk_a".to_string(),
            columns: vec!["user_id".to_string()],
            referenced_table: "users".to_string(),
            referenced_columns: vec!["id".to_string()],
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::Restrict,
        };
        let fk_restrict = ForeignKeySchema {
            name: "fk_b".to_string(),
            on_delete: ReferentialAction::Restrict,
            ..fk_no_action.clone()
        };
        assert_eq!(fk_no_action.match_key(), fk_restrict.match_key());
    }

    #[test]
    fn type_alias_normalization() {
        assert_eq!(normalize_type_alias("integer"), "int");
        assert_eq!(normalize_type_alias("numeric"), "decimal");
        assert_eq!(normalize_type_alias("varchar"), "varchar");
    }

    #[test]
    fn default_expression_normalization_treats_now_variants_as_equal() {
        assert_eq!(normalize_default_expression("NOW()"), normalize_default_expression("CURRENT_TIMESTAMP()"));
        assert_eq!(normalize_default_expression("current_timestamp"), "CURRENT_TIMESTAMP");
    }

    #[test]
    fn internal_table_detection() {
        assert!(TableSchema::is_internal("_migrations"));
        assert!(!TableSchema::is_internal("orders"));
    }
}
