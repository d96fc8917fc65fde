//! Schema synthesis: deterministic table/column naming and DDL emission.
//!
//! Derives the relational layout from model metadata and creates it on first
//! use. All naming is a pure function of entity/relationship names so that
//! reopening the same model reproduces identical table names.
//!
//! # Layout rules
//!
//! - One table per root entity (single-table inheritance): the table carries
//!   the union of the subtree's attribute columns, the to-one foreign-key
//!   columns, and an `entity_type` TEXT discriminator when the root has
//!   descendants. Columns are nullable by necessity: sibling subtypes leave
//!   each other's columns NULL; required-ness is enforced at bind time.
//! - One junction table per many-valued relationship without a direct
//!   foreign key, named `<canonical_table>_<canonical_relationship>_<other_table>`
//!   where the canonical side is whichever `(table, relationship)` pair sorts
//!   lexicographically first between the relationship and its inverse. A
//!   composite UNIQUE constraint covers the id pair.
//!
//! `ensure_schema` is idempotent. When a table already exists its columns
//! are compared against expectations; any missing column or declared-type
//! conflict fails with `SchemaMismatch`; existing columns are never altered.

use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Cardinality, Model, RelationshipDescriptor};

/// Discriminator column present on tables whose root entity has descendants.
pub const ENTITY_TYPE_COLUMN: &str = "entity_type";

/// Primary-key column present on every entity table.
pub const ID_COLUMN: &str = "id";

/// A junction table as seen from one side of a many-valued relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Junction {
    /// Deterministic junction table name (shared with the inverse side).
    pub table: String,
    /// Column holding the asking side's row identifier.
    pub owner_column: String,
    /// Column holding the target side's row identifier.
    pub target_column: String,
}

/// Derives and creates the relational schema for a model.
pub struct SchemaSynthesizer<'a> {
    model: &'a Model,
}

impl<'a> SchemaSynthesizer<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    /// Column name backing an attribute.
    pub fn attribute_column(name: &str) -> String {
        name.to_lowercase()
    }

    /// Foreign-key column backing a to-one relationship.
    pub fn fk_column(rel_name: &str) -> String {
        format!("{}_id", rel_name.to_lowercase())
    }

    /// The junction table implementing a many-valued relationship, seen from
    /// the owning side. `None` when the relationship is to-one or is
    /// materialized by its inverse's foreign-key column.
    pub fn junction(
        &self,
        entity: &str,
        rel: &RelationshipDescriptor,
    ) -> Result<Option<Junction>, StoreError> {
        if rel.cardinality != Cardinality::ToMany || self.model.fk_backing(rel)?.is_some() {
            return Ok(None);
        }

        let my_table = self.model.table_name(entity)?;
        let target_table = self.model.table_name(&rel.target)?;
        let mine = (my_table.clone(), rel.name.to_lowercase());
        let theirs = self
            .model
            .inverse_of(rel)?
            .map(|inv| (target_table.clone(), inv.name.to_lowercase()));

        let (mine_is_canonical, canonical, other_table) = match theirs {
            Some(theirs) if theirs < mine => (false, theirs, my_table),
            _ => (true, mine, target_table),
        };

        let table = format!("{}_{}_{}", canonical.0, canonical.1, other_table);
        let canonical_column = format!("{}_id", canonical.0);
        // Self-referencing junctions would otherwise name both columns alike.
        let other_column = if other_table == canonical.0 {
            format!("{}_related_id", other_table)
        } else {
            format!("{}_id", other_table)
        };

        let (owner_column, target_column) = if mine_is_canonical {
            (canonical_column, other_column)
        } else {
            (other_column, canonical_column)
        };
        Ok(Some(Junction {
            table,
            owner_column,
            target_column,
        }))
    }

    /// Expected columns for a root entity's table, in deterministic order:
    /// id, discriminator (when present), then the subtree's attribute and
    /// to-one foreign-key columns.
    pub fn table_columns(&self, root: &str) -> Result<Vec<(String, &'static str)>, StoreError> {
        let mut columns: Vec<(String, &'static str)> = vec![(ID_COLUMN.to_string(), "INTEGER")];
        if self.model.table_has_discriminator(root)? {
            columns.push((ENTITY_TYPE_COLUMN.to_string(), "TEXT"));
        }
        for name in self.model.subtree(root)? {
            let entity = self.model.entity(&name)?;
            for attr in &entity.attributes {
                let column = Self::attribute_column(&attr.name);
                if !columns.iter().any(|(c, _)| *c == column) {
                    columns.push((column, attr.attr_type.sqlite_type()));
                }
            }
            for rel in &entity.relationships {
                if rel.cardinality == Cardinality::ToOne {
                    let column = Self::fk_column(&rel.name);
                    if !columns.iter().any(|(c, _)| *c == column) {
                        columns.push((column, "INTEGER"));
                    }
                }
            }
        }
        Ok(columns)
    }

    /// Create every entity and junction table not yet present, verifying
    /// already-present tables against expectations. Idempotent.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), StoreError> {
        for entity in self.model.entities().filter(|e| e.parent.is_none()) {
            let table = self.model.table_name(&entity.name)?;
            let columns = self.table_columns(&entity.name)?;
            if table_exists(conn, &table)? {
                verify_columns(conn, &table, &columns)?;
            } else {
                self.create_entity_table(conn, &table, &columns)?;
            }
        }

        let mut created = std::collections::BTreeSet::new();
        for entity in self.model.entities() {
            for rel in &entity.relationships {
                let Some(junction) = self.junction(&entity.name, rel)? else {
                    continue;
                };
                if !created.insert(junction.table.clone()) {
                    continue;
                }
                // Both sides of an inverse pair derive the same table; the
                // column pair is normalized so verification is side-agnostic.
                let mut pair = [junction.owner_column.clone(), junction.target_column.clone()];
                pair.sort();
                let columns: Vec<(String, &'static str)> = vec![
                    (pair[0].clone(), "INTEGER"),
                    (pair[1].clone(), "INTEGER"),
                ];
                if table_exists(conn, &junction.table)? {
                    verify_columns(conn, &junction.table, &columns)?;
                } else {
                    self.create_junction_table(conn, &junction.table, &pair)?;
                }
            }
        }
        Ok(())
    }

    fn create_entity_table(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[(String, &'static str)],
    ) -> Result<(), StoreError> {
        let defs: Vec<String> = columns
            .iter()
            .map(|(name, sql_type)| {
                if name == ID_COLUMN {
                    format!("\"{name}\" INTEGER PRIMARY KEY")
                } else {
                    format!("\"{name}\" {sql_type}")
                }
            })
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            table,
            defs.join(", ")
        );
        debug!(%table, "synthesizing entity table");
        execute_ddl(conn, &sql)?;

        for (name, _) in columns {
            if name.ends_with("_id") || name == ENTITY_TYPE_COLUMN {
                let index_sql = format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{table}_{name}\" ON \"{table}\" (\"{name}\")"
                );
                execute_ddl(conn, &index_sql)?;
            }
        }
        Ok(())
    }

    fn create_junction_table(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[String; 2],
    ) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (\"{a}\" INTEGER NOT NULL, \"{b}\" INTEGER NOT NULL, UNIQUE (\"{a}\", \"{b}\"))",
            a = columns[0],
            b = columns[1],
        );
        debug!(%table, "synthesizing junction table");
        execute_ddl(conn, &sql)?;
        for column in columns {
            let index_sql = format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{table}_{column}\" ON \"{table}\" (\"{column}\")"
            );
            execute_ddl(conn, &index_sql)?;
        }
        Ok(())
    }
}

fn execute_ddl(conn: &Connection, sql: &str) -> Result<(), StoreError> {
    conn.execute(sql, []).map_err(|e| StoreError::SchemaMismatch {
        message: format!("DDL failed ({sql}): {e}"),
    })?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let count: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::SchemaMismatch {
            message: e.to_string(),
        })?;
    Ok(count > 0)
}

/// Compare an existing table's columns against expectations.
///
/// Missing columns and declared-type conflicts fail; surplus columns are
/// tolerated as best-effort forward compatibility.
fn verify_columns(
    conn: &Connection,
    table: &str,
    expected: &[(String, &'static str)],
) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .map_err(|e| StoreError::SchemaMismatch {
            message: e.to_string(),
        })?;
    let on_disk: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .and_then(|rows| rows.collect())
        .map_err(|e| StoreError::SchemaMismatch {
            message: e.to_string(),
        })?;

    for (name, sql_type) in expected {
        match on_disk.iter().find(|(n, _)| n == name) {
            None => {
                return Err(StoreError::SchemaMismatch {
                    message: format!("table '{table}' is missing column '{name}'"),
                });
            }
            Some((_, actual)) if !actual.eq_ignore_ascii_case(sql_type) => {
                return Err(StoreError::SchemaMismatch {
                    message: format!(
                        "table '{table}' column '{name}' has type {actual}, expected {sql_type}"
                    ),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}
