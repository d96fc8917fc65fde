//! The change applier: inserts, updates, and deletions executed inside one
//! transaction per call.
//!
//! Row identifiers are allocated at insert time as the table's current
//! maximum plus one (1 for an empty table). Deletions walk each
//! relationship's delete rule before the row is removed: `Deny` aborts,
//! `Cascade` deletes dependents transitively (cycle-safe via a visited set),
//! `Nullify` clears opposite foreign keys, and every rule clears the deleted
//! row's own junction entries so no dangling junction rows survive.
//!
//! The transaction is all-or-nothing: any failure rolls back the whole call
//! and the returned error identifies the failing record.

use std::collections::{BTreeMap, HashSet};

use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::compiler::SqlCompiler;
use crate::error::StoreError;
use crate::model::{Cardinality, DeleteRule, Model, RelationshipDescriptor, RowId};
use crate::schema::{SchemaSynthesizer, ENTITY_TYPE_COLUMN, ID_COLUMN};
use crate::value::{bind, Value};

/// Reference to one typed record: entity name plus row identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub entity: String,
    pub id: RowId,
}

impl RecordRef {
    pub fn new(entity: impl Into<String>, id: RowId) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

/// A record to insert: attribute values, to-one references, and the initial
/// membership of to-many relationships.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub entity: String,
    /// Pre-allocated identifier (from `new_row_id`); allocated automatically
    /// when absent.
    pub id: Option<RowId>,
    pub values: BTreeMap<String, Value>,
    pub to_one: BTreeMap<String, Option<RowId>>,
    pub to_many: BTreeMap<String, Vec<RowId>>,
}

impl NewRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: RowId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_value(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.values.insert(attribute.into(), value);
        self
    }

    pub fn with_to_one(mut self, relationship: impl Into<String>, target: Option<RowId>) -> Self {
        self.to_one.insert(relationship.into(), target);
        self
    }

    pub fn with_to_many(mut self, relationship: impl Into<String>, targets: Vec<RowId>) -> Self {
        self.to_many.insert(relationship.into(), targets);
        self
    }
}

/// Additions and removals for one to-many relationship of one record.
#[derive(Debug, Clone, Default)]
pub struct ToManyChange {
    pub add: Vec<RowId>,
    pub remove: Vec<RowId>,
}

/// An update: only the listed attributes and relationships change.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub entity: String,
    pub id: RowId,
    pub values: BTreeMap<String, Value>,
    pub to_one: BTreeMap<String, Option<RowId>>,
    pub to_many: BTreeMap<String, ToManyChange>,
}

impl RecordUpdate {
    pub fn new(entity: impl Into<String>, id: RowId) -> Self {
        Self {
            entity: entity.into(),
            id,
            values: BTreeMap::new(),
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
        }
    }

    pub fn set_value(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.values.insert(attribute.into(), value);
        self
    }

    pub fn set_to_one(mut self, relationship: impl Into<String>, target: Option<RowId>) -> Self {
        self.to_one.insert(relationship.into(), target);
        self
    }

    pub fn link(mut self, relationship: impl Into<String>, target: RowId) -> Self {
        self.to_many
            .entry(relationship.into())
            .or_default()
            .add
            .push(target);
        self
    }

    pub fn unlink(mut self, relationship: impl Into<String>, target: RowId) -> Self {
        self.to_many
            .entry(relationship.into())
            .or_default()
            .remove
            .push(target);
        self
    }
}

/// One save-changes call: insertions, updates, deletions.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub insertions: Vec<NewRecord>,
    pub updates: Vec<RecordUpdate>,
    pub deletions: Vec<RecordRef>,
}

/// Outcome of a successful save: the references of inserted records, in
/// request order.
#[derive(Debug, Clone, Default)]
pub struct SaveResult {
    pub inserted: Vec<RecordRef>,
}

/// Applies save requests against an open connection.
pub struct ChangeApplier<'a> {
    model: &'a Model,
    schema: SchemaSynthesizer<'a>,
    compiler: SqlCompiler<'a>,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            schema: SchemaSynthesizer::new(model),
            compiler: SqlCompiler::new(model),
        }
    }

    /// Execute the whole request inside one transaction; rolled back in full
    /// on any failure.
    pub fn apply(
        &self,
        conn: &mut Connection,
        request: &SaveRequest,
    ) -> Result<SaveResult, StoreError> {
        let tx = conn.transaction().map_err(step_err)?;
        match self.apply_in_tx(&tx, request) {
            Ok(result) => {
                tx.commit().map_err(step_err)?;
                Ok(result)
            }
            Err(err) => {
                // Dropping the transaction rolls back; make it explicit.
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    fn apply_in_tx(
        &self,
        tx: &Connection,
        request: &SaveRequest,
    ) -> Result<SaveResult, StoreError> {
        let mut result = SaveResult::default();
        for record in &request.insertions {
            result.inserted.push(self.insert(tx, record)?);
        }
        for update in &request.updates {
            self.update(tx, update)
                .map_err(|e| e.for_record(&update.entity, update.id.0))?;
        }
        let mut visited = HashSet::new();
        for deletion in &request.deletions {
            self.delete(tx, &deletion.entity, deletion.id, &mut visited)?;
        }
        Ok(result)
    }

    /// Next row identifier for an entity's table: current max plus one.
    pub fn next_row_id(&self, conn: &Connection, entity: &str) -> Result<RowId, StoreError> {
        let table = self.model.table_name(entity)?;
        let raw: i64 = conn
            .query_row(
                &format!("SELECT COALESCE(MAX(\"{ID_COLUMN}\"), 0) + 1 FROM \"{table}\""),
                [],
                |row| row.get(0),
            )
            .map_err(step_err)?;
        Ok(RowId(raw))
    }

    fn insert(&self, tx: &Connection, record: &NewRecord) -> Result<RecordRef, StoreError> {
        let entity = self.model.entity(&record.entity)?;
        let table = self.model.table_name(&entity.name)?;
        let id = match record.id {
            Some(id) => id,
            None => self.next_row_id(tx, &entity.name)?,
        };
        let wrap = |e: StoreError| e.for_record(&entity.name, id.0);

        let mut columns: Vec<String> = vec![ID_COLUMN.to_string()];
        let mut bindings: Vec<Value> = vec![Value::Integer(id.0)];
        if self.model.table_has_discriminator(&entity.name)? {
            columns.push(ENTITY_TYPE_COLUMN.to_string());
            bindings.push(Value::String(entity.name.clone()));
        }

        for (name, value) in &record.values {
            let attr = self.model.attribute(&entity.name, name).map_err(wrap)?;
            columns.push(SchemaSynthesizer::attribute_column(name));
            bindings.push(bind(value, attr).map_err(wrap)?);
        }
        // Defaults for attributes the record leaves unset.
        for attr in self.model.chain_attributes(&entity.name)? {
            if record.values.contains_key(&attr.name) {
                continue;
            }
            if let Some(default) = &attr.default {
                columns.push(SchemaSynthesizer::attribute_column(&attr.name));
                bindings.push(bind(default, attr).map_err(wrap)?);
            }
        }

        for (name, target) in &record.to_one {
            let rel = self.to_one_relationship(&entity.name, name).map_err(wrap)?;
            columns.push(SchemaSynthesizer::fk_column(&rel.name));
            bindings.push(match target {
                Some(target) => Value::Integer(target.0),
                None => Value::Null,
            });
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let column_list: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let sql = format!(
            "INSERT INTO \"{table}\" ({}) VALUES ({placeholders})",
            column_list.join(", ")
        );
        debug!(entity = %entity.name, id = id.0, "inserting record");
        tx.execute(&sql, params_from_iter(bindings.iter()))
            .map_err(step_err)
            .map_err(wrap)?;

        for (name, targets) in &record.to_many {
            let rel = self.to_many_relationship(&entity.name, name).map_err(wrap)?;
            for target in targets {
                self.link_to_many(tx, &entity.name, id, rel, *target)
                    .map_err(wrap)?;
            }
        }
        Ok(RecordRef::new(entity.name.clone(), id))
    }

    fn update(&self, tx: &Connection, update: &RecordUpdate) -> Result<(), StoreError> {
        let entity = self.model.entity(&update.entity)?;
        let table = self.model.table_name(&entity.name)?;

        let mut assignments: Vec<String> = Vec::new();
        let mut bindings: Vec<Value> = Vec::new();
        for (name, value) in &update.values {
            let attr = self.model.attribute(&entity.name, name)?;
            assignments.push(format!(
                "\"{}\" = ?",
                SchemaSynthesizer::attribute_column(name)
            ));
            bindings.push(bind(value, attr)?);
        }
        for (name, target) in &update.to_one {
            let rel = self.to_one_relationship(&entity.name, name)?;
            assignments.push(format!("\"{}\" = ?", SchemaSynthesizer::fk_column(&rel.name)));
            bindings.push(match target {
                Some(target) => Value::Integer(target.0),
                None => Value::Null,
            });
        }

        if !assignments.is_empty() {
            let sql = format!(
                "UPDATE \"{table}\" SET {} WHERE \"{ID_COLUMN}\" = ?",
                assignments.join(", ")
            );
            bindings.push(Value::Integer(update.id.0));
            debug!(entity = %entity.name, id = update.id.0, "updating record");
            tx.execute(&sql, params_from_iter(bindings.iter()))
                .map_err(step_err)?;
        }

        for (name, change) in &update.to_many {
            let rel = self.to_many_relationship(&entity.name, name)?;
            for target in &change.add {
                self.link_to_many(tx, &entity.name, update.id, rel, *target)?;
            }
            for target in &change.remove {
                self.unlink_to_many(tx, &entity.name, update.id, rel, *target)?;
            }
        }
        Ok(())
    }

    fn delete(
        &self,
        tx: &Connection,
        declared_entity: &str,
        id: RowId,
        visited: &mut HashSet<(String, i64)>,
    ) -> Result<(), StoreError> {
        let table = self.model.table_name(declared_entity)?;
        if !visited.insert((table.clone(), id.0)) {
            return Ok(());
        }
        // Rules live on the concrete subtype when the table is shared.
        let entity = self.concrete_entity(tx, declared_entity, id)?;

        for (_, rel) in self.model.chain_relationships(&entity)? {
            match rel.delete_rule {
                DeleteRule::Deny => {
                    let dependents = self.related_ids(tx, &entity, id, rel)?;
                    if !dependents.is_empty() {
                        return Err(StoreError::DeleteDenied {
                            entity: entity.clone(),
                            id: id.0,
                            message: format!(
                                "{} dependent row(s) via relationship '{}'",
                                dependents.len(),
                                rel.name
                            ),
                        });
                    }
                }
                DeleteRule::Cascade => {
                    for target in self.related_ids(tx, &entity, id, rel)? {
                        self.delete(tx, &rel.target, target, visited)?;
                    }
                }
                DeleteRule::Nullify => {
                    if let Some(inverse) = self.model.fk_backing(rel)? {
                        let target_table = self.model.table_name(&rel.target)?;
                        let sql = format!(
                            "UPDATE \"{target_table}\" SET \"{fk}\" = NULL WHERE \"{fk}\" = ?",
                            fk = SchemaSynthesizer::fk_column(&inverse.name)
                        );
                        tx.execute(&sql, [id.0]).map_err(step_err)?;
                    }
                    // Junction rows are cleared below for every rule; a
                    // to-one's foreign key lives in the deleted row itself.
                }
                DeleteRule::NoAction => {}
            }
        }

        // No dangling junction entries, whatever the rule.
        for (_, rel) in self.model.chain_relationships(&entity)? {
            if let Some(junction) = self.schema.junction(&entity, rel)? {
                let sql = format!(
                    "DELETE FROM \"{}\" WHERE \"{}\" = ?",
                    junction.table, junction.owner_column
                );
                tx.execute(&sql, [id.0]).map_err(step_err)?;
            }
        }

        debug!(entity = %entity, id = id.0, "deleting record");
        tx.execute(
            &format!("DELETE FROM \"{table}\" WHERE \"{ID_COLUMN}\" = ?"),
            [id.0],
        )
        .map_err(step_err)?;
        Ok(())
    }

    /// Resolve the concrete entity of a row in a shared (inheritance) table.
    fn concrete_entity(
        &self,
        tx: &Connection,
        declared: &str,
        id: RowId,
    ) -> Result<String, StoreError> {
        if !self.model.table_has_discriminator(declared)? {
            return Ok(declared.to_string());
        }
        let table = self.model.table_name(declared)?;
        let found: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT \"{ENTITY_TYPE_COLUMN}\" FROM \"{table}\" WHERE \"{ID_COLUMN}\" = ?"
                ),
                [id.0],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(step_err(other)),
            })?;
        Ok(found.unwrap_or_else(|| declared.to_string()))
    }

    /// Target row identifiers reachable through one relationship of one row.
    fn related_ids(
        &self,
        tx: &Connection,
        entity: &str,
        id: RowId,
        rel: &RelationshipDescriptor,
    ) -> Result<Vec<RowId>, StoreError> {
        let compiled = self.compiler.compile_relationship_fetch(entity, id, &rel.name)?;
        let mut stmt = tx.prepare(&compiled.sql).map_err(prepare_err)?;
        let ids = stmt
            .query_map(params_from_iter(compiled.bindings.iter()), |row| {
                row.get::<_, Option<i64>>(0)
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(step_err)?;
        Ok(ids.into_iter().flatten().map(RowId).collect())
    }

    fn link_to_many(
        &self,
        tx: &Connection,
        entity: &str,
        owner: RowId,
        rel: &RelationshipDescriptor,
        target: RowId,
    ) -> Result<(), StoreError> {
        if let Some(junction) = self.schema.junction(entity, rel)? {
            // OR IGNORE keeps linking idempotent under the composite UNIQUE.
            let sql = format!(
                "INSERT OR IGNORE INTO \"{}\" (\"{}\", \"{}\") VALUES (?, ?)",
                junction.table, junction.owner_column, junction.target_column
            );
            tx.execute(&sql, [owner.0, target.0]).map_err(step_err)?;
        } else {
            let inverse = self.fk_inverse(rel)?;
            let target_table = self.model.table_name(&rel.target)?;
            let sql = format!(
                "UPDATE \"{target_table}\" SET \"{}\" = ? WHERE \"{ID_COLUMN}\" = ?",
                SchemaSynthesizer::fk_column(&inverse.name)
            );
            tx.execute(&sql, [owner.0, target.0]).map_err(step_err)?;
        }
        Ok(())
    }

    fn unlink_to_many(
        &self,
        tx: &Connection,
        entity: &str,
        owner: RowId,
        rel: &RelationshipDescriptor,
        target: RowId,
    ) -> Result<(), StoreError> {
        if let Some(junction) = self.schema.junction(entity, rel)? {
            let sql = format!(
                "DELETE FROM \"{}\" WHERE \"{}\" = ? AND \"{}\" = ?",
                junction.table, junction.owner_column, junction.target_column
            );
            tx.execute(&sql, [owner.0, target.0]).map_err(step_err)?;
        } else {
            let inverse = self.fk_inverse(rel)?;
            let target_table = self.model.table_name(&rel.target)?;
            let fk = SchemaSynthesizer::fk_column(&inverse.name);
            let sql = format!(
                "UPDATE \"{target_table}\" SET \"{fk}\" = NULL WHERE \"{ID_COLUMN}\" = ? AND \"{fk}\" = ?"
            );
            tx.execute(&sql, [target.0, owner.0]).map_err(step_err)?;
        }
        Ok(())
    }

    /// The to-one inverse materializing a foreign-key-backed to-many.
    fn fk_inverse(
        &self,
        rel: &RelationshipDescriptor,
    ) -> Result<&RelationshipDescriptor, StoreError> {
        self.model
            .fk_backing(rel)?
            .ok_or_else(|| StoreError::SchemaMismatch {
                message: format!(
                    "relationship '{}' has neither a junction table nor a to-one inverse",
                    rel.name
                ),
            })
    }

    fn to_one_relationship(
        &self,
        entity: &str,
        name: &str,
    ) -> Result<&RelationshipDescriptor, StoreError> {
        let rel = self.model.relationship(entity, name)?;
        if rel.cardinality != Cardinality::ToOne {
            return Err(StoreError::UnsupportedQuery {
                message: format!("relationship '{name}' of '{entity}' is not to-one"),
            });
        }
        Ok(rel)
    }

    fn to_many_relationship(
        &self,
        entity: &str,
        name: &str,
    ) -> Result<&RelationshipDescriptor, StoreError> {
        let rel = self.model.relationship(entity, name)?;
        if rel.cardinality != Cardinality::ToMany {
            return Err(StoreError::UnsupportedQuery {
                message: format!("relationship '{name}' of '{entity}' is not to-many"),
            });
        }
        Ok(rel)
    }
}

fn prepare_err(e: rusqlite::Error) -> StoreError {
    StoreError::UnsupportedQuery {
        message: e.to_string(),
    }
}

fn step_err(e: rusqlite::Error) -> StoreError {
    StoreError::CorruptRow {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AttributeDescriptor, AttributeType, DeleteRule, EntityDescriptor, RelationshipDescriptor,
    };
    use crate::schema::SchemaSynthesizer;

    fn blog_model(tag_delete_rule: DeleteRule) -> Model {
        let post = EntityDescriptor::new("Post")
            .with_attribute(AttributeDescriptor::new("title", AttributeType::String).required())
            .with_attribute(
                AttributeDescriptor::new("draft", AttributeType::Boolean)
                    .with_default(Value::Boolean(true)),
            )
            .with_relationship(
                RelationshipDescriptor::new("tags", "Tag", Cardinality::ToMany)
                    .with_inverse("posts")
                    .with_delete_rule(DeleteRule::Nullify),
            );
        let tag = EntityDescriptor::new("Tag")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::String).required())
            .with_relationship(
                RelationshipDescriptor::new("posts", "Post", Cardinality::ToMany)
                    .with_inverse("tags")
                    .with_delete_rule(tag_delete_rule),
            );
        Model::new(vec![post, tag]).unwrap()
    }

    fn prepared_conn(model: &Model) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        SchemaSynthesizer::new(model).ensure_schema(&conn).unwrap();
        conn
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_sequential_inserts_get_dense_ids() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        let request = SaveRequest {
            insertions: (0..3)
                .map(|i| {
                    NewRecord::new("Post")
                        .with_value("title", Value::String(format!("post {i}")))
                })
                .collect(),
            ..Default::default()
        };
        let result = applier.apply(&mut conn, &request).unwrap();
        let ids: Vec<i64> = result.inserted.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_insert_applies_defaults() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        let request = SaveRequest {
            insertions: vec![
                NewRecord::new("Post").with_value("title", Value::String("Hello".to_string()))
            ],
            ..Default::default()
        };
        applier.apply(&mut conn, &request).unwrap();
        let draft: i64 = conn
            .query_row("SELECT draft FROM post WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(draft, 1);
    }

    #[test]
    fn test_insert_links_junction_rows() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        let request = SaveRequest {
            insertions: vec![
                NewRecord::new("Tag").with_value("name", Value::String("a".to_string())),
                NewRecord::new("Tag").with_value("name", Value::String("b".to_string())),
                NewRecord::new("Post")
                    .with_value("title", Value::String("Hello".to_string()))
                    .with_to_many("tags", vec![RowId(1), RowId(2)]),
            ],
            ..Default::default()
        };
        applier.apply(&mut conn, &request).unwrap();
        assert_eq!(count(&conn, "SELECT count(*) FROM post_tags_tag"), 2);
    }

    #[test]
    fn test_update_changes_only_listed_columns() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    insertions: vec![NewRecord::new("Post")
                        .with_value("title", Value::String("before".to_string()))
                        .with_value("draft", Value::Boolean(false))],
                    ..Default::default()
                },
            )
            .unwrap();
        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    updates: vec![RecordUpdate::new("Post", RowId(1))
                        .set_value("title", Value::String("after".to_string()))],
                    ..Default::default()
                },
            )
            .unwrap();

        let (title, draft): (String, i64) = conn
            .query_row("SELECT title, draft FROM post WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(title, "after");
        assert_eq!(draft, 0);
    }

    #[test]
    fn test_unlink_removes_junction_row() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    insertions: vec![
                        NewRecord::new("Tag").with_value("name", Value::String("a".to_string())),
                        NewRecord::new("Post")
                            .with_value("title", Value::String("p".to_string()))
                            .with_to_many("tags", vec![RowId(1)]),
                    ],
                    ..Default::default()
                },
            )
            .unwrap();
        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    updates: vec![RecordUpdate::new("Post", RowId(1)).unlink("tags", RowId(1))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(count(&conn, "SELECT count(*) FROM post_tags_tag"), 0);
    }

    #[test]
    fn test_delete_nullify_clears_junction_rows() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    insertions: vec![
                        NewRecord::new("Tag").with_value("name", Value::String("a".to_string())),
                        NewRecord::new("Post")
                            .with_value("title", Value::String("p".to_string()))
                            .with_to_many("tags", vec![RowId(1)]),
                    ],
                    ..Default::default()
                },
            )
            .unwrap();
        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    deletions: vec![RecordRef::new("Post", RowId(1))],
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(count(&conn, "SELECT count(*) FROM post"), 0);
        assert_eq!(count(&conn, "SELECT count(*) FROM post_tags_tag"), 0);
        // Nullify leaves the tag itself alone.
        assert_eq!(count(&conn, "SELECT count(*) FROM tag"), 1);
    }

    #[test]
    fn test_delete_cascade_removes_dependents_and_junctions() {
        // Post.tags cascades in this variant.
        let post = EntityDescriptor::new("Post")
            .with_attribute(AttributeDescriptor::new("title", AttributeType::String).required())
            .with_relationship(
                RelationshipDescriptor::new("tags", "Tag", Cardinality::ToMany)
                    .with_inverse("posts")
                    .with_delete_rule(DeleteRule::Cascade),
            );
        let tag = EntityDescriptor::new("Tag")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::String).required())
            .with_relationship(
                RelationshipDescriptor::new("posts", "Post", Cardinality::ToMany)
                    .with_inverse("tags"),
            );
        let model = Model::new(vec![post, tag]).unwrap();
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    insertions: vec![
                        NewRecord::new("Tag").with_value("name", Value::String("a".to_string())),
                        NewRecord::new("Tag").with_value("name", Value::String("b".to_string())),
                        NewRecord::new("Post")
                            .with_value("title", Value::String("p".to_string()))
                            .with_to_many("tags", vec![RowId(1), RowId(2)]),
                    ],
                    ..Default::default()
                },
            )
            .unwrap();
        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    deletions: vec![RecordRef::new("Post", RowId(1))],
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(count(&conn, "SELECT count(*) FROM post"), 0);
        assert_eq!(count(&conn, "SELECT count(*) FROM tag"), 0);
        assert_eq!(count(&conn, "SELECT count(*) FROM post_tags_tag"), 0);
    }

    #[test]
    fn test_delete_deny_aborts_and_rolls_back() {
        // Tag.posts denies deletion while posts reference the tag.
        let model = blog_model(DeleteRule::Deny);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    insertions: vec![
                        NewRecord::new("Tag").with_value("name", Value::String("a".to_string())),
                        NewRecord::new("Post")
                            .with_value("title", Value::String("p".to_string()))
                            .with_to_many("tags", vec![RowId(1)]),
                    ],
                    ..Default::default()
                },
            )
            .unwrap();

        // Mixed request: the insertion must roll back with the denied delete.
        let request = SaveRequest {
            insertions: vec![
                NewRecord::new("Post").with_value("title", Value::String("other".to_string()))
            ],
            deletions: vec![RecordRef::new("Tag", RowId(1))],
            ..Default::default()
        };
        match applier.apply(&mut conn, &request) {
            Err(StoreError::DeleteDenied { entity, id, .. }) => {
                assert_eq!(entity, "Tag");
                assert_eq!(id, 1);
            }
            other => panic!("Expected DeleteDenied, got {other:?}"),
        }
        assert_eq!(count(&conn, "SELECT count(*) FROM post"), 1);
        assert_eq!(count(&conn, "SELECT count(*) FROM tag"), 1);
        assert_eq!(count(&conn, "SELECT count(*) FROM post_tags_tag"), 1);
    }

    #[test]
    fn test_unknown_attribute_identifies_record() {
        let model = blog_model(DeleteRule::Nullify);
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        let request = SaveRequest {
            insertions: vec![
                NewRecord::new("Post").with_value("missing", Value::Integer(1))
            ],
            ..Default::default()
        };
        match applier.apply(&mut conn, &request) {
            Err(StoreError::UnsupportedQuery { message }) => {
                assert!(message.contains("Post row 1"));
            }
            other => panic!("Expected UnsupportedQuery, got {other:?}"),
        }
    }

    #[test]
    fn test_fk_backed_to_many_link_updates_target_row() {
        let author = EntityDescriptor::new("Author")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::String))
            .with_relationship(
                RelationshipDescriptor::new("books", "Book", Cardinality::ToMany)
                    .with_inverse("author")
                    .with_delete_rule(DeleteRule::Nullify),
            );
        let book = EntityDescriptor::new("Book")
            .with_attribute(AttributeDescriptor::new("title", AttributeType::String))
            .with_relationship(
                RelationshipDescriptor::new("author", "Author", Cardinality::ToOne)
                    .with_inverse("books"),
            );
        let model = Model::new(vec![author, book]).unwrap();
        let mut conn = prepared_conn(&model);
        let applier = ChangeApplier::new(&model);

        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    insertions: vec![
                        NewRecord::new("Author")
                            .with_value("name", Value::String("Ada".to_string())),
                        NewRecord::new("Book")
                            .with_value("title", Value::String("Notes".to_string())),
                    ],
                    updates: vec![RecordUpdate::new("Author", RowId(1)).link("books", RowId(1))],
                    ..Default::default()
                },
            )
            .unwrap();

        let fk: i64 = conn
            .query_row("SELECT author_id FROM book WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(fk, 1);

        // Deleting the author nullifies the book's back-reference.
        applier
            .apply(
                &mut conn,
                &SaveRequest {
                    deletions: vec![RecordRef::new("Author", RowId(1))],
                    ..Default::default()
                },
            )
            .unwrap();
        let fk: Option<i64> = conn
            .query_row("SELECT author_id FROM book WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(fk, None);
    }
}
