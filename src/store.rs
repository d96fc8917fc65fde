//! The encrypted store façade.
//!
//! Ties the pieces together: the [`Engine`] connection, the passphrase state
//! machine, schema synthesis, the SQL compiler, and the change applier.
//! Every data operation is gated on the passphrase being validated; before
//! that, fetches and saves fail with [`StoreError::StoreNotReady`].
//!
//! # Lifecycle
//!
//! ```text
//! open(model, options)
//!   ├─ fresh file  → Unset          (set_passphrase next)
//!   └─ existing    → SetUnvalidated (validate_passphrase next)
//! set_passphrase      → SetUnvalidated (key applied, not yet proven)
//! validate_passphrase → Validated → schema synthesized → fetch/apply available
//! ```
//!
//! When `StoreOptions::passphrase` is provided, `open` performs the set (on a
//! fresh file) and validate steps itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::apply::{ChangeApplier, SaveRequest, SaveResult};
use crate::compiler::{SelectColumn, SqlCompiler};
use crate::engine::Engine;
use crate::error::StoreError;
use crate::fetch::FetchSpec;
use crate::model::{Cardinality, Model, RowId};
use crate::passphrase::{PassphraseManager, PassphraseState};
use crate::schema::SchemaSynthesizer;
use crate::value::{materialize, Value};

/// Options accepted by [`EncryptedStore::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Database file location.
    pub file_location: PathBuf,
    /// Passphrase to set (fresh file) or validate (existing file) during
    /// open. When absent, the caller drives the passphrase lifecycle.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Engine page-cache size in pages, applied once the store unlocks.
    #[serde(default)]
    pub cache_size: Option<i64>,
}

impl StoreOptions {
    pub fn new(file_location: impl Into<PathBuf>) -> Self {
        Self {
            file_location: file_location.into(),
            passphrase: None,
            cache_size: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_cache_size(mut self, pages: i64) -> Self {
        self.cache_size = Some(pages);
        self
    }

    /// Load options from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::OpenFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| StoreError::OpenFailed {
            path: path.display().to_string(),
            message: format!("invalid options file: {e}"),
        })
    }
}

/// One materialized result row: typed attribute values plus to-one targets.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRow {
    /// Concrete entity of the row (a subtype when the table is shared).
    pub entity: String,
    pub id: RowId,
    pub values: BTreeMap<String, Value>,
    pub to_one: BTreeMap<String, Option<RowId>>,
}

/// Result of resolving one relationship of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRelationship {
    ToOne(Option<RowId>),
    ToMany(Vec<RowId>),
}

/// An encrypted object store over a single database file.
pub struct EncryptedStore {
    model: Model,
    engine: Engine,
    passphrase: PassphraseManager,
    cache_size: Option<i64>,
    schema_ready: bool,
}

impl EncryptedStore {
    /// Open the store. A fresh (missing or empty) file starts in the `Unset`
    /// passphrase state; an existing file starts `SetUnvalidated`.
    pub fn open(model: Model, options: StoreOptions) -> Result<Self, StoreError> {
        let fresh = Engine::file_is_fresh(&options.file_location);
        let engine = Engine::open(&options.file_location)?;
        let mut store = Self {
            model,
            engine,
            passphrase: PassphraseManager::new(fresh),
            cache_size: options.cache_size,
            schema_ready: false,
        };
        if let Some(passphrase) = &options.passphrase {
            if fresh {
                store.set_passphrase(passphrase)?;
            }
            store.validate_passphrase(passphrase)?;
        }
        Ok(store)
    }

    pub fn state(&self) -> PassphraseState {
        self.passphrase.state()
    }

    /// Whether a live connection is held. A failed validation closes it.
    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// Key a fresh database. The key is applied but not proven; a subsequent
    /// [`Self::validate_passphrase`] call unlocks data operations.
    pub fn set_passphrase(&mut self, passphrase: &str) -> Result<(), StoreError> {
        self.passphrase.set_passphrase(&mut self.engine, passphrase)
    }

    /// Prove a passphrase against an existing database. On failure the
    /// connection is closed and data operations stay gated.
    pub fn validate_passphrase(&mut self, passphrase: &str) -> Result<(), StoreError> {
        self.passphrase
            .validate_passphrase(&mut self.engine, passphrase)?;
        self.after_unlock()
    }

    /// Re-key the database from `old` to `new`. Validates `old` first.
    pub fn change_passphrase(&mut self, old: &str, new: &str) -> Result<(), StoreError> {
        self.passphrase
            .change_passphrase(&mut self.engine, old, new)?;
        self.after_unlock()
    }

    /// Execute a fetch and materialize its result rows.
    #[instrument(skip(self, spec), fields(entity = %spec.entity))]
    pub fn fetch(&self, spec: &FetchSpec) -> Result<Vec<FetchedRow>, StoreError> {
        self.ready()?;
        let compiler = SqlCompiler::new(&self.model);
        let compiled = compiler.compile_fetch(spec)?;
        debug!(sql = %compiled.sql, "executing fetch");

        let conn = self.engine.conn()?;
        let mut stmt = conn.prepare(&compiled.sql).map_err(prepare_err)?;
        let mut rows = stmt
            .query(params_from_iter(compiled.bindings.iter()))
            .map_err(step_err)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(step_err)? {
            let mut fetched = FetchedRow {
                entity: spec.entity.clone(),
                id: RowId(0),
                values: BTreeMap::new(),
                to_one: BTreeMap::new(),
            };
            // The select list covers the fetched entity's whole subtree;
            // columns outside a row's concrete entity are skipped. The id and
            // discriminator columns come first, so the concrete entity is
            // known before any attribute is materialized.
            for (idx, column) in compiled.columns.iter().enumerate() {
                match column {
                    SelectColumn::Id => {
                        fetched.id = RowId(row.get(idx).map_err(step_err)?);
                    }
                    SelectColumn::EntityType => {
                        fetched.entity = row.get(idx).map_err(step_err)?;
                        if self.model.entity(&fetched.entity).is_err() {
                            return Err(StoreError::CorruptRow {
                                message: format!(
                                    "row carries unknown entity type '{}'",
                                    fetched.entity
                                ),
                            });
                        }
                    }
                    SelectColumn::Attribute(name) => {
                        let Ok(attr) = self.model.attribute(&fetched.entity, name) else {
                            continue;
                        };
                        let cell = row.get_ref(idx).map_err(step_err)?;
                        fetched
                            .values
                            .insert(name.clone(), materialize(cell, attr)?);
                    }
                    SelectColumn::ToOne(name) => {
                        if self.model.relationship(&fetched.entity, name).is_err() {
                            continue;
                        }
                        let target: Option<i64> = row.get(idx).map_err(step_err)?;
                        fetched.to_one.insert(name.clone(), target.map(RowId));
                    }
                }
            }
            result.push(fetched);
        }
        Ok(result)
    }

    /// Apply insertions, updates, and deletions in one transaction.
    #[instrument(
        skip(self, request),
        fields(
            insertions = request.insertions.len(),
            updates = request.updates.len(),
            deletions = request.deletions.len(),
        )
    )]
    pub fn apply(&mut self, request: &SaveRequest) -> Result<SaveResult, StoreError> {
        self.ready()?;
        let applier = ChangeApplier::new(&self.model);
        applier.apply(self.engine.conn_mut()?, request)
    }

    /// Resolve one relationship of one row to its target identifier(s).
    #[instrument(skip(self))]
    pub fn resolve_relationship(
        &self,
        entity: &str,
        id: RowId,
        relationship: &str,
    ) -> Result<ResolvedRelationship, StoreError> {
        self.ready()?;
        let rel = self.model.relationship(entity, relationship)?;
        let cardinality = rel.cardinality;
        let compiler = SqlCompiler::new(&self.model);
        let compiled = compiler.compile_relationship_fetch(entity, id, relationship)?;

        let conn = self.engine.conn()?;
        let mut stmt = conn.prepare(&compiled.sql).map_err(prepare_err)?;
        let mut rows = stmt
            .query(params_from_iter(compiled.bindings.iter()))
            .map_err(step_err)?;

        match cardinality {
            Cardinality::ToOne => {
                let target = match rows.next().map_err(step_err)? {
                    Some(row) => row.get::<_, Option<i64>>(0).map_err(step_err)?,
                    None => None,
                };
                Ok(ResolvedRelationship::ToOne(target.map(RowId)))
            }
            Cardinality::ToMany => {
                let mut targets = Vec::new();
                while let Some(row) = rows.next().map_err(step_err)? {
                    if let Some(raw) = row.get::<_, Option<i64>>(0).map_err(step_err)? {
                        targets.push(RowId(raw));
                    }
                }
                Ok(ResolvedRelationship::ToMany(targets))
            }
        }
    }

    /// Reserve the next row identifier for an entity's table.
    pub fn new_row_id(&self, entity: &str) -> Result<RowId, StoreError> {
        self.ready()?;
        ChangeApplier::new(&self.model).next_row_id(self.engine.conn()?, entity)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Data operations require a validated passphrase and a live connection.
    fn ready(&self) -> Result<(), StoreError> {
        if self.passphrase.state() != PassphraseState::Validated || !self.engine.is_open() {
            return Err(StoreError::StoreNotReady);
        }
        Ok(())
    }

    /// Runs after the passphrase unlocks the file: tune the cache, then
    /// synthesize or verify the schema.
    fn after_unlock(&mut self) -> Result<(), StoreError> {
        if let Some(pages) = self.cache_size {
            self.engine.set_cache_size(pages)?;
        }
        if !self.schema_ready {
            let synthesizer = SchemaSynthesizer::new(&self.model);
            synthesizer.ensure_schema(self.engine.conn()?)?;
            self.schema_ready = true;
            debug!("schema synthesized");
        }
        Ok(())
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
    use crate::apply::NewRecord;
    use crate::model::{
        AttributeDescriptor, AttributeType, EntityDescriptor, RelationshipDescriptor,
    };
    use tempfile::TempDir;

    fn post_tag_model() -> Model {
        let post = EntityDescriptor::new("Post")
            .with_attribute(AttributeDescriptor::new("title", AttributeType::String).required())
            .with_relationship(
                RelationshipDescriptor::new("tags", "Tag", Cardinality::ToMany)
                    .with_inverse("posts"),
            );
        let tag = EntityDescriptor::new("Tag")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::String).required())
            .with_relationship(
                RelationshipDescriptor::new("posts", "Post", Cardinality::ToMany)
                    .with_inverse("tags"),
            );
        Model::new(vec![post, tag]).unwrap()
    }

    fn open_fresh(dir: &TempDir) -> EncryptedStore {
        let options = StoreOptions::new(dir.path().join("store_test.sqlite"))
            .with_passphrase("secret1");
        EncryptedStore::open(post_tag_model(), options).unwrap()
    }

    #[test]
    fn test_operations_gated_until_validated() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions::new(dir.path().join("gated.sqlite"));
        let store = EncryptedStore::open(post_tag_model(), options).unwrap();

        assert_eq!(store.state(), PassphraseState::Unset);
        match store.fetch(&FetchSpec::all("Post")) {
            Err(StoreError::StoreNotReady) => {}
            other => panic!("Expected StoreNotReady, got {other:?}"),
        }
        match store.new_row_id("Post") {
            Err(StoreError::StoreNotReady) => {}
            other => panic!("Expected StoreNotReady, got {other:?}"),
        }
    }

    #[test]
    fn test_set_passphrase_alone_keeps_store_gated() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions::new(dir.path().join("set_only.sqlite"));
        let mut store = EncryptedStore::open(post_tag_model(), options).unwrap();

        store.set_passphrase("secret1").unwrap();
        assert_eq!(store.state(), PassphraseState::SetUnvalidated);
        match store.fetch(&FetchSpec::all("Post")) {
            Err(StoreError::StoreNotReady) => {}
            other => panic!("Expected StoreNotReady, got {other:?}"),
        }

        store.validate_passphrase("secret1").unwrap();
        assert_eq!(store.state(), PassphraseState::Validated);
        assert!(store.fetch(&FetchSpec::all("Post")).unwrap().is_empty());
    }

    #[test]
    fn test_insert_then_fetch_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_fresh(&dir);

        store
            .apply(&SaveRequest {
                insertions: vec![
                    NewRecord::new("Post")
                        .with_value("title", Value::String("Hello".to_string()))
                ],
                ..Default::default()
            })
            .unwrap();

        let rows = store.fetch(&FetchSpec::all("Post")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, RowId(1));
        assert_eq!(rows[0].entity, "Post");
        assert_eq!(
            rows[0].values.get("title"),
            Some(&Value::String("Hello".to_string()))
        );
    }

    #[test]
    fn test_resolve_to_many_relationship() {
        let dir = TempDir::new().unwrap();
        let mut store = open_fresh(&dir);

        store
            .apply(&SaveRequest {
                insertions: vec![
                    NewRecord::new("Tag").with_value("name", Value::String("a".to_string())),
                    NewRecord::new("Tag").with_value("name", Value::String("b".to_string())),
                    NewRecord::new("Post")
                        .with_value("title", Value::String("p".to_string()))
                        .with_to_many("tags", vec![RowId(1), RowId(2)]),
                ],
                ..Default::default()
            })
            .unwrap();

        let resolved = store.resolve_relationship("Post", RowId(1), "tags").unwrap();
        assert_eq!(
            resolved,
            ResolvedRelationship::ToMany(vec![RowId(1), RowId(2)])
        );
    }

    #[test]
    fn test_options_from_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(
            &path,
            r#"{"file_location": "/tmp/store.sqlite", "cache_size": 200}"#,
        )
        .unwrap();

        let options = StoreOptions::from_json_file(&path).unwrap();
        assert_eq!(options.file_location, PathBuf::from("/tmp/store.sqlite"));
        assert_eq!(options.passphrase, None);
        assert_eq!(options.cache_size, Some(200));
    }

    #[test]
    fn test_reopen_requires_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.sqlite");
        {
            let options = StoreOptions::new(&path).with_passphrase("secret1");
            let mut store = EncryptedStore::open(post_tag_model(), options).unwrap();
            store
                .apply(&SaveRequest {
                    insertions: vec![NewRecord::new("Tag")
                        .with_value("name", Value::String("a".to_string()))],
                    ..Default::default()
                })
                .unwrap();
        }

        let options = StoreOptions::new(&path);
        let mut store = EncryptedStore::open(post_tag_model(), options).unwrap();
        assert_eq!(store.state(), PassphraseState::SetUnvalidated);
        match store.fetch(&FetchSpec::all("Tag")) {
            Err(StoreError::StoreNotReady) => {}
            other => panic!("Expected StoreNotReady, got {other:?}"),
        }

        store.validate_passphrase("secret1").unwrap();
        let rows = store.fetch(&FetchSpec::all("Tag")).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
