//! Entity/attribute/relationship descriptors and the resolved model.
//!
//! Descriptors are immutable value types constructed once from external model
//! metadata when the store is opened. [`Model`] resolves them into a
//! name-keyed lookup structure and validates the invariants the rest of the
//! crate relies on (unique attribute names per inheritance chain, consistent
//! inverse relationships, transformers present for transformable attributes).
//!
//! Inverse relationships are resolved by name lookup through the model, never
//! by holding a live back-reference, so cyclic relationship graphs cannot
//! produce ownership cycles.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;
use crate::value::Value;

/// Opaque, table-scoped row identifier standing in for an object reference.
///
/// Owned by the store: allocated at insert time from the table's current
/// maximum plus one and never reused while the table lives. Doubles as the
/// encoding of a cross-table reference in foreign-key columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub i64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for RowId {
    fn from(raw: i64) -> Self {
        RowId(raw)
    }
}

/// Semantic attribute types supported by the store.
///
/// Each type maps to a fixed SQLite column affinity:
/// - `String` -> TEXT
/// - `Integer` -> INTEGER
/// - `Float` -> REAL
/// - `Boolean` -> INTEGER (0/1)
/// - `Date` -> INTEGER (milliseconds since the Unix epoch)
/// - `Binary` -> BLOB
/// - `Transformable` -> BLOB (opaque bytes via the attribute's transformer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Binary,
    Transformable,
}

impl AttributeType {
    /// Returns the SQLite column type for this semantic type.
    pub fn sqlite_type(&self) -> &'static str {
        match self {
            AttributeType::String => "TEXT",
            AttributeType::Integer => "INTEGER",
            AttributeType::Float => "REAL",
            AttributeType::Boolean => "INTEGER",
            AttributeType::Date => "INTEGER",
            AttributeType::Binary => "BLOB",
            AttributeType::Transformable => "BLOB",
        }
    }
}

/// Capability interface for opaque attribute encoding.
///
/// Supplied by the caller per transformable attribute. The store invokes it
/// when binding and materializing values and never interprets the bytes.
pub trait ValueTransformer: Send + Sync {
    /// Encode a value into an opaque byte sequence for storage.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, StoreError>;

    /// Decode a stored byte sequence back into a value.
    fn decode(&self, bytes: &[u8]) -> Result<Value, StoreError>;
}

/// Describes a single typed attribute of an entity.
#[derive(Clone)]
pub struct AttributeDescriptor {
    /// Attribute name; unique within the entity's inheritance chain.
    pub name: String,

    /// Semantic type of the attribute.
    pub attr_type: AttributeType,

    /// Whether the attribute accepts absent (NULL) values.
    pub optional: bool,

    /// Default value applied on insert when no value is provided.
    pub default: Option<Value>,

    /// Transformer for `Transformable` attributes; required for that type.
    pub transformer: Option<Arc<dyn ValueTransformer>>,
}

impl AttributeDescriptor {
    /// Create an optional attribute with no default.
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            optional: true,
            default: None,
            transformer: None,
        }
    }

    /// Mark the attribute as required (NULL not accepted).
    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Attach the caller-supplied transformer for a transformable attribute.
    pub fn with_transformer(mut self, transformer: Arc<dyn ValueTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }
}

impl fmt::Debug for AttributeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("name", &self.name)
            .field("attr_type", &self.attr_type)
            .field("optional", &self.optional)
            .field("default", &self.default)
            .field("transformer", &self.transformer.as_ref().map(|_| "<dyn>"))
            .finish()
    }
}

/// Cardinality of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// Policy applied to dependent rows when a row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRule {
    /// Clear the dependents' back-references (foreign keys / junction rows).
    Nullify,
    /// Delete dependents transitively.
    Cascade,
    /// Abort the transaction if dependents exist.
    Deny,
    /// Leave dependents alone.
    NoAction,
}

/// Describes a named relationship from one entity to another.
#[derive(Debug, Clone)]
pub struct RelationshipDescriptor {
    /// Relationship name; doubles as the foreign-key column stem for to-one.
    pub name: String,

    /// Target entity name.
    pub target: String,

    /// To-one or to-many.
    pub cardinality: Cardinality,

    /// Name of the inverse relationship on the target entity, if declared.
    pub inverse: Option<String>,

    /// Rule applied to dependents when a row is deleted.
    pub delete_rule: DeleteRule,
}

impl RelationshipDescriptor {
    /// Create a relationship with the `Nullify` delete rule and no inverse.
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality,
            inverse: None,
            delete_rule: DeleteRule::Nullify,
        }
    }

    /// Declare the inverse relationship name on the target entity.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    /// Set the delete rule.
    pub fn with_delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }
}

/// Describes one entity: attributes, relationships, optional parent entity.
///
/// Entities with a parent share the root ancestor's table (single-table
/// inheritance); the table carries the union of the subtree's columns plus an
/// `entity_type` discriminator.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub name: String,
    pub parent: Option<String>,
    pub attributes: Vec<AttributeDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }
}

/// Resolved, read-only model: entity name -> descriptor, plus the parent/child
/// index used for single-table inheritance.
#[derive(Debug)]
pub struct Model {
    entities: BTreeMap<String, EntityDescriptor>,
    children: BTreeMap<String, Vec<String>>,
}

impl Model {
    /// Build and validate a model from entity descriptors.
    ///
    /// Fails with [`StoreError::SchemaMismatch`] when the metadata is
    /// internally inconsistent: unknown parent/target/inverse names, parent
    /// cycles, duplicate attribute names within an inheritance chain,
    /// conflicting attribute types within a table subtree, or a transformable
    /// attribute without a transformer.
    pub fn new(entities: Vec<EntityDescriptor>) -> Result<Self, StoreError> {
        let mut by_name = BTreeMap::new();
        for entity in entities {
            if by_name.insert(entity.name.clone(), entity).is_some() {
                return Err(mismatch("duplicate entity name"));
            }
        }

        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entity in by_name.values() {
            if let Some(parent) = &entity.parent {
                if !by_name.contains_key(parent) {
                    return Err(mismatch(&format!(
                        "entity '{}' names unknown parent '{}'",
                        entity.name, parent
                    )));
                }
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(entity.name.clone());
            }
        }

        let model = Model {
            entities: by_name,
            children,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), StoreError> {
        for entity in self.entities.values() {
            let chain = self.chain(&entity.name)?;

            // Attribute and relationship names must be unique across the
            // chain; both become columns in the same table.
            let mut seen = std::collections::HashSet::new();
            for desc in &chain {
                for attr in &desc.attributes {
                    if !seen.insert(attr.name.clone()) {
                        return Err(mismatch(&format!(
                            "attribute '{}' duplicated in inheritance chain of '{}'",
                            attr.name, entity.name
                        )));
                    }
                    if attr.attr_type == AttributeType::Transformable && attr.transformer.is_none()
                    {
                        return Err(mismatch(&format!(
                            "transformable attribute '{}.{}' has no transformer",
                            desc.name, attr.name
                        )));
                    }
                }
                for rel in &desc.relationships {
                    if !seen.insert(rel.name.clone()) {
                        return Err(mismatch(&format!(
                            "relationship '{}' collides with another name in chain of '{}'",
                            rel.name, entity.name
                        )));
                    }
                }
            }

            for rel in &entity.relationships {
                let target = self.entities.get(&rel.target).ok_or_else(|| {
                    mismatch(&format!(
                        "relationship '{}.{}' targets unknown entity '{}'",
                        entity.name, rel.name, rel.target
                    ))
                })?;
                if let Some(inverse) = &rel.inverse {
                    let found = target.relationships.iter().find(|r| &r.name == inverse);
                    match found {
                        Some(inv) if inv.target == entity.name => {}
                        _ => {
                            return Err(mismatch(&format!(
                                "inverse '{}' of '{}.{}' is missing on '{}' or points elsewhere",
                                inverse, entity.name, rel.name, rel.target
                            )));
                        }
                    }
                }
            }
        }

        // Attributes sharing a name across a table subtree must agree on
        // type, since they share one column.
        for root in self.entities.values().filter(|e| e.parent.is_none()) {
            let mut types: BTreeMap<&str, AttributeType> = BTreeMap::new();
            for name in self.subtree(&root.name)? {
                let entity = &self.entities[&name];
                for attr in &entity.attributes {
                    if let Some(existing) = types.insert(&attr.name, attr.attr_type) {
                        if existing != attr.attr_type {
                            return Err(mismatch(&format!(
                                "attribute '{}' has conflicting types within table '{}'",
                                attr.name,
                                self.table_name(&root.name)?
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Look up an entity descriptor by name.
    pub fn entity(&self, name: &str) -> Result<&EntityDescriptor, StoreError> {
        self.entities.get(name).ok_or_else(|| StoreError::UnsupportedQuery {
            message: format!("unknown entity '{name}'"),
        })
    }

    /// All entity descriptors, in name order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// The inheritance chain root-first: `[root, ..., entity]`.
    ///
    /// Also serves as the parent-cycle check; a chain longer than the entity
    /// count means the parent pointers loop.
    pub fn chain(&self, name: &str) -> Result<Vec<&EntityDescriptor>, StoreError> {
        let mut chain = Vec::new();
        let mut current = self.entity(name)?;
        loop {
            chain.push(current);
            if chain.len() > self.entities.len() {
                return Err(mismatch(&format!("parent cycle involving '{name}'")));
            }
            match &current.parent {
                Some(parent) => current = self.entity(parent)?,
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// The root ancestor of an entity (the entity itself if it has no parent).
    pub fn root(&self, name: &str) -> Result<&EntityDescriptor, StoreError> {
        Ok(self.chain(name)?[0])
    }

    /// Table name backing an entity: the root ancestor's name, lowercased.
    ///
    /// Deterministic so that reopening the same model reproduces identical
    /// table names.
    pub fn table_name(&self, name: &str) -> Result<String, StoreError> {
        Ok(self.root(name)?.name.to_lowercase())
    }

    /// The entity plus all its descendants, in deterministic (name) order.
    pub fn subtree(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.entity(name)?;
        let mut result = Vec::new();
        let mut queue = vec![name.to_string()];
        while let Some(current) = queue.pop() {
            if let Some(kids) = self.children.get(&current) {
                let mut kids = kids.clone();
                kids.sort();
                queue.extend(kids);
            }
            result.push(current);
        }
        result.sort();
        Ok(result)
    }

    /// Whether the entity's table carries the `entity_type` discriminator
    /// column (true when the root has any descendants).
    pub fn table_has_discriminator(&self, name: &str) -> Result<bool, StoreError> {
        let root = self.root(name)?;
        Ok(self.children.contains_key(&root.name))
    }

    /// Attributes visible on an entity: its own plus inherited, root-first.
    pub fn chain_attributes(&self, name: &str) -> Result<Vec<&AttributeDescriptor>, StoreError> {
        Ok(self
            .chain(name)?
            .into_iter()
            .flat_map(|e| e.attributes.iter())
            .collect())
    }

    /// Relationships visible on an entity: its own plus inherited, root-first.
    pub fn chain_relationships(
        &self,
        name: &str,
    ) -> Result<Vec<(&EntityDescriptor, &RelationshipDescriptor)>, StoreError> {
        Ok(self
            .chain(name)?
            .into_iter()
            .flat_map(|e| e.relationships.iter().map(move |r| (e, r)))
            .collect())
    }

    /// Find an attribute by name anywhere in the entity's chain.
    pub fn attribute(
        &self,
        entity: &str,
        name: &str,
    ) -> Result<&AttributeDescriptor, StoreError> {
        self.chain_attributes(entity)?
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| StoreError::UnsupportedQuery {
                message: format!("unknown attribute '{name}' on entity '{entity}'"),
            })
    }

    /// Find a relationship by name anywhere in the entity's chain.
    pub fn relationship(
        &self,
        entity: &str,
        name: &str,
    ) -> Result<&RelationshipDescriptor, StoreError> {
        self.chain_relationships(entity)?
            .into_iter()
            .map(|(_, r)| r)
            .find(|r| r.name == name)
            .ok_or_else(|| StoreError::UnsupportedQuery {
                message: format!("unknown relationship '{name}' on entity '{entity}'"),
            })
    }

    /// Resolve the declared inverse of a relationship, if any.
    pub fn inverse_of(
        &self,
        rel: &RelationshipDescriptor,
    ) -> Result<Option<&RelationshipDescriptor>, StoreError> {
        match &rel.inverse {
            Some(inverse) => Ok(Some(self.relationship(&rel.target, inverse)?)),
            None => Ok(None),
        }
    }

    /// A to-many relationship whose inverse is a to-one is materialized by
    /// the inverse's foreign-key column rather than a junction table.
    /// Returns the inverse relationship in that case.
    pub fn fk_backing(
        &self,
        rel: &RelationshipDescriptor,
    ) -> Result<Option<&RelationshipDescriptor>, StoreError> {
        if rel.cardinality != Cardinality::ToMany {
            return Ok(None);
        }
        match self.inverse_of(rel)? {
            Some(inv) if inv.cardinality == Cardinality::ToOne => Ok(Some(inv)),
            _ => Ok(None),
        }
    }
}

fn mismatch(message: &str) -> StoreError {
    StoreError::SchemaMismatch {
        message: message.to_string(),
    }
}
