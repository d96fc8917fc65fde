//! SQL compilation: fetch specifications and relationship references into
//! parameterized statements.
//!
//! Every literal value is emitted as a `?` placeholder and collected into the
//! statement's binding list, never interpolated as text. Bindings are ordered
//! to match placeholder positions: join-clause bindings first (joins precede
//! the WHERE clause), then the discriminator filter, then predicate literals.
//!
//! Predicate key paths may traverse relationships (`"tags.name"`). Each
//! distinct traversed relationship path gets exactly one join, reused when
//! the same path is referenced again. Any to-many traversal switches the
//! statement to `SELECT DISTINCT` so junction joins cannot duplicate owner
//! rows.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::StoreError;
use crate::fetch::{FetchSpec, Predicate, SortDescriptor};
use crate::model::{AttributeDescriptor, Cardinality, Model, RowId};
use crate::schema::{SchemaSynthesizer, ENTITY_TYPE_COLUMN, ID_COLUMN};
use crate::value::{bind, Value};

/// Layout descriptor for one column of a compiled SELECT.
///
/// The store uses this to materialize result rows without re-deriving column
/// positions from the SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectColumn {
    /// The row identifier.
    Id,
    /// The `entity_type` discriminator.
    EntityType,
    /// An attribute column, by attribute name.
    Attribute(String),
    /// A to-one foreign-key column, by relationship name.
    ToOne(String),
}

/// A parameterized SQL statement plus its ordered bind values and the layout
/// of its result columns.
#[derive(Debug, Clone)]
pub struct CompiledStatement {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub columns: Vec<SelectColumn>,
}

/// Join state accumulated while compiling one fetch.
struct Joins {
    clauses: Vec<String>,
    bindings: Vec<Value>,
    /// Traversed relationship path -> (alias, entity reached).
    aliases: BTreeMap<String, (String, String)>,
    uses_to_many: bool,
}

impl Joins {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            bindings: Vec::new(),
            aliases: BTreeMap::new(),
            uses_to_many: false,
        }
    }

    fn next_alias(&self) -> String {
        format!("j{}", self.aliases.len() + 1)
    }
}

/// Translates fetch specifications and relationship references into SQL.
pub struct SqlCompiler<'a> {
    model: &'a Model,
    schema: SchemaSynthesizer<'a>,
}

impl<'a> SqlCompiler<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            schema: SchemaSynthesizer::new(model),
        }
    }

    /// Compile a fetch specification into a SELECT statement.
    pub fn compile_fetch(&self, spec: &FetchSpec) -> Result<CompiledStatement, StoreError> {
        let entity = &spec.entity;
        self.model.entity(entity)?;
        let table = self.model.table_name(entity)?;

        let mut joins = Joins::new();

        // WHERE: discriminator filter first, then the caller's predicate.
        let mut conjuncts: Vec<String> = Vec::new();
        let mut where_bindings: Vec<Value> = Vec::new();
        if let Some((fragment, names)) = self.discriminator_filter("t0", entity)? {
            conjuncts.push(fragment);
            where_bindings.extend(names);
        }
        if let Some(predicate) = &spec.predicate {
            let (fragment, bindings) = self.compile_predicate(entity, predicate, &mut joins)?;
            conjuncts.push(fragment);
            where_bindings.extend(bindings);
        }

        let columns = self.select_columns(entity, spec.ids_only)?;
        let select_list: Vec<String> = columns
            .iter()
            .map(|column| match column {
                SelectColumn::Id => format!("t0.\"{ID_COLUMN}\""),
                SelectColumn::EntityType => format!("t0.\"{ENTITY_TYPE_COLUMN}\""),
                SelectColumn::Attribute(name) => {
                    format!("t0.\"{}\"", SchemaSynthesizer::attribute_column(name))
                }
                SelectColumn::ToOne(name) => {
                    format!("t0.\"{}\"", SchemaSynthesizer::fk_column(name))
                }
            })
            .collect();

        let mut sql = format!(
            "SELECT {}{} FROM \"{}\" t0",
            if joins.uses_to_many { "DISTINCT " } else { "" },
            select_list.join(", "),
            table
        );
        for clause in &joins.clauses {
            sql.push(' ');
            sql.push_str(clause);
        }
        if !conjuncts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conjuncts.join(" AND "));
        }

        sql.push_str(" ORDER BY ");
        let mut order_terms = Vec::new();
        for sort in &spec.sort {
            order_terms.push(self.sort_term(entity, sort)?);
        }
        order_terms.push(format!("t0.\"{ID_COLUMN}\" ASC"));
        sql.push_str(&order_terms.join(", "));

        if spec.limit.is_some() || spec.offset.is_some() {
            match spec.limit {
                Some(limit) => sql.push_str(&format!(" LIMIT {limit}")),
                // SQLite requires a LIMIT clause before OFFSET; -1 = unbounded.
                None => sql.push_str(" LIMIT -1"),
            }
            if let Some(offset) = spec.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let mut bindings = joins.bindings;
        bindings.extend(where_bindings);
        Ok(CompiledStatement {
            sql,
            bindings,
            columns,
        })
    }

    /// Compile the statement that retrieves target row identifiers for one
    /// relationship of one owning row.
    pub fn compile_relationship_fetch(
        &self,
        entity: &str,
        owner: RowId,
        relationship: &str,
    ) -> Result<CompiledStatement, StoreError> {
        let rel = self.model.relationship(entity, relationship)?;
        let table = self.model.table_name(entity)?;

        if rel.cardinality == Cardinality::ToOne {
            let sql = format!(
                "SELECT \"{}\" FROM \"{}\" WHERE \"{ID_COLUMN}\" = ?",
                SchemaSynthesizer::fk_column(&rel.name),
                table
            );
            return Ok(CompiledStatement {
                sql,
                bindings: vec![Value::Integer(owner.0)],
                columns: vec![SelectColumn::ToOne(rel.name.clone())],
            });
        }

        if let Some(junction) = self.schema.junction(entity, rel)? {
            let sql = format!(
                "SELECT \"{target}\" FROM \"{table}\" WHERE \"{owner_col}\" = ? ORDER BY \"{target}\" ASC",
                target = junction.target_column,
                table = junction.table,
                owner_col = junction.owner_column,
            );
            return Ok(CompiledStatement {
                sql,
                bindings: vec![Value::Integer(owner.0)],
                columns: vec![SelectColumn::Id],
            });
        }

        // FK-backed to-many: read the target table through the inverse's
        // foreign-key column.
        let inverse = self
            .model
            .fk_backing(rel)?
            .ok_or_else(|| StoreError::SchemaMismatch {
                message: format!(
                    "relationship '{relationship}' has neither a junction table nor a to-one inverse"
                ),
            })?;
        let target_table = self.model.table_name(&rel.target)?;
        let mut sql = format!(
            "SELECT \"{ID_COLUMN}\" FROM \"{}\" WHERE \"{}\" = ?",
            target_table,
            SchemaSynthesizer::fk_column(&inverse.name),
        );
        let mut bindings = vec![Value::Integer(owner.0)];
        if let Some((fragment, names)) = self.discriminator_filter("", &rel.target)? {
            sql.push_str(" AND ");
            sql.push_str(&fragment);
            bindings.extend(names);
        }
        sql.push_str(&format!(" ORDER BY \"{ID_COLUMN}\" ASC"));
        Ok(CompiledStatement {
            sql,
            bindings,
            columns: vec![SelectColumn::Id],
        })
    }

    /// Column layout of a fetch's SELECT list.
    ///
    /// Covers the union of the fetched entity's subtree, so subtype rows
    /// returned by a root fetch carry their own attributes. The store skips
    /// columns outside a row's concrete entity when materializing.
    fn select_columns(
        &self,
        entity: &str,
        ids_only: bool,
    ) -> Result<Vec<SelectColumn>, StoreError> {
        let mut columns = vec![SelectColumn::Id];
        if ids_only {
            return Ok(columns);
        }
        if self.model.table_has_discriminator(entity)? {
            columns.push(SelectColumn::EntityType);
        }
        let mut seen_attrs = BTreeSet::new();
        let mut seen_fks = BTreeSet::new();
        for name in self.model.subtree(entity)? {
            for attr in self.model.chain_attributes(&name)? {
                if seen_attrs.insert(attr.name.clone()) {
                    columns.push(SelectColumn::Attribute(attr.name.clone()));
                }
            }
            for (_, rel) in self.model.chain_relationships(&name)? {
                if rel.cardinality == Cardinality::ToOne
                    && seen_fks.insert(rel.name.clone())
                {
                    columns.push(SelectColumn::ToOne(rel.name.clone()));
                }
            }
        }
        Ok(columns)
    }

    /// `entity_type IN (?, ...)` over the entity's subtree, when the table
    /// carries the discriminator. `alias` may be empty for unaliased tables.
    fn discriminator_filter(
        &self,
        alias: &str,
        entity: &str,
    ) -> Result<Option<(String, Vec<Value>)>, StoreError> {
        if !self.model.table_has_discriminator(entity)? {
            return Ok(None);
        }
        let names = self.model.subtree(entity)?;
        let placeholders = vec!["?"; names.len()].join(", ");
        let prefix = if alias.is_empty() {
            String::new()
        } else {
            format!("{alias}.")
        };
        let fragment = format!("{prefix}\"{ENTITY_TYPE_COLUMN}\" IN ({placeholders})");
        let bindings = names.into_iter().map(Value::String).collect();
        Ok(Some((fragment, bindings)))
    }

    fn sort_term(&self, entity: &str, sort: &SortDescriptor) -> Result<String, StoreError> {
        if sort.key == ID_COLUMN {
            return Ok(format!(
                "t0.\"{ID_COLUMN}\" {}",
                if sort.ascending { "ASC" } else { "DESC" }
            ));
        }
        let attr = self.model.attribute(entity, &sort.key)?;
        Ok(format!(
            "t0.\"{}\" {}",
            SchemaSynthesizer::attribute_column(&attr.name),
            if sort.ascending { "ASC" } else { "DESC" }
        ))
    }

    /// Recursive predicate compilation. Returns the SQL fragment and its
    /// bind values in placeholder order.
    fn compile_predicate(
        &self,
        entity: &str,
        predicate: &Predicate,
        joins: &mut Joins,
    ) -> Result<(String, Vec<Value>), StoreError> {
        match predicate {
            Predicate::And(parts) => self.compile_connective(entity, parts, " AND ", "(1 = 1)", joins),
            Predicate::Or(parts) => self.compile_connective(entity, parts, " OR ", "(1 = 0)", joins),
            Predicate::Not(inner) => {
                let (fragment, bindings) = self.compile_predicate(entity, inner, joins)?;
                Ok((format!("(NOT {fragment})"), bindings))
            }
            Predicate::Compare {
                key_path,
                op,
                value,
            } => {
                let (expr, attr) = self.resolve_key_path(entity, key_path, joins)?;
                let bound = self.bind_literal(value, attr, key_path)?;
                Ok((format!("({expr} {} ?)", op.sql()), vec![bound]))
            }
            Predicate::In { key_path, values } => {
                if values.is_empty() {
                    // Membership in the empty set is false for every row.
                    return Ok(("(1 = 0)".to_string(), Vec::new()));
                }
                let (expr, attr) = self.resolve_key_path(entity, key_path, joins)?;
                let mut bindings = Vec::with_capacity(values.len());
                for value in values {
                    bindings.push(self.bind_literal(value, attr, key_path)?);
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                Ok((format!("({expr} IN ({placeholders}))"), bindings))
            }
        }
    }

    fn compile_connective(
        &self,
        entity: &str,
        parts: &[Predicate],
        separator: &str,
        empty: &str,
        joins: &mut Joins,
    ) -> Result<(String, Vec<Value>), StoreError> {
        if parts.is_empty() {
            return Ok((empty.to_string(), Vec::new()));
        }
        let mut fragments = Vec::with_capacity(parts.len());
        let mut bindings = Vec::new();
        for part in parts {
            let (fragment, part_bindings) = self.compile_predicate(entity, part, joins)?;
            fragments.push(fragment);
            bindings.extend(part_bindings);
        }
        Ok((format!("({})", fragments.join(separator)), bindings))
    }

    /// Encode a predicate literal for its attribute. Key paths ending in the
    /// id column bind raw integers.
    fn bind_literal(
        &self,
        value: &Value,
        attr: Option<&AttributeDescriptor>,
        key_path: &str,
    ) -> Result<Value, StoreError> {
        match attr {
            Some(attr) => bind(value, attr),
            None => match value {
                Value::Integer(_) => Ok(value.clone()),
                other => Err(StoreError::UnsupportedQuery {
                    message: format!(
                        "key path '{key_path}' compares row identifiers; got {}",
                        other.type_name()
                    ),
                }),
            },
        }
    }

    /// Resolve a dot-separated key path into a column expression, creating
    /// (or reusing) joins for each traversed relationship.
    ///
    /// Returns the column expression and the attribute descriptor of the
    /// final segment, or `None` when the path ends in the id column.
    fn resolve_key_path(
        &self,
        entity: &str,
        key_path: &str,
        joins: &mut Joins,
    ) -> Result<(String, Option<&'a AttributeDescriptor>), StoreError> {
        let segments: Vec<&str> = key_path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::UnsupportedQuery {
                message: format!("malformed key path '{key_path}'"),
            });
        }

        let mut current_entity = entity.to_string();
        let mut current_alias = "t0".to_string();
        let mut traversed = String::new();

        for segment in &segments[..segments.len() - 1] {
            if !traversed.is_empty() {
                traversed.push('.');
            }
            traversed.push_str(segment);

            if let Some((alias, reached)) = joins.aliases.get(&traversed) {
                current_alias = alias.clone();
                current_entity = reached.clone();
                continue;
            }

            let rel = self
                .model
                .relationship(&current_entity, segment)
                .map_err(|_| StoreError::UnsupportedQuery {
                    message: format!(
                        "key path '{key_path}' traverses '{segment}', which is not a relationship of '{current_entity}'"
                    ),
                })?;
            let alias = joins.next_alias();
            let target_table = self.model.table_name(&rel.target)?;

            let mut clause = if rel.cardinality == Cardinality::ToOne {
                format!(
                    "LEFT JOIN \"{target_table}\" {alias} ON {alias}.\"{ID_COLUMN}\" = {current_alias}.\"{}\"",
                    SchemaSynthesizer::fk_column(&rel.name)
                )
            } else if let Some(junction) = self.schema.junction(&current_entity, rel)? {
                joins.uses_to_many = true;
                let link = format!("{alias}_link");
                joins.clauses.push(format!(
                    "JOIN \"{}\" {link} ON {link}.\"{}\" = {current_alias}.\"{ID_COLUMN}\"",
                    junction.table, junction.owner_column
                ));
                format!(
                    "JOIN \"{target_table}\" {alias} ON {alias}.\"{ID_COLUMN}\" = {link}.\"{}\"",
                    junction.target_column
                )
            } else {
                joins.uses_to_many = true;
                let inverse =
                    self.model
                        .fk_backing(rel)?
                        .ok_or_else(|| StoreError::SchemaMismatch {
                            message: format!(
                                "relationship '{}' has neither a junction table nor a to-one inverse",
                                rel.name
                            ),
                        })?;
                format!(
                    "JOIN \"{target_table}\" {alias} ON {alias}.\"{}\" = {current_alias}.\"{ID_COLUMN}\"",
                    SchemaSynthesizer::fk_column(&inverse.name)
                )
            };

            // The subtree filter rides on the join so OR branches over the
            // same path cannot escape it.
            if let Some((fragment, names)) = self.discriminator_filter(&alias, &rel.target)? {
                clause.push_str(" AND ");
                clause.push_str(&fragment);
                joins.bindings.extend(names);
            }
            joins.clauses.push(clause);

            joins
                .aliases
                .insert(traversed.clone(), (alias.clone(), rel.target.clone()));
            current_alias = alias;
            current_entity = rel.target.clone();
        }

        let last = segments[segments.len() - 1];
        if last == ID_COLUMN {
            return Ok((format!("{current_alias}.\"{ID_COLUMN}\""), None));
        }
        let attr = self
            .model
            .attribute(&current_entity, last)
            .map_err(|_| StoreError::UnsupportedQuery {
                message: format!(
                    "key path '{key_path}' ends in '{last}', which is not an attribute of '{current_entity}'"
                ),
            })?;
        Ok((
            format!(
                "{current_alias}.\"{}\"",
                SchemaSynthesizer::attribute_column(&attr.name)
            ),
            Some(attr),
        ))
    }
}
