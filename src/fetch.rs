//! Fetch specifications: entity, predicate tree, sort keys, limit/offset.
//!
//! A [`FetchSpec`] is the declarative description of a read request. The SQL
//! compiler translates it into a parameterized statement; nothing here
//! touches the database.
//!
//! Key paths are dot-separated: every segment but the last names a
//! relationship to traverse, the last names an attribute on the entity
//! reached (`"title"`, `"tags.name"`, `"author.employer.name"`).

use crate::value::Value;

/// Comparison operators the compiler can translate.
///
/// Each maps to a parameterized SQL operator; membership tests use the
/// dedicated [`Predicate::In`] node because they bind a value list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CompareOp {
    /// The SQL operator token.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// A predicate tree over attribute or relationship key paths.
///
/// Boolean combinators map to SQL `AND`/`OR`/`NOT`; comparisons emit bind
/// placeholders for every literal, never interpolated text.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        key_path: String,
        op: CompareOp,
        value: Value,
    },
    In {
        key_path: String,
        values: Vec<Value>,
    },
}

impl Predicate {
    /// Convenience constructor for a comparison leaf.
    pub fn compare(key_path: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Predicate::Compare {
            key_path: key_path.into(),
            op,
            value,
        }
    }

    /// Convenience constructor for an equality comparison.
    pub fn eq(key_path: impl Into<String>, value: Value) -> Self {
        Self::compare(key_path, CompareOp::Eq, value)
    }
}

/// One sort key; ties across all keys are broken by row identifier ascending
/// for deterministic results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// A complete read request against one entity.
#[derive(Debug, Clone)]
pub struct FetchSpec {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Fetch only row identifiers, skipping attribute columns.
    pub ids_only: bool,
}

impl FetchSpec {
    /// A fetch of every row of an entity, unsorted beyond the id tie-break.
    pub fn all(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort: Vec::new(),
            limit: None,
            offset: None,
            ids_only: false,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_sort(mut self, sort: SortDescriptor) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn ids_only(mut self) -> Self {
        self.ids_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_sql_tokens() {
        assert_eq!(CompareOp::Eq.sql(), "=");
        assert_eq!(CompareOp::Lt.sql(), "<");
        assert_eq!(CompareOp::Like.sql(), "LIKE");
    }

    #[test]
    fn test_spec_builder() {
        let spec = FetchSpec::all("Post")
            .with_predicate(Predicate::eq("title", Value::String("Hello".to_string())))
            .with_sort(SortDescriptor::descending("title"))
            .with_limit(10)
            .with_offset(5);

        assert_eq!(spec.entity, "Post");
        assert!(spec.predicate.is_some());
        assert_eq!(spec.sort.len(), 1);
        assert!(!spec.sort[0].ascending);
        assert_eq!(spec.limit, Some(10));
        assert_eq!(spec.offset, Some(5));
        assert!(!spec.ids_only);
    }
}
