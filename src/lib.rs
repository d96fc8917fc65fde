//! encrypted_store library - Encrypted object-graph persistence
//!
//! Persists a typed object graph into an encrypted SQLite database: schema
//! synthesis from entity metadata, predicate compilation into parameterized
//! SQL, row materialization into typed values, transactional change
//! application with delete rules, and a passphrase lifecycle over the
//! encrypted file.

pub mod apply;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod model;
pub mod passphrase;
pub mod schema;
pub mod store;
pub mod value;

pub use apply::{
    NewRecord, RecordRef, RecordUpdate, SaveRequest, SaveResult, ToManyChange,
};
pub use error::StoreError;
pub use fetch::{CompareOp, FetchSpec, Predicate, SortDescriptor};
pub use model::{
    AttributeDescriptor, AttributeType, Cardinality, DeleteRule, EntityDescriptor, Model,
    RelationshipDescriptor, RowId, ValueTransformer,
};
pub use passphrase::PassphraseState;
pub use store::{EncryptedStore, FetchedRow, ResolvedRelationship, StoreOptions};
pub use value::Value;
