//! Error taxonomy for the encrypted store.
//!
//! Every failure the crate can surface is one of the variants below. Raw
//! engine errors (`rusqlite::Error`) are mapped into this taxonomy at the
//! engine boundary and never leak to callers; upstream collaborators depend
//! only on these kinds.
//!
//! # Engine mapping policy
//!
//! - keying/open failures (file unreadable under the presented key) →
//!   [`StoreError::IncorrectPasscode`]
//! - DDL and table-shape failures → [`StoreError::SchemaMismatch`]
//! - statement preparation failures → [`StoreError::UnsupportedQuery`]
//! - row step/decode failures → [`StoreError::CorruptRow`]
//! - re-key failures after a successful validation →
//!   [`StoreError::MigrationFailed`]
//!
//! The mapped variants carry the engine message as context text only.

use thiserror::Error;

/// Errors surfaced by the encrypted store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database file could not be opened at all (missing directory,
    /// permissions). Raised before any key material is involved.
    #[error("Failed to open database '{path}': {message}")]
    OpenFailed { path: String, message: String },

    /// The presented passphrase does not unlock the database file.
    #[error("Incorrect passcode: {message}")]
    IncorrectPasscode { message: String },

    /// A passphrase has already been applied; `set_passphrase` is only valid
    /// on a freshly created, never-keyed database.
    #[error("Database is already keyed; use change_passphrase instead")]
    AlreadyKeyed,

    /// A fetch/apply/resolve operation was attempted before the passphrase
    /// was validated.
    #[error("Store is not ready: passphrase has not been validated")]
    StoreNotReady,

    /// The on-disk schema conflicts with the model metadata (missing column,
    /// type mismatch). Existing columns are never silently altered.
    #[error("Schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// A predicate, sort key, or key path the compiler cannot translate.
    #[error("Unsupported query: {message}")]
    UnsupportedQuery { message: String },

    /// A stored column value cannot be decoded under its declared semantic
    /// type. Surfaced instead of silently producing a wrong value.
    #[error("Corrupt row: {message}")]
    CorruptRow { message: String },

    /// A deletion was denied because dependents exist under a `Deny` rule.
    #[error("Delete denied for {entity} row {id}: {message}")]
    DeleteDenied {
        entity: String,
        id: i64,
        message: String,
    },

    /// The re-key operation failed after the old passphrase validated. The
    /// database remains recoverable under the old passphrase.
    #[error("Passphrase migration failed: {message}")]
    MigrationFailed { message: String },
}

impl StoreError {
    /// Wrap an error with the record it was processing, preserving the kind.
    ///
    /// Used by the change applier so a transaction failure identifies the
    /// failing record without changing the error taxonomy.
    pub(crate) fn for_record(self, entity: &str, id: i64) -> StoreError {
        let tag = |message: String| format!("{entity} row {id}: {message}");
        match self {
            StoreError::SchemaMismatch { message } => StoreError::SchemaMismatch {
                message: tag(message),
            },
            StoreError::UnsupportedQuery { message } => StoreError::UnsupportedQuery {
                message: tag(message),
            },
            StoreError::CorruptRow { message } => StoreError::CorruptRow {
                message: tag(message),
            },
            other => other,
        }
    }
}
