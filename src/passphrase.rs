//! Passphrase lifecycle: set on a fresh database, validate against an
//! existing one, change after validation.
//!
//! The manager is a small state machine over three states:
//!
//! - `Unset`: the file was freshly created and no key has been applied;
//! - `SetUnvalidated`: key material exists (either applied this session or
//!   inherited from a previous one) but has not been proven against the file;
//! - `Validated`: the key decrypted the file; data operations may proceed.
//!
//! Validation deliberately goes through a close/reopen cycle so stale key
//! material on the connection cannot mask a wrong passphrase. A failed
//! validation leaves the connection closed; callers observe that through
//! [`Engine::is_open`] and must reopen before retrying.

use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::StoreError;

/// Where the store stands in the passphrase lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseState {
    /// Fresh database, never keyed.
    Unset,
    /// Key material exists but has not been proven against the file.
    SetUnvalidated,
    /// The key decrypted the file; the store is ready for data operations.
    Validated,
}

/// Drives the passphrase state machine over an [`Engine`].
pub struct PassphraseManager {
    state: PassphraseState,
}

impl PassphraseManager {
    /// A manager for a database whose file state is already known:
    /// `Unset` for a fresh file, `SetUnvalidated` for an existing one.
    pub fn new(fresh_file: bool) -> Self {
        let state = if fresh_file {
            PassphraseState::Unset
        } else {
            PassphraseState::SetUnvalidated
        };
        Self { state }
    }

    pub fn state(&self) -> PassphraseState {
        self.state
    }

    /// Key a fresh database. Only valid in the `Unset` state; an existing
    /// database must be re-keyed through [`Self::change_passphrase`].
    ///
    /// The key material is applied but not yet proven, so the state moves to
    /// `SetUnvalidated`; a subsequent [`Self::validate_passphrase`] call
    /// unlocks data operations.
    pub fn set_passphrase(
        &mut self,
        engine: &mut Engine,
        passphrase: &str,
    ) -> Result<(), StoreError> {
        if self.state != PassphraseState::Unset {
            return Err(StoreError::AlreadyKeyed);
        }
        engine.apply_key(passphrase)?;
        self.state = PassphraseState::SetUnvalidated;
        debug!("passphrase set on fresh database");
        Ok(())
    }

    /// Prove a passphrase against the existing file.
    ///
    /// Runs against a fresh connection so key material from an earlier
    /// attempt cannot leak into this one. On failure the connection stays
    /// closed and the state falls back to `SetUnvalidated`.
    pub fn validate_passphrase(
        &mut self,
        engine: &mut Engine,
        passphrase: &str,
    ) -> Result<(), StoreError> {
        if self.state == PassphraseState::Unset {
            return Err(StoreError::IncorrectPasscode {
                message: "no passphrase has been set".to_string(),
            });
        }
        engine.reopen()?;
        let outcome = engine
            .apply_key(passphrase)
            .and_then(|()| engine.probe());
        match outcome {
            Ok(()) => {
                self.state = PassphraseState::Validated;
                debug!("passphrase validated");
                Ok(())
            }
            Err(err) => {
                engine.close();
                self.state = PassphraseState::SetUnvalidated;
                warn!("passphrase validation failed");
                Err(err)
            }
        }
    }

    /// Re-key the database from `old` to `new`.
    ///
    /// The old passphrase is validated first; a wrong old passphrase fails
    /// with `IncorrectPasscode` and never touches the key. The re-key itself
    /// is the engine's atomic primitive, so a failure there leaves the file
    /// readable under the old passphrase.
    pub fn change_passphrase(
        &mut self,
        engine: &mut Engine,
        old: &str,
        new: &str,
    ) -> Result<(), StoreError> {
        self.validate_passphrase(engine, old)?;
        engine.rekey(new)?;
        debug!("passphrase changed");
        Ok(())
    }
}
