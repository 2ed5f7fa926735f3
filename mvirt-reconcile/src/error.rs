//! Error types for the reconciliation engine.

use thiserror::Error;

use crate::diff::ActionKind;
use crate::model::{Kind, ObjectRef};
use crate::store::StoreError;

/// Defects in configuration or manager output. Fatal to the current pass.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("no comparator registered for kind {0}")]
    UnregisteredKind(Kind),

    #[error("duplicate {set} object {object}")]
    DuplicateIdentity { set: &'static str, object: ObjectRef },

    #[error("desired object {object} is outside scope of namespace {namespace}")]
    OutOfScope { object: ObjectRef, namespace: String },
}

/// A stack descriptor value a manager cannot turn into objects. Fails only that manager.
#[derive(Debug, Clone, Error)]
#[error("invalid value for {field}: {reason}")]
pub struct InvalidSpec {
    pub field: &'static str,
    pub reason: String,
}

/// Errors surfaced by a reconciliation pass.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid stack: {0}")]
    InvalidSpec(#[from] InvalidSpec),

    #[error("backend failure: {0}")]
    Backend(#[source] StoreError),

    #[error("{action} {object} failed: {source}")]
    Action {
        action: ActionKind,
        object: ObjectRef,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Configuration errors abort the whole pass rather than a single manager.
    /// An invalid stack value only fails the manager that read it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Config(_))
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        ReconcileError::Backend(e)
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
