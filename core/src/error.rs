use crate::models::EntityKind;

/// Domain failures the store surfaces to callers.
///
/// Carried inside `anyhow::Error`; classify with
/// `err.downcast_ref::<StoreError>()`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("a tag named '{0}' already exists")]
    DuplicateName(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invalid backup: {0}")]
    ImportFormatInvalid(String),

    #[error("invalid {0}")]
    Validation(String),

    #[error("{0} already exists")]
    AlreadyExists(EntityKind),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// True when `err` wraps a [`StoreError::NotFound`].
#[must_use]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound { .. })
    )
}
