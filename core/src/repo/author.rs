use anyhow::{Result, bail};

use super::mark_synced;
use crate::backend::StorageBackend;
use crate::error::StoreError;
use crate::models::{
    Author, EntityKind, NewAuthor, SyncRecord, SyncState, UpdateAuthor, new_id, now_timestamp,
    validate_name,
};

/// The single local author profile.
pub struct AuthorRepo<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> AuthorRepo<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        AuthorRepo { backend }
    }

    pub fn get(&self) -> Result<Option<Author>> {
        self.backend.get_author()
    }

    pub fn create(&self, new: NewAuthor) -> Result<Author> {
        validate_name("author display", &new.display_name)?;
        if self.backend.get_author()?.is_some() {
            bail!(StoreError::AlreadyExists(EntityKind::Author));
        }
        let now = now_timestamp();
        let author = Author {
            id: new_id(),
            display_name: new.display_name.trim().to_string(),
            avatar_uri: new.avatar_uri,
            email: new.email,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.backend.put_author(&author)?;
        Ok(author)
    }

    pub fn update(&self, patch: UpdateAuthor) -> Result<Author> {
        let mut author = self.require()?;
        if let Some(name) = patch.display_name {
            validate_name("author display", &name)?;
            author.display_name = name.trim().to_string();
        }
        if let Some(avatar_uri) = patch.avatar_uri {
            author.avatar_uri = avatar_uri;
        }
        if let Some(email) = patch.email {
            author.email = email;
        }
        author.touch();
        self.backend.put_author(&author)?;
        Ok(author)
    }

    pub fn mark_synced(&self, external_id: &str, synced_at: &str) -> Result<()> {
        let author = self.require()?;
        mark_synced(self.backend, EntityKind::Author, &author.id, external_id, synced_at)
    }

    fn require(&self) -> Result<Author> {
        self.backend
            .get_author()?
            .ok_or_else(|| StoreError::not_found(EntityKind::Author, "profile").into())
    }
}
