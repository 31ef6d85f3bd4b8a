use anyhow::{Result, bail};

use super::{ensure_existed, found, mark_synced};
use crate::backend::StorageBackend;
use crate::error::StoreError;
use crate::models::{
    Category, CategoryType, EntityKind, NewCategory, NewTag, SyncRecord, SyncState, Tag,
    UpdateCategory, UpdateTag, new_id, now_timestamp, tag_names_match, validate_name,
};

pub struct Categories<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> Categories<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        Categories { backend }
    }

    pub fn create(&self, new: NewCategory) -> Result<Category> {
        validate_name("category", &new.name)?;
        if let Some(parent_id) = &new.parent_id {
            self.get(parent_id)?;
        }
        let order = match new.order {
            Some(order) => order,
            None => self
                .list(Some(new.category_type))?
                .iter()
                .map(|c| c.order)
                .max()
                .map_or(0, |max| max + 1),
        };

        let now = now_timestamp();
        let category = Category {
            id: new_id(),
            name: new.name.trim().to_string(),
            category_type: new.category_type,
            parent_id: new.parent_id,
            order,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.backend.insert_category(&category)?;
        Ok(category)
    }

    pub fn get(&self, id: &str) -> Result<Category> {
        found(self.backend.get_category(id)?, EntityKind::Category, id)
    }

    /// Categories ascending by `order`, ties in insertion order.
    pub fn list(&self, category_type: Option<CategoryType>) -> Result<Vec<Category>> {
        let mut categories = self.backend.list_categories(category_type)?;
        categories.sort_by_key(|c| c.order);
        Ok(categories)
    }

    pub fn update(&self, id: &str, patch: UpdateCategory) -> Result<Category> {
        let mut category = self.get(id)?;
        if let Some(name) = patch.name {
            validate_name("category", &name)?;
            category.name = name.trim().to_string();
        }
        if let Some(parent_id) = patch.parent_id {
            if let Some(parent) = &parent_id {
                if parent == id {
                    bail!(StoreError::Validation(format!(
                        "category parent: {id} cannot be its own parent"
                    )));
                }
                self.get(parent)?;
            }
            category.parent_id = parent_id;
        }
        if let Some(order) = patch.order {
            category.order = order;
        }
        category.touch();
        self.backend.update_category(&category)?;
        Ok(category)
    }

    /// Delete a category. Places and dishes that point at it keep the
    /// dangling reference.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_existed(self.backend.delete_category(id)?, EntityKind::Category, id)
    }

    /// Renumber the given categories 0..n in the order listed.
    pub fn reorder(&self, category_type: CategoryType, ids: &[String]) -> Result<Vec<Category>> {
        let mut categories = Vec::with_capacity(ids.len());
        for id in ids {
            let category = self.get(id)?;
            if category.category_type != category_type {
                bail!(StoreError::Validation(format!(
                    "reorder: category {id} is a {} category, not {}",
                    category.category_type.as_str(),
                    category_type.as_str()
                )));
            }
            categories.push(category);
        }
        for (position, mut category) in categories.into_iter().enumerate() {
            let order = i64::try_from(position)?;
            if category.order != order {
                category.order = order;
                category.touch();
                self.backend.update_category(&category)?;
            }
        }
        self.list(Some(category_type))
    }

    pub fn mark_synced(&self, id: &str, external_id: &str, synced_at: &str) -> Result<()> {
        mark_synced(self.backend, EntityKind::Category, id, external_id, synced_at)
    }
}

pub struct Tags<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> Tags<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        Tags { backend }
    }

    /// Create a tag. Names are unique ignoring case.
    pub fn create(&self, new: NewTag) -> Result<Tag> {
        validate_name("tag", &new.name)?;
        self.ensure_unique(&new.name, None)?;

        let now = now_timestamp();
        let tag = Tag {
            id: new_id(),
            name: new.name.trim().to_string(),
            color: new.color,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.backend.insert_tag(&tag)?;
        Ok(tag)
    }

    pub fn get(&self, id: &str) -> Result<Tag> {
        found(self.backend.get_tag(id)?, EntityKind::Tag, id)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Tag>> {
        Ok(self
            .backend
            .list_tags()?
            .into_iter()
            .find(|t| tag_names_match(&t.name, name)))
    }

    pub fn list(&self) -> Result<Vec<Tag>> {
        self.backend.list_tags()
    }

    pub fn update(&self, id: &str, patch: UpdateTag) -> Result<Tag> {
        let mut tag = self.get(id)?;
        if let Some(name) = patch.name {
            validate_name("tag", &name)?;
            self.ensure_unique(&name, Some(id))?;
            tag.name = name.trim().to_string();
        }
        if let Some(color) = patch.color {
            tag.color = color;
        }
        tag.touch();
        self.backend.update_tag(&tag)?;
        Ok(tag)
    }

    /// Delete a tag and unlink it from every place.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_existed(self.backend.delete_tag(id)?, EntityKind::Tag, id)
    }

    pub fn mark_synced(&self, id: &str, external_id: &str, synced_at: &str) -> Result<()> {
        mark_synced(self.backend, EntityKind::Tag, id, external_id, synced_at)
    }

    fn ensure_unique(&self, name: &str, except: Option<&str>) -> Result<()> {
        let clash = self
            .backend
            .list_tags()?
            .into_iter()
            .any(|t| Some(t.id.as_str()) != except && tag_names_match(&t.name, name));
        if clash {
            bail!(StoreError::DuplicateName(name.trim().to_string()));
        }
        Ok(())
    }
}
