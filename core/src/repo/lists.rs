use std::collections::{HashMap, HashSet};

use anyhow::{Result, bail};

use super::places::effective_rating;
use super::{ensure_existed, found, mark_synced, mean};
use crate::backend::{RelationOwner, RelationWrite, StorageBackend};
use crate::error::StoreError;
use crate::models::{
    EntityKind, List, ListItem, NewList, Place, SyncRecord, SyncState, UpdateList, new_id,
    now_timestamp, validate_name,
};

pub struct Lists<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> Lists<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        Lists { backend }
    }

    pub fn create(&self, new: NewList) -> Result<List> {
        validate_name("list", &new.name)?;
        let now = now_timestamp();
        let list = List {
            id: new_id(),
            name: new.name.trim().to_string(),
            description: new.description,
            category: new.category,
            city: new.city,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
            overall_rating: None,
        };
        self.backend.insert_list(&list)?;
        Ok(list)
    }

    /// The list with `overall_rating` computed from its member places.
    pub fn get(&self, id: &str) -> Result<List> {
        let mut list = self.stored(id)?;
        list.overall_rating = self.overall_rating(id)?;
        Ok(list)
    }

    pub fn list(&self) -> Result<Vec<List>> {
        let mut lists = self.backend.list_lists()?;
        for list in &mut lists {
            list.overall_rating = self.overall_rating(&list.id)?;
        }
        Ok(lists)
    }

    pub fn update(&self, id: &str, patch: UpdateList) -> Result<List> {
        let mut list = self.stored(id)?;
        if let Some(name) = patch.name {
            validate_name("list", &name)?;
            list.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            list.description = description;
        }
        if let Some(category) = patch.category {
            list.category = category;
        }
        if let Some(city) = patch.city {
            list.city = city;
        }
        list.touch();
        self.backend.update_list(&list)?;
        list.overall_rating = self.overall_rating(id)?;
        Ok(list)
    }

    /// Delete a list and its items. The places themselves are kept.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_existed(self.backend.delete_list(id)?, EntityKind::List, id)
    }

    pub fn mark_synced(&self, id: &str, external_id: &str, synced_at: &str) -> Result<()> {
        mark_synced(self.backend, EntityKind::List, id, external_id, synced_at)
    }

    /// Append a place to the list. If the place is already a member its
    /// existing item is returned unchanged.
    pub fn add_place(&self, list_id: &str, place_id: &str) -> Result<ListItem> {
        let mut list = self.stored(list_id)?;
        found(self.backend.get_place(place_id)?, EntityKind::Place, place_id)?;

        let items = self.backend.list_items(list_id)?;
        if let Some(existing) = items.iter().find(|i| i.place_id == place_id) {
            return Ok(existing.clone());
        }

        let order = match items.iter().map(|i| i.order).max() {
            None => 0,
            Some(max) => max.checked_add(1).ok_or_else(|| {
                StoreError::Validation(format!(
                    "list {list_id} has no order value left after {max}; reorder it first"
                ))
            })?,
        };
        let item = ListItem {
            id: new_id(),
            list_id: list_id.to_string(),
            place_id: place_id.to_string(),
            order,
            created_at: now_timestamp(),
        };
        list.touch();
        self.backend.apply_relation_edit(
            &[RelationWrite::InsertListItem(&item)],
            RelationOwner::List(&list),
        )?;
        Ok(item)
    }

    /// Remove one item. Remaining items keep their order values.
    pub fn remove_item(&self, item_id: &str) -> Result<()> {
        let item = found(
            self.backend.get_list_item(item_id)?,
            EntityKind::ListItem,
            item_id,
        )?;
        let mut list = self.stored(&item.list_id)?;
        list.touch();
        self.backend.apply_relation_edit(
            &[RelationWrite::DeleteListItem(item_id)],
            RelationOwner::List(&list),
        )
    }

    /// Remove a place from the list. Returns false if it was not a member.
    pub fn remove_place(&self, list_id: &str, place_id: &str) -> Result<bool> {
        let mut list = self.stored(list_id)?;
        let items = self.backend.list_items(list_id)?;
        let writes: Vec<RelationWrite<'_>> = items
            .iter()
            .filter(|item| item.place_id == place_id)
            .map(|item| RelationWrite::DeleteListItem(item.id.as_str()))
            .collect();
        if writes.is_empty() {
            return Ok(false);
        }
        list.touch();
        self.backend
            .apply_relation_edit(&writes, RelationOwner::List(&list))?;
        Ok(true)
    }

    /// Items ascending by `order`, ties in insertion order.
    pub fn items(&self, list_id: &str) -> Result<Vec<ListItem>> {
        self.stored(list_id)?;
        self.backend.list_items(list_id)
    }

    /// Member places in item order.
    pub fn places(&self, list_id: &str) -> Result<Vec<Place>> {
        let places = super::Places::new(self.backend);
        self.items(list_id)?
            .iter()
            .map(|item| places.get(&item.place_id))
            .collect()
    }

    /// Renumber the list's items 0..n in the given order. `item_ids` must
    /// name every item of the list exactly once.
    pub fn reorder(&self, list_id: &str, item_ids: &[String]) -> Result<Vec<ListItem>> {
        let mut list = self.stored(list_id)?;
        let items = self.backend.list_items(list_id)?;
        let by_id: HashMap<&str, &ListItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();
        let wanted: HashSet<&str> = item_ids.iter().map(String::as_str).collect();
        if wanted.len() != item_ids.len()
            || wanted.len() != by_id.len()
            || !wanted.iter().all(|id| by_id.contains_key(id))
        {
            bail!(StoreError::Validation(format!(
                "reorder of list {list_id}: expected each of its {} items exactly once",
                items.len()
            )));
        }

        let mut renumbered = Vec::new();
        for (position, item_id) in item_ids.iter().enumerate() {
            let item = by_id[item_id.as_str()];
            let order = i64::try_from(position)?;
            if item.order != order {
                renumbered.push(ListItem {
                    order,
                    ..item.clone()
                });
            }
        }
        let writes: Vec<RelationWrite<'_>> =
            renumbered.iter().map(RelationWrite::UpdateListItem).collect();
        list.touch();
        self.backend
            .apply_relation_edit(&writes, RelationOwner::List(&list))?;
        self.backend.list_items(list_id)
    }

    fn stored(&self, id: &str) -> Result<List> {
        found(self.backend.get_list(id)?, EntityKind::List, id)
    }

    fn overall_rating(&self, list_id: &str) -> Result<Option<f64>> {
        let mut ratings = Vec::new();
        for item in self.backend.list_items(list_id)? {
            if let Some(place) = self.backend.get_place(&item.place_id)? {
                ratings.extend(effective_rating(self.backend, &place)?);
            }
        }
        Ok(mean(ratings))
    }
}
