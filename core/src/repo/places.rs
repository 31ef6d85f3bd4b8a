use std::collections::{HashMap, HashSet};

use anyhow::Result;

use super::{ensure_existed, found, mark_synced, mean};
use crate::backend::{RelationOwner, RelationWrite, StorageBackend};
use crate::models::{
    EntityKind, NewPlace, Place, PlaceTag, RatingMode, SyncRecord, SyncState, UpdatePlace,
    new_id, now_timestamp, validate_coordinates, validate_manual_rating, validate_name,
};

pub struct Places<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> Places<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        Places { backend }
    }

    pub fn create(&self, new: NewPlace) -> Result<Place> {
        validate_name("place", &new.name)?;
        validate_coordinates(new.latitude, new.longitude)?;
        validate_manual_rating(new.overall_rating_manual)?;

        let now = now_timestamp();
        let place = Place {
            id: new_id(),
            name: new.name.trim().to_string(),
            address: new.address,
            latitude: new.latitude,
            longitude: new.longitude,
            category_id: new.category_id,
            notes: new.notes,
            overall_rating_manual: new.overall_rating_manual,
            rating_mode: new.rating_mode,
            cover_image_uri: new.cover_image_uri,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
            tag_ids: Vec::new(),
        };
        self.backend.insert_place(&place)?;
        Ok(place)
    }

    /// The place with its `tag_ids` filled in.
    pub fn get(&self, id: &str) -> Result<Place> {
        let mut place = self.stored(id)?;
        place.tag_ids = self.tag_ids(id)?;
        Ok(place)
    }

    pub fn list(&self) -> Result<Vec<Place>> {
        let mut tags_by_place: HashMap<String, Vec<String>> = HashMap::new();
        for link in self.backend.list_place_tags(None)? {
            tags_by_place
                .entry(link.place_id)
                .or_default()
                .push(link.tag_id);
        }
        let mut places = self.backend.list_places()?;
        for place in &mut places {
            place.tag_ids = tags_by_place.remove(&place.id).unwrap_or_default();
        }
        Ok(places)
    }

    pub fn update(&self, id: &str, patch: UpdatePlace) -> Result<Place> {
        let mut place = self.stored(id)?;

        if let Some(name) = patch.name {
            validate_name("place", &name)?;
            place.name = name.trim().to_string();
        }
        if let Some(address) = patch.address {
            place.address = address;
        }
        if let Some(latitude) = patch.latitude {
            place.latitude = latitude;
        }
        if let Some(longitude) = patch.longitude {
            place.longitude = longitude;
        }
        validate_coordinates(place.latitude, place.longitude)?;
        if let Some(category_id) = patch.category_id {
            place.category_id = category_id;
        }
        if let Some(notes) = patch.notes {
            place.notes = notes;
        }
        if let Some(rating) = patch.overall_rating_manual {
            validate_manual_rating(rating)?;
            place.overall_rating_manual = rating;
        }
        if let Some(mode) = patch.rating_mode {
            place.rating_mode = mode;
        }
        if let Some(uri) = patch.cover_image_uri {
            place.cover_image_uri = uri;
        }

        place.touch();
        self.backend.update_place(&place)?;
        place.tag_ids = self.tag_ids(id)?;
        Ok(place)
    }

    /// Delete a place together with its visits, their dishes, its list
    /// memberships and its tags.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_existed(self.backend.delete_place(id)?, EntityKind::Place, id)
    }

    pub fn mark_synced(&self, id: &str, external_id: &str, synced_at: &str) -> Result<()> {
        mark_synced(self.backend, EntityKind::Place, id, external_id, synced_at)
    }

    /// Tag a place. Returns false if it already carried the tag.
    pub fn add_tag(&self, place_id: &str, tag_id: &str) -> Result<bool> {
        let mut place = self.stored(place_id)?;
        found(self.backend.get_tag(tag_id)?, EntityKind::Tag, tag_id)?;
        if self.tag_ids(place_id)?.iter().any(|t| t == tag_id) {
            return Ok(false);
        }

        let link = PlaceTag {
            place_id: place_id.to_string(),
            tag_id: tag_id.to_string(),
            created_at: now_timestamp(),
        };
        place.touch();
        self.backend.apply_relation_edit(
            &[RelationWrite::InsertPlaceTag(&link)],
            RelationOwner::Place(&place),
        )?;
        Ok(true)
    }

    /// Untag a place. Returns false if it did not carry the tag.
    pub fn remove_tag(&self, place_id: &str, tag_id: &str) -> Result<bool> {
        let mut place = self.stored(place_id)?;
        if !self.tag_ids(place_id)?.iter().any(|t| t == tag_id) {
            return Ok(false);
        }
        place.touch();
        self.backend.apply_relation_edit(
            &[RelationWrite::DeletePlaceTag { place_id, tag_id }],
            RelationOwner::Place(&place),
        )?;
        Ok(true)
    }

    /// Replace the place's tag set. Every tag must exist.
    pub fn set_tags(&self, place_id: &str, tag_ids: &[String]) -> Result<Place> {
        let mut place = self.stored(place_id)?;
        for tag_id in tag_ids {
            found(self.backend.get_tag(tag_id)?, EntityKind::Tag, tag_id)?;
        }

        let current = self.tag_ids(place_id)?;
        let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
        let wanted: HashSet<&str> = tag_ids.iter().map(String::as_str).collect();

        let created_at = now_timestamp();
        let mut added: Vec<PlaceTag> = Vec::new();
        for tag_id in tag_ids {
            if !current_set.contains(tag_id.as_str()) && !added.iter().any(|l| &l.tag_id == tag_id) {
                added.push(PlaceTag {
                    place_id: place_id.to_string(),
                    tag_id: tag_id.clone(),
                    created_at: created_at.clone(),
                });
            }
        }
        let mut writes: Vec<RelationWrite<'_>> = current
            .iter()
            .filter(|tag_id| !wanted.contains(tag_id.as_str()))
            .map(|tag_id| RelationWrite::DeletePlaceTag {
                place_id,
                tag_id: tag_id.as_str(),
            })
            .collect();
        writes.extend(added.iter().map(RelationWrite::InsertPlaceTag));

        if !writes.is_empty() {
            place.touch();
            self.backend
                .apply_relation_edit(&writes, RelationOwner::Place(&place))?;
        }
        place.tag_ids = self.tag_ids(place_id)?;
        Ok(place)
    }

    /// The place's effective rating: the manual override in `overall` mode,
    /// otherwise the mean dish rating across its visits.
    pub fn rating(&self, id: &str) -> Result<Option<f64>> {
        let place = self.stored(id)?;
        effective_rating(self.backend, &place)
    }

    fn stored(&self, id: &str) -> Result<Place> {
        found(self.backend.get_place(id)?, EntityKind::Place, id)
    }

    fn tag_ids(&self, place_id: &str) -> Result<Vec<String>> {
        Ok(self
            .backend
            .list_place_tags(Some(place_id))?
            .into_iter()
            .map(|link| link.tag_id)
            .collect())
    }
}

pub(super) fn effective_rating(backend: &dyn StorageBackend, place: &Place) -> Result<Option<f64>> {
    match place.rating_mode {
        RatingMode::Overall => Ok(place.overall_rating_manual),
        RatingMode::Aggregate => {
            let mut ratings = Vec::new();
            for visit in backend.list_visits(Some(&place.id))? {
                for dish in backend.list_dishes(Some(&visit.id))? {
                    ratings.push(f64::from(dish.rating));
                }
            }
            Ok(mean(ratings))
        }
    }
}
