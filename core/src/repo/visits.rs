use anyhow::{Result, bail};
use chrono::DateTime;

use super::{ensure_existed, found, mark_synced};
use crate::backend::StorageBackend;
use crate::error::StoreError;
use crate::models::{
    Dish, EntityKind, NewDish, NewVisit, SyncRecord, SyncState, UpdateDish, UpdateVisit, Visit,
    new_id, now_timestamp, validate_dish_rating, validate_name,
};

fn validate_visited_at(visited_at: &str) -> Result<()> {
    if DateTime::parse_from_rfc3339(visited_at).is_err() {
        bail!(StoreError::Validation(format!(
            "visit time '{visited_at}'. Expected an RFC 3339 timestamp"
        )));
    }
    Ok(())
}

pub struct Visits<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> Visits<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        Visits { backend }
    }

    pub fn create(&self, new: NewVisit) -> Result<Visit> {
        found(
            self.backend.get_place(&new.place_id)?,
            EntityKind::Place,
            &new.place_id,
        )?;
        if let Some(visited_at) = &new.visited_at {
            validate_visited_at(visited_at)?;
        }

        let now = now_timestamp();
        let visit = Visit {
            id: new_id(),
            place_id: new.place_id,
            visited_at: new.visited_at.unwrap_or_else(|| now.clone()),
            notes: new.notes,
            photo_uri: new.photo_uri,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.backend.insert_visit(&visit)?;
        Ok(visit)
    }

    pub fn get(&self, id: &str) -> Result<Visit> {
        found(self.backend.get_visit(id)?, EntityKind::Visit, id)
    }

    /// All visits, or only those to `place_id`.
    pub fn list(&self, place_id: Option<&str>) -> Result<Vec<Visit>> {
        self.backend.list_visits(place_id)
    }

    pub fn update(&self, id: &str, patch: UpdateVisit) -> Result<Visit> {
        let mut visit = self.get(id)?;
        if let Some(visited_at) = patch.visited_at {
            validate_visited_at(&visited_at)?;
            visit.visited_at = visited_at;
        }
        if let Some(notes) = patch.notes {
            visit.notes = notes;
        }
        if let Some(photo_uri) = patch.photo_uri {
            visit.photo_uri = photo_uri;
        }
        visit.touch();
        self.backend.update_visit(&visit)?;
        Ok(visit)
    }

    /// Delete a visit and its dishes.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_existed(self.backend.delete_visit(id)?, EntityKind::Visit, id)
    }

    pub fn mark_synced(&self, id: &str, external_id: &str, synced_at: &str) -> Result<()> {
        mark_synced(self.backend, EntityKind::Visit, id, external_id, synced_at)
    }
}

pub struct Dishes<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> Dishes<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> Self {
        Dishes { backend }
    }

    pub fn create(&self, new: NewDish) -> Result<Dish> {
        validate_name("dish", &new.name)?;
        validate_dish_rating(new.rating)?;
        found(
            self.backend.get_visit(&new.visit_id)?,
            EntityKind::Visit,
            &new.visit_id,
        )?;

        let now = now_timestamp();
        let dish = Dish {
            id: new_id(),
            visit_id: new.visit_id,
            name: new.name.trim().to_string(),
            category_id: new.category_id,
            rating: new.rating,
            notes: new.notes,
            photo_uri: new.photo_uri,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.backend.insert_dish(&dish)?;
        Ok(dish)
    }

    pub fn get(&self, id: &str) -> Result<Dish> {
        found(self.backend.get_dish(id)?, EntityKind::Dish, id)
    }

    /// All dishes, or only those from `visit_id`.
    pub fn list(&self, visit_id: Option<&str>) -> Result<Vec<Dish>> {
        self.backend.list_dishes(visit_id)
    }

    pub fn update(&self, id: &str, patch: UpdateDish) -> Result<Dish> {
        let mut dish = self.get(id)?;
        if let Some(name) = patch.name {
            validate_name("dish", &name)?;
            dish.name = name.trim().to_string();
        }
        if let Some(category_id) = patch.category_id {
            dish.category_id = category_id;
        }
        if let Some(rating) = patch.rating {
            validate_dish_rating(rating)?;
            dish.rating = rating;
        }
        if let Some(notes) = patch.notes {
            dish.notes = notes;
        }
        if let Some(photo_uri) = patch.photo_uri {
            dish.photo_uri = photo_uri;
        }
        dish.touch();
        self.backend.update_dish(&dish)?;
        Ok(dish)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        ensure_existed(self.backend.delete_dish(id)?, EntityKind::Dish, id)
    }

    pub fn mark_synced(&self, id: &str, external_id: &str, synced_at: &str) -> Result<()> {
        mark_synced(self.backend, EntityKind::Dish, id, external_id, synced_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::error::is_not_found;
    use crate::models::NewPlace;
    use crate::repo::Repository;

    fn repo_with_place() -> (Repository, String) {
        let repo = Repository::open_in_memory(BackendKind::Kv).unwrap();
        let place = repo
            .places()
            .create(NewPlace {
                name: "Noodle Bar".to_string(),
                ..NewPlace::default()
            })
            .unwrap();
        (repo, place.id)
    }

    fn sample_dish(visit_id: &str) -> NewDish {
        NewDish {
            visit_id: visit_id.to_string(),
            name: "Dan dan noodles".to_string(),
            rating: 5,
            ..NewDish::default()
        }
    }

    #[test]
    fn test_visit_requires_place() {
        let (repo, _) = repo_with_place();
        let err = repo
            .visits()
            .create(NewVisit {
                place_id: "nowhere".to_string(),
                ..NewVisit::default()
            })
            .unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_visit_defaults_visited_at() {
        let (repo, place_id) = repo_with_place();
        let visit = repo
            .visits()
            .create(NewVisit {
                place_id: place_id.clone(),
                ..NewVisit::default()
            })
            .unwrap();
        assert_eq!(visit.visited_at, visit.created_at);

        let dated = repo
            .visits()
            .create(NewVisit {
                place_id,
                visited_at: Some("2024-03-01T19:30:00Z".to_string()),
                ..NewVisit::default()
            })
            .unwrap();
        assert_eq!(dated.visited_at, "2024-03-01T19:30:00Z");
    }

    #[test]
    fn test_visit_rejects_bad_timestamp() {
        let (repo, place_id) = repo_with_place();
        let err = repo
            .visits()
            .create(NewVisit {
                place_id,
                visited_at: Some("last tuesday".to_string()),
                ..NewVisit::default()
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_list_visits_by_place() {
        let (repo, place_id) = repo_with_place();
        let other = repo
            .places()
            .create(NewPlace {
                name: "Other".to_string(),
                ..NewPlace::default()
            })
            .unwrap();
        for id in [&place_id, &other.id, &place_id] {
            repo.visits()
                .create(NewVisit {
                    place_id: id.clone(),
                    ..NewVisit::default()
                })
                .unwrap();
        }
        assert_eq!(repo.visits().list(Some(&place_id)).unwrap().len(), 2);
        assert_eq!(repo.visits().list(None).unwrap().len(), 3);
    }

    #[test]
    fn test_dish_rating_bounds() {
        let (repo, place_id) = repo_with_place();
        let visit = repo
            .visits()
            .create(NewVisit {
                place_id,
                ..NewVisit::default()
            })
            .unwrap();

        let too_high = NewDish {
            rating: 6,
            ..sample_dish(&visit.id)
        };
        assert!(repo.dishes().create(too_high).is_err());

        let dish = repo.dishes().create(sample_dish(&visit.id)).unwrap();
        let err = repo
            .dishes()
            .update(
                &dish.id,
                UpdateDish {
                    rating: Some(0),
                    ..UpdateDish::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(_))
        ));
        assert_eq!(repo.dishes().get(&dish.id).unwrap().rating, 5);
    }

    #[test]
    fn test_delete_visit_removes_dishes() {
        let (repo, place_id) = repo_with_place();
        let visit = repo
            .visits()
            .create(NewVisit {
                place_id,
                ..NewVisit::default()
            })
            .unwrap();
        let dish = repo.dishes().create(sample_dish(&visit.id)).unwrap();

        repo.visits().delete(&visit.id).unwrap();
        assert!(is_not_found(&repo.dishes().get(&dish.id).unwrap_err()));
        assert!(is_not_found(&repo.visits().delete(&visit.id).unwrap_err()));
    }

    #[test]
    fn test_update_dish_keeps_sync_id() {
        let (repo, place_id) = repo_with_place();
        let visit = repo
            .visits()
            .create(NewVisit {
                place_id,
                ..NewVisit::default()
            })
            .unwrap();
        let dish = repo.dishes().create(sample_dish(&visit.id)).unwrap();
        repo.dishes().mark_synced(&dish.id, "remote-dish", "t").unwrap();

        let updated = repo
            .dishes()
            .update(
                &dish.id,
                UpdateDish {
                    notes: Some(Some("extra chili".to_string())),
                    ..UpdateDish::default()
                },
            )
            .unwrap();
        assert!(updated.sync.dirty);
        assert_eq!(updated.sync.external_id.as_deref(), Some("remote-dish"));
        assert_eq!(updated.sync.last_synced_at.as_deref(), Some("t"));
    }
}
