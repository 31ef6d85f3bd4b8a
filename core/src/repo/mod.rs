//! The repository facade: one CRUD surface per entity, identical over every
//! backend, plus the bookkeeping the sync engine needs.

mod author;
mod lists;
mod places;
mod taxonomy;
mod visits;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde::Serialize;

use crate::backend::{Acknowledgement, BackendKind, StorageBackend, StoreLocation, open_backend};
use crate::error::StoreError;
use crate::models::{CollectionStats, EntityKind, SyncRecord};
use crate::schema;

pub use author::AuthorRepo;
pub use lists::Lists;
pub use places::Places;
pub use taxonomy::{Categories, Tags};
pub use visits::{Dishes, Visits};

/// A repository shared between the foreground and the sync engine.
pub type SharedRepository = Arc<Mutex<Repository>>;

/// Lock a shared repository, recovering from a poisoned mutex.
pub fn lock(repo: &SharedRepository) -> MutexGuard<'_, Repository> {
    repo.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Repository {
    backend: Box<dyn StorageBackend>,
}

impl Repository {
    /// Open the store, run schema setup and seed default categories.
    pub fn open(kind: BackendKind, location: &StoreLocation) -> Result<Self> {
        Self::with_backend(open_backend(kind, location)?)
    }

    pub fn open_in_memory(kind: BackendKind) -> Result<Self> {
        Self::open(kind, &StoreLocation::InMemory)
    }

    pub fn with_backend(backend: Box<dyn StorageBackend>) -> Result<Self> {
        schema::initialize(backend.as_ref())?;
        Ok(Repository { backend })
    }

    #[must_use]
    pub fn into_shared(self) -> SharedRepository {
        Arc::new(Mutex::new(self))
    }

    pub fn close(self) -> Result<()> {
        self.backend.close()
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.backend.schema_version()
    }

    pub(crate) fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn author(&self) -> AuthorRepo<'_> {
        AuthorRepo::new(self.backend())
    }

    #[must_use]
    pub fn places(&self) -> Places<'_> {
        Places::new(self.backend())
    }

    #[must_use]
    pub fn lists(&self) -> Lists<'_> {
        Lists::new(self.backend())
    }

    #[must_use]
    pub fn visits(&self) -> Visits<'_> {
        Visits::new(self.backend())
    }

    #[must_use]
    pub fn dishes(&self) -> Dishes<'_> {
        Dishes::new(self.backend())
    }

    #[must_use]
    pub fn categories(&self) -> Categories<'_> {
        Categories::new(self.backend())
    }

    #[must_use]
    pub fn tags(&self) -> Tags<'_> {
        Tags::new(self.backend())
    }

    /// Re-insert any default place category that has been deleted.
    pub fn restore_default_categories(&self) -> Result<usize> {
        schema::seed_default_categories(self.backend())
    }

    pub fn stats(&self) -> Result<Vec<CollectionStats>> {
        let b = self.backend();
        let totals = [
            (EntityKind::Author, usize::from(b.get_author()?.is_some())),
            (EntityKind::Place, b.list_places()?.len()),
            (EntityKind::List, b.list_lists()?.len()),
            (EntityKind::ListItem, b.all_list_items()?.len()),
            (EntityKind::Visit, b.list_visits(None)?.len()),
            (EntityKind::Dish, b.list_dishes(None)?.len()),
            (EntityKind::Category, b.list_categories(None)?.len()),
            (EntityKind::Tag, b.list_tags()?.len()),
            (EntityKind::PlaceTag, b.list_place_tags(None)?.len()),
        ];
        totals
            .into_iter()
            .map(|(kind, total)| {
                let dirty = if kind.is_syncable() {
                    b.dirty_ids(kind)?.len()
                } else {
                    0
                };
                Ok(CollectionStats {
                    kind: kind.to_string(),
                    total,
                    dirty,
                })
            })
            .collect()
    }

    // --- Sync support ---

    /// Every dirty record, in the order a sync pass pushes them.
    pub fn dirty_snapshot(&self) -> Result<Vec<PendingPush>> {
        let mut pending = Vec::new();
        for kind in EntityKind::SYNC_ORDER {
            for id in self.backend.dirty_ids(kind)? {
                if let Some(push) = self.pending_push(kind, &id)? {
                    pending.push(push);
                }
            }
        }
        Ok(pending)
    }

    /// The remote id of a syncable record, if it has been pushed.
    pub fn external_id(&self, kind: EntityKind, id: &str) -> Result<Option<String>> {
        let push = self
            .pending_push(kind, id)?
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        Ok(push.external_id)
    }

    /// Unconditional sync acknowledgment: adopt the remote id, clear dirty,
    /// stamp `last_synced_at`. No other field changes.
    pub fn mark_synced(
        &self,
        kind: EntityKind,
        id: &str,
        external_id: &str,
        synced_at: &str,
    ) -> Result<()> {
        mark_synced(self.backend(), kind, id, external_id, synced_at)
    }

    /// Like [`Repository::mark_synced`], but dirty is only cleared if the
    /// record's `updated_at` still equals `expected_updated_at`.
    pub fn acknowledge(
        &self,
        kind: EntityKind,
        id: &str,
        external_id: &str,
        synced_at: &str,
        expected_updated_at: &str,
    ) -> Result<Acknowledgement> {
        self.backend.acknowledge(
            kind,
            id,
            external_id,
            synced_at,
            Some(expected_updated_at),
        )
    }

    fn pending_push(&self, kind: EntityKind, id: &str) -> Result<Option<PendingPush>> {
        let b = self.backend();
        let push = match kind {
            EntityKind::Author => b
                .get_author()?
                .filter(|a| a.id == id)
                .map(|a| PendingPush::from_record(&a, None))
                .transpose()?,
            EntityKind::Place => b
                .get_place(id)?
                .map(|p| PendingPush::from_record(&p, None))
                .transpose()?,
            EntityKind::List => b
                .get_list(id)?
                .map(|l| PendingPush::from_record(&l, None))
                .transpose()?,
            EntityKind::Visit => b
                .get_visit(id)?
                .map(|v| {
                    let parent = ParentRef::new(EntityKind::Place, &v.place_id, "placeExternalId");
                    PendingPush::from_record(&v, Some(parent))
                })
                .transpose()?,
            EntityKind::Dish => b
                .get_dish(id)?
                .map(|d| {
                    let parent = ParentRef::new(EntityKind::Visit, &d.visit_id, "visitExternalId");
                    PendingPush::from_record(&d, Some(parent))
                })
                .transpose()?,
            EntityKind::Category => b
                .get_category(id)?
                .map(|c| PendingPush::from_record(&c, None))
                .transpose()?,
            EntityKind::Tag => b
                .get_tag(id)?
                .map(|t| PendingPush::from_record(&t, None))
                .transpose()?,
            EntityKind::ListItem | EntityKind::PlaceTag => {
                anyhow::bail!("{kind} records are not synced")
            }
        };
        Ok(push)
    }
}

/// The owning record a child's remote payload refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentRef {
    pub kind: EntityKind,
    pub id: String,
    /// Payload field that carries the parent's remote id.
    pub field: &'static str,
}

impl ParentRef {
    fn new(kind: EntityKind, id: &str, field: &'static str) -> Self {
        ParentRef {
            kind,
            id: id.to_string(),
            field,
        }
    }
}

/// A dirty record captured at the start of a sync pass.
#[derive(Debug, Clone)]
pub struct PendingPush {
    pub kind: EntityKind,
    pub id: String,
    pub external_id: Option<String>,
    pub updated_at: String,
    pub payload: serde_json::Value,
    pub parent: Option<ParentRef>,
}

impl PendingPush {
    fn from_record<T: SyncRecord>(record: &T, parent: Option<ParentRef>) -> Result<Self> {
        Ok(PendingPush {
            kind: T::KIND,
            id: record.id().to_string(),
            external_id: record.sync_state().external_id.clone(),
            updated_at: record.updated_at().to_string(),
            payload: serde_json::to_value(record)?,
            parent,
        })
    }
}

fn mark_synced(
    backend: &dyn StorageBackend,
    kind: EntityKind,
    id: &str,
    external_id: &str,
    synced_at: &str,
) -> Result<()> {
    match backend.acknowledge(kind, id, external_id, synced_at, None)? {
        Acknowledgement::Missing => Err(StoreError::not_found(kind, id).into()),
        Acknowledgement::Clean | Acknowledgement::StillDirty => Ok(()),
    }
}

fn found<T>(record: Option<T>, kind: EntityKind, id: &str) -> Result<T> {
    record.ok_or_else(|| StoreError::not_found(kind, id).into())
}

fn ensure_existed(existed: bool, kind: EntityKind, id: &str) -> Result<()> {
    if existed {
        Ok(())
    } else {
        Err(StoreError::not_found(kind, id).into())
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0_u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewAuthor, NewPlace, NewVisit, UpdatePlace, now_timestamp};

    fn repo() -> Repository {
        Repository::open_in_memory(BackendKind::Sqlite).unwrap()
    }

    fn sample_place() -> NewPlace {
        NewPlace {
            name: "Corner Bistro".to_string(),
            latitude: 40.7,
            longitude: -74.0,
            ..NewPlace::default()
        }
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean([]), None);
        assert_eq!(mean([4.0, 5.0]), Some(4.5));
        assert_eq!(mean([0.0]), Some(0.0));
    }

    #[test]
    fn test_snapshot_follows_sync_order() {
        let repo = repo();
        let place = repo.places().create(sample_place()).unwrap();
        repo.visits()
            .create(NewVisit {
                place_id: place.id.clone(),
                ..NewVisit::default()
            })
            .unwrap();
        repo.author()
            .create(NewAuthor {
                display_name: "Sam".to_string(),
                ..NewAuthor::default()
            })
            .unwrap();

        let kinds: Vec<EntityKind> = repo
            .dirty_snapshot()
            .unwrap()
            .into_iter()
            .map(|p| p.kind)
            .filter(|k| *k != EntityKind::Category)
            .collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Author, EntityKind::Place, EntityKind::Visit]
        );
    }

    #[test]
    fn test_visit_push_names_its_parent() {
        let repo = repo();
        let place = repo.places().create(sample_place()).unwrap();
        let visit = repo
            .visits()
            .create(NewVisit {
                place_id: place.id.clone(),
                ..NewVisit::default()
            })
            .unwrap();

        let push = repo
            .dirty_snapshot()
            .unwrap()
            .into_iter()
            .find(|p| p.id == visit.id)
            .unwrap();
        let parent = push.parent.unwrap();
        assert_eq!(parent.kind, EntityKind::Place);
        assert_eq!(parent.id, place.id);
        assert_eq!(parent.field, "placeExternalId");
        assert_eq!(push.payload["placeId"], place.id);
    }

    #[test]
    fn test_mark_synced_leaves_fields_alone() {
        let repo = repo();
        let place = repo.places().create(sample_place()).unwrap();
        repo.mark_synced(EntityKind::Place, &place.id, "remote-1", &now_timestamp())
            .unwrap();

        let synced = repo.places().get(&place.id).unwrap();
        assert!(!synced.sync.dirty);
        assert_eq!(synced.sync.external_id.as_deref(), Some("remote-1"));
        assert!(synced.sync.last_synced_at.is_some());
        assert_eq!(synced.updated_at, place.updated_at);
        assert_eq!(synced.name, place.name);
        assert_eq!(
            repo.external_id(EntityKind::Place, &place.id).unwrap().as_deref(),
            Some("remote-1")
        );
    }

    #[test]
    fn test_mark_synced_missing_record() {
        let repo = repo();
        let err = repo
            .mark_synced(EntityKind::Tag, "nope", "remote", &now_timestamp())
            .unwrap_err();
        assert!(crate::error::is_not_found(&err));
    }

    #[test]
    fn test_acknowledge_after_edit_stays_dirty() {
        let repo = repo();
        let place = repo.places().create(sample_place()).unwrap();
        repo.places()
            .update(
                &place.id,
                UpdatePlace {
                    notes: Some(Some("edited mid-push".to_string())),
                    ..UpdatePlace::default()
                },
            )
            .unwrap();

        let ack = repo
            .acknowledge(EntityKind::Place, &place.id, "r1", &now_timestamp(), &place.updated_at)
            .unwrap();
        assert_eq!(ack, Acknowledgement::StillDirty);
        let stored = repo.places().get(&place.id).unwrap();
        assert!(stored.sync.dirty);
        assert_eq!(stored.sync.external_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_stats_counts_dirty() {
        let repo = repo();
        let place = repo.places().create(sample_place()).unwrap();
        repo.mark_synced(EntityKind::Place, &place.id, "r", &now_timestamp())
            .unwrap();
        repo.places().create(sample_place()).unwrap();

        let stats = repo.stats().unwrap();
        let places = stats.iter().find(|s| s.kind == "place").unwrap();
        assert_eq!((places.total, places.dirty), (2, 1));
        let categories = stats.iter().find(|s| s.kind == "category").unwrap();
        assert_eq!(categories.total, 10);
    }

    #[test]
    fn test_shared_lock_survives_poison() {
        let shared = repo().into_shared();
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(lock(&shared).places().list().unwrap().is_empty());
    }
}
