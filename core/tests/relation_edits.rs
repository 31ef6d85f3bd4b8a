//! Relation edits land together with the owner they dirty, or not at all.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use haunts_core::backend::{Acknowledgement, RelationOwner, RelationWrite};
use haunts_core::error::StoreError;
use haunts_core::models::{
    Author, Backup, Category, CategoryType, Dish, EntityKind, List, ListItem, NewList, NewPlace,
    NewTag, Place, PlaceTag, Tag, Visit,
};
use haunts_core::{BackendKind, Repository, StorageBackend, StoreLocation, open_backend};

const BACKENDS: [BackendKind; 2] = [BackendKind::Sqlite, BackendKind::Kv];

/// Wraps a real engine. Single-row relation and owner writes always fail, so
/// only [`StorageBackend::apply_relation_edit`] can change relations. While
/// `fail` is set, that call runs its writes and then hits a missing owner,
/// which aborts the engine transaction.
struct FailingOwner {
    inner: Box<dyn StorageBackend>,
    fail: Arc<AtomicBool>,
}

fn refuse(what: &str) -> anyhow::Error {
    StoreError::StorageUnavailable(format!("{what} outside a relation edit")).into()
}

impl StorageBackend for FailingOwner {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }
    fn schema_version(&self) -> Result<i64> {
        self.inner.schema_version()
    }
    fn close(self: Box<Self>) -> Result<()> {
        self.inner.close()
    }

    fn get_author(&self) -> Result<Option<Author>> {
        self.inner.get_author()
    }
    fn put_author(&self, author: &Author) -> Result<()> {
        self.inner.put_author(author)
    }

    fn insert_place(&self, place: &Place) -> Result<()> {
        self.inner.insert_place(place)
    }
    fn get_place(&self, id: &str) -> Result<Option<Place>> {
        self.inner.get_place(id)
    }
    fn list_places(&self) -> Result<Vec<Place>> {
        self.inner.list_places()
    }
    fn update_place(&self, _place: &Place) -> Result<bool> {
        Err(refuse("update_place"))
    }
    fn delete_place(&self, id: &str) -> Result<bool> {
        self.inner.delete_place(id)
    }

    fn insert_list(&self, list: &List) -> Result<()> {
        self.inner.insert_list(list)
    }
    fn get_list(&self, id: &str) -> Result<Option<List>> {
        self.inner.get_list(id)
    }
    fn list_lists(&self) -> Result<Vec<List>> {
        self.inner.list_lists()
    }
    fn update_list(&self, _list: &List) -> Result<bool> {
        Err(refuse("update_list"))
    }
    fn delete_list(&self, id: &str) -> Result<bool> {
        self.inner.delete_list(id)
    }

    fn insert_list_item(&self, _item: &ListItem) -> Result<()> {
        Err(refuse("insert_list_item"))
    }
    fn get_list_item(&self, id: &str) -> Result<Option<ListItem>> {
        self.inner.get_list_item(id)
    }
    fn list_items(&self, list_id: &str) -> Result<Vec<ListItem>> {
        self.inner.list_items(list_id)
    }
    fn all_list_items(&self) -> Result<Vec<ListItem>> {
        self.inner.all_list_items()
    }
    fn update_list_item(&self, _item: &ListItem) -> Result<bool> {
        Err(refuse("update_list_item"))
    }
    fn delete_list_item(&self, _id: &str) -> Result<bool> {
        Err(refuse("delete_list_item"))
    }

    fn insert_visit(&self, visit: &Visit) -> Result<()> {
        self.inner.insert_visit(visit)
    }
    fn get_visit(&self, id: &str) -> Result<Option<Visit>> {
        self.inner.get_visit(id)
    }
    fn list_visits(&self, place_id: Option<&str>) -> Result<Vec<Visit>> {
        self.inner.list_visits(place_id)
    }
    fn update_visit(&self, visit: &Visit) -> Result<bool> {
        self.inner.update_visit(visit)
    }
    fn delete_visit(&self, id: &str) -> Result<bool> {
        self.inner.delete_visit(id)
    }

    fn insert_dish(&self, dish: &Dish) -> Result<()> {
        self.inner.insert_dish(dish)
    }
    fn get_dish(&self, id: &str) -> Result<Option<Dish>> {
        self.inner.get_dish(id)
    }
    fn list_dishes(&self, visit_id: Option<&str>) -> Result<Vec<Dish>> {
        self.inner.list_dishes(visit_id)
    }
    fn update_dish(&self, dish: &Dish) -> Result<bool> {
        self.inner.update_dish(dish)
    }
    fn delete_dish(&self, id: &str) -> Result<bool> {
        self.inner.delete_dish(id)
    }

    fn insert_category(&self, category: &Category) -> Result<()> {
        self.inner.insert_category(category)
    }
    fn get_category(&self, id: &str) -> Result<Option<Category>> {
        self.inner.get_category(id)
    }
    fn list_categories(&self, category_type: Option<CategoryType>) -> Result<Vec<Category>> {
        self.inner.list_categories(category_type)
    }
    fn update_category(&self, category: &Category) -> Result<bool> {
        self.inner.update_category(category)
    }
    fn delete_category(&self, id: &str) -> Result<bool> {
        self.inner.delete_category(id)
    }

    fn insert_tag(&self, tag: &Tag) -> Result<()> {
        self.inner.insert_tag(tag)
    }
    fn get_tag(&self, id: &str) -> Result<Option<Tag>> {
        self.inner.get_tag(id)
    }
    fn list_tags(&self) -> Result<Vec<Tag>> {
        self.inner.list_tags()
    }
    fn update_tag(&self, tag: &Tag) -> Result<bool> {
        self.inner.update_tag(tag)
    }
    fn delete_tag(&self, id: &str) -> Result<bool> {
        self.inner.delete_tag(id)
    }

    fn insert_place_tag(&self, _place_tag: &PlaceTag) -> Result<bool> {
        Err(refuse("insert_place_tag"))
    }
    fn delete_place_tag(&self, _place_id: &str, _tag_id: &str) -> Result<bool> {
        Err(refuse("delete_place_tag"))
    }
    fn list_place_tags(&self, place_id: Option<&str>) -> Result<Vec<PlaceTag>> {
        self.inner.list_place_tags(place_id)
    }

    fn apply_relation_edit(
        &self,
        writes: &[RelationWrite<'_>],
        owner: RelationOwner<'_>,
    ) -> Result<()> {
        if !self.fail.load(Ordering::SeqCst) {
            return self.inner.apply_relation_edit(writes, owner);
        }
        match owner {
            RelationOwner::Place(place) => {
                let vanished = Place {
                    id: "vanished".to_string(),
                    ..place.clone()
                };
                self.inner
                    .apply_relation_edit(writes, RelationOwner::Place(&vanished))
            }
            RelationOwner::List(list) => {
                let vanished = List {
                    id: "vanished".to_string(),
                    ..list.clone()
                };
                self.inner
                    .apply_relation_edit(writes, RelationOwner::List(&vanished))
            }
        }
    }

    fn dirty_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        self.inner.dirty_ids(kind)
    }

    fn acknowledge(
        &self,
        kind: EntityKind,
        id: &str,
        external_id: &str,
        synced_at: &str,
        expected_updated_at: Option<&str>,
    ) -> Result<Acknowledgement> {
        self.inner
            .acknowledge(kind, id, external_id, synced_at, expected_updated_at)
    }

    fn replace_all(&self, backup: &Backup) -> Result<()> {
        self.inner.replace_all(backup)
    }
}

fn failing_repo(kind: BackendKind) -> (Repository, Arc<AtomicBool>) {
    let fail = Arc::new(AtomicBool::new(false));
    let backend = FailingOwner {
        inner: open_backend(kind, &StoreLocation::InMemory).unwrap(),
        fail: Arc::clone(&fail),
    };
    (Repository::with_backend(Box::new(backend)).unwrap(), fail)
}

fn place(repo: &Repository, name: &str) -> Place {
    repo.places()
        .create(NewPlace {
            name: name.to_string(),
            ..NewPlace::default()
        })
        .unwrap()
}

fn tag(repo: &Repository, name: &str) -> Tag {
    repo.tags()
        .create(NewTag {
            name: name.to_string(),
            color: None,
        })
        .unwrap()
}

fn list(repo: &Repository) -> List {
    repo.lists()
        .create(NewList {
            name: "Weekend".to_string(),
            ..NewList::default()
        })
        .unwrap()
}

#[test]
fn test_relation_edits_use_one_call_and_dirty_owner() {
    for kind in BACKENDS {
        let (repo, _fail) = failing_repo(kind);
        let a = place(&repo, "A");
        let b = place(&repo, "B");
        let spicy = tag(&repo, "Spicy");
        let l = list(&repo);

        repo.lists().mark_synced(&l.id, "r-list", "t").unwrap();
        let first = repo.lists().add_place(&l.id, &a.id).unwrap();
        let second = repo.lists().add_place(&l.id, &b.id).unwrap();
        assert!(repo.lists().get(&l.id).unwrap().sync.dirty, "{kind}");

        repo.lists().mark_synced(&l.id, "r-list", "t").unwrap();
        let reordered = repo
            .lists()
            .reorder(&l.id, &[second.id.clone(), first.id.clone()])
            .unwrap();
        assert_eq!(reordered[0].id, second.id, "{kind}");
        assert!(repo.lists().get(&l.id).unwrap().sync.dirty, "{kind}");

        repo.lists().remove_item(&first.id).unwrap();
        assert!(repo.lists().remove_place(&l.id, &b.id).unwrap(), "{kind}");
        assert!(repo.lists().items(&l.id).unwrap().is_empty(), "{kind}");

        repo.places().mark_synced(&a.id, "r-a", "t").unwrap();
        assert!(repo.places().add_tag(&a.id, &spicy.id).unwrap(), "{kind}");
        assert!(!repo.places().add_tag(&a.id, &spicy.id).unwrap(), "{kind}");
        assert!(repo.places().get(&a.id).unwrap().sync.dirty, "{kind}");
        assert!(repo.places().remove_tag(&a.id, &spicy.id).unwrap(), "{kind}");
        assert!(repo.places().get(&a.id).unwrap().tag_ids.is_empty(), "{kind}");
    }
}

#[test]
fn test_failed_list_edits_leave_nothing_behind() {
    for kind in BACKENDS {
        let (repo, fail) = failing_repo(kind);
        let a = place(&repo, "A");
        let b = place(&repo, "B");
        let l = list(&repo);
        let first = repo.lists().add_place(&l.id, &a.id).unwrap();
        let second = repo.lists().add_place(&l.id, &b.id).unwrap();
        repo.lists().mark_synced(&l.id, "r-list", "t").unwrap();
        let before = repo.lists().items(&l.id).unwrap();

        fail.store(true, Ordering::SeqCst);
        let c = place(&repo, "C");
        assert!(repo.lists().add_place(&l.id, &c.id).is_err(), "{kind}");
        assert!(
            repo.lists()
                .reorder(&l.id, &[second.id.clone(), first.id.clone()])
                .is_err(),
            "{kind}"
        );
        assert!(repo.lists().remove_item(&first.id).is_err(), "{kind}");
        assert!(repo.lists().remove_place(&l.id, &b.id).is_err(), "{kind}");
        fail.store(false, Ordering::SeqCst);

        assert_eq!(repo.lists().items(&l.id).unwrap(), before, "{kind}");
        assert!(!repo.lists().get(&l.id).unwrap().sync.dirty, "{kind}");
    }
}

#[test]
fn test_failed_set_tags_keeps_old_tags() {
    for kind in BACKENDS {
        let (repo, fail) = failing_repo(kind);
        let a = place(&repo, "A");
        let old = tag(&repo, "Cosy");
        let new = tag(&repo, "Loud");
        repo.places().add_tag(&a.id, &old.id).unwrap();
        repo.places().mark_synced(&a.id, "r-a", "t").unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(repo.places().set_tags(&a.id, &[new.id.clone()]).is_err(), "{kind}");
        assert!(repo.places().remove_tag(&a.id, &old.id).is_err(), "{kind}");
        fail.store(false, Ordering::SeqCst);

        let stored = repo.places().get(&a.id).unwrap();
        assert_eq!(stored.tag_ids, vec![old.id.clone()], "{kind}");
        assert!(!stored.sync.dirty, "{kind}");

        let updated = repo.places().set_tags(&a.id, &[new.id.clone()]).unwrap();
        assert_eq!(updated.tag_ids, vec![new.id.clone()], "{kind}");
        assert!(updated.sync.dirty, "{kind}");
    }
}
