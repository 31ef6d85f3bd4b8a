//! Whole-store JSON export and fail-closed import.

use std::collections::HashSet;

use anyhow::{Result, bail};

use crate::error::StoreError;
use crate::models::{
    BACKUP_VERSION, Backup, ImportSummary, MAX_ITEM_ORDER, now_timestamp, tag_names_match,
};
use crate::repo::Repository;

impl Repository {
    /// Snapshot every collection and relation.
    pub fn export(&self) -> Result<Backup> {
        let b = self.backend();
        Ok(Backup {
            version: BACKUP_VERSION,
            exported_at: now_timestamp(),
            author: b.get_author()?,
            places: b.list_places()?,
            lists: b.list_lists()?,
            list_items: b.all_list_items()?,
            visits: b.list_visits(None)?,
            dishes: b.list_dishes(None)?,
            categories: b.list_categories(None)?,
            tags: b.list_tags()?,
            place_tags: b.list_place_tags(None)?,
        })
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export()?)?)
    }

    /// Replace the whole store with the contents of a JSON backup.
    ///
    /// The payload is fully parsed and validated before anything is deleted,
    /// and the replacement runs in one backend transaction.
    pub fn import_json(&self, json: &str) -> Result<ImportSummary> {
        let backup = parse(json)?;
        self.restore(&backup)
    }

    pub fn restore(&self, backup: &Backup) -> Result<ImportSummary> {
        validate(backup)?;
        self.backend().replace_all(backup)?;
        let summary = summarize(backup);
        tracing::info!(
            places = summary.places,
            visits = summary.visits,
            dishes = summary.dishes,
            "restored backup"
        );
        Ok(summary)
    }
}

pub fn parse(json: &str) -> Result<Backup> {
    serde_json::from_str(json).map_err(|e| StoreError::ImportFormatInvalid(e.to_string()).into())
}

fn invalid(reason: String) -> anyhow::Error {
    StoreError::ImportFormatInvalid(reason).into()
}

fn unique_ids<'a>(what: &str, ids: impl IntoIterator<Item = &'a str>) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(invalid(format!("{what} with an empty id")));
        }
        if !seen.insert(id) {
            return Err(invalid(format!("duplicate {what} id {id}")));
        }
    }
    Ok(seen)
}

fn ensure_ref(ids: &HashSet<&str>, what: &str, id: &str, parent: &str, parent_id: &str) -> Result<()> {
    if !ids.contains(parent_id) {
        return Err(invalid(format!(
            "{what} {id} references missing {parent} {parent_id}"
        )));
    }
    Ok(())
}

/// Check a backup for internal consistency without touching the store.
pub fn validate(backup: &Backup) -> Result<()> {
    if backup.version != BACKUP_VERSION {
        bail!(StoreError::ImportFormatInvalid(format!(
            "unsupported version {} (expected {BACKUP_VERSION})",
            backup.version
        )));
    }
    if let Some(author) = &backup.author {
        unique_ids("author", [author.id.as_str()])?;
    }
    let places = unique_ids("place", backup.places.iter().map(|p| p.id.as_str()))?;
    let lists = unique_ids("list", backup.lists.iter().map(|l| l.id.as_str()))?;
    let visits = unique_ids("visit", backup.visits.iter().map(|v| v.id.as_str()))?;
    unique_ids("list item", backup.list_items.iter().map(|i| i.id.as_str()))?;
    unique_ids("dish", backup.dishes.iter().map(|d| d.id.as_str()))?;
    unique_ids("category", backup.categories.iter().map(|c| c.id.as_str()))?;
    let tags = unique_ids("tag", backup.tags.iter().map(|t| t.id.as_str()))?;

    for visit in &backup.visits {
        ensure_ref(&places, "visit", &visit.id, "place", &visit.place_id)?;
    }
    for dish in &backup.dishes {
        ensure_ref(&visits, "dish", &dish.id, "visit", &dish.visit_id)?;
        if !(1..=5).contains(&dish.rating) {
            return Err(invalid(format!(
                "dish {} has rating {} outside 1..=5",
                dish.id, dish.rating
            )));
        }
    }
    let mut members = HashSet::new();
    for item in &backup.list_items {
        ensure_ref(&lists, "list item", &item.id, "list", &item.list_id)?;
        ensure_ref(&places, "list item", &item.id, "place", &item.place_id)?;
        if !(0..=MAX_ITEM_ORDER).contains(&item.order) {
            return Err(invalid(format!(
                "list item {} has order {} outside 0..={MAX_ITEM_ORDER}",
                item.id, item.order
            )));
        }
        if !members.insert((item.list_id.as_str(), item.place_id.as_str())) {
            return Err(invalid(format!(
                "place {} appears twice in list {}",
                item.place_id, item.list_id
            )));
        }
    }

    let mut links = HashSet::new();
    for link in &backup.place_tags {
        let label = format!("{}/{}", link.place_id, link.tag_id);
        ensure_ref(&places, "place tag", &label, "place", &link.place_id)?;
        ensure_ref(&tags, "place tag", &label, "tag", &link.tag_id)?;
        if !links.insert((link.place_id.as_str(), link.tag_id.as_str())) {
            return Err(invalid(format!("duplicate place tag {label}")));
        }
    }

    for (i, tag) in backup.tags.iter().enumerate() {
        if tag.name.trim().is_empty() {
            return Err(invalid(format!("tag {} has an empty name", tag.id)));
        }
        if backup.tags[..i]
            .iter()
            .any(|other| tag_names_match(&other.name, &tag.name))
        {
            return Err(invalid(format!("duplicate tag name '{}'", tag.name)));
        }
    }
    Ok(())
}

/// Record counts per collection in a backup.
#[must_use]
pub fn summarize(backup: &Backup) -> ImportSummary {
    ImportSummary {
        authors: usize::from(backup.author.is_some()),
        places: backup.places.len(),
        lists: backup.lists.len(),
        list_items: backup.list_items.len(),
        visits: backup.visits.len(),
        dishes: backup.dishes.len(),
        categories: backup.categories.len(),
        tags: backup.tags.len(),
        place_tags: backup.place_tags.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::models::{NewDish, NewList, NewPlace, NewTag, NewVisit};

    fn populated(kind: BackendKind) -> Repository {
        let repo = Repository::open_in_memory(kind).unwrap();
        let place = repo
            .places()
            .create(NewPlace {
                name: "Harbour Fish".to_string(),
                ..NewPlace::default()
            })
            .unwrap();
        let visit = repo
            .visits()
            .create(NewVisit {
                place_id: place.id.clone(),
                ..NewVisit::default()
            })
            .unwrap();
        repo.dishes()
            .create(NewDish {
                visit_id: visit.id,
                name: "Fish and chips".to_string(),
                rating: 4,
                ..NewDish::default()
            })
            .unwrap();
        let tag = repo
            .tags()
            .create(NewTag {
                name: "Seaside".to_string(),
                color: None,
            })
            .unwrap();
        repo.places().add_tag(&place.id, &tag.id).unwrap();
        let list = repo
            .lists()
            .create(NewList {
                name: "Coast trip".to_string(),
                ..NewList::default()
            })
            .unwrap();
        repo.lists().add_place(&list.id, &place.id).unwrap();
        repo.places().mark_synced(&place.id, "remote-place", "t").unwrap();
        repo
    }

    #[test]
    fn test_export_contains_every_collection() {
        let repo = populated(BackendKind::Sqlite);
        let backup = repo.export().unwrap();
        assert_eq!(backup.version, 1);
        assert_eq!(backup.places.len(), 1);
        assert_eq!(backup.visits.len(), 1);
        assert_eq!(backup.dishes.len(), 1);
        assert_eq!(backup.list_items.len(), 1);
        assert_eq!(backup.place_tags.len(), 1);
        assert_eq!(backup.categories.len(), 10);

        let json: serde_json::Value = serde_json::from_str(&repo.export_json().unwrap()).unwrap();
        assert!(json["listItems"].is_array());
        assert!(json["placeTags"].is_array());
        assert!(json["exportedAt"].is_string());
    }

    #[test]
    fn test_restore_across_backends_preserves_sync_state() {
        let source = populated(BackendKind::Sqlite);
        let json = source.export_json().unwrap();

        let target = Repository::open_in_memory(BackendKind::Kv).unwrap();
        let summary = target.import_json(&json).unwrap();
        assert_eq!(summary.places, 1);
        assert_eq!(summary.categories, 10);
        assert_eq!(summary.authors, 0);

        let place = &target.places().list().unwrap()[0];
        assert!(!place.sync.dirty);
        assert_eq!(place.sync.external_id.as_deref(), Some("remote-place"));
        assert_eq!(place.tag_ids.len(), 1);
        assert_eq!(target.categories().list(None).unwrap().len(), 10);
    }

    #[test]
    fn test_validate_rejects_dangling_dish() {
        let repo = populated(BackendKind::Kv);
        let mut backup = repo.export().unwrap();
        backup.dishes[0].visit_id = "gone".to_string();
        let err = validate(&backup).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ImportFormatInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_rating_and_version() {
        let repo = populated(BackendKind::Kv);
        let mut backup = repo.export().unwrap();
        backup.dishes[0].rating = 9;
        assert!(validate(&backup).is_err());

        let mut backup = repo.export().unwrap();
        backup.version = 2;
        assert!(validate(&backup).is_err());
    }

    #[test]
    fn test_validate_rejects_case_insensitive_tag_clash() {
        let repo = populated(BackendKind::Sqlite);
        let mut backup = repo.export().unwrap();
        let mut clone = backup.tags[0].clone();
        clone.id = "other".to_string();
        clone.name = "SEASIDE".to_string();
        backup.tags.push(clone);
        assert!(validate(&backup).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_list_items() {
        let repo = populated(BackendKind::Sqlite);
        let backup = repo.export().unwrap();

        for order in [-1, MAX_ITEM_ORDER + 1, i64::MAX] {
            let mut bad = backup.clone();
            bad.list_items[0].order = order;
            let err = validate(&bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::ImportFormatInvalid(_))
            ));
        }

        let mut edge = backup.clone();
        edge.list_items[0].order = MAX_ITEM_ORDER;
        validate(&edge).unwrap();

        let mut twice = backup.clone();
        let mut copy = twice.list_items[0].clone();
        copy.id = "second-item".to_string();
        copy.order = 7;
        twice.list_items.push(copy);
        assert!(format!("{:#}", validate(&twice).unwrap_err()).contains("appears twice"));
    }

    #[test]
    fn test_add_place_after_restoring_highest_order() {
        for kind in [BackendKind::Sqlite, BackendKind::Kv] {
            let repo = populated(kind);
            let mut backup = repo.export().unwrap();
            backup.list_items[0].order = MAX_ITEM_ORDER;
            repo.restore(&backup).unwrap();

            let list_id = backup.lists[0].id.clone();
            let other = repo
                .places()
                .create(NewPlace {
                    name: "Pier Cafe".to_string(),
                    ..NewPlace::default()
                })
                .unwrap();
            let item = repo.lists().add_place(&list_id, &other.id).unwrap();
            assert_eq!(item.order, MAX_ITEM_ORDER + 1);
        }
    }

    #[test]
    fn test_missing_collection_is_invalid() {
        let err = parse(r#"{"version":1,"exportedAt":"x","author":null,"places":[]}"#).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ImportFormatInvalid(_))
        ));
    }

    #[test]
    fn test_failed_import_leaves_store_untouched() {
        for kind in [BackendKind::Sqlite, BackendKind::Kv] {
            let repo = populated(kind);
            let before = repo.export().unwrap();

            assert!(repo.import_json("{ not json").is_err());
            let mut bad = before.clone();
            bad.visits[0].place_id = "nowhere".to_string();
            assert!(repo.restore(&bad).is_err());

            let after = repo.export().unwrap();
            assert_eq!(after.places.len(), before.places.len());
            assert_eq!(after.dishes.len(), before.dishes.len());
            assert_eq!(after.place_tags.len(), before.place_tags.len());
        }
    }
}
