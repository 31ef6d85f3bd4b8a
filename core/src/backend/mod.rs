//! Storage backends. The repository talks to exactly one of these, chosen
//! once at startup through [`open_backend`].

mod kv;
mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{
    Author, Backup, Category, CategoryType, Dish, EntityKind, List, ListItem, Place, PlaceTag,
    Tag, Visit,
};

pub use kv::KvBackend;
pub use sqlite::SqliteBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded relational engine (SQLite).
    #[default]
    Sqlite,
    /// Embedded key-value object store (redb).
    Kv,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Kv => "kv",
        }
    }

    /// File name used when the store lives in a data directory.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Sqlite => "haunts.db",
            Self::Kv => "haunts.redb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "kv" | "redb" => Ok(Self::Kv),
            _ => bail!(StoreError::Validation(format!(
                "backend '{s}'. Must be one of: sqlite, kv"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    Path(PathBuf),
}

/// Result of a sync acknowledgment against a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The record no longer exists.
    Missing,
    /// Remote id adopted and dirty cleared.
    Clean,
    /// Remote id adopted, but the record changed after the snapshot.
    StillDirty,
}

/// A change to a relation table. See [`StorageBackend::apply_relation_edit`].
#[derive(Debug, Clone, Copy)]
pub enum RelationWrite<'a> {
    InsertListItem(&'a ListItem),
    UpdateListItem(&'a ListItem),
    DeleteListItem(&'a str),
    /// Linking an already linked pair is a no-op.
    InsertPlaceTag(&'a PlaceTag),
    DeletePlaceTag { place_id: &'a str, tag_id: &'a str },
}

/// The record a relation edit is stored against.
#[derive(Debug, Clone, Copy)]
pub enum RelationOwner<'a> {
    Place(&'a Place),
    List(&'a List),
}

impl RelationOwner<'_> {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Place(_) => EntityKind::Place,
            Self::List(_) => EntityKind::List,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Place(place) => &place.id,
            Self::List(list) => &list.id,
        }
    }

    fn not_found(&self) -> anyhow::Error {
        StoreError::not_found(self.kind(), self.id()).into()
    }
}

/// One physical storage engine.
///
/// Every method behaves identically across implementations: `list_*` return
/// insertion order (list items by `order`, ties by insertion), `update_*` and
/// `delete_*` report whether the record existed, and deletes apply the
/// cascade rules inside a single engine transaction.
pub trait StorageBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Create missing structures and run additive migrations. Idempotent.
    fn initialize(&self) -> Result<()>;

    fn schema_version(&self) -> Result<i64>;

    fn close(self: Box<Self>) -> Result<()>;

    fn get_author(&self) -> Result<Option<Author>>;
    fn put_author(&self, author: &Author) -> Result<()>;

    fn insert_place(&self, place: &Place) -> Result<()>;
    fn get_place(&self, id: &str) -> Result<Option<Place>>;
    fn list_places(&self) -> Result<Vec<Place>>;
    fn update_place(&self, place: &Place) -> Result<bool>;
    /// Removes the place with its visits, their dishes, its list items and place tags.
    fn delete_place(&self, id: &str) -> Result<bool>;

    fn insert_list(&self, list: &List) -> Result<()>;
    fn get_list(&self, id: &str) -> Result<Option<List>>;
    fn list_lists(&self) -> Result<Vec<List>>;
    fn update_list(&self, list: &List) -> Result<bool>;
    /// Removes the list and its items. Member places survive.
    fn delete_list(&self, id: &str) -> Result<bool>;

    fn insert_list_item(&self, item: &ListItem) -> Result<()>;
    fn get_list_item(&self, id: &str) -> Result<Option<ListItem>>;
    fn list_items(&self, list_id: &str) -> Result<Vec<ListItem>>;
    fn all_list_items(&self) -> Result<Vec<ListItem>>;
    fn update_list_item(&self, item: &ListItem) -> Result<bool>;
    fn delete_list_item(&self, id: &str) -> Result<bool>;

    fn insert_visit(&self, visit: &Visit) -> Result<()>;
    fn get_visit(&self, id: &str) -> Result<Option<Visit>>;
    fn list_visits(&self, place_id: Option<&str>) -> Result<Vec<Visit>>;
    fn update_visit(&self, visit: &Visit) -> Result<bool>;
    fn delete_visit(&self, id: &str) -> Result<bool>;

    fn insert_dish(&self, dish: &Dish) -> Result<()>;
    fn get_dish(&self, id: &str) -> Result<Option<Dish>>;
    fn list_dishes(&self, visit_id: Option<&str>) -> Result<Vec<Dish>>;
    fn update_dish(&self, dish: &Dish) -> Result<bool>;
    fn delete_dish(&self, id: &str) -> Result<bool>;

    fn insert_category(&self, category: &Category) -> Result<()>;
    fn get_category(&self, id: &str) -> Result<Option<Category>>;
    fn list_categories(&self, category_type: Option<CategoryType>) -> Result<Vec<Category>>;
    fn update_category(&self, category: &Category) -> Result<bool>;
    fn delete_category(&self, id: &str) -> Result<bool>;

    fn insert_tag(&self, tag: &Tag) -> Result<()>;
    fn get_tag(&self, id: &str) -> Result<Option<Tag>>;
    fn list_tags(&self) -> Result<Vec<Tag>>;
    fn update_tag(&self, tag: &Tag) -> Result<bool>;
    /// Removes the tag and every place tag pointing at it.
    fn delete_tag(&self, id: &str) -> Result<bool>;

    /// Returns false when the pair is already linked.
    fn insert_place_tag(&self, place_tag: &PlaceTag) -> Result<bool>;
    fn delete_place_tag(&self, place_id: &str, tag_id: &str) -> Result<bool>;
    fn list_place_tags(&self, place_id: Option<&str>) -> Result<Vec<PlaceTag>>;

    /// Apply `writes` in order, then overwrite `owner`, all in one
    /// transaction. Deletes of absent rows are no-ops. If any step fails,
    /// or the owner no longer exists, nothing is kept.
    fn apply_relation_edit(
        &self,
        writes: &[RelationWrite<'_>],
        owner: RelationOwner<'_>,
    ) -> Result<()>;

    /// Ids of dirty records of a syncable kind, in insertion order.
    fn dirty_ids(&self, kind: EntityKind) -> Result<Vec<String>>;

    /// Adopt `external_id` and `synced_at`. Dirty is cleared unless
    /// `expected_updated_at` is given and no longer matches the record.
    /// No other field is touched.
    fn acknowledge(
        &self,
        kind: EntityKind,
        id: &str,
        external_id: &str,
        synced_at: &str,
        expected_updated_at: Option<&str>,
    ) -> Result<Acknowledgement>;

    /// Replace every collection with the contents of `backup` in one
    /// transaction. On error the previous contents are left in place.
    fn replace_all(&self, backup: &Backup) -> Result<()>;
}

/// Open (without initializing) the backend of the given kind.
pub fn open_backend(kind: BackendKind, location: &StoreLocation) -> Result<Box<dyn StorageBackend>> {
    let backend: Box<dyn StorageBackend> = match kind {
        BackendKind::Sqlite => Box::new(SqliteBackend::open(location)?),
        BackendKind::Kv => Box::new(KvBackend::open(location)?),
    };
    tracing::debug!(backend = %kind, ?location, "opened storage backend");
    Ok(backend)
}

fn unsyncable(kind: EntityKind) -> anyhow::Error {
    anyhow::anyhow!("{kind} records are not synced")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("KV".parse::<BackendKind>().unwrap(), BackendKind::Kv);
        assert_eq!("redb".parse::<BackendKind>().unwrap(), BackendKind::Kv);
        assert!("postgres".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_open_backend_in_memory() {
        for kind in [BackendKind::Sqlite, BackendKind::Kv] {
            let backend = open_backend(kind, &StoreLocation::InMemory).unwrap();
            assert_eq!(backend.kind(), kind);
            backend.initialize().unwrap();
            assert!(backend.list_places().unwrap().is_empty());
            backend.close().unwrap();
        }
    }

    #[test]
    fn test_open_backend_bad_path_is_unavailable() {
        let location = StoreLocation::Path(PathBuf::from("/nonexistent-dir/sub/haunts.db"));
        for kind in [BackendKind::Sqlite, BackendKind::Kv] {
            let Err(err) = open_backend(kind, &location) else {
                panic!("expected open to fail for {kind}");
            };
            assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::StorageUnavailable(_))
            ));
        }
    }
}
