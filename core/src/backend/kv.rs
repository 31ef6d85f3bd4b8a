//! Object-store backend on redb.
//!
//! Each collection is a `&str -> &str` table holding a JSON envelope of the
//! record plus a monotonically increasing sequence number, which gives list
//! queries their insertion order. Parent/child relations are kept in
//! multimap tables keyed by parent id; deletes fan out through them inside a
//! single write transaction.

use anyhow::{Context, Result, bail};
use redb::backends::InMemoryBackend;
use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableMultimapTable, ReadableTable,
    TableDefinition, WriteTransaction,
};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};

use super::{
    Acknowledgement, BackendKind, RelationOwner, RelationWrite, StorageBackend, StoreLocation,
    unsyncable,
};
use crate::error::StoreError;
use crate::models::{
    Author, Backup, Category, CategoryType, Dish, EntityKind, List, ListItem, Place, PlaceTag,
    Tag, Visit,
};

type Collection = TableDefinition<'static, &'static str, &'static str>;
type Index = MultimapTableDefinition<'static, &'static str, &'static str>;

const SCHEMA_VERSION: u64 = 1;

const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const SEQ_KEY: &str = "seq";
const SCHEMA_KEY: &str = "schema_version";

const AUTHORS: Collection = TableDefinition::new("authors");
const PLACES: Collection = TableDefinition::new("places");
const LISTS: Collection = TableDefinition::new("lists");
const LIST_ITEMS: Collection = TableDefinition::new("list_items");
const VISITS: Collection = TableDefinition::new("visits");
const DISHES: Collection = TableDefinition::new("dishes");
const CATEGORIES: Collection = TableDefinition::new("categories");
const TAGS: Collection = TableDefinition::new("tags");
const PLACE_TAGS: Collection = TableDefinition::new("place_tags");

const COLLECTIONS: [Collection; 9] = [
    AUTHORS, PLACES, LISTS, LIST_ITEMS, VISITS, DISHES, CATEGORIES, TAGS, PLACE_TAGS,
];

const VISITS_BY_PLACE: Index = MultimapTableDefinition::new("visits_by_place");
const DISHES_BY_VISIT: Index = MultimapTableDefinition::new("dishes_by_visit");
const ITEMS_BY_LIST: Index = MultimapTableDefinition::new("items_by_list");
const ITEMS_BY_PLACE: Index = MultimapTableDefinition::new("items_by_place");
const PLACE_TAGS_BY_PLACE: Index = MultimapTableDefinition::new("place_tags_by_place");
const PLACE_TAGS_BY_TAG: Index = MultimapTableDefinition::new("place_tags_by_tag");

const INDEXES: [Index; 6] = [
    VISITS_BY_PLACE,
    DISHES_BY_VISIT,
    ITEMS_BY_LIST,
    ITEMS_BY_PLACE,
    PLACE_TAGS_BY_PLACE,
    PLACE_TAGS_BY_TAG,
];

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    seq: u64,
    record: T,
}

pub struct KvBackend {
    db: Database,
}

impl KvBackend {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let db = match location {
            StoreLocation::InMemory => {
                Database::builder().create_with_backend(InMemoryBackend::new())
            }
            StoreLocation::Path(path) => Database::create(path),
        }
        .map_err(|e| StoreError::StorageUnavailable(format!("{location:?}: {e}")))?;
        Ok(KvBackend { db })
    }

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        let txn = self.db.begin_write()?;
        match f(&txn) {
            Ok(out) => {
                txn.commit().context("Failed to commit object store write")?;
                Ok(out)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    tracing::warn!(error = %abort, "failed to abort object store write");
                }
                Err(e)
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&ReadTransaction) -> Result<R>) -> Result<R> {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    fn get_record<T: DeserializeOwned>(&self, def: Collection, id: &str) -> Result<Option<T>> {
        self.read(|txn| {
            let table = txn.open_table(def)?;
            Ok(load::<T>(&table, id)?.map(|e| e.record))
        })
    }

    fn all_records<T: DeserializeOwned>(&self, def: Collection) -> Result<Vec<T>> {
        self.read(|txn| {
            let table = txn.open_table(def)?;
            Ok(scan::<T>(&table)?.into_iter().map(|e| e.record).collect())
        })
    }

    /// Children of `parent` through `index`, in insertion order.
    fn children<T: DeserializeOwned>(
        &self,
        index: Index,
        def: Collection,
        parent: &str,
    ) -> Result<Vec<Envelope<T>>> {
        self.read(|txn| {
            let index = txn.open_multimap_table(index)?;
            let table = txn.open_table(def)?;
            let mut rows = Vec::new();
            for id in index_values(&index, parent)? {
                if let Some(env) = load::<T>(&table, &id)? {
                    rows.push(env);
                }
            }
            rows.sort_by_key(|e| e.seq);
            Ok(rows)
        })
    }

    fn collection_for(kind: EntityKind) -> Result<Collection> {
        Ok(match kind {
            EntityKind::Author => AUTHORS,
            EntityKind::Place => PLACES,
            EntityKind::List => LISTS,
            EntityKind::Visit => VISITS,
            EntityKind::Dish => DISHES,
            EntityKind::Category => CATEGORIES,
            EntityKind::Tag => TAGS,
            EntityKind::ListItem | EntityKind::PlaceTag => return Err(unsyncable(kind)),
        })
    }
}

// --- Table helpers ---

fn decode<T: DeserializeOwned>(raw: &str) -> Result<Envelope<T>> {
    serde_json::from_str(raw).context("Corrupt record in object store")
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    id: &str,
) -> Result<Option<Envelope<T>>> {
    match table.get(id)? {
        Some(raw) => Ok(Some(decode(raw.value())?)),
        None => Ok(None),
    }
}

fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
) -> Result<Vec<Envelope<T>>> {
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, raw) = entry?;
        rows.push(decode::<T>(raw.value())?);
    }
    rows.sort_by_key(|e| e.seq);
    Ok(rows)
}

fn index_values(
    index: &impl ReadableMultimapTable<&'static str, &'static str>,
    key: &str,
) -> Result<Vec<String>> {
    let mut values = Vec::new();
    for value in index.get(key)? {
        values.push(value?.value().to_string());
    }
    Ok(values)
}

fn create_tables(txn: &WriteTransaction) -> Result<()> {
    for def in COLLECTIONS {
        txn.open_table(def)?;
    }
    for def in INDEXES {
        txn.open_multimap_table(def)?;
    }
    txn.open_table(META)?;
    Ok(())
}

fn next_seq(txn: &WriteTransaction) -> Result<u64> {
    let mut meta = txn.open_table(META)?;
    let seq = meta.get(SEQ_KEY)?.map_or(0, |v| v.value()) + 1;
    meta.insert(SEQ_KEY, seq)?;
    Ok(seq)
}

fn exists(txn: &WriteTransaction, def: Collection, id: &str) -> Result<bool> {
    let table = txn.open_table(def)?;
    Ok(table.get(id)?.is_some())
}

fn require(txn: &WriteTransaction, def: Collection, kind: EntityKind, id: &str) -> Result<()> {
    if !exists(txn, def, id)? {
        bail!(StoreError::not_found(kind, id));
    }
    Ok(())
}

fn put_new<T: Serialize>(txn: &WriteTransaction, def: Collection, id: &str, record: &T) -> Result<()> {
    if exists(txn, def, id)? {
        bail!("record {id} already exists");
    }
    let seq = next_seq(txn)?;
    let json = serde_json::to_string(&Envelope { seq, record })?;
    let mut table = txn.open_table(def)?;
    table.insert(id, json.as_str())?;
    Ok(())
}

/// Overwrite an existing record in place, keeping its sequence number.
/// Returns the previous record, or `None` (writing nothing) if absent.
fn replace<T: Serialize + DeserializeOwned>(
    txn: &WriteTransaction,
    def: Collection,
    id: &str,
    record: &T,
) -> Result<Option<T>> {
    let mut table = txn.open_table(def)?;
    let Some(previous) = load::<T>(&table, id)? else {
        return Ok(None);
    };
    let json = serde_json::to_string(&Envelope {
        seq: previous.seq,
        record,
    })?;
    table.insert(id, json.as_str())?;
    Ok(Some(previous.record))
}

fn take<T: DeserializeOwned>(txn: &WriteTransaction, def: Collection, id: &str) -> Result<Option<T>> {
    let mut table = txn.open_table(def)?;
    let removed = match table.remove(id)? {
        Some(raw) => Some(decode::<T>(raw.value())?.record),
        None => None,
    };
    Ok(removed)
}

fn link(txn: &WriteTransaction, index: Index, key: &str, value: &str) -> Result<()> {
    txn.open_multimap_table(index)?.insert(key, value)?;
    Ok(())
}

fn unlink(txn: &WriteTransaction, index: Index, key: &str, value: &str) -> Result<()> {
    txn.open_multimap_table(index)?.remove(key, value)?;
    Ok(())
}

fn drain(txn: &WriteTransaction, index: Index, key: &str) -> Result<Vec<String>> {
    let mut table = txn.open_multimap_table(index)?;
    let mut values = Vec::new();
    for value in table.remove_all(key)? {
        values.push(value?.value().to_string());
    }
    Ok(values)
}

fn place_tag_key(place_id: &str, tag_id: &str) -> String {
    format!("{place_id}\u{1f}{tag_id}")
}

// --- Entity writes, shared by the live API and restore ---

fn put_author(txn: &WriteTransaction, author: &Author) -> Result<()> {
    put_new(txn, AUTHORS, &author.id, author)
}

fn put_place(txn: &WriteTransaction, place: &Place) -> Result<()> {
    put_new(txn, PLACES, &place.id, &stored_place(place))
}

fn put_list(txn: &WriteTransaction, list: &List) -> Result<()> {
    put_new(txn, LISTS, &list.id, &stored_list(list))
}

fn put_list_item(txn: &WriteTransaction, item: &ListItem) -> Result<()> {
    require(txn, LISTS, EntityKind::List, &item.list_id)?;
    require(txn, PLACES, EntityKind::Place, &item.place_id)?;
    put_new(txn, LIST_ITEMS, &item.id, item)?;
    link(txn, ITEMS_BY_LIST, &item.list_id, &item.id)?;
    link(txn, ITEMS_BY_PLACE, &item.place_id, &item.id)
}

fn put_visit(txn: &WriteTransaction, visit: &Visit) -> Result<()> {
    require(txn, PLACES, EntityKind::Place, &visit.place_id)?;
    put_new(txn, VISITS, &visit.id, visit)?;
    link(txn, VISITS_BY_PLACE, &visit.place_id, &visit.id)
}

fn put_dish(txn: &WriteTransaction, dish: &Dish) -> Result<()> {
    require(txn, VISITS, EntityKind::Visit, &dish.visit_id)?;
    put_new(txn, DISHES, &dish.id, dish)?;
    link(txn, DISHES_BY_VISIT, &dish.visit_id, &dish.id)
}

fn put_category(txn: &WriteTransaction, category: &Category) -> Result<()> {
    put_new(txn, CATEGORIES, &category.id, category)
}

fn put_tag(txn: &WriteTransaction, tag: &Tag) -> Result<()> {
    put_new(txn, TAGS, &tag.id, tag)
}

fn put_place_tag(txn: &WriteTransaction, place_tag: &PlaceTag) -> Result<bool> {
    require(txn, PLACES, EntityKind::Place, &place_tag.place_id)?;
    require(txn, TAGS, EntityKind::Tag, &place_tag.tag_id)?;
    let key = place_tag_key(&place_tag.place_id, &place_tag.tag_id);
    if exists(txn, PLACE_TAGS, &key)? {
        return Ok(false);
    }
    put_new(txn, PLACE_TAGS, &key, place_tag)?;
    link(txn, PLACE_TAGS_BY_PLACE, &place_tag.place_id, &place_tag.tag_id)?;
    link(txn, PLACE_TAGS_BY_TAG, &place_tag.tag_id, &place_tag.place_id)?;
    Ok(true)
}

fn stored_place(place: &Place) -> Place {
    Place {
        tag_ids: Vec::new(),
        ..place.clone()
    }
}

fn stored_list(list: &List) -> List {
    List {
        overall_rating: None,
        ..list.clone()
    }
}

// --- Cascading removals ---

fn remove_dishes_of(txn: &WriteTransaction, visit_id: &str) -> Result<()> {
    for dish_id in drain(txn, DISHES_BY_VISIT, visit_id)? {
        take::<IgnoredAny>(txn, DISHES, &dish_id)?;
    }
    Ok(())
}

fn remove_list_item(txn: &WriteTransaction, id: &str) -> Result<bool> {
    let Some(item) = take::<ListItem>(txn, LIST_ITEMS, id)? else {
        return Ok(false);
    };
    unlink(txn, ITEMS_BY_LIST, &item.list_id, id)?;
    unlink(txn, ITEMS_BY_PLACE, &item.place_id, id)?;
    Ok(true)
}

fn remove_place_tag(txn: &WriteTransaction, place_id: &str, tag_id: &str) -> Result<bool> {
    let key = place_tag_key(place_id, tag_id);
    if take::<IgnoredAny>(txn, PLACE_TAGS, &key)?.is_none() {
        return Ok(false);
    }
    unlink(txn, PLACE_TAGS_BY_PLACE, place_id, tag_id)?;
    unlink(txn, PLACE_TAGS_BY_TAG, tag_id, place_id)?;
    Ok(true)
}

fn remove_place(txn: &WriteTransaction, id: &str) -> Result<bool> {
    if take::<IgnoredAny>(txn, PLACES, id)?.is_none() {
        return Ok(false);
    }
    for visit_id in drain(txn, VISITS_BY_PLACE, id)? {
        take::<IgnoredAny>(txn, VISITS, &visit_id)?;
        remove_dishes_of(txn, &visit_id)?;
    }
    // Index tables must be closed again before the removals reopen them.
    let item_ids = index_values(&txn.open_multimap_table(ITEMS_BY_PLACE)?, id)?;
    for item_id in item_ids {
        remove_list_item(txn, &item_id)?;
    }
    let tag_ids = index_values(&txn.open_multimap_table(PLACE_TAGS_BY_PLACE)?, id)?;
    for tag_id in tag_ids {
        remove_place_tag(txn, id, &tag_id)?;
    }
    Ok(true)
}

fn remove_list(txn: &WriteTransaction, id: &str) -> Result<bool> {
    if take::<IgnoredAny>(txn, LISTS, id)?.is_none() {
        return Ok(false);
    }
    let item_ids = index_values(&txn.open_multimap_table(ITEMS_BY_LIST)?, id)?;
    for item_id in item_ids {
        remove_list_item(txn, &item_id)?;
    }
    Ok(true)
}

fn remove_visit(txn: &WriteTransaction, id: &str) -> Result<bool> {
    let Some(visit) = take::<Visit>(txn, VISITS, id)? else {
        return Ok(false);
    };
    unlink(txn, VISITS_BY_PLACE, &visit.place_id, id)?;
    remove_dishes_of(txn, id)?;
    Ok(true)
}

fn remove_dish(txn: &WriteTransaction, id: &str) -> Result<bool> {
    let Some(dish) = take::<Dish>(txn, DISHES, id)? else {
        return Ok(false);
    };
    unlink(txn, DISHES_BY_VISIT, &dish.visit_id, id)?;
    Ok(true)
}

fn remove_tag(txn: &WriteTransaction, id: &str) -> Result<bool> {
    if take::<IgnoredAny>(txn, TAGS, id)?.is_none() {
        return Ok(false);
    }
    let place_ids = index_values(&txn.open_multimap_table(PLACE_TAGS_BY_TAG)?, id)?;
    for place_id in place_ids {
        remove_place_tag(txn, &place_id, id)?;
    }
    Ok(true)
}

/// Re-point a child's index entry when its parent id changed.
fn relink(
    txn: &WriteTransaction,
    index: Index,
    child_id: &str,
    old_parent: &str,
    new_parent: &str,
) -> Result<()> {
    if old_parent != new_parent {
        unlink(txn, index, old_parent, child_id)?;
        link(txn, index, new_parent, child_id)?;
    }
    Ok(())
}

fn rewrite_list_item(txn: &WriteTransaction, item: &ListItem) -> Result<bool> {
    let Some(previous) = replace(txn, LIST_ITEMS, &item.id, item)? else {
        return Ok(false);
    };
    relink(txn, ITEMS_BY_LIST, &item.id, &previous.list_id, &item.list_id)?;
    relink(txn, ITEMS_BY_PLACE, &item.id, &previous.place_id, &item.place_id)?;
    Ok(true)
}

impl StorageBackend for KvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kv
    }

    fn initialize(&self) -> Result<()> {
        self.write(|txn| {
            create_tables(txn)?;
            let mut meta = txn.open_table(META)?;
            let current = meta.get(SCHEMA_KEY)?.map(|v| v.value());
            if current != Some(SCHEMA_VERSION) {
                meta.insert(SCHEMA_KEY, SCHEMA_VERSION)?;
                tracing::info!(from = ?current, to = SCHEMA_VERSION, "initialized object store");
            }
            Ok(())
        })
        .map_err(|e| StoreError::StorageUnavailable(format!("creating tables: {e:#}")).into())
    }

    fn schema_version(&self) -> Result<i64> {
        let version = self.read(|txn| {
            let meta = txn.open_table(META)?;
            Ok(meta.get(SCHEMA_KEY)?.map_or(0, |v| v.value()))
        })?;
        Ok(i64::try_from(version)?)
    }

    fn close(self: Box<Self>) -> Result<()> {
        drop(self.db);
        Ok(())
    }

    fn get_author(&self) -> Result<Option<Author>> {
        Ok(self.all_records::<Author>(AUTHORS)?.into_iter().next())
    }

    fn put_author(&self, author: &Author) -> Result<()> {
        self.write(|txn| {
            if replace(txn, AUTHORS, &author.id, author)?.is_none() {
                put_author(txn, author)?;
            }
            Ok(())
        })
    }

    // --- Places ---

    fn insert_place(&self, place: &Place) -> Result<()> {
        self.write(|txn| put_place(txn, place))
    }

    fn get_place(&self, id: &str) -> Result<Option<Place>> {
        self.get_record(PLACES, id)
    }

    fn list_places(&self) -> Result<Vec<Place>> {
        self.all_records(PLACES)
    }

    fn update_place(&self, place: &Place) -> Result<bool> {
        self.write(|txn| Ok(replace(txn, PLACES, &place.id, &stored_place(place))?.is_some()))
    }

    fn delete_place(&self, id: &str) -> Result<bool> {
        self.write(|txn| remove_place(txn, id))
    }

    // --- Lists ---

    fn insert_list(&self, list: &List) -> Result<()> {
        self.write(|txn| put_list(txn, list))
    }

    fn get_list(&self, id: &str) -> Result<Option<List>> {
        self.get_record(LISTS, id)
    }

    fn list_lists(&self) -> Result<Vec<List>> {
        self.all_records(LISTS)
    }

    fn update_list(&self, list: &List) -> Result<bool> {
        self.write(|txn| Ok(replace(txn, LISTS, &list.id, &stored_list(list))?.is_some()))
    }

    fn delete_list(&self, id: &str) -> Result<bool> {
        self.write(|txn| remove_list(txn, id))
    }

    // --- List items ---

    fn insert_list_item(&self, item: &ListItem) -> Result<()> {
        self.write(|txn| put_list_item(txn, item))
    }

    fn get_list_item(&self, id: &str) -> Result<Option<ListItem>> {
        self.get_record(LIST_ITEMS, id)
    }

    fn list_items(&self, list_id: &str) -> Result<Vec<ListItem>> {
        let mut rows = self.children::<ListItem>(ITEMS_BY_LIST, LIST_ITEMS, list_id)?;
        rows.sort_by_key(|e| (e.record.order, e.seq));
        Ok(rows.into_iter().map(|e| e.record).collect())
    }

    fn all_list_items(&self) -> Result<Vec<ListItem>> {
        self.all_records(LIST_ITEMS)
    }

    fn update_list_item(&self, item: &ListItem) -> Result<bool> {
        self.write(|txn| rewrite_list_item(txn, item))
    }

    fn delete_list_item(&self, id: &str) -> Result<bool> {
        self.write(|txn| remove_list_item(txn, id))
    }

    // --- Visits ---

    fn insert_visit(&self, visit: &Visit) -> Result<()> {
        self.write(|txn| put_visit(txn, visit))
    }

    fn get_visit(&self, id: &str) -> Result<Option<Visit>> {
        self.get_record(VISITS, id)
    }

    fn list_visits(&self, place_id: Option<&str>) -> Result<Vec<Visit>> {
        match place_id {
            Some(place_id) => Ok(self
                .children::<Visit>(VISITS_BY_PLACE, VISITS, place_id)?
                .into_iter()
                .map(|e| e.record)
                .collect()),
            None => self.all_records(VISITS),
        }
    }

    fn update_visit(&self, visit: &Visit) -> Result<bool> {
        self.write(|txn| {
            let Some(previous) = replace(txn, VISITS, &visit.id, visit)? else {
                return Ok(false);
            };
            relink(txn, VISITS_BY_PLACE, &visit.id, &previous.place_id, &visit.place_id)?;
            Ok(true)
        })
    }

    fn delete_visit(&self, id: &str) -> Result<bool> {
        self.write(|txn| remove_visit(txn, id))
    }

    // --- Dishes ---

    fn insert_dish(&self, dish: &Dish) -> Result<()> {
        self.write(|txn| put_dish(txn, dish))
    }

    fn get_dish(&self, id: &str) -> Result<Option<Dish>> {
        self.get_record(DISHES, id)
    }

    fn list_dishes(&self, visit_id: Option<&str>) -> Result<Vec<Dish>> {
        match visit_id {
            Some(visit_id) => Ok(self
                .children::<Dish>(DISHES_BY_VISIT, DISHES, visit_id)?
                .into_iter()
                .map(|e| e.record)
                .collect()),
            None => self.all_records(DISHES),
        }
    }

    fn update_dish(&self, dish: &Dish) -> Result<bool> {
        self.write(|txn| {
            let Some(previous) = replace(txn, DISHES, &dish.id, dish)? else {
                return Ok(false);
            };
            relink(txn, DISHES_BY_VISIT, &dish.id, &previous.visit_id, &dish.visit_id)?;
            Ok(true)
        })
    }

    fn delete_dish(&self, id: &str) -> Result<bool> {
        self.write(|txn| remove_dish(txn, id))
    }

    // --- Categories ---

    fn insert_category(&self, category: &Category) -> Result<()> {
        self.write(|txn| put_category(txn, category))
    }

    fn get_category(&self, id: &str) -> Result<Option<Category>> {
        self.get_record(CATEGORIES, id)
    }

    fn list_categories(&self, category_type: Option<CategoryType>) -> Result<Vec<Category>> {
        let mut categories: Vec<Category> = self.all_records(CATEGORIES)?;
        if let Some(category_type) = category_type {
            categories.retain(|c| c.category_type == category_type);
        }
        Ok(categories)
    }

    fn update_category(&self, category: &Category) -> Result<bool> {
        self.write(|txn| Ok(replace(txn, CATEGORIES, &category.id, category)?.is_some()))
    }

    fn delete_category(&self, id: &str) -> Result<bool> {
        self.write(|txn| Ok(take::<IgnoredAny>(txn, CATEGORIES, id)?.is_some()))
    }

    // --- Tags ---

    fn insert_tag(&self, tag: &Tag) -> Result<()> {
        self.write(|txn| put_tag(txn, tag))
    }

    fn get_tag(&self, id: &str) -> Result<Option<Tag>> {
        self.get_record(TAGS, id)
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        self.all_records(TAGS)
    }

    fn update_tag(&self, tag: &Tag) -> Result<bool> {
        self.write(|txn| Ok(replace(txn, TAGS, &tag.id, tag)?.is_some()))
    }

    fn delete_tag(&self, id: &str) -> Result<bool> {
        self.write(|txn| remove_tag(txn, id))
    }

    // --- Place tags ---

    fn insert_place_tag(&self, place_tag: &PlaceTag) -> Result<bool> {
        self.write(|txn| put_place_tag(txn, place_tag))
    }

    fn delete_place_tag(&self, place_id: &str, tag_id: &str) -> Result<bool> {
        self.write(|txn| remove_place_tag(txn, place_id, tag_id))
    }

    fn list_place_tags(&self, place_id: Option<&str>) -> Result<Vec<PlaceTag>> {
        let Some(place_id) = place_id else {
            return self.all_records(PLACE_TAGS);
        };
        self.read(|txn| {
            let index = txn.open_multimap_table(PLACE_TAGS_BY_PLACE)?;
            let table = txn.open_table(PLACE_TAGS)?;
            let mut rows = Vec::new();
            for tag_id in index_values(&index, place_id)? {
                if let Some(env) = load::<PlaceTag>(&table, &place_tag_key(place_id, &tag_id))? {
                    rows.push(env);
                }
            }
            rows.sort_by_key(|e| e.seq);
            Ok(rows.into_iter().map(|e| e.record).collect())
        })
    }

    fn apply_relation_edit(
        &self,
        writes: &[RelationWrite<'_>],
        owner: RelationOwner<'_>,
    ) -> Result<()> {
        self.write(|txn| {
            for write in writes {
                match *write {
                    RelationWrite::InsertListItem(item) => put_list_item(txn, item)?,
                    RelationWrite::UpdateListItem(item) => {
                        rewrite_list_item(txn, item)?;
                    }
                    RelationWrite::DeleteListItem(id) => {
                        remove_list_item(txn, id)?;
                    }
                    RelationWrite::InsertPlaceTag(place_tag) => {
                        put_place_tag(txn, place_tag)?;
                    }
                    RelationWrite::DeletePlaceTag { place_id, tag_id } => {
                        remove_place_tag(txn, place_id, tag_id)?;
                    }
                }
            }
            let stored = match owner {
                RelationOwner::Place(place) => {
                    replace(txn, PLACES, &place.id, &stored_place(place))?.is_some()
                }
                RelationOwner::List(list) => {
                    replace(txn, LISTS, &list.id, &stored_list(list))?.is_some()
                }
            };
            if !stored {
                return Err(owner.not_found());
            }
            Ok(())
        })
    }

    // --- Sync ---

    fn dirty_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let def = Self::collection_for(kind)?;
        let records: Vec<serde_json::Value> = self.all_records(def)?;
        Ok(records
            .into_iter()
            .filter(|r| r["dirty"] == serde_json::Value::Bool(true))
            .filter_map(|r| r["id"].as_str().map(str::to_string))
            .collect())
    }

    fn acknowledge(
        &self,
        kind: EntityKind,
        id: &str,
        external_id: &str,
        synced_at: &str,
        expected_updated_at: Option<&str>,
    ) -> Result<Acknowledgement> {
        let def = Self::collection_for(kind)?;
        self.write(|txn| {
            let mut table = txn.open_table(def)?;
            let Some(mut env) = load::<serde_json::Value>(&table, id)? else {
                return Ok(Acknowledgement::Missing);
            };
            let Some(record) = env.record.as_object_mut() else {
                bail!("Corrupt {kind} record {id} in object store");
            };
            record.insert("externalId".to_string(), external_id.into());
            record.insert("lastSyncedAt".to_string(), synced_at.into());
            let unchanged = expected_updated_at
                .is_none_or(|expected| record.get("updatedAt").and_then(|v| v.as_str()) == Some(expected));
            if unchanged {
                record.insert("dirty".to_string(), false.into());
            }
            let still_dirty = record.get("dirty") == Some(&serde_json::Value::Bool(true));
            let json = serde_json::to_string(&env)?;
            table.insert(id, json.as_str())?;
            Ok(if still_dirty {
                Acknowledgement::StillDirty
            } else {
                Acknowledgement::Clean
            })
        })
    }

    fn replace_all(&self, backup: &Backup) -> Result<()> {
        self.write(|txn| {
            for def in COLLECTIONS {
                txn.delete_table(def)?;
            }
            for def in INDEXES {
                txn.delete_multimap_table(def)?;
            }
            create_tables(txn)?;

            if let Some(author) = &backup.author {
                put_author(txn, author)?;
            }
            for category in &backup.categories {
                put_category(txn, category)?;
            }
            for tag in &backup.tags {
                put_tag(txn, tag)?;
            }
            for place in &backup.places {
                put_place(txn, place)?;
            }
            for list in &backup.lists {
                put_list(txn, list)?;
            }
            for visit in &backup.visits {
                put_visit(txn, visit)?;
            }
            for dish in &backup.dishes {
                put_dish(txn, dish)?;
            }
            for item in &backup.list_items {
                put_list_item(txn, item)?;
            }
            for place_tag in &backup.place_tags {
                put_place_tag(txn, place_tag)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RatingMode, SyncState, now_timestamp};

    fn backend() -> KvBackend {
        let backend = KvBackend::open(&StoreLocation::InMemory).unwrap();
        backend.initialize().unwrap();
        backend
    }

    fn sample_place(id: &str) -> Place {
        let now = now_timestamp();
        Place {
            id: id.to_string(),
            name: format!("Place {id}"),
            address: None,
            latitude: 0.0,
            longitude: 0.0,
            category_id: None,
            notes: None,
            overall_rating_manual: None,
            rating_mode: RatingMode::Aggregate,
            cover_image_uri: None,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
            tag_ids: vec!["not-stored".to_string()],
        }
    }

    fn sample_list(id: &str) -> List {
        let now = now_timestamp();
        List {
            id: id.to_string(),
            name: "Favourites".to_string(),
            description: None,
            category: None,
            city: None,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
            overall_rating: Some(4.0),
        }
    }

    fn sample_item(id: &str, list_id: &str, place_id: &str, order: i64) -> ListItem {
        ListItem {
            id: id.to_string(),
            list_id: list_id.to_string(),
            place_id: place_id.to_string(),
            order,
            created_at: now_timestamp(),
        }
    }

    #[test]
    fn test_initialize_twice_keeps_data() {
        let db = backend();
        db.insert_place(&sample_place("p1")).unwrap();
        db.initialize().unwrap();
        assert_eq!(db.list_places().unwrap().len(), 1);
        assert_eq!(db.schema_version().unwrap(), 1);
    }

    #[test]
    fn test_computed_fields_are_not_stored() {
        let db = backend();
        db.insert_place(&sample_place("p1")).unwrap();
        db.insert_list(&sample_list("l1")).unwrap();
        assert!(db.get_place("p1").unwrap().unwrap().tag_ids.is_empty());
        assert_eq!(db.get_list("l1").unwrap().unwrap().overall_rating, None);
    }

    #[test]
    fn test_list_order_is_insertion_order_after_update() {
        let db = backend();
        for id in ["b", "a", "c"] {
            db.insert_place(&sample_place(id)).unwrap();
        }
        let mut a = db.get_place("a").unwrap().unwrap();
        a.name = "Renamed".to_string();
        assert!(db.update_place(&a).unwrap());

        let ids: Vec<String> = db.list_places().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_list_items_sort_by_order_then_insertion() {
        let db = backend();
        db.insert_list(&sample_list("l1")).unwrap();
        for id in ["p1", "p2", "p3"] {
            db.insert_place(&sample_place(id)).unwrap();
        }
        db.insert_list_item(&sample_item("i1", "l1", "p1", 5)).unwrap();
        db.insert_list_item(&sample_item("i2", "l1", "p2", 1)).unwrap();
        db.insert_list_item(&sample_item("i3", "l1", "p3", 5)).unwrap();

        let ids: Vec<String> = db.list_items("l1").unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["i2", "i1", "i3"]);
    }

    #[test]
    fn test_delete_place_fans_out_through_indexes() {
        let db = backend();
        db.insert_place(&sample_place("p1")).unwrap();
        db.insert_place(&sample_place("p2")).unwrap();
        db.insert_list(&sample_list("l1")).unwrap();
        db.insert_list_item(&sample_item("i1", "l1", "p1", 0)).unwrap();
        db.insert_list_item(&sample_item("i2", "l1", "p2", 1)).unwrap();

        assert!(db.delete_place("p1").unwrap());

        let remaining: Vec<String> = db.list_items("l1").unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(remaining, vec!["i2"]);
        assert!(db.get_list_item("i1").unwrap().is_none());
        assert!(!db.delete_place("p1").unwrap());
    }

    #[test]
    fn test_insert_child_requires_parent() {
        let db = backend();
        db.insert_list(&sample_list("l1")).unwrap();
        let err = db
            .insert_list_item(&sample_item("i1", "l1", "missing", 0))
            .unwrap_err();
        assert!(crate::error::is_not_found(&err));
        assert!(db.all_list_items().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let db = backend();
        db.insert_place(&sample_place("p1")).unwrap();
        assert!(db.insert_place(&sample_place("p1")).is_err());
    }

    #[test]
    fn test_acknowledge_keeps_record_dirty_when_edited() {
        let db = backend();
        let place = sample_place("p1");
        db.insert_place(&place).unwrap();

        let ack = db
            .acknowledge(EntityKind::Place, "p1", "ext", "now", Some("older"))
            .unwrap();
        assert_eq!(ack, Acknowledgement::StillDirty);
        assert_eq!(db.dirty_ids(EntityKind::Place).unwrap(), vec!["p1"]);

        let ack = db
            .acknowledge(EntityKind::Place, "p1", "ext", "now", Some(&place.updated_at))
            .unwrap();
        assert_eq!(ack, Acknowledgement::Clean);
        let stored = db.get_place("p1").unwrap().unwrap();
        assert_eq!(stored.sync.external_id.as_deref(), Some("ext"));
        assert_eq!(stored.updated_at, place.updated_at);
        assert!(db.dirty_ids(EntityKind::Place).unwrap().is_empty());
    }

    #[test]
    fn test_on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::Path(dir.path().join("haunts.redb"));
        {
            let db = KvBackend::open(&location).unwrap();
            db.initialize().unwrap();
            db.insert_place(&sample_place("p1")).unwrap();
            Box::new(db).close().unwrap();
        }
        let db = KvBackend::open(&location).unwrap();
        db.initialize().unwrap();
        assert!(db.get_place("p1").unwrap().is_some());
    }
}
