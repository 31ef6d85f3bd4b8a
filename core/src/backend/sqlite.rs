use anyhow::{Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, params};

use super::{
    Acknowledgement, BackendKind, RelationOwner, RelationWrite, StorageBackend, StoreLocation,
    unsyncable,
};
use crate::error::StoreError;
use crate::models::{
    Author, Backup, Category, CategoryType, Dish, EntityKind, List, ListItem, Place, PlaceTag,
    RatingMode, SyncState, Tag, Visit,
};

const SCHEMA_VERSION: i64 = 2;

const AUTHOR_COLUMNS: &str =
    "id, display_name, avatar_uri, email, dirty, external_id, last_synced_at, created_at, updated_at";
const PLACE_COLUMNS: &str = "id, name, address, latitude, longitude, category_id, notes, \
     overall_rating_manual, rating_mode, cover_image_uri, dirty, external_id, last_synced_at, \
     created_at, updated_at";
const LIST_COLUMNS: &str = "id, name, description, category, city, dirty, external_id, \
     last_synced_at, created_at, updated_at";
const LIST_ITEM_COLUMNS: &str = "id, list_id, place_id, sort_order, created_at";
const VISIT_COLUMNS: &str = "id, place_id, visited_at, notes, photo_uri, dirty, external_id, \
     last_synced_at, created_at, updated_at";
const DISH_COLUMNS: &str = "id, visit_id, name, category_id, rating, notes, photo_uri, dirty, \
     external_id, last_synced_at, created_at, updated_at";
const CATEGORY_COLUMNS: &str = "id, name, category_type, parent_id, sort_order, dirty, \
     external_id, last_synced_at, created_at, updated_at";
const TAG_COLUMNS: &str =
    "id, name, color, dirty, external_id, last_synced_at, created_at, updated_at";
const PLACE_TAG_COLUMNS: &str = "place_id, tag_id, created_at";

/// Columns added after the base schema. Re-running an `ALTER` that already
/// applied fails with "duplicate column name", which is expected.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("authors", "last_synced_at TEXT"),
    ("places", "last_synced_at TEXT"),
    ("places", "cover_image_uri TEXT"),
    ("places", "rating_mode TEXT NOT NULL DEFAULT 'aggregate'"),
    ("lists", "last_synced_at TEXT"),
    ("visits", "last_synced_at TEXT"),
    ("dishes", "last_synced_at TEXT"),
    ("dishes", "photo_uri TEXT"),
    ("categories", "last_synced_at TEXT"),
    ("categories", "parent_id TEXT"),
    ("categories", "sort_order INTEGER NOT NULL DEFAULT 0"),
    ("tags", "last_synced_at TEXT"),
];

impl FromSql for RatingMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for RatingMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for CategoryType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for CategoryType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = match location {
            StoreLocation::InMemory => Connection::open_in_memory(),
            StoreLocation::Path(path) => Connection::open(path),
        }
        .map_err(|e| StoreError::StorageUnavailable(format!("{location:?}: {e}")))?;
        conn.pragma_update(None, "foreign_keys", true)
            .and_then(|()| conn.pragma_query_value(None, "user_version", |row| row.get::<_, i64>(0)))
            .map_err(|e| StoreError::StorageUnavailable(format!("{location:?}: {e}")))?;
        Ok(SqliteBackend { conn })
    }

    fn create_base_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS authors (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_uri TEXT,
                email TEXT,
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS places (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                category_id TEXT,
                notes TEXT,
                overall_rating_manual REAL,
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                category TEXT,
                city TEXT,
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS list_items (
                id TEXT PRIMARY KEY,
                list_id TEXT NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
                place_id TEXT NOT NULL REFERENCES places(id) ON DELETE CASCADE,
                sort_order INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS visits (
                id TEXT PRIMARY KEY,
                place_id TEXT NOT NULL REFERENCES places(id) ON DELETE CASCADE,
                visited_at TEXT NOT NULL,
                notes TEXT,
                photo_uri TEXT,
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dishes (
                id TEXT PRIMARY KEY,
                visit_id TEXT NOT NULL REFERENCES visits(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                category_id TEXT,
                rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                notes TEXT,
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                category_type TEXT NOT NULL CHECK (category_type IN ('place', 'dish')),
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT,
                dirty INTEGER NOT NULL DEFAULT 1,
                external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS place_tags (
                place_id TEXT NOT NULL REFERENCES places(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                PRIMARY KEY (place_id, tag_id)
            );

            CREATE INDEX IF NOT EXISTS idx_visits_place ON visits(place_id);
            CREATE INDEX IF NOT EXISTS idx_dishes_visit ON dishes(visit_id);
            CREATE INDEX IF NOT EXISTS idx_list_items_list ON list_items(list_id, sort_order);
            CREATE INDEX IF NOT EXISTS idx_list_items_place ON list_items(place_id);
            CREATE INDEX IF NOT EXISTS idx_place_tags_tag ON place_tags(tag_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_name ON tags(name COLLATE NOCASE);

            PRAGMA user_version = 1;",
        )?;
        Ok(())
    }

    fn add_missing_columns(&self) {
        for (table, column) in ADDITIVE_COLUMNS {
            match self
                .conn
                .execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column}"))
            {
                Ok(()) => tracing::debug!(table, column, "added column"),
                Err(e) if e.to_string().contains("duplicate column name") => {}
                Err(e) => tracing::warn!(table, column, error = %e, "additive migration failed"),
            }
        }
    }

    fn dirty_table(kind: EntityKind) -> Result<&'static str> {
        Ok(match kind {
            EntityKind::Author => "authors",
            EntityKind::Place => "places",
            EntityKind::List => "lists",
            EntityKind::Visit => "visits",
            EntityKind::Dish => "dishes",
            EntityKind::Category => "categories",
            EntityKind::Tag => "tags",
            EntityKind::ListItem | EntityKind::PlaceTag => return Err(unsyncable(kind)),
        })
    }

    fn delete_by_id(&self, table: &str, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        Ok(changed > 0)
    }
}

// --- Row mappers ---

fn sync_state_from_row(row: &rusqlite::Row, start: usize) -> rusqlite::Result<SyncState> {
    Ok(SyncState {
        dirty: row.get(start)?,
        external_id: row.get(start + 1)?,
        last_synced_at: row.get(start + 2)?,
    })
}

fn author_from_row(row: &rusqlite::Row) -> rusqlite::Result<Author> {
    Ok(Author {
        id: row.get(0)?,
        display_name: row.get(1)?,
        avatar_uri: row.get(2)?,
        email: row.get(3)?,
        sync: sync_state_from_row(row, 4)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn place_from_row(row: &rusqlite::Row) -> rusqlite::Result<Place> {
    Ok(Place {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        category_id: row.get(5)?,
        notes: row.get(6)?,
        overall_rating_manual: row.get(7)?,
        rating_mode: row.get(8)?,
        cover_image_uri: row.get(9)?,
        sync: sync_state_from_row(row, 10)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        tag_ids: Vec::new(),
    })
}

fn list_from_row(row: &rusqlite::Row) -> rusqlite::Result<List> {
    Ok(List {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        city: row.get(4)?,
        sync: sync_state_from_row(row, 5)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        overall_rating: None,
    })
}

fn list_item_from_row(row: &rusqlite::Row) -> rusqlite::Result<ListItem> {
    Ok(ListItem {
        id: row.get(0)?,
        list_id: row.get(1)?,
        place_id: row.get(2)?,
        order: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn visit_from_row(row: &rusqlite::Row) -> rusqlite::Result<Visit> {
    Ok(Visit {
        id: row.get(0)?,
        place_id: row.get(1)?,
        visited_at: row.get(2)?,
        notes: row.get(3)?,
        photo_uri: row.get(4)?,
        sync: sync_state_from_row(row, 5)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn dish_from_row(row: &rusqlite::Row) -> rusqlite::Result<Dish> {
    Ok(Dish {
        id: row.get(0)?,
        visit_id: row.get(1)?,
        name: row.get(2)?,
        category_id: row.get(3)?,
        rating: row.get(4)?,
        notes: row.get(5)?,
        photo_uri: row.get(6)?,
        sync: sync_state_from_row(row, 7)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn category_from_row(row: &rusqlite::Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        category_type: row.get(2)?,
        parent_id: row.get(3)?,
        order: row.get(4)?,
        sync: sync_state_from_row(row, 5)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn tag_from_row(row: &rusqlite::Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        sync: sync_state_from_row(row, 3)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn place_tag_from_row(row: &rusqlite::Row) -> rusqlite::Result<PlaceTag> {
    Ok(PlaceTag {
        place_id: row.get(0)?,
        tag_id: row.get(1)?,
        created_at: row.get(2)?,
    })
}

// --- Inserts, shared by the live API and restore ---

fn insert_author(conn: &Connection, a: &Author) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO authors ({AUTHOR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            a.id,
            a.display_name,
            a.avatar_uri,
            a.email,
            a.sync.dirty,
            a.sync.external_id,
            a.sync.last_synced_at,
            a.created_at,
            a.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_place(conn: &Connection, p: &Place) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO places ({PLACE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            p.id,
            p.name,
            p.address,
            p.latitude,
            p.longitude,
            p.category_id,
            p.notes,
            p.overall_rating_manual,
            p.rating_mode,
            p.cover_image_uri,
            p.sync.dirty,
            p.sync.external_id,
            p.sync.last_synced_at,
            p.created_at,
            p.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_list(conn: &Connection, l: &List) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO lists ({LIST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            l.id,
            l.name,
            l.description,
            l.category,
            l.city,
            l.sync.dirty,
            l.sync.external_id,
            l.sync.last_synced_at,
            l.created_at,
            l.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_list_item(conn: &Connection, i: &ListItem) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO list_items ({LIST_ITEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        params![i.id, i.list_id, i.place_id, i.order, i.created_at],
    )?;
    Ok(())
}

fn insert_visit(conn: &Connection, v: &Visit) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO visits ({VISIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            v.id,
            v.place_id,
            v.visited_at,
            v.notes,
            v.photo_uri,
            v.sync.dirty,
            v.sync.external_id,
            v.sync.last_synced_at,
            v.created_at,
            v.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_dish(conn: &Connection, d: &Dish) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO dishes ({DISH_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            d.id,
            d.visit_id,
            d.name,
            d.category_id,
            d.rating,
            d.notes,
            d.photo_uri,
            d.sync.dirty,
            d.sync.external_id,
            d.sync.last_synced_at,
            d.created_at,
            d.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_category(conn: &Connection, c: &Category) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO categories ({CATEGORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            c.id,
            c.name,
            c.category_type,
            c.parent_id,
            c.order,
            c.sync.dirty,
            c.sync.external_id,
            c.sync.last_synced_at,
            c.created_at,
            c.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_tag(conn: &Connection, t: &Tag) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO tags ({TAG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            t.id,
            t.name,
            t.color,
            t.sync.dirty,
            t.sync.external_id,
            t.sync.last_synced_at,
            t.created_at,
            t.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_place_tag(conn: &Connection, pt: &PlaceTag) -> Result<bool> {
    let changed = conn.execute(
        &format!("INSERT OR IGNORE INTO place_tags ({PLACE_TAG_COLUMNS}) VALUES (?1, ?2, ?3)"),
        params![pt.place_id, pt.tag_id, pt.created_at],
    )?;
    Ok(changed > 0)
}

fn update_place(conn: &Connection, p: &Place) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE places SET name = ?2, address = ?3, latitude = ?4, longitude = ?5,
             category_id = ?6, notes = ?7, overall_rating_manual = ?8, rating_mode = ?9,
             cover_image_uri = ?10, dirty = ?11, external_id = ?12, last_synced_at = ?13,
             updated_at = ?14
         WHERE id = ?1",
        params![
            p.id,
            p.name,
            p.address,
            p.latitude,
            p.longitude,
            p.category_id,
            p.notes,
            p.overall_rating_manual,
            p.rating_mode,
            p.cover_image_uri,
            p.sync.dirty,
            p.sync.external_id,
            p.sync.last_synced_at,
            p.updated_at,
        ],
    )?;
    Ok(changed > 0)
}

fn update_list(conn: &Connection, l: &List) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE lists SET name = ?2, description = ?3, category = ?4, city = ?5, dirty = ?6,
             external_id = ?7, last_synced_at = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            l.id,
            l.name,
            l.description,
            l.category,
            l.city,
            l.sync.dirty,
            l.sync.external_id,
            l.sync.last_synced_at,
            l.updated_at,
        ],
    )?;
    Ok(changed > 0)
}

fn update_list_item(conn: &Connection, i: &ListItem) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE list_items SET list_id = ?2, place_id = ?3, sort_order = ?4 WHERE id = ?1",
        params![i.id, i.list_id, i.place_id, i.order],
    )?;
    Ok(changed > 0)
}

fn delete_place_tag(conn: &Connection, place_id: &str, tag_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM place_tags WHERE place_id = ?1 AND tag_id = ?2",
        params![place_id, tag_id],
    )?;
    Ok(changed > 0)
}

impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn initialize(&self) -> Result<()> {
        let version = self.schema_version()?;
        if version < 1 {
            self.create_base_schema()
                .map_err(|e| StoreError::StorageUnavailable(format!("creating schema: {e:#}")))?;
        }
        self.add_missing_columns();
        if version < SCHEMA_VERSION {
            self.conn
                .pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("Failed to record schema version")?;
            tracing::info!(from = version, to = SCHEMA_VERSION, "migrated sqlite schema");
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<i64> {
        let version = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context("Failed to close database")
    }

    fn get_author(&self) -> Result<Option<Author>> {
        let author = self
            .conn
            .query_row(
                &format!("SELECT {AUTHOR_COLUMNS} FROM authors ORDER BY rowid LIMIT 1"),
                [],
                author_from_row,
            )
            .optional()?;
        Ok(author)
    }

    fn put_author(&self, a: &Author) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE authors SET display_name = ?2, avatar_uri = ?3, email = ?4, dirty = ?5,
                 external_id = ?6, last_synced_at = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                a.id,
                a.display_name,
                a.avatar_uri,
                a.email,
                a.sync.dirty,
                a.sync.external_id,
                a.sync.last_synced_at,
                a.updated_at,
            ],
        )?;
        if changed == 0 {
            insert_author(&self.conn, a)?;
        }
        Ok(())
    }

    // --- Places ---

    fn insert_place(&self, place: &Place) -> Result<()> {
        insert_place(&self.conn, place)
    }

    fn get_place(&self, id: &str) -> Result<Option<Place>> {
        let place = self
            .conn
            .query_row(
                &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = ?1"),
                params![id],
                place_from_row,
            )
            .optional()?;
        Ok(place)
    }

    fn list_places(&self) -> Result<Vec<Place>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PLACE_COLUMNS} FROM places ORDER BY rowid"))?;
        let places = stmt
            .query_map([], place_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(places)
    }

    fn update_place(&self, place: &Place) -> Result<bool> {
        update_place(&self.conn, place)
    }

    fn delete_place(&self, id: &str) -> Result<bool> {
        self.delete_by_id("places", id)
    }

    // --- Lists ---

    fn insert_list(&self, list: &List) -> Result<()> {
        insert_list(&self.conn, list)
    }

    fn get_list(&self, id: &str) -> Result<Option<List>> {
        let list = self
            .conn
            .query_row(
                &format!("SELECT {LIST_COLUMNS} FROM lists WHERE id = ?1"),
                params![id],
                list_from_row,
            )
            .optional()?;
        Ok(list)
    }

    fn list_lists(&self) -> Result<Vec<List>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {LIST_COLUMNS} FROM lists ORDER BY rowid"))?;
        let lists = stmt
            .query_map([], list_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    fn update_list(&self, list: &List) -> Result<bool> {
        update_list(&self.conn, list)
    }

    fn delete_list(&self, id: &str) -> Result<bool> {
        self.delete_by_id("lists", id)
    }

    // --- List items ---

    fn insert_list_item(&self, item: &ListItem) -> Result<()> {
        insert_list_item(&self.conn, item)
    }

    fn get_list_item(&self, id: &str) -> Result<Option<ListItem>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {LIST_ITEM_COLUMNS} FROM list_items WHERE id = ?1"),
                params![id],
                list_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    fn list_items(&self, list_id: &str) -> Result<Vec<ListItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LIST_ITEM_COLUMNS} FROM list_items
             WHERE list_id = ?1
             ORDER BY sort_order, rowid"
        ))?;
        let items = stmt
            .query_map(params![list_id], list_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn all_list_items(&self) -> Result<Vec<ListItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LIST_ITEM_COLUMNS} FROM list_items ORDER BY rowid"
        ))?;
        let items = stmt
            .query_map([], list_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn update_list_item(&self, item: &ListItem) -> Result<bool> {
        update_list_item(&self.conn, item)
    }

    fn delete_list_item(&self, id: &str) -> Result<bool> {
        self.delete_by_id("list_items", id)
    }

    // --- Visits ---

    fn insert_visit(&self, visit: &Visit) -> Result<()> {
        insert_visit(&self.conn, visit)
    }

    fn get_visit(&self, id: &str) -> Result<Option<Visit>> {
        let visit = self
            .conn
            .query_row(
                &format!("SELECT {VISIT_COLUMNS} FROM visits WHERE id = ?1"),
                params![id],
                visit_from_row,
            )
            .optional()?;
        Ok(visit)
    }

    fn list_visits(&self, place_id: Option<&str>) -> Result<Vec<Visit>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VISIT_COLUMNS} FROM visits
             WHERE ?1 IS NULL OR place_id = ?1
             ORDER BY rowid"
        ))?;
        let visits = stmt
            .query_map(params![place_id], visit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(visits)
    }

    fn update_visit(&self, v: &Visit) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE visits SET place_id = ?2, visited_at = ?3, notes = ?4, photo_uri = ?5,
                 dirty = ?6, external_id = ?7, last_synced_at = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                v.id,
                v.place_id,
                v.visited_at,
                v.notes,
                v.photo_uri,
                v.sync.dirty,
                v.sync.external_id,
                v.sync.last_synced_at,
                v.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_visit(&self, id: &str) -> Result<bool> {
        self.delete_by_id("visits", id)
    }

    // --- Dishes ---

    fn insert_dish(&self, dish: &Dish) -> Result<()> {
        insert_dish(&self.conn, dish)
    }

    fn get_dish(&self, id: &str) -> Result<Option<Dish>> {
        let dish = self
            .conn
            .query_row(
                &format!("SELECT {DISH_COLUMNS} FROM dishes WHERE id = ?1"),
                params![id],
                dish_from_row,
            )
            .optional()?;
        Ok(dish)
    }

    fn list_dishes(&self, visit_id: Option<&str>) -> Result<Vec<Dish>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DISH_COLUMNS} FROM dishes
             WHERE ?1 IS NULL OR visit_id = ?1
             ORDER BY rowid"
        ))?;
        let dishes = stmt
            .query_map(params![visit_id], dish_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dishes)
    }

    fn update_dish(&self, d: &Dish) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE dishes SET visit_id = ?2, name = ?3, category_id = ?4, rating = ?5,
                 notes = ?6, photo_uri = ?7, dirty = ?8, external_id = ?9, last_synced_at = ?10,
                 updated_at = ?11
             WHERE id = ?1",
            params![
                d.id,
                d.visit_id,
                d.name,
                d.category_id,
                d.rating,
                d.notes,
                d.photo_uri,
                d.sync.dirty,
                d.sync.external_id,
                d.sync.last_synced_at,
                d.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_dish(&self, id: &str) -> Result<bool> {
        self.delete_by_id("dishes", id)
    }

    // --- Categories ---

    fn insert_category(&self, category: &Category) -> Result<()> {
        insert_category(&self.conn, category)
    }

    fn get_category(&self, id: &str) -> Result<Option<Category>> {
        let category = self
            .conn
            .query_row(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
                params![id],
                category_from_row,
            )
            .optional()?;
        Ok(category)
    }

    fn list_categories(&self, category_type: Option<CategoryType>) -> Result<Vec<Category>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories
             WHERE ?1 IS NULL OR category_type = ?1
             ORDER BY rowid"
        ))?;
        let categories = stmt
            .query_map(params![category_type], category_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    fn update_category(&self, c: &Category) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE categories SET name = ?2, category_type = ?3, parent_id = ?4, sort_order = ?5,
                 dirty = ?6, external_id = ?7, last_synced_at = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                c.id,
                c.name,
                c.category_type,
                c.parent_id,
                c.order,
                c.sync.dirty,
                c.sync.external_id,
                c.sync.last_synced_at,
                c.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_category(&self, id: &str) -> Result<bool> {
        self.delete_by_id("categories", id)
    }

    // --- Tags ---

    fn insert_tag(&self, tag: &Tag) -> Result<()> {
        insert_tag(&self.conn, tag)
    }

    fn get_tag(&self, id: &str) -> Result<Option<Tag>> {
        let tag = self
            .conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1"),
                params![id],
                tag_from_row,
            )
            .optional()?;
        Ok(tag)
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TAG_COLUMNS} FROM tags ORDER BY rowid"))?;
        let tags = stmt
            .query_map([], tag_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    fn update_tag(&self, t: &Tag) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE tags SET name = ?2, color = ?3, dirty = ?4, external_id = ?5,
                 last_synced_at = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                t.id,
                t.name,
                t.color,
                t.sync.dirty,
                t.sync.external_id,
                t.sync.last_synced_at,
                t.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_tag(&self, id: &str) -> Result<bool> {
        self.delete_by_id("tags", id)
    }

    // --- Place tags ---

    fn insert_place_tag(&self, place_tag: &PlaceTag) -> Result<bool> {
        insert_place_tag(&self.conn, place_tag)
    }

    fn delete_place_tag(&self, place_id: &str, tag_id: &str) -> Result<bool> {
        delete_place_tag(&self.conn, place_id, tag_id)
    }

    fn list_place_tags(&self, place_id: Option<&str>) -> Result<Vec<PlaceTag>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PLACE_TAG_COLUMNS} FROM place_tags
             WHERE ?1 IS NULL OR place_id = ?1
             ORDER BY rowid"
        ))?;
        let place_tags = stmt
            .query_map(params![place_id], place_tag_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(place_tags)
    }

    fn apply_relation_edit(
        &self,
        writes: &[RelationWrite<'_>],
        owner: RelationOwner<'_>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for write in writes {
            match *write {
                RelationWrite::InsertListItem(item) => insert_list_item(&tx, item)?,
                RelationWrite::UpdateListItem(item) => {
                    update_list_item(&tx, item)?;
                }
                RelationWrite::DeleteListItem(id) => {
                    tx.execute("DELETE FROM list_items WHERE id = ?1", params![id])?;
                }
                RelationWrite::InsertPlaceTag(place_tag) => {
                    insert_place_tag(&tx, place_tag)?;
                }
                RelationWrite::DeletePlaceTag { place_id, tag_id } => {
                    delete_place_tag(&tx, place_id, tag_id)?;
                }
            }
        }
        let stored = match owner {
            RelationOwner::Place(place) => update_place(&tx, place)?,
            RelationOwner::List(list) => update_list(&tx, list)?,
        };
        if !stored {
            return Err(owner.not_found());
        }
        tx.commit().context("Failed to commit relation edit")?;
        Ok(())
    }

    // --- Sync ---

    fn dirty_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let table = Self::dirty_table(kind)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {table} WHERE dirty = 1 ORDER BY rowid"))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn acknowledge(
        &self,
        kind: EntityKind,
        id: &str,
        external_id: &str,
        synced_at: &str,
        expected_updated_at: Option<&str>,
    ) -> Result<Acknowledgement> {
        let table = Self::dirty_table(kind)?;
        let changed = self.conn.execute(
            &format!(
                "UPDATE {table}
                 SET external_id = ?2,
                     last_synced_at = ?3,
                     dirty = CASE WHEN ?4 IS NULL OR updated_at = ?4 THEN 0 ELSE dirty END
                 WHERE id = ?1"
            ),
            params![id, external_id, synced_at, expected_updated_at],
        )?;
        if changed == 0 {
            return Ok(Acknowledgement::Missing);
        }
        let dirty: bool = self.conn.query_row(
            &format!("SELECT dirty FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get(0),
        )?;
        Ok(if dirty {
            Acknowledgement::StillDirty
        } else {
            Acknowledgement::Clean
        })
    }

    fn replace_all(&self, backup: &Backup) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(
            "DELETE FROM place_tags;
             DELETE FROM dishes;
             DELETE FROM visits;
             DELETE FROM list_items;
             DELETE FROM places;
             DELETE FROM lists;
             DELETE FROM categories;
             DELETE FROM tags;
             DELETE FROM authors;",
        )?;

        if let Some(author) = &backup.author {
            insert_author(&tx, author)?;
        }
        for category in &backup.categories {
            insert_category(&tx, category)?;
        }
        for tag in &backup.tags {
            insert_tag(&tx, tag)?;
        }
        for place in &backup.places {
            insert_place(&tx, place)?;
        }
        for list in &backup.lists {
            insert_list(&tx, list)?;
        }
        for visit in &backup.visits {
            insert_visit(&tx, visit)?;
        }
        for dish in &backup.dishes {
            insert_dish(&tx, dish)?;
        }
        for item in &backup.list_items {
            insert_list_item(&tx, item)?;
        }
        for place_tag in &backup.place_tags {
            insert_place_tag(&tx, place_tag)?;
        }

        tx.commit().context("Failed to commit restore")?;
        Ok(())
    }
}
