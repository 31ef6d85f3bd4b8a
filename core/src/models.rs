use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Timestamp format used on every stored record (RFC 3339, UTC, microseconds).
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// --- Entity kinds ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Author,
    Place,
    List,
    ListItem,
    Visit,
    Dish,
    Category,
    Tag,
    PlaceTag,
}

impl EntityKind {
    /// Kinds that carry a dirty flag, in the order a sync pass visits them.
    pub const SYNC_ORDER: [EntityKind; 7] = [
        EntityKind::Author,
        EntityKind::Place,
        EntityKind::List,
        EntityKind::Visit,
        EntityKind::Dish,
        EntityKind::Category,
        EntityKind::Tag,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Place => "place",
            Self::List => "list",
            Self::ListItem => "list_item",
            Self::Visit => "visit",
            Self::Dish => "dish",
            Self::Category => "category",
            Self::Tag => "tag",
            Self::PlaceTag => "place_tag",
        }
    }

    #[must_use]
    pub fn is_syncable(self) -> bool {
        Self::SYNC_ORDER.contains(&self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Sync bookkeeping shared by every syncable record ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub dirty: bool,
    pub external_id: Option<String>,
    pub last_synced_at: Option<String>,
}

impl SyncState {
    /// State of a freshly created record: the remote has no copy yet.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            dirty: true,
            external_id: None,
            last_synced_at: None,
        }
    }
}

/// A record stored in one of the entity collections.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

/// A record the sync engine pushes to the remote.
pub trait SyncRecord: Record {
    fn sync_state(&self) -> &SyncState;
    fn sync_state_mut(&mut self) -> &mut SyncState;
    fn updated_at(&self) -> &str;
    fn set_updated_at(&mut self, at: String);

    /// Record an ordinary user edit: bump `updated_at` and mark dirty.
    fn touch(&mut self) {
        self.set_updated_at(now_timestamp());
        self.sync_state_mut().dirty = true;
    }
}

macro_rules! syncable {
    ($ty:ty, $kind:expr) => {
        impl Record for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }
        }

        impl SyncRecord for $ty {
            fn sync_state(&self) -> &SyncState {
                &self.sync
            }

            fn sync_state_mut(&mut self) -> &mut SyncState {
                &mut self.sync
            }

            fn updated_at(&self) -> &str {
                &self.updated_at
            }

            fn set_updated_at(&mut self, at: String) {
                self.updated_at = at;
            }
        }
    };
}

// --- Enumerations ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingMode {
    /// Mean of the dish ratings across all visits.
    #[default]
    Aggregate,
    /// The user's manual override.
    Overall,
}

impl RatingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Overall => "overall",
        }
    }
}

impl FromStr for RatingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aggregate" => Ok(Self::Aggregate),
            "overall" => Ok(Self::Overall),
            _ => bail!(StoreError::Validation(format!(
                "rating mode '{s}'. Must be one of: aggregate, overall"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryType {
    Place,
    Dish,
}

impl CategoryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Place => "place",
            Self::Dish => "dish",
        }
    }
}

impl FromStr for CategoryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "place" => Ok(Self::Place),
            "dish" => Ok(Self::Dish),
            _ => bail!(StoreError::Validation(format!(
                "category type '{s}'. Must be one of: place, dish"
            ))),
        }
    }
}

// --- Entities ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub display_name: String,
    pub avatar_uri: Option<String>,
    pub email: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
}

syncable!(Author, EntityKind::Author);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub category_id: Option<String>,
    pub notes: Option<String>,
    pub overall_rating_manual: Option<f64>,
    #[serde(default)]
    pub rating_mode: RatingMode,
    pub cover_image_uri: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
    // Hydrated from the place/tag relation, never stored on the record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<String>,
}

syncable!(Place, EntityKind::Place);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub city: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
    // Computed from member places, never stored on the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_rating: Option<f64>,
}

syncable!(List, EntityKind::List);

/// Largest `order` a restored list item may carry.
pub const MAX_ITEM_ORDER: i64 = (1 << 32) - 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub id: String,
    pub list_id: String,
    pub place_id: String,
    pub order: i64,
    pub created_at: String,
}

impl Record for ListItem {
    const KIND: EntityKind = EntityKind::ListItem;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: String,
    pub place_id: String,
    pub visited_at: String,
    pub notes: Option<String>,
    pub photo_uri: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
}

syncable!(Visit, EntityKind::Visit);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dish {
    pub id: String,
    pub visit_id: String,
    pub name: String,
    pub category_id: Option<String>,
    pub rating: u8,
    pub notes: Option<String>,
    pub photo_uri: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
}

syncable!(Dish, EntityKind::Dish);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: CategoryType,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
}

syncable!(Category, EntityKind::Category);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    pub created_at: String,
    pub updated_at: String,
}

syncable!(Tag, EntityKind::Tag);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceTag {
    pub place_id: String,
    pub tag_id: String,
    pub created_at: String,
}

// --- Inputs ---

#[derive(Debug, Clone, Default)]
pub struct NewAuthor {
    pub display_name: String,
    pub avatar_uri: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAuthor {
    pub display_name: Option<String>,
    pub avatar_uri: Option<Option<String>>,
    pub email: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewPlace {
    pub name: String,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub category_id: Option<String>,
    pub notes: Option<String>,
    pub overall_rating_manual: Option<f64>,
    pub rating_mode: RatingMode,
    pub cover_image_uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePlace {
    pub name: Option<String>,
    pub address: Option<Option<String>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category_id: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub overall_rating_manual: Option<Option<f64>>,
    pub rating_mode: Option<RatingMode>,
    pub cover_image_uri: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewList {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateList {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub city: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewVisit {
    pub place_id: String,
    /// Defaults to the creation time.
    pub visited_at: Option<String>,
    pub notes: Option<String>,
    pub photo_uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateVisit {
    pub visited_at: Option<String>,
    pub notes: Option<Option<String>>,
    pub photo_uri: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDish {
    pub visit_id: String,
    pub name: String,
    pub category_id: Option<String>,
    pub rating: u8,
    pub notes: Option<String>,
    pub photo_uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateDish {
    pub name: Option<String>,
    pub category_id: Option<Option<String>>,
    pub rating: Option<u8>,
    pub notes: Option<Option<String>>,
    pub photo_uri: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub name: String,
    pub category_type: CategoryType,
    pub parent_id: Option<String>,
    /// Defaults to one past the highest order among categories of the same type.
    pub order: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCategory {
    pub name: Option<String>,
    pub parent_id: Option<Option<String>>,
    pub order: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTag {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTag {
    pub name: Option<String>,
    pub color: Option<Option<String>>,
}

// --- Backup ---

pub const BACKUP_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub version: i64,
    pub exported_at: String,
    pub author: Option<Author>,
    pub places: Vec<Place>,
    pub lists: Vec<List>,
    pub list_items: Vec<ListItem>,
    pub visits: Vec<Visit>,
    pub dishes: Vec<Dish>,
    pub categories: Vec<Category>,
    pub tags: Vec<Tag>,
    pub place_tags: Vec<PlaceTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub authors: usize,
    pub places: usize,
    pub lists: usize,
    pub list_items: usize,
    pub visits: usize,
    pub dishes: usize,
    pub categories: usize,
    pub tags: usize,
    pub place_tags: usize,
}

/// Per-collection record counts, with how many are waiting to be pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub kind: String,
    pub total: usize,
    pub dirty: usize,
}

// --- Validation ---

pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!(StoreError::Validation(format!("{what} name must not be empty")));
    }
    Ok(())
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        bail!(StoreError::Validation(format!(
            "latitude {latitude} must be between -90 and 90"
        )));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        bail!(StoreError::Validation(format!(
            "longitude {longitude} must be between -180 and 180"
        )));
    }
    Ok(())
}

pub fn validate_manual_rating(rating: Option<f64>) -> Result<()> {
    if let Some(r) = rating {
        if !(0.0..=5.0).contains(&r) {
            bail!(StoreError::Validation(format!(
                "overall rating {r} must be between 0 and 5"
            )));
        }
    }
    Ok(())
}

pub fn validate_dish_rating(rating: u8) -> Result<()> {
    if !(1..=5).contains(&rating) {
        bail!(StoreError::Validation(format!(
            "dish rating {rating} must be between 1 and 5"
        )));
    }
    Ok(())
}

/// Tag names compare case-insensitively (Unicode lowercase) on every backend.
#[must_use]
pub fn tag_names_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}
