use anyhow::Result;

use crate::backend::StorageBackend;
use crate::models::{Category, CategoryType, SyncState, new_id, now_timestamp};

/// Place categories every store starts with.
pub const DEFAULT_PLACE_CATEGORIES: [&str; 10] = [
    "Restaurant",
    "Café",
    "Bar",
    "Bakery",
    "Street Food",
    "Food Truck",
    "Dessert",
    "Fine Dining",
    "Fast Food",
    "Market",
];

/// Bring the backend's structures up to date and seed default categories.
/// Safe to run on every start.
pub fn initialize(backend: &dyn StorageBackend) -> Result<()> {
    backend.initialize()?;
    seed_default_categories(backend)?;
    Ok(())
}

/// Insert each default place category whose name is not already present.
/// Returns how many were inserted.
pub fn seed_default_categories(backend: &dyn StorageBackend) -> Result<usize> {
    let existing = backend.list_categories(Some(CategoryType::Place))?;
    let mut next_order = existing.iter().map(|c| c.order).max().map_or(0, |max| max + 1);
    let mut inserted = 0;

    for name in DEFAULT_PLACE_CATEGORIES {
        if existing.iter().any(|c| c.name == name) {
            continue;
        }
        let now = now_timestamp();
        backend.insert_category(&Category {
            id: new_id(),
            name: name.to_string(),
            category_type: CategoryType::Place,
            parent_id: None,
            order: next_order,
            sync: SyncState::pending(),
            created_at: now.clone(),
            updated_at: now,
        })?;
        next_order += 1;
        inserted += 1;
    }

    if inserted > 0 {
        tracing::info!(inserted, "seeded default place categories");
    }
    Ok(inserted)
}
