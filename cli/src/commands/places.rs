use std::collections::HashMap;

use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use haunts_core::Repository;
use haunts_core::models::{
    Category, EntityKind, NewPlace, Place, RatingMode, Tag, UpdatePlace,
};

use super::helpers::{clearable, fmt_rating, fmt_timestamp, pick, short_id, sync_marker, truncate};

pub(crate) struct PlaceArgs {
    pub name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
    pub notes: Option<String>,
    pub rating: Option<f64>,
    pub clear_rating: bool,
    pub rating_mode: Option<RatingMode>,
    pub cover: Option<String>,
}

pub(crate) enum TagAction {
    Add(Vec<String>),
    Remove(Vec<String>),
    Set(Vec<String>),
}

/// Look up a place by id, id prefix, or name.
pub(crate) fn find_place(repo: &Repository, key: &str) -> Result<Place> {
    let places = repo.places().list()?;
    pick(&places, key, EntityKind::Place, |p| p.id.as_str(), |p| p.name.as_str()).cloned()
}

pub(super) fn find_category(repo: &Repository, key: &str) -> Result<Category> {
    let categories = repo.categories().list(None)?;
    pick(&categories, key, EntityKind::Category, |c| c.id.as_str(), |c| c.name.as_str()).cloned()
}

fn find_tag(tags: &[Tag], key: &str) -> Result<String> {
    pick(tags, key, EntityKind::Tag, |t| t.id.as_str(), |t| t.name.as_str()).map(|t| t.id.clone())
}

pub(crate) fn cmd_place_add(
    repo: &Repository,
    name: String,
    latitude: f64,
    longitude: f64,
    args: PlaceArgs,
    json: bool,
) -> Result<()> {
    let category_id = args
        .category
        .as_deref()
        .map(|key| find_category(repo, key).map(|c| c.id))
        .transpose()?;

    let place = repo.places().create(NewPlace {
        name,
        address: args.address,
        latitude,
        longitude,
        category_id,
        notes: args.notes,
        overall_rating_manual: args.rating,
        rating_mode: args.rating_mode.unwrap_or_default(),
        cover_image_uri: args.cover,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&place)?);
    } else {
        println!("Added place '{}' ({})", place.name, short_id(&place.id));
    }
    Ok(())
}

pub(crate) fn cmd_place_list(repo: &Repository, json: bool) -> Result<()> {
    let places = repo.places().list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&places)?);
        return Ok(());
    }
    if places.is_empty() {
        eprintln!("No places yet. Use `haunts place add` to record one.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct PlaceRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Rating")]
        rating: String,
        #[tabled(rename = "Visits")]
        visits: usize,
        #[tabled(rename = "Tags")]
        tags: String,
        #[tabled(rename = "Sync")]
        sync: &'static str,
    }

    let categories: HashMap<String, String> = repo
        .categories()
        .list(None)?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();
    let tags: HashMap<String, String> = repo
        .tags()
        .list()?
        .into_iter()
        .map(|t| (t.id, t.name))
        .collect();
    let mut visit_counts: HashMap<String, usize> = HashMap::new();
    for visit in repo.visits().list(None)? {
        *visit_counts.entry(visit.place_id).or_default() += 1;
    }

    let mut rows = Vec::with_capacity(places.len());
    for p in &places {
        rows.push(PlaceRow {
            id: short_id(&p.id),
            name: truncate(&p.name, 30),
            category: p
                .category_id
                .as_ref()
                .and_then(|id| categories.get(id))
                .cloned()
                .unwrap_or_default(),
            rating: fmt_rating(repo.places().rating(&p.id)?),
            visits: visit_counts.get(&p.id).copied().unwrap_or(0),
            tags: p
                .tag_ids
                .iter()
                .filter_map(|id| tags.get(id).map(String::as_str))
                .collect::<Vec<_>>()
                .join(", "),
            sync: sync_marker(p.sync.dirty),
        });
    }

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_place_show(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let place = find_place(repo, key)?;
    let rating = repo.places().rating(&place.id)?;
    let visits = repo.visits().list(Some(&place.id))?;

    if json {
        let mut value = serde_json::to_value(&place)?;
        value["rating"] = serde_json::json!(rating);
        value["visits"] = serde_json::to_value(&visits)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} ({})", place.name, place.id);
    if let Some(ref address) = place.address {
        println!("  Address:  {address}");
    }
    println!("  Location: {:.5}, {:.5}", place.latitude, place.longitude);
    if let Some(ref category_id) = place.category_id {
        let name = repo
            .categories()
            .get(category_id)
            .map_or_else(|_| category_id.clone(), |c| c.name);
        println!("  Category: {name}");
    }
    println!("  Rating:   {} ({})", fmt_rating(rating), place.rating_mode.as_str());
    if !place.tag_ids.is_empty() {
        let names: Vec<String> = place
            .tag_ids
            .iter()
            .map(|id| repo.tags().get(id).map(|t| t.name))
            .collect::<Result<_>>()?;
        println!("  Tags:     {}", names.join(", "));
    }
    if let Some(ref notes) = place.notes {
        println!("  Notes:    {notes}");
    }
    println!("  Sync:     {}", sync_marker(place.sync.dirty));
    if !visits.is_empty() {
        println!("  Visits:");
        for v in &visits {
            let dishes = repo.dishes().list(Some(&v.id))?;
            println!(
                "    {}  {}  {} dish(es)",
                short_id(&v.id),
                fmt_timestamp(&v.visited_at),
                dishes.len()
            );
        }
    }
    Ok(())
}

pub(crate) fn cmd_place_edit(
    repo: &Repository,
    key: &str,
    args: PlaceArgs,
    json: bool,
) -> Result<()> {
    let place = find_place(repo, key)?;
    let category_id = match clearable(args.category) {
        Some(Some(key)) => Some(Some(find_category(repo, &key)?.id)),
        Some(None) => Some(None),
        None => None,
    };

    let updated = repo.places().update(
        &place.id,
        UpdatePlace {
            name: args.name,
            address: clearable(args.address),
            latitude: args.latitude,
            longitude: args.longitude,
            category_id,
            notes: clearable(args.notes),
            overall_rating_manual: if args.clear_rating {
                Some(None)
            } else {
                args.rating.map(Some)
            },
            rating_mode: args.rating_mode,
            cover_image_uri: clearable(args.cover),
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated place '{}'", updated.name);
    }
    Ok(())
}

pub(crate) fn cmd_place_delete(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let place = find_place(repo, key)?;
    repo.places().delete(&place.id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": place.id }));
    } else {
        println!("Deleted place '{}' with its visits and dishes", place.name);
    }
    Ok(())
}

pub(crate) fn cmd_place_tag(
    repo: &Repository,
    key: &str,
    action: TagAction,
    json: bool,
) -> Result<()> {
    let place = find_place(repo, key)?;
    let tags = repo.tags().list()?;
    let resolve = |keys: &[String]| -> Result<Vec<String>> {
        keys.iter().map(|k| find_tag(&tags, k)).collect()
    };

    let mut changed = 0;
    match action {
        TagAction::Add(keys) => {
            for tag_id in resolve(&keys)? {
                changed += usize::from(repo.places().add_tag(&place.id, &tag_id)?);
            }
        }
        TagAction::Remove(keys) => {
            for tag_id in resolve(&keys)? {
                changed += usize::from(repo.places().remove_tag(&place.id, &tag_id)?);
            }
        }
        TagAction::Set(keys) => {
            let ids = resolve(&keys)?;
            changed = ids.len();
            repo.places().set_tags(&place.id, &ids)?;
        }
    }

    let place = repo.places().get(&place.id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&place)?);
    } else {
        let names: Vec<&str> = tags
            .iter()
            .filter(|t| place.tag_ids.contains(&t.id))
            .map(|t| t.name.as_str())
            .collect();
        println!(
            "{changed} tag change(s) on '{}'. Tags: {}",
            place.name,
            if names.is_empty() {
                "(none)".to_string()
            } else {
                names.join(", ")
            }
        );
    }
    Ok(())
}
