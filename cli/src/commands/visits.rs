use std::collections::HashMap;

use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use haunts_core::Repository;
use haunts_core::models::{
    Dish, EntityKind, NewDish, NewVisit, UpdateDish, UpdateVisit, Visit,
};

use super::helpers::{
    clearable, fmt_timestamp, parse_visited_at, pick, short_id, sync_marker, truncate,
};
use super::places::{find_category, find_place};

pub(crate) struct DishArgs {
    pub name: Option<String>,
    pub rating: Option<u8>,
    pub category: Option<String>,
    pub notes: Option<String>,
    pub photo: Option<String>,
}

// Visits have no name, so only ids and id prefixes resolve.
fn find_visit(repo: &Repository, key: &str) -> Result<Visit> {
    let visits = repo.visits().list(None)?;
    pick(&visits, key, EntityKind::Visit, |v| v.id.as_str(), |v| v.id.as_str()).cloned()
}

fn find_dish(repo: &Repository, key: &str) -> Result<Dish> {
    let dishes = repo.dishes().list(None)?;
    pick(&dishes, key, EntityKind::Dish, |d| d.id.as_str(), |d| d.name.as_str()).cloned()
}

pub(crate) fn cmd_visit_add(
    repo: &Repository,
    place: &str,
    at: Option<&str>,
    notes: Option<String>,
    photo: Option<String>,
    json: bool,
) -> Result<()> {
    let place = find_place(repo, place)?;
    let visit = repo.visits().create(NewVisit {
        place_id: place.id.clone(),
        visited_at: at.map(parse_visited_at).transpose()?,
        notes,
        photo_uri: photo,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&visit)?);
    } else {
        println!(
            "Logged visit {} to '{}' at {}",
            short_id(&visit.id),
            place.name,
            fmt_timestamp(&visit.visited_at)
        );
    }
    Ok(())
}

pub(crate) fn cmd_visit_list(repo: &Repository, place: Option<&str>, json: bool) -> Result<()> {
    let place_id = place.map(|key| find_place(repo, key).map(|p| p.id)).transpose()?;
    let mut visits = repo.visits().list(place_id.as_deref())?;
    visits.sort_by(|a, b| b.visited_at.cmp(&a.visited_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&visits)?);
    } else if visits.is_empty() {
        eprintln!("No visits found. Use `haunts visit add <place>` to log one.");
    } else {
        #[derive(Tabled)]
        struct VisitRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "When")]
            when: String,
            #[tabled(rename = "Place")]
            place: String,
            #[tabled(rename = "Dishes")]
            dishes: usize,
            #[tabled(rename = "Notes")]
            notes: String,
            #[tabled(rename = "Sync")]
            sync: &'static str,
        }

        let names: HashMap<String, String> = repo
            .places()
            .list()?
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        let mut dish_counts: HashMap<String, usize> = HashMap::new();
        for dish in repo.dishes().list(None)? {
            *dish_counts.entry(dish.visit_id).or_default() += 1;
        }

        let rows: Vec<VisitRow> = visits
            .iter()
            .map(|v| VisitRow {
                id: short_id(&v.id),
                when: fmt_timestamp(&v.visited_at),
                place: names
                    .get(&v.place_id)
                    .map(|n| truncate(n, 30))
                    .unwrap_or_default(),
                dishes: dish_counts.get(&v.id).copied().unwrap_or(0),
                notes: v.notes.as_deref().map(|n| truncate(n, 40)).unwrap_or_default(),
                sync: sync_marker(v.sync.dirty),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(3..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}

pub(crate) fn cmd_visit_edit(
    repo: &Repository,
    key: &str,
    at: Option<&str>,
    notes: Option<String>,
    photo: Option<String>,
    json: bool,
) -> Result<()> {
    let visit = find_visit(repo, key)?;
    let updated = repo.visits().update(
        &visit.id,
        UpdateVisit {
            visited_at: at.map(parse_visited_at).transpose()?,
            notes: clearable(notes),
            photo_uri: clearable(photo),
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated visit {}", short_id(&updated.id));
    }
    Ok(())
}

pub(crate) fn cmd_visit_delete(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let visit = find_visit(repo, key)?;
    repo.visits().delete(&visit.id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": visit.id }));
    } else {
        println!("Deleted visit {} with its dishes", short_id(&visit.id));
    }
    Ok(())
}

pub(crate) fn cmd_dish_add(
    repo: &Repository,
    visit: &str,
    name: String,
    rating: u8,
    args: DishArgs,
    json: bool,
) -> Result<()> {
    let visit = find_visit(repo, visit)?;
    let category_id = args
        .category
        .as_deref()
        .map(|key| find_category(repo, key).map(|c| c.id))
        .transpose()?;

    let dish = repo.dishes().create(NewDish {
        visit_id: visit.id,
        name,
        category_id,
        rating,
        notes: args.notes,
        photo_uri: args.photo,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dish)?);
    } else {
        println!(
            "Added '{}' ({}/5) as {}",
            dish.name,
            dish.rating,
            short_id(&dish.id)
        );
    }
    Ok(())
}

pub(crate) fn cmd_dish_list(repo: &Repository, visit: Option<&str>, json: bool) -> Result<()> {
    let visit_id = visit.map(|key| find_visit(repo, key).map(|v| v.id)).transpose()?;
    let dishes = repo.dishes().list(visit_id.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dishes)?);
    } else if dishes.is_empty() {
        eprintln!("No dishes found.");
    } else {
        #[derive(Tabled)]
        struct DishRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Dish")]
            name: String,
            #[tabled(rename = "Rating")]
            rating: u8,
            #[tabled(rename = "Visit")]
            visit: String,
            #[tabled(rename = "Notes")]
            notes: String,
        }

        let rows: Vec<DishRow> = dishes
            .iter()
            .map(|d| DishRow {
                id: short_id(&d.id),
                name: truncate(&d.name, 30),
                rating: d.rating,
                visit: short_id(&d.visit_id),
                notes: d.notes.as_deref().map(|n| truncate(n, 40)).unwrap_or_default(),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}

pub(crate) fn cmd_dish_edit(repo: &Repository, key: &str, args: DishArgs, json: bool) -> Result<()> {
    let dish = find_dish(repo, key)?;
    let category_id = match clearable(args.category) {
        Some(Some(key)) => Some(Some(find_category(repo, &key)?.id)),
        Some(None) => Some(None),
        None => None,
    };

    let updated = repo.dishes().update(
        &dish.id,
        UpdateDish {
            name: args.name,
            category_id,
            rating: args.rating,
            notes: clearable(args.notes),
            photo_uri: clearable(args.photo),
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated '{}' ({}/5)", updated.name, updated.rating);
    }
    Ok(())
}

pub(crate) fn cmd_dish_delete(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let dish = find_dish(repo, key)?;
    repo.dishes().delete(&dish.id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": dish.id }));
    } else {
        println!("Deleted '{}'", dish.name);
    }
    Ok(())
}
