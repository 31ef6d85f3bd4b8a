use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use haunts_core::Repository;
use haunts_core::models::{EntityKind, List, NewList, UpdateList};

use super::helpers::{clearable, fmt_rating, pick, short_id, sync_marker, truncate};
use super::places::find_place;

pub(crate) struct ListArgs {
    pub description: Option<String>,
    pub category: Option<String>,
    pub city: Option<String>,
}

fn find_list(repo: &Repository, key: &str) -> Result<List> {
    let lists = repo.lists().list()?;
    pick(&lists, key, EntityKind::List, |l| l.id.as_str(), |l| l.name.as_str()).cloned()
}

pub(crate) fn cmd_list_create(
    repo: &Repository,
    name: String,
    args: ListArgs,
    json: bool,
) -> Result<()> {
    let list = repo.lists().create(NewList {
        name,
        description: args.description,
        category: args.category,
        city: args.city,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        println!("Created list '{}' ({})", list.name, short_id(&list.id));
    }
    Ok(())
}

pub(crate) fn cmd_list_list(repo: &Repository, json: bool) -> Result<()> {
    let lists = repo.lists().list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&lists)?);
    } else if lists.is_empty() {
        eprintln!("No lists yet. Use `haunts list create` to start one.");
    } else {
        #[derive(Tabled)]
        struct ListRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Name")]
            name: String,
            #[tabled(rename = "City")]
            city: String,
            #[tabled(rename = "Places")]
            places: usize,
            #[tabled(rename = "Rating")]
            rating: String,
            #[tabled(rename = "Sync")]
            sync: &'static str,
        }

        let mut rows = Vec::with_capacity(lists.len());
        for l in &lists {
            rows.push(ListRow {
                id: short_id(&l.id),
                name: truncate(&l.name, 30),
                city: l.city.clone().unwrap_or_default(),
                places: repo.lists().items(&l.id)?.len(),
                rating: fmt_rating(l.overall_rating),
                sync: sync_marker(l.sync.dirty),
            });
        }

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(3..5)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}

pub(crate) fn cmd_list_show(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let list = find_list(repo, key)?;
    let items = repo.lists().items(&list.id)?;
    let places = repo.lists().places(&list.id)?;

    if json {
        let mut value = serde_json::to_value(&list)?;
        value["items"] = serde_json::to_value(&items)?;
        value["places"] = serde_json::to_value(&places)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} ({})", list.name, list.id);
    if let Some(ref description) = list.description {
        println!("  {description}");
    }
    println!("  Rating: {}", fmt_rating(list.overall_rating));
    if items.is_empty() {
        println!("  (empty)");
        return Ok(());
    }

    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "#")]
        order: i64,
        #[tabled(rename = "Place")]
        place: String,
        #[tabled(rename = "Rating")]
        rating: String,
    }

    let mut rows = Vec::with_capacity(items.len());
    for (item, place) in items.iter().zip(&places) {
        rows.push(ItemRow {
            order: item.order,
            place: truncate(&place.name, 40),
            rating: fmt_rating(repo.places().rating(&place.id)?),
        });
    }
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_list_edit(
    repo: &Repository,
    key: &str,
    name: Option<String>,
    args: ListArgs,
    json: bool,
) -> Result<()> {
    let list = find_list(repo, key)?;
    let updated = repo.lists().update(
        &list.id,
        UpdateList {
            name,
            description: clearable(args.description),
            category: clearable(args.category),
            city: clearable(args.city),
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated list '{}'", updated.name);
    }
    Ok(())
}

pub(crate) fn cmd_list_delete(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let list = find_list(repo, key)?;
    repo.lists().delete(&list.id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": list.id }));
    } else {
        println!("Deleted list '{}'", list.name);
    }
    Ok(())
}

pub(crate) fn cmd_list_add(repo: &Repository, key: &str, place: &str, json: bool) -> Result<()> {
    let list = find_list(repo, key)?;
    let place = find_place(repo, place)?;
    let item = repo.lists().add_place(&list.id, &place.id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        println!("'{}' is #{} in '{}'", place.name, item.order, list.name);
    }
    Ok(())
}

pub(crate) fn cmd_list_remove(
    repo: &Repository,
    key: &str,
    place: &str,
    json: bool,
) -> Result<()> {
    let list = find_list(repo, key)?;
    let place = find_place(repo, place)?;
    let removed = repo.lists().remove_place(&list.id, &place.id)?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else if removed {
        println!("Removed '{}' from '{}'", place.name, list.name);
    } else {
        eprintln!("'{}' is not in '{}'", place.name, list.name);
    }
    Ok(())
}

/// Put the list's places in the given order. Every member must be named.
pub(crate) fn cmd_list_reorder(
    repo: &Repository,
    key: &str,
    places: &[String],
    json: bool,
) -> Result<()> {
    let list = find_list(repo, key)?;
    let items = repo.lists().items(&list.id)?;

    let mut item_ids = Vec::with_capacity(places.len());
    for place_key in places {
        let place = find_place(repo, place_key)?;
        let Some(item) = items.iter().find(|i| i.place_id == place.id) else {
            bail!("'{}' is not in '{}'", place.name, list.name);
        };
        item_ids.push(item.id.clone());
    }

    let reordered = repo.lists().reorder(&list.id, &item_ids)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reordered)?);
    } else {
        println!("Reordered {} place(s) in '{}'", reordered.len(), list.name);
    }
    Ok(())
}
