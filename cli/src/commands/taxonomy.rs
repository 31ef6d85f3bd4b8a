use std::collections::HashMap;

use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use haunts_core::Repository;
use haunts_core::models::{
    CategoryType, EntityKind, NewAuthor, NewCategory, NewTag, Tag, UpdateAuthor, UpdateCategory,
    UpdateTag,
};

use super::helpers::{clearable, pick, short_id, sync_marker};
use super::places::find_category;

fn find_tag(repo: &Repository, key: &str) -> Result<Tag> {
    let tags = repo.tags().list()?;
    pick(&tags, key, EntityKind::Tag, |t| t.id.as_str(), |t| t.name.as_str()).cloned()
}

// --- Categories ---

pub(crate) fn cmd_category_add(
    repo: &Repository,
    name: String,
    category_type: CategoryType,
    parent: Option<&str>,
    json: bool,
) -> Result<()> {
    let parent_id = parent
        .map(|key| find_category(repo, key).map(|c| c.id))
        .transpose()?;
    let category = repo.categories().create(NewCategory {
        name,
        category_type,
        parent_id,
        order: None,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&category)?);
    } else {
        println!(
            "Added {} category '{}' at position {}",
            category.category_type.as_str(),
            category.name,
            category.order
        );
    }
    Ok(())
}

pub(crate) fn cmd_category_list(
    repo: &Repository,
    category_type: Option<CategoryType>,
    json: bool,
) -> Result<()> {
    let categories = repo.categories().list(category_type)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
    } else if categories.is_empty() {
        eprintln!("No categories. Use `haunts defaults` to restore the built-in ones.");
    } else {
        #[derive(Tabled)]
        struct CategoryRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Order")]
            order: i64,
            #[tabled(rename = "Name")]
            name: String,
            #[tabled(rename = "Type")]
            kind: &'static str,
            #[tabled(rename = "Parent")]
            parent: String,
            #[tabled(rename = "Sync")]
            sync: &'static str,
        }

        let names: HashMap<&str, &str> = categories
            .iter()
            .map(|c| (c.id.as_str(), c.name.as_str()))
            .collect();
        let rows: Vec<CategoryRow> = categories
            .iter()
            .map(|c| CategoryRow {
                id: short_id(&c.id),
                order: c.order,
                name: c.name.clone(),
                kind: c.category_type.as_str(),
                parent: c
                    .parent_id
                    .as_deref()
                    .map(|id| names.get(id).map_or_else(|| short_id(id), |n| (*n).to_string()))
                    .unwrap_or_default(),
                sync: sync_marker(c.sync.dirty),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(1..2)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}

pub(crate) fn cmd_category_edit(
    repo: &Repository,
    key: &str,
    name: Option<String>,
    parent: Option<String>,
    order: Option<i64>,
    json: bool,
) -> Result<()> {
    let category = find_category(repo, key)?;
    let parent_id = match clearable(parent) {
        Some(Some(key)) => Some(Some(find_category(repo, &key)?.id)),
        Some(None) => Some(None),
        None => None,
    };
    let updated = repo.categories().update(
        &category.id,
        UpdateCategory {
            name,
            parent_id,
            order,
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated category '{}'", updated.name);
    }
    Ok(())
}

pub(crate) fn cmd_category_delete(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let category = find_category(repo, key)?;
    repo.categories().delete(&category.id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": category.id }));
    } else {
        println!("Deleted category '{}'", category.name);
    }
    Ok(())
}

pub(crate) fn cmd_category_reorder(
    repo: &Repository,
    category_type: CategoryType,
    keys: &[String],
    json: bool,
) -> Result<()> {
    if keys.is_empty() {
        bail!("Name at least one category to reorder");
    }
    let ids = keys
        .iter()
        .map(|key| find_category(repo, key).map(|c| c.id))
        .collect::<Result<Vec<_>>>()?;
    let categories = repo.categories().reorder(category_type, &ids)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
    } else {
        let names: Vec<&str> = categories.iter().map(|c| c.name.as_str()).collect();
        println!("{} categories: {}", category_type.as_str(), names.join(", "));
    }
    Ok(())
}

// --- Tags ---

pub(crate) fn cmd_tag_add(
    repo: &Repository,
    name: String,
    color: Option<String>,
    json: bool,
) -> Result<()> {
    let tag = repo.tags().create(NewTag { name, color })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tag)?);
    } else {
        println!("Added tag '{}' ({})", tag.name, short_id(&tag.id));
    }
    Ok(())
}

pub(crate) fn cmd_tag_list(repo: &Repository, json: bool) -> Result<()> {
    let tags = repo.tags().list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tags)?);
    } else if tags.is_empty() {
        eprintln!("No tags yet. Use `haunts tag add` to create one.");
    } else {
        #[derive(Tabled)]
        struct TagRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Name")]
            name: String,
            #[tabled(rename = "Color")]
            color: String,
            #[tabled(rename = "Places")]
            places: usize,
        }

        let mut usage: HashMap<String, usize> = HashMap::new();
        for place in repo.places().list()? {
            for tag_id in place.tag_ids {
                *usage.entry(tag_id).or_default() += 1;
            }
        }
        let rows: Vec<TagRow> = tags
            .iter()
            .map(|t| TagRow {
                id: short_id(&t.id),
                name: t.name.clone(),
                color: t.color.clone().unwrap_or_default(),
                places: usage.get(&t.id).copied().unwrap_or(0),
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

pub(crate) fn cmd_tag_edit(
    repo: &Repository,
    key: &str,
    name: Option<String>,
    color: Option<String>,
    json: bool,
) -> Result<()> {
    let tag = find_tag(repo, key)?;
    let updated = repo.tags().update(
        &tag.id,
        UpdateTag {
            name,
            color: clearable(color),
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated tag '{}'", updated.name);
    }
    Ok(())
}

pub(crate) fn cmd_tag_delete(repo: &Repository, key: &str, json: bool) -> Result<()> {
    let tag = find_tag(repo, key)?;
    repo.tags().delete(&tag.id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": tag.id }));
    } else {
        println!("Deleted tag '{}'", tag.name);
    }
    Ok(())
}

// --- Author ---

pub(crate) fn cmd_author_show(repo: &Repository, json: bool) -> Result<()> {
    let author = repo.author().get()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&author)?);
    } else if let Some(a) = author {
        println!("{} ({})", a.display_name, a.id);
        if let Some(ref email) = a.email {
            println!("  Email:  {email}");
        }
        if let Some(ref avatar) = a.avatar_uri {
            println!("  Avatar: {avatar}");
        }
        println!("  Sync:   {}", sync_marker(a.sync.dirty));
    } else {
        eprintln!("No profile yet. Use `haunts author set <name>` to create one.");
    }
    Ok(())
}

/// Create the profile on first use, update it afterwards.
pub(crate) fn cmd_author_set(
    repo: &Repository,
    display_name: Option<String>,
    email: Option<String>,
    avatar: Option<String>,
    json: bool,
) -> Result<()> {
    let author = if repo.author().get()?.is_some() {
        repo.author().update(UpdateAuthor {
            display_name,
            avatar_uri: clearable(avatar),
            email: clearable(email),
        })?
    } else {
        let Some(display_name) = display_name else {
            bail!("A display name is required to create the profile");
        };
        repo.author().create(NewAuthor {
            display_name,
            avatar_uri: avatar,
            email,
        })?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&author)?);
    } else {
        println!("Profile saved for {}", author.display_name);
    }
    Ok(())
}
