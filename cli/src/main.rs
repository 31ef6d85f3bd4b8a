mod commands;
mod config;
mod remote;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use haunts_core::models::{CategoryType, RatingMode};
use haunts_core::sync::SyncEngine;
use haunts_core::{Repository, StoreLocation};

use crate::commands::{
    DishArgs, ListArgs, PROBE_INTERVAL, PlaceArgs, TagAction, cmd_author_set, cmd_author_show,
    cmd_category_add, cmd_category_delete, cmd_category_edit, cmd_category_list,
    cmd_category_reorder, cmd_daemon, cmd_defaults, cmd_dish_add, cmd_dish_delete, cmd_dish_edit,
    cmd_dish_list, cmd_export, cmd_import, cmd_list_add, cmd_list_create, cmd_list_delete,
    cmd_list_edit, cmd_list_list, cmd_list_remove, cmd_list_reorder, cmd_list_show,
    cmd_place_add, cmd_place_delete, cmd_place_edit, cmd_place_list, cmd_place_show,
    cmd_place_tag, cmd_status, cmd_sync, cmd_tag_add, cmd_tag_delete, cmd_tag_edit, cmd_tag_list,
    cmd_visit_add, cmd_visit_delete, cmd_visit_edit, cmd_visit_list,
};
use crate::config::Config;
use crate::remote::HttpRemote;

#[derive(Parser)]
#[command(
    name = "haunts",
    version,
    about = "Track the places you go, the visits you make and the dishes you eat",
    long_about = "Track the places you go, the visits you make and the dishes you eat.\n\n\
        Everything is stored locally first and pushed to your haunts account with \
        `haunts sync` or `haunts daemon`. Records are referenced by id, id prefix \
        (4+ characters) or name."
)]
struct Cli {
    /// Log debug output to stderr (overridden by HAUNTS_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage places
    Place {
        #[command(subcommand)]
        command: PlaceCommands,
    },
    /// Manage curated lists of places
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
    /// Log and manage visits
    Visit {
        #[command(subcommand)]
        command: VisitCommands,
    },
    /// Rate the dishes eaten on a visit
    Dish {
        #[command(subcommand)]
        command: DishCommands,
    },
    /// Manage place and dish categories
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Manage tags
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Show or edit your profile
    Author {
        #[command(subcommand)]
        command: AuthorCommands,
    },
    /// Export the whole store as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Output the export summary as JSON (with --output)
        #[arg(long)]
        json: bool,
    },
    /// Replace the whole store with a JSON backup
    Import {
        /// Backup file produced by `haunts export`
        file: PathBuf,
        /// Validate the file without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Restore any deleted default place categories
    Defaults {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the store location, record counts and pending changes
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push pending changes to the remote once
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the foreground until Ctrl-C
    Daemon,
}

#[derive(clap::Args)]
struct PlaceFields {
    /// Street address (pass "" to clear)
    #[arg(long)]
    address: Option<String>,
    /// Category id or name (pass "" to clear)
    #[arg(long)]
    category: Option<String>,
    /// Free-form notes (pass "" to clear)
    #[arg(long)]
    notes: Option<String>,
    /// Manual overall rating, 0-5
    #[arg(long)]
    rating: Option<f64>,
    /// Rating shown for the place: aggregate (dish mean) or overall (manual)
    #[arg(long)]
    rating_mode: Option<RatingMode>,
    /// Cover image URI (pass "" to clear)
    #[arg(long)]
    cover: Option<String>,
}

#[derive(Subcommand)]
enum PlaceCommands {
    /// Add a place
    Add {
        /// Place name
        name: String,
        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        #[command(flatten)]
        fields: PlaceFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List places
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a place with its visits
    Show {
        /// Place id, id prefix or name
        place: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a place
    Edit {
        /// Place id, id prefix or name
        place: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        /// New latitude
        #[arg(long, allow_negative_numbers = true)]
        lat: Option<f64>,
        /// New longitude
        #[arg(long, allow_negative_numbers = true)]
        lon: Option<f64>,
        /// Remove the manual rating
        #[arg(long, conflicts_with = "rating")]
        clear_rating: bool,
        #[command(flatten)]
        fields: PlaceFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a place with its visits, dishes and list entries
    Delete {
        /// Place id, id prefix or name
        place: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Attach tags to a place
    Tag {
        /// Place id, id prefix or name
        place: String,
        /// Tag ids or names
        #[arg(required = true)]
        tags: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Detach tags from a place
    Untag {
        /// Place id, id prefix or name
        place: String,
        /// Tag ids or names
        #[arg(required = true)]
        tags: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace a place's tags (no tags clears them)
    SetTags {
        /// Place id, id prefix or name
        place: String,
        /// Tag ids or names
        tags: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct ListFields {
    /// Description (pass "" to clear)
    #[arg(long)]
    description: Option<String>,
    /// Free-form list category (pass "" to clear)
    #[arg(long)]
    category: Option<String>,
    /// City (pass "" to clear)
    #[arg(long)]
    city: Option<String>,
}

#[derive(Subcommand)]
enum ListCommands {
    /// Create a list
    Create {
        /// List name
        name: String,
        #[command(flatten)]
        fields: ListFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show all lists
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a list's places in order
    Show {
        /// List id, id prefix or name
        list: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a list
    Edit {
        /// List id, id prefix or name
        list: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        fields: ListFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a list (its places are kept)
    Delete {
        /// List id, id prefix or name
        list: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Append a place to a list
    Add {
        /// List id, id prefix or name
        list: String,
        /// Place id, id prefix or name
        place: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a place from a list
    Remove {
        /// List id, id prefix or name
        list: String,
        /// Place id, id prefix or name
        place: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Renumber a list's places in the given order
    Reorder {
        /// List id, id prefix or name
        list: String,
        /// Every place in the list, in the new order
        #[arg(required = true)]
        places: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum VisitCommands {
    /// Log a visit to a place
    Add {
        /// Place id, id prefix or name
        place: String,
        /// When (YYYY-MM-DD, RFC 3339, or now/today/yesterday; default: now)
        #[arg(long)]
        at: Option<String>,
        /// Notes
        #[arg(long)]
        notes: Option<String>,
        /// Photo URI
        #[arg(long)]
        photo: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List visits, newest first
    List {
        /// Only visits to this place
        #[arg(long)]
        place: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a visit
    Edit {
        /// Visit id or id prefix
        visit: String,
        /// When (YYYY-MM-DD, RFC 3339, or now/today/yesterday)
        #[arg(long)]
        at: Option<String>,
        /// Notes (pass "" to clear)
        #[arg(long)]
        notes: Option<String>,
        /// Photo URI (pass "" to clear)
        #[arg(long)]
        photo: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a visit and its dishes
    Delete {
        /// Visit id or id prefix
        visit: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct DishFields {
    /// Dish category id or name (pass "" to clear)
    #[arg(long)]
    category: Option<String>,
    /// Notes (pass "" to clear)
    #[arg(long)]
    notes: Option<String>,
    /// Photo URI (pass "" to clear)
    #[arg(long)]
    photo: Option<String>,
}

#[derive(Subcommand)]
enum DishCommands {
    /// Rate a dish eaten on a visit
    Add {
        /// Visit id or id prefix
        visit: String,
        /// Dish name
        name: String,
        /// Rating, 1-5
        rating: u8,
        #[command(flatten)]
        fields: DishFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List dishes
    List {
        /// Only dishes from this visit
        #[arg(long)]
        visit: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a dish
    Edit {
        /// Dish id, id prefix or name
        dish: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        /// New rating, 1-5
        #[arg(long)]
        rating: Option<u8>,
        #[command(flatten)]
        fields: DishFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a dish
    Delete {
        /// Dish id, id prefix or name
        dish: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CategoryCommands {
    /// Add a category
    Add {
        /// Category name
        name: String,
        /// place or dish
        #[arg(long = "type", default_value = "place")]
        category_type: CategoryType,
        /// Parent category id or name
        #[arg(long)]
        parent: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List categories in display order
    List {
        /// Only place or dish categories
        #[arg(long = "type")]
        category_type: Option<CategoryType>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a category
    Edit {
        /// Category id, id prefix or name
        category: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        /// Parent category id or name (pass "" to clear)
        #[arg(long)]
        parent: Option<String>,
        /// Explicit display position
        #[arg(long)]
        order: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a category
    Delete {
        /// Category id, id prefix or name
        category: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Renumber categories of one type in the given order
    Reorder {
        /// place or dish
        #[arg(long = "type", default_value = "place")]
        category_type: CategoryType,
        /// Category ids or names, in the new order
        #[arg(required = true)]
        categories: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TagCommands {
    /// Create a tag (names are unique, ignoring case)
    Add {
        /// Tag name
        name: String,
        /// Display color, e.g. "#ff8800"
        #[arg(long)]
        color: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List tags
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rename or recolor a tag
    Edit {
        /// Tag id, id prefix or name
        tag: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        /// New color (pass "" to clear)
        #[arg(long)]
        color: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a tag and detach it from every place
    Delete {
        /// Tag id, id prefix or name
        tag: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AuthorCommands {
    /// Show your profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create or update your profile
    Set {
        /// Display name (required the first time)
        name: Option<String>,
        /// Email (pass "" to clear)
        #[arg(long)]
        email: Option<String>,
        /// Avatar URI (pass "" to clear)
        #[arg(long)]
        avatar: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Log to stderr. `HAUNTS_LOG` takes an `EnvFilter` directive and wins over
/// `--verbose`.
fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("HAUNTS_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let repo = Repository::open(config.backend, &StoreLocation::Path(config.db_path.clone()))
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;

    match cli.command {
        Commands::Sync { json } => {
            let (engine, _) = sync_engine(repo, &config)?;
            cmd_sync(&engine, json).await
        }
        Commands::Daemon => {
            let (engine, remote) = sync_engine(repo, &config)?;
            cmd_daemon(Arc::new(engine), remote, PROBE_INTERVAL).await
        }
        command => {
            run_local(&repo, &config, command)?;
            repo.close()
        }
    }
}

fn sync_engine(repo: Repository, config: &Config) -> Result<(SyncEngine, Arc<HttpRemote>)> {
    let Some(url) = config.remote_url.as_deref() else {
        bail!("No remote configured. Set HAUNTS_REMOTE_URL or remote_url in config.toml");
    };
    let remote = Arc::new(HttpRemote::new(url, config.api_token.clone())?);
    let engine = SyncEngine::new(
        repo.into_shared(),
        remote.clone(),
        remote.clone(),
        remote.clone(),
    )
    .with_interval(config.sync_interval);
    Ok((engine, remote))
}

#[allow(clippy::too_many_lines)]
fn run_local(repo: &Repository, config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Place { command } => match command {
            PlaceCommands::Add {
                name,
                lat,
                lon,
                fields,
                json,
            } => cmd_place_add(repo, name, lat, lon, place_args(None, None, None, false, fields), json),
            PlaceCommands::List { json } => cmd_place_list(repo, json),
            PlaceCommands::Show { place, json } => cmd_place_show(repo, &place, json),
            PlaceCommands::Edit {
                place,
                name,
                lat,
                lon,
                clear_rating,
                fields,
                json,
            } => cmd_place_edit(
                repo,
                &place,
                place_args(name, lat, lon, clear_rating, fields),
                json,
            ),
            PlaceCommands::Delete { place, json } => cmd_place_delete(repo, &place, json),
            PlaceCommands::Tag { place, tags, json } => {
                cmd_place_tag(repo, &place, TagAction::Add(tags), json)
            }
            PlaceCommands::Untag { place, tags, json } => {
                cmd_place_tag(repo, &place, TagAction::Remove(tags), json)
            }
            PlaceCommands::SetTags { place, tags, json } => {
                cmd_place_tag(repo, &place, TagAction::Set(tags), json)
            }
        },
        Commands::List { command } => match command {
            ListCommands::Create { name, fields, json } => {
                cmd_list_create(repo, name, list_args(fields), json)
            }
            ListCommands::List { json } => cmd_list_list(repo, json),
            ListCommands::Show { list, json } => cmd_list_show(repo, &list, json),
            ListCommands::Edit {
                list,
                name,
                fields,
                json,
            } => cmd_list_edit(repo, &list, name, list_args(fields), json),
            ListCommands::Delete { list, json } => cmd_list_delete(repo, &list, json),
            ListCommands::Add { list, place, json } => cmd_list_add(repo, &list, &place, json),
            ListCommands::Remove { list, place, json } => {
                cmd_list_remove(repo, &list, &place, json)
            }
            ListCommands::Reorder { list, places, json } => {
                cmd_list_reorder(repo, &list, &places, json)
            }
        },
        Commands::Visit { command } => match command {
            VisitCommands::Add {
                place,
                at,
                notes,
                photo,
                json,
            } => cmd_visit_add(repo, &place, at.as_deref(), notes, photo, json),
            VisitCommands::List { place, json } => cmd_visit_list(repo, place.as_deref(), json),
            VisitCommands::Edit {
                visit,
                at,
                notes,
                photo,
                json,
            } => cmd_visit_edit(repo, &visit, at.as_deref(), notes, photo, json),
            VisitCommands::Delete { visit, json } => cmd_visit_delete(repo, &visit, json),
        },
        Commands::Dish { command } => match command {
            DishCommands::Add {
                visit,
                name,
                rating,
                fields,
                json,
            } => cmd_dish_add(repo, &visit, name, rating, dish_args(None, None, fields), json),
            DishCommands::List { visit, json } => cmd_dish_list(repo, visit.as_deref(), json),
            DishCommands::Edit {
                dish,
                name,
                rating,
                fields,
                json,
            } => cmd_dish_edit(repo, &dish, dish_args(name, rating, fields), json),
            DishCommands::Delete { dish, json } => cmd_dish_delete(repo, &dish, json),
        },
        Commands::Category { command } => match command {
            CategoryCommands::Add {
                name,
                category_type,
                parent,
                json,
            } => cmd_category_add(repo, name, category_type, parent.as_deref(), json),
            CategoryCommands::List {
                category_type,
                json,
            } => cmd_category_list(repo, category_type, json),
            CategoryCommands::Edit {
                category,
                name,
                parent,
                order,
                json,
            } => cmd_category_edit(repo, &category, name, parent, order, json),
            CategoryCommands::Delete { category, json } => {
                cmd_category_delete(repo, &category, json)
            }
            CategoryCommands::Reorder {
                category_type,
                categories,
                json,
            } => cmd_category_reorder(repo, category_type, &categories, json),
        },
        Commands::Tag { command } => match command {
            TagCommands::Add { name, color, json } => cmd_tag_add(repo, name, color, json),
            TagCommands::List { json } => cmd_tag_list(repo, json),
            TagCommands::Edit {
                tag,
                name,
                color,
                json,
            } => cmd_tag_edit(repo, &tag, name, color, json),
            TagCommands::Delete { tag, json } => cmd_tag_delete(repo, &tag, json),
        },
        Commands::Author { command } => match command {
            AuthorCommands::Show { json } => cmd_author_show(repo, json),
            AuthorCommands::Set {
                name,
                email,
                avatar,
                json,
            } => cmd_author_set(repo, name, email, avatar, json),
        },
        Commands::Export { output, json } => cmd_export(repo, output.as_deref(), json),
        Commands::Import {
            file,
            dry_run,
            json,
        } => cmd_import(repo, &file, dry_run, json),
        Commands::Defaults { json } => cmd_defaults(repo, json),
        Commands::Status { json } => cmd_status(repo, config, json),
        Commands::Sync { .. } | Commands::Daemon => {
            bail!("sync commands need the remote and are not local")
        }
    }
}

fn place_args(
    name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    clear_rating: bool,
    fields: PlaceFields,
) -> PlaceArgs {
    PlaceArgs {
        name,
        address: fields.address,
        latitude,
        longitude,
        category: fields.category,
        notes: fields.notes,
        rating: fields.rating,
        clear_rating,
        rating_mode: fields.rating_mode,
        cover: fields.cover,
    }
}

fn list_args(fields: ListFields) -> ListArgs {
    ListArgs {
        description: fields.description,
        category: fields.category,
        city: fields.city,
    }
}

fn dish_args(name: Option<String>, rating: Option<u8>, fields: DishFields) -> DishArgs {
    DishArgs {
        name,
        rating,
        category: fields.category,
        notes: fields.notes,
        photo: fields.photo,
    }
}
