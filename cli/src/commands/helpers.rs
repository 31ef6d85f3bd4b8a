use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, SecondsFormat, TimeZone, Utc};

use haunts_core::StoreError;
use haunts_core::models::EntityKind;

/// Shortest id prefix accepted on the command line.
const MIN_PREFIX: usize = 4;

/// Resolve a user-supplied key to one record: an exact id, a unique
/// case-insensitive name, or a unique id prefix, in that order.
pub(crate) fn pick<'a, T>(
    items: &'a [T],
    key: &str,
    kind: EntityKind,
    id: impl Fn(&T) -> &str,
    name: impl Fn(&T) -> &str,
) -> Result<&'a T> {
    let key = key.trim();
    if let Some(item) = items.iter().find(|i| id(i) == key) {
        return Ok(item);
    }

    let lowered = key.to_lowercase();
    let by_name: Vec<&T> = items
        .iter()
        .filter(|i| name(i).to_lowercase() == lowered)
        .collect();
    match by_name.as_slice() {
        [one] => return Ok(*one),
        [] => {}
        many => bail!(
            "'{key}' matches {} {kind} records by name. Use the id instead",
            many.len()
        ),
    }

    if key.chars().count() >= MIN_PREFIX {
        let by_prefix: Vec<&T> = items.iter().filter(|i| id(i).starts_with(key)).collect();
        match by_prefix.as_slice() {
            [one] => return Ok(*one),
            [] => {}
            many => bail!("Id prefix '{key}' is ambiguous ({} matches)", many.len()),
        }
    }

    Err(StoreError::not_found(kind, key).into())
}

/// Accepts `now`, `today`, `yesterday`, `YYYY-MM-DD` (local midnight) or a
/// full RFC 3339 timestamp. Returns an RFC 3339 UTC timestamp.
pub(crate) fn parse_visited_at(input: &str) -> Result<String> {
    let input = input.trim();
    let today = Local::now().date_naive();
    let date = match input {
        "now" => return Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        "today" => today,
        "yesterday" => today - chrono::Duration::days(1),
        _ => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
                return Ok(ts
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Micros, true));
            }
            NaiveDate::parse_from_str(input, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{input}'. Use YYYY-MM-DD, an RFC 3339 timestamp, or now/today/yesterday")
            })?
        }
    };
    let midnight = date.and_hms_opt(0, 0, 0).context("Invalid date")?;
    let local = Local
        .from_local_datetime(&midnight)
        .earliest()
        .with_context(|| format!("Local midnight does not exist on {date}"))?;
    Ok(local
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// An empty string on the command line clears an optional field.
pub(crate) fn clearable(value: Option<String>) -> Option<Option<String>> {
    value.map(|v| if v.trim().is_empty() { None } else { Some(v) })
}

pub(crate) fn fmt_rating(rating: Option<f64>) -> String {
    rating.map_or_else(|| "-".to_string(), |r| format!("{r:.1}"))
}

/// A stored RFC 3339 timestamp in local time, to the minute.
pub(crate) fn fmt_timestamp(ts: &str) -> String {
    DateTime::parse_from_rfc3339(ts).map_or_else(
        |_| ts.to_string(),
        |t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
    )
}

pub(crate) fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

pub(crate) fn sync_marker(dirty: bool) -> &'static str {
    if dirty { "pending" } else { "synced" }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
