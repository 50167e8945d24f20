//! Core domain model and candidate validation for the event refresher.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "evr-core";

/// Fields a candidate must carry before it can become an [`Event`].
pub const REQUIRED_FIELDS: [&str; 6] = [
    "name",
    "location",
    "start_date",
    "end_date",
    "category",
    "description",
];

/// Event category. Anything outside the fixed enumeration is kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Culture,
    Seasonal,
    Music,
    Arts,
    Iconic,
    Nature,
    Sports,
    Unknown(String),
}

impl Category {
    pub const KNOWN: [Category; 7] = [
        Category::Culture,
        Category::Seasonal,
        Category::Music,
        Category::Arts,
        Category::Iconic,
        Category::Nature,
        Category::Sports,
    ];

    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        Self::KNOWN
            .iter()
            .find(|known| known.as_str().eq_ignore_ascii_case(trimmed))
            .cloned()
            .unwrap_or_else(|| Category::Unknown(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Category::Culture => "Culture",
            Category::Seasonal => "Seasonal",
            Category::Music => "Music",
            Category::Arts => "Arts",
            Category::Iconic => "Iconic",
            Category::Nature => "Nature",
            Category::Sports => "Sports",
            Category::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Category::Unknown(_))
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        Category::parse(&value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untrusted candidate exactly as it came out of the generated batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub JsonValue);

impl RawEvent {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_object(&self) -> Option<&Map<String, JsonValue>> {
        self.0.as_object()
    }

    /// Non-blank string value of `field`, if present.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Short label for log lines; falls back to the compact JSON.
    pub fn label(&self) -> String {
        self.text("name")
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl From<JsonValue> for RawEvent {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

/// Candidate that passed schema and date checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub name: String,
    pub location: String,
    pub start_date: String,
    pub end_date: String,
    pub category: Category,
    pub description: String,
    pub image_url: Option<String>,
}

impl Event {
    pub fn key(&self) -> EventKey {
        EventKey {
            name: self.name.clone(),
            start_date: self.start_date.clone(),
        }
    }
}

/// Natural key of a stored event, as projected by the snapshot query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub name: String,
    pub start_date: String,
}

impl EventKey {
    pub fn new(name: impl Into<String>, start_date: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_date: start_date.into(),
        }
    }
}

/// Enriched event as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub name: String,
    pub location: String,
    pub start_date: String,
    pub end_date: String,
    pub category: Category,
    pub description: String,
    pub image_url: String,
}

impl EventRecord {
    pub fn from_event(event: Event, id: Uuid, image_url: String) -> Self {
        Self {
            id,
            name: event.name,
            location: event.location,
            start_date: event.start_date,
            end_date: event.end_date,
            category: event.category,
            description: event.description,
            image_url,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.name.clone(), self.start_date.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("candidate is not a JSON object")]
    NotAnObject,
    #[error("incomplete event, missing {}", .missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },
    #[error("invalid date in {field}: {value:?}")]
    InvalidDate { field: &'static str, value: String },
}

impl RejectReason {
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::NotAnObject => "not_an_object",
            RejectReason::Incomplete { .. } => "incomplete",
            RejectReason::InvalidDate { .. } => "invalid_date",
        }
    }
}

/// Convert a raw candidate into a typed [`Event`].
///
/// Dates are only checked for parseability; the original strings are kept.
/// Unrecognized categories pass through as [`Category::Unknown`].
pub fn validate(raw: &RawEvent) -> Result<Event, RejectReason> {
    if raw.as_object().is_none() {
        return Err(RejectReason::NotAnObject);
    }

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| raw.text(field).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(RejectReason::Incomplete { missing });
    }

    let text = |field: &str| raw.text(field).unwrap_or_default().to_string();

    for field in ["start_date", "end_date"] {
        let value = text(field);
        if parse_event_date(&value).is_none() {
            return Err(RejectReason::InvalidDate { field, value });
        }
    }

    Ok(Event {
        name: text("name"),
        location: text("location"),
        start_date: text("start_date"),
        end_date: text("end_date"),
        category: Category::parse(&text("category")),
        description: text("description"),
        image_url: raw.text("image_url").map(ToOwned::to_owned),
    })
}

const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: [&str; 16] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y%m%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%m-%d-%Y",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %B, %Y",
    "%A, %B %d, %Y",
    "%A %d %B %Y",
    "%Y %B %d",
];

/// Parse a calendar date from the textual forms a language model tends to emit.
///
/// Accepts RFC 3339 / RFC 2822 timestamps, ISO dates and date-times, numeric
/// day-first and month-first dates, and named months (full or abbreviated,
/// ordinal suffixes allowed). `"July 2026"` resolves to the first of the month.
pub fn parse_event_date(input: &str) -> Option<NaiveDate> {
    let s = normalize_date_text(input);
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(&s) {
        return Some(dt.date_naive());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(ndt.date());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(nd) = NaiveDate::parse_from_str(&s, fmt) {
            return Some(nd);
        }
    }

    NaiveDate::parse_from_str(&format!("1 {s}"), "%d %B %Y").ok()
}

/// Whether two start-date strings denote the same day. Falls back to string
/// equality when either side does not parse.
pub fn same_calendar_day(a: &str, b: &str) -> bool {
    match (parse_event_date(a), parse_event_date(b)) {
        (Some(da), Some(db)) => da == db,
        _ => a.trim() == b.trim(),
    }
}

fn normalize_date_text(input: &str) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_ordinal_suffixes(&collapsed)
}

// "1st", "22nd", "3rd", "14th" -> digits only
fn strip_ordinal_suffixes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        out.push(chars[i]);
        if chars[i].is_ascii_digit() && i + 2 < chars.len() {
            let suffix = chars[i + 1..i + 3]
                .iter()
                .collect::<String>()
                .to_ascii_lowercase();
            let boundary = chars.get(i + 3).map_or(true, |c| !c.is_alphabetic());
            if matches!(suffix.as_str(), "st" | "nd" | "rd" | "th") && boundary {
                i += 3;
                continue;
            }
        }
        i += 1;
    }
    out
}
