use crate::clock::Timestamp;
use crate::session::Session;
use crate::trial::Trial;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key carrying the human label of a listed product
pub const META_PRODUCT_NAME: &str = "product_name";
/// Metadata key carrying the form field a click landed on
pub const META_FIELD_NAME: &str = "field_name";
/// Metadata key carrying the page the click originated from
pub const META_PAGE: &str = "page";

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// What the caller reports for a single interaction
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawInteraction {
    pub target_id: String,
    pub is_correct: bool,
    pub position: Position,
    pub metadata: Option<Metadata>,
}

impl RawInteraction {
    pub fn new(target_id: impl Into<String>, is_correct: bool) -> Self {
        Self {
            target_id: target_id.into(),
            is_correct,
            ..Default::default()
        }
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }
}

/// One recorded click; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub trial: u32,
    pub index: usize,
    pub monotonic_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub accumulated_ms: f64,
    pub target_id: String,
    pub is_correct: bool,
    pub position: Position,
    pub reaction_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ClickEvent {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Build the click event for `raw` given the current session and trial.
///
/// `trial_number` is the policy's view of which trial the click belongs to.
pub fn record(
    session: &Session,
    trial: Option<&Trial>,
    trial_number: u32,
    raw: RawInteraction,
    now: Timestamp,
) -> ClickEvent {
    let accumulated_ms = session.origin().elapsed_ms(&now);
    let reaction_ms = trial.map_or(0.0, |t| t.reaction_elapsed(&now));

    ClickEvent {
        trial: trial_number,
        index: session.events().len() + 1,
        monotonic_ms: now.monotonic_ms,
        timestamp: now.wall,
        accumulated_ms,
        target_id: raw.target_id,
        is_correct: raw.is_correct,
        position: raw.position,
        reaction_ms,
        metadata: raw.metadata,
    }
}
