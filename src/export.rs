//! CSV export of the recorded clicks.
//!
//! Column order is fixed; downstream analysis scripts index by position.
//! `attempt` repeats the trial number and is kept for older sheets.

use crate::error::ExportError;
use crate::event::{ClickEvent, META_FIELD_NAME, META_PRODUCT_NAME};
use crate::telemetry::{Row, APP_SESSION_ID, ROW_TYPE, ROW_TYPE_CLICK};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const HEADER: [&str; 12] = [
    "trial",
    "target_id",
    "product_name",
    "field_name",
    "click_index",
    "reaction_time_ms",
    "correct",
    "accumulated_time_ms",
    "attempt",
    "timestamp_iso",
    "position_x",
    "position_y",
];

/// What exporting an empty log produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EmptyExport {
    /// A file with just the header row
    HeaderOnly,
    /// No file; the caller gets [`ExportError::NothingToExport`]
    Refuse,
}

/// How the `correct` column spells yes and no
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectnessLabels {
    pub yes: String,
    pub no: String,
}

impl CorrectnessLabels {
    pub fn portuguese() -> Self {
        Self {
            yes: "SIM".into(),
            no: "NÃO".into(),
        }
    }

    pub fn label(&self, is_correct: bool) -> &str {
        if is_correct {
            &self.yes
        } else {
            &self.no
        }
    }
}

impl Default for CorrectnessLabels {
    fn default() -> Self {
        Self {
            yes: "YES".into(),
            no: "NO".into(),
        }
    }
}

/// A rendered export, ready to be handed out as a file
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub file_name: String,
    pub contents: String,
    pub rows: usize,
}

impl ExportArtifact {
    /// Write the artifact into `dir`, creating it if needed
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        fs::write(&path, self.contents.as_bytes())?;
        Ok(path)
    }
}

pub fn file_name(engine_name: &str, session_id: &str) -> String {
    format!("{}_{}.csv", engine_name, session_id)
}

fn round_ms(ms: f64) -> String {
    format!("{}", ms.round() as i64)
}

fn event_record(event: &ClickEvent, labels: &CorrectnessLabels) -> [String; 12] {
    [
        event.trial.to_string(),
        event.target_id.clone(),
        event.meta(META_PRODUCT_NAME).unwrap_or_default().to_string(),
        event.meta(META_FIELD_NAME).unwrap_or_default().to_string(),
        event.index.to_string(),
        round_ms(event.reaction_ms),
        labels.label(event.is_correct).to_string(),
        round_ms(event.accumulated_ms),
        event.trial.to_string(),
        event.timestamp_iso(),
        event.position.x.to_string(),
        event.position.y.to_string(),
    ]
}

fn cell(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => f.to_string(),
            _ => n.to_string(),
        },
        Some(other) => other.to_string(),
    }
}

fn sink_record(row: &Row) -> [String; 12] {
    [
        cell(row, "trial"),
        cell(row, "target_id"),
        cell(row, "product_name"),
        cell(row, "field_name"),
        cell(row, "click_index"),
        cell(row, "reaction_time_ms"),
        cell(row, "correct"),
        cell(row, "accumulated_time_ms"),
        cell(row, "trial"),
        cell(row, "timestamp_iso"),
        cell(row, "position_x"),
        cell(row, "position_y"),
    ]
}

fn render<I>(records: I) -> Result<(String, usize), ExportError>
where
    I: IntoIterator<Item = [String; 12]>,
{
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(HEADER)?;
    let mut rows = 0;
    for record in records {
        writer.write_record(&record)?;
        rows += 1;
    }
    let bytes = writer.into_inner()?;
    let mut contents = String::from_utf8_lossy(&bytes).into_owned();
    if contents.ends_with('\n') {
        contents.pop();
    }
    Ok((contents, rows))
}

fn is_session_click(row: &Row, session_id: &str) -> bool {
    row.get(ROW_TYPE).and_then(Value::as_str) == Some(ROW_TYPE_CLICK)
        && row.get(APP_SESSION_ID).and_then(Value::as_str) == Some(session_id)
}

/// Render the session's clicks, or the sink's click rows for this session
/// when the sink holds every one of them
pub fn export(
    engine_name: &str,
    session_id: &str,
    events: &[ClickEvent],
    sink_rows: Option<&[Row]>,
    labels: &CorrectnessLabels,
    on_empty: EmptyExport,
) -> Result<ExportArtifact, ExportError> {
    let sink_clicks: Vec<&Row> = sink_rows
        .unwrap_or_default()
        .iter()
        .filter(|r| is_session_click(r, session_id))
        .collect();

    let sink_complete = !sink_clicks.is_empty() && sink_clicks.len() == events.len();
    if !sink_clicks.is_empty() && !sink_complete {
        log::debug!(
            "sink holds {} of {} clicks, exporting the session log instead",
            sink_clicks.len(),
            events.len()
        );
    }

    let (contents, rows) = if sink_complete {
        render(sink_clicks.into_iter().map(sink_record))?
    } else {
        render(events.iter().map(|e| event_record(e, labels)))?
    };

    if rows == 0 && on_empty == EmptyExport::Refuse {
        return Err(ExportError::NothingToExport);
    }

    Ok(ExportArtifact {
        file_name: file_name(engine_name, session_id),
        contents,
        rows,
    })
}
