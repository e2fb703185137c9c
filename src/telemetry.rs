//! Optional telemetry mirror.
//!
//! A sink receives a copy of every session, trial and click row. It is
//! resolved lazily and at most once. Rows mirrored before it resolves are
//! queued and written, in order, once it does; if resolving fails they are
//! dropped. Nothing here blocks or fails a recording.

use crate::error::SinkError;
use crate::event::{ClickEvent, META_FIELD_NAME, META_PAGE, META_PRODUCT_NAME};
use crate::export::CorrectnessLabels;
use crate::trial::{Trial, TrialTargets};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

/// A flat key/value record as written to a sink
pub type Row = Map<String, Value>;

pub const ROW_TYPE: &str = "row_type";
pub const ROW_TYPE_SESSION: &str = "session";
pub const ROW_TYPE_TRIAL: &str = "trial";
pub const ROW_TYPE_CLICK: &str = "click";
/// Key tying a row to the engine session that produced it
pub const APP_SESSION_ID: &str = "app_session_id";

/// External data-collection backend
pub trait Sink: Send + Sync {
    /// Properties attached to every subsequent row
    fn record_properties(&self, props: &Row) -> Result<(), SinkError>;

    fn write_row(&self, row: &Row) -> Result<(), SinkError>;

    /// Everything written so far, in write order
    fn rows(&self) -> Result<Vec<Row>, SinkError> {
        Ok(Vec::new())
    }
}

pub type SinkFactory = Box<dyn FnOnce() -> Result<Box<dyn Sink>, SinkError> + Send>;

/// Rows held back while the sink is still loading
const MAX_PENDING: usize = 4096;

#[derive(Debug, Clone)]
enum Pending {
    Properties(Row),
    Row(Row),
}

fn deliver(sink: &dyn Sink, item: &Pending) {
    let result = match item {
        Pending::Properties(props) => sink.record_properties(props),
        Pending::Row(row) => sink.write_row(row),
    };
    if let Err(e) = result {
        log::debug!("telemetry write dropped: {}", e);
    }
}

/// Memoized, load-once handle to an optional sink
#[derive(Clone)]
pub struct LazySink {
    resolved: Arc<OnceLock<Option<Arc<dyn Sink>>>>,
    factory: Arc<Mutex<Option<SinkFactory>>>,
    pending: Arc<Mutex<Vec<Pending>>>,
}

impl std::fmt::Debug for LazySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySink")
            .field("resolved", &self.resolved.get().map(Option::is_some))
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl LazySink {
    /// No sink at all; every mirror call is a no-op
    pub fn none() -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(None);
        Self {
            resolved: Arc::new(resolved),
            factory: Arc::new(Mutex::new(None)),
            pending: Arc::default(),
        }
    }

    pub fn from_factory<F>(factory: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Sink>, SinkError> + Send + 'static,
    {
        Self {
            resolved: Arc::new(OnceLock::new()),
            factory: Arc::new(Mutex::new(Some(Box::new(factory)))),
            pending: Arc::default(),
        }
    }

    /// Wrap an already constructed sink
    pub fn ready(sink: impl Sink + 'static) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(Some(Arc::new(sink) as Arc<dyn Sink>));
        Self {
            resolved: Arc::new(resolved),
            factory: Arc::new(Mutex::new(None)),
            pending: Arc::default(),
        }
    }

    /// Resolve the sink, blocking. Concurrent callers share one attempt.
    pub fn load(&self) -> Option<Arc<dyn Sink>> {
        let sink = self
            .resolved
            .get_or_init(|| {
                let factory = self.factory.lock().take();
                match factory.map(|f| f()) {
                    Some(Ok(sink)) => {
                        log::debug!("telemetry sink loaded");
                        Some(Arc::from(sink))
                    }
                    Some(Err(e)) => {
                        log::warn!("telemetry sink could not be loaded, continuing without it: {}", e);
                        None
                    }
                    None => None,
                }
            })
            .clone();
        self.dispatch(None);
        sink
    }

    /// Start resolving on a background thread unless already resolved
    pub fn load_in_background(&self) -> Option<JoinHandle<()>> {
        if self.is_resolved() {
            return None;
        }
        let this = self.clone();
        Some(std::thread::spawn(move || {
            this.load();
        }))
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// The sink if it has finished loading; never waits
    pub fn get(&self) -> Option<Arc<dyn Sink>> {
        self.resolved.get().and_then(Clone::clone)
    }

    /// Flush queued rows if the sink has resolved, then handle `item`.
    /// Holding the queue lock across writes keeps rows in mirror order.
    fn dispatch(&self, item: Option<Pending>) {
        let mut pending = self.pending.lock();
        match self.resolved.get() {
            None => {
                if let Some(item) = item {
                    if pending.len() < MAX_PENDING {
                        pending.push(item);
                    } else {
                        log::debug!("telemetry queue full, row not mirrored");
                    }
                }
            }
            Some(None) => pending.clear(),
            Some(Some(sink)) => {
                for queued in pending.drain(..) {
                    deliver(sink.as_ref(), &queued);
                }
                if let Some(item) = item {
                    deliver(sink.as_ref(), &item);
                }
            }
        }
    }

    /// Best-effort write; queued until the sink resolves, never waits
    pub fn mirror(&self, row: &Row) {
        self.dispatch(Some(Pending::Row(row.clone())));
    }

    pub fn mirror_properties(&self, props: &Row) {
        self.dispatch(Some(Pending::Properties(props.clone())));
    }

    /// Rows waiting for the sink to resolve
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Rows held by the sink, if one is loaded and can report them
    pub fn rows(&self) -> Option<Vec<Row>> {
        let sink = self.get()?;
        match sink.rows() {
            Ok(rows) => Some(rows),
            Err(e) => {
                log::debug!("telemetry rows unavailable: {}", e);
                None
            }
        }
    }
}

impl Default for LazySink {
    fn default() -> Self {
        Self::none()
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn session_properties(session_id: &str, started_at: DateTime<Utc>) -> Row {
    let mut row = Row::new();
    row.insert(
        "session_id".into(),
        Value::from(format!("session_{}", started_at.timestamp_millis())),
    );
    row.insert(APP_SESSION_ID.into(), Value::from(session_id));
    row.insert("start_epoch_ms".into(), Value::from(started_at.timestamp_millis()));
    row
}

pub fn session_start_row(started_at: DateTime<Utc>) -> Row {
    let mut row = Row::new();
    row.insert(ROW_TYPE.into(), Value::from(ROW_TYPE_SESSION));
    row.insert("event".into(), Value::from("session_start"));
    row.insert("timestamp_iso".into(), Value::from(iso(started_at)));
    row
}

pub fn trial_start_row(trial_number: u32, trial: &Trial) -> Row {
    let target = match &trial.targets {
        TrialTargets::Single(t) => t.clone(),
        TrialTargets::Remaining(ts) => ts.join(";"),
    };
    let mut row = Row::new();
    row.insert(ROW_TYPE.into(), Value::from(ROW_TYPE_TRIAL));
    row.insert("event".into(), Value::from("trial_start"));
    row.insert("trial".into(), Value::from(trial_number));
    row.insert("target_id".into(), Value::from(target));
    row.insert("item_count".into(), Value::from(trial.item_count));
    if let Some(started_at) = trial.started_at {
        row.insert("timestamp_iso".into(), Value::from(iso(started_at)));
    }
    row
}

pub fn trial_success_row(target_id: &str, at: DateTime<Utc>) -> Row {
    let mut row = Row::new();
    row.insert(ROW_TYPE.into(), Value::from(ROW_TYPE_TRIAL));
    row.insert("event".into(), Value::from("trial_success"));
    row.insert("target_id".into(), Value::from(target_id));
    row.insert("timestamp_iso".into(), Value::from(iso(at)));
    row
}

/// Click row with export-ready values (times already rounded)
pub fn click_row(session_id: &str, event: &ClickEvent, labels: &CorrectnessLabels) -> Row {
    let text = |key: &str| Value::from(event.meta(key).unwrap_or_default());
    let mut row = Row::new();
    row.insert(ROW_TYPE.into(), Value::from(ROW_TYPE_CLICK));
    row.insert(APP_SESSION_ID.into(), Value::from(session_id));
    row.insert("trial".into(), Value::from(event.trial));
    row.insert("target_id".into(), Value::from(event.target_id.as_str()));
    row.insert("product_name".into(), text(META_PRODUCT_NAME));
    row.insert("field_name".into(), text(META_FIELD_NAME));
    row.insert("click_index".into(), Value::from(event.index));
    row.insert("reaction_time_ms".into(), Value::from(event.reaction_ms.round() as i64));
    row.insert("correct".into(), Value::from(labels.label(event.is_correct)));
    row.insert("accumulated_time_ms".into(), Value::from(event.accumulated_ms.round() as i64));
    row.insert("timestamp_iso".into(), Value::from(event.timestamp_iso()));
    row.insert("position_x".into(), Value::from(event.position.x));
    row.insert("position_y".into(), Value::from(event.position.y));
    row.insert("page".into(), text(META_PAGE));
    row
}

fn with_properties(props: &Row, row: &Row) -> Row {
    let mut merged = props.clone();
    for (k, v) in row {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[derive(Debug, Default)]
struct MemoryLog {
    properties: Row,
    rows: Vec<Row>,
}

/// In-process sink; clones share the same log
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn properties(&self) -> Row {
        self.log.lock().properties.clone()
    }
}

impl Sink for MemorySink {
    fn record_properties(&self, props: &Row) -> Result<(), SinkError> {
        let mut log = self.log.lock();
        for (k, v) in props {
            log.properties.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn write_row(&self, row: &Row) -> Result<(), SinkError> {
        let mut log = self.log.lock();
        let merged = with_properties(&log.properties, row);
        log.rows.push(merged);
        Ok(())
    }

    fn rows(&self) -> Result<Vec<Row>, SinkError> {
        Ok(self.log.lock().rows.clone())
    }
}

/// Sink persisting rows into a SQLite table as JSON payloads
#[derive(Debug)]
pub struct SqliteSink {
    conn: Mutex<Connection>,
    properties: Mutex<Row>,
}

impl SqliteSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::Unavailable(e.to_string()))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SinkError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SinkError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                row_type TEXT,
                payload TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_telemetry_rows_type ON telemetry_rows(row_type)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            properties: Mutex::new(Row::new()),
        })
    }
}

impl Sink for SqliteSink {
    fn record_properties(&self, props: &Row) -> Result<(), SinkError> {
        let mut properties = self.properties.lock();
        for (k, v) in props {
            properties.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn write_row(&self, row: &Row) -> Result<(), SinkError> {
        let merged = with_properties(&self.properties.lock(), row);
        let row_type = merged.get(ROW_TYPE).and_then(Value::as_str).map(str::to_string);
        let payload = serde_json::to_string(&merged)?;
        self.conn.lock().execute(
            "INSERT INTO telemetry_rows (row_type, payload) VALUES (?1, ?2)",
            params![row_type, payload],
        )?;
        Ok(())
    }

    fn rows(&self) -> Result<Vec<Row>, SinkError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload FROM telemetry_rows ORDER BY id")?;
        let payloads = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut rows = Vec::new();
        for payload in payloads {
            rows.push(serde_json::from_str::<Row>(&payload?)?);
        }
        Ok(rows)
    }
}
