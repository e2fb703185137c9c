// Library surface: the recording engine and its parts. The binary in
// main.rs is a thin caller on top of this.
pub mod app_dirs;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod persistence;
pub mod session;
pub mod stats;
pub mod telemetry;
pub mod trial;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, ExperimentEngine};
pub use error::{ExportError, SinkError, StoreError};
pub use event::{ClickEvent, Metadata, Position, RawInteraction};
pub use export::{CorrectnessLabels, EmptyExport, ExportArtifact};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
pub use stats::StatsSnapshot;
pub use telemetry::{LazySink, MemorySink, Sink, SqliteSink};
pub use trial::{Trial, TrialMode, TrialTargets};
