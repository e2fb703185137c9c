//! The experiment engine: one instrumented session and its live trial.
//!
//! Every caller-facing operation is synchronous and infallible except
//! export. State changes are written through to the snapshot store when
//! persistence is enabled; telemetry is mirrored on a best-effort basis and
//! never waited for.

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::EngineConfig;
use crate::error::ExportError;
use crate::event::{self, ClickEvent, Metadata, Position, RawInteraction};
use crate::export::{self, EmptyExport, ExportArtifact};
use crate::persistence::{MemorySnapshotStore, PersistenceAdapter, SnapshotStore};
use crate::session::Session;
use crate::stats::{self, StatsSnapshot};
use crate::telemetry::{self, LazySink};
use crate::trial::{MatchOutcome, Trial, TrialMode, TrialPolicy, TrialTargets};
use std::path::{Path, PathBuf};

pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Box<dyn Clock>>,
    store: Option<Box<dyn SnapshotStore>>,
    sink: LazySink,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Durable slot used when `persist` is enabled
    pub fn snapshot_store(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn sink(mut self, sink: LazySink) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> ExperimentEngine {
        let EngineBuilder {
            config,
            clock,
            store,
            sink,
        } = self;
        let clock = clock.unwrap_or_else(|| Box::new(SystemClock::new()));
        let policy = config.mode.policy();

        let persistence = if config.persist {
            let store = store.unwrap_or_else(|| {
                log::debug!("persistence enabled without a store, keeping snapshots in memory");
                Box::new(MemorySnapshotStore::new())
            });
            Some(PersistenceAdapter::new(store, config.persist_key.clone()))
        } else {
            None
        };

        sink.load_in_background();

        let session = Session::new(policy.session_prefix(), &clock.now());
        let mut engine = ExperimentEngine {
            config,
            policy,
            clock,
            session,
            current_trial: None,
            is_active: false,
            persistence,
            sink,
        };

        if let Some(snapshot) = engine.persistence.as_ref().and_then(PersistenceAdapter::restore) {
            log::info!(
                "restored session {} ({} clicks, trial {})",
                snapshot.session.id,
                snapshot.session.events().len(),
                snapshot.session.trial_count
            );
            if let Some(mode) = snapshot.mode.filter(|m| *m != engine.config.mode) {
                log::warn!(
                    "session {} was recorded in {} mode, restoring it in that mode instead of {}",
                    snapshot.session.id,
                    mode,
                    engine.config.mode
                );
                engine.config.mode = mode;
                engine.policy = mode.policy();
            }
            engine.session = snapshot.session;
            engine.current_trial = snapshot.current_trial;
            engine.is_active = engine.session.is_started();
        }

        if engine.config.auto_start {
            engine.start_session();
        }
        engine
    }
}

#[derive(Debug)]
pub struct ExperimentEngine {
    config: EngineConfig,
    policy: Box<dyn TrialPolicy>,
    clock: Box<dyn Clock>,
    session: Session,
    current_trial: Option<Trial>,
    is_active: bool,
    persistence: Option<PersistenceAdapter>,
    sink: LazySink,
}

impl ExperimentEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            store: None,
            sink: LazySink::none(),
        }
    }

    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.save(self.policy.mode(), &self.session, self.current_trial.as_ref());
        }
    }

    /// Start the session at `now` unless it already runs; every start,
    /// explicit or implied by a click, goes through here
    fn begin_session(&mut self, now: Timestamp) -> bool {
        self.is_active = true;
        if !self.session.start(now) {
            return false;
        }
        self.sink
            .mirror_properties(&telemetry::session_properties(&self.session.id, now.wall));
        self.sink.mirror(&telemetry::session_start_row(now.wall));
        true
    }

    /// Start the session clock. Returns false if it was already running.
    pub fn start_session(&mut self) -> bool {
        let now = self.clock.now();
        if !self.begin_session(now) {
            return false;
        }
        log::info!("session {} started", self.session.id);
        self.persist();
        true
    }

    /// Begin a new trial, replacing any live one; returns the trial id
    pub fn start_trial(&mut self, targets: impl Into<TrialTargets>, item_count: usize) -> String {
        if !self.session.is_started() {
            log::debug!("trial started before the session, starting session now");
            self.start_session();
        }

        let now = self.clock.now();
        let trial = Trial::start(targets.into(), item_count, &now);
        let number = self.policy.begin_trial(&mut self.session);
        self.sink.mirror(&telemetry::trial_start_row(number, &trial));
        log::debug!("trial {} ({}) started with {} items", number, trial.id, item_count);

        let id = trial.id.clone();
        if let Some(previous) = self.current_trial.replace(trial) {
            log::debug!("trial {} superseded", previous.id);
        }
        self.persist();
        id
    }

    pub fn register_interaction(
        &mut self,
        target_id: impl Into<String>,
        is_correct: bool,
        position: Position,
        metadata: Option<Metadata>,
    ) -> ClickEvent {
        self.register(RawInteraction {
            target_id: target_id.into(),
            is_correct,
            position,
            metadata,
        })
    }

    /// Record one interaction and advance the trial if it completes it
    pub fn register(&mut self, raw: RawInteraction) -> ClickEvent {
        let now = self.clock.now();

        if self.begin_session(now) {
            log::debug!("interaction before session start, session {} started implicitly", self.session.id);
        }
        if self.current_trial.is_none() {
            self.current_trial = self.policy.implicit_trial(&mut self.session, &now);
        }

        let trial_number = self.policy.event_trial_number(&self.session);
        let event = event::record(
            &self.session,
            self.current_trial.as_ref(),
            trial_number,
            raw,
            now,
        );
        self.sink.mirror(&telemetry::click_row(
            &self.session.id,
            &event,
            &self.config.labels,
        ));
        self.session.append_event(event.clone());

        if event.is_correct {
            if let Some(trial) = self.current_trial.as_mut() {
                match self
                    .policy
                    .on_correct_match(&mut self.session, trial, &event.target_id, &now)
                {
                    MatchOutcome::Completed => {
                        self.sink
                            .mirror(&telemetry::trial_success_row(&event.target_id, now.wall));
                        log::debug!("trial {} completed", trial.id);
                        self.current_trial = None;
                    }
                    MatchOutcome::Advanced { next } => {
                        self.sink
                            .mirror(&telemetry::trial_success_row(&event.target_id, now.wall));
                        log::debug!("sweep advanced to trial {}", next);
                    }
                    MatchOutcome::NoMatch => {}
                }
            }
        }

        self.persist();
        event
    }

    pub fn stats(&self) -> StatsSnapshot {
        stats::summarize(&self.session, self.policy.as_ref(), &self.clock.now())
    }

    fn empty_export(&self) -> EmptyExport {
        self.config
            .empty_export
            .unwrap_or_else(|| self.policy.default_empty_export())
    }

    pub fn export_records(&self) -> Result<ExportArtifact, ExportError> {
        let sink_rows = self.sink.rows();
        let result = export::export(
            &self.config.engine_name,
            &self.session.id,
            self.session.events(),
            sink_rows.as_deref(),
            &self.config.labels,
            self.empty_export(),
        );
        match &result {
            Ok(artifact) => log::info!("exported {} rows as {}", artifact.rows, artifact.file_name),
            Err(ExportError::NothingToExport) => log::info!("no clicks recorded, nothing to export"),
            Err(e) => log::warn!("export failed: {}", e),
        }
        result
    }

    /// Export and write the file into `dir`
    pub fn export_to(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        self.export_records()?.write_to(dir)
    }

    /// Drop the persisted snapshot and begin a fresh session
    pub fn reset(&mut self) {
        if let Some(persistence) = &self.persistence {
            persistence.clear();
        }
        self.session = Session::new(self.policy.session_prefix(), &self.clock.now());
        self.current_trial = None;
        self.is_active = false;
        log::info!("engine reset, new session {}", self.session.id);

        if self.config.auto_start {
            self.start_session();
        } else {
            self.persist();
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn current_trial(&self) -> Option<Trial> {
        self.current_trial.clone()
    }

    /// Copy of the session state
    pub fn metrics(&self) -> Session {
        self.session.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn mode(&self) -> TrialMode {
        self.policy.mode()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn trial_complete(&self) -> bool {
        self.current_trial
            .as_ref()
            .is_some_and(|t| self.policy.is_trial_complete(t))
    }
}
