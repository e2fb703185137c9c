use crate::clock::{Origin, Timestamp};
use crate::export::EmptyExport;
use crate::session::{generate_id, Session};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a trial is searching for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "targets", rename_all = "snake_case")]
pub enum TrialTargets {
    /// One required target; the trial ends when it is hit
    Single(String),
    /// Precomputed targets still waiting to be hit, in presentation order
    Remaining(Vec<String>),
}

impl TrialTargets {
    pub fn single(target: impl Into<String>) -> Self {
        TrialTargets::Single(target.into())
    }

    /// Build a sweep over `targets`, dropping repeats
    pub fn sweep<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut remaining: Vec<String> = Vec::new();
        for t in targets {
            let t = t.into();
            if !remaining.contains(&t) {
                remaining.push(t);
            }
        }
        TrialTargets::Remaining(remaining)
    }

    pub fn contains(&self, target_id: &str) -> bool {
        match self {
            TrialTargets::Single(t) => t == target_id,
            TrialTargets::Remaining(ts) => ts.iter().any(|t| t == target_id),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TrialTargets::Single(_) => 1,
            TrialTargets::Remaining(ts) => ts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `target_id`; true if it was present
    fn remove(&mut self, target_id: &str) -> bool {
        match self {
            TrialTargets::Single(_) => false,
            TrialTargets::Remaining(ts) => {
                let before = ts.len();
                ts.retain(|t| t != target_id);
                ts.len() != before
            }
        }
    }
}

impl From<&str> for TrialTargets {
    fn from(target: &str) -> Self {
        TrialTargets::single(target)
    }
}

impl From<String> for TrialTargets {
    fn from(target: String) -> Self {
        TrialTargets::Single(target)
    }
}

impl From<Vec<String>> for TrialTargets {
    fn from(targets: Vec<String>) -> Self {
        TrialTargets::sweep(targets)
    }
}

/// The live search attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    #[serde(default)]
    pub start_monotonic_ms: f64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub targets: TrialTargets,
    #[serde(default)]
    pub item_count: usize,
}

impl Trial {
    pub fn start(targets: TrialTargets, item_count: usize, now: &Timestamp) -> Self {
        Self {
            id: generate_id("task", now, 4),
            start_monotonic_ms: now.monotonic_ms,
            started_at: Some(now.wall),
            targets,
            item_count,
        }
    }

    pub fn origin(&self) -> Origin {
        Origin {
            monotonic_ms: self.start_monotonic_ms,
            wall: self.started_at,
        }
    }

    /// Milliseconds since this trial's reaction origin
    pub fn reaction_elapsed(&self, now: &Timestamp) -> f64 {
        self.origin().elapsed_ms(now)
    }

    fn reset_origin(&mut self, now: &Timestamp) {
        self.start_monotonic_ms = now.monotonic_ms;
        self.started_at = Some(now.wall);
    }

    /// Targets not hit yet
    pub fn remaining(&self) -> &[String] {
        match &self.targets {
            TrialTargets::Single(t) => std::slice::from_ref(t),
            TrialTargets::Remaining(ts) => ts,
        }
    }
}

/// Which trial semantics an engine runs with
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrialMode {
    /// One target per trial; the caller starts each trial
    #[default]
    Single,
    /// One session-wide sweep over precomputed targets
    Batch,
}

impl TrialMode {
    pub fn policy(self) -> Box<dyn TrialPolicy> {
        match self {
            TrialMode::Single => Box::new(SingleTarget),
            TrialMode::Batch => Box::new(BatchSweep),
        }
    }
}

/// Result of feeding a correct click to the active trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The click does not satisfy the trial
    NoMatch,
    /// The trial is finished and must be cleared
    Completed,
    /// The sweep moved on to trial number `next`
    Advanced { next: u32 },
}

/// Trial semantics that differ between the single-target and batch variants
pub trait TrialPolicy: std::fmt::Debug + Send + Sync {
    fn mode(&self) -> TrialMode;

    /// Prefix of generated session ids
    fn session_prefix(&self) -> &'static str;

    /// Bump the session for a trial being started; returns its number
    fn begin_trial(&self, session: &mut Session) -> u32;

    /// Trial number stamped on a click recorded now
    fn event_trial_number(&self, session: &Session) -> u32;

    /// Apply a correct click on `target_id` to the live trial
    fn on_correct_match(
        &self,
        session: &mut Session,
        trial: &mut Trial,
        target_id: &str,
        now: &Timestamp,
    ) -> MatchOutcome;

    fn is_trial_complete(&self, trial: &Trial) -> bool;

    fn completed_trials(&self, session: &Session) -> u32;

    /// Trial created when a click arrives with none active
    fn implicit_trial(&self, session: &mut Session, now: &Timestamp) -> Option<Trial>;

    fn default_empty_export(&self) -> EmptyExport;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTarget;

impl TrialPolicy for SingleTarget {
    fn mode(&self) -> TrialMode {
        TrialMode::Single
    }

    fn session_prefix(&self) -> &'static str {
        "session"
    }

    fn begin_trial(&self, session: &mut Session) -> u32 {
        session.next_trial()
    }

    fn event_trial_number(&self, session: &Session) -> u32 {
        session.trial_count.max(1)
    }

    fn on_correct_match(
        &self,
        _session: &mut Session,
        trial: &mut Trial,
        target_id: &str,
        _now: &Timestamp,
    ) -> MatchOutcome {
        if trial.targets.contains(target_id) {
            MatchOutcome::Completed
        } else {
            MatchOutcome::NoMatch
        }
    }

    // a matched single-target trial is cleared right away
    fn is_trial_complete(&self, _trial: &Trial) -> bool {
        false
    }

    fn completed_trials(&self, session: &Session) -> u32 {
        session.trial_count
    }

    fn implicit_trial(&self, _session: &mut Session, _now: &Timestamp) -> Option<Trial> {
        None
    }

    fn default_empty_export(&self) -> EmptyExport {
        EmptyExport::HeaderOnly
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSweep;

impl TrialPolicy for BatchSweep {
    fn mode(&self) -> TrialMode {
        TrialMode::Batch
    }

    fn session_prefix(&self) -> &'static str {
        "precomp"
    }

    // the sweep counter already points at the live trial once started
    fn begin_trial(&self, session: &mut Session) -> u32 {
        if session.trial_count == 0 {
            session.next_trial()
        } else {
            session.trial_count
        }
    }

    fn event_trial_number(&self, session: &Session) -> u32 {
        session.trial_count
    }

    fn on_correct_match(
        &self,
        session: &mut Session,
        trial: &mut Trial,
        target_id: &str,
        now: &Timestamp,
    ) -> MatchOutcome {
        trial.targets.remove(target_id);
        trial.reset_origin(now);
        MatchOutcome::Advanced {
            next: session.next_trial(),
        }
    }

    fn is_trial_complete(&self, trial: &Trial) -> bool {
        trial.targets.is_empty()
    }

    fn completed_trials(&self, session: &Session) -> u32 {
        session.trial_count.saturating_sub(1)
    }

    fn implicit_trial(&self, session: &mut Session, now: &Timestamp) -> Option<Trial> {
        self.begin_trial(session);
        Some(Trial::start(TrialTargets::Remaining(Vec::new()), 0, now))
    }

    fn default_empty_export(&self) -> EmptyExport {
        EmptyExport::Refuse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn test_sweep_drops_repeats() {
        let targets = TrialTargets::sweep(["p-1", "p-2", "p-1"]);
        assert_eq!(
            targets,
            TrialTargets::Remaining(vec!["p-1".into(), "p-2".into()])
        );
    }

    #[test]
    fn test_trial_ids_use_task_prefix() {
        let clock = ManualClock::default();
        let trial = Trial::start(TrialTargets::single("a"), 3, &clock.now());
        assert!(trial.id.starts_with("task_1700000000000_"));
        assert_eq!(trial.item_count, 3);
        assert_eq!(trial.remaining(), ["a".to_string()]);
    }

    #[test]
    fn test_single_target_completes_on_its_target_only() {
        let clock = ManualClock::default();
        let mut session = Session::new("session", &clock.now());
        let mut trial = Trial::start(TrialTargets::single("a"), 3, &clock.now());
        let policy = SingleTarget;

        assert_eq!(
            policy.on_correct_match(&mut session, &mut trial, "b", &clock.now()),
            MatchOutcome::NoMatch
        );
        assert_eq!(
            policy.on_correct_match(&mut session, &mut trial, "a", &clock.now()),
            MatchOutcome::Completed
        );
        assert_eq!(session.trial_count, 0);
    }

    #[test]
    fn test_batch_advances_and_resets_origin() {
        let clock = ManualClock::default();
        let mut session = Session::new("precomp", &clock.now());
        let policy = BatchSweep;
        let mut trial = Trial::start(TrialTargets::sweep(["a", "b"]), 12, &clock.now());
        assert_eq!(policy.begin_trial(&mut session), 1);

        clock.advance(200);
        let outcome = policy.on_correct_match(&mut session, &mut trial, "a", &clock.now());

        assert_eq!(outcome, MatchOutcome::Advanced { next: 2 });
        assert_eq!(trial.remaining(), ["b".to_string()]);
        assert_eq!(trial.reaction_elapsed(&clock.now()), 0.0);
        assert!(!policy.is_trial_complete(&trial));

        policy.on_correct_match(&mut session, &mut trial, "b", &clock.now());
        assert!(policy.is_trial_complete(&trial));
        assert_eq!(policy.completed_trials(&session), 2);
    }

    #[test]
    fn test_batch_begin_keeps_live_counter() {
        let clock = ManualClock::default();
        let mut session = Session::new("precomp", &clock.now());
        let policy = BatchSweep;
        assert_eq!(policy.begin_trial(&mut session), 1);
        session.next_trial();
        assert_eq!(policy.begin_trial(&mut session), 2);
    }

    #[test]
    fn test_single_event_trial_number_is_at_least_one() {
        let clock = ManualClock::default();
        let session = Session::new("session", &clock.now());
        assert_eq!(SingleTarget.event_trial_number(&session), 1);
        assert_eq!(BatchSweep.event_trial_number(&session), 0);
    }

    #[test]
    fn test_implicit_trial_only_for_batch() {
        let clock = ManualClock::default();
        let mut session = Session::new("session", &clock.now());
        assert!(SingleTarget.implicit_trial(&mut session, &clock.now()).is_none());

        let trial = BatchSweep.implicit_trial(&mut session, &clock.now());
        assert!(trial.is_some());
        assert_eq!(session.trial_count, 1);
    }

    #[test]
    fn test_mode_display_and_policy() {
        assert_eq!(TrialMode::Single.to_string(), "single");
        assert_eq!(TrialMode::Batch.to_string(), "batch");
        assert_eq!(TrialMode::Batch.policy().mode(), TrialMode::Batch);
    }
}
