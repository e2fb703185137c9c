use crate::clock::Timestamp;
use crate::session::Session;
use crate::trial::TrialPolicy;
use crate::util::{mean, percent, std_dev};
use itertools::Itertools;
use serde::Serialize;

/// Click totals for one trial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub trial: u32,
    pub clicks: usize,
    pub correct: usize,
    pub mean_reaction_ms: f64,
}

/// Read-only summary of a session at one moment
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_clicks: usize,
    pub total_correct: usize,
    pub total_incorrect: usize,
    pub accuracy_percent: f64,
    pub average_reaction_ms: f64,
    pub reaction_std_dev_ms: f64,
    pub completed_trials: u32,
    pub session_duration_ms: f64,
    pub first_interaction_ms: f64,
    pub per_trial: Vec<TrialSummary>,
}

/// Summarize `session` as of `now`. Safe before the session starts.
pub fn summarize(session: &Session, policy: &dyn TrialPolicy, now: &Timestamp) -> StatsSnapshot {
    let events = session.events();
    let reactions: Vec<f64> = events.iter().map(|e| e.reaction_ms).collect();

    let per_trial = events
        .iter()
        .chunk_by(|e| e.trial)
        .into_iter()
        .map(|(trial, group)| {
            let group: Vec<_> = group.collect();
            let reactions: Vec<f64> = group.iter().map(|e| e.reaction_ms).collect();
            TrialSummary {
                trial,
                clicks: group.len(),
                correct: group.iter().filter(|e| e.is_correct).count(),
                mean_reaction_ms: mean(&reactions).unwrap_or(0.0),
            }
        })
        .collect();

    StatsSnapshot {
        total_clicks: events.len(),
        total_correct: session.correct_count,
        total_incorrect: session.incorrect_count,
        accuracy_percent: percent(session.correct_count, events.len()),
        average_reaction_ms: mean(&reactions).unwrap_or(0.0),
        reaction_std_dev_ms: std_dev(&reactions).unwrap_or(0.0),
        completed_trials: policy.completed_trials(session),
        session_duration_ms: session.origin().elapsed_ms(now),
        first_interaction_ms: session.first_interaction_ms.unwrap_or(0.0),
        per_trial,
    }
}
