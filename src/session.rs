use crate::clock::{Origin, Timestamp};
use crate::event::ClickEvent;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `<prefix>_<epoch ms>_<base36 suffix>`
pub(crate) fn generate_id(prefix: &str, now: &Timestamp, suffix_len: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..suffix_len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, now.wall.timestamp_millis(), suffix)
}

/// One end-to-end instrumented run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub start_monotonic_ms: f64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_count: u32,
    #[serde(default)]
    events: Vec<ClickEvent>,
    #[serde(default)]
    pub correct_count: usize,
    #[serde(default)]
    pub incorrect_count: usize,
    #[serde(default)]
    pub first_interaction_ms: Option<f64>,
}

impl Session {
    pub fn new(prefix: &str, now: &Timestamp) -> Self {
        Self {
            id: generate_id(prefix, now, 7),
            start_monotonic_ms: 0.0,
            started_at: None,
            trial_count: 0,
            events: Vec::new(),
            correct_count: 0,
            incorrect_count: 0,
            first_interaction_ms: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.start_monotonic_ms > 0.0 || self.started_at.is_some()
    }

    /// Mark the session as started at `now`; a no-op once started.
    /// Returns whether this call did the start.
    pub fn start(&mut self, now: Timestamp) -> bool {
        if self.is_started() {
            return false;
        }
        self.start_monotonic_ms = now.monotonic_ms;
        self.started_at = Some(now.wall);
        true
    }

    pub fn origin(&self) -> Origin {
        Origin {
            monotonic_ms: self.start_monotonic_ms,
            wall: self.started_at,
        }
    }

    pub fn events(&self) -> &[ClickEvent] {
        &self.events
    }

    /// Append `event`, keeping counters and the first-interaction time in step
    pub fn append_event(&mut self, mut event: ClickEvent) {
        event.accumulated_ms = clamp_ms(event.accumulated_ms);
        event.reaction_ms = clamp_ms(event.reaction_ms);
        event.index = self.events.len() + 1;

        if event.is_correct {
            self.correct_count += 1;
        } else {
            self.incorrect_count += 1;
        }
        if self.first_interaction_ms.is_none() {
            self.first_interaction_ms = Some(event.accumulated_ms);
        }
        self.events.push(event);
    }

    pub fn next_trial(&mut self) -> u32 {
        self.trial_count += 1;
        self.trial_count
    }

    /// Counters agree with the log; snapshots failing this are not restored
    pub fn is_consistent(&self) -> bool {
        self.correct_count + self.incorrect_count == self.events.len()
            && self
                .events
                .iter()
                .enumerate()
                .all(|(i, e)| e.index == i + 1)
    }
}

fn clamp_ms(ms: f64) -> f64 {
    if ms.is_finite() && ms > 0.0 {
        ms
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::event::{record, RawInteraction};

    fn session_with_clock() -> (Session, ManualClock) {
        let clock = ManualClock::default();
        let session = Session::new("session", &clock.now());
        (session, clock)
    }

    #[test]
    fn test_new_session_is_idle() {
        let (session, _) = session_with_clock();

        assert!(session.id.starts_with("session_1700000000000_"));
        assert_eq!(session.id.len(), "session_1700000000000_".len() + 7);
        assert!(!session.is_started());
        assert_eq!(session.trial_count, 0);
        assert!(session.events().is_empty());
        assert_eq!(session.first_interaction_ms, None);
    }

    #[test]
    fn test_ids_are_unique() {
        let clock = ManualClock::default();
        let a = Session::new("session", &clock.now());
        let b = Session::new("session", &clock.now());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut session, clock) = session_with_clock();

        assert!(session.start(clock.now()));
        let first = session.origin();
        clock.advance(500);
        assert!(!session.start(clock.now()));

        assert_eq!(session.origin(), first);
    }

    #[test]
    fn test_append_updates_counters() {
        let (mut session, clock) = session_with_clock();
        session.start(clock.now());

        for (i, correct) in [false, true, true].into_iter().enumerate() {
            clock.advance(10 * (i as u64 + 1));
            let event = record(&session, None, 1, RawInteraction::new("t", correct), clock.now());
            session.append_event(event);
        }

        assert_eq!(session.correct_count, 2);
        assert_eq!(session.incorrect_count, 1);
        assert_eq!(session.events().len(), 3);
        assert_eq!(session.events()[2].index, 3);
        assert_eq!(session.first_interaction_ms, Some(10.0));
        assert!(session.is_consistent());
    }

    #[test]
    fn test_append_clamps_negative_timings() {
        let (mut session, clock) = session_with_clock();
        let mut event = record(&session, None, 1, RawInteraction::new("t", true), clock.now());
        event.accumulated_ms = -5.0;
        event.reaction_ms = f64::NAN;

        session.append_event(event);

        assert_eq!(session.events()[0].accumulated_ms, 0.0);
        assert_eq!(session.events()[0].reaction_ms, 0.0);
    }

    #[test]
    fn test_next_trial_increments() {
        let (mut session, _) = session_with_clock();
        assert_eq!(session.next_trial(), 1);
        assert_eq!(session.next_trial(), 2);
        assert_eq!(session.trial_count, 2);
    }
}
