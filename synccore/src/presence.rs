//! Typing presence set for a single room.
//!
//! Liveness is inferred from age: a "stopped typing" delete may never arrive
//! (tab closed, network lost), so a signal older than the liveness window is
//! dropped from the presented set regardless.
//!
//! Upserts are last-write-wins by arrival order, not by the embedded
//! timestamp. Out-of-order delivery can therefore briefly keep an older
//! signal; the short window bounds the effect.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::types::TypingSignal;

#[derive(Debug, Clone)]
pub struct TypingPresence {
    liveness: chrono::Duration,
    signals: HashMap<String, TypingSignal>,
}

impl TypingPresence {
    pub fn new(liveness: Duration) -> Self {
        Self {
            liveness: chrono::Duration::from_std(liveness).unwrap_or(chrono::Duration::MAX),
            signals: HashMap::new(),
        }
    }

    /// Replaces any prior signal from the same user.
    pub fn upsert(&mut self, signal: TypingSignal) {
        self.signals.insert(signal.user_id.clone(), signal);
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.signals.remove(user_id).is_some()
    }

    pub fn is_live(&self, signal: &TypingSignal, now: DateTime<Utc>) -> bool {
        signal.age(now) <= self.liveness
    }

    /// Drops expired signals. Returns true if anything was removed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.signals.len();
        let liveness = self.liveness;
        self.signals.retain(|_, s| s.age(now) <= liveness);
        self.signals.len() != before
    }

    /// Live signals, excluding `viewer_id`, ordered by start time.
    pub fn active(&self, now: DateTime<Utc>, viewer_id: &str) -> Vec<TypingSignal> {
        let mut live: Vec<TypingSignal> = self
            .signals
            .values()
            .filter(|s| s.user_id != viewer_id && self.is_live(s, now))
            .cloned()
            .collect();
        live.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        live
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn clear(&mut self) {
        self.signals.clear();
    }
}
