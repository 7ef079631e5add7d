//! Collapses a message sequence to one entry per id.
//!
//! The first occurrence wins. Reconciliation always appends incoming items
//! after existing ones, so an already reconciled entry survives a late push
//! echo of the same id.

use std::collections::HashSet;

use crate::types::Message;

pub fn dedupe(messages: Vec<Message>) -> Vec<Message> {
    let mut messages = messages;
    dedupe_in_place(&mut messages);
    messages
}

/// In-place variant of [`dedupe`]. Returns the number of dropped entries.
pub fn dedupe_in_place(messages: &mut Vec<Message>) -> usize {
    let before = messages.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(before);
    messages.retain(|m| seen.insert(m.id.clone()));
    before - messages.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, body: &str) -> Message {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "room_id": "r1",
            "sender_id": "u1",
            "body": body,
            "created_at": Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }))
        .unwrap()
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_first_occurrence_wins() {
        let out = dedupe(vec![msg("a", "v1"), msg("a", "v2")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, "v1");
    }

    #[test]
    fn test_preserves_order() {
        let out = dedupe(vec![
            msg("c", ""),
            msg("a", ""),
            msg("c", ""),
            msg("b", ""),
            msg("a", ""),
        ]);
        assert_eq!(ids(&out), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_idempotent() {
        let input = vec![msg("x", "1"), msg("y", "2"), msg("x", "3"), msg("z", "4")];
        let once = dedupe(input);
        let twice = dedupe(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_in_place_reports_dropped() {
        let mut list = vec![msg("a", ""), msg("a", ""), msg("b", "")];
        assert_eq!(dedupe_in_place(&mut list), 1);
        assert_eq!(dedupe_in_place(&mut list), 0);
        assert!(dedupe(Vec::new()).is_empty());
    }
}
