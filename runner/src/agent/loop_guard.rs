//! Loop detection over repeated quest states.
//!
//! A state fingerprint hashes `(location_id, params_state, sorted jump ids)`.
//! Visits count how often a fingerprint was seen; streaks count how often
//! the model chose the same action at that fingerprint in a row. When both
//! cross their thresholds, the agent injects a loop-escape hint, and if the
//! model repeats anyway, rotates to the smallest different index.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Visits to a fingerprint before loop escape may fire.
pub const VISIT_THRESHOLD: u32 = 3;
/// Consecutive identical choices at a fingerprint before loop escape may fire.
pub const STREAK_THRESHOLD: u32 = 2;

/// Hash identifying a semantically-equivalent state.
///
/// `params_state` participates as normalized display text; jump ids are
/// sorted so presentation order does not split fingerprints.
pub fn fingerprint(location_id: &str, params_state: &[String], jump_ids: &[i64]) -> String {
    let mut sorted = jump_ids.to_vec();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(location_id.as_bytes());
    hasher.update([0]);
    for param in params_state {
        hasher.update(param.trim().as_bytes());
        hasher.update([0]);
    }
    for jump_id in sorted {
        hasher.update(jump_id.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Per-run visit and streak tracking.
#[derive(Debug, Default)]
pub struct LoopGuard {
    visits: HashMap<String, u32>,
    /// Streak is keyed on the model's raw choice, pre-override, so an
    /// overridden model that keeps answering the same index stays flagged.
    streaks: HashMap<(String, usize), u32>,
    last_choice: HashMap<String, usize>,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit to the fingerprinted state; returns the visit count.
    pub fn observe(&mut self, fingerprint: &str) -> u32 {
        let visits = self.visits.entry(fingerprint.to_string()).or_insert(0);
        *visits += 1;
        *visits
    }

    /// The action to steer away from, when both thresholds are crossed.
    pub fn hint_target(&self, fingerprint: &str) -> Option<usize> {
        if self.visits.get(fingerprint).copied().unwrap_or(0) < VISIT_THRESHOLD {
            return None;
        }
        let last = *self.last_choice.get(fingerprint)?;
        let streak = self
            .streaks
            .get(&(fingerprint.to_string(), last))
            .copied()
            .unwrap_or(0);
        (streak >= STREAK_THRESHOLD).then_some(last)
    }

    /// Record the model's raw choice at this fingerprint.
    pub fn record_choice(&mut self, fingerprint: &str, choice: usize) {
        let key = (fingerprint.to_string(), choice);
        if self.last_choice.get(fingerprint) == Some(&choice) {
            *self.streaks.entry(key).or_insert(0) += 1;
        } else {
            self.streaks.insert(key, 1);
            self.last_choice.insert(fingerprint.to_string(), choice);
        }
    }
}

/// Deterministic rotation: the smallest valid index different from
/// `repeated`, or `None` when no alternative exists.
pub fn escape_action(repeated: usize, choice_count: usize) -> Option<usize> {
    (1..=choice_count).find(|&candidate| candidate != repeated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_choice_order() {
        let a = fingerprint("loc", &["HP: 5".to_string()], &[3, 1, 2]);
        let b = fingerprint("loc", &["HP: 5".to_string()], &[1, 2, 3]);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_params() {
        let a = fingerprint("loc", &["HP: 5".to_string()], &[1]);
        let b = fingerprint("loc", &["HP: 4".to_string()], &[1]);
        assert_ne!(a, b);
    }

    #[test]
    fn hint_fires_after_thresholds() {
        let mut guard = LoopGuard::new();
        let fp = fingerprint("loc", &[], &[1, 2]);

        guard.observe(&fp);
        guard.record_choice(&fp, 1);
        assert_eq!(guard.hint_target(&fp), None);

        guard.observe(&fp);
        guard.record_choice(&fp, 1);
        assert_eq!(guard.hint_target(&fp), None);

        // Third visit: visits = 3, streak of choice 1 = 2.
        guard.observe(&fp);
        assert_eq!(guard.hint_target(&fp), Some(1));
    }

    #[test]
    fn changing_choice_resets_the_streak() {
        let mut guard = LoopGuard::new();
        let fp = fingerprint("loc", &[], &[1, 2]);
        for _ in 0..3 {
            guard.observe(&fp);
        }
        guard.record_choice(&fp, 1);
        guard.record_choice(&fp, 2);
        assert_eq!(guard.hint_target(&fp), None);
    }

    #[test]
    fn escape_rotates_to_smallest_alternative() {
        assert_eq!(escape_action(1, 3), Some(2));
        assert_eq!(escape_action(2, 3), Some(1));
        assert_eq!(escape_action(1, 1), None);
    }
}
