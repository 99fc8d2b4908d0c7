//! Rung ladder: per-rung append-only logs and the promotion / early-stop
//! policy computed from them on demand.
//!
//! Every decision is a pure function of a rung's log, so the order in which
//! peers arrived is explicit (the `seq` of each entry) rather than hidden in a
//! mutable ranking table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use xfer_types::TrialId;

use crate::trial::ObjectiveDirection;

/// One metric recorded at a rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungEntry {
    pub trial_id: TrialId,
    pub metric: f64,
    /// Ladder-wide arrival order; earlier arrivals win ties.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
}

/// A resource checkpoint at which trials are compared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rung {
    pub level: u32,
    entries: Vec<RungEntry>,
    /// Trials already promoted out of this rung (promotion mode only).
    promoted: HashSet<TrialId>,
}

impl Rung {
    fn new(level: u32) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> &[RungEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, trial_id: TrialId) -> bool {
        self.entries.iter().any(|e| e.trial_id == trial_id)
    }

    pub fn metric_of(&self, trial_id: TrialId) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.trial_id == trial_id)
            .map(|e| e.metric)
    }

    pub fn is_promoted(&self, trial_id: TrialId) -> bool {
        self.promoted.contains(&trial_id)
    }
}

/// Order trial ids best-first; equal metrics keep arrival order.
pub fn rank(entries: &[RungEntry], direction: ObjectiveDirection) -> Vec<TrialId> {
    let mut sorted: Vec<&RungEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        direction
            .compare(a.metric, b.metric)
            .then_with(|| a.seq.cmp(&b.seq))
    });
    sorted.into_iter().map(|e| e.trial_id).collect()
}

/// How many of `recorded` trials survive a rung under `quantile`.
pub fn survivors(recorded: usize, quantile: f64) -> usize {
    ((recorded as f64 * quantile).ceil() as usize).clamp(1, recorded.max(1))
}

/// What the ladder says about a trial after a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RungDecision {
    /// Keep running toward the next rung.
    Continue,
    /// Prune the trial.
    Stop,
    /// The trial passed the last rung.
    Complete,
    /// The trial was already recorded at this rung; nothing changed.
    Duplicate,
}

/// Result of appending to a rung log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    Duplicate,
    NotARung,
}

/// The ordered set of rungs plus the promotion policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RungLadder {
    levels: Vec<u32>,
    quantile: f64,
    min_peers: usize,
    direction: ObjectiveDirection,
    rungs: BTreeMap<u32, Rung>,
    next_seq: u64,
}

impl RungLadder {
    /// `levels` must be non-empty and strictly ascending; the run config
    /// validates that before a ladder is built.
    pub fn new(
        levels: Vec<u32>,
        quantile: f64,
        min_peers: usize,
        direction: ObjectiveDirection,
    ) -> Self {
        Self {
            levels,
            quantile,
            min_peers,
            direction,
            rungs: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn max_level(&self) -> u32 {
        self.levels.last().copied().unwrap_or(0)
    }

    pub fn is_rung(&self, level: u32) -> bool {
        self.levels.binary_search(&level).is_ok()
    }

    pub fn is_last(&self, level: u32) -> bool {
        level == self.max_level()
    }

    /// Rungs are created lazily, so this is `None` until a trial arrives.
    pub fn rung(&self, level: u32) -> Option<&Rung> {
        self.rungs.get(&level)
    }

    /// Append a metric to the rung at `level`. A trial appears in a rung at
    /// most once; later deliveries are reported as duplicates.
    pub fn record(&mut self, trial_id: TrialId, level: u32, metric: f64) -> RecordOutcome {
        if !self.is_rung(level) {
            return RecordOutcome::NotARung;
        }
        let rung = self.rungs.entry(level).or_insert_with(|| Rung::new(level));
        if rung.contains(trial_id) {
            return RecordOutcome::Duplicate;
        }
        rung.entries.push(RungEntry {
            trial_id,
            metric,
            seq: self.next_seq,
            recorded_at: Utc::now(),
        });
        self.next_seq += 1;
        RecordOutcome::Recorded
    }

    /// Whether `trial_id` may continue past `level`, judged against every
    /// peer recorded there so far.
    pub fn decide(&self, trial_id: TrialId, level: u32) -> RungDecision {
        let Some(rung) = self.rungs.get(&level) else {
            return RungDecision::Continue;
        };
        if self.within_cutoff(rung, trial_id) {
            RungDecision::Continue
        } else {
            RungDecision::Stop
        }
    }

    /// Record and decide in one step (stopping mode).
    pub fn on_result(&mut self, trial_id: TrialId, level: u32, metric: f64) -> RungDecision {
        match self.record(trial_id, level, metric) {
            RecordOutcome::Duplicate => RungDecision::Duplicate,
            RecordOutcome::NotARung => RungDecision::Continue,
            RecordOutcome::Recorded => match self.decide(trial_id, level) {
                RungDecision::Continue if self.is_last(level) => RungDecision::Complete,
                decision => decision,
            },
        }
    }

    /// Find a paused trial that now ranks within the cutoff of its rung and
    /// mark it promoted. Higher rungs are served first.
    pub fn promote_next(&mut self, is_paused: impl Fn(TrialId) -> bool) -> Option<(TrialId, u32)> {
        let max_level = self.max_level();
        let mut found = None;
        for (level, rung) in self.rungs.iter().rev() {
            if *level == max_level {
                continue;
            }
            let candidate = rank(&rung.entries, self.direction)
                .into_iter()
                .filter(|id| !rung.is_promoted(*id) && is_paused(*id))
                .find(|id| self.within_cutoff(rung, *id));
            if let Some(trial_id) = candidate {
                found = Some((trial_id, *level));
                break;
            }
        }
        let (trial_id, level) = found?;
        if let Some(rung) = self.rungs.get_mut(&level) {
            rung.promoted.insert(trial_id);
        }
        Some((trial_id, level))
    }

    fn within_cutoff(&self, rung: &Rung, trial_id: TrialId) -> bool {
        let peers = rung.len().saturating_sub(1);
        if peers < self.min_peers {
            return true;
        }
        let ranked = rank(&rung.entries, self.direction);
        let cutoff = survivors(ranked.len(), self.quantile);
        ranked
            .iter()
            .position(|id| *id == trial_id)
            .is_some_and(|pos| pos < cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn ladder(levels: Vec<u32>, quantile: f64, min_peers: usize) -> RungLadder {
        RungLadder::new(levels, quantile, min_peers, ObjectiveDirection::Minimize)
    }

    #[test]
    fn three_trials_at_first_rung_keep_the_best_two() {
        let mut ladder = ladder(vec![1, 2, 3], 0.5, 1);

        assert_eq!(ladder.on_result(TrialId(1), 1, 5.0), RungDecision::Continue);
        assert_eq!(ladder.on_result(TrialId(2), 1, 3.0), RungDecision::Continue);
        assert_eq!(ladder.on_result(TrialId(3), 1, 8.0), RungDecision::Stop);

        let rung = ladder.rung(1).unwrap();
        assert_eq!(
            rank(rung.entries(), ObjectiveDirection::Minimize),
            vec![TrialId(2), TrialId(1), TrialId(3)]
        );
        // Re-judging the full log gives the same answer.
        assert_eq!(ladder.decide(TrialId(1), 1), RungDecision::Continue);
        assert_eq!(ladder.decide(TrialId(2), 1), RungDecision::Continue);
        assert_eq!(ladder.decide(TrialId(3), 1), RungDecision::Stop);
    }

    #[test]
    fn lone_trial_is_never_compared_against_itself() {
        let mut ladder = ladder(vec![1, 2], 0.1, 0);
        // One entry: cutoff is one survivor, which is the trial itself.
        assert_eq!(ladder.on_result(TrialId(9), 1, 100.0), RungDecision::Continue);
        assert_eq!(ladder.rung(1).unwrap().len(), 1);
    }

    #[test]
    fn too_few_peers_gives_benefit_of_the_doubt() {
        let mut ladder = ladder(vec![1, 2], 0.25, 3);
        assert_eq!(ladder.on_result(TrialId(0), 1, 1.0), RungDecision::Continue);
        assert_eq!(ladder.on_result(TrialId(1), 1, 2.0), RungDecision::Continue);
        assert_eq!(ladder.on_result(TrialId(2), 1, 3.0), RungDecision::Continue);
        // Three peers now: only ceil(4 * 0.25) = 1 survives.
        assert_eq!(ladder.on_result(TrialId(3), 1, 4.0), RungDecision::Stop);
    }

    #[test]
    fn ties_favor_earlier_arrivals() {
        let mut ladder = ladder(vec![1, 2], 0.5, 1);
        ladder.record(TrialId(5), 1, 2.0);
        ladder.record(TrialId(4), 1, 2.0);
        ladder.record(TrialId(6), 1, 2.0);
        ladder.record(TrialId(7), 1, 2.0);
        assert_eq!(ladder.decide(TrialId(5), 1), RungDecision::Continue);
        assert_eq!(ladder.decide(TrialId(4), 1), RungDecision::Continue);
        assert_eq!(ladder.decide(TrialId(6), 1), RungDecision::Stop);
        assert_eq!(ladder.decide(TrialId(7), 1), RungDecision::Stop);
    }

    #[test]
    fn duplicates_and_intermediate_levels() {
        let mut ladder = ladder(vec![2, 4], 0.5, 1);
        assert_eq!(ladder.record(TrialId(0), 1, 1.0), RecordOutcome::NotARung);
        assert_eq!(ladder.on_result(TrialId(0), 3, 1.0), RungDecision::Continue);
        assert!(ladder.rung(1).is_none());

        assert_eq!(ladder.on_result(TrialId(0), 2, 1.0), RungDecision::Continue);
        assert_eq!(ladder.on_result(TrialId(0), 2, 1.0), RungDecision::Duplicate);
        assert_eq!(ladder.on_result(TrialId(0), 2, 0.5), RungDecision::Duplicate);
        assert_eq!(ladder.rung(2).unwrap().len(), 1);
        assert_eq!(ladder.rung(2).unwrap().metric_of(TrialId(0)), Some(1.0));
    }

    #[test]
    fn last_rung_continue_means_complete() {
        let mut ladder = ladder(vec![1, 2], 0.5, 1);
        assert_eq!(ladder.on_result(TrialId(0), 2, 1.0), RungDecision::Complete);
        assert_eq!(ladder.on_result(TrialId(1), 2, 9.0), RungDecision::Stop);
    }

    #[test]
    fn maximize_flips_the_ranking() {
        let mut ladder = RungLadder::new(vec![1], 0.5, 1, ObjectiveDirection::Maximize);
        ladder.record(TrialId(0), 1, 1.0);
        ladder.record(TrialId(1), 1, 10.0);
        ladder.record(TrialId(2), 1, f64::NAN);
        let ranked = rank(ladder.rung(1).unwrap().entries(), ObjectiveDirection::Maximize);
        assert_eq!(ranked, vec![TrialId(1), TrialId(0), TrialId(2)]);
    }

    #[test]
    fn promotion_is_monotone_in_rank() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        for round in 0..50 {
            let mut ladder = ladder(vec![1, 2], 0.3 + (round as f64) * 0.01, 1);
            let metrics: Vec<f64> = (0..12).map(|_| rng.gen_range(0.0..10.0)).collect();
            for (i, m) in metrics.iter().enumerate() {
                ladder.record(TrialId(i as u64), 1, *m);
            }
            for (a, ma) in metrics.iter().enumerate() {
                for (b, mb) in metrics.iter().enumerate() {
                    if ma < mb {
                        let da = ladder.decide(TrialId(a as u64), 1);
                        let db = ladder.decide(TrialId(b as u64), 1);
                        assert!(
                            !(da == RungDecision::Stop && db == RungDecision::Continue),
                            "better trial {a} stopped while worse trial {b} continued"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn promote_next_serves_paused_trials_within_cutoff() {
        let mut ladder = ladder(vec![1, 2, 3], 0.5, 1);
        ladder.record(TrialId(0), 1, 4.0);
        ladder.record(TrialId(1), 1, 2.0);
        ladder.record(TrialId(2), 1, 6.0);
        ladder.record(TrialId(3), 1, 8.0);

        let paused = |_: TrialId| true;
        assert_eq!(ladder.promote_next(paused), Some((TrialId(1), 1)));
        assert_eq!(ladder.promote_next(paused), Some((TrialId(0), 1)));
        // Only two of four survive rung 1.
        assert_eq!(ladder.promote_next(paused), None);
        assert!(ladder.rung(1).unwrap().is_promoted(TrialId(1)));

        // A trial at a higher rung is promoted before lower ones.
        ladder.record(TrialId(1), 2, 1.0);
        ladder.record(TrialId(4), 1, 0.5);
        assert_eq!(ladder.promote_next(paused), Some((TrialId(1), 2)));
        assert_eq!(ladder.promote_next(paused), Some((TrialId(4), 1)));
    }

    #[test]
    fn promote_next_skips_trials_that_are_not_paused() {
        let mut ladder = ladder(vec![1, 2], 0.5, 2);
        ladder.record(TrialId(0), 1, 1.0);
        ladder.record(TrialId(1), 1, 2.0);
        assert_eq!(ladder.promote_next(|id| id != TrialId(0)), Some((TrialId(1), 1)));
        // Nothing is promoted out of the final rung.
        ladder.record(TrialId(1), 2, 2.0);
        assert_eq!(ladder.promote_next(|_| true), Some((TrialId(0), 1)));
        assert_eq!(ladder.promote_next(|_| true), None);
    }

    #[test]
    fn survivors_is_at_least_one() {
        assert_eq!(survivors(0, 0.5), 1);
        assert_eq!(survivors(1, 0.01), 1);
        assert_eq!(survivors(3, 0.5), 2);
        assert_eq!(survivors(8, 0.25), 2);
    }
}
