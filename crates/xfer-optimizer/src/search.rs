//! Searcher capability and the built-in searchers.

use rand::{Rng, RngCore};
use std::collections::{BTreeMap, HashSet};

use xfer_types::TrialId;

use crate::space::{ConfigSpace, Configuration, ParameterKind, ParameterValue};
use crate::trial::{ObjectiveDirection, Observation};

/// Proposes the next configuration to try.
///
/// A searcher is a function of the observation history and the config space;
/// it keeps no trial-lifecycle state of its own. Returning `None` means no
/// confident choice is available and the scheduler falls back to a random
/// draw from the space.
pub trait Searcher: Send + Sync {
    fn next_config(
        &self,
        history: &[Observation],
        space: &ConfigSpace,
        rng: &mut dyn RngCore,
    ) -> Option<Configuration>;

    /// Human-readable searcher name.
    fn name(&self) -> &str;
}

// ---- Random search ----

/// Independent random sampling across the space.
#[derive(Debug, Clone, Default)]
pub struct RandomSearcher;

impl Searcher for RandomSearcher {
    fn next_config(
        &self,
        _history: &[Observation],
        space: &ConfigSpace,
        rng: &mut dyn RngCore,
    ) -> Option<Configuration> {
        Some(space.sample_default(rng))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Local search around the incumbent ----

/// Perturbs the best configuration seen so far.
///
/// Until `num_init_random` distinct trials have reported, and with
/// probability `exploration_weight` afterwards, it declines to answer so the
/// scheduler draws at random instead. The incumbent is the trial whose
/// deepest report is at the highest resource level, ties broken by metric.
#[derive(Debug, Clone)]
pub struct LocalSearcher {
    direction: ObjectiveDirection,
    num_init_random: usize,
    exploration_weight: f64,
}

impl LocalSearcher {
    pub fn new(direction: ObjectiveDirection, num_init_random: usize, exploration_weight: f64) -> Self {
        Self {
            direction,
            num_init_random,
            exploration_weight,
        }
    }

    /// Latest observation of the incumbent trial.
    fn incumbent<'a>(&self, history: &'a [Observation]) -> Option<&'a Observation> {
        let mut deepest: BTreeMap<TrialId, &Observation> = BTreeMap::new();
        for obs in history {
            let entry = deepest.entry(obs.trial_id).or_insert(obs);
            if obs.resource_level > entry.resource_level {
                *entry = obs;
            }
        }
        deepest.into_values().reduce(|best, obs| {
            if obs.resource_level > best.resource_level
                || (obs.resource_level == best.resource_level
                    && self.direction.is_better(obs.metric_value, best.metric_value))
            {
                obs
            } else {
                best
            }
        })
    }

    fn perturb(
        &self,
        base: &Configuration,
        space: &ConfigSpace,
        rng: &mut dyn RngCore,
    ) -> Configuration {
        let mut next = base.clone();
        for param in &space.parameters {
            let current = base.get(&param.name).and_then(ParameterValue::as_int);
            let value = match (&param.kind, current) {
                (ParameterKind::IntRange { low, high }, Some(v)) => {
                    let span = ((high - low) as f64 * 0.1).max(1.0);
                    let noise = rng.gen_range(-span..=span).round() as i64;
                    ParameterValue::Int((v + noise).clamp(*low, *high))
                }
                (ParameterKind::LogIntRange { low, high }, Some(v)) => {
                    let log_span = ((*high as f64).ln() - (*low as f64).ln()) * 0.1;
                    let noise = rng.gen_range(-log_span..=log_span);
                    let moved = ((v.max(1) as f64).ln() + noise).exp().round() as i64;
                    ParameterValue::Int(moved.clamp(*low, *high))
                }
                _ => {
                    // Resample choices (and anything missing) from the prior.
                    match space.sample_parameter(&param.name, rng) {
                        Some(v) => v,
                        None => continue,
                    }
                }
            };
            next = next.with(param.name.clone(), value);
        }
        next
    }
}

impl Searcher for LocalSearcher {
    fn next_config(
        &self,
        history: &[Observation],
        space: &ConfigSpace,
        rng: &mut dyn RngCore,
    ) -> Option<Configuration> {
        let distinct: HashSet<TrialId> = history.iter().map(|o| o.trial_id).collect();
        if distinct.len() < self.num_init_random {
            return None;
        }
        if rng.gen::<f64>() < self.exploration_weight {
            return None;
        }
        let best = self.incumbent(history)?;
        Some(self.perturb(&best.configuration, space, rng))
    }

    fn name(&self) -> &str {
        "local"
    }
}
