//! Shared per-group running statistics for the loss aggregators.
//!
//! Both DRO schemes track the same per-group state: an exponential moving
//! average of the group's batch-mean loss, how many batches have updated it,
//! and a short history of recent batch means for diagnostics. Isolating the
//! smoothing arithmetic here keeps the two schemes numerically consistent.

use std::collections::{BTreeMap, VecDeque};

use crate::config::{EmaPolicy, GroupsConfig};

use super::LossError;

/// How many recent per-group batch means are retained for diagnostics.
const RECENT_HISTORY_LEN: usize = 32;

/// Per-group means and counts observed in a single batch.
///
/// `counts[g] == 0` means group `g` was absent; its `means[g]` entry is 0.0
/// and must not be read.
#[derive(Debug, Clone)]
pub struct BatchGroupMeans {
    pub means: Vec<f64>,
    pub counts: Vec<usize>,
}

impl BatchGroupMeans {
    /// Ids of the groups present in the batch, ascending.
    pub fn present(&self) -> impl Iterator<Item = usize> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(g, _)| g)
    }

    /// Number of distinct groups present in the batch.
    pub fn num_present(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

/// Running per-group statistics shared by all aggregators.
#[derive(Debug, Clone)]
pub struct GroupStats {
    names: Vec<String>,
    /// Dataset-wide example counts, for fraction diagnostics.
    dataset_counts: Vec<u64>,
    ema: EmaPolicy,
    exp_avg_loss: Vec<f64>,
    update_counts: Vec<u64>,
    recent: Vec<VecDeque<f64>>,
}

impl GroupStats {
    pub fn new(groups: &GroupsConfig, ema: EmaPolicy) -> Self {
        let n = groups.num_groups();
        Self {
            names: groups.names.clone(),
            dataset_counts: groups.counts.clone(),
            ema,
            exp_avg_loss: vec![0.0; n],
            update_counts: vec![0; n],
            recent: vec![VecDeque::with_capacity(RECENT_HISTORY_LEN); n],
        }
    }

    pub fn num_groups(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, g: usize) -> &str {
        &self.names[g]
    }

    /// Current exponential average of group `g`'s batch-mean loss.
    pub fn exp_avg_loss(&self, g: usize) -> f64 {
        self.exp_avg_loss[g]
    }

    /// How many batches have contained group `g` so far.
    pub fn update_count(&self, g: usize) -> u64 {
        self.update_counts[g]
    }

    /// Fraction of the dataset belonging to group `g`.
    pub fn group_frac(&self, g: usize) -> f64 {
        let total: u64 = self.dataset_counts.iter().sum();
        self.dataset_counts[g] as f64 / total as f64
    }

    /// Mean of the retained recent batch means for group `g`, if any.
    pub fn recent_mean(&self, g: usize) -> Option<f64> {
        let h = &self.recent[g];
        if h.is_empty() {
            None
        } else {
            Some(h.iter().sum::<f64>() / h.len() as f64)
        }
    }

    /// Compute per-group arithmetic means for one batch.
    ///
    /// Assumes the batch has already passed [`validate_batch`].
    pub fn batch_group_means(&self, losses: &[f64], group_ids: &[usize]) -> BatchGroupMeans {
        let n = self.num_groups();
        let mut sums = vec![0.0; n];
        let mut counts = vec![0usize; n];
        for (&loss, &g) in losses.iter().zip(group_ids.iter()) {
            sums[g] += loss;
            counts[g] += 1;
        }
        let means = sums
            .iter()
            .zip(counts.iter())
            .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
            .collect();
        BatchGroupMeans { means, counts }
    }

    /// Fold one observed batch mean for group `g` into the running state.
    ///
    /// The updated exponential average is a convex combination of the
    /// previous value and the observation, so it can never leave the
    /// interval spanned by the two.
    pub fn observe(&mut self, g: usize, batch_mean: f64) {
        let weight = match self.ema {
            EmaPolicy::AdaptiveByCount => 1.0 / (self.update_counts[g] as f64 + 1.0),
            EmaPolicy::Fixed { coefficient } => coefficient,
        };
        self.exp_avg_loss[g] = (1.0 - weight) * self.exp_avg_loss[g] + weight * batch_mean;
        self.update_counts[g] += 1;

        let history = &mut self.recent[g];
        if history.len() == RECENT_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(batch_mean);
    }

    /// Record the per-group stat keys shared by every aggregator.
    pub fn log_batch(&self, stats: &mut BTreeMap<String, f64>, batch: &BatchGroupMeans) {
        for g in 0..self.num_groups() {
            let name = self.name(g);
            stats.insert(format!("batch_count/{name}"), batch.counts[g] as f64);
            stats.insert(format!("exp_avg_loss/{name}"), self.exp_avg_loss[g]);
            stats.insert(format!("group_frac/{name}"), self.group_frac(g));
            if batch.counts[g] > 0 {
                stats.insert(format!("avg_loss/{name}"), batch.means[g]);
            }
        }
    }
}

/// Reject malformed batches before any state is mutated.
///
/// # Errors
///
/// - [`LossError::ShapeMismatch`] when the slices disagree in length, the
///   batch is empty, or a group id falls outside `[0, num_groups)`.
/// - [`LossError::NonFiniteLoss`] when any loss is NaN or infinite.
pub fn validate_batch(
    losses: &[f64],
    group_ids: &[usize],
    num_groups: usize,
) -> Result<(), LossError> {
    if losses.len() != group_ids.len() {
        return Err(LossError::ShapeMismatch {
            reason: format!(
                "losses ({}) and group_ids ({}) disagree in length",
                losses.len(),
                group_ids.len()
            ),
        });
    }
    if losses.is_empty() {
        return Err(LossError::ShapeMismatch {
            reason: "batch is empty".into(),
        });
    }
    for (index, &g) in group_ids.iter().enumerate() {
        if g >= num_groups {
            return Err(LossError::ShapeMismatch {
                reason: format!(
                    "group id {g} at batch index {index} is outside [0, {num_groups})"
                ),
            });
        }
    }
    for (index, &value) in losses.iter().enumerate() {
        if !value.is_finite() {
            return Err(LossError::NonFiniteLoss { index, value });
        }
    }
    Ok(())
}
