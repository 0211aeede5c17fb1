//! Group-DRO loss aggregation.
//!
//! Maintains an adversarial probability distribution over groups that is
//! multiplicatively reweighted toward groups with high running loss:
//!
//! ```text
//! q_g <- q_g * exp(eta * L_g)        (L_g = exponential average of group g)
//! q   <- q / sum(q)
//! loss = sum_{g in batch} q_g * mean_g / sum_{g in batch} q_g
//! ```
//!
//! The reported loss is an adversarially weighted average of the per-group
//! batch means, so hard groups dominate the gradient signal even when they
//! are rare in the data.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::DriveDroConfig;

use super::stats::{validate_batch, GroupStats};
use super::{LossAggregator, LossError, StepResult};

pub struct GroupLossAggregator {
    stats: GroupStats,
    /// Multiplicative update step size (eta above).
    step_size: f64,
    /// Adversarial distribution over groups. Always non-negative and
    /// normalized to sum 1; initialized uniform.
    adv_probs: Vec<f64>,
}

impl GroupLossAggregator {
    pub fn new(config: &DriveDroConfig) -> Self {
        let n = config.groups.num_groups();
        Self {
            stats: GroupStats::new(&config.groups, config.group_dro.ema),
            step_size: config.group_dro.step_size,
            adv_probs: vec![1.0 / n as f64; n],
        }
    }
}

impl LossAggregator for GroupLossAggregator {
    fn update(&mut self, losses: &[f64], group_ids: &[usize]) -> Result<StepResult, LossError> {
        let n = self.stats.num_groups();
        validate_batch(losses, group_ids, n)?;

        let batch = self.stats.batch_group_means(losses, group_ids);
        let present: Vec<usize> = batch.present().collect();
        for &g in &present {
            self.stats.observe(g, batch.means[g]);
        }

        // Multiplicative adversarial update over all groups, driven by the
        // updated exponential averages. Absent groups contribute their held
        // average, so their relative weight drifts only as others change.
        for g in 0..n {
            self.adv_probs[g] *= (self.step_size * self.stats.exp_avg_loss(g)).exp();
        }
        let total: f64 = self.adv_probs.iter().sum();
        for q in &mut self.adv_probs {
            *q /= total;
        }

        // Weighted average restricted to the groups actually in the batch.
        let present_mass: f64 = present.iter().map(|&g| self.adv_probs[g]).sum();
        let loss = present
            .iter()
            .map(|&g| self.adv_probs[g] * batch.means[g])
            .sum::<f64>()
            / present_mass;

        let mut stats = BTreeMap::new();
        self.stats.log_batch(&mut stats, &batch);
        for g in 0..n {
            stats.insert(
                format!("adv_prob/{}", self.stats.name(g)),
                self.adv_probs[g],
            );
        }

        debug!(
            loss,
            groups_present = present.len(),
            "Group-DRO step aggregated {} examples",
            losses.len()
        );

        Ok(StepResult { loss, stats })
    }

    fn name(&self) -> &'static str {
        "group_dro"
    }
}
