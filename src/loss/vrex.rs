//! V-REx (risk extrapolation) loss aggregation.
//!
//! Penalizes the variance of per-group mean losses in addition to their
//! average:
//!
//! ```text
//! loss = mean_g(mean_g_loss) + beta * Var_g(mean_g_loss)
//! ```
//!
//! Group means are weighted equally regardless of group size, so small groups
//! are not drowned out by the dominant one. The variance is the population
//! variance over the groups present in the batch, defined as 0 when only one
//! group is present.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::DriveDroConfig;

use super::stats::{validate_batch, GroupStats};
use super::{LossAggregator, LossError, StepResult};

pub struct RiskExtrapolationAggregator {
    stats: GroupStats,
    /// Variance penalty weight (beta above).
    penalty_weight: f64,
}

impl RiskExtrapolationAggregator {
    pub fn new(config: &DriveDroConfig) -> Self {
        Self {
            stats: GroupStats::new(&config.groups, config.vrex.ema),
            penalty_weight: config.vrex.penalty_weight,
        }
    }
}

impl LossAggregator for RiskExtrapolationAggregator {
    fn update(&mut self, losses: &[f64], group_ids: &[usize]) -> Result<StepResult, LossError> {
        validate_batch(losses, group_ids, self.stats.num_groups())?;

        let batch = self.stats.batch_group_means(losses, group_ids);
        let present: Vec<usize> = batch.present().collect();
        for &g in &present {
            self.stats.observe(g, batch.means[g]);
        }

        let k = present.len() as f64;
        let mean_group_loss = present.iter().map(|&g| batch.means[g]).sum::<f64>() / k;

        // Population variance over the present group means; a single point
        // has no variance.
        let variance_term = if present.len() < 2 {
            0.0
        } else {
            present
                .iter()
                .map(|&g| (batch.means[g] - mean_group_loss).powi(2))
                .sum::<f64>()
                / k
        };

        let loss = mean_group_loss + self.penalty_weight * variance_term;

        let mut stats = BTreeMap::new();
        self.stats.log_batch(&mut stats, &batch);
        stats.insert("mean_group_loss".into(), mean_group_loss);
        stats.insert("variance_term".into(), variance_term);

        debug!(
            loss,
            mean_group_loss,
            variance_term,
            "V-REx step aggregated {} examples",
            losses.len()
        );

        Ok(StepResult { loss, stats })
    }

    fn name(&self) -> &'static str {
        "vrex"
    }
}
