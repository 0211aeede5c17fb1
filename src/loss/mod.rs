//! Loss aggregation under the supported training schemes.
//!
//! Each scheme turns a batch of per-example losses plus group ids into a
//! single scalar training loss behind the [`LossAggregator`] trait, so the
//! outer loop never branches on scheme identity at call sites:
//!
//! - [`GroupLossAggregator`] -- Group-DRO, adversarially reweighted
//!   worst-case loss over groups.
//! - [`RiskExtrapolationAggregator`] -- V-REx, mean group loss plus a
//!   cross-group variance penalty.
//! - [`MeanLossAggregator`] -- plain per-example mean (ERM and the weighted
//!   sampling / reward-scaling schemes).

pub mod group_dro;
pub mod stats;
pub mod vrex;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::config::{DriveDroConfig, TrainScheme};

pub use group_dro::GroupLossAggregator;
pub use stats::{validate_batch, BatchGroupMeans, GroupStats};
pub use vrex::RiskExtrapolationAggregator;

/// Errors raised by a loss aggregator's `update`.
///
/// Both variants indicate a caller bug or corrupted upstream data; neither is
/// retried internally and neither leaves partial state behind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LossError {
    /// `losses` and `group_ids` disagree in length, the batch is empty, or a
    /// group id falls outside the declared range.
    #[error("shape mismatch: {reason}")]
    ShapeMismatch { reason: String },
    /// A NaN or infinite loss entered the aggregator. Continuing would
    /// permanently corrupt the adversarial distribution and running averages.
    #[error("non-finite loss {value} at batch index {index}")]
    NonFiniteLoss { index: usize, value: f64 },
}

/// The outcome of one aggregation step: the scalar loss handed to the
/// optimizer plus named statistics for the telemetry sink.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub loss: f64,
    pub stats: BTreeMap<String, f64>,
}

/// One aggregation step per training step.
///
/// Implementations are stateful: repeated calls with identical inputs advance
/// the internal running statistics, so results differ call to call. State is
/// created at construction and never reset.
pub trait LossAggregator {
    /// Combine a batch of per-example losses into a scalar training loss.
    ///
    /// `group_ids[i]` identifies the group of example `i`; both slices must
    /// have the same non-zero length.
    ///
    /// # Errors
    ///
    /// [`LossError::ShapeMismatch`] or [`LossError::NonFiniteLoss`]; on
    /// error no internal state is mutated.
    fn update(&mut self, losses: &[f64], group_ids: &[usize]) -> Result<StepResult, LossError>;

    /// Short scheme name for logging.
    fn name(&self) -> &'static str;
}

/// Plain per-example mean loss.
///
/// Used by the ERM, weighted-sampling, and weighted-reward schemes (for the
/// latter two the robustness lives in the sampler / loss scaling upstream).
/// Per-group running statistics are still maintained for logging parity with
/// the DRO schemes.
pub struct MeanLossAggregator {
    stats: GroupStats,
}

impl MeanLossAggregator {
    pub fn new(config: &DriveDroConfig) -> Self {
        Self {
            stats: GroupStats::new(&config.groups, config.group_dro.ema),
        }
    }
}

impl LossAggregator for MeanLossAggregator {
    fn update(&mut self, losses: &[f64], group_ids: &[usize]) -> Result<StepResult, LossError> {
        validate_batch(losses, group_ids, self.stats.num_groups())?;

        let batch = self.stats.batch_group_means(losses, group_ids);
        for g in batch.present().collect::<Vec<_>>() {
            self.stats.observe(g, batch.means[g]);
        }

        let loss = losses.iter().sum::<f64>() / losses.len() as f64;

        let mut stats = BTreeMap::new();
        self.stats.log_batch(&mut stats, &batch);
        Ok(StepResult { loss, stats })
    }

    fn name(&self) -> &'static str {
        "mean"
    }
}

/// Build the aggregator for the configured training scheme.
pub fn build_aggregator(config: &DriveDroConfig) -> Box<dyn LossAggregator> {
    match config.scheme {
        TrainScheme::Erm | TrainScheme::WeightedSampling | TrainScheme::WeightedReward => {
            Box::new(MeanLossAggregator::new(config))
        }
        TrainScheme::GroupDro => Box::new(GroupLossAggregator::new(config)),
        TrainScheme::Vrex => Box::new(RiskExtrapolationAggregator::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_aggregator_is_plain_mean() {
        let config = DriveDroConfig::default();
        let mut agg = MeanLossAggregator::new(&config);
        let result = agg.update(&[1.0, 2.0, 3.0, 6.0], &[0, 0, 1, 2]).unwrap();
        assert!((result.loss - 3.0).abs() < 1e-9);
        assert!((result.stats["avg_loss/straight"] - 1.5).abs() < 1e-9);
        assert!((result.stats["batch_count/right"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_aggregator_rejects_bad_batches() {
        let config = DriveDroConfig::default();
        let mut agg = MeanLossAggregator::new(&config);
        assert!(agg.update(&[1.0], &[0, 1]).is_err());
        assert!(agg.update(&[f64::NAN], &[0]).is_err());
    }

    #[test]
    fn test_factory_picks_scheme() {
        let mut config = DriveDroConfig::default();
        config.scheme = TrainScheme::Erm;
        assert_eq!(build_aggregator(&config).name(), "mean");
        config.scheme = TrainScheme::GroupDro;
        assert_eq!(build_aggregator(&config).name(), "group_dro");
        config.scheme = TrainScheme::Vrex;
        assert_eq!(build_aggregator(&config).name(), "vrex");
    }
}
