use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Complete configuration for a drivedro training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveDroConfig {
    pub groups: GroupsConfig,
    /// Which training scheme to run.
    pub scheme: TrainScheme,
    pub group_dro: GroupDroConfig,
    pub vrex: VrexConfig,
    pub train: TrainLoopConfig,
}

/// The fixed set of groups the dataset is partitioned into.
///
/// Groups here are scene maneuver types; the counts are dataset-wide example
/// totals used for balanced sampling and fraction diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Group names, in group-id order (default: straight, left, right).
    pub names: Vec<String>,
    /// Total example count per group (same order as `names`).
    pub counts: Vec<u64>,
    /// Per-group loss multiplier for the `weighted-reward` scheme.
    pub reward_scale: Vec<f64>,
}

impl GroupsConfig {
    /// Number of groups; group ids are `0..num_groups()`.
    pub fn num_groups(&self) -> usize {
        self.names.len()
    }
}

/// Training scheme selecting how per-example losses are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TrainScheme {
    /// Empirical risk minimization: plain mean over the batch.
    Erm,
    /// Plain mean loss over a group-balanced sampler.
    WeightedSampling,
    /// Plain mean loss with per-group reward scaling applied to the batch.
    WeightedReward,
    /// Group-DRO: adversarially reweighted worst-case loss over groups.
    GroupDro,
    /// V-REx: mean group loss plus a variance penalty across groups.
    Vrex,
}

impl TrainScheme {
    /// Whether this scheme draws batches from a group-balanced sampler
    /// instead of natural group frequencies.
    pub fn uses_balanced_sampler(self) -> bool {
        matches!(
            self,
            TrainScheme::WeightedSampling | TrainScheme::GroupDro | TrainScheme::Vrex
        )
    }
}

/// How the per-group exponential average of the loss is blended each step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EmaPolicy {
    /// Blend weight `1 / (update_count + 1)`: the first observation replaces
    /// the zero initialization outright, later ones decay ever more slowly.
    AdaptiveByCount,
    /// Fixed blend coefficient in (0, 1):
    /// `new = (1 - c) * prev + c * observed`.
    Fixed { coefficient: f64 },
}

/// Group-DRO aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDroConfig {
    /// Step size of the multiplicative adversarial weight update
    /// (typical magnitude 0.01 - 0.1).
    pub step_size: f64,
    pub ema: EmaPolicy,
}

/// V-REx aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VrexConfig {
    /// Weight of the cross-group variance penalty (non-negative).
    pub penalty_weight: f64,
    pub ema: EmaPolicy,
}

/// Outer training-loop settings for the synthetic driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainLoopConfig {
    /// Number of optimization steps to run.
    pub steps: usize,
    /// Examples per batch.
    pub batch_size: usize,
    /// RNG seed for sampling and the synthetic planner.
    pub seed: u64,
    /// Emit a progress log line every this many steps.
    pub log_every: usize,
}

impl Default for DriveDroConfig {
    fn default() -> Self {
        Self {
            groups: GroupsConfig {
                names: vec!["straight".into(), "left".into(), "right".into()],
                counts: vec![17_350, 890, 1_043],
                reward_scale: vec![1.0, 19.5, 16.6],
            },
            scheme: TrainScheme::GroupDro,
            group_dro: GroupDroConfig {
                step_size: 0.01,
                ema: EmaPolicy::AdaptiveByCount,
            },
            vrex: VrexConfig {
                penalty_weight: 10.0,
                ema: EmaPolicy::AdaptiveByCount,
            },
            train: TrainLoopConfig {
                steps: 1000,
                batch_size: 64,
                seed: 42,
                log_every: 100,
            },
        }
    }
}

impl DriveDroConfig {
    /// Check internal consistency before the run starts.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found: mismatched
    /// group table lengths, empty groups, or out-of-range aggregator
    /// constants.
    pub fn validate(&self) -> Result<()> {
        let n = self.groups.names.len();
        if n == 0 {
            bail!("at least one group must be configured");
        }
        if self.groups.counts.len() != n {
            bail!(
                "group counts ({}) and names ({}) disagree in length",
                self.groups.counts.len(),
                n
            );
        }
        if self.groups.reward_scale.len() != n {
            bail!(
                "reward scales ({}) and names ({}) disagree in length",
                self.groups.reward_scale.len(),
                n
            );
        }
        if self.groups.counts.iter().any(|&c| c == 0) {
            bail!("every group must have a non-zero example count");
        }
        if !(self.group_dro.step_size > 0.0) {
            bail!(
                "group_dro.step_size must be positive, got {}",
                self.group_dro.step_size
            );
        }
        if !(self.vrex.penalty_weight >= 0.0) {
            bail!(
                "vrex.penalty_weight must be non-negative, got {}",
                self.vrex.penalty_weight
            );
        }
        for (label, ema) in [("group_dro", self.group_dro.ema), ("vrex", self.vrex.ema)] {
            if let EmaPolicy::Fixed { coefficient } = ema {
                if !(coefficient > 0.0 && coefficient < 1.0) {
                    bail!(
                        "{label}.ema coefficient must lie in (0, 1), got {coefficient}"
                    );
                }
            }
        }
        if self.train.batch_size == 0 {
            bail!("train.batch_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        DriveDroConfig::default().validate().unwrap();
    }

    #[test]
    fn test_mismatched_counts_rejected() {
        let mut config = DriveDroConfig::default();
        config.groups.counts.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_step_size_rejected() {
        let mut config = DriveDroConfig::default();
        config.group_dro.step_size = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fixed_ema_coefficient_bounds() {
        let mut config = DriveDroConfig::default();
        config.group_dro.ema = EmaPolicy::Fixed { coefficient: 1.0 };
        assert!(config.validate().is_err());

        config.group_dro.ema = EmaPolicy::Fixed { coefficient: 0.1 };
        config.validate().unwrap();
    }

    #[test]
    fn test_negative_penalty_rejected() {
        let mut config = DriveDroConfig::default();
        config.vrex.penalty_weight = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = DriveDroConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: DriveDroConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.groups.names, config.groups.names);
        assert_eq!(parsed.scheme, config.scheme);
    }

    #[test]
    fn test_balanced_sampler_schemes() {
        assert!(TrainScheme::GroupDro.uses_balanced_sampler());
        assert!(TrainScheme::Vrex.uses_balanced_sampler());
        assert!(TrainScheme::WeightedSampling.uses_balanced_sampler());
        assert!(!TrainScheme::Erm.uses_balanced_sampler());
        assert!(!TrainScheme::WeightedReward.uses_balanced_sampler());
    }
}
