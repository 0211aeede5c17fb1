//! Sampling-side utilities for balancing groups in the data loader.
//!
//! These implement the upstream half of the robust training schemes: mapping
//! scene-type labels to group ids, computing per-example weights for a
//! balanced weighted sampler, and per-group reward scaling of losses.

use anyhow::{bail, Result};

/// Map per-example scene-type labels onto group ids in `group_names` order.
///
/// # Errors
///
/// Returns an error naming the first label that is not a configured group.
pub fn group_indices(scene_types: &[String], group_names: &[String]) -> Result<Vec<usize>> {
    scene_types
        .iter()
        .map(|label| {
            match group_names.iter().position(|name| name == label) {
                Some(g) => Ok(g),
                None => bail!("unknown scene type {label:?}"),
            }
        })
        .collect()
}

/// Per-example weights for a group-balanced weighted sampler.
///
/// Each example is weighted by the reciprocal of its group's dataset-wide
/// count, so a weighted sampler draws each group with equal probability
/// regardless of how rare it is.
pub fn sample_weights(example_groups: &[usize], group_counts: &[u64]) -> Vec<f64> {
    example_groups
        .iter()
        .map(|&g| 1.0 / group_counts[g] as f64)
        .collect()
}

/// Scale each example's loss by its group's reward multiplier.
///
/// This is the `weighted-reward` scheme: rare, hard maneuvers (e.g. turns)
/// get their losses inflated so a plain mean still attends to them.
pub fn scale_losses(losses: &[f64], group_ids: &[usize], reward_scale: &[f64]) -> Vec<f64> {
    losses
        .iter()
        .zip(group_ids.iter())
        .map(|(&loss, &g)| loss * reward_scale[g])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["straight".into(), "left".into(), "right".into()]
    }

    #[test]
    fn test_group_indices() {
        let types: Vec<String> = ["left", "straight", "left", "right"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ids = group_indices(&types, &names()).unwrap();
        assert_eq!(ids, vec![1, 0, 1, 2]);
    }

    #[test]
    fn test_group_indices_unknown_label() {
        let types = vec!["u_turn".to_string()];
        let err = group_indices(&types, &names()).unwrap_err();
        assert!(err.to_string().contains("u_turn"));
    }

    #[test]
    fn test_sample_weights_balance_groups() {
        // 4 examples of group 0 (count 4), 1 of group 1 (count 1): total
        // weight per group ends up equal, so the sampler draws groups
        // uniformly in expectation.
        let groups = vec![0, 0, 0, 0, 1];
        let weights = sample_weights(&groups, &[4, 1, 1]);
        let mass0: f64 = weights[..4].iter().sum();
        let mass1 = weights[4];
        assert!((mass0 - mass1).abs() < 1e-9);
        assert!((weights[0] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_scale_losses_targets_only_the_group() {
        let scaled = scale_losses(&[1.0, 2.0, 3.0], &[0, 1, 0], &[1.0, 19.5, 16.6]);
        assert!((scaled[0] - 1.0).abs() < 1e-9);
        assert!((scaled[1] - 39.0).abs() < 1e-9);
        assert!((scaled[2] - 3.0).abs() < 1e-9);
    }
}
