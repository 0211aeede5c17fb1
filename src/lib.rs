//! drivedro: a training driver for a motion-planning model under
//! distributionally-robust-optimization (DRO) schemes.
//!
//! The crate centres on two stateful loss aggregators that turn a batch of
//! per-example losses plus group ids into a single scalar training loss:
//!
//! - [`loss::GroupLossAggregator`] -- Group-DRO, an adversarially reweighted
//!   worst-case loss over groups.
//! - [`loss::RiskExtrapolationAggregator`] -- V-REx, mean group loss plus a
//!   variance penalty across groups.
//!
//! Everything else (sampling utilities, the synthetic training loop) is glue
//! around that core.

pub mod config;
pub mod driver;
pub mod loss;
pub mod sampling;
