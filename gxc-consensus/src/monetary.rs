use gxc_core::{floor_to_satoshi, Coin, HALVING_INTERVAL, INITIAL_BLOCK_REWARD, MAX_SUPPLY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Adaptive monetary policy: halving base reward modulated by observed
/// inflation and the gold/GXC price ratio from the proof-of-price oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonetaryPolicy {
    /// Target annual inflation rate.
    pub target_inflation: f64,
    /// Inflation feedback gain.
    pub k1: f64,
    /// Price-ratio feedback gain.
    pub k2: f64,
    /// Burn-rate feedback gain.
    pub k3: f64,
    pub base_burn_rate: f64,
    pub target_price_ratio: f64,
    /// Share of every non-burned fee routed to the reversal fee pool before
    /// the producer is paid. Bounded to [0.10, 0.20].
    pub pool_split: f64,
    /// Blocks over which inflation is observed.
    pub measurement_window: u32,
}

impl Default for MonetaryPolicy {
    fn default() -> Self {
        Self {
            target_inflation: 0.02,
            k1: 0.1,
            k2: 0.05,
            k3: 0.2,
            base_burn_rate: 0.30,
            target_price_ratio: 20.0,
            pool_split: 0.15,
            measurement_window: 2016,
        }
    }
}

impl MonetaryPolicy {
    /// Halving schedule: 50 coins, halved every ~4 years of blocks.
    pub fn base_reward(&self, height: u32) -> Coin {
        let halvings = height / HALVING_INTERVAL;
        INITIAL_BLOCK_REWARD / 2f64.powi(halvings as i32)
    }

    /// Base reward scaled by `1 + k1(pi* - pi) + k2(r* - r)`, clamped to
    /// [0, 2 x base].
    pub fn effective_reward(&self, height: u32, observed_inflation: f64, price_ratio: f64) -> Coin {
        let base = self.base_reward(height);
        let alpha = 1.0
            + self.k1 * (self.target_inflation - observed_inflation)
            + self.k2 * (self.target_price_ratio - price_ratio);
        floor_to_satoshi((base * alpha).clamp(0.0, 2.0 * base))
    }

    /// Share of each fee destroyed, bounded to [0.1, 0.9].
    pub fn fee_burn_rate(&self, observed_inflation: f64) -> f64 {
        let rate = self.base_burn_rate * (1.0 + self.k3 * (observed_inflation - self.target_inflation));
        rate.clamp(0.1, 0.9)
    }

    pub fn pool_split(&self) -> f64 {
        self.pool_split.clamp(0.10, 0.20)
    }

    /// Mintable portion of `amount` under the supply cap; excess is
    /// truncated, never carried.
    pub fn capped_mint(&self, total_issued: Coin, amount: Coin) -> Coin {
        let headroom = (MAX_SUPPLY - total_issued).max(0.0);
        floor_to_satoshi(amount.min(headroom))
    }
}

/// Proof-of-Price oracle: per-oracle price submissions, consumed as the
/// median gold/GXC ratio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceOracle {
    submissions: HashMap<String, PriceSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSubmission {
    pub gold_price: f64,
    pub gxc_price: f64,
    pub timestamp: u64,
}

impl PriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, oracle_id: &str, gold_price: f64, gxc_price: f64, timestamp: u64) {
        if gold_price <= 0.0 || gxc_price <= 0.0 {
            return;
        }
        self.submissions.insert(
            oracle_id.to_string(),
            PriceSubmission {
                gold_price,
                gxc_price,
                timestamp,
            },
        );
    }

    /// Median of submitted gold/GXC ratios. Falls back to the reference
    /// quote (gold 2000, GXC 100) when no oracle has reported.
    pub fn price_ratio(&self) -> f64 {
        if self.submissions.is_empty() {
            return 2000.0 / 100.0;
        }
        let mut ratios: Vec<f64> = self
            .submissions
            .values()
            .map(|s| s.gold_price / s.gxc_price)
            .collect();
        ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = ratios.len() / 2;
        if ratios.len() % 2 == 1 {
            ratios[mid]
        } else {
            (ratios[mid - 1] + ratios[mid]) / 2.0
        }
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gxc_core::amounts_equal;

    #[test]
    fn halving_schedule() {
        let policy = MonetaryPolicy::default();
        assert!(amounts_equal(policy.base_reward(0), 50.0));
        assert!(amounts_equal(policy.base_reward(1), 50.0));
        assert!(amounts_equal(policy.base_reward(HALVING_INTERVAL), 25.0));
        assert!(amounts_equal(policy.base_reward(2 * HALVING_INTERVAL), 12.5));
    }

    #[test]
    fn reward_neutral_at_targets() {
        let policy = MonetaryPolicy::default();
        // On-target inflation and price ratio leave the base reward alone.
        let reward = policy.effective_reward(1, 0.02, 20.0);
        assert!(amounts_equal(reward, 50.0));
    }

    #[test]
    fn reward_reacts_and_clamps() {
        let policy = MonetaryPolicy::default();
        // Inflation below target pushes the reward up.
        let up = policy.effective_reward(1, 0.0, 20.0);
        assert!(up > 50.0);
        // An extreme price ratio cannot more than double the reward.
        let capped = policy.effective_reward(1, 0.02, -1000.0);
        assert!(amounts_equal(capped, 100.0));
        // Nor drive it negative.
        let floored = policy.effective_reward(1, 0.02, 1000.0);
        assert!(amounts_equal(floored, 0.0));
    }

    #[test]
    fn burn_rate_bounds() {
        let policy = MonetaryPolicy::default();
        assert!((policy.fee_burn_rate(0.02) - 0.30).abs() < 1e-12);
        assert!(policy.fee_burn_rate(100.0) <= 0.9);
        assert!(policy.fee_burn_rate(-100.0) >= 0.1);
    }

    #[test]
    fn supply_cap_truncates() {
        let policy = MonetaryPolicy::default();
        assert!(amounts_equal(policy.capped_mint(MAX_SUPPLY - 10.0, 50.0), 10.0));
        assert!(amounts_equal(policy.capped_mint(MAX_SUPPLY, 50.0), 0.0));
        assert!(amounts_equal(policy.capped_mint(0.0, 50.0), 50.0));
    }

    #[test]
    fn oracle_median() {
        let mut oracle = PriceOracle::new();
        assert!((oracle.price_ratio() - 20.0).abs() < 1e-12);
        oracle.submit("a", 2000.0, 100.0, 1);
        oracle.submit("b", 2100.0, 100.0, 2);
        oracle.submit("c", 4000.0, 100.0, 3);
        assert!((oracle.price_ratio() - 21.0).abs() < 1e-12);
        // Bad quotes are ignored.
        oracle.submit("d", -5.0, 100.0, 4);
        assert_eq!(oracle.submission_count(), 3);
    }
}
