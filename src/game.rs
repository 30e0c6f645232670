//! Cooperative game played by the queries of a single cell.
//!
//! Players are the queries in configured order; a coalition is a bitmask
//! over that order. The payoff of a coalition comes from a
//! [`CoalitionValue`] strategy and the Shapley value is computed exactly
//! over all `2^k` coalitions, which is why the player count is capped.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{ConsensusError, Result};
use crate::tensor::{CellScores, Metric, METRIC_COUNT};

/// Largest query count the exact enumeration accepts
pub const PLAYER_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Coalition(u32);

impl Coalition {
    pub fn from_bits(bits: u32) -> Self {
        Coalition(bits)
    }

    pub fn grand(players: usize) -> Self {
        debug_assert!(players <= PLAYER_LIMIT);
        Coalition(((1u64 << players) - 1) as u32)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, player: usize) -> bool {
        self.0 & (1 << player) != 0
    }

    pub fn with(self, player: usize) -> Self {
        Coalition(self.0 | (1 << player))
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Member indices in increasing order
    pub fn members(self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..32usize).filter(move |&p| bits & (1 << p) != 0)
    }
}

/// Payoff of a coalition of queries for one cell.
///
/// Implementations must be pure functions of `(cell, coalition)`, return 0
/// for the empty coalition and never decrease when a query joins.
pub trait CoalitionValue: Sync {
    fn value(&self, cell: &CellScores<'_>, coalition: Coalition) -> f64;
}

impl<F> CoalitionValue for F
where
    F: Fn(&CellScores<'_>, Coalition) -> f64 + Sync,
{
    fn value(&self, cell: &CellScores<'_>, coalition: Coalition) -> f64 {
        self(cell, coalition)
    }
}

/// Non-negative per-metric weights, indexed like [`Metric::ALL`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricWeights([f64; METRIC_COUNT]);

impl Default for MetricWeights {
    fn default() -> Self {
        MetricWeights([1.0, 1.0, 1.0, 0.0])
    }
}

impl MetricWeights {
    pub fn new(weights: [f64; METRIC_COUNT]) -> Result<Self> {
        for metric in Metric::ALL {
            let w = weights[metric.index()];
            if !w.is_finite() || w < 0.0 {
                return Err(ConsensusError::Configuration(format!(
                    "weight for metric '{}' must be a finite non-negative number, got {}",
                    metric.column_name(),
                    w
                )));
            }
        }
        if weights.iter().all(|&w| w == 0.0) {
            return Err(ConsensusError::Configuration(
                "at least one metric weight must be positive".into(),
            ));
        }
        Ok(MetricWeights(weights))
    }

    pub fn get(&self, metric: Metric) -> f64 {
        self.0[metric.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationRule {
    /// Each metric is credited with the best score any member brings
    MaxPooled,
    /// Every member's scores are added up
    Additive,
}

impl FromStr for AggregationRule {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "max-pooled" | "max_pooled" | "max" => Ok(AggregationRule::MaxPooled),
            "additive" | "sum" => Ok(AggregationRule::Additive),
            _ => Err(format!(
                "Unknown aggregation rule: {}. Supported rules: max-pooled, additive",
                s
            )),
        }
    }
}

impl fmt::Display for AggregationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationRule::MaxPooled => write!(f, "max-pooled"),
            AggregationRule::Additive => write!(f, "additive"),
        }
    }
}

/// Built-in value functions over the oriented, zero-floored metric scores
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregation {
    pub rule: AggregationRule,
    pub weights: MetricWeights,
}

impl Aggregation {
    pub fn new(rule: AggregationRule, weights: MetricWeights) -> Self {
        Self { rule, weights }
    }
}

impl Default for Aggregation {
    fn default() -> Self {
        Self::new(AggregationRule::MaxPooled, MetricWeights::default())
    }
}

impl CoalitionValue for Aggregation {
    fn value(&self, cell: &CellScores<'_>, coalition: Coalition) -> f64 {
        if coalition.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for metric in Metric::ALL {
            let w = self.weights.get(metric);
            if w == 0.0 {
                continue;
            }
            let scores = coalition.members().map(|q| metric.orient(cell.get(q, metric)).max(0.0));
            let pooled = match self.rule {
                AggregationRule::MaxPooled => scores.fold(0.0, f64::max),
                AggregationRule::Additive => scores.sum::<f64>(),
            };
            total += w * pooled;
        }
        total
    }
}

/// Exact Shapley evaluation for a fixed player count.
///
/// `size_weights[s] = s! (k-s-1)! / k!`, the weight of a coalition of size
/// `s` not containing the player.
#[derive(Debug, Clone)]
pub struct ExactShapley {
    players: usize,
    size_weights: Vec<f64>,
}

impl ExactShapley {
    pub fn new(players: usize) -> Result<Self> {
        if players == 0 {
            return Err(ConsensusError::Configuration(
                "Shapley evaluation needs at least one query".into(),
            ));
        }
        if players > PLAYER_LIMIT {
            return Err(ConsensusError::Configuration(format!(
                "{} queries exceed the exact Shapley limit of {}",
                players, PLAYER_LIMIT
            )));
        }
        // s!(k-1-s)!/k! == 1 / (k * C(k-1, s))
        let mut size_weights = Vec::with_capacity(players);
        let mut binom = 1.0f64;
        for s in 0..players {
            size_weights.push(1.0 / (players as f64 * binom));
            binom = binom * (players - 1 - s) as f64 / (s + 1) as f64;
        }
        Ok(Self { players, size_weights })
    }

    pub fn players(&self) -> usize {
        self.players
    }

    /// Shapley value of every query for one cell. `coalition_values` is a
    /// scratch buffer reused across cells; `out` must hold `players` slots.
    pub fn compute<V: CoalitionValue + ?Sized>(
        &self,
        value: &V,
        cell: &CellScores<'_>,
        coalition_values: &mut Vec<f64>,
        out: &mut [f64],
    ) {
        let k = self.players;
        let n_coalitions = Coalition::grand(k).bits() as usize + 1;
        coalition_values.clear();
        coalition_values.resize(n_coalitions, 0.0);
        // v(empty) is 0 by definition
        for bits in 1..n_coalitions {
            coalition_values[bits] = value.value(cell, Coalition::from_bits(bits as u32));
        }

        out[..k].iter_mut().for_each(|phi| *phi = 0.0);
        for bits in 0..n_coalitions {
            let coalition = Coalition::from_bits(bits as u32);
            let weight = self.size_weights.get(coalition.len()).copied().unwrap_or(0.0);
            let base = coalition_values[bits];
            for (player, phi) in out[..k].iter_mut().enumerate() {
                if coalition.contains(player) {
                    continue;
                }
                *phi += weight * (coalition_values[coalition.with(player).bits() as usize] - base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn shapley<V: CoalitionValue>(value: &V, values: &[f64]) -> Vec<f64> {
        let cell = CellScores::new(values);
        let k = values.len() / METRIC_COUNT;
        let exact = ExactShapley::new(k).unwrap();
        let mut scratch = Vec::new();
        let mut out = vec![0.0; k];
        exact.compute(value, &cell, &mut scratch, &mut out);
        out
    }

    fn random_cell(rng: &mut StdRng, k: usize) -> Vec<f64> {
        (0..k * METRIC_COUNT).map(|_| rng.gen_range(0.0..1.0)).collect()
    }

    #[test]
    fn test_size_weights_sum_per_player() {
        // sum over all coalitions without the player of their weight is 1
        for k in 1..=PLAYER_LIMIT {
            let exact = ExactShapley::new(k).unwrap();
            let mut total = 0.0;
            let mut binom = 1.0;
            for s in 0..k {
                total += binom * exact.size_weights[s];
                binom = binom * (k - 1 - s) as f64 / (s + 1) as f64;
            }
            assert!((total - 1.0).abs() < 1e-12, "k={} total={}", k, total);
        }
        let three = ExactShapley::new(3).unwrap();
        assert!((three.size_weights[0] - 1.0 / 3.0).abs() < 1e-15);
        assert!((three.size_weights[1] - 1.0 / 6.0).abs() < 1e-15);
        assert!((three.size_weights[2] - 1.0 / 3.0).abs() < 1e-15);
    }

    #[test]
    fn test_player_limit_is_enforced() {
        assert!(matches!(
            ExactShapley::new(PLAYER_LIMIT + 1),
            Err(ConsensusError::Configuration(_))
        ));
        assert!(ExactShapley::new(0).is_err());
    }

    #[test]
    fn test_efficiency() {
        let mut rng = StdRng::seed_from_u64(7);
        for rule in [AggregationRule::MaxPooled, AggregationRule::Additive] {
            let game = Aggregation::new(rule, MetricWeights::new([1.0, 0.5, 2.0, 1.0]).unwrap());
            for k in 1..=6 {
                let values = random_cell(&mut rng, k);
                let phi = shapley(&game, &values);
                let grand = game.value(&CellScores::new(&values), Coalition::grand(k));
                let sum: f64 = phi.iter().sum();
                assert!((sum - grand).abs() < 1e-9, "rule={} k={} sum={} grand={}", rule, k, sum, grand);
            }
        }
    }

    #[test]
    fn test_symmetry() {
        let mut rng = StdRng::seed_from_u64(11);
        let game = Aggregation::default();
        for _ in 0..20 {
            let mut values = random_cell(&mut rng, 4);
            // query 3 copies query 1
            let copy: Vec<f64> = values[METRIC_COUNT..2 * METRIC_COUNT].to_vec();
            values[3 * METRIC_COUNT..4 * METRIC_COUNT].copy_from_slice(&copy);
            let phi = shapley(&game, &values);
            assert!((phi[1] - phi[3]).abs() < 1e-12, "{:?}", phi);
        }
    }

    #[test]
    fn test_null_player() {
        // query 1 never changes any coalition's value
        fn ignores_query_one(cell: &CellScores<'_>, coalition: Coalition) -> f64 {
            coalition
                .members()
                .filter(|&q| q != 1)
                .map(|q| cell.get(q, Metric::Reassign))
                .fold(0.0, f64::max)
        }
        let game = ignores_query_one;
        let values = vec![
            0.7, 0.0, 0.0, 0.0, //
            0.99, 0.0, 0.0, 0.0, //
            0.3, 0.0, 0.0, 0.0,
        ];
        let phi = shapley(&game, &values);
        assert!(phi[1].abs() < 1e-15);
        assert!((phi[0] + phi[2] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_additive_gives_own_score() {
        let weights = MetricWeights::new([1.0, 0.0, 0.0, 0.0]).unwrap();
        let game = Aggregation::new(AggregationRule::Additive, weights);
        let values = vec![
            0.4, 0.9, 0.9, 0.9, //
            0.1, 0.9, 0.9, 0.9,
        ];
        let phi = shapley(&game, &values);
        assert!((phi[0] - 0.4).abs() < 1e-12);
        assert!((phi[1] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_max_pooled_known_values() {
        // max game over a=0.9, b=0.5, c=0.8 on a single metric
        let weights = MetricWeights::new([1.0, 0.0, 0.0, 0.0]).unwrap();
        let game = Aggregation::new(AggregationRule::MaxPooled, weights);
        let values = vec![
            0.9, 0.0, 0.0, 0.0, //
            0.5, 0.0, 0.0, 0.0, //
            0.8, 0.0, 0.0, 0.0,
        ];
        let phi = shapley(&game, &values);
        assert!((phi[1] - 0.5 / 3.0).abs() < 1e-12);
        assert!((phi[2] - (0.5 / 3.0 + 0.15)).abs() < 1e-12);
        assert!((phi[0] - (0.5 / 3.0 + 0.15 + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_doublet_counts_against_a_query() {
        let weights = MetricWeights::new([0.0, 0.0, 0.0, 1.0]).unwrap();
        let game = Aggregation::new(AggregationRule::MaxPooled, weights);
        let values = vec![
            0.0, 0.0, 0.0, 0.6, //
            0.0, 0.0, 0.0, 0.1,
        ];
        let phi = shapley(&game, &values);
        assert!(phi[1] > phi[0]);
    }

    #[test]
    fn test_monotone_builtins() {
        let mut rng = StdRng::seed_from_u64(3);
        let values = random_cell(&mut rng, 5);
        let cell = CellScores::new(&values);
        for rule in [AggregationRule::MaxPooled, AggregationRule::Additive] {
            let game = Aggregation::new(rule, MetricWeights::default());
            assert_eq!(game.value(&cell, Coalition::default()), 0.0);
            for bits in 0..32u32 {
                let s = Coalition::from_bits(bits);
                for q in 0..5 {
                    assert!(game.value(&cell, s.with(q)) >= game.value(&cell, s));
                }
            }
        }
    }

    #[test]
    fn test_weights_validation() {
        assert!(MetricWeights::new([1.0, -0.1, 0.0, 0.0]).is_err());
        assert!(MetricWeights::new([f64::NAN, 1.0, 0.0, 0.0]).is_err());
        assert!(MetricWeights::new([0.0; METRIC_COUNT]).is_err());
    }

    #[test]
    fn test_rule_parsing() {
        assert_eq!("Max-Pooled".parse::<AggregationRule>().unwrap(), AggregationRule::MaxPooled);
        assert_eq!("additive".parse::<AggregationRule>().unwrap(), AggregationRule::Additive);
        assert!("median".parse::<AggregationRule>().is_err());
    }

    #[test]
    fn test_coalition_members() {
        let s = Coalition::default().with(0).with(3);
        assert_eq!(s.members().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(s.len(), 2);
        assert!(!s.contains(1));
        assert_eq!(Coalition::grand(3).bits(), 0b111);
    }
}
