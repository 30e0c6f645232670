use crate::error::{ConsensusError, Result};
use crate::game::{CoalitionValue, ExactShapley};
use crate::partition::WorkPartitioner;
use crate::tensor::{CellScores, Metric, ScoreTensor};

/// Shapley outcome for one cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellDecision {
    /// Index of the winning query in configured order
    pub winner: usize,
    /// One contribution per query, configured order
    pub contributions: Vec<f64>,
}

/// Decisions for every cell, in cell order
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    queries: Vec<String>,
    decisions: Vec<CellDecision>,
}

impl Resolution {
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn decisions(&self) -> &[CellDecision] {
        &self.decisions
    }

    pub fn winner_name(&self, cell: usize) -> &str {
        &self.queries[self.decisions[cell].winner]
    }

    /// Number of cells won by each query
    pub fn win_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.queries.len()];
        for d in &self.decisions {
            counts[d.winner] += 1;
        }
        counts
    }
}

/// Pick the query with the largest contribution. Near-ties go to the higher
/// reassignment score, then to the earlier query.
pub fn select_winner(contributions: &[f64], cell: &CellScores<'_>, tolerance: f64) -> usize {
    let best = contributions.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<usize> = (0..contributions.len())
        .filter(|&q| contributions[q] >= best - tolerance)
        .collect();
    if tied.len() == 1 {
        return tied[0];
    }
    let best_reassign = tied
        .iter()
        .map(|&q| cell.get(q, Metric::Reassign))
        .fold(f64::NEG_INFINITY, f64::max);
    tied.iter()
        .copied()
        .find(|&q| cell.get(q, Metric::Reassign) >= best_reassign - tolerance)
        .unwrap_or(tied[0])
}

pub struct ShapleyResolver<'a, V: CoalitionValue + ?Sized> {
    value: &'a V,
    exact: ExactShapley,
    tie_tolerance: f64,
}

impl<'a, V: CoalitionValue + ?Sized> ShapleyResolver<'a, V> {
    pub fn new(value: &'a V, players: usize, max_players: usize, tie_tolerance: f64) -> Result<Self> {
        if players > max_players {
            return Err(ConsensusError::Configuration(format!(
                "{} queries exceed the configured maximum of {} for exact Shapley evaluation",
                players, max_players
            )));
        }
        Ok(Self {
            value,
            exact: ExactShapley::new(players)?,
            tie_tolerance,
        })
    }

    pub fn resolve_cell(&self, cell: &CellScores<'_>, scratch: &mut Vec<f64>) -> CellDecision {
        let mut contributions = vec![0.0; self.exact.players()];
        self.exact.compute(self.value, cell, scratch, &mut contributions);
        let winner = select_winner(&contributions, cell, self.tie_tolerance);
        CellDecision { winner, contributions }
    }

    /// Resolve every cell of the tensor, chunked over the partitioner
    pub fn resolve(&self, tensor: &ScoreTensor, partitioner: &WorkPartitioner) -> Result<Resolution> {
        if tensor.query_count() != self.exact.players() {
            return Err(ConsensusError::DataAlignment(format!(
                "score tensor has {} queries, resolver was configured for {}",
                tensor.query_count(),
                self.exact.players()
            )));
        }
        let decisions = partitioner.dispatch("shapley", tensor.cells(), tensor.cells(), |range| {
            let mut scratch = Vec::new();
            let mut out = Vec::with_capacity(range.len());
            for cell in range {
                let scores = tensor.cell(cell);
                if !scores.is_finite() {
                    return Err(ConsensusError::DataAlignment(format!(
                        "cell {} carries a non-finite metric score",
                        cell
                    )));
                }
                let decision = self.resolve_cell(&scores, &mut scratch);
                if decision.contributions.iter().any(|phi| !phi.is_finite()) {
                    return Err(ConsensusError::DataAlignment(format!(
                        "cell {} has non-finite Shapley contributions {:?}",
                        cell, decision.contributions
                    )));
                }
                out.push(decision);
            }
            Ok(out)
        })?;
        Ok(Resolution {
            queries: tensor.queries().to_vec(),
            decisions,
        })
    }
}
