//! Dense cells × queries × metrics score tensor.
//!
//! Scores are cluster-level: every cell of a cluster gets the cluster's
//! vector. Layout is row-major `[cell][query][metric]` so that the resolver
//! reads one contiguous block per cell.

use std::collections::BTreeMap;

use crate::error::{ConsensusError, Result};
use crate::partition::WorkPartitioner;
use crate::table::{CellTable, ScoreTable};

pub const METRIC_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Reassign,
    Tfidf,
    Sccaf,
    Doublet,
}

impl Metric {
    pub const ALL: [Metric; METRIC_COUNT] = [Metric::Reassign, Metric::Tfidf, Metric::Sccaf, Metric::Doublet];

    pub fn index(self) -> usize {
        match self {
            Metric::Reassign => 0,
            Metric::Tfidf => 1,
            Metric::Sccaf => 2,
            Metric::Doublet => 3,
        }
    }

    /// Column name used in the score table and the annotated output
    pub fn column_name(self) -> &'static str {
        match self {
            Metric::Reassign => "reassign",
            Metric::Tfidf => "tfidf",
            Metric::Sccaf => "SCCAF",
            Metric::Doublet => "doublet",
        }
    }

    pub fn higher_is_better(self) -> bool {
        !matches!(self, Metric::Doublet)
    }

    /// Map a raw score onto a higher-is-better scale
    pub fn orient(self, raw: f64) -> f64 {
        if self.higher_is_better() {
            raw
        } else {
            1.0 - raw
        }
    }

    /// Raw value that orients to 0; stands in for a cluster with no score
    pub fn neutral(self) -> f64 {
        if self.higher_is_better() {
            0.0
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTensor {
    cells: usize,
    queries: Vec<String>,
    data: Vec<f64>,
}

impl ScoreTensor {
    /// Wrap an already laid out `[cell][query][metric]` buffer
    pub fn from_raw(queries: Vec<String>, cells: usize, data: Vec<f64>) -> Result<Self> {
        let expected = cells * queries.len() * METRIC_COUNT;
        if data.len() != expected {
            return Err(ConsensusError::DataAlignment(format!(
                "score tensor holds {} values, expected {} cells x {} queries x {} metrics = {}",
                data.len(),
                cells,
                queries.len(),
                METRIC_COUNT,
                expected
            )));
        }
        Ok(Self { cells, queries, data })
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn cell(&self, cell: usize) -> CellScores<'_> {
        let width = self.queries.len() * METRIC_COUNT;
        CellScores {
            values: &self.data[cell * width..(cell + 1) * width],
        }
    }
}

/// Read-only view of one cell's query × metric block
#[derive(Debug, Clone, Copy)]
pub struct CellScores<'a> {
    values: &'a [f64],
}

impl<'a> CellScores<'a> {
    #[cfg(test)]
    pub fn new(values: &'a [f64]) -> Self {
        debug_assert!(values.len() % METRIC_COUNT == 0);
        Self { values }
    }

    pub fn get(&self, query: usize, metric: Metric) -> f64 {
        self.values[query * METRIC_COUNT + metric.index()]
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn vector(&self, query: usize) -> &'a [f64] {
        &self.values[query * METRIC_COUNT..(query + 1) * METRIC_COUNT]
    }
}

/// A (query, cluster) with no score entry; its cells were given neutral scores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingScore {
    pub query: String,
    pub cluster: String,
    pub cells: usize,
}

pub struct TensorBuild {
    pub tensor: ScoreTensor,
    pub missing: Vec<MissingScore>,
}

pub struct ScoreTensorBuilder<'a> {
    table: &'a CellTable,
    scores: &'a ScoreTable,
    queries: &'a [String],
}

impl<'a> ScoreTensorBuilder<'a> {
    pub fn new(table: &'a CellTable, scores: &'a ScoreTable, queries: &'a [String]) -> Self {
        Self { table, scores, queries }
    }

    /// Broadcast cluster scores to cells, one task per query.
    pub fn build(&self, partitioner: &WorkPartitioner) -> Result<TensorBuild> {
        let cells = self.table.len();
        let k = self.queries.len();
        let columns: Vec<&[String]> = self
            .queries
            .iter()
            .map(|q| self.table.require(q))
            .collect::<Result<_>>()?;

        let per_query = partitioner.dispatch("score tensor", k, k, |range| {
            let mut out = Vec::with_capacity(range.len());
            for q in range {
                let name = &self.queries[q];
                let cluster_scores = self.scores.query(name);
                let neutral = Metric::ALL.map(Metric::neutral);
                let mut column = Vec::with_capacity(cells);
                let mut missing: BTreeMap<&str, usize> = BTreeMap::new();
                for label in columns[q] {
                    match cluster_scores.and_then(|s| s.get(label)) {
                        Some(vector) => column.push(*vector),
                        None => {
                            *missing.entry(label.as_str()).or_insert(0) += 1;
                            column.push(neutral);
                        }
                    }
                }
                let missing: Vec<MissingScore> = missing
                    .into_iter()
                    .map(|(cluster, n)| MissingScore {
                        query: name.clone(),
                        cluster: cluster.to_string(),
                        cells: n,
                    })
                    .collect();
                out.push((column, missing));
            }
            Ok(out)
        })?;

        let mut data = vec![0.0; cells * k * METRIC_COUNT];
        let mut all_missing = Vec::new();
        for (q, (column, missing)) in per_query.into_iter().enumerate() {
            if column.len() != cells {
                return Err(ConsensusError::DataAlignment(format!(
                    "query '{}' produced {} score rows for {} cells",
                    self.queries[q],
                    column.len(),
                    cells
                )));
            }
            for (cell, vector) in column.iter().enumerate() {
                let offset = (cell * k + q) * METRIC_COUNT;
                data[offset..offset + METRIC_COUNT].copy_from_slice(vector);
            }
            all_missing.extend(missing);
        }

        Ok(TensorBuild {
            tensor: ScoreTensor::from_raw(self.queries.to_vec(), cells, data)?,
            missing: all_missing,
        })
    }
}
