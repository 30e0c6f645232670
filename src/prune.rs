//! Size-aware reconciliation of winning labels against the reference
//! partition.
//!
//! Inside each reference cluster, a winning label that covers too few of
//! the cluster's cells is folded into the cluster's dominant label. Only the
//! dominant label can grow, so a second pass finds every remaining label
//! still above threshold and changes nothing.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{ConsensusError, Result};
use crate::partition::WorkPartitioner;
use crate::table::ClusterSizes;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrunePolicy {
    min_fraction: f64,
    min_count: usize,
}

impl PrunePolicy {
    pub fn new(min_fraction: f64, min_count: usize) -> Result<Self> {
        if !min_fraction.is_finite() || !(0.0..=1.0).contains(&min_fraction) {
            return Err(ConsensusError::Configuration(format!(
                "pruning min_fraction must be between 0.0 and 1.0, current: {}",
                min_fraction
            )));
        }
        Ok(Self { min_fraction, min_count })
    }

    pub fn min_fraction(&self) -> f64 {
        self.min_fraction
    }

    pub fn min_count(&self) -> usize {
        self.min_count
    }

    /// Whether a sub-label with `count` cells in a reference cluster of
    /// `total` cells is kept as its own category
    pub fn survives(&self, count: usize, total: usize) -> bool {
        count >= self.min_count && count as f64 >= self.min_fraction * total as f64
    }
}

/// One line of the reference → choice report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    pub reference_cluster: String,
    pub choice: String,
}

#[derive(Debug)]
pub struct Pruning {
    pub pruned: Vec<String>,
    pub prefixed: Vec<String>,
    pub mapping: Vec<MappingRow>,
    /// Reference clusters in which no sub-label met the threshold
    pub warnings: Vec<ConsensusError>,
}

struct GroupOutcome {
    relabel: HashMap<String, String>,
    choices: Vec<String>,
    warning: Option<ConsensusError>,
}

pub struct PruningReconciler<'a> {
    reference: &'a str,
    policy: PrunePolicy,
    sizes: &'a ClusterSizes,
}

impl<'a> PruningReconciler<'a> {
    pub fn new(reference: &'a str, policy: PrunePolicy, sizes: &'a ClusterSizes) -> Self {
        Self { reference, policy, sizes }
    }

    /// Reference cluster size from the size table, checked against the
    /// number of cells that carry the label
    fn cluster_size(&self, cluster: &str, members: usize) -> Result<usize> {
        match self.sizes.size(self.reference, cluster) {
            Some(size) if size == members => Ok(size),
            Some(size) => Err(ConsensusError::DataAlignment(format!(
                "size table lists {} cells for {}@{} but {} cells carry that label",
                size, self.reference, cluster, members
            ))),
            None => Err(ConsensusError::DataAlignment(format!(
                "size table has no entry for {}@{}",
                self.reference, cluster
            ))),
        }
    }

    fn reconcile_group(&self, cluster: &str, total: usize, members: &[usize], labels: &[String]) -> GroupOutcome {
        // sub-labels in order of first appearance
        let mut order: Vec<&str> = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for &cell in members {
            let label = labels[cell].as_str();
            let count = counts.entry(label).or_insert(0);
            if *count == 0 {
                order.push(label);
            }
            *count += 1;
        }

        let mut dominant = order[0];
        for &label in &order[1..] {
            if counts[label] > counts[dominant] {
                dominant = label;
            }
        }

        let survivors: Vec<&str> = order
            .iter()
            .copied()
            .filter(|l| self.policy.survives(counts[l], total))
            .collect();

        let warning = if survivors.is_empty() {
            Some(ConsensusError::Reconciliation(format!(
                "no sub-label of {}@{} reaches the pruning threshold (largest: {} with {}/{} cells); keeping {}",
                self.reference, cluster, dominant, counts[dominant], total, dominant
            )))
        } else {
            None
        };

        let relabel: HashMap<String, String> = order
            .iter()
            .map(|&l| {
                let target = if survivors.contains(&l) { l } else { dominant };
                (l.to_string(), target.to_string())
            })
            .collect();

        // choices follow the pruned labels, so a second pass lists them identically
        let mut choices: Vec<String> = Vec::new();
        for &cell in members {
            let target = &relabel[&labels[cell]];
            if !choices.contains(target) {
                choices.push(target.clone());
            }
        }
        GroupOutcome {
            relabel,
            choices,
            warning,
        }
    }

    /// Prune `labels` (one per cell) within the clusters of `reference_labels`
    pub fn reconcile(
        &self,
        reference_labels: &[String],
        labels: &[String],
        partitioner: &WorkPartitioner,
    ) -> Result<Pruning> {
        if reference_labels.len() != labels.len() {
            return Err(ConsensusError::DataAlignment(format!(
                "{} reference labels for {} assigned labels",
                reference_labels.len(),
                labels.len()
            )));
        }

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (cell, label) in reference_labels.iter().enumerate() {
            groups.entry(label.as_str()).or_default().push(cell);
        }
        let groups: Vec<(&str, usize, Vec<usize>)> = groups
            .into_iter()
            .map(|(cluster, members)| -> Result<(&str, usize, Vec<usize>)> {
                let total = self.cluster_size(cluster, members.len())?;
                Ok((cluster, total, members))
            })
            .collect::<Result<_>>()?;

        let outcomes = partitioner.dispatch("prune", groups.len(), groups.len(), |range| {
            Ok(range
                .map(|g| {
                    let (cluster, total, members) = &groups[g];
                    self.reconcile_group(cluster, *total, members, labels)
                })
                .collect())
        })?;

        let mut pruned = vec![String::new(); labels.len()];
        let mut mapping = Vec::new();
        let mut warnings = Vec::new();
        for ((cluster, _, members), outcome) in groups.iter().zip(outcomes) {
            for &cell in members {
                pruned[cell] = outcome.relabel[&labels[cell]].clone();
            }
            mapping.extend(outcome.choices.into_iter().map(|choice| MappingRow {
                reference_cluster: cluster.to_string(),
                choice,
            }));
            warnings.extend(outcome.warning);
        }

        let prefixed = reference_labels
            .iter()
            .zip(labels)
            .map(|(r, l)| format!("{}@{}|{}", self.reference, r, l))
            .collect();

        Ok(Pruning {
            pruned,
            prefixed,
            mapping,
            warnings,
        })
    }
}

/// Write the `reference\tcell_cluster\tchoice` report
pub fn write_mapping(path: &Path, reference: &str, mapping: &[MappingRow]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "reference\tcell_cluster\tchoice")?;
    for row in mapping {
        writeln!(
            writer,
            "{}\t{}@{}\t{}",
            reference, reference, row.reference_cluster, row.choice
        )?;
    }
    writer.flush()?;
    Ok(())
}
