//! End-to-end consensus run: tensor → Shapley → assignment → pruning.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::assign::{build_assignment, Assignment};
use crate::config::RunConfig;
use crate::error::{ConsensusError, Result};
use crate::partition::WorkPartitioner;
use crate::prune::{Pruning, PruningReconciler};
use crate::resolve::{Resolution, ShapleyResolver};
use crate::table::{CellTable, ClusterSizes, ScoreTable};
use crate::tensor::{Metric, MissingScore, ScoreTensor, ScoreTensorBuilder};
use crate::Logger;

pub struct RunOutput {
    pub tensor: ScoreTensor,
    pub missing: Vec<MissingScore>,
    pub resolution: Resolution,
    pub assignment: Assignment,
    pub pruning: Pruning,
}

/// Checks that tie the configuration to a concrete cell table
fn check_against_table(config: &RunConfig, table: &CellTable) -> Result<()> {
    if !table.has_partition(&config.reference) {
        return Err(ConsensusError::Configuration(format!(
            "reference '{}' is neither a column of the cell table nor resolvable from the queries",
            config.reference
        )));
    }
    for q in &config.queries {
        if !table.has_partition(q) {
            return Err(ConsensusError::DataAlignment(format!(
                "query '{}' has no label column in the cell table",
                q
            )));
        }
    }
    if table.is_empty() {
        return Err(ConsensusError::DataAlignment("cell table has no cells".into()));
    }
    Ok(())
}

pub fn run_consensus(
    config: &RunConfig,
    table: &CellTable,
    scores: &ScoreTable,
    partitioner: &WorkPartitioner,
    logger: &mut Logger,
) -> Result<RunOutput> {
    config.validate()?;
    check_against_table(config, table)?;
    let aggregation = config.aggregation()?;
    let policy = config.prune_policy()?;
    let resolver = ShapleyResolver::new(
        &aggregation,
        config.queries.len(),
        config.max_players,
        config.tie_tolerance,
    )?;

    let mut size_partitions = config.queries.clone();
    if !size_partitions.contains(&config.reference) {
        size_partitions.push(config.reference.clone());
    }
    let sizes = ClusterSizes::from_table(table, &size_partitions)?;
    for name in &size_partitions {
        logger.log(&format!("Partition {}: {} clusters", name, sizes.clusters(name).count()))?;
    }

    logger.log("Building score tensor...")?;
    let build = ScoreTensorBuilder::new(table, scores, &config.queries).build(partitioner)?;
    if build.tensor.cells() != table.len() {
        return Err(ConsensusError::DataAlignment(format!(
            "score tensor has {} cells, cell table has {}",
            build.tensor.cells(),
            table.len()
        )));
    }
    for m in &build.missing {
        logger.warn(&format!(
            "No score recorded for {}@{} ({} cells); using neutral scores (0 after orientation)",
            m.query, m.cluster, m.cells
        ))?;
    }

    logger.log(&format!(
        "Computing exact Shapley values: {} cells, {} queries, {} coalitions per cell, rule {}",
        table.len(),
        config.queries.len(),
        1usize << config.queries.len(),
        aggregation.rule
    ))?;
    let resolution = resolver.resolve(&build.tensor, partitioner)?;
    for (q, wins) in config.queries.iter().zip(resolution.win_counts()) {
        logger.log(&format!("Query {} wins {} cells", q, wins))?;
    }

    let assignment = build_assignment(&resolution, table, partitioner)?;

    logger.log(&format!(
        "Pruning against reference {} (min_fraction={}, min_count={})",
        config.reference,
        policy.min_fraction(),
        policy.min_count()
    ))?;
    let reference_labels = table.require(&config.reference)?;
    let pruning = PruningReconciler::new(&config.reference, policy, &sizes).reconcile(
        reference_labels,
        &assignment.raw,
        partitioner,
    )?;
    for w in &pruning.warnings {
        logger.warn(&w.to_string())?;
    }
    logger.log(&format!("Reference mapping has {} rows", pruning.mapping.len()))?;

    Ok(RunOutput {
        tensor: build.tensor,
        missing: build.missing,
        resolution,
        assignment,
        pruning,
    })
}

/// Write the per-cell table with every derived column
pub fn write_annotated_table(path: &Path, table: &CellTable, output: &RunOutput) -> Result<()> {
    let queries = output.tensor.queries();
    let mut writer = BufWriter::new(File::create(path)?);

    let mut header: Vec<String> = vec!["cell".to_string()];
    header.extend(table.partitions().iter().cloned());
    for q in queries {
        for metric in Metric::ALL {
            header.push(format!("{}@{}", metric.column_name(), q));
        }
    }
    for q in queries {
        header.push(format!("{}_shapley", q));
    }
    header.extend(
        ["final_annotation", "raw", "pruned", "prefixed"]
            .iter()
            .map(|s| s.to_string()),
    );
    writeln!(writer, "{}", header.join("\t"))?;

    let columns: Vec<&[String]> = table
        .partitions()
        .iter()
        .map(|p| table.require(p))
        .collect::<Result<_>>()?;
    for (cell, id) in table.cells().iter().enumerate() {
        let mut fields: Vec<String> = Vec::with_capacity(header.len());
        fields.push(id.clone());
        fields.extend(columns.iter().map(|c| c[cell].clone()));
        let scores = output.tensor.cell(cell);
        for q in 0..queries.len() {
            fields.extend(scores.vector(q).iter().map(|v| format!("{:.6}", v)));
        }
        let decision = &output.resolution.decisions()[cell];
        fields.extend(decision.contributions.iter().map(|v| format!("{:.6}", v)));
        fields.push(output.assignment.final_annotation[cell].clone());
        fields.push(output.assignment.raw[cell].clone());
        fields.push(output.pruning.pruned[cell].clone());
        fields.push(output.pruning.prefixed[cell].clone());
        writeln!(writer, "{}", fields.join("\t"))?;
    }
    writer.flush()?;
    Ok(())
}
