use crate::error::{ConsensusError, Result};
use crate::partition::WorkPartitioner;
use crate::resolve::Resolution;
use crate::table::CellTable;

/// Winning query and its `query@cluster` label for every cell
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub final_annotation: Vec<String>,
    pub raw: Vec<String>,
}

/// Join each cell's winning query with that query's cluster label
pub fn build_assignment(
    resolution: &Resolution,
    table: &CellTable,
    partitioner: &WorkPartitioner,
) -> Result<Assignment> {
    if resolution.len() != table.len() {
        return Err(ConsensusError::DataAlignment(format!(
            "{} Shapley decisions for {} cells",
            resolution.len(),
            table.len()
        )));
    }
    let columns: Vec<&[String]> = resolution
        .queries()
        .iter()
        .map(|q| table.require(q))
        .collect::<Result<_>>()?;

    let rows = partitioner.dispatch("assign", table.len(), table.len(), |range| {
        Ok(range
            .map(|cell| {
                let winner = resolution.decisions()[cell].winner;
                let name = resolution.winner_name(cell);
                let raw = format!("{}@{}", name, columns[winner][cell]);
                (name.to_string(), raw)
            })
            .collect())
    })?;

    let (final_annotation, raw) = rows.into_iter().unzip();
    Ok(Assignment { final_annotation, raw })
}
