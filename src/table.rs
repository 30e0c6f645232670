//! Per-cell input table, per-cluster score table and the cluster-size table
//! derived from them. All three are read-only once loaded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{ConsensusError, Result};
use crate::tensor::{Metric, METRIC_COUNT};

/// Cell ids plus one label column per partition, in file order
#[derive(Debug, Clone)]
pub struct CellTable {
    cells: Vec<String>,
    partitions: Vec<String>,
    labels: Vec<Vec<String>>,
}

impl CellTable {
    pub fn new(cells: Vec<String>, columns: Vec<(String, Vec<String>)>) -> Result<Self> {
        let mut partitions = Vec::with_capacity(columns.len());
        let mut labels = Vec::with_capacity(columns.len());
        let mut seen = HashSet::new();
        for (name, column) in columns {
            if !seen.insert(name.clone()) {
                return Err(ConsensusError::DataAlignment(format!(
                    "partition column '{}' appears more than once",
                    name
                )));
            }
            if column.len() != cells.len() {
                return Err(ConsensusError::DataAlignment(format!(
                    "partition '{}' has {} labels but the table has {} cells",
                    name,
                    column.len(),
                    cells.len()
                )));
            }
            if let Some(idx) = column.iter().position(|l| l.is_empty()) {
                return Err(ConsensusError::DataAlignment(format!(
                    "partition '{}' has an empty label for cell '{}'",
                    name, cells[idx]
                )));
            }
            partitions.push(name);
            labels.push(column);
        }
        Ok(Self { cells, partitions, labels })
    }

    /// Load a tab-delimited table: `cell<TAB>partition_1<TAB>...`
    pub fn read_tsv(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => {
                return Err(ConsensusError::DataAlignment(format!(
                    "cell table is empty: {}",
                    path.display()
                )))
            }
        };
        let header_fields: Vec<String> = header
            .trim_end_matches('\r')
            .split('\t')
            .map(|s| s.trim().to_string())
            .collect();
        if header_fields.len() < 2 {
            return Err(ConsensusError::DataAlignment(
                "cell table needs a cell id column and at least one partition column".into(),
            ));
        }

        let mut cells = Vec::new();
        let mut columns: Vec<Vec<String>> = vec![Vec::new(); header_fields.len() - 1];
        for (line_no, line) in lines.enumerate() {
            let l = line?;
            let l = l.trim_end_matches('\r');
            if l.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = l.split('\t').collect();
            if fields.len() != header_fields.len() {
                return Err(ConsensusError::DataAlignment(format!(
                    "cell table line {} has {} fields, header has {}",
                    line_no + 2,
                    fields.len(),
                    header_fields.len()
                )));
            }
            cells.push(fields[0].trim().to_string());
            for (col, value) in columns.iter_mut().zip(&fields[1..]) {
                col.push(value.trim().to_string());
            }
        }

        let named = header_fields.into_iter().skip(1).zip(columns).collect();
        Self::new(cells, named)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.partitions.iter().any(|p| p == name)
    }

    pub fn partition(&self, name: &str) -> Option<&[String]> {
        self.partitions
            .iter()
            .position(|p| p == name)
            .map(|idx| self.labels[idx].as_slice())
    }

    /// Like [`CellTable::partition`] but a missing column is an alignment error
    pub fn require(&self, name: &str) -> Result<&[String]> {
        self.partition(name).ok_or_else(|| {
            ConsensusError::DataAlignment(format!("cell table has no column for partition '{}'", name))
        })
    }
}

/// Metric vectors for every cluster of one query
pub type ClusterScores = HashMap<String, [f64; METRIC_COUNT]>;

/// Per-(query, cluster) metric scores as delivered by the metric collaborators
#[derive(Debug, Clone, Default)]
pub struct ScoreTable {
    queries: BTreeMap<String, ClusterScores>,
}

impl ScoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, query: &str, cluster: &str, scores: [f64; METRIC_COUNT]) -> Result<()> {
        let clusters = self.queries.entry(query.to_string()).or_default();
        if clusters.insert(cluster.to_string(), scores).is_some() {
            return Err(ConsensusError::DataAlignment(format!(
                "duplicate score entry for {}@{}",
                query, cluster
            )));
        }
        Ok(())
    }

    pub fn query(&self, query: &str) -> Option<&ClusterScores> {
        self.queries.get(query)
    }

    /// Load `query<TAB>cluster<TAB>reassign<TAB>tfidf<TAB>SCCAF<TAB>doublet`
    pub fn read_tsv(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => {
                return Err(ConsensusError::DataAlignment(format!(
                    "score table is empty: {}",
                    path.display()
                )))
            }
        };
        let header_fields: Vec<&str> = header.trim_end_matches('\r').split('\t').map(str::trim).collect();
        let expected: Vec<&str> = ["query", "cluster"]
            .into_iter()
            .chain(Metric::ALL.iter().map(|m| m.column_name()))
            .collect();
        if header_fields != expected {
            return Err(ConsensusError::DataAlignment(format!(
                "score table header must be '{}', found '{}'",
                expected.join("\\t"),
                header_fields.join("\\t")
            )));
        }

        let mut table = Self::new();
        for (line_no, line) in lines.enumerate() {
            let l = line?;
            let l = l.trim_end_matches('\r');
            if l.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = l.split('\t').map(str::trim).collect();
            if fields.len() != expected.len() {
                return Err(ConsensusError::DataAlignment(format!(
                    "score table line {} has {} fields, expected {}",
                    line_no + 2,
                    fields.len(),
                    expected.len()
                )));
            }
            let mut scores = [0.0; METRIC_COUNT];
            for (slot, raw) in scores.iter_mut().zip(&fields[2..]) {
                *slot = raw.parse::<f64>().map_err(|_| {
                    ConsensusError::DataAlignment(format!(
                        "score table line {}: '{}' is not a number",
                        line_no + 2,
                        raw
                    ))
                })?;
            }
            table.insert(fields[0], fields[1], scores)?;
        }
        Ok(table)
    }
}

/// Cell count of every cluster of every partition
#[derive(Debug, Clone, Default)]
pub struct ClusterSizes {
    sizes: BTreeMap<String, BTreeMap<String, usize>>,
}

impl ClusterSizes {
    pub fn from_table(table: &CellTable, partitions: &[String]) -> Result<Self> {
        let mut sizes = BTreeMap::new();
        for name in partitions {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for label in table.require(name)? {
                *counts.entry(label.clone()).or_insert(0) += 1;
            }
            sizes.insert(name.clone(), counts);
        }
        Ok(Self { sizes })
    }

    pub fn size(&self, partition: &str, cluster: &str) -> Option<usize> {
        self.sizes.get(partition).and_then(|c| c.get(cluster)).copied()
    }

    pub fn clusters(&self, partition: &str) -> impl Iterator<Item = (&String, &usize)> {
        self.sizes.get(partition).into_iter().flat_map(|c| c.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cell_table_rejects_short_column() {
        let result = CellTable::new(
            labels(&["c1", "c2"]),
            vec![("A".to_string(), labels(&["x"]))],
        );
        assert!(matches!(result, Err(ConsensusError::DataAlignment(_))));
    }

    #[test]
    fn test_cell_table_rejects_empty_label() {
        let result = CellTable::new(
            labels(&["c1", "c2"]),
            vec![("A".to_string(), labels(&["x", ""]))],
        );
        assert!(matches!(result, Err(ConsensusError::DataAlignment(_))));
    }

    #[test]
    fn test_read_cell_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cell\tA\tB").unwrap();
        writeln!(file, "c1\tx\tz").unwrap();
        writeln!(file, "c2\ty\tz\r").unwrap();
        let table = CellTable::read_tsv(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.partitions(), &["A".to_string(), "B".to_string()]);
        assert_eq!(table.partition("A").unwrap(), &["x".to_string(), "y".to_string()]);
        assert_eq!(table.partition("B").unwrap()[1], "z");
        assert!(table.partition("C").is_none());
    }

    #[test]
    fn test_read_score_table_and_duplicates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "query\tcluster\treassign\ttfidf\tSCCAF\tdoublet").unwrap();
        writeln!(file, "A\tx\t0.9\t0.5\t0.7\t0.1").unwrap();
        writeln!(file, "A\ty\t0.2\t0.1\t0.3\t0.0").unwrap();
        let table = ScoreTable::read_tsv(file.path()).unwrap();
        assert_eq!(table.query("A").unwrap()["x"], [0.9, 0.5, 0.7, 0.1]);

        writeln!(file, "A\tx\t0.1\t0.1\t0.1\t0.1").unwrap();
        let result = ScoreTable::read_tsv(file.path());
        assert!(matches!(result, Err(ConsensusError::DataAlignment(_))));
    }

    #[test]
    fn test_score_table_bad_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "query\tcluster\treassign\ttfidf\tSCCAF\tdoublet").unwrap();
        writeln!(file, "A\tx\thigh\t0.5\t0.7\t0.1").unwrap();
        let err = ScoreTable::read_tsv(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_cluster_sizes() {
        let table = CellTable::new(
            labels(&["c1", "c2", "c3"]),
            vec![("A".to_string(), labels(&["x", "x", "y"]))],
        )
        .unwrap();
        let sizes = ClusterSizes::from_table(&table, &["A".to_string()]).unwrap();
        assert_eq!(sizes.size("A", "x"), Some(2));
        assert_eq!(sizes.size("A", "y"), Some(1));
        assert_eq!(sizes.size("A", "q"), None);
        assert_eq!(sizes.clusters("A").count(), 2);
        assert!(ClusterSizes::from_table(&table, &["B".to_string()]).is_err());
    }
}
