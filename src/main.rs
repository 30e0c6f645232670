// Version information constants
const VERSION: &str = env!("CARGO_PKG_VERSION");

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

mod assign;
mod config;
mod error;
mod game;
mod partition;
mod pipeline;
mod progress;
mod prune;
mod resolve;
mod table;
mod tensor;

use crate::config::{ConfigOverrides, RunConfig};
use crate::partition::WorkPartitioner;
use crate::progress::format_time_used;
use crate::prune::{PrunePolicy, PruningReconciler};
use crate::table::{CellTable, ClusterSizes, ScoreTable};

/// Run log writer: every line is timestamped, warnings are echoed to stderr
pub struct Logger {
    writer: BufWriter<std::fs::File>,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn warn(&mut self, message: &str) -> std::io::Result<()> {
        eprintln!("[Warning] {}", message);
        self.log(&format!("WARNING: {}", message))
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a consensus annotation from competing cluster partitions
    Run(RunArgs),
    /// Re-run reference pruning on an existing per-cell label table
    Prune(PruneArgs),
}

#[derive(Args)]
struct RunArgs {
    // Input files
    /// Per-cell label table (TSV: cell, one column per partition)
    #[arg(short = 'c', long = "cells")]
    pub cells: String,
    /// Per-cluster score table (TSV: query, cluster, reassign, tfidf, SCCAF, doublet)
    #[arg(short = 's', long = "scores")]
    pub scores: String,
    /// Configuration file (TOML, optional)
    #[arg(long = "config")]
    pub config: Option<String>,

    // Output configuration
    /// Output directory
    #[arg(short = 'o', long = "output")]
    pub output_dir: String,

    // Run configuration (overrides the configuration file)
    /// Query partitions, comma-separated
    #[arg(short = 'q', long = "queries")]
    pub queries: Option<String>,
    /// Reference partition
    #[arg(short = 'r', long = "reference")]
    pub reference: Option<String>,
    /// Maximum number of queries for exact Shapley evaluation
    #[arg(long = "max-players")]
    pub max_players: Option<usize>,
    /// Minimum fraction of a reference cluster a sub-label must cover
    #[arg(long = "min-fraction")]
    pub min_fraction: Option<f64>,
    /// Minimum number of cells a sub-label must cover
    #[arg(long = "min-count")]
    pub min_count: Option<usize>,
    /// Coalition value rule (max-pooled, additive)
    #[arg(short = 'a', long = "aggregation")]
    pub aggregation: Option<String>,

    // Performance configuration
    /// Number of parallel threads
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,
    /// Suppress per-stage progress lines
    #[arg(long = "quiet", default_value_t = false)]
    pub quiet: bool,

    // Log configuration
    /// Log file path (default to output directory)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

#[derive(Args)]
struct PruneArgs {
    /// Per-cell table containing the reference and label columns (TSV)
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Reference partition column
    #[arg(short = 'r', long = "reference")]
    pub reference: String,
    /// Column holding the labels to prune
    #[arg(long = "label-column", default_value = "raw")]
    pub label_column: String,
    /// Output directory
    #[arg(short = 'o', long = "output")]
    pub output_dir: String,
    /// Minimum fraction of a reference cluster a sub-label must cover
    #[arg(long = "min-fraction", default_value_t = 0.05)]
    pub min_fraction: f64,
    /// Minimum number of cells a sub-label must cover
    #[arg(long = "min-count", default_value_t = 0)]
    pub min_count: usize,
    /// Number of parallel threads
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,
    /// Suppress per-stage progress lines
    #[arg(long = "quiet", default_value_t = false)]
    pub quiet: bool,
    /// Log file path (default to output directory)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

/// Validate run command parameters
fn validate_run_args(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    for (what, path) in [("Cell table", &args.cells), ("Score table", &args.scores)] {
        if path.trim().is_empty() {
            return Err(format!("Error: {} path cannot be empty", what).into());
        }
        if !Path::new(path).exists() {
            return Err(format!("Error: {} does not exist: {}", what, path).into());
        }
    }
    if let Some(config_path) = &args.config {
        if !Path::new(config_path).exists() {
            return Err(format!("Error: Configuration file does not exist: {}", config_path).into());
        }
    }
    if args.output_dir.trim().is_empty() {
        return Err("Error: Output directory cannot be empty".into());
    }
    if args.config.is_none() && (args.queries.is_none() || args.reference.is_none()) {
        return Err("Error: --queries and --reference are required when no --config is given".into());
    }
    if let Some(f) = args.min_fraction {
        if !(0.0..=1.0).contains(&f) {
            return Err(format!("Error: min-fraction must be between 0.0 and 1.0, current: {}", f).into());
        }
    }
    if args.threads == Some(0) {
        return Err("Error: Thread count must be at least 1".into());
    }
    Ok(())
}

/// Validate prune command parameters
fn validate_prune_args(args: &PruneArgs) -> Result<(), Box<dyn Error>> {
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if args.output_dir.trim().is_empty() {
        return Err("Error: Output directory cannot be empty".into());
    }
    if args.reference.trim().is_empty() || args.label_column.trim().is_empty() {
        return Err("Error: Reference and label column names cannot be empty".into());
    }
    if !(0.0..=1.0).contains(&args.min_fraction) {
        return Err(format!(
            "Error: min-fraction must be between 0.0 and 1.0, current: {}",
            args.min_fraction
        )
        .into());
    }
    if args.threads == Some(0) {
        return Err("Error: Thread count must be at least 1".into());
    }
    Ok(())
}

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn open_logger(log: &Option<String>, output_dir: &Path) -> Result<Logger, Box<dyn Error>> {
    let log_file = if let Some(log_path) = log {
        std::fs::File::create(log_path)?
    } else {
        std::fs::File::create(output_dir.join("scconsensus.log"))?
    };
    Ok(Logger::new(log_file))
}

fn run_command(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    validate_run_args(args)?;
    let start = Instant::now();

    let output_dir = PathBuf::from(&args.output_dir);
    std::fs::create_dir_all(&output_dir)?;
    let mut logger = open_logger(&args.log, &output_dir)?;

    let overrides = ConfigOverrides {
        queries: args.queries.as_deref().map(parse_list),
        reference: args.reference.clone(),
        max_players: args.max_players,
        min_fraction: args.min_fraction,
        min_count: args.min_count,
        aggregation: args.aggregation.clone(),
        threads: args.threads,
    };
    let config = RunConfig::load(args.config.as_deref().map(Path::new), &overrides)?;
    let threads = config.threads();

    // Record environment information and parameters
    logger.log("=== scconsensus Run Log ===")?;
    logger.log(&format!("Software Version: v{}", VERSION))?;
    logger.log(&format!("Runtime: {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")))?;
    logger.log(&format!("Cell Table: {}", args.cells))?;
    logger.log(&format!("Score Table: {}", args.scores))?;
    logger.log(&format!("Output Directory: {}", args.output_dir))?;
    logger.log(&format!("Queries: {}", config.queries.join(",")))?;
    logger.log(&format!("Reference: {}", config.reference))?;
    logger.log(&format!("Max Players: {}", config.max_players))?;
    logger.log(&format!("Aggregation: {}", config.aggregation.rule))?;
    logger.log(&format!("Threads: {}", threads))?;

    println!("[Loading data] Threads={}", threads);
    println!("    Cells={}", args.cells);
    println!("    Scores={}", args.scores);
    println!();

    let table = CellTable::read_tsv(Path::new(&args.cells))?;
    let scores = ScoreTable::read_tsv(Path::new(&args.scores))?;
    logger.log(&format!("Loaded {} cells, {} partitions", table.len(), table.partitions().len()))?;

    println!("[Params]");
    println!("    Queries: {}.", config.queries.join(", "));
    println!("    Reference: {}.", config.reference);
    println!(
        "    Pruning: min_fraction={}, min_count={}.",
        config.prune.min_fraction, config.prune.min_count
    );
    println!();

    let partitioner = WorkPartitioner::new(threads)?
        .with_max_chunk(config.max_chunk)
        .with_quiet(args.quiet);
    logger.log(&format!("Worker Pool: {} threads", partitioner.workers()))?;
    let result = pipeline::run_consensus(&config, &table, &scores, &partitioner, &mut logger);
    let output = match result {
        Ok(output) => output,
        Err(e) => {
            logger.log(&format!("Consensus run failed: {}", e))?;
            return Err(e.into());
        }
    };

    let annotated_path = output_dir.join("annotated.tsv");
    let mapping_path = output_dir.join("celltype.txt");
    pipeline::write_annotated_table(&annotated_path, &table, &output)?;
    prune::write_mapping(&mapping_path, &config.reference, &output.pruning.mapping)?;

    println!("[Output]");
    if !output.missing.is_empty() {
        println!("    Missing score entries: {} (see log)", output.missing.len());
    }
    println!("    Annotated table: {}", annotated_path.display());
    println!("    Cell type mapping: {}", mapping_path.display());
    println!("{}", format_time_used(start.elapsed()));
    logger.log("Consensus run completed")?;
    logger.log(&format_time_used(start.elapsed()))?;
    Ok(())
}

fn prune_command(args: &PruneArgs) -> Result<(), Box<dyn Error>> {
    validate_prune_args(args)?;
    let start = Instant::now();

    let output_dir = PathBuf::from(&args.output_dir);
    std::fs::create_dir_all(&output_dir)?;
    let mut logger = open_logger(&args.log, &output_dir)?;
    logger.log("=== scconsensus Prune Log ===")?;
    logger.log(&format!("Software Version: v{}", VERSION))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Reference: {}", args.reference))?;
    logger.log(&format!("Label Column: {}", args.label_column))?;

    let table = CellTable::read_tsv(Path::new(&args.input))?;
    let reference = table.require(&args.reference)?;
    let labels = table.require(&args.label_column)?;
    let sizes = ClusterSizes::from_table(&table, &[args.reference.clone()])?;
    let policy = PrunePolicy::new(args.min_fraction, args.min_count)?;

    let threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    });
    let partitioner = WorkPartitioner::new(threads)?.with_quiet(args.quiet);
    logger.log(&format!("Worker Pool: {} threads", partitioner.workers()))?;
    let pruning = PruningReconciler::new(&args.reference, policy, &sizes).reconcile(reference, labels, &partitioner)?;
    for w in &pruning.warnings {
        logger.warn(&w.to_string())?;
    }

    let pruned_path = output_dir.join("pruned.tsv");
    let mut writer = BufWriter::new(std::fs::File::create(&pruned_path)?);
    writeln!(writer, "cell\t{}\t{}\tpruned\tprefixed", args.reference, args.label_column)?;
    for (cell, id) in table.cells().iter().enumerate() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            id, reference[cell], labels[cell], pruning.pruned[cell], pruning.prefixed[cell]
        )?;
    }
    writer.flush()?;
    let mapping_path = output_dir.join("celltype.txt");
    prune::write_mapping(&mapping_path, &args.reference, &pruning.mapping)?;

    let changed = labels.iter().zip(&pruning.pruned).filter(|(a, b)| a != b).count();
    logger.log(&format!("{} of {} cells relabelled", changed, table.len()))?;
    println!("[Done] {} of {} cells relabelled", changed, table.len());
    println!("    Pruned table: {}", pruned_path.display());
    println!("    Cell type mapping: {}", mapping_path.display());
    println!("{}", format_time_used(start.elapsed()));
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Prune(args) => prune_command(&args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("leiden1, leiden2,,gs "), vec!["leiden1", "leiden2", "gs"]);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "scconsensus", "run", "-c", "cells.tsv", "-s", "scores.tsv", "-o", "out", "-q", "A,B", "-r", "A",
            "--min-fraction", "0.5", "--quiet",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.queries.as_deref(), Some("A,B"));
                assert_eq!(args.min_fraction, Some(0.5));
                assert!(args.config.is_none());
                assert!(args.quiet);
            }
            Commands::Prune(_) => panic!("expected run"),
        }
    }

    #[test]
    fn test_logger_writes_timestamped_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut logger = Logger::new(file.reopen().unwrap());
        logger.log("hello").unwrap();
        logger.warn("careful").unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.lines().next().unwrap().ends_with("] hello"));
        assert!(text.contains("WARNING: careful"));
    }

    #[test]
    fn test_run_command_on_demo_inputs() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            cells: demos.join("cells.tsv").to_string_lossy().to_string(),
            scores: demos.join("scores.tsv").to_string_lossy().to_string(),
            config: Some(demos.join("run.toml").to_string_lossy().to_string()),
            output_dir: dir.path().to_string_lossy().to_string(),
            queries: None,
            reference: None,
            max_players: None,
            min_fraction: None,
            min_count: None,
            aggregation: None,
            threads: Some(2),
            quiet: true,
            log: None,
        };
        run_command(&args).unwrap();
        let mapping = std::fs::read_to_string(dir.path().join("celltype.txt")).unwrap();
        assert_eq!(mapping, "reference\tcell_cluster\tchoice\nA\tA@x\tA@x\nA\tA@y\tB@z\n");
        let annotated = std::fs::read_to_string(dir.path().join("annotated.tsv")).unwrap();
        assert_eq!(annotated.lines().count(), 5);
        assert!(dir.path().join("scconsensus.log").exists());
    }

    #[test]
    fn test_prune_command_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("labels.tsv");
        std::fs::write(
            &input,
            "cell\tref\traw\nc1\ta\tX@1\nc2\ta\tX@1\nc3\ta\tX@1\nc4\ta\tY@2\nc5\tb\tY@2\n",
        )
        .unwrap();
        let first_out = dir.path().join("first");
        let args = PruneArgs {
            input: input.to_string_lossy().to_string(),
            reference: "ref".to_string(),
            label_column: "raw".to_string(),
            output_dir: first_out.to_string_lossy().to_string(),
            min_fraction: 0.3,
            min_count: 0,
            threads: Some(2),
            quiet: true,
            log: None,
        };
        prune_command(&args).unwrap();
        let first = std::fs::read_to_string(first_out.join("pruned.tsv")).unwrap();
        assert!(first.contains("c4\ta\tY@2\tX@1\tref@a|Y@2"));

        let second_out = dir.path().join("second");
        let args = PruneArgs {
            input: first_out.join("pruned.tsv").to_string_lossy().to_string(),
            label_column: "pruned".to_string(),
            output_dir: second_out.to_string_lossy().to_string(),
            ..args
        };
        prune_command(&args).unwrap();
        let second = std::fs::read_to_string(second_out.join("pruned.tsv")).unwrap();
        for line in second.lines().skip(1) {
            let fields: Vec<&str> = line.split('\t').collect();
            assert_eq!(fields[2], fields[3]);
        }
        assert_eq!(
            std::fs::read_to_string(first_out.join("celltype.txt")).unwrap(),
            std::fs::read_to_string(second_out.join("celltype.txt")).unwrap()
        );
    }
}
