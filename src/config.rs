//! Run configuration: TOML file, then `SCCONSENSUS__*` environment
//! variables, then command-line overrides.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{ConsensusError, Result};
use crate::game::{Aggregation, AggregationRule, MetricWeights, PLAYER_LIMIT};
use crate::prune::PrunePolicy;

pub const DEFAULT_MAX_PLAYERS: usize = 10;

fn default_max_players() -> usize {
    DEFAULT_MAX_PLAYERS
}

fn default_tie_tolerance() -> f64 {
    1e-9
}

fn default_min_fraction() -> f64 {
    0.05
}

fn default_rule() -> AggregationRule {
    AggregationRule::MaxPooled
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PruneSettings {
    #[serde(default = "default_min_fraction")]
    pub min_fraction: f64,
    #[serde(default)]
    pub min_count: usize,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            min_fraction: default_min_fraction(),
            min_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationSettings {
    #[serde(default = "default_rule")]
    pub rule: AggregationRule,
    #[serde(default = "one")]
    pub reassign: f64,
    #[serde(default = "one")]
    pub tfidf: f64,
    #[serde(default = "one", alias = "SCCAF")]
    pub sccaf: f64,
    #[serde(default)]
    pub doublet: f64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            rule: default_rule(),
            reassign: 1.0,
            tfidf: 1.0,
            sccaf: 1.0,
            doublet: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub queries: Vec<String>,
    pub reference: String,
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    #[serde(default = "default_tie_tolerance")]
    pub tie_tolerance: f64,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub max_chunk: Option<usize>,
    #[serde(default)]
    pub prune: PruneSettings,
    #[serde(default)]
    pub aggregation: AggregationSettings,
}

/// Values given on the command line; they win over file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub queries: Option<Vec<String>>,
    pub reference: Option<String>,
    pub max_players: Option<usize>,
    pub min_fraction: Option<f64>,
    pub min_count: Option<usize>,
    pub aggregation: Option<String>,
    pub threads: Option<usize>,
}

impl RunConfig {
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConsensusError::Configuration(format!(
                    "configuration file does not exist: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SCCONSENSUS")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("queries")
                .try_parsing(true),
        );

        if let Some(queries) = &overrides.queries {
            builder = builder.set_override("queries", queries.clone())?;
        }
        if let Some(reference) = &overrides.reference {
            builder = builder.set_override("reference", reference.clone())?;
        }
        if let Some(max_players) = overrides.max_players {
            builder = builder.set_override("max_players", max_players as i64)?;
        }
        if let Some(min_fraction) = overrides.min_fraction {
            builder = builder.set_override("prune.min_fraction", min_fraction)?;
        }
        if let Some(min_count) = overrides.min_count {
            builder = builder.set_override("prune.min_count", min_count as i64)?;
        }
        if let Some(rule) = &overrides.aggregation {
            let rule: AggregationRule = rule.parse().map_err(ConsensusError::Configuration)?;
            builder = builder.set_override("aggregation.rule", rule.to_string())?;
        }
        if let Some(threads) = overrides.threads {
            builder = builder.set_override("threads", threads as i64)?;
        }

        let config: RunConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that need nothing but the configuration itself
    pub fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            return Err(ConsensusError::Configuration("query list is empty".into()));
        }
        let mut seen = HashSet::new();
        for q in &self.queries {
            if q.trim().is_empty() {
                return Err(ConsensusError::Configuration("query names cannot be empty".into()));
            }
            if !seen.insert(q.as_str()) {
                return Err(ConsensusError::Configuration(format!("query '{}' is listed twice", q)));
            }
        }
        if self.reference.trim().is_empty() {
            return Err(ConsensusError::Configuration("reference name cannot be empty".into()));
        }
        if self.max_players == 0 || self.max_players > PLAYER_LIMIT {
            return Err(ConsensusError::Configuration(format!(
                "max_players must be between 1 and {}, current: {}",
                PLAYER_LIMIT, self.max_players
            )));
        }
        if self.queries.len() > self.max_players {
            return Err(ConsensusError::Configuration(format!(
                "{} queries exceed max_players = {}; exact Shapley evaluation is not attempted",
                self.queries.len(),
                self.max_players
            )));
        }
        if !self.tie_tolerance.is_finite() || self.tie_tolerance < 0.0 {
            return Err(ConsensusError::Configuration(format!(
                "tie_tolerance must be a finite non-negative number, current: {}",
                self.tie_tolerance
            )));
        }
        if self.threads == Some(0) {
            return Err(ConsensusError::Configuration("threads must be at least 1".into()));
        }
        if self.max_chunk == Some(0) {
            return Err(ConsensusError::Configuration("max_chunk must be at least 1".into()));
        }
        self.prune_policy()?;
        self.aggregation()?;
        Ok(())
    }

    pub fn aggregation(&self) -> Result<Aggregation> {
        let a = &self.aggregation;
        let weights = MetricWeights::new([a.reassign, a.tfidf, a.sccaf, a.doublet])?;
        Ok(Aggregation::new(a.rule, weights))
    }

    pub fn prune_policy(&self) -> Result<PrunePolicy> {
        PrunePolicy::new(self.prune.min_fraction, self.prune.min_count)
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}
