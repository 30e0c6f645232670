//! Balanced chunking of cells (or queries) over a bounded rayon pool.
//!
//! Every stage hands the partitioner a task that maps a contiguous index
//! range to exactly one output row per index. Chunks run independently and
//! the merge concatenates them in chunk order, so the merged output is in
//! input order no matter which worker finished first. A chunk that
//! errors or panics aborts the stage; nothing partial is returned.

use rayon::prelude::*;
use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{ConsensusError, Result};
use crate::progress::StageProgress;

/// Split `0..items` into `chunks` contiguous ranges whose lengths differ by at
/// most one, longer ranges first.
pub fn split_balanced(items: usize, chunks: usize) -> Vec<Range<usize>> {
    if items == 0 || chunks == 0 {
        return Vec::new();
    }
    let chunks = chunks.min(items);
    let base = items / chunks;
    let extra = items % chunks;
    let mut ranges = Vec::with_capacity(chunks);
    let mut start = 0;
    for idx in 0..chunks {
        let len = base + usize::from(idx < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}

pub struct WorkPartitioner {
    pool: rayon::ThreadPool,
    workers: usize,
    max_chunk: Option<usize>,
    quiet: bool,
}

impl WorkPartitioner {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ConsensusError::Configuration(
                "worker count must be at least 1".into(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("scconsensus-worker-{}", idx))
            .build()
            .map_err(|e| ConsensusError::Configuration(format!("cannot build worker pool: {}", e)))?;
        Ok(Self {
            pool,
            workers,
            max_chunk: None,
            quiet: false,
        })
    }

    /// Upper bound on the number of items handed to a single chunk
    pub fn with_max_chunk(mut self, max_chunk: Option<usize>) -> Self {
        self.max_chunk = max_chunk.filter(|&m| m > 0);
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Chunk layout for `items` units of work when at most `cap` of them are
    /// independent enough to be worth a worker each.
    pub fn plan(&self, items: usize, cap: usize) -> Vec<Range<usize>> {
        let mut chunks = self.workers.min(cap.max(1)).min(items);
        if let Some(max_chunk) = self.max_chunk {
            chunks = chunks.max((items + max_chunk - 1) / max_chunk).min(items);
        }
        split_balanced(items, chunks)
    }

    /// Run `task` over every chunk of `0..items` and merge the rows in order.
    pub fn dispatch<T, F>(&self, stage: &str, items: usize, cap: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(Range<usize>) -> Result<Vec<T>> + Sync,
    {
        let ranges = self.plan(items, cap);
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let progress = StageProgress::new(stage, ranges.len(), self.quiet);
        let task = &task;
        let progress_ref = &progress;

        let outcomes: Vec<(Range<usize>, std::result::Result<Vec<T>, String>)> = self.pool.install(|| {
            ranges
                .into_par_iter()
                .map(|range| {
                    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task(range.clone()))) {
                        Ok(Ok(rows)) if rows.len() == range.len() => Ok(rows),
                        Ok(Ok(rows)) => Err(format!(
                            "returned {} rows for {} cells",
                            rows.len(),
                            range.len()
                        )),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(payload) => Err(panic_message(payload)),
                    };
                    progress_ref.tick();
                    (range, outcome)
                })
                .collect()
        });
        progress.finish();

        let mut merged = Vec::with_capacity(items);
        for (chunk, (range, outcome)) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(rows) => merged.extend(rows),
                Err(reason) => {
                    return Err(ConsensusError::WorkerFailure {
                        stage: stage.to_string(),
                        chunk,
                        range,
                        reason,
                    })
                }
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitioner(workers: usize) -> WorkPartitioner {
        WorkPartitioner::new(workers).unwrap().with_quiet(true)
    }

    #[test]
    fn test_split_balanced_sizes() {
        let ranges = split_balanced(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(split_balanced(2, 5), vec![0..1, 1..2]);
        assert!(split_balanced(0, 4).is_empty());
    }

    #[test]
    fn test_plan_respects_cap_and_max_chunk() {
        let p = partitioner(8);
        assert_eq!(p.plan(100, 3).len(), 3);
        assert_eq!(p.plan(5, 100).len(), 5);
        let p = partitioner(2).with_max_chunk(Some(10));
        let ranges = p.plan(95, 95);
        assert_eq!(ranges.len(), 10);
        assert!(ranges.iter().all(|r| r.len() <= 10));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkPartitioner::new(0),
            Err(ConsensusError::Configuration(_))
        ));
    }

    #[test]
    fn test_dispatch_preserves_order() {
        let p = partitioner(4).with_max_chunk(Some(7));
        let rows = p
            .dispatch("order", 1000, 1000, |range| Ok(range.map(|i| i * 2).collect()))
            .unwrap();
        assert_eq!(rows.len(), 1000);
        assert!(rows.iter().enumerate().all(|(i, &v)| v == i * 2));
    }

    #[test]
    fn test_chunking_invariance() {
        let data: Vec<f64> = (0..257).map(|i| (i as f64).sin()).collect();
        let task = |range: Range<usize>| Ok(data[range].iter().map(|x| x * x + 1.0).collect::<Vec<_>>());
        let single = partitioner(1).dispatch("one", data.len(), data.len(), task).unwrap();
        let many = partitioner(6)
            .with_max_chunk(Some(13))
            .dispatch("many", data.len(), data.len(), task)
            .unwrap();
        assert_eq!(single, many);
    }

    #[test]
    fn test_failed_chunk_aborts_stage() {
        let p = partitioner(4);
        let result: Result<Vec<usize>> = p.dispatch("fail", 40, 40, |range| {
            if range.contains(&25) {
                Err(ConsensusError::DataAlignment("malformed row 25".into()))
            } else {
                Ok(range.collect())
            }
        });
        match result {
            Err(ConsensusError::WorkerFailure { stage, range, reason, .. }) => {
                assert_eq!(stage, "fail");
                assert!(range.contains(&25));
                assert!(reason.contains("malformed row 25"));
            }
            other => panic!("expected worker failure, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_panicking_chunk_becomes_worker_failure() {
        let p = partitioner(3);
        let result: Result<Vec<usize>> = p.dispatch("panic", 9, 9, |range| {
            if range.start == 0 {
                panic!("bad chunk");
            }
            Ok(range.collect())
        });
        match result {
            Err(ConsensusError::WorkerFailure { chunk, reason, .. }) => {
                assert_eq!(chunk, 0);
                assert!(reason.contains("bad chunk"));
            }
            other => panic!("expected worker failure, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        let p = partitioner(2);
        let result: Result<Vec<usize>> = p.dispatch("short", 10, 10, |range| Ok(range.skip(1).collect()));
        assert!(matches!(result, Err(ConsensusError::WorkerFailure { .. })));
    }

    #[test]
    fn test_empty_dispatch() {
        let rows: Vec<u8> = partitioner(2).dispatch("empty", 0, 0, |_| Ok(Vec::new())).unwrap();
        assert!(rows.is_empty());
    }
}
