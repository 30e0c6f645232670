use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chunk-completion display shared by all workers of one parallel stage
pub struct StageProgress {
    stage: String,
    total: usize,
    completed: AtomicUsize,
    quiet: bool,
}

impl StageProgress {
    pub fn new(stage: &str, total: usize, quiet: bool) -> Self {
        Self {
            stage: stage.to_string(),
            total,
            completed: AtomicUsize::new(0),
            quiet,
        }
    }

    /// Record one finished chunk. Callable from any worker.
    pub fn tick(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.quiet {
            return;
        }
        let percentage = if self.total > 0 {
            (done as f64 * 100.0) / self.total as f64
        } else {
            100.0
        };
        print!(
            "\r[Running] {}: {}/{} chunks ({:.1}%)",
            self.stage, done, self.total, percentage
        );
        io::stdout().flush().ok();
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Overwrite the running line with the final state
    pub fn finish(&self) {
        if self.quiet {
            return;
        }
        println!(
            "\r[Done] {}: {}/{} chunks                ",
            self.stage,
            self.completed(),
            self.total
        );
    }
}

/// Format time as "xx h xx m xx.xxx s" format
pub fn format_time_used(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    if hours > 0 {
        format!("[Time used] {:02} h {:02} m {:05.3} s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("[Time used] {:02} m {:05.3} s", minutes, seconds)
    } else {
        format!("[Time used] {:05.3} s", seconds)
    }
}
