//! Periodic progress reporting.
//!
//! The monitor only reads the dispatcher's counters and the store's queue;
//! it has no influence on the run itself.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::dispatch::DispatchContext;
use crate::store::TileStore;

/// One reading of the run's counters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    pub total: usize,
    pub processed: u64,
    pub rendered: u64,
    pub unique: u64,
    pub queued: usize,
    pub elapsed: Duration,
}

impl Progress {
    pub fn capture(context: &DispatchContext, store: &dyn TileStore, elapsed: Duration) -> Self {
        Progress {
            total: context.backlog.len(),
            processed: context.stats.processed(),
            rendered: context.stats.rendered(),
            unique: store.unique_tiles(),
            queued: store.queue_depth(),
            elapsed,
        }
    }

    /// Rendered tiles per second. Skipped tiles cost next to nothing and are
    /// left out.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.rendered as f64 / secs
    }

    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        let left = (self.total as u64).saturating_sub(self.processed);
        Some(Duration::from_secs_f64(1.0 + left as f64 / rate))
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} processed, {} rendered, {} unique, {} queued, {:.1} tiles/s, elapsed {}, eta {}",
            self.processed,
            self.total,
            self.rendered,
            self.unique,
            self.queued,
            self.rate(),
            format_hms(Some(self.elapsed)),
            format_hms(self.eta()),
        )
    }
}

/// `H:MM:SS`, or `--:--:--` when there is nothing to show.
pub fn format_hms(duration: Option<Duration>) -> String {
    match duration {
        None => "--:--:--".to_string(),
        Some(d) => {
            let secs = d.as_secs();
            format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
        }
    }
}

/// Logs a [`Progress`] line every `interval` until the run is complete or
/// aborted, then logs a final line and returns it.
pub async fn monitor(
    context: Arc<DispatchContext>,
    store: Arc<dyn TileStore>,
    interval: Duration,
) -> Progress {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let progress = Progress::capture(&context, store.as_ref(), start.elapsed());
        if context.is_complete(store.as_ref()) || context.is_aborted() {
            info!(%progress, "render finished");
            return progress;
        }
        info!(%progress, "render progress");
    }
}
