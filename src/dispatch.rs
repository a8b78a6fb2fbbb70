//! Multi-worker render dispatch.
//!
//! Workers share one [`Backlog`] and one [`TileStore`]. Each worker claims a
//! tile, skips it if the store already has it, otherwise renders it with its
//! own [`TileRenderer`] and hands the image to the store. A failed render or
//! a per-tile store error is logged and counted; a fatal store error stops
//! every worker from claiming further tiles and fails the run.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::store::TileStore;
use crate::tile::Tile;
use crate::TileRenderer;

/// Fixed list of tiles with a shared claim cursor.
#[derive(Debug)]
pub struct Backlog {
    tiles: Vec<Tile>,
    next: AtomicUsize,
}

impl Backlog {
    pub fn new(tiles: Vec<Tile>) -> Self {
        Backlog {
            tiles,
            next: AtomicUsize::new(0),
        }
    }

    /// Shuffles with a fixed seed. An interrupted run restarted with the same
    /// seed sees the same order, so already stored tiles are skipped first
    /// and spread evenly across workers instead of one worker draining a
    /// long done prefix.
    pub fn shuffled(mut tiles: Vec<Tile>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        tiles.shuffle(&mut rng);
        Backlog::new(tiles)
    }

    /// Claims the next tile. Each tile is handed out exactly once; `None`
    /// once the backlog is exhausted.
    pub fn claim(&self) -> Option<Tile> {
        let len = self.tiles.len();
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| (i < len).then_some(i + 1))
            .ok()
            .map(|i| self.tiles[i])
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.next.load(Ordering::Acquire).min(self.len())
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }
}

/// Progress counters. All of them only ever increase.
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: AtomicU64,
    rendered: AtomicU64,
    failed: AtomicU64,
    workers_finished: AtomicUsize,
}

impl DispatchStats {
    /// Tiles taken off the backlog and dealt with, whatever the outcome.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Tiles the renderer was invoked for.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Tiles whose render or store failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn workers_finished(&self) -> usize {
        self.workers_finished.load(Ordering::Acquire)
    }
}

/// Everything the workers of one run share besides the store.
#[derive(Debug)]
pub struct DispatchContext {
    pub backlog: Backlog,
    pub stats: DispatchStats,
    workers: usize,
    aborted: AtomicBool,
}

impl DispatchContext {
    pub fn new(backlog: Backlog, workers: usize) -> Self {
        DispatchContext {
            backlog,
            stats: DispatchStats::default(),
            workers: workers.max(1),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn all_workers_finished(&self) -> bool {
        self.stats.workers_finished() >= self.workers
    }

    /// The run is over once every worker has exited and the store has
    /// nothing left to write.
    pub fn is_complete(&self, store: &dyn TileStore) -> bool {
        self.all_workers_finished() && store.is_flushed()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Counter values at the end of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub processed: u64,
    pub rendered: u64,
    pub failed: u64,
    pub unique: u64,
}

pub struct Dispatcher {
    context: Arc<DispatchContext>,
}

impl Dispatcher {
    pub fn new(backlog: Backlog, workers: usize) -> Self {
        Dispatcher {
            context: Arc::new(DispatchContext::new(backlog, workers)),
        }
    }

    pub fn context(&self) -> Arc<DispatchContext> {
        self.context.clone()
    }

    /// Runs the workers to completion. `make_renderer` is called once per
    /// worker with the worker's index; renderers are never shared.
    ///
    /// Returns the first fatal error any worker hit. The store is left open
    /// either way: closing it is up to the caller.
    pub async fn run<R, F>(
        &self,
        store: Arc<dyn TileStore>,
        mut make_renderer: F,
    ) -> Result<RunSummary, Error>
    where
        R: TileRenderer + 'static,
        F: FnMut(usize) -> R,
    {
        let workers = self.context.workers();
        info!(tiles = self.context.backlog.len(), workers, "starting render");

        let mut set = JoinSet::new();
        for id in 0..workers {
            let renderer = make_renderer(id);
            let context = self.context.clone();
            let store = store.clone();
            set.spawn(work(id, context, store, renderer));
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A panicking worker never reached its own bookkeeping.
                    self.context
                        .stats
                        .workers_finished
                        .fetch_add(1, Ordering::AcqRel);
                    self.context.abort();
                    Err(Error::WorkerPanicked(e.to_string()))
                }
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        let summary = RunSummary {
            total: self.context.backlog.len(),
            processed: self.context.stats.processed(),
            rendered: self.context.stats.rendered(),
            failed: self.context.stats.failed(),
            unique: store.unique_tiles(),
        };
        match first_error {
            Some(e) => {
                error!(error = %e, "render aborted");
                Err(e)
            }
            None => {
                info!(
                    processed = summary.processed,
                    rendered = summary.rendered,
                    failed = summary.failed,
                    "all workers finished"
                );
                Ok(summary)
            }
        }
    }
}

async fn work<R: TileRenderer>(
    id: usize,
    context: Arc<DispatchContext>,
    store: Arc<dyn TileStore>,
    mut renderer: R,
) -> Result<(), Error> {
    let stats = &context.stats;
    let result = loop {
        if context.is_aborted() {
            break Ok(());
        }
        let Some(tile) = context.backlog.claim() else {
            break Ok(());
        };

        match process(tile, stats, store.as_ref(), &mut renderer).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                context.abort();
                stats.processed.fetch_add(1, Ordering::Relaxed);
                break Err(e);
            }
            Err(e) => {
                warn!(%tile, error = %e, "storing tile failed");
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        stats.processed.fetch_add(1, Ordering::Relaxed);
    };

    stats.workers_finished.fetch_add(1, Ordering::AcqRel);
    debug!(worker = id, "worker finished");
    result
}

async fn process<R: TileRenderer>(
    tile: Tile,
    stats: &DispatchStats,
    store: &dyn TileStore,
    renderer: &mut R,
) -> Result<(), Error> {
    if store.already_rendered(tile).await? {
        trace!(%tile, "already rendered");
        return Ok(());
    }

    stats.rendered.fetch_add(1, Ordering::Relaxed);
    let data = match renderer.render(tile).await {
        Ok(data) => data,
        Err(e) => {
            warn!(%tile, error = %e, "rendering failed");
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    store.store_tile(tile, data).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fmt;

    use async_trait::async_trait;

    use super::*;
    use crate::store::FilesystemTileStore;

    /// Renders each tile's zoom level as its image, so every tile at one zoom
    /// shares an image. Fails on rows listed in `fail_rows`.
    struct ZoomRenderer {
        fail_rows: Vec<u32>,
    }

    #[derive(Debug)]
    struct RenderFailed;

    impl fmt::Display for RenderFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("style error")
        }
    }

    #[async_trait]
    impl TileRenderer for ZoomRenderer {
        type Error = RenderFailed;

        async fn render(&mut self, tile: Tile) -> Result<Vec<u8>, Self::Error> {
            if self.fail_rows.contains(&tile.row) {
                return Err(RenderFailed);
            }
            Ok(vec![tile.zoom; 32])
        }
    }

    fn grid(zoom: u8) -> Vec<Tile> {
        let n = 1u32 << zoom;
        (0..n)
            .flat_map(|x| (0..n).map(move |y| Tile::new(zoom, x, y)))
            .collect()
    }

    #[test]
    fn test_claim_hands_out_each_tile_once() {
        let tiles = grid(5);
        let backlog = Arc::new(Backlog::new(tiles.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backlog = backlog.clone();
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(tile) = backlog.claim() {
                        claimed.push(tile);
                    }
                    // Exhausted stays exhausted.
                    assert_eq!(backlog.claim(), None);
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), tiles.len());
        let unique: HashSet<Tile> = all.into_iter().collect();
        assert_eq!(unique, tiles.into_iter().collect::<HashSet<_>>());
        assert_eq!(backlog.remaining(), 0);
    }

    #[test]
    fn test_empty_backlog() {
        let backlog = Backlog::new(Vec::new());
        assert!(backlog.is_empty());
        assert_eq!(backlog.claim(), None);
        assert_eq!(backlog.remaining(), 0);
    }

    #[test]
    fn test_shuffle_is_stable_for_a_seed() {
        let tiles = grid(4);
        let a = Backlog::shuffled(tiles.clone(), 7);
        let b = Backlog::shuffled(tiles.clone(), 7);
        assert_eq!(a.tiles(), b.tiles());
        assert_ne!(a.tiles(), &tiles[..]);

        let mut sorted = a.tiles().to_vec();
        sorted.sort();
        assert_eq!(sorted, tiles);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_renders_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TileStore> = Arc::new(FilesystemTileStore::open(dir.path(), 1).await.unwrap());
        let mut tiles = grid(2);
        tiles.extend(grid(3));

        let dispatcher = Dispatcher::new(Backlog::shuffled(tiles.clone(), 1), 4);
        let summary = dispatcher
            .run(store.clone(), |_| ZoomRenderer { fail_rows: vec![] })
            .await
            .unwrap();

        assert_eq!(summary.total, 16 + 64);
        assert_eq!(summary.processed, 80);
        assert_eq!(summary.rendered, 80);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.unique, 2);
        assert!(dispatcher.context().is_complete(store.as_ref()));
        for tile in tiles {
            assert!(store.already_rendered(tile).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_rerun_skips_rendered_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = grid(3);
        {
            let store: Arc<dyn TileStore> = Arc::new(FilesystemTileStore::open(dir.path(), 0).await.unwrap());
            // First run only gets half the backlog done.
            let half = tiles[..32].to_vec();
            Dispatcher::new(Backlog::new(half), 2)
                .run(store, |_| ZoomRenderer { fail_rows: vec![] })
                .await
                .unwrap();
        }

        let store: Arc<dyn TileStore> = Arc::new(FilesystemTileStore::open(dir.path(), 0).await.unwrap());
        let summary = Dispatcher::new(Backlog::new(tiles), 2)
            .run(store, |_| ZoomRenderer { fail_rows: vec![] })
            .await
            .unwrap();
        assert_eq!(summary.processed, 64);
        assert_eq!(summary.rendered, 32);
        // The image for zoom 3 was already on disk.
        assert_eq!(summary.unique, 0);
    }

    #[tokio::test]
    async fn test_render_failures_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TileStore> = Arc::new(FilesystemTileStore::open(dir.path(), 0).await.unwrap());
        let tiles = grid(2);

        let summary = Dispatcher::new(Backlog::new(tiles.clone()), 3)
            .run(store.clone(), |_| ZoomRenderer { fail_rows: vec![1] })
            .await
            .unwrap();

        assert_eq!(summary.processed, 16);
        assert_eq!(summary.rendered, 16);
        assert_eq!(summary.failed, 4);
        for tile in tiles {
            assert_eq!(store.already_rendered(tile).await.unwrap(), tile.row != 1);
        }
    }

    #[tokio::test]
    async fn test_per_tile_store_errors_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TileStore> = Arc::new(FilesystemTileStore::open(dir.path(), 0).await.unwrap());
        let mut tiles = grid(1);
        tiles.push(Tile::new(29, 0, 0));

        let transactional = crate::store::TransactionalTileStore::open(
            dir.path().join("tiles.mbtiles"),
            crate::config::ConflictPolicy::Overwrite,
            10,
        )
        .await
        .unwrap();
        let transactional: Arc<dyn TileStore> = Arc::new(transactional);

        // Zoom 29 has no packed key in the database backend; it is skipped
        // like any other per-tile failure.
        let summary = Dispatcher::new(Backlog::new(tiles.clone()), 2)
            .run(transactional.clone(), |_| ZoomRenderer { fail_rows: vec![] })
            .await
            .unwrap();
        transactional.close().await.unwrap();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.failed, 1);
        assert_eq!(transactional.unique_tiles(), 1);

        // The directory backend has no such limit.
        let summary = Dispatcher::new(Backlog::new(tiles), 2)
            .run(store, |_| ZoomRenderer { fail_rows: vec![] })
            .await
            .unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.unique, 2);
    }

    #[tokio::test]
    async fn test_fatal_store_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::TransactionalTileStore::open(
            dir.path().join("tiles.mbtiles"),
            crate::config::ConflictPolicy::Overwrite,
            10,
        )
        .await
        .unwrap();
        store.close().await.unwrap();
        let store: Arc<dyn TileStore> = Arc::new(store);

        let dispatcher = Dispatcher::new(Backlog::new(grid(4)), 2);
        let err = dispatcher
            .run(store, |_| ZoomRenderer { fail_rows: vec![] })
            .await
            .expect_err("closed store is fatal");
        assert!(matches!(err, Error::StoreClosed));

        let context = dispatcher.context();
        assert!(context.is_aborted());
        assert!(context.all_workers_finished());
        // Each worker stops after its first fatal tile.
        assert!(context.stats.processed() <= 2);
        assert!(context.backlog.remaining() >= 14);
    }
}
