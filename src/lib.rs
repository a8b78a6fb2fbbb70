//! # Tile Forge
//!
//! Concurrent rendering of map tiles into deduplicated storage.
//!
//! ## Current features
//!
//! Given a list of tile coordinates and something that can render one tile to
//! encoded image bytes, this crate fans the list out over a pool of workers and
//! writes the results to one of two stores:
//!
//! - a directory of content-addressed images with one symlink per tile, or
//! - an MBTiles-compatible SQLite database, written by a single background
//!   task in batched transactions.
//!
//! Both stores keep each distinct image once, no matter how many tiles share
//! it (ocean tiles are the usual culprit). Both can be reopened, and tiles
//! already present are skipped, so an interrupted run resumes where it left
//! off.
//!
//! ## Known Limitations
//!
//! Map projection, styling and the rendering itself are up to the caller.
//! Coordinates are taken as given; the database store only accepts zooms up
//! to [`MAX_PACKED_ZOOM`](tile::MAX_PACKED_ZOOM).

#![deny(warnings)]

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

pub mod config;
pub mod digest;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod progress;
pub mod store;
pub mod tile;

pub use config::{ConflictPolicy, Destination, RenderConfig};
pub use dispatch::{Backlog, DispatchContext, Dispatcher, RunSummary};
pub use error::Error;
pub use store::{FilesystemTileStore, TileStore, TransactionalTileStore, WriteBehind};
pub use tile::{read_tiles, Tile, TileKey};

/// Produces the encoded image for a single tile.
///
/// Each worker owns its own renderer, so implementations may keep mutable
/// per-worker state (a map handle, a scratch buffer) without locking.
#[async_trait]
pub trait TileRenderer: Send {
    type Error: std::fmt::Display + Send;

    async fn render(&mut self, tile: Tile) -> Result<Vec<u8>, Self::Error>;
}

/// Renders every tile in `tiles` into the destination `config` describes.
///
/// The tile order is shuffled with the configured seed first, which spreads
/// workers over the map instead of having them all crawl the same area. The
/// store is closed before returning even if the run failed, so every tile
/// that was rendered is on disk.
pub async fn render<R, F>(
    config: &RenderConfig,
    tiles: Vec<Tile>,
    make_renderer: F,
) -> Result<RunSummary, Error>
where
    R: TileRenderer + 'static,
    F: FnMut(usize) -> R,
{
    let destination = config.destination()?;
    let store = store::open(&destination).await?;

    let outcome = run(config, tiles, make_renderer, store.clone()).await;
    let closed = store.close().await;

    let mut summary = outcome?;
    closed?;
    // Deferred writes only count once committed.
    summary.unique = store.unique_tiles();
    info!(
        total = summary.total,
        rendered = summary.rendered,
        failed = summary.failed,
        unique = summary.unique,
        "render complete"
    );
    Ok(summary)
}

async fn run<R, F>(
    config: &RenderConfig,
    tiles: Vec<Tile>,
    make_renderer: F,
    store: Arc<dyn TileStore>,
) -> Result<RunSummary, Error>
where
    R: TileRenderer + 'static,
    F: FnMut(usize) -> R,
{
    for (name, value) in &config.metadata {
        store.put_metadata(name, value)?;
    }

    let backlog = Backlog::shuffled(tiles, config.shuffle_seed);
    let dispatcher = Dispatcher::new(backlog, config.workers);
    let monitor = tokio::spawn(progress::monitor(
        dispatcher.context(),
        store.clone(),
        config.progress_interval(),
    ));

    let result = dispatcher.run(store, make_renderer).await;
    monitor.abort();
    result
}

/// Convenience for callers reading the tile list from a file or stdin.
pub fn read_tile_list(reader: impl io::BufRead) -> Result<Vec<Tile>, Error> {
    let tiles = read_tiles(reader)?;
    if tiles.is_empty() {
        warn!("tile list is empty");
    }
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fmt;

    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::{ConnectOptions, Row};

    use super::*;

    #[derive(Debug)]
    struct Unrenderable;

    impl fmt::Display for Unrenderable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "unrenderable")
        }
    }

    /// Land below zoom 2, ocean everywhere else.
    struct Coastline;

    #[async_trait]
    impl TileRenderer for Coastline {
        type Error = Unrenderable;

        async fn render(&mut self, tile: Tile) -> Result<Vec<u8>, Self::Error> {
            match tile.zoom {
                0 | 1 => Ok(format!("land {tile}").into_bytes()),
                13 => Err(Unrenderable),
                _ => Ok(b"ocean".to_vec()),
            }
        }
    }

    fn pyramid(max_zoom: u8) -> Vec<Tile> {
        let mut tiles = Vec::new();
        for zoom in 0..=max_zoom {
            let side = 1u32 << zoom;
            for column in 0..side {
                for row in 0..side {
                    tiles.push(Tile::new(zoom, column, row));
                }
            }
        }
        tiles
    }

    #[tokio::test]
    async fn test_render_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RenderConfig::for_destination(&Destination::Directory {
            root: dir.path().to_path_buf(),
            shard_depth: 1,
        });
        config.workers = 3;

        // 1 + 4 + 16 tiles: five land images plus one shared ocean image.
        let summary = render(&config, pyramid(2), |_| Coastline).await.unwrap();
        assert_eq!(summary.total, 21);
        assert_eq!(summary.processed, 21);
        assert_eq!(summary.rendered, 21);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.unique, 6);
        assert!(dir.path().join("links/2/3/3.png").is_file());

        let again = render(&config, pyramid(2), |_| Coastline).await.unwrap();
        assert_eq!(again.processed, 21);
        assert_eq!(again.rendered, 0);
        assert_eq!(again.unique, 0);
    }

    #[tokio::test]
    async fn test_render_to_mbtiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.mbtiles");
        let mut config = RenderConfig::for_destination(&Destination::MbTiles {
            path: path.clone(),
            on_conflict: ConflictPolicy::Overwrite,
            batch_limit: 5,
        });
        config.workers = 4;
        config.metadata = BTreeMap::from([
            ("name".to_string(), "World".to_string()),
            ("format".to_string(), "png".to_string()),
        ]);

        let mut tiles = pyramid(2);
        tiles.push(Tile::new(13, 0, 0));
        let summary = render(&config, tiles, |_| Coastline).await.unwrap();
        assert_eq!(summary.total, 22);
        assert_eq!(summary.rendered, 22);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unique, 6);

        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .connect()
            .await
            .unwrap();
        let mapped: i64 = sqlx::query("SELECT COUNT(*) FROM map")
            .fetch_one(&mut conn)
            .await
            .unwrap()
            .get(0);
        assert_eq!(mapped, 21);
        let name: String = sqlx::query("SELECT value FROM metadata WHERE name = 'name'")
            .fetch_one(&mut conn)
            .await
            .unwrap()
            .get(0);
        assert_eq!(name, "World");
    }

    #[tokio::test]
    async fn test_render_without_destination() {
        let config = RenderConfig {
            directory: None,
            ..RenderConfig::for_destination(&Destination::Directory {
                root: "unused".into(),
                shard_depth: 0,
            })
        };
        let err = render(&config, pyramid(1), |_| Coastline).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_read_tile_list() {
        let tiles = read_tile_list("0/0/0\n\n1/1/0\n".as_bytes()).unwrap();
        assert_eq!(tiles, vec![Tile::new(0, 0, 0), Tile::new(1, 1, 0)]);
        assert!(read_tile_list("".as_bytes()).unwrap().is_empty());
    }
}
