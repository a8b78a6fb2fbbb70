//! Content-addressed tile storage.
//!
//! Every backend stores each distinct image exactly once, keyed by its
//! [`ContentDigest`](crate::digest::ContentDigest), and records a logical
//! entry from the tile coordinate to that physical copy. Two backends exist:
//!
//! - [`FilesystemTileStore`]: digest-named blobs under `images/`, with a
//!   relative symlink per tile under `links/`.
//! - [`TransactionalTileStore`]: an MBTiles-compatible SQLite database
//!   written by a single background task that batches inserts into
//!   transactions.
//!
//! Callers hold an `Arc<dyn TileStore>` and never need the concrete type.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Destination;
use crate::error::Error;
use crate::tile::Tile;

mod filesystem;
mod transactional;

pub use filesystem::FilesystemTileStore;
pub use transactional::TransactionalTileStore;

/// Storage shared by all render workers. Implementations must tolerate
/// concurrent `already_rendered` and `store_tile` calls.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Whether a logical entry for this tile has already been recorded.
    async fn already_rendered(&self, tile: Tile) -> Result<bool, Error>;

    /// Stores the encoded image for a tile, deduplicating by content.
    async fn store_tile(&self, tile: Tile, data: Vec<u8>) -> Result<(), Error>;

    /// Number of distinct images written by this store instance.
    fn unique_tiles(&self) -> u64;

    /// Records a name/value pair describing the tileset. Backends with no
    /// place to keep it accept and drop it.
    fn put_metadata(&self, _name: &str, _value: &str) -> Result<(), Error> {
        Ok(())
    }

    /// True once every accepted `store_tile` call is durable.
    fn is_flushed(&self) -> bool {
        true
    }

    /// Drains pending writes and releases the backing store. Later calls are
    /// no-ops.
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Backends that defer writes expose their queue here.
    fn write_behind(&self) -> Option<&dyn WriteBehind> {
        None
    }

    /// Operations accepted but not yet committed; 0 for synchronous backends.
    fn queue_depth(&self) -> usize {
        self.write_behind().map_or(0, |w| w.queue_depth())
    }
}

/// Capability of stores that acknowledge `store_tile` before the write hits
/// disk.
pub trait WriteBehind {
    fn queue_depth(&self) -> usize;
}

/// Opens (creating if needed) the store a destination describes.
pub async fn open(destination: &Destination) -> Result<Arc<dyn TileStore>, Error> {
    match destination {
        Destination::Directory { root, shard_depth } => {
            let store = FilesystemTileStore::open(root, *shard_depth).await?;
            Ok(Arc::new(store))
        }
        Destination::MbTiles {
            path,
            on_conflict,
            batch_limit,
        } => {
            let store = TransactionalTileStore::open(path, *on_conflict, *batch_limit).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictPolicy;

    #[tokio::test]
    async fn test_open_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&Destination::Directory {
            root: dir.path().join("out"),
            shard_depth: 1,
        })
        .await
        .expect("store opens");

        assert!(store.write_behind().is_none());
        assert_eq!(store.queue_depth(), 0);
        assert!(store.is_flushed());
        assert!(dir.path().join("out/links").is_dir());
        assert!(dir.path().join("out/images").is_dir());
    }

    #[tokio::test]
    async fn test_open_mbtiles_destination() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&Destination::MbTiles {
            path: dir.path().join("tiles.mbtiles"),
            on_conflict: ConflictPolicy::Overwrite,
            batch_limit: 100,
        })
        .await
        .expect("store opens");

        assert!(store.write_behind().is_some());
        store
            .store_tile(Tile::new(0, 0, 0), b"world".to_vec())
            .await
            .unwrap();
        store.close().await.unwrap();
        assert_eq!(store.queue_depth(), 0);
        assert_eq!(store.unique_tiles(), 1);
        assert!(dir.path().join("tiles.mbtiles").is_file());
    }
}
