use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use crate::config::MAX_SHARD_DEPTH;
use crate::digest::ContentDigest;
use crate::error::Error;
use crate::store::TileStore;
use crate::tile::Tile;

const LINKS_DIR: &str = "links";
const IMAGES_DIR: &str = "images";
const EXTENSION: &str = "png";

/// Tile store backed by a plain directory tree:
///
/// ```text
/// <root>/images/de/ad/deadbeef....png      one file per distinct image
/// <root>/links/5/3/4.png -> ../../../images/de/ad/deadbeef....png
/// ```
///
/// The presence of a link is what marks a tile as rendered, so the store
/// keeps no index and can be reopened at any point. Blobs are published
/// under their digest name with an exclusive hard link from a fully written
/// temporary file; whichever worker's link succeeds owns the blob and every
/// other writer of the same digest sees `AlreadyExists`.
pub struct FilesystemTileStore {
    root: PathBuf,
    shard_depth: u8,
    unique_tiles: AtomicU64,
}

impl FilesystemTileStore {
    pub async fn open(root: impl AsRef<Path>, shard_depth: u8) -> Result<Self, Error> {
        if shard_depth > MAX_SHARD_DEPTH {
            return Err(Error::Config(format!(
                "shard_depth {} is out of range (0-{})",
                shard_depth, MAX_SHARD_DEPTH
            )));
        }
        let root = root.as_ref().to_path_buf();
        for sub in [LINKS_DIR, IMAGES_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| Error::Open { path: dir, source })?;
        }
        info!(root = %root.display(), shard_depth, "opened tile directory");

        Ok(FilesystemTileStore {
            root,
            shard_depth,
            unique_tiles: AtomicU64::new(0),
        })
    }

    /// `links/<z>/<x>/<y>.png` under the root.
    pub fn link_path(&self, tile: Tile) -> PathBuf {
        self.root
            .join(LINKS_DIR)
            .join(tile.zoom.to_string())
            .join(tile.column.to_string())
            .join(format!("{}.{}", tile.row, EXTENSION))
    }

    /// Blob path relative to `images/`, with one directory per shard level.
    pub fn blob_relative_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.to_hex();
        let mut path = PathBuf::new();
        for level in 0..usize::from(self.shard_depth) {
            path.push(&hex[level * 2..level * 2 + 2]);
        }
        path.push(format!("{}.{}", hex, EXTENSION));
        path
    }

    pub fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root
            .join(IMAGES_DIR)
            .join(self.blob_relative_path(digest))
    }

    /// Writes `data` under the digest name unless it is already there.
    /// Returns whether this call created the blob.
    async fn publish_blob(&self, blob: &Path, data: &[u8]) -> Result<bool, Error> {
        if fs::symlink_metadata(blob).await.is_ok() {
            trace!(path = %blob.display(), "image already existed");
            return Ok(false);
        }

        let temp = temp_path(blob);
        if let Err(e) = write_synced(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::io("writing", temp, e));
        }

        let published = fs::hard_link(&temp, blob).await;
        if let Err(e) = fs::remove_file(&temp).await {
            warn!(path = %temp.display(), error = %e, "could not remove temporary image");
        }
        match published {
            Ok(()) => {
                debug!(path = %blob.display(), bytes = data.len(), "wrote image");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                trace!(path = %blob.display(), "image already existed");
                Ok(false)
            }
            Err(e) => Err(Error::io("publishing", blob, e)),
        }
    }

}

/// A fresh name next to `blob`. The random suffix keeps files left behind by
/// a crashed run from colliding with later writes of the same digest.
fn temp_path(blob: &Path) -> PathBuf {
    let name = blob
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    blob.with_file_name(format!(".{}.{:016x}.tmp", name, rand::random::<u64>()))
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await
}

async fn create_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io("creating directory", parent, e))?;
    }
    Ok(())
}

#[async_trait]
impl TileStore for FilesystemTileStore {
    async fn already_rendered(&self, tile: Tile) -> Result<bool, Error> {
        let link = self.link_path(tile);
        let rendered = fs::symlink_metadata(&link)
            .await
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        trace!(%tile, rendered, "checked link");
        Ok(rendered)
    }

    async fn store_tile(&self, tile: Tile, data: Vec<u8>) -> Result<(), Error> {
        let digest = ContentDigest::of(&data);
        let relative = self.blob_relative_path(&digest);
        let blob = self.root.join(IMAGES_DIR).join(&relative);
        let link = self.link_path(tile);

        create_parent(&blob).await?;
        if self.publish_blob(&blob, &data).await? {
            self.unique_tiles.fetch_add(1, Ordering::Relaxed);
        }

        // links/<z>/<x>/<y>.png sits three directories below the root.
        let target = Path::new("../../..").join(IMAGES_DIR).join(&relative);
        create_parent(&link).await?;
        match fs::symlink(&target, &link).await {
            Ok(()) => {
                trace!(%tile, target = %target.display(), "created link");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                trace!(%tile, "link already existed");
                Ok(())
            }
            Err(e) => Err(Error::io("creating link", link, e)),
        }
    }

    fn unique_tiles(&self) -> u64 {
        self.unique_tiles.load(Ordering::Relaxed)
    }
}
