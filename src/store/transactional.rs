use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::TryStreamExt;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, Row};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::config::ConflictPolicy;
use crate::digest::ContentDigest;
use crate::error::Error;
use crate::store::{TileStore, WriteBehind};
use crate::tile::{Tile, TileKey};

// MBTiles-compatible layout: consumers read the `tiles` view, we write
// `map`/`images` and keep `idmap` so the dedup index survives restarts.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS metadata (
        name TEXT,
        value TEXT,
        PRIMARY KEY (name)
    )",
    "CREATE TABLE IF NOT EXISTS map (
        zoom INTEGER,
        col INTEGER,
        row INTEGER,
        tile_id INTEGER,
        PRIMARY KEY (zoom, col, row)
    ) WITHOUT ROWID",
    "CREATE TABLE IF NOT EXISTS images (
        tile_id INTEGER PRIMARY KEY,
        tile_data BLOB
    )",
    "CREATE VIEW IF NOT EXISTS tiles AS
        SELECT
            map.zoom AS zoom_level,
            map.col AS tile_column,
            map.row AS tile_row,
            images.tile_data AS tile_data
        FROM map
        JOIN images ON images.tile_id = map.tile_id",
    "CREATE TABLE IF NOT EXISTS idmap (
        md5 TEXT,
        tile_id INTEGER
    )",
];

enum WriteOp {
    Insert {
        tile: Tile,
        key: TileKey,
        data: Vec<u8>,
    },
    Metadata {
        name: String,
        value: String,
    },
}

/// State read by workers and written only by the commit task.
#[derive(Default)]
struct Shared {
    rendered: DashSet<TileKey>,
    unique_tiles: AtomicU64,
    pending: AtomicUsize,
}

/// Digest to `images.tile_id`, plus the next free id.
#[derive(Debug, Default)]
struct DedupIndex {
    ids: HashMap<ContentDigest, i64>,
    next_id: i64,
}

impl DedupIndex {
    fn insert_existing(&mut self, digest: ContentDigest, id: i64) {
        self.ids.insert(digest, id);
        self.next_id = self.next_id.max(id + 1);
    }

    /// Returns the id for `digest` and whether it was newly allocated.
    fn resolve(&mut self, digest: ContentDigest) -> (i64, bool) {
        if let Some(&id) = self.ids.get(&digest) {
            return (id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(digest, id);
        (id, true)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Tile store backed by an MBTiles-compatible SQLite database.
///
/// `store_tile` only queues the tile; a single background task owns the
/// database connection and the dedup index, and commits whatever has queued
/// up in one transaction per wake-up. Workers therefore never wait on disk,
/// and the index needs no locking because nothing else touches it.
///
/// `already_rendered` is answered from an in-memory set of packed tile keys
/// loaded at open and grown after each commit. Tiles deeper than zoom 28 have
/// no key and are rejected (see [`TileKey`]).
pub struct TransactionalTileStore {
    path: PathBuf,
    on_conflict: ConflictPolicy,
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    writer: Mutex<Option<JoinHandle<Result<(), Error>>>>,
}

impl TransactionalTileStore {
    pub async fn open(
        path: impl AsRef<Path>,
        on_conflict: ConflictPolicy,
        batch_limit: usize,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .connect()
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut conn).await?;
        }

        let index = load_index(&mut conn).await?;
        let shared = Arc::new(Shared::default());
        load_rendered(&mut conn, &shared.rendered).await?;
        info!(
            path = %path.display(),
            images = index.len(),
            tiles = shared.rendered.len(),
            "opened tile database"
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = Writer {
            conn,
            index,
            shared: shared.clone(),
            on_conflict,
            batch_limit: batch_limit.max(1),
        };
        let handle = tokio::spawn(writer.run(receiver, path.clone()));

        Ok(TransactionalTileStore {
            path,
            on_conflict,
            shared,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Operations accepted but not yet committed.
    pub fn queue_depth(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    fn enqueue(&self, op: WriteOp) -> Result<(), Error> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(Error::StoreClosed)?;
        // Counted before the send so is_flushed can't see the op in flight
        // and report an empty queue.
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(op).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::WriterFailed("commit task is no longer running".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TileStore for TransactionalTileStore {
    async fn already_rendered(&self, tile: Tile) -> Result<bool, Error> {
        let key = TileKey::try_from(tile)?;
        Ok(self.shared.rendered.contains(&key))
    }

    async fn store_tile(&self, tile: Tile, data: Vec<u8>) -> Result<(), Error> {
        let key = TileKey::try_from(tile)?;
        if self.on_conflict == ConflictPolicy::Keep && self.shared.rendered.contains(&key) {
            trace!(%tile, "already mapped, keeping stored image");
            return Ok(());
        }
        self.enqueue(WriteOp::Insert { tile, key, data })
    }

    fn unique_tiles(&self) -> u64 {
        self.shared.unique_tiles.load(Ordering::Relaxed)
    }

    /// Queues an upsert into the `metadata` table.
    fn put_metadata(&self, name: &str, value: &str) -> Result<(), Error> {
        self.enqueue(WriteOp::Metadata {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    fn is_flushed(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) == 0
    }

    async fn close(&self) -> Result<(), Error> {
        // Dropping the only sender ends the commit task's receive loop once
        // the queue is drained.
        drop(self.sender.lock().take());
        let handle = self.writer.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        handle
            .await
            .map_err(|e| Error::WriterFailed(e.to_string()))??;
        info!(path = %self.path.display(), "closed tile database");
        Ok(())
    }

    fn write_behind(&self) -> Option<&dyn WriteBehind> {
        Some(self)
    }
}

impl WriteBehind for TransactionalTileStore {
    fn queue_depth(&self) -> usize {
        TransactionalTileStore::queue_depth(self)
    }
}

struct Writer {
    conn: SqliteConnection,
    index: DedupIndex,
    shared: Arc<Shared>,
    on_conflict: ConflictPolicy,
    batch_limit: usize,
}

impl Writer {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<WriteOp>,
        path: PathBuf,
    ) -> Result<(), Error> {
        if let Err(e) = self.drain(&mut receiver).await {
            error!(path = %path.display(), error = %e, "tile database writer failed");
            return Err(e);
        }
        self.conn.close().await?;
        Ok(())
    }

    async fn drain(&mut self, receiver: &mut mpsc::UnboundedReceiver<WriteOp>) -> Result<(), Error> {
        while let Some(first) = receiver.recv().await {
            let mut batch = vec![first];
            while batch.len() < self.batch_limit {
                match receiver.try_recv() {
                    Ok(op) => batch.push(op),
                    Err(_) => break,
                }
            }
            self.commit(batch).await?;
        }
        Ok(())
    }

    async fn commit(&mut self, batch: Vec<WriteOp>) -> Result<(), Error> {
        let count = batch.len();
        let mut committed = HashSet::with_capacity(count);
        let mut new_images = 0;

        let mut tx = self.conn.begin().await?;
        for op in batch {
            match op {
                WriteOp::Insert { tile, key, data } => {
                    // Under `keep` a coordinate queued twice before its first
                    // commit must not get a second image that nothing maps to.
                    if self.on_conflict == ConflictPolicy::Keep
                        && (committed.contains(&key) || self.shared.rendered.contains(&key))
                    {
                        trace!(%tile, "already mapped, keeping stored image");
                        continue;
                    }
                    if insert_tile(&mut *tx, &mut self.index, self.on_conflict, tile, &data).await? {
                        new_images += 1;
                    }
                    committed.insert(key);
                }
                WriteOp::Metadata { name, value } => {
                    sqlx::query("INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)")
                        .bind(name)
                        .bind(value)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;

        for key in committed {
            self.shared.rendered.insert(key);
        }
        self.shared
            .unique_tiles
            .fetch_add(new_images, Ordering::Relaxed);
        self.shared.pending.fetch_sub(count, Ordering::SeqCst);
        debug!(ops = count, new_images, "committed batch");
        Ok(())
    }
}

/// Writes one tile inside the caller's transaction. Returns whether its image
/// was new.
async fn insert_tile(
    conn: &mut SqliteConnection,
    index: &mut DedupIndex,
    on_conflict: ConflictPolicy,
    tile: Tile,
    data: &[u8],
) -> Result<bool, Error> {
    let digest = ContentDigest::of(data);
    let (tile_id, is_new) = index.resolve(digest);

    if is_new {
        sqlx::query("INSERT INTO idmap (md5, tile_id) VALUES (?, ?)")
            .bind(digest.to_hex())
            .bind(tile_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO images (tile_id, tile_data) VALUES (?, ?)")
            .bind(tile_id)
            .bind(data)
            .execute(&mut *conn)
            .await?;
        trace!(%tile, %digest, tile_id, "new image");
    }

    let sql = match on_conflict {
        ConflictPolicy::Overwrite => {
            "INSERT OR REPLACE INTO map (zoom, col, row, tile_id) VALUES (?, ?, ?, ?)"
        }
        ConflictPolicy::Keep => {
            "INSERT OR IGNORE INTO map (zoom, col, row, tile_id) VALUES (?, ?, ?, ?)"
        }
    };
    sqlx::query(sql)
        .bind(i64::from(tile.zoom))
        .bind(i64::from(tile.column))
        .bind(i64::from(tile.row))
        .bind(tile_id)
        .execute(&mut *conn)
        .await?;
    Ok(is_new)
}

async fn load_index(conn: &mut SqliteConnection) -> Result<DedupIndex, Error> {
    let mut index = DedupIndex::default();
    let mut rows = sqlx::query("SELECT md5, tile_id FROM idmap").fetch(&mut *conn);
    while let Some(record) = rows.try_next().await? {
        let hex: String = record.try_get(0)?;
        let id: i64 = record.try_get(1)?;
        let digest = ContentDigest::from_hex(&hex).ok_or_else(|| Error::CorruptIndex {
            table: "idmap",
            detail: format!("not an md5 digest: {:?}", hex),
        })?;
        index.insert_existing(digest, id);
    }
    Ok(index)
}

async fn load_rendered(conn: &mut SqliteConnection, rendered: &DashSet<TileKey>) -> Result<(), Error> {
    let mut rows = sqlx::query("SELECT zoom, col, row FROM map").fetch(&mut *conn);
    while let Some(record) = rows.try_next().await? {
        let zoom: i64 = record.try_get(0)?;
        let column: i64 = record.try_get(1)?;
        let row: i64 = record.try_get(2)?;
        let key = packed_key(zoom, column, row).ok_or_else(|| Error::CorruptIndex {
            table: "map",
            detail: format!("tile {}/{}/{} has no packed key", zoom, column, row),
        })?;
        rendered.insert(key);
    }
    Ok(())
}

fn packed_key(zoom: i64, column: i64, row: i64) -> Option<TileKey> {
    let tile = Tile::new(
        u8::try_from(zoom).ok()?,
        u32::try_from(column).ok()?,
        u32::try_from(row).ok()?,
    );
    TileKey::pack(tile)
}
