//! Render job configuration, read from YAML.
//!
//! ```yaml
//! mbtiles: out/world.mbtiles   # or `directory: out/tiles`
//! workers: 8
//! on_conflict: keep
//! metadata:
//!   name: World
//!   format: png
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Deepest supported blob sharding: 16 levels of 2 hex characters use the
/// whole 32-character digest.
pub const MAX_SHARD_DEPTH: u8 = 16;

/// What the transactional store does when a coordinate that is already
/// mapped gets stored again.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Point the coordinate at the new image (the style may have changed).
    #[default]
    Overwrite,
    /// Leave the first stored image in place.
    Keep,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct RenderConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub mbtiles: Option<PathBuf>,
    #[serde(default)]
    pub shard_depth: u8,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default)]
    pub shuffle_seed: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_workers() -> usize {
    1
}

fn default_batch_limit() -> usize {
    10_000
}

fn default_progress_interval_ms() -> u64 {
    1_000
}

/// Where tiles end up. Built by [`RenderConfig::destination`], which is the
/// only place the mutually exclusive destination keys are checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Directory { root: PathBuf, shard_depth: u8 },
    MbTiles {
        path: PathBuf,
        on_conflict: ConflictPolicy,
        batch_limit: usize,
    },
}

impl RenderConfig {
    /// Constructs a new RenderConfig from a YAML string and validates it.
    pub fn from(data: &str) -> Result<RenderConfig, Error> {
        let config: RenderConfig = serde_yaml::from_str(data)?;
        config.destination()?;
        if config.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if config.batch_limit == 0 {
            return Err(Error::Config("batch_limit must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<RenderConfig, Error> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        RenderConfig::from(&data)
    }

    /// A config with only a destination set and everything else defaulted.
    pub fn for_destination(destination: &Destination) -> RenderConfig {
        let mut config = RenderConfig {
            directory: None,
            mbtiles: None,
            shard_depth: 0,
            workers: default_workers(),
            on_conflict: ConflictPolicy::default(),
            batch_limit: default_batch_limit(),
            shuffle_seed: 0,
            progress_interval_ms: default_progress_interval_ms(),
            metadata: BTreeMap::new(),
        };
        match destination {
            Destination::Directory { root, shard_depth } => {
                config.directory = Some(root.clone());
                config.shard_depth = *shard_depth;
            }
            Destination::MbTiles {
                path,
                on_conflict,
                batch_limit,
            } => {
                config.mbtiles = Some(path.clone());
                config.on_conflict = *on_conflict;
                config.batch_limit = *batch_limit;
            }
        }
        config
    }

    pub fn destination(&self) -> Result<Destination, Error> {
        match (&self.directory, &self.mbtiles) {
            (None, None) => Err(Error::Config(
                "no destination: set either `directory` or `mbtiles`".into(),
            )),
            (Some(_), Some(_)) => Err(Error::Config(
                "`directory` and `mbtiles` are mutually exclusive".into(),
            )),
            (Some(root), None) => {
                if self.shard_depth > MAX_SHARD_DEPTH {
                    return Err(Error::Config(format!(
                        "shard_depth {} is out of range (0-{})",
                        self.shard_depth, MAX_SHARD_DEPTH
                    )));
                }
                Ok(Destination::Directory {
                    root: root.clone(),
                    shard_depth: self.shard_depth,
                })
            }
            (None, Some(path)) => Ok(Destination::MbTiles {
                path: path.clone(),
                on_conflict: self.on_conflict,
                batch_limit: self.batch_limit.max(1),
            }),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}
