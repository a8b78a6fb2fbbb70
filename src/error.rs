use std::path::PathBuf;

use crate::tile::Tile;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid YAML in render configuration.")]
    ConfigYaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("malformed tile on line {line}: {text:?} (expected Z/X/Y)")]
    TileSyntax { line: usize, text: String },
    #[error("tile {0} is beyond the packed key range (zoom <= 28, column and row < 2^29)")]
    BeyondKeyRange(Tile),
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening tile store at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row in {table}: {detail}")]
    CorruptIndex { table: &'static str, detail: String },
    #[error("tile store is closed")]
    StoreClosed,
    #[error("tile store writer stopped: {0}")]
    WriterFailed(String),
    #[error("render worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("could not set up logging: {0}")]
    Logging(String),
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether this error must stop the whole run.
    ///
    /// Per-tile failures (a single file that could not be written, a tile the
    /// packed key cannot represent) are logged by the worker and the run goes on.
    /// Everything touching the database, the writer task or the configuration
    /// leaves the store in a state that cannot be safely continued from.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Io { .. } | Error::BeyondKeyRange(_))
    }
}
