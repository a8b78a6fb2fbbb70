//! Tile coordinates and their compact key form.

use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

use crate::error::Error;

/// A slippy map tile in XYZ form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tile {
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
}

impl Tile {
    pub const fn new(zoom: u8, column: u32, row: u32) -> Self {
        Tile { zoom, column, row }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.column, self.row)
    }
}

impl FromStr for Tile {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        let zoom = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let column = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let row = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Tile::new(zoom, column, row))
    }
}

/// Reads a tile list, one `Z/X/Y` per line. Blank lines are skipped.
///
/// This is the format produced by `tilestache-list` and similar tools. A
/// malformed line rejects the whole list, since silently dropping coordinates
/// would make a run look complete when it is not.
pub fn read_tiles<R: BufRead>(reader: R) -> Result<Vec<Tile>, Error> {
    let mut tiles = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| Error::io("reading tile list", "<input>", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let tile = line.parse::<Tile>().map_err(|_| Error::TileSyntax {
            line: i + 1,
            text: line.clone(),
        })?;
        tiles.push(tile);
    }
    Ok(tiles)
}

/// Deepest zoom level representable by [`TileKey`].
pub const MAX_PACKED_ZOOM: u8 = 28;

const AXIS_BITS: u32 = 29;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
const ZOOM_SHIFT: u32 = 2 * AXIS_BITS;

/// A tile packed into 64 bits as `zoom << 58 | column << 29 | row`.
///
/// This layout is what the rendered-set of an existing MBTiles store is
/// rebuilt into, so it has to stay stable. Column and row get 29 bits each,
/// which caps zoom at [`MAX_PACKED_ZOOM`]; deeper tiles, and coordinates that
/// do not fit 29 bits at any zoom, have no key and callers get `None` back
/// instead of a silently aliased value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileKey(u64);

impl TileKey {
    pub fn pack(tile: Tile) -> Option<TileKey> {
        let column = u64::from(tile.column);
        let row = u64::from(tile.row);
        if tile.zoom > MAX_PACKED_ZOOM || column > AXIS_MASK || row > AXIS_MASK {
            return None;
        }
        Some(TileKey(
            (u64::from(tile.zoom) << ZOOM_SHIFT) | (column << AXIS_BITS) | row,
        ))
    }

}

impl TryFrom<Tile> for TileKey {
    type Error = Error;

    fn try_from(tile: Tile) -> Result<Self, Self::Error> {
        TileKey::pack(tile).ok_or(Error::BeyondKeyRange(tile))
    }
}
