//! Fog-of-war grid geometry.
//!
//! The map is cut into square cells of `grid_size` map units. A cell is
//! addressed by `(col, row)` and travels on the wire as the canonical string
//! `"col,row"`. Only revealed cells are stored, so memory grows with the
//! revealed area rather than the map size.

use crate::protocol::ProtocolError;
use serde::de::{self, Visitor};
use serde::ser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// Largest brush radius [`brush_cells`] will stamp. Larger radii are clamped.
pub const MAX_BRUSH_RADIUS: u32 = 32;

/// Longest canonical key: `"-2147483648,-2147483648"`.
const MAX_KEY_LEN: usize = 23;

/// Integer address of one fog cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub col: i32,
    pub row: i32,
}

impl CellKey {
    /// Cell at column `col`, row `row`.
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// Cell containing the map point `(x, y)`. Floors toward negative
    /// infinity so points left of / above the origin land in negative cells.
    pub fn containing(x: f64, y: f64, grid_size: u32) -> Self {
        let grid = grid_size.max(1) as f64;
        Self {
            col: (x / grid).floor() as i32,
            row: (y / grid).floor() as i32,
        }
    }

    /// Neighbouring cell. Saturates at the edge of the `i32` grid, which
    /// is where [`CellKey::containing`] puts points far outside any map.
    pub fn offset(self, dcol: i32, drow: i32) -> Self {
        Self {
            col: self.col.saturating_add(dcol),
            row: self.row.saturating_add(drow),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.col, self.row)
    }
}

impl FromStr for CellKey {
    type Err = ProtocolError;

    /// Accepts only the canonical form: two base-10 integers, one comma,
    /// no whitespace, no leading `+`, no redundant leading zeros.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidCellKey(s.to_string());
        let (col, row) = s.split_once(',').ok_or_else(invalid)?;
        match (canonical_component(col), canonical_component(row)) {
            (Some(col), Some(row)) => Ok(CellKey { col, row }),
            _ => Err(invalid()),
        }
    }
}

/// Parses one coordinate, refusing anything `i32`'s `Display` would not
/// produce: `+`, whitespace, leading zeros, `-0`.
fn canonical_component(s: &str) -> Option<i32> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let canonical = match digits.as_bytes() {
        [] => false,
        [b'0'] => digits.len() == s.len(),
        [b'0', ..] => false,
        bytes => bytes.iter().all(u8::is_ascii_digit),
    };
    if canonical {
        s.parse().ok()
    } else {
        None
    }
}

impl From<CellKey> for String {
    fn from(key: CellKey) -> Self {
        key.to_string()
    }
}

// Fog snapshots carry thousands of keys, so the string form is written
// from a stack buffer and read from the borrowed frame.
impl Serialize for CellKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut buf = [0u8; MAX_KEY_LEN];
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        write!(cursor, "{},{}", self.col, self.row).map_err(ser::Error::custom)?;
        let len = cursor.position() as usize;
        let text = std::str::from_utf8(&buf[..len]).map_err(ser::Error::custom)?;
        serializer.serialize_str(text)
    }
}

struct CellKeyVisitor;

impl<'de> Visitor<'de> for CellKeyVisitor {
    type Value = CellKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a cell key of the form \"col,row\"")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<CellKey, E> {
        value.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for CellKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(CellKeyVisitor)
    }
}

/// Cells covered by a circular brush of integer `radius` centred on `center`.
///
/// Includes every offset `(dx, dy)` with both components in
/// `[-(radius - 1), radius - 1]` and `dx² + dy² < radius²`. Radius 1 is a
/// single cell; radius 0 covers nothing. Radii above [`MAX_BRUSH_RADIUS`]
/// stamp as [`MAX_BRUSH_RADIUS`].
pub fn brush_cells(center: CellKey, radius: u32) -> Vec<CellKey> {
    let radius = radius.min(MAX_BRUSH_RADIUS);
    if radius == 0 {
        return Vec::new();
    }
    let reach = radius as i64 - 1;
    let limit = (radius as i64) * (radius as i64);
    let mut cells = Vec::new();
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            if dx * dx + dy * dy < limit {
                cells.push(center.offset(dx as i32, dy as i32));
            }
        }
    }
    cells
}

/// Sparse set of revealed cells; a missing key means hidden.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FogState {
    pub revealed_cells: BTreeSet<CellKey>,
}

impl FogState {
    /// A cell is visible to players only once revealed.
    pub fn is_revealed(&self, cell: CellKey) -> bool {
        self.revealed_cells.contains(&cell)
    }

    /// Set union. Returns how many cells changed state.
    pub fn reveal<I>(&mut self, cells: I) -> usize
    where
        I: IntoIterator<Item = CellKey>,
    {
        cells
            .into_iter()
            .filter(|cell| self.revealed_cells.insert(*cell))
            .count()
    }

    /// Set difference. Returns how many cells changed state.
    pub fn erase<I>(&mut self, cells: I) -> usize
    where
        I: IntoIterator<Item = CellKey>,
    {
        cells
            .into_iter()
            .filter(|cell| self.revealed_cells.remove(cell))
            .count()
    }

    /// Applies one reveal-or-erase batch, as carried by a `REVEAL_FOG` request.
    pub fn apply(&mut self, cells: &[CellKey], erase: bool) -> usize {
        if erase {
            self.erase(cells.iter().copied())
        } else {
            self.reveal(cells.iter().copied())
        }
    }

    /// Hides every cell again, as `RESET_FOG` does.
    pub fn reset(&mut self) {
        self.revealed_cells.clear();
    }

    /// Revealed cells in key order. This is the list `FOG_UPDATED` carries,
    /// so every receiver sees the same order.
    pub fn cells(&self) -> Vec<CellKey> {
        self.revealed_cells.iter().copied().collect()
    }

    /// Number of revealed cells.
    pub fn len(&self) -> usize {
        self.revealed_cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revealed_cells.is_empty()
    }
}

impl FromIterator<CellKey> for FogState {
    fn from_iter<T: IntoIterator<Item = CellKey>>(iter: T) -> Self {
        Self {
            revealed_cells: iter.into_iter().collect(),
        }
    }
}

/// Overlay alpha a renderer should paint over `cell`.
///
/// Hidden cells are fully opaque for players and half-opaque for the
/// moderator, who always sees what lies underneath.
pub fn overlay_alpha(fog: &FogState, cell: CellKey, moderator: bool) -> f32 {
    if fog.is_revealed(cell) {
        0.0
    } else if moderator {
        0.5
    } else {
        1.0
    }
}
