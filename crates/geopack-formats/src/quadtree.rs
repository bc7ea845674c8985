//! Quadtree path keys
//!
//! A [`QuadtreePath`] addresses one node of the global quadtree: a level
//! (0 for the root, up to [`MAX_LEVEL`]) plus one child selector (0-3) per
//! level. The packed form is a single `u64`:
//!
//! ```text
//! bit 63                                    bit 16        bit 0
//! | b0 b0 | b1 b1 | ... | b23 b23 | 0 ... 0 |   level (16 bits)  |
//! ```
//!
//! Branches are stored most-significant first, so ordering by the branch
//! bits of the common prefix and then by level gives preorder traversal
//! order: every ancestor sorts before all of its descendants, and siblings
//! sort by child index.

use crate::error::{FormatError, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Deepest level a path can address.
pub const MAX_LEVEL: u32 = 24;

/// Serialized size of a path in bytes.
pub const QUADTREE_PATH_SIZE: usize = 8;

const LEVEL_BITS: u32 = 16;
const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;

/// Row bit and column bit contributed by each child selector.
const ROW_BITS: [u32; 4] = [0, 0, 1, 1];
const COL_BITS: [u32; 4] = [0, 1, 1, 0];

/// Mask covering the branch bits of the first `level` levels.
const fn branch_mask(level: u32) -> u64 {
    if level == 0 {
        0
    } else {
        !0u64 << (64 - 2 * level)
    }
}

const fn branch_shift(index: u32) -> u32 {
    62 - 2 * index
}

/// Position of a node in the quadtree, ordered in preorder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QuadtreePath {
    path: u64,
}

impl QuadtreePath {
    /// The root node (level 0).
    pub const fn root() -> Self {
        Self { path: 0 }
    }

    /// Build a path from the first `level` child selectors in `branches`.
    pub fn new(level: u32, branches: &[u8]) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(FormatError::InvalidPath(format!(
                "level {level} exceeds maximum {MAX_LEVEL}"
            )));
        }
        if branches.len() < level as usize {
            return Err(FormatError::InvalidPath(format!(
                "level {level} needs {level} branches, got {}",
                branches.len()
            )));
        }

        let mut path = u64::from(level);
        for (index, &branch) in branches.iter().take(level as usize).enumerate() {
            if branch > 3 {
                return Err(FormatError::InvalidPath(format!(
                    "branch {branch} at level {index} is not in 0..=3"
                )));
            }
            path |= u64::from(branch) << branch_shift(index as u32);
        }
        Ok(Self { path })
    }

    /// Build a path from tile coordinates at `level`.
    ///
    /// `row` and `col` must both be below `2^level`.
    pub fn from_level_row_col(level: u32, row: u32, col: u32) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(FormatError::InvalidPath(format!(
                "level {level} exceeds maximum {MAX_LEVEL}"
            )));
        }
        let limit = 1u64 << level;
        if u64::from(row) >= limit || u64::from(col) >= limit {
            return Err(FormatError::InvalidPath(format!(
                "row {row} / col {col} out of range for level {level}"
            )));
        }

        let mut branches = [0u8; MAX_LEVEL as usize];
        for (index, branch) in branches.iter_mut().take(level as usize).enumerate() {
            let shift = level - 1 - index as u32;
            let row_bit = (row >> shift) & 1;
            let col_bit = (col >> shift) & 1;
            *branch = match (row_bit, col_bit) {
                (0, 0) => 0,
                (0, _) => 1,
                (_, 1) => 2,
                _ => 3,
            };
        }
        Self::new(level, &branches)
    }

    /// Decode a packed path, rejecting non-canonical bit patterns.
    pub fn from_raw(raw: u64) -> Result<Self> {
        let level = (raw & LEVEL_MASK) as u32;
        if level > MAX_LEVEL {
            return Err(FormatError::InvalidPath(format!(
                "packed level {level} exceeds maximum {MAX_LEVEL}"
            )));
        }
        if raw & !(branch_mask(level) | LEVEL_MASK) != 0 {
            return Err(FormatError::InvalidPath(format!(
                "packed path {raw:#018x} has bits below level {level}"
            )));
        }
        Ok(Self { path: raw })
    }

    /// Packed representation as stored on disk.
    pub const fn as_raw(&self) -> u64 {
        self.path
    }

    /// Depth of this node; the root is level 0.
    pub const fn level(&self) -> u32 {
        (self.path & LEVEL_MASK) as u32
    }

    /// Child selector taken at `index` (0-based), if `index < level`.
    pub fn branch(&self, index: u32) -> Option<u8> {
        (index < self.level()).then(|| ((self.path >> branch_shift(index)) & 0x3) as u8)
    }

    /// Child selectors from the root down to this node.
    pub fn branches(&self) -> Vec<u8> {
        (0..self.level()).filter_map(|i| self.branch(i)).collect()
    }

    /// Tile coordinates `(level, row, col)` of this node.
    pub fn level_row_col(&self) -> (u32, u32, u32) {
        let mut row = 0;
        let mut col = 0;
        for branch in self.branches() {
            row = (row << 1) | ROW_BITS[branch as usize];
            col = (col << 1) | COL_BITS[branch as usize];
        }
        (self.level(), row, col)
    }

    /// Parent node, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let level = self.level();
        (level > 0).then(|| Self {
            path: (self.path & branch_mask(level - 1)) | u64::from(level - 1),
        })
    }

    /// Child `branch` (0-3), or `None` at [`MAX_LEVEL`] or for a bad branch.
    pub fn child(&self, branch: u8) -> Option<Self> {
        let level = self.level();
        if level >= MAX_LEVEL || branch > 3 {
            return None;
        }
        Some(Self {
            path: (self.path & branch_mask(level))
                | (u64::from(branch) << branch_shift(level))
                | u64::from(level + 1),
        })
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        let level = self.level();
        level < other.level() && (other.path & branch_mask(level)) == (self.path & branch_mask(level))
    }

    /// True if `self` comes strictly after `other` in preorder.
    pub fn follows(&self, other: &Self) -> bool {
        self > other
    }

    /// Step to the next node in preorder among nodes no deeper than
    /// `max_level`.
    ///
    /// Returns `false` (leaving the path at the root) once the walk has
    /// visited the last node.
    pub fn advance(&mut self, max_level: u32) -> bool {
        let max_level = max_level.min(MAX_LEVEL);
        if self.level() < max_level {
            if let Some(child) = self.child(0) {
                *self = child;
                return true;
            }
        }

        loop {
            let level = self.level();
            if level == 0 {
                return false;
            }
            let last = self.branch(level - 1).unwrap_or(3);
            // Level is at least 1 here so the parent exists.
            let parent = self.parent().unwrap_or_default();
            if last < 3 {
                if let Some(sibling) = parent.child(last + 1) {
                    *self = sibling;
                    return true;
                }
            }
            *self = parent;
        }
    }

    /// Serialize to the 8-byte little-endian stored form.
    pub const fn to_bytes(&self) -> [u8; QUADTREE_PATH_SIZE] {
        self.path.to_le_bytes()
    }

    /// Deserialize from the 8-byte little-endian stored form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let bytes: [u8; QUADTREE_PATH_SIZE] = data
            .get(..QUADTREE_PATH_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(FormatError::TruncatedData {
                expected: QUADTREE_PATH_SIZE,
                actual: data.len(),
            })?;
        Self::from_raw(u64::from_le_bytes(bytes))
    }
}

impl Ord for QuadtreePath {
    fn cmp(&self, other: &Self) -> Ordering {
        let common = self.level().min(other.level());
        let mask = branch_mask(common);
        (self.path & mask)
            .cmp(&(other.path & mask))
            .then_with(|| self.level().cmp(&other.level()))
    }
}

impl PartialOrd for QuadtreePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for QuadtreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for branch in self.branches() {
            write!(f, "{branch}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for QuadtreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuadtreePath(\"{self}\")")
    }
}

impl FromStr for QuadtreePath {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self> {
        let branches = s
            .bytes()
            .map(|b| match b {
                b'0'..=b'3' => Ok(b - b'0'),
                other => Err(FormatError::InvalidPath(format!(
                    "unexpected character {:?} in {s:?}",
                    char::from(other)
                ))),
            })
            .collect::<Result<Vec<u8>>>()?;
        let level = u32::try_from(branches.len())
            .map_err(|_| FormatError::InvalidPath(format!("path {s:?} too long")))?;
        Self::new(level, &branches)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BLIST: [u8; 24] = [
        1, 2, 0, 0, 3, 1, 1, 3, 2, 1, 0, 3, 3, 3, 3, 1, 1, 2, 2, 2, 3, 0, 0, 0,
    ];

    fn path(s: &str) -> QuadtreePath {
        s.parse().expect("valid path")
    }

    #[test]
    fn test_packed_layout() {
        let p = QuadtreePath::new(3, &[1, 2, 3]).unwrap();
        assert_eq!(p.as_raw(), 0x6C00_0000_0000_0003);
        assert_eq!(p.level(), 3);
        assert_eq!(p.to_string(), "123");
        assert_eq!(QuadtreePath::root().as_raw(), 0);
        assert_eq!(QuadtreePath::default(), QuadtreePath::root());
    }

    #[test]
    fn test_string_form() {
        assert_eq!(path("0310221").branches(), vec![0, 3, 1, 0, 2, 2, 1]);
        assert_eq!(path("").level(), 0);
        assert!("0314".parse::<QuadtreePath>().is_err());
        assert!("0".repeat(25).parse::<QuadtreePath>().is_err());
        assert_eq!(path(&"3".repeat(24)).level(), MAX_LEVEL);
    }

    #[test]
    fn test_from_raw_rejects_stray_bits() {
        assert!(QuadtreePath::from_raw(0x6C00_0000_0000_0003).is_ok());
        // branch bits below level 2
        assert!(QuadtreePath::from_raw(0x6C00_0000_0000_0002).is_err());
        // level above maximum
        assert!(QuadtreePath::from_raw(25).is_err());
    }

    #[test]
    fn test_level_row_col() {
        for level in 0..=MAX_LEVEL {
            let p = QuadtreePath::new(level, &BLIST).unwrap();
            let (l, row, col) = p.level_row_col();
            assert_eq!(l, level);
            let q = QuadtreePath::from_level_row_col(level, row, col).unwrap();
            assert_eq!(p, q);
        }
        assert!(QuadtreePath::from_level_row_col(2, 4, 0).is_err());
    }

    #[test]
    fn test_parent_child() {
        for level in 0..MAX_LEVEL {
            let parent = QuadtreePath::new(level, &BLIST).unwrap();
            for i in 0..4 {
                let child = parent.child(i).unwrap();
                assert_eq!(child.level(), level + 1);
                assert_eq!(child.parent(), Some(parent));
                assert!(parent.is_ancestor_of(&child));
                assert!(!child.is_ancestor_of(&parent));
            }
        }
        assert!(QuadtreePath::new(MAX_LEVEL, &BLIST).unwrap().child(0).is_none());
        assert!(QuadtreePath::root().parent().is_none());
    }

    #[test]
    fn test_preorder_ordering() {
        for level in 0..MAX_LEVEL {
            let parent = QuadtreePath::new(level, &BLIST).unwrap();
            assert_eq!(parent.cmp(&parent.clone()), Ordering::Equal);
            let children: Vec<_> = (0..4).map(|i| parent.child(i).unwrap()).collect();
            for (i, child) in children.iter().enumerate() {
                assert!(parent < *child);
                assert!(child.follows(&parent));
                for earlier in &children[..i] {
                    assert!(earlier < child);
                }
            }
        }

        // descendants of an earlier sibling precede a later sibling
        assert!(path("0333") < path("1"));
        assert!(path("01") < path("1"));
        assert!(path("") < path("0"));
        assert!(path("12") > path("1133"));
    }

    #[test]
    fn test_advance_walks_preorder() {
        let mut p = QuadtreePath::root();
        let mut visited = vec![p];
        while p.advance(2) {
            visited.push(p);
        }
        // 1 + 4 + 16 nodes at levels 0..=2
        assert_eq!(visited.len(), 21);
        assert!(visited.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(visited[1], path("0"));
        assert_eq!(visited[2], path("00"));
        assert_eq!(visited[6], path("1"));
        assert_eq!(visited.last().copied(), Some(path("33")));
        assert_eq!(p, QuadtreePath::root());
    }

    #[test]
    fn test_advance_at_max_level_moves_to_sibling() {
        let mut p = path("0123");
        assert!(p.advance(4));
        assert_eq!(p, path("013"));
        let mut p = path("013");
        assert!(p.advance(3));
        assert_eq!(p, path("02"));
    }

    #[test]
    fn test_bytes() {
        let p = path("0310221");
        let bytes = p.to_bytes();
        assert_eq!(QuadtreePath::from_bytes(&bytes).unwrap(), p);
        assert!(QuadtreePath::from_bytes(&bytes[..4]).is_err());
    }

    fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec(0u8..4, 0..=MAX_LEVEL as usize)
            .prop_map(|v| v.into_iter().map(|b| char::from(b'0' + b)).collect())
    }

    proptest! {
        /// Preorder on paths matches lexicographic order on their digit strings
        #[test]
        fn ordering_matches_string_order(a in arb_path(), b in arb_path()) {
            let pa: QuadtreePath = a.parse().unwrap();
            let pb: QuadtreePath = b.parse().unwrap();
            prop_assert_eq!(pa.cmp(&pb), a.cmp(&b));
        }

        #[test]
        fn raw_form_is_canonical(a in arb_path()) {
            let p: QuadtreePath = a.parse().unwrap();
            prop_assert_eq!(QuadtreePath::from_raw(p.as_raw()).unwrap(), p);
            prop_assert_eq!(p.to_string(), a);
        }
    }
}
