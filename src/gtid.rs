//! Replication Position Algebra (spec §4.2, component C2).
//!
//! A `Position` is a GTID set: for the `Mysql56` flavor, a mapping from
//! source UUID to a set of sequence ranges; for the `FilePos` flavor, a
//! single ordered `(file, offset)` coordinate. The two flavors share this
//! module's interface but never interoperate — any binary operation across
//! flavors returns [`ErsError::FlavorMismatch`].
//!
//! External representation: `FLAVOR/<body>`, where body is
//! `<uuid>:<range>[,<uuid>:<range>]*` for `MySQL56` (each range a single
//! integer or a `low-high` pair), or `<file>:<pos>` for `FilePos`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErsError, Result};

/// Inclusive, merged, sorted sequence ranges for one source UUID.
type Ranges = Vec<(u64, u64)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Mysql56(BTreeMap<String, Ranges>),
    FilePos { file: u64, pos: u64 },
}

impl Position {
    /// An empty MySQL56 set — the "uninitialized replica" zero position
    /// spec §3 refers to.
    pub fn zero_mysql56() -> Self {
        Position::Mysql56(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Position::Mysql56(set) => set.values().all(|r| r.is_empty()),
            Position::FilePos { file, pos } => *file == 0 && *pos == 0,
        }
    }

    fn flavor_name(&self) -> &'static str {
        match self {
            Position::Mysql56(_) => "MySQL56",
            Position::FilePos { .. } => "FilePos",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (flavor, body) = s
            .split_once('/')
            .ok_or_else(|| ErsError::Parse(format!("missing flavor prefix in {s:?}")))?;
        match flavor {
            "MySQL56" => parse_mysql56(body),
            "FilePos" => parse_filepos(body),
            other => Err(ErsError::Parse(format!("unknown flavor {other:?}"))),
        }
    }

    pub fn equal(a: &Position, b: &Position) -> Result<bool> {
        Ok(Position::subset(a, b)? && Position::subset(b, a)?)
    }

    pub fn subset(a: &Position, b: &Position) -> Result<bool> {
        match (a, b) {
            (Position::Mysql56(a), Position::Mysql56(b)) => {
                for (uuid, a_ranges) in a {
                    let b_ranges = b.get(uuid).map(Vec::as_slice).unwrap_or(&[]);
                    if !ranges_subset(a_ranges, b_ranges) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Position::FilePos { file: af, pos: ap }, Position::FilePos { file: bf, pos: bp }) => {
                Ok((af, ap) <= (bf, bp))
            }
            _ => Err(flavor_mismatch(a, b)),
        }
    }

    pub fn union(a: &Position, b: &Position) -> Result<Position> {
        match (a, b) {
            (Position::Mysql56(a), Position::Mysql56(b)) => {
                let mut out = a.clone();
                for (uuid, b_ranges) in b {
                    let entry = out.entry(uuid.clone()).or_default();
                    entry.extend_from_slice(b_ranges);
                    *entry = merge_ranges(entry);
                }
                Ok(Position::Mysql56(out))
            }
            (Position::FilePos { file: af, pos: ap }, Position::FilePos { file: bf, pos: bp }) => {
                Ok(if (af, ap) >= (bf, bp) {
                    a.clone()
                } else {
                    b.clone()
                })
            }
            _ => Err(flavor_mismatch(a, b)),
        }
    }

    pub fn subtract(a: &Position, b: &Position) -> Result<Position> {
        match (a, b) {
            (Position::Mysql56(a), Position::Mysql56(b)) => {
                let mut out = BTreeMap::new();
                for (uuid, a_ranges) in a {
                    let b_ranges = b.get(uuid).map(Vec::as_slice).unwrap_or(&[]);
                    let remainder = subtract_ranges(a_ranges, b_ranges);
                    if !remainder.is_empty() {
                        out.insert(uuid.clone(), remainder);
                    }
                }
                Ok(Position::Mysql56(out))
            }
            (Position::FilePos { file: af, pos: ap }, Position::FilePos { file: bf, pos: bp }) => {
                Ok(if (af, ap) > (bf, bp) {
                    a.clone()
                } else {
                    Position::FilePos { file: 0, pos: 0 }
                })
            }
            _ => Err(flavor_mismatch(a, b)),
        }
    }

    /// `at_least(self, reference)` — "has caught up to `reference`".
    pub fn at_least(&self, reference: &Position) -> Result<bool> {
        Position::subset(reference, self)
    }

    /// Strictly ahead: `reference` is a proper subset of `self`.
    pub fn ahead_of(&self, reference: &Position) -> Result<bool> {
        Ok(Position::subset(reference, self)? && !Position::equal(self, reference)?)
    }

    /// Neither a subset of the other.
    pub fn diverges_from(&self, other: &Position) -> Result<bool> {
        Ok(!Position::subset(self, other)? && !Position::subset(other, self)?)
    }

    /// GTIDs on `self` from a source `reference` has never seen at all —
    /// the errant transactions of spec §3's glossary entry, as distinct
    /// from `subtract`'s plain set difference. A source UUID `reference`
    /// already recognizes is trusted lineage no matter how far `self` has
    /// advanced along it; only a UUID absent from `reference` entirely
    /// counts as errant. `FilePos` is a single total-ordered coordinate
    /// with no branching, so it can never carry an errant source.
    pub fn errant_against(&self, reference: &Position) -> Result<Position> {
        match (self, reference) {
            (Position::Mysql56(set), Position::Mysql56(ref_set)) => {
                let mut out = BTreeMap::new();
                for (uuid, ranges) in set {
                    if !ref_set.contains_key(uuid) {
                        out.insert(uuid.clone(), ranges.clone());
                    }
                }
                Ok(Position::Mysql56(out))
            }
            (Position::FilePos { .. }, Position::FilePos { .. }) => {
                Ok(Position::FilePos { file: 0, pos: 0 })
            }
            _ => Err(flavor_mismatch(self, reference)),
        }
    }
}

fn flavor_mismatch(a: &Position, b: &Position) -> ErsError {
    ErsError::FlavorMismatch(format!("{} vs {}", a.flavor_name(), b.flavor_name()))
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Mysql56(set) => {
                write!(f, "MySQL56/")?;
                let mut first = true;
                for (uuid, ranges) in set {
                    for (lo, hi) in ranges {
                        if !first {
                            write!(f, ",")?;
                        }
                        first = false;
                        if lo == hi {
                            write!(f, "{uuid}:{lo}")?;
                        } else {
                            write!(f, "{uuid}:{lo}-{hi}")?;
                        }
                    }
                }
                Ok(())
            }
            Position::FilePos { file, pos } => write!(f, "FilePos/{file}:{pos}"),
        }
    }
}

fn parse_mysql56(body: &str) -> Result<Position> {
    let mut set: BTreeMap<String, Ranges> = BTreeMap::new();
    if body.is_empty() {
        return Ok(Position::Mysql56(set));
    }
    for segment in body.split(',') {
        let (uuid, range) = segment
            .split_once(':')
            .ok_or_else(|| ErsError::Parse(format!("malformed GTID segment {segment:?}")))?;
        uuid::Uuid::parse_str(uuid)
            .map_err(|e| ErsError::Parse(format!("invalid source UUID {uuid:?}: {e}")))?;
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (
                lo.parse::<u64>()
                    .map_err(|_| ErsError::Parse(format!("invalid range {range:?}")))?,
                hi.parse::<u64>()
                    .map_err(|_| ErsError::Parse(format!("invalid range {range:?}")))?,
            ),
            None => {
                let v = range
                    .parse::<u64>()
                    .map_err(|_| ErsError::Parse(format!("invalid range {range:?}")))?;
                (v, v)
            }
        };
        if lo > hi {
            return Err(ErsError::Parse(format!("inverted range {range:?}")));
        }
        set.entry(uuid.to_lowercase()).or_default().push((lo, hi));
    }
    for ranges in set.values_mut() {
        *ranges = merge_ranges(ranges);
    }
    Ok(Position::Mysql56(set))
}

fn parse_filepos(body: &str) -> Result<Position> {
    let (file, pos) = body
        .split_once(':')
        .ok_or_else(|| ErsError::Parse(format!("malformed FilePos body {body:?}")))?;
    let file = file
        .parse::<u64>()
        .map_err(|_| ErsError::Parse(format!("invalid file number {file:?}")))?;
    let pos = pos
        .parse::<u64>()
        .map_err(|_| ErsError::Parse(format!("invalid offset {pos:?}")))?;
    Ok(Position::FilePos { file, pos })
}

fn merge_ranges(ranges: &[(u64, u64)]) -> Ranges {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable();
    let mut merged: Ranges = Vec::with_capacity(sorted.len());
    for (lo, hi) in sorted {
        match merged.last_mut() {
            Some((_, last_hi)) if lo <= *last_hi + 1 => {
                *last_hi = (*last_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

/// True iff every range in `a` is covered by some range in `b`. Both slices
/// must already be sorted and merged.
fn ranges_subset(a: &[(u64, u64)], b: &[(u64, u64)]) -> bool {
    for &(a_lo, a_hi) in a {
        let covered = b.iter().any(|&(b_lo, b_hi)| b_lo <= a_lo && a_hi <= b_hi);
        if !covered {
            return false;
        }
    }
    true
}

/// `a` minus `b`, both sorted/merged; result sorted/merged.
fn subtract_ranges(a: &[(u64, u64)], b: &[(u64, u64)]) -> Ranges {
    let mut result = Vec::new();
    for &(mut lo, hi) in a {
        for &(b_lo, b_hi) in b {
            if b_hi < lo || b_lo > hi {
                continue;
            }
            if b_lo > lo {
                result.push((lo, b_lo - 1));
            }
            if b_hi >= lo {
                lo = b_hi + 1;
            }
            if lo > hi {
                break;
            }
        }
        if lo <= hi {
            result.push((lo, hi));
        }
    }
    merge_ranges(&result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: &str = "00000000-0000-0000-0000-000000000001";
    const U2: &str = "00000000-0000-0000-0000-000000000002";

    #[test]
    fn parses_single_and_range_segments() {
        let p = Position::parse(&format!("MySQL56/{U1}:1-21")).unwrap();
        match p {
            Position::Mysql56(set) => assert_eq!(set.get(U1).unwrap(), &vec![(1, 21)]),
            _ => panic!("wrong flavor"),
        }
    }

    #[test]
    fn subset_and_equal() {
        let a = Position::parse(&format!("MySQL56/{U1}:1-20")).unwrap();
        let b = Position::parse(&format!("MySQL56/{U1}:1-26")).unwrap();
        assert!(Position::subset(&a, &b).unwrap());
        assert!(!Position::subset(&b, &a).unwrap());
        assert!(!Position::equal(&a, &b).unwrap());
        assert!(b.ahead_of(&a).unwrap());
    }

    #[test]
    fn union_merges_adjacent_and_overlapping_ranges() {
        let a = Position::parse(&format!("MySQL56/{U1}:1-10")).unwrap();
        let b = Position::parse(&format!("MySQL56/{U1}:5-15")).unwrap();
        let u = Position::union(&a, &b).unwrap();
        match u {
            Position::Mysql56(set) => assert_eq!(set.get(U1).unwrap(), &vec![(1, 15)]),
            _ => panic!("wrong flavor"),
        }
    }

    #[test]
    fn subtract_detects_errant_gtids() {
        let t = Position::parse(&format!("MySQL56/{U1}:1-19,{U2}:1-1")).unwrap();
        let reference = Position::parse(&format!("MySQL56/{U1}:1-20")).unwrap();
        let errant = Position::subtract(&t, &reference).unwrap();
        assert!(!errant.is_empty());
        match errant {
            Position::Mysql56(set) => {
                assert!(!set.contains_key(U1));
                assert_eq!(set.get(U2).unwrap(), &vec![(1, 1)]);
            }
            _ => panic!("wrong flavor"),
        }
    }

    #[test]
    fn errant_against_ignores_a_known_sources_extra_progress() {
        let ahead = Position::parse(&format!("MySQL56/{U1}:1-26")).unwrap();
        let behind = Position::parse(&format!("MySQL56/{U1}:1-21")).unwrap();
        assert!(ahead.errant_against(&behind).unwrap().is_empty());
    }

    #[test]
    fn errant_against_flags_a_wholly_unknown_source() {
        let t = Position::parse(&format!("MySQL56/{U1}:1-19,{U2}:1-1")).unwrap();
        let reference = Position::parse(&format!("MySQL56/{U1}:1-20")).unwrap();
        let errant = t.errant_against(&reference).unwrap();
        match errant {
            Position::Mysql56(set) => {
                assert!(!set.contains_key(U1));
                assert_eq!(set.get(U2).unwrap(), &vec![(1, 1)]);
            }
            _ => panic!("wrong flavor"),
        }
    }

    #[test]
    fn divergent_positions_have_no_subset_relation() {
        let a = Position::parse(&format!("MySQL56/{U1}:1-21,{U2}:1-5")).unwrap();
        let b = Position::parse(&format!("MySQL56/{U1}:1-22")).unwrap();
        assert!(a.diverges_from(&b).unwrap());
    }

    #[test]
    fn mixed_flavor_ops_error() {
        let a = Position::parse(&format!("MySQL56/{U1}:1-1")).unwrap();
        let b = Position::parse("FilePos/3:100").unwrap();
        assert!(matches!(Position::subset(&a, &b), Err(ErsError::FlavorMismatch(_))));
    }

    #[test]
    fn filepos_ordering() {
        let a = Position::parse("FilePos/3:100").unwrap();
        let b = Position::parse("FilePos/3:500").unwrap();
        assert!(Position::subset(&a, &b).unwrap());
        assert!(b.ahead_of(&a).unwrap());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(Position::parse("garbage").is_err());
        assert!(Position::parse("MySQL56/not-a-uuid:1-2").is_err());
    }
}
