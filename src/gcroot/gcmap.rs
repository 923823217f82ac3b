// This module holds the data the GC root tracker produces and the collector consumes.
// FrameState is the running (frame size, live roots) pair the tracker carries through a
// function; roots are word offsets relative to the stack pointer at function entry, so
// they are stable while the frame grows and shrinks. A CallSiteDescriptor pins one such
// state to the label of a call's return address. GcMap is the compile-time artifact:
// entries in module order, each naming one of a canonically sorted, deduplicated set of
// shapes. Once the return-address labels have addresses, resolve() turns it into the
// runtime GcMapTable, sorted by address for binary search. The table serialises to a
// little-endian blob and back.

//! Frame shapes and the GC map.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::debug;

use crate::core::error::GcMapError;
use crate::core::location::Target;

/// Frame size and live roots at one program point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FrameState {
    /// Words pushed since function entry, not counting the return address.
    pub frame_size: u32,
    /// Live root slots as (negative) word offsets from the entry stack pointer.
    pub roots: BTreeSet<i32>,
}

impl FrameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Word offset of an entry-relative root from the current stack pointer.
    pub fn sp_offset(&self, root: i32) -> i32 {
        self.frame_size as i32 + root
    }

    /// Whether `root` lies inside the current frame.
    pub fn contains(&self, root: i32) -> bool {
        (0..self.frame_size as i32).contains(&self.sp_offset(root))
    }

    /// The shape a collector sees at a call made in this state.
    pub fn shape(&self) -> Shape {
        Shape {
            frame_size: self.frame_size,
            offsets: self.roots.iter().map(|&r| self.sp_offset(r)).collect(),
        }
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} words, roots {{", self.frame_size)?;
        for (i, root) in self.roots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{root}")?;
        }
        write!(f, "}}")
    }
}

/// The frame state recorded for one call, keyed by its return-address label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteDescriptor {
    pub label: String,
    pub state: FrameState,
}

/// Frame size plus sorted root offsets, in words from the call-site stack
/// pointer. Many call sites share one shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
    pub frame_size: u32,
    pub offsets: Vec<i32>,
}

impl Shape {
    /// Size of this shape in the blob.
    pub fn encoded_len(&self) -> usize {
        8 + 4 * self.offsets.len()
    }
}

/// One call site in a [`GcMap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcMapEntry {
    pub label: String,
    /// Index into [`GcMap::shapes`].
    pub shape: usize,
}

/// The compile-time GC map: call sites in module order over a
/// deduplicated shape table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcMap {
    target: Target,
    entries: Vec<GcMapEntry>,
    shapes: Vec<Shape>,
}

impl GcMap {
    /// Intern the shapes of `descriptors`. Labels must be unique.
    pub fn new(
        target: Target,
        descriptors: impl IntoIterator<Item = CallSiteDescriptor>,
    ) -> Result<Self, GcMapError> {
        let descriptors: Vec<CallSiteDescriptor> = descriptors.into_iter().collect();

        let mut seen = BTreeSet::new();
        let mut interned: BTreeMap<Shape, usize> = BTreeMap::new();
        for d in &descriptors {
            if !seen.insert(d.label.as_str()) {
                return Err(GcMapError::DuplicateLabel(d.label.clone()));
            }
            interned.insert(d.state.shape(), 0);
        }
        for (i, index) in interned.values_mut().enumerate() {
            *index = i;
        }

        let entries = descriptors
            .iter()
            .map(|d| GcMapEntry {
                label: d.label.clone(),
                shape: interned[&d.state.shape()],
            })
            .collect();
        let shapes: Vec<Shape> = interned.into_keys().collect();
        debug!("gc map: {} call sites, {} shapes", descriptors.len(), shapes.len());

        Ok(Self {
            target,
            entries,
            shapes,
        })
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn entries(&self) -> &[GcMapEntry] {
        &self.entries
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shape recorded for the call returning to `label`.
    pub fn shape_of(&self, label: &str) -> Option<&Shape> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| &self.shapes[e.shape])
    }

    /// Give every return-address label its address and sort by it.
    pub fn resolve<F>(&self, address_of: F) -> Result<GcMapTable, GcMapError>
    where
        F: Fn(&str) -> Option<u64>,
    {
        let mut entries = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            let addr = address_of(&e.label).ok_or_else(|| GcMapError::UnresolvedLabel(e.label.clone()))?;
            entries.push((addr, e.shape));
        }
        entries.sort_unstable_by_key(|&(addr, _)| addr);
        if let Some(w) = entries.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(GcMapError::DuplicateAddress(w[0].0));
        }
        Ok(GcMapTable {
            word_size: self.target.word_size(),
            entries,
            shapes: self.shapes.clone(),
        })
    }
}

/// The runtime GC map, sorted by return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcMapTable {
    word_size: i32,
    entries: Vec<(u64, usize)>,
    shapes: Vec<Shape>,
}

impl GcMapTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Return addresses in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|&(addr, _)| addr)
    }

    /// Shape of the call that returns to `ret_addr`.
    pub fn lookup(&self, ret_addr: u64) -> Option<&Shape> {
        self.entries
            .binary_search_by_key(&ret_addr, |&(addr, _)| addr)
            .ok()
            .map(|i| &self.shapes[self.entries[i].1])
    }

    /// Addresses of the live roots of the frame that called out from
    /// `ret_addr`. `frame_base` is that frame's stack pointer at the call.
    pub fn live_roots(&self, ret_addr: u64, frame_base: u64) -> Option<Vec<u64>> {
        let word = i64::from(self.word_size);
        self.lookup(ret_addr).map(|shape| {
            shape
                .offsets
                .iter()
                .map(|&off| frame_base.wrapping_add_signed(i64::from(off) * word))
                .collect()
        })
    }

    /// Serialise as {entryCount, shapeCount}, then {address:u64,
    /// shapeOffset:u32, pad:u32} per entry, then the shapes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GcMapError> {
        let mut shape_offsets = Vec::with_capacity(self.shapes.len());
        let mut at = 0usize;
        for shape in &self.shapes {
            shape_offsets.push(at as u32);
            at += shape.encoded_len();
        }

        let mut out = Vec::with_capacity(8 + 16 * self.entries.len() + at);
        out.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        out.write_u32::<LittleEndian>(self.shapes.len() as u32)?;
        for &(addr, shape) in &self.entries {
            out.write_u64::<LittleEndian>(addr)?;
            out.write_u32::<LittleEndian>(shape_offsets[shape])?;
            out.write_u32::<LittleEndian>(0)?;
        }
        for shape in &self.shapes {
            out.write_i32::<LittleEndian>(shape.frame_size as i32)?;
            out.write_i32::<LittleEndian>(shape.offsets.len() as i32)?;
            for &off in &shape.offsets {
                out.write_i32::<LittleEndian>(off)?;
            }
        }
        Ok(out)
    }

    /// Decode a blob written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(target: Target, data: &[u8]) -> Result<Self, GcMapError> {
        let mut r = Reader { data, pos: 0 };
        let entry_count = r.read_u32()? as usize;
        let shape_count = r.read_u32()? as usize;

        let mut raw_entries = Vec::with_capacity(entry_count.min(data.len() / 16));
        for _ in 0..entry_count {
            let addr = r.read_u64()?;
            let offset = r.read_u32()?;
            r.read_u32()?;
            raw_entries.push((addr, offset));
        }

        let base = r.pos;
        let mut by_offset = BTreeMap::new();
        let mut shapes = Vec::with_capacity(shape_count.min(data.len() / 8));
        for i in 0..shape_count {
            by_offset.insert((r.pos - base) as u32, i);
            let frame_size = r.read_i32()?;
            let count = r.read_i32()?;
            if frame_size < 0 {
                return Err(GcMapError::NegativeCount(frame_size));
            }
            if count < 0 {
                return Err(GcMapError::NegativeCount(count));
            }
            let count = count as usize;
            if count > r.remaining() / 4 {
                return Err(GcMapError::Truncated);
            }
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(r.read_i32()?);
            }
            shapes.push(Shape {
                frame_size: frame_size as u32,
                offsets,
            });
        }

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (entry, (addr, offset)) in raw_entries.into_iter().enumerate() {
            let shape = *by_offset
                .get(&offset)
                .ok_or(GcMapError::BadShapeOffset { entry, offset })?;
            entries.push((addr, shape));
        }
        if let Some(w) = entries.windows(2).find(|w| w[0].0 >= w[1].0) {
            return Err(GcMapError::DuplicateAddress(w[1].0));
        }

        Ok(Self {
            word_size: target.word_size(),
            entries,
            shapes,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8], GcMapError> {
        let bytes = self.data.get(self.pos..self.pos + n).ok_or(GcMapError::Truncated)?;
        self.pos += n;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32, GcMapError> {
        self.take(4).map(LittleEndian::read_u32)
    }

    fn read_i32(&mut self) -> Result<i32, GcMapError> {
        self.take(4).map(LittleEndian::read_i32)
    }

    fn read_u64(&mut self) -> Result<u64, GcMapError> {
        self.take(8).map(LittleEndian::read_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(frame_size: u32, roots: &[i32]) -> FrameState {
        FrameState {
            frame_size,
            roots: roots.iter().copied().collect(),
        }
    }

    fn site(label: &str, frame_size: u32, roots: &[i32]) -> CallSiteDescriptor {
        CallSiteDescriptor {
            label: label.to_string(),
            state: state(frame_size, roots),
        }
    }

    fn sample() -> GcMap {
        GcMap::new(
            Target::X86_64,
            vec![
                site("c", 4, &[-2, -3]),
                site("a", 2, &[]),
                site("b", 4, &[-3, -2]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_shape_offsets_are_sp_relative() {
        let s = state(3, &[-2, -1]);
        assert_eq!(s.shape().offsets, vec![1, 2]);
        assert!(s.contains(-3));
        assert!(!s.contains(-4));
        assert!(!s.contains(0));
        assert_eq!(s.to_string(), "frame 3 words, roots {-2, -1}");
    }

    #[test]
    fn test_shapes_are_deduplicated_and_sorted() {
        let map = sample();
        assert_eq!(map.len(), 3);
        assert_eq!(
            map.shapes(),
            &[
                Shape {
                    frame_size: 2,
                    offsets: vec![]
                },
                Shape {
                    frame_size: 4,
                    offsets: vec![1, 2]
                },
            ]
        );
        let labels: Vec<&str> = map.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["c", "a", "b"]);
        assert_eq!(map.entries()[0].shape, map.entries()[2].shape);
        assert_eq!(map.shape_of("a").unwrap().frame_size, 2);
    }

    #[test]
    fn test_duplicate_label() {
        let err = GcMap::new(Target::X86_32, vec![site("a", 1, &[]), site("a", 2, &[])]).unwrap_err();
        assert!(matches!(err, GcMapError::DuplicateLabel(l) if l == "a"));
    }

    #[test]
    fn test_resolve_and_lookup() {
        let table = sample()
            .resolve(|l| match l {
                "a" => Some(0x1000),
                "b" => Some(0x1010),
                "c" => Some(0x1008),
                _ => None,
            })
            .unwrap();
        assert_eq!(table.addresses().collect::<Vec<_>>(), [0x1000, 0x1008, 0x1010]);
        assert_eq!(table.lookup(0x1008).unwrap().offsets, vec![1, 2]);
        assert!(table.lookup(0x1004).is_none());
        assert_eq!(table.live_roots(0x1010, 0x7000).unwrap(), vec![0x7008, 0x7010]);
        assert_eq!(table.live_roots(0x1000, 0x7000).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_resolve_errors() {
        let map = sample();
        assert!(matches!(
            map.resolve(|l| (l != "b").then_some(1)),
            Err(GcMapError::UnresolvedLabel(l)) if l == "b"
        ));
        assert!(matches!(map.resolve(|_| Some(0x40)), Err(GcMapError::DuplicateAddress(0x40))));
    }

    #[test]
    fn test_blob_layout() {
        let table = sample()
            .resolve(|l| Some(l.as_bytes()[0] as u64))
            .unwrap();
        let bytes = table.to_bytes().unwrap();
        // header, 3 entries, shape {2, 0}, shape {4, 2, 1, 2}
        assert_eq!(bytes.len(), 8 + 3 * 16 + 8 + 16);
        assert_eq!(LittleEndian::read_u32(&bytes[0..]), 3);
        assert_eq!(LittleEndian::read_u32(&bytes[4..]), 2);
        assert_eq!(LittleEndian::read_u64(&bytes[8..]), u64::from(b'a'));
        assert_eq!(LittleEndian::read_u32(&bytes[16..]), 0);
        assert_eq!(LittleEndian::read_u32(&bytes[32..]), 8);
        assert_eq!(LittleEndian::read_i32(&bytes[56 + 8..]), 4);
        assert_eq!(LittleEndian::read_i32(&bytes[56 + 12..]), 2);

        assert_eq!(GcMapTable::from_bytes(Target::X86_64, &bytes).unwrap(), table);
    }

    #[test]
    fn test_blob_errors() {
        let table = sample().resolve(|l| Some(l.as_bytes()[0] as u64)).unwrap();
        let bytes = table.to_bytes().unwrap();

        let truncated = &bytes[..bytes.len() - 2];
        assert!(matches!(
            GcMapTable::from_bytes(Target::X86_64, truncated),
            Err(GcMapError::Truncated)
        ));

        let mut bad = bytes.clone();
        LittleEndian::write_u32(&mut bad[16..], 4);
        assert!(matches!(
            GcMapTable::from_bytes(Target::X86_64, &bad),
            Err(GcMapError::BadShapeOffset { entry: 0, offset: 4 })
        ));

        let mut negative = bytes;
        LittleEndian::write_i32(&mut negative[56 + 4..], -1);
        assert!(matches!(
            GcMapTable::from_bytes(Target::X86_64, &negative),
            Err(GcMapError::NegativeCount(-1))
        ));

        // One shape claiming far more offsets than the blob holds.
        let mut huge = Vec::new();
        for word in [0i32, 1, 1, i32::MAX] {
            huge.extend_from_slice(&word.to_le_bytes());
        }
        huge.extend_from_slice(&7i32.to_le_bytes());
        assert!(matches!(
            GcMapTable::from_bytes(Target::X86_64, &huge),
            Err(GcMapError::Truncated)
        ));
    }
}
