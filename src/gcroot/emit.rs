// This module writes a GcMap into the compiled artifact. Two forms are produced from the
// same data. The assembly form is appended to the rewritten listing: a `.data` table
// bracketed by the global `__gcmapstart`/`__gcmapend` symbols, holding one
// (return address, shape address) pointer pair per call site, followed by the shapes in
// `.rodata`, each under its own `__gcmap_shape_<n>` label. The object form builds the
// same layout directly as an ELF relocatable with the `object` crate: `.data.gcmap`
// carries absolute relocations against the (undefined, linker-resolved) return-address
// labels and against the shape symbols in `.rodata.gcmap_shapes`. Entries stay in module
// order; the runtime sorts by address once the addresses are known.

//! GC map emission as assembly text and as an ELF object.

use std::fmt::Write as _;

use hashbrown::HashMap;
use log::debug;
use object::write::{Object, Relocation, StandardSegment, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use crate::core::error::GcMapError;
use crate::core::location::Target;

use super::gcmap::{GcMap, Shape};

pub const GCMAP_START: &str = "__gcmapstart";
pub const GCMAP_END: &str = "__gcmapend";
pub const DATA_SECTION: &str = ".data.gcmap";
pub const SHAPE_SECTION: &str = ".rodata.gcmap_shapes";

/// Symbol naming shape `index`.
pub fn shape_symbol(index: usize) -> String {
    format!("__gcmap_shape_{index}")
}

fn pointer_directive(target: Target) -> &'static str {
    if target.is_64() {
        ".quad"
    } else {
        ".long"
    }
}

fn shape_bytes(shape: &Shape) -> Vec<u8> {
    let mut out = Vec::with_capacity(shape.encoded_len());
    out.extend_from_slice(&(shape.frame_size as i32).to_le_bytes());
    out.extend_from_slice(&(shape.offsets.len() as i32).to_le_bytes());
    for off in &shape.offsets {
        out.extend_from_slice(&off.to_le_bytes());
    }
    out
}

/// The GC map as assembler input, to append to the rewritten listing.
pub fn to_assembly(map: &GcMap) -> String {
    let target = map.target();
    let ptr = pointer_directive(target);
    let mut out = String::new();

    let _ = writeln!(out, "\t.data");
    let _ = writeln!(out, "\t.align\t{}", target.word_size());
    let _ = writeln!(out, "\t.globl\t{GCMAP_START}");
    let _ = writeln!(out, "{GCMAP_START}:");
    for entry in map.entries() {
        let _ = writeln!(out, "\t{ptr}\t{}", entry.label);
        let _ = writeln!(out, "\t{ptr}\t{}", shape_symbol(entry.shape));
    }
    let _ = writeln!(out, "\t.globl\t{GCMAP_END}");
    let _ = writeln!(out, "{GCMAP_END}:");

    let _ = writeln!(out, "\t.section\t.rodata");
    let _ = writeln!(out, "\t.align\t4");
    for (index, shape) in map.shapes().iter().enumerate() {
        let _ = writeln!(out, "{}:", shape_symbol(index));
        let _ = writeln!(out, "\t.long\t{}", shape.frame_size);
        let _ = write!(out, "\t.long\t{}", shape.offsets.len());
        for off in &shape.offsets {
            let _ = write!(out, ", {off}");
        }
        out.push('\n');
    }
    out
}

/// The GC map as an ELF relocatable object.
pub fn to_object(map: &GcMap) -> Result<Vec<u8>, GcMapError> {
    let target = map.target();
    let (architecture, word) = match target {
        Target::X86_32 => (Architecture::I386, 4u64),
        Target::X86_64 => (Architecture::X86_64, 8u64),
    };
    let mut obj = Object::new(BinaryFormat::Elf, architecture, Endianness::Little);

    let data_segment = obj.segment_name(StandardSegment::Data).to_vec();
    let data = obj.add_section(data_segment.clone(), DATA_SECTION.as_bytes().to_vec(), SectionKind::Data);
    let shapes = obj.add_section(data_segment, SHAPE_SECTION.as_bytes().to_vec(), SectionKind::ReadOnlyData);

    let mut shape_ids = Vec::with_capacity(map.shapes().len());
    for (index, shape) in map.shapes().iter().enumerate() {
        let bytes = shape_bytes(shape);
        let offset = obj.append_section_data(shapes, &bytes, 4);
        shape_ids.push(obj.add_symbol(Symbol {
            name: shape_symbol(index).into_bytes(),
            value: offset,
            size: bytes.len() as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Section(shapes),
            flags: SymbolFlags::None,
        }));
    }

    let table_len = map.len() as u64 * 2 * word;
    let table_start = obj.append_section_data(data, &vec![0; table_len as usize], word);
    for (name, value) in [(GCMAP_START, table_start), (GCMAP_END, table_start + table_len)] {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(data),
            flags: SymbolFlags::None,
        });
    }

    let absolute = RelocationFlags::Generic {
        kind: RelocationKind::Absolute,
        encoding: RelocationEncoding::Generic,
        size: (word * 8) as u8,
    };
    let mut labels: HashMap<&str, SymbolId> = HashMap::new();
    for (i, entry) in map.entries().iter().enumerate() {
        let label = match labels.get(entry.label.as_str()) {
            Some(&id) => id,
            None => {
                let id = obj.add_symbol(Symbol {
                    name: entry.label.as_bytes().to_vec(),
                    value: 0,
                    size: 0,
                    kind: SymbolKind::Text,
                    scope: SymbolScope::Linkage,
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                });
                labels.insert(entry.label.as_str(), id);
                id
            }
        };
        let at = table_start + i as u64 * 2 * word;
        obj.add_relocation(
            data,
            Relocation {
                offset: at,
                symbol: label,
                addend: 0,
                flags: absolute,
            },
        )?;
        obj.add_relocation(
            data,
            Relocation {
                offset: at + word,
                symbol: shape_ids[entry.shape],
                addend: 0,
                flags: absolute,
            },
        )?;
    }

    debug!(
        "gc map object for {target}: {} entries, {} shapes",
        map.len(),
        map.shapes().len()
    );
    Ok(obj.write()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcroot::gcmap::{CallSiteDescriptor, FrameState};
    use object::{Object as _, ObjectSection as _, ObjectSymbol as _};

    fn map(target: Target) -> GcMap {
        let state = |frame_size: u32, roots: &[i32]| FrameState {
            frame_size,
            roots: roots.iter().copied().collect(),
        };
        GcMap::new(
            target,
            vec![
                CallSiteDescriptor {
                    label: "__gcmap_IN_f_0".into(),
                    state: state(3, &[-2]),
                },
                CallSiteDescriptor {
                    label: "__gcmap_IN_f_1".into(),
                    state: state(1, &[]),
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_assembly_dump() {
        let text = to_assembly(&map(Target::X86_32));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "\t.data",
                "\t.align\t4",
                "\t.globl\t__gcmapstart",
                "__gcmapstart:",
                "\t.long\t__gcmap_IN_f_0",
                "\t.long\t__gcmap_shape_1",
                "\t.long\t__gcmap_IN_f_1",
                "\t.long\t__gcmap_shape_0",
                "\t.globl\t__gcmapend",
                "__gcmapend:",
                "\t.section\t.rodata",
                "\t.align\t4",
                "__gcmap_shape_0:",
                "\t.long\t1",
                "\t.long\t0",
                "__gcmap_shape_1:",
                "\t.long\t3",
                "\t.long\t1, 1",
            ]
        );
        assert!(to_assembly(&map(Target::X86_64)).contains("\t.quad\t__gcmap_IN_f_0\n"));
    }

    #[test]
    fn test_object_sections_and_relocations() {
        let bytes = to_object(&map(Target::X86_64)).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::X86_64);

        let data = file.section_by_name(DATA_SECTION).unwrap();
        assert_eq!(data.size(), 32);
        assert_eq!(data.relocations().count(), 4);

        let shapes = file.section_by_name(SHAPE_SECTION).unwrap();
        // {1, 0} then {3, 1, 1}
        assert_eq!(shapes.data().unwrap(), &[1, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);

        let names: Vec<&str> = file.symbols().filter_map(|s| s.name().ok()).collect();
        for name in [GCMAP_START, GCMAP_END, "__gcmap_IN_f_0", "__gcmap_shape_1"] {
            assert!(names.contains(&name), "missing {name}");
        }
        let end = file.symbols().find(|s| s.name() == Ok(GCMAP_END)).unwrap();
        assert_eq!(end.address(), 32);
    }

    #[test]
    fn test_object_for_x86_32() {
        let bytes = to_object(&map(Target::X86_32)).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::I386);
        assert_eq!(file.section_by_name(DATA_SECTION).unwrap().size(), 16);
    }
}
