//! Code builder, tracker and GC map working together.

use asmgcroot::core::location::regs::*;
use asmgcroot::core::{BackendConfig, Location, StackSlot, Target};
use asmgcroot::gcroot::emit::{self, DATA_SECTION, SHAPE_SECTION};
use asmgcroot::gcroot::{GcMapTable, GcRootTracker, Shape};
use asmgcroot::reconciler::remap_frame_layout;
use asmgcroot::x64::{AssembledCode, CodeBuilder, Cond};
use object::{Object as _, ObjectSection as _};

const BASE: u64 = 0x40_0000;

/// One function with a root live across the first call, a second call on
/// one arm of a branch and a register swap before the join.
fn build(config: &BackendConfig) -> AssembledCode {
    let word = config.target.word_size();
    let (a, b) = match config.target {
        Target::X86_64 => (RAX, RBX),
        Target::X86_32 => (EAX, EBX),
    };
    let mut code = CodeBuilder::new(config);
    code.begin_function("f");
    code.prologue(2).unwrap();
    code.mov(Location::stack(-word), a).unwrap();
    code.store_gcroot(StackSlot::new(-word, 1));
    code.call_symbol("g").unwrap();
    code.load_gcroot(StackSlot::new(-word, 1));

    let join = code.new_label();
    code.cmp(a, Location::imm(0)).unwrap();
    code.jcc(Cond::E, join).unwrap();
    code.call_symbol("h").unwrap();
    let scratch = code.scratch();
    remap_frame_layout(&mut code, &[a.into(), b.into()], &[b.into(), a.into()], scratch).unwrap();
    code.bind(join).unwrap();
    code.epilogue().unwrap();
    code.finish().unwrap()
}

#[test]
fn test_pipeline_x86_64() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = BackendConfig::for_target(Target::X86_64);
    let asm = build(&config);

    let module = GcRootTracker::new(config).run(&asm.listing).unwrap();
    // The builder already labelled every return address.
    assert_eq!(module.listing, asm.listing);
    assert_eq!(module.functions, ["f"]);
    assert_eq!(module.descriptors.len(), 2);

    let addresses = asm.label_addresses(BASE);
    let table = module.gcmap.resolve(|label| addresses.get(label).copied()).unwrap();
    assert_eq!(table.len(), 2);

    let ret_g = addresses["__gcmap_IN_f_0"];
    let ret_h = addresses["__gcmap_IN_f_1"];
    assert_eq!(ret_g, BASE + asm.relocations[0].offset as u64 + 4);
    assert_eq!(
        table.lookup(ret_g),
        Some(&Shape {
            frame_size: 3,
            offsets: vec![1]
        })
    );
    assert_eq!(
        table.lookup(ret_h),
        Some(&Shape {
            frame_size: 3,
            offsets: vec![]
        })
    );
    assert_eq!(table.lookup(ret_g + 1), None);

    // rbp, the -8 slot, the -16 slot: the root sits one word above sp.
    let sp = 0x7fff_0000;
    assert_eq!(table.live_roots(ret_g, sp), Some(vec![sp + 8]));
    assert_eq!(table.live_roots(ret_h, sp), Some(vec![]));
    assert_eq!(table.live_roots(BASE, sp), None);

    let blob = table.to_bytes().unwrap();
    assert_eq!(GcMapTable::from_bytes(Target::X86_64, &blob).unwrap(), table);
}

#[test]
fn test_pipeline_x86_32() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = BackendConfig::for_target(Target::X86_32);
    let asm = build(&config);
    assert!(asm.listing.contains("\t/* STORE GCROOT -4(%ebp) */\n"));

    let module = GcRootTracker::new(config).run(&asm.listing).unwrap();
    let addresses = asm.label_addresses(BASE);
    let table = module.gcmap.resolve(|label| addresses.get(label).copied()).unwrap();

    let ret_g = addresses["__gcmap_IN_f_0"];
    let sp = 0xbfff_0000;
    assert_eq!(table.live_roots(ret_g, sp), Some(vec![sp + 4]));
    let addrs: Vec<u64> = table.addresses().collect();
    assert!(addrs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_gc_map_artifacts() {
    let config = BackendConfig::for_target(Target::X86_64);
    let asm = build(&config);
    let module = GcRootTracker::new(config).run(&asm.listing).unwrap();

    let text = emit::to_assembly(&module.gcmap);
    assert!(text.contains("\t.quad\t__gcmap_IN_f_0\n"));
    assert!(text.contains("\t.quad\t__gcmap_IN_f_1\n"));
    assert!(text.contains("__gcmapstart:\n"));
    assert!(text.contains("__gcmapend:\n"));

    let bytes = emit::to_object(&module.gcmap).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    let data = file.section_by_name(DATA_SECTION).unwrap();
    assert_eq!(data.size(), 32);
    assert_eq!(data.relocations().count(), 4);
    // {3, 0} then {3, 1, 1}
    let shapes = file.section_by_name(SHAPE_SECTION).unwrap();
    assert_eq!(shapes.size(), 20);
}

#[test]
fn test_unresolved_label_is_reported() {
    let config = BackendConfig::for_target(Target::X86_64);
    let asm = build(&config);
    let module = GcRootTracker::new(config).run(&asm.listing).unwrap();
    let err = module
        .gcmap
        .resolve(|label| (label != "__gcmap_IN_f_1").then_some(BASE))
        .unwrap_err();
    assert!(err.to_string().contains("__gcmap_IN_f_1"));
}
