//! End-to-end pattern programs against an in-memory provider.

use std::collections::HashMap;
use std::sync::Arc;

use runic_lang::{Endian, Error, Level, Literal, ParamCount, Pattern, PatternKind, Runtime};
use runic_provider::MemoryProvider;

fn runtime() -> Runtime {
    let mut runtime = Runtime::new();
    runtime.set_default_endian(Endian::Little);
    runtime
}

fn run(source: &str, data: Vec<u8>) -> Vec<Pattern> {
    runtime()
        .execute_string(
            Arc::new(MemoryProvider::new(data)),
            source,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap_or_else(|e| panic!("evaluation failed: {e}"))
}

fn run_err(source: &str, data: Vec<u8>) -> (Error, Runtime) {
    let mut runtime = runtime();
    let error = runtime
        .execute_string(
            Arc::new(MemoryProvider::new(data)),
            source,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap_err();
    (error, runtime)
}

#[test]
fn primitive_layout() {
    let patterns = run("u32 a; u16 b;", vec![0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22]);

    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[0].offset, 0);
    assert_eq!(patterns[0].size, 4);
    assert_eq!(patterns[0].name, "a");
    assert_eq!(patterns[0].kind, PatternKind::Unsigned { value: 0xDDCCBBAA });

    assert_eq!(patterns[1].offset, 4);
    assert_eq!(patterns[1].size, 2);
    assert_eq!(patterns[1].kind, PatternKind::Unsigned { value: 0x2211 });
}

#[test]
fn endian_switch() {
    let patterns = run("be u32 x @ 0;", vec![0x01, 0x02, 0x03, 0x04]);

    assert_eq!(patterns[0].endian, Endian::Big);
    assert_eq!(patterns[0].kind, PatternKind::Unsigned { value: 0x01020304 });
}

#[test]
fn endian_pragma_sets_default() {
    let patterns = run("#pragma endian big\nu16 x;", vec![0x01, 0x02]);
    assert_eq!(patterns[0].kind, PatternKind::Unsigned { value: 0x0102 });
}

#[test]
fn bitfield_packing() {
    let patterns = run(
        "bitfield F { a : 3; b : 5; c : 8; }; F f @ 0;",
        vec![0xA5, 0x3C],
    );

    let pattern = &patterns[0];
    assert_eq!(pattern.size, 2);

    let PatternKind::Bitfield { fields } = &pattern.kind else {
        panic!("expected a bitfield pattern");
    };
    assert_eq!(fields.len(), 3);

    // 0x3CA5 little-endian, fields allocated right to left.
    assert_eq!(
        fields[0].kind,
        PatternKind::BitfieldField { bit_offset: 0, bit_size: 3, value: 0b101 }
    );
    assert_eq!(
        fields[1].kind,
        PatternKind::BitfieldField { bit_offset: 3, bit_size: 5, value: 0b10100 }
    );
    assert_eq!(
        fields[2].kind,
        PatternKind::BitfieldField { bit_offset: 8, bit_size: 8, value: 0x3C }
    );
}

#[test]
fn bitfield_padding_skips_bits() {
    let patterns = run(
        "bitfield F { low : 4; padding : 8; high : 4; }; F f @ 0;",
        vec![0xA5, 0x3C],
    );

    let PatternKind::Bitfield { fields } = &patterns[0].kind else {
        panic!("expected a bitfield pattern");
    };
    // Only the named fields surface.
    assert_eq!(fields.len(), 2);
    assert_eq!(
        fields[0].kind,
        PatternKind::BitfieldField { bit_offset: 0, bit_size: 4, value: 0x5 }
    );
    assert_eq!(
        fields[1].kind,
        PatternKind::BitfieldField { bit_offset: 12, bit_size: 4, value: 0x3 }
    );
}

#[test]
fn pointer_dereference() {
    let patterns = run(
        "u8 *p : u16 @ 0;",
        vec![0x04, 0x00, 0xFF, 0xFF, 0xDE, 0xAD],
    );

    let pattern = &patterns[0];
    assert_eq!(pattern.size, 2);

    let PatternKind::Pointer { pointer_base, pointed_at, pointee } = &pattern.kind else {
        panic!("expected a pointer pattern");
    };
    assert_eq!(*pointer_base, 0);
    assert_eq!(*pointed_at, 4);
    assert_eq!(pointee.offset, 4);
    assert_eq!(pointee.kind, PatternKind::Unsigned { value: 0xDE });
}

#[test]
fn struct_layout_and_nesting() {
    let patterns = run(
        "struct Inner { u16 x; u16 y; }; \
         struct Outer { u8 tag; Inner inner; u8 tail; }; \
         Outer o @ 0;",
        vec![0x01, 0x10, 0x20, 0x30, 0x40, 0xFF],
    );

    let outer = &patterns[0];
    assert_eq!(outer.offset, 0);
    assert_eq!(outer.size, 6);
    assert_eq!(outer.type_name, "Outer");

    let PatternKind::Struct { members } = &outer.kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members.len(), 3);
    assert_eq!(members[1].offset, 1);
    assert_eq!(members[1].size, 4);

    // Members are ordered and non-overlapping.
    assert!(members[0].offset + members[0].size <= members[1].offset);
    assert!(members[1].offset + members[1].size <= members[2].offset);
}

#[test]
fn struct_inheritance_prepends_base_members() {
    let patterns = run(
        "struct Base { u8 magic; }; \
         struct Derived : Base { u8 version; }; \
         Derived d @ 0;",
        vec![0x4D, 0x02],
    );

    let PatternKind::Struct { members } = &patterns[0].kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members[0].name, "magic");
    assert_eq!(members[0].offset, 0);
    assert_eq!(members[1].name, "version");
    assert_eq!(members[1].offset, 1);
}

#[test]
fn union_members_share_offset() {
    let patterns = run(
        "union Value { u8 byte; u32 word; u16 half; }; Value v @ 0;",
        vec![0x11, 0x22, 0x33, 0x44],
    );

    let union_pattern = &patterns[0];
    assert_eq!(union_pattern.size, 4);

    let PatternKind::Union { members } = &union_pattern.kind else {
        panic!("expected a union pattern");
    };
    for member in members {
        assert_eq!(member.offset, union_pattern.offset);
    }
    assert_eq!(
        union_pattern.size,
        members.iter().map(|m| m.size).max().unwrap()
    );
}

#[test]
fn enum_decodes_value_and_entries() {
    let patterns = run(
        "enum Kind : u8 { None, File = 5, Dir }; Kind k @ 0;",
        vec![0x06],
    );

    let PatternKind::Enum { value, entries } = &patterns[0].kind else {
        panic!("expected an enum pattern");
    };
    assert_eq!(*value, 6);
    assert_eq!(
        entries,
        &vec![(0, "None".to_string()), (5, "File".to_string()), (6, "Dir".to_string())]
    );
    assert_eq!(patterns[0].enum_entry_name(), Some("Dir"));
}

#[test]
fn enum_constants_in_expressions() {
    let patterns = run(
        "enum Tag : u8 { A = 1, B = 2 }; \
         u8 tag; \
         if (tag == Tag::B) { u8 matched; } else { u16 other; }",
        vec![0x02, 0x77, 0x00],
    );

    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[1].name, "matched");
    assert_eq!(patterns[1].size, 1);
}

#[test]
fn placement_restores_cursor_in_structs_only() {
    let patterns = run(
        "struct S { u8 first; u8 far @ 4; u8 second; }; S s @ 0;",
        vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05],
    );

    let PatternKind::Struct { members } = &patterns[0].kind else {
        panic!("expected a struct pattern");
    };
    assert_eq!(members[0].offset, 0);
    assert_eq!(members[1].offset, 4);
    // The cursor came back after the placed member.
    assert_eq!(members[2].offset, 1);
}

#[test]
fn static_array_strides() {
    let patterns = run("u16 words[3] @ 0;", vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00]);

    let pattern = &patterns[0];
    assert_eq!(pattern.size, 6);

    let PatternKind::StaticArray { entries } = &pattern.kind else {
        panic!("expected a static array");
    };
    assert_eq!(entries.len(), 3);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.offset, i as u64 * 2);
        assert_eq!(entry.kind, PatternKind::Unsigned { value: i as u128 + 1 });
    }
}

#[test]
fn while_sized_array_stops_on_condition() {
    // Entries while the read cursor is short of the marker byte.
    let patterns = run(
        "u8 bytes[while($ < 3)] @ 0;",
        vec![0x01, 0x02, 0x03, 0x00, 0xFF],
    );

    let PatternKind::DynamicArray { entries } = &patterns[0].kind else {
        panic!("expected a dynamic array");
    };
    assert_eq!(entries.len(), 3);
    assert_eq!(patterns[0].size, 3);
}

#[test]
fn unbounded_array_runs_to_end_of_data() {
    let patterns = run("u16 rest[] @ 2;", vec![0, 0, 1, 0, 2, 0, 3, 0]);

    let pattern = &patterns[0];
    let PatternKind::DynamicArray { entries } = &pattern.kind else {
        panic!("expected a dynamic array");
    };
    assert_eq!(entries.len(), 3);

    // The last entry ends exactly at the provider boundary.
    let last = entries.last().unwrap();
    assert_eq!(last.offset + last.size, 8);
}

#[test]
fn char_array_is_a_string() {
    let patterns = run("char name[5] @ 0;", b"runic\0\xFF".to_vec());

    assert_eq!(patterns[0].size, 5);
    assert_eq!(patterns[0].kind, PatternKind::String { value: "runic".into() });
}

#[test]
fn padding_consumes_without_reading() {
    let patterns = run("u8 a; padding[3]; u8 b;", vec![1, 0, 0, 0, 2]);

    assert_eq!(patterns.len(), 3);
    assert_eq!(patterns[1].kind, PatternKind::Padding);
    assert_eq!(patterns[2].offset, 4);
    assert_eq!(patterns[2].kind, PatternKind::Unsigned { value: 2 });
}

#[test]
fn using_alias_keeps_endian_and_name() {
    let patterns = run("using Magic = be u32; Magic m @ 0;", vec![1, 2, 3, 4]);

    assert_eq!(patterns[0].type_name, "Magic");
    assert_eq!(patterns[0].endian, Endian::Big);
    assert_eq!(patterns[0].kind, PatternKind::Unsigned { value: 0x01020304 });
}

#[test]
fn attributes_style_the_pattern() {
    let patterns = run(
        "u8 raw @ 0 [[name(\"status\"), comment(\"device status\"), color(\"FF0000\")]];",
        vec![0x01],
    );

    let pattern = &patterns[0];
    assert_eq!(pattern.name, "status");
    assert_eq!(pattern.comment.as_deref(), Some("device status"));
    assert_eq!(pattern.color & 0x00FF_FFFF, 0xFF0000);
}

#[test]
fn variable_attribute_overrides_type_attribute_with_warning() {
    let mut runtime = runtime();
    let patterns = runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 4])),
            "struct S { u8 a; } [[color(\"00FF00\")]]; S s @ 0 [[color(\"0000FF\")]];",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();

    assert_eq!(patterns[0].color & 0x00FF_FFFF, 0x0000FF);
    assert!(
        runtime
            .console_log()
            .iter()
            .any(|(level, message)| *level == Level::Warning && message.contains("color"))
    );
}

#[test]
fn functions_with_locals_and_loops() {
    let mut runtime = runtime();
    let result = runtime
        .execute_function(
            Arc::new(MemoryProvider::new(vec![0u8; 1])),
            "u32 total = 0; \
             for (u32 i = 0; i < 10; i = i + 1) { \
                 if (i % 2 == 0) { continue; } \
                 total = total + i; \
             } \
             return total;",
        )
        .unwrap();

    // 1 + 3 + 5 + 7 + 9
    assert_eq!(result, Some(Literal::Unsigned(25)));
}

#[test]
fn user_functions_dispatch_like_builtins() {
    let mut runtime = runtime();
    let result = runtime
        .execute_function(
            Arc::new(MemoryProvider::new(vec![0u8; 1])),
            "fn double(u32 x) { return x * 2; } \
             fn main() { return double(21); }",
        )
        .unwrap();

    assert_eq!(result, Some(Literal::Unsigned(42)));
}

#[test]
fn in_and_out_variables() {
    let mut runtime = runtime();
    let mut in_vars = HashMap::new();
    in_vars.insert("offset".to_string(), Literal::Unsigned(2));

    runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0, 0, 0x2A, 0])),
            "in u32 offset; out u32 answer; u8 value @ offset; answer = value;",
            HashMap::new(),
            in_vars,
        )
        .unwrap();

    assert_eq!(
        runtime.out_variables().get("answer"),
        Some(&Literal::Unsigned(0x2A))
    );
}

#[test]
fn registered_functions_and_console() {
    let mut runtime = runtime();
    runtime.register_function("test", "twice", ParamCount::Exact(1), |_, args| {
        Ok(Some(Literal::Unsigned(args[0].to_unsigned() * 2)))
    });

    runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 1])),
            "std::print(\"value is\", test::twice(21));",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();

    assert_eq!(runtime.console_log()[0].1, "[i] value is 42");
}

#[test]
fn std_assert_failure_reports_line() {
    let (error, _) = run_err("u8 a;\nstd::assert(a == 5, \"bad magic\");", vec![0x01]);

    match error {
        Error::Evaluation { line, message } => {
            assert_eq!(line, 2);
            assert!(message.contains("bad magic"));
        }
        other => panic!("expected evaluation error, got {other}"),
    }
}

#[test]
fn out_of_range_read_fails() {
    let (error, runtime) = run_err("u32 x @ 6;", vec![0u8; 8]);
    assert!(matches!(error, Error::Evaluation { .. }));
    assert!(runtime.patterns().is_empty());

    // Reading the final byte still works.
    let patterns = run("u8 last @ 7;", vec![0u8; 8]);
    assert_eq!(patterns[0].offset, 7);
}

#[test]
fn recursion_limit_aborts() {
    let mut runtime = runtime();
    runtime.set_recursion_limit(32);
    let error = runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 1])),
            "fn f() { f(); } f();",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap_err();

    assert!(matches!(error, Error::RecursionLimit { limit: 32, .. }));
    assert!(runtime.patterns().is_empty());
    // The console kept the depth trace.
    assert!(
        runtime
            .console_log()
            .iter()
            .any(|(level, _)| *level == Level::Error)
    );
}

#[test]
fn recursion_limit_is_exact() {
    let source = "fn rec(u32 n) { if (n > 1) { rec(n - 1); } return 0; } rec(8);";

    let mut runtime = runtime();
    runtime.set_recursion_limit(8);
    runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 1])),
            source,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();

    runtime.set_recursion_limit(7);
    let error = runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 1])),
            source,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap_err();
    assert!(matches!(error, Error::RecursionLimit { .. }));
}

#[test]
fn pattern_limit_aborts() {
    let mut runtime = runtime();
    runtime.set_pattern_limit(16);
    let error = runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 64])),
            "u8 bytes[64] @ 0;",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap_err();

    assert!(matches!(error, Error::PatternLimit { limit: 16, .. }));
}

#[test]
fn rerun_is_idempotent() {
    let source = "struct P { u16 x; u16 y; }; P points[2] @ 0;";
    let data = vec![1, 0, 2, 0, 3, 0, 4, 0];

    let first = run(source, data.clone());
    let second = run(source, data);
    assert_eq!(first, second);
}

#[test]
fn sizeof_and_addressof() {
    let mut runtime = runtime();
    runtime
        .execute_string(
            Arc::new(MemoryProvider::new(vec![0u8; 16])),
            "u32 header @ 4; \
             out u32 size_of; out u32 addr_of; \
             size_of = sizeof(header); addr_of = addressof(header);",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();

    assert_eq!(
        runtime.out_variables().get("size_of"),
        Some(&Literal::Unsigned(4))
    );
    assert_eq!(
        runtime.out_variables().get("addr_of"),
        Some(&Literal::Unsigned(4))
    );
}

#[test]
fn abort_flag_stops_evaluation() {
    let mut runtime = runtime();
    runtime.abort_handle().abort();

    // The flag is rearmed at the start of each run.
    let result = runtime.execute_string(
        Arc::new(MemoryProvider::new(vec![0u8; 4])),
        "u8 a;",
        HashMap::new(),
        HashMap::new(),
    );
    assert!(result.is_ok());
}

#[test]
fn member_references_resolve_within_scope() {
    let patterns = run(
        "struct Sized { u8 len; u8 data[len]; }; Sized s @ 0;",
        vec![0x03, 0xAA, 0xBB, 0xCC, 0xFF],
    );

    let PatternKind::Struct { members } = &patterns[0].kind else {
        panic!("expected a struct pattern");
    };
    let PatternKind::StaticArray { entries } = &members[1].kind else {
        panic!("expected an array member");
    };
    assert_eq!(entries.len(), 3);
    assert_eq!(patterns[0].size, 4);
}
