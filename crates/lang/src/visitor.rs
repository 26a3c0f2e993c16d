//! Pattern visitors
//!
//! A [`PatternVisitor`] walks a pattern tree in construction order.
//! Parent context travels on the walk, not on the patterns, so the tree
//! itself stays a plain owned value.

use std::fmt::Write as _;

use crate::pattern::{Pattern, PatternKind};

pub trait PatternVisitor {
    fn visit_unsigned(&mut self, _pattern: &Pattern) {}
    fn visit_signed(&mut self, _pattern: &Pattern) {}
    fn visit_float(&mut self, _pattern: &Pattern) {}
    fn visit_bool(&mut self, _pattern: &Pattern) {}
    fn visit_character(&mut self, _pattern: &Pattern) {}
    fn visit_string(&mut self, _pattern: &Pattern) {}
    fn visit_padding(&mut self, _pattern: &Pattern) {}
    fn visit_enum(&mut self, _pattern: &Pattern) {}
    fn visit_bitfield_field(&mut self, _pattern: &Pattern) {}

    /// Composite hooks fire before their children are walked.
    fn visit_bitfield(&mut self, _pattern: &Pattern) {}
    fn visit_struct(&mut self, _pattern: &Pattern) {}
    fn visit_union(&mut self, _pattern: &Pattern) {}
    fn visit_array(&mut self, _pattern: &Pattern) {}
    fn visit_pointer(&mut self, _pattern: &Pattern) {}

    /// Fires after a composite's children have been walked.
    fn leave_composite(&mut self, _pattern: &Pattern) {}
}

/// Dispatch one pattern to its visitor hook and recurse into children.
pub fn walk(pattern: &Pattern, visitor: &mut dyn PatternVisitor) {
    match &pattern.kind {
        PatternKind::Unsigned { .. } => visitor.visit_unsigned(pattern),
        PatternKind::Signed { .. } => visitor.visit_signed(pattern),
        PatternKind::Float { .. } => visitor.visit_float(pattern),
        PatternKind::Bool { .. } => visitor.visit_bool(pattern),
        PatternKind::Character { .. } | PatternKind::Character16 { .. } => {
            visitor.visit_character(pattern)
        }
        PatternKind::String { .. } | PatternKind::WideString { .. } => {
            visitor.visit_string(pattern)
        }
        PatternKind::Padding => visitor.visit_padding(pattern),
        PatternKind::Enum { .. } => visitor.visit_enum(pattern),
        PatternKind::BitfieldField { .. } => visitor.visit_bitfield_field(pattern),
        PatternKind::Bitfield { .. } => visitor.visit_bitfield(pattern),
        PatternKind::Struct { .. } => visitor.visit_struct(pattern),
        PatternKind::Union { .. } => visitor.visit_union(pattern),
        PatternKind::StaticArray { .. } | PatternKind::DynamicArray { .. } => {
            visitor.visit_array(pattern)
        }
        PatternKind::Pointer { .. } => visitor.visit_pointer(pattern),
    }

    if !pattern.children().is_empty() {
        for child in pattern.children() {
            walk(child, visitor);
        }
        visitor.leave_composite(pattern);
    }
}

/// Render one pattern's value the way a UI would display it.
pub fn render_value(pattern: &Pattern) -> String {
    match &pattern.kind {
        PatternKind::Unsigned { value } => format!("{value} ({value:#x})"),
        PatternKind::Signed { value } => format!("{value}"),
        PatternKind::Float { value } => format!("{value}"),
        PatternKind::Bool { value } => format!("{value}"),
        PatternKind::Character { value } => format!("'{value}'"),
        PatternKind::Character16 { value } => match char::from_u32(u32::from(*value)) {
            Some(c) => format!("'{c}'"),
            None => format!("{value:#06x}"),
        },
        PatternKind::String { value } | PatternKind::WideString { value } => {
            format!("\"{value}\"")
        }
        PatternKind::Padding => String::new(),
        PatternKind::Enum { value, .. } => match pattern.enum_entry_name() {
            Some(name) => format!("{}::{name}", pattern.type_name),
            None => format!("{value} (unknown)"),
        },
        PatternKind::BitfieldField { value, bit_size, .. } => {
            format!("{value:#0width$b}", width = *bit_size as usize + 2)
        }
        PatternKind::Bitfield { .. }
        | PatternKind::Struct { .. }
        | PatternKind::Union { .. } => "{ ... }".to_string(),
        PatternKind::StaticArray { entries } | PatternKind::DynamicArray { entries } => {
            format!("[{}]", entries.len())
        }
        PatternKind::Pointer { pointed_at, .. } => format!("-> {pointed_at:#x}"),
    }
}

/// Renders a pattern tree as an indented text listing; the reference
/// consumer of [`PatternVisitor`].
#[derive(Default)]
pub struct TreeFormatter {
    output: String,
    depth: usize,
}

impl TreeFormatter {
    pub fn format(patterns: &[Pattern]) -> String {
        let mut formatter = TreeFormatter::default();
        for pattern in patterns {
            walk(pattern, &mut formatter);
        }
        formatter.output
    }

    fn push_line(&mut self, pattern: &Pattern) {
        if pattern.hidden {
            return;
        }
        let indent = "  ".repeat(self.depth);
        let value = render_value(pattern);
        let _ = writeln!(
            self.output,
            "{indent}{:#010x} | {:8} {} = {value}",
            pattern.offset, pattern.type_name, pattern.name,
        );
    }
}

impl PatternVisitor for TreeFormatter {
    fn visit_unsigned(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_signed(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_float(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_bool(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_character(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_string(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_padding(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_enum(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_bitfield_field(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
    }
    fn visit_bitfield(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
        self.depth += 1;
    }
    fn visit_struct(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
        self.depth += 1;
    }
    fn visit_union(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
        self.depth += 1;
    }
    fn visit_array(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
        self.depth += 1;
    }
    fn visit_pointer(&mut self, pattern: &Pattern) {
        self.push_line(pattern);
        self.depth += 1;
    }
    fn leave_composite(&mut self, _pattern: &Pattern) {
        self.depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PALETTE;
    use crate::value::Endian;

    fn sample() -> Pattern {
        let member = |name: &str, offset, value| Pattern {
            offset,
            size: 1,
            endian: Endian::Little,
            color: PALETTE[0],
            name: name.into(),
            type_name: "u8".into(),
            comment: None,
            visualizer: None,
            hidden: false,
            kind: PatternKind::Unsigned { value },
        };

        Pattern {
            offset: 0,
            size: 2,
            endian: Endian::Little,
            color: PALETTE[1],
            name: "header".into(),
            type_name: "Header".into(),
            comment: None,
            visualizer: None,
            hidden: false,
            kind: PatternKind::Struct {
                members: vec![member("a", 0, 0x10), member("b", 1, 0x20)],
            },
        }
    }

    #[test]
    fn test_walk_visits_composites_then_children() {
        #[derive(Default)]
        struct Counter {
            structs: usize,
            leaves: usize,
            left: usize,
        }
        impl PatternVisitor for Counter {
            fn visit_struct(&mut self, _: &Pattern) {
                self.structs += 1;
            }
            fn visit_unsigned(&mut self, _: &Pattern) {
                self.leaves += 1;
            }
            fn leave_composite(&mut self, _: &Pattern) {
                self.left += 1;
            }
        }

        let mut counter = Counter::default();
        walk(&sample(), &mut counter);
        assert_eq!(counter.structs, 1);
        assert_eq!(counter.leaves, 2);
        assert_eq!(counter.left, 1);
    }

    #[test]
    fn test_tree_formatter_indents_members() {
        let text = TreeFormatter::format(&[sample()]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Header"));
        assert!(lines[1].starts_with("  "));
        assert!(lines[1].contains("a = 16 (0x10)"));
    }
}
