//! Pattern tree
//!
//! The result of a successful evaluation: a tree of typed, located,
//! named decodings of byte regions. Composite kinds own their children;
//! parent links are supplied by the walk context, never stored.

use serde::Serialize;

use crate::value::{Endian, Literal};

/// Palette cycled for patterns that carry no explicit `color` attribute.
pub const PALETTE: [u32; 8] = [
    0x50_B4_77_1F, 0x50_1F_77_B4, 0x50_2C_A0_2C, 0x50_28_27_D6, 0x50_BD_67_94, 0x50_4B_56_8C,
    0x50_C2_77_E3, 0x50_7F_7F_7F,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    /// Absolute byte offset in the provider.
    pub offset: u64,
    /// Byte size; bitfield fields report the size of their host storage
    /// share rounded down to zero when under a byte.
    pub size: u64,
    pub endian: Endian,
    pub color: u32,
    /// Variable name (possibly overridden by a `name` attribute).
    pub name: String,
    /// Display type name, e.g. `u32` or the struct's name.
    pub type_name: String,
    pub comment: Option<String>,
    /// Inline visualiser hint, opaque to the evaluator.
    pub visualizer: Option<String>,
    pub hidden: bool,
    pub kind: PatternKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternKind {
    Unsigned { value: u128 },
    Signed { value: i128 },
    Float { value: f64 },
    Bool { value: bool },
    Character { value: char },
    Character16 { value: u16 },
    String { value: String },
    WideString { value: String },
    Padding,
    Enum {
        value: u128,
        /// Ordered `(value, name)` pairs of the enum definition.
        entries: Vec<(u128, String)>,
    },
    Bitfield { fields: Vec<Pattern> },
    BitfieldField { bit_offset: u32, bit_size: u32, value: u128 },
    Struct { members: Vec<Pattern> },
    Union { members: Vec<Pattern> },
    StaticArray { entries: Vec<Pattern> },
    DynamicArray { entries: Vec<Pattern> },
    Pointer {
        pointer_base: u64,
        pointed_at: u64,
        pointee: Box<Pattern>,
    },
}

impl Pattern {
    /// Ordered children of a composite pattern; empty for leaves.
    pub fn children(&self) -> &[Pattern] {
        match &self.kind {
            PatternKind::Bitfield { fields } => fields,
            PatternKind::Struct { members } | PatternKind::Union { members } => members,
            PatternKind::StaticArray { entries } | PatternKind::DynamicArray { entries } => {
                entries
            }
            PatternKind::Pointer { pointee, .. } => std::slice::from_ref(pointee),
            _ => &[],
        }
    }

    /// Child with the given (variable) name.
    pub fn child(&self, name: &str) -> Option<&Pattern> {
        self.children().iter().find(|c| c.name == name)
    }

    /// Leaf value as a literal, if this kind carries one.
    pub fn value(&self) -> Option<Literal> {
        match &self.kind {
            PatternKind::Unsigned { value } => Some(Literal::Unsigned(*value)),
            PatternKind::Signed { value } => Some(Literal::Signed(*value)),
            PatternKind::Float { value } => Some(Literal::Float(*value)),
            PatternKind::Bool { value } => Some(Literal::Bool(*value)),
            PatternKind::Character { value } => Some(Literal::Character(*value)),
            PatternKind::Character16 { value } => Some(Literal::Character16(*value)),
            PatternKind::String { value } | PatternKind::WideString { value } => {
                Some(Literal::Str(value.clone()))
            }
            PatternKind::Enum { value, .. } => Some(Literal::Unsigned(*value)),
            PatternKind::BitfieldField { value, .. } => Some(Literal::Unsigned(*value)),
            PatternKind::Pointer { pointed_at, .. } => {
                Some(Literal::Unsigned(u128::from(*pointed_at)))
            }
            _ => None,
        }
    }

    /// Name of the matching enum entry, for enum patterns.
    pub fn enum_entry_name(&self) -> Option<&str> {
        match &self.kind {
            PatternKind::Enum { value, entries } => entries
                .iter()
                .find(|(entry_value, _)| entry_value == value)
                .map(|(_, name)| name.as_str()),
            _ => None,
        }
    }

    /// Re-anchor a pointer pattern on a new base address. The pointee
    /// (and everything below it) shifts by the same delta so that
    /// `pointee.offset == pointer_base + stored value` keeps holding.
    pub fn rebase(&mut self, base: u64) {
        if let PatternKind::Pointer {
            pointer_base,
            pointed_at,
            pointee,
        } = &mut self.kind
        {
            let raw = *pointed_at - *pointer_base;
            let target = base + raw;
            let delta = target as i128 - *pointed_at as i128;

            *pointer_base = base;
            *pointed_at = target;
            pointee.shift(delta);
        }
    }

    fn shift(&mut self, delta: i128) {
        self.offset = (self.offset as i128 + delta) as u64;
        match &mut self.kind {
            PatternKind::Bitfield { fields } => {
                for field in fields {
                    field.shift(delta);
                }
            }
            PatternKind::Struct { members } | PatternKind::Union { members } => {
                for member in members {
                    member.shift(delta);
                }
            }
            PatternKind::StaticArray { entries } | PatternKind::DynamicArray { entries } => {
                for entry in entries {
                    entry.shift(delta);
                }
            }
            PatternKind::Pointer { pointee, .. } => pointee.shift(delta),
            _ => {}
        }
    }
}

/// Export a top-level pattern list as JSON for host consumption.
pub fn to_json(patterns: &[Pattern]) -> serde_json::Value {
    serde_json::to_value(patterns).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, offset: u64, size: u64, value: u128) -> Pattern {
        Pattern {
            offset,
            size,
            endian: Endian::Little,
            color: PALETTE[0],
            name: name.into(),
            type_name: "u8".into(),
            comment: None,
            visualizer: None,
            hidden: false,
            kind: PatternKind::Unsigned { value },
        }
    }

    #[test]
    fn test_children_and_lookup() {
        let pattern = Pattern {
            offset: 0,
            size: 2,
            endian: Endian::Little,
            color: PALETTE[1],
            name: "pair".into(),
            type_name: "Pair".into(),
            comment: None,
            visualizer: None,
            hidden: false,
            kind: PatternKind::Struct {
                members: vec![leaf("a", 0, 1, 1), leaf("b", 1, 1, 2)],
            },
        };

        assert_eq!(pattern.children().len(), 2);
        assert_eq!(pattern.child("b").unwrap().offset, 1);
        assert_eq!(pattern.child("b").unwrap().value(), Some(Literal::Unsigned(2)));
        assert!(pattern.child("c").is_none());
    }

    #[test]
    fn test_pointer_rebase_shifts_pointee() {
        let mut pointer = Pattern {
            offset: 0,
            size: 2,
            endian: Endian::Little,
            color: PALETTE[2],
            name: "p".into(),
            type_name: "u8".into(),
            comment: None,
            visualizer: None,
            hidden: false,
            kind: PatternKind::Pointer {
                pointer_base: 0,
                pointed_at: 4,
                pointee: Box::new(leaf("*p", 4, 1, 0xDE)),
            },
        };

        pointer.rebase(0x100);
        let PatternKind::Pointer { pointer_base, pointed_at, pointee } = &pointer.kind else {
            unreachable!();
        };
        assert_eq!(*pointer_base, 0x100);
        assert_eq!(*pointed_at, 0x104);
        assert_eq!(pointee.offset, 0x104);
    }

    #[test]
    fn test_enum_entry_lookup() {
        let pattern = Pattern {
            offset: 0,
            size: 1,
            endian: Endian::Little,
            color: PALETTE[3],
            name: "kind".into(),
            type_name: "Kind".into(),
            comment: None,
            visualizer: None,
            hidden: false,
            kind: PatternKind::Enum {
                value: 5,
                entries: vec![(0, "None".into()), (5, "File".into())],
            },
        };
        assert_eq!(pattern.enum_entry_name(), Some("File"));
    }

    #[test]
    fn test_json_export_carries_kind_tags() {
        let json = to_json(&[leaf("x", 0, 1, 7)]);
        assert_eq!(json[0]["kind"], "unsigned");
        assert_eq!(json[0]["name"], "x");
    }
}
