//! Validator
//!
//! Single pre-evaluation pass over the parsed program. Catches name
//! collisions and impossible layouts the parser accepts syntactically.
//! Never mutates the AST.

use std::collections::HashSet;

use crate::ast::{Ast, NodeId, NodeKind};
use crate::error::Error;
use crate::parser::ParsedProgram;
use crate::token::ValueType;
use crate::value::Literal;

pub fn validate(program: &ParsedProgram) -> Result<(), Error> {
    let ast = &program.ast;

    // Types and top-level variables share one namespace.
    let mut top_level = HashSet::new();

    for &root in &program.roots {
        match ast.kind(root) {
            NodeKind::Struct { name, members, inherits, .. } => {
                claim(&mut top_level, name, ast.line(root))?;
                check_members(ast, name, members)?;
                for base in inherits {
                    if !program.types.contains_key(base) {
                        return Err(Error::Validation {
                            line: ast.line(root),
                            message: format!("struct '{name}' inherits undeclared type '{base}'"),
                        });
                    }
                }
            }
            NodeKind::Union { name, members, .. } => {
                claim(&mut top_level, name, ast.line(root))?;
                check_members(ast, name, members)?;
            }
            NodeKind::Enum { name, entries, .. } => {
                claim(&mut top_level, name, ast.line(root))?;
                let mut seen = HashSet::new();
                for (entry, _) in entries {
                    if !seen.insert(entry.as_str()) {
                        return Err(Error::Validation {
                            line: ast.line(root),
                            message: format!(
                                "redefinition of enum constant '{entry}' in '{name}'"
                            ),
                        });
                    }
                }
            }
            NodeKind::Bitfield { name, storage, fields, .. } => {
                claim(&mut top_level, name, ast.line(root))?;
                check_bitfield(ast, root, name, *storage, fields)?;
            }
            NodeKind::TypeDecl { name: Some(name), .. } => {
                claim(&mut top_level, name, ast.line(root))?;
            }
            NodeKind::VariableDecl { name, .. }
            | NodeKind::ArrayDecl { name, .. }
            | NodeKind::PointerDecl { name, .. }
                if !name.is_empty() =>
            {
                claim(&mut top_level, name, ast.line(root))?;
            }
            NodeKind::MultiVariableDecl(variables) => {
                for &variable in variables {
                    if let NodeKind::VariableDecl { name, .. } = ast.kind(variable) {
                        claim(&mut top_level, name, ast.line(variable))?;
                    }
                }
            }
            NodeKind::FunctionDef { name, .. } => {
                claim(&mut top_level, name, ast.line(root))?;
            }
            _ => {}
        }
    }

    Ok(())
}

fn claim<'a>(names: &mut HashSet<&'a str>, name: &'a str, line: u32) -> Result<(), Error> {
    if !names.insert(name) {
        return Err(Error::Validation {
            line,
            message: format!("redefinition of identifier '{name}'"),
        });
    }
    Ok(())
}

/// Duplicate member names inside one struct or union body, looking
/// through conditionals and nested type definitions.
fn check_members(ast: &Ast, owner: &str, members: &[NodeId]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    collect_member_names(ast, owner, members, &mut seen)
}

fn collect_member_names<'a>(
    ast: &'a Ast,
    owner: &str,
    members: &[NodeId],
    seen: &mut HashSet<&'a str>,
) -> Result<(), Error> {
    for &member in members {
        match ast.kind(member) {
            NodeKind::VariableDecl { name, .. }
            | NodeKind::ArrayDecl { name, .. }
            | NodeKind::PointerDecl { name, .. } => {
                if name.is_empty() {
                    continue; // anonymous padding
                }
                if !seen.insert(name) {
                    return Err(Error::Validation {
                        line: ast.line(member),
                        message: format!("duplicate member '{name}' in '{owner}'"),
                    });
                }
            }
            NodeKind::MultiVariableDecl(variables) => {
                collect_member_names(ast, owner, variables, seen)?;
            }
            NodeKind::Conditional { then_body, else_body, .. } => {
                // Branches are exclusive; each may reuse the other's names
                // but not its own.
                let mut then_seen = seen.clone();
                collect_member_names(ast, owner, then_body, &mut then_seen)?;
                collect_member_names(ast, owner, else_body, seen)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_bitfield(
    ast: &Ast,
    node: NodeId,
    name: &str,
    storage: Option<NodeId>,
    fields: &[(String, NodeId)],
) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for (field, _) in fields {
        if field != "padding" && !seen.insert(field.as_str()) {
            return Err(Error::Validation {
                line: ast.line(node),
                message: format!("duplicate bitfield field '{field}' in '{name}'"),
            });
        }
    }

    // When the storage type is declared and every width is a literal, the
    // sum must fit. Widths that are runtime expressions are checked by the
    // evaluator instead.
    let Some(storage) = storage else {
        return Ok(());
    };
    let Some(storage_bits) = builtin_size(ast, storage).map(|bytes| bytes * 8) else {
        return Ok(());
    };

    let mut total: u64 = 0;
    for (_, width) in fields {
        match ast.kind(*width) {
            NodeKind::Literal(Literal::Unsigned(v)) => total += *v as u64,
            NodeKind::Literal(Literal::Signed(v)) => total += *v as u64,
            _ => return Ok(()),
        }
    }

    if total > storage_bits {
        return Err(Error::Validation {
            line: ast.line(node),
            message: format!(
                "bitfield '{name}' declares {total} bits but its storage holds {storage_bits}"
            ),
        });
    }
    Ok(())
}

fn builtin_size(ast: &Ast, ty: NodeId) -> Option<u64> {
    match ast.kind(ty) {
        NodeKind::BuiltinType(vt) if *vt != ValueType::Auto => Some(vt.size()),
        NodeKind::TypeDecl { inner, .. } => builtin_size(ast, *inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn validate_source(source: &str) -> Result<(), Error> {
        validate(&parse(&lex(source).unwrap()).unwrap())
    }

    #[test]
    fn test_valid_program_passes() {
        validate_source(
            "struct Header { u32 magic; u16 count; }; \
             enum Kind : u8 { A, B }; \
             Header hdr @ 0;",
        )
        .unwrap();
    }

    #[test]
    fn test_duplicate_top_level_names_rejected() {
        let error = validate_source("u32 thing; u8 thing;").unwrap_err();
        assert!(error.to_string().contains("redefinition"));

        // Types and variables share the namespace.
        let error = validate_source("struct data { u8 a; }; u32 data;").unwrap_err();
        assert!(error.to_string().contains("redefinition"));
    }

    #[test]
    fn test_duplicate_struct_members_rejected() {
        let error = validate_source("struct S { u8 x; u16 x; };").unwrap_err();
        assert!(error.to_string().contains("duplicate member"));
    }

    #[test]
    fn test_conditional_branches_may_share_names() {
        validate_source(
            "struct S { u8 tag; if (tag == 1) { u32 body; } else { u16 body; } };",
        )
        .unwrap();

        let error =
            validate_source("struct S { u8 tag; if (tag) { u8 x; u16 x; } };").unwrap_err();
        assert!(error.to_string().contains("duplicate member"));
    }

    #[test]
    fn test_duplicate_enum_entries_rejected() {
        let error = validate_source("enum E : u8 { A, A };").unwrap_err();
        assert!(error.to_string().contains("enum constant"));
    }

    #[test]
    fn test_duplicate_bitfield_fields_rejected() {
        let error = validate_source("bitfield B { f : 2; f : 3; };").unwrap_err();
        assert!(error.to_string().contains("bitfield field"));

        // Multiple padding fields are fine.
        validate_source("bitfield B { a : 1; padding : 2; padding : 3; b : 2; };").unwrap();
    }

    #[test]
    fn test_bitfield_overflowing_declared_storage_rejected() {
        let error = validate_source("bitfield B : u8 { a : 5; b : 5; };").unwrap_err();
        assert!(error.to_string().contains("storage"));

        validate_source("bitfield B : u16 { a : 5; b : 5; };").unwrap();
    }
}
