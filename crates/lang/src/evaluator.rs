//! Evaluator
//!
//! Walks the AST while advancing a byte cursor against the provider and
//! produces the pattern tree. Loop and function unwinding travel through
//! an explicit [`ControlFlow`] value; hard errors propagate as `Result`s
//! and never double as control flow.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use runic_provider::Provider;

use crate::ast::{
    ArraySize, Ast, Direction, FlowKind, NodeId, NodeKind, PathSegment, TypeOp, TypeOperand,
};
use crate::console::LogConsole;
use crate::error::Error;
use crate::functions::{EvalContext, FunctionRegistry, ParamCount};
use crate::pattern::{PALETTE, Pattern, PatternKind};
use crate::token::ValueType;
use crate::value::{
    self, Endian, Literal, float_from_bytes, signed_from_bytes, unsigned_from_bytes,
};

/// Loop/function unwind state. `None` before every statement; composite
/// statements check it after each sub-statement and unwind while it is
/// set.
#[derive(Debug, Clone, PartialEq)]
enum ControlFlow {
    None,
    Break,
    Continue,
    Return(Option<Literal>),
}

pub struct Limits {
    pub pattern_limit: u64,
    pub recursion_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            pattern_limit: 0x8_0000,
            recursion_limit: 64,
        }
    }
}

pub struct Evaluator<'rt> {
    provider: &'rt dyn Provider,
    ast: &'rt Ast,
    types: &'rt HashMap<String, NodeId>,
    registry: &'rt FunctionRegistry,
    console: LogConsole,

    env: HashMap<String, Literal>,
    in_vars: HashMap<String, Literal>,
    out_names: Vec<String>,
    user_functions: HashMap<String, NodeId>,

    offset: u64,
    endian_stack: Vec<Endian>,
    /// Composite construction frames; index 0 is the global scope.
    scopes: Vec<Vec<Pattern>>,
    /// Local-variable frames; index 0 holds globals (in/out variables).
    locals: Vec<HashMap<String, Literal>>,
    control_flow: ControlFlow,

    recursion_depth: u32,
    limits: Limits,
    pattern_count: u64,
    color_index: usize,
    function_depth: u32,
    abort: Arc<AtomicBool>,
}

impl<'rt> Evaluator<'rt> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: &'rt dyn Provider,
        ast: &'rt Ast,
        types: &'rt HashMap<String, NodeId>,
        registry: &'rt FunctionRegistry,
        default_endian: Endian,
        limits: Limits,
        abort: Arc<AtomicBool>,
        env: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
    ) -> Self {
        Evaluator {
            provider,
            ast,
            types,
            registry,
            console: LogConsole::new(),
            env,
            in_vars,
            out_names: Vec::new(),
            user_functions: HashMap::new(),
            offset: 0,
            endian_stack: vec![default_endian],
            scopes: Vec::new(),
            locals: vec![HashMap::new()],
            control_flow: ControlFlow::None,
            recursion_depth: 0,
            limits,
            pattern_count: 0,
            color_index: 0,
            function_depth: 0,
            abort,
        }
    }

    /// Evaluate a whole program and return the top-level pattern list.
    pub fn evaluate(&mut self, roots: &[NodeId]) -> Result<Vec<Pattern>, Error> {
        self.scopes.push(Vec::new());

        for &root in roots {
            self.check_interrupt(self.ast.line(root))?;
            match self.ast.kind(root) {
                NodeKind::FunctionDef { name, .. } => {
                    self.user_functions.insert(name.clone(), root);
                }
                NodeKind::Struct { .. }
                | NodeKind::Union { .. }
                | NodeKind::Enum { .. }
                | NodeKind::Bitfield { .. }
                | NodeKind::TypeDecl { .. } => {}
                NodeKind::VariableDecl {
                    name,
                    direction: Some(direction),
                    ..
                } => {
                    let line = self.ast.line(root);
                    match direction {
                        Direction::In => {
                            let value = self.in_vars.get(name).cloned().ok_or_else(|| {
                                Error::Evaluation {
                                    line,
                                    message: format!("no value supplied for in variable '{name}'"),
                                }
                            })?;
                            self.locals[0].insert(name.clone(), value);
                        }
                        Direction::Out => {
                            self.locals[0].insert(name.clone(), Literal::Unsigned(0));
                            self.out_names.push(name.clone());
                        }
                    }
                }
                _ => self.evaluate_member_statement(root)?,
            }
        }

        let patterns = self.scopes.pop().unwrap_or_default();
        tracing::debug!(
            patterns = patterns.len(),
            bytes_read = self.offset,
            "evaluation finished"
        );
        Ok(patterns)
    }

    /// Call an already-registered user function; entry point for
    /// `execute_function`.
    pub fn call_entry(&mut self, name: &str, line: u32) -> Result<Option<Literal>, Error> {
        self.scopes.push(Vec::new());
        let result = self.call_function(name, &[], line);
        self.scopes.pop();
        result
    }

    pub fn console(&self) -> &LogConsole {
        &self.console
    }

    pub fn into_console(self) -> LogConsole {
        self.console
    }

    /// Values of `out` variables after a successful run.
    pub fn out_variables(&self) -> HashMap<String, Literal> {
        self.out_names
            .iter()
            .filter_map(|name| {
                self.locals[0]
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    // ---- plumbing ----

    fn error(&self, line: u32, message: impl Into<String>) -> Error {
        Error::Evaluation {
            line,
            message: message.into(),
        }
    }

    fn check_interrupt(&self, _line: u32) -> Result<(), Error> {
        if self.abort.load(Ordering::Acquire) {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    fn current_endian(&self) -> Endian {
        *self.endian_stack.last().unwrap_or(&Endian::Little)
    }

    fn enter_recursion(&mut self, line: u32) -> Result<(), Error> {
        self.recursion_depth += 1;
        if self.recursion_depth > self.limits.recursion_limit {
            self.console.error(format!(
                "recursion depth {} exceeds the configured limit",
                self.recursion_depth
            ));
            return Err(Error::RecursionLimit {
                line,
                limit: self.limits.recursion_limit,
            });
        }
        Ok(())
    }

    fn leave_recursion(&mut self) {
        self.recursion_depth -= 1;
    }

    fn next_color(&mut self) -> u32 {
        let color = PALETTE[self.color_index % PALETTE.len()];
        self.color_index += 1;
        color
    }

    fn make_pattern(
        &mut self,
        offset: u64,
        size: u64,
        name: &str,
        type_name: String,
        kind: PatternKind,
        line: u32,
    ) -> Result<Pattern, Error> {
        self.pattern_count += 1;
        if self.pattern_count > self.limits.pattern_limit {
            return Err(Error::PatternLimit {
                line,
                limit: self.limits.pattern_limit,
            });
        }

        Ok(Pattern {
            offset,
            size,
            endian: self.current_endian(),
            color: self.next_color(),
            name: name.to_string(),
            type_name,
            comment: None,
            visualizer: None,
            hidden: false,
            kind,
        })
    }

    fn read_bytes(&mut self, offset: u64, size: u64, line: u32) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; size as usize];
        self.provider.read(offset, &mut buf).map_err(|e| {
            self.error(line, format!("read of {size} bytes at {offset:#x} failed: {e}"))
        })?;
        Ok(buf)
    }

    fn data_size(&self) -> u64 {
        self.provider.size()
    }

    fn in_global_scope(&self) -> bool {
        self.scopes.len() <= 1 && self.function_depth == 0
    }

    // ---- declarations producing patterns ----

    /// Evaluate one member/top-level statement, appending any produced
    /// patterns to the innermost scope.
    fn evaluate_member_statement(&mut self, node: NodeId) -> Result<(), Error> {
        let line = self.ast.line(node);
        self.check_interrupt(line)?;

        match self.ast.kind(node) {
            NodeKind::VariableDecl {
                name,
                ty,
                placement,
                direction: None,
                ..
            } => {
                let (name, ty, placement) = (name.clone(), *ty, *placement);
                self.with_placement(placement, line, |this| {
                    let mut pattern = this.evaluate_type(ty, &name, line)?;
                    this.apply_declaration_attributes(&mut pattern, ty, node)?;
                    this.push_pattern(pattern);
                    Ok(())
                })
            }
            NodeKind::ArrayDecl {
                name,
                ty,
                size,
                placement,
                ..
            } => {
                let (name, ty, size, placement) = (name.clone(), *ty, *size, *placement);
                self.with_placement(placement, line, |this| {
                    let mut pattern = this.evaluate_array(ty, &name, size, line)?;
                    this.apply_declaration_attributes(&mut pattern, ty, node)?;
                    this.push_pattern(pattern);
                    Ok(())
                })
            }
            NodeKind::PointerDecl {
                name,
                pointee,
                size_type,
                placement,
                ..
            } => {
                let (name, pointee, size_type, placement) =
                    (name.clone(), *pointee, *size_type, *placement);
                self.with_placement(placement, line, |this| {
                    let mut pattern = this.evaluate_pointer(pointee, size_type, &name, line)?;
                    this.apply_declaration_attributes(&mut pattern, pointee, node)?;
                    this.push_pattern(pattern);
                    Ok(())
                })
            }
            NodeKind::MultiVariableDecl(variables) => {
                for &variable in &variables.clone() {
                    self.evaluate_member_statement(variable)?;
                }
                Ok(())
            }
            NodeKind::Conditional {
                condition,
                then_body,
                else_body,
            } => {
                let (condition, then_body, else_body) =
                    (*condition, then_body.clone(), else_body.clone());
                let taken = self.evaluate_expression(condition)?.to_bool();
                let body = if taken { &then_body } else { &else_body };
                for &member in body {
                    self.evaluate_member_statement(member)?;
                    if self.control_flow != ControlFlow::None {
                        break;
                    }
                }
                Ok(())
            }
            NodeKind::ControlFlow { kind, .. } => {
                self.control_flow = match kind {
                    FlowKind::Break => ControlFlow::Break,
                    FlowKind::Continue => ControlFlow::Continue,
                    FlowKind::Return => ControlFlow::Return(None),
                };
                Ok(())
            }
            NodeKind::FunctionCallStatement(expression) => {
                let expression = *expression;
                self.evaluate_statement_expression(expression)?;
                Ok(())
            }
            NodeKind::Assignment { .. } => self.evaluate_function_statement(node),
            NodeKind::FunctionDef { name, .. } => {
                self.user_functions.insert(name.clone(), node);
                Ok(())
            }
            NodeKind::Struct { .. }
            | NodeKind::Union { .. }
            | NodeKind::Enum { .. }
            | NodeKind::Bitfield { .. }
            | NodeKind::TypeDecl { .. } => Ok(()),
            _ => Err(self.error(line, "statement is not allowed at pattern scope")),
        }
    }

    /// Run `body` with the cursor moved to the placement target. Inside a
    /// nested scope the cursor is restored afterwards; at global scope it
    /// stays where the placed declaration left it.
    fn with_placement(
        &mut self,
        placement: Option<NodeId>,
        line: u32,
        body: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let Some(placement) = placement else {
            return body(self);
        };

        let target = self.evaluate_expression(placement)?.to_unsigned();
        if target > u128::from(u64::MAX) {
            return Err(self.error(line, "placement address does not fit in 64 bits"));
        }

        let saved = self.offset;
        self.offset = target as u64;
        let result = body(self);
        if !self.in_global_scope() {
            self.offset = saved;
        }
        result
    }

    fn push_pattern(&mut self, pattern: Pattern) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(pattern);
        }
    }

    // ---- type evaluation ----

    fn evaluate_type(&mut self, ty: NodeId, name: &str, line: u32) -> Result<Pattern, Error> {
        self.enter_recursion(line)?;
        let result = self.evaluate_type_inner(ty, name, line);
        self.leave_recursion();
        result
    }

    fn evaluate_type_inner(
        &mut self,
        ty: NodeId,
        name: &str,
        line: u32,
    ) -> Result<Pattern, Error> {
        match self.ast.kind(ty) {
            NodeKind::BuiltinType(vt) => self.evaluate_builtin(*vt, name, line),
            NodeKind::TypeDecl {
                name: alias,
                endian,
                inner,
            } => {
                let (alias, endian, inner) = (alias.clone(), *endian, *inner);
                if let Some(endian) = endian {
                    self.endian_stack.push(endian);
                }
                let mut pattern = self.evaluate_type_inner(inner, name, line);
                if endian.is_some() {
                    self.endian_stack.pop();
                }
                if let (Ok(pattern), Some(alias)) = (&mut pattern, alias) {
                    pattern.type_name = alias;
                }
                pattern
            }
            NodeKind::Struct { .. } => self.evaluate_struct(ty, name, line),
            NodeKind::Union { .. } => self.evaluate_union(ty, name, line),
            NodeKind::Enum { .. } => self.evaluate_enum(ty, name, line),
            NodeKind::Bitfield { .. } => self.evaluate_bitfield(ty, name, line),
            _ => Err(self.error(line, "expected a type")),
        }
    }

    fn evaluate_builtin(
        &mut self,
        vt: ValueType,
        name: &str,
        line: u32,
    ) -> Result<Pattern, Error> {
        let size = vt.size();
        let offset = self.offset;
        let endian = self.current_endian();

        let kind = match vt {
            ValueType::Padding => {
                self.offset += size;
                PatternKind::Padding
            }
            ValueType::String | ValueType::Auto => {
                return Err(self.error(
                    line,
                    format!("type '{vt}' cannot be read from the data source"),
                ));
            }
            ValueType::Float | ValueType::Double => {
                let bytes = self.read_bytes(offset, size, line)?;
                self.offset += size;
                PatternKind::Float {
                    value: float_from_bytes(&bytes, endian),
                }
            }
            ValueType::Boolean => {
                let bytes = self.read_bytes(offset, size, line)?;
                self.offset += size;
                PatternKind::Bool {
                    value: bytes[0] != 0,
                }
            }
            ValueType::Character => {
                let bytes = self.read_bytes(offset, size, line)?;
                self.offset += size;
                PatternKind::Character {
                    value: bytes[0] as char,
                }
            }
            ValueType::Character16 => {
                let bytes = self.read_bytes(offset, size, line)?;
                self.offset += size;
                PatternKind::Character16 {
                    value: unsigned_from_bytes(&bytes, endian) as u16,
                }
            }
            _ if vt.is_signed() => {
                let bytes = self.read_bytes(offset, size, line)?;
                self.offset += size;
                PatternKind::Signed {
                    value: signed_from_bytes(&bytes, endian),
                }
            }
            _ => {
                let bytes = self.read_bytes(offset, size, line)?;
                self.offset += size;
                PatternKind::Unsigned {
                    value: unsigned_from_bytes(&bytes, endian),
                }
            }
        };

        self.make_pattern(offset, size, name, vt.name().to_string(), kind, line)
    }

    fn evaluate_struct(&mut self, ty: NodeId, name: &str, line: u32) -> Result<Pattern, Error> {
        let NodeKind::Struct {
            name: type_name,
            inherits,
            members,
            ..
        } = self.ast.kind(ty)
        else {
            return Err(self.error(line, "expected a struct type"));
        };
        let (type_name, inherits, members) =
            (type_name.clone(), inherits.clone(), members.clone());

        let start = self.offset;
        self.scopes.push(Vec::new());

        let result = (|| {
            // Inherited members lay out first, in base-list order.
            for base in &inherits {
                let base_ty = *self.types.get(base).ok_or_else(|| {
                    self.error(line, format!("unknown base type '{base}'"))
                })?;
                let NodeKind::Struct {
                    members: base_members,
                    ..
                } = self.ast.kind(base_ty)
                else {
                    return Err(
                        self.error(line, format!("base type '{base}' is not a struct"))
                    );
                };
                for &member in &base_members.clone() {
                    self.evaluate_member_statement(member)?;
                    if self.control_flow != ControlFlow::None {
                        return Ok(());
                    }
                }
            }

            for &member in &members {
                self.evaluate_member_statement(member)?;
                if self.control_flow != ControlFlow::None {
                    return Ok(());
                }
            }
            Ok(())
        })();

        let children = self.scopes.pop().unwrap_or_default();
        result?;

        let size = self.offset - start;
        self.make_pattern(
            start,
            size,
            name,
            type_name,
            PatternKind::Struct { members: children },
            line,
        )
    }

    fn evaluate_union(&mut self, ty: NodeId, name: &str, line: u32) -> Result<Pattern, Error> {
        let NodeKind::Union {
            name: type_name,
            members,
            ..
        } = self.ast.kind(ty)
        else {
            return Err(self.error(line, "expected a union type"));
        };
        let (type_name, members) = (type_name.clone(), members.clone());

        let start = self.offset;
        let mut end = start;
        self.scopes.push(Vec::new());

        let result: Result<(), Error> = (|| {
            for &member in &members {
                self.offset = start;
                self.evaluate_member_statement(member)?;
                end = end.max(self.offset);
                if self.control_flow != ControlFlow::None {
                    break;
                }
            }
            Ok(())
        })();

        let children = self.scopes.pop().unwrap_or_default();
        result?;

        self.offset = end;
        self.make_pattern(
            start,
            end - start,
            name,
            type_name,
            PatternKind::Union { members: children },
            line,
        )
    }

    /// Ordered `(value, name)` pairs of an enum definition, with implicit
    /// auto-increment from the previous entry.
    fn enum_entries(&mut self, ty: NodeId, line: u32) -> Result<Vec<(u128, String)>, Error> {
        let NodeKind::Enum { entries, .. } = self.ast.kind(ty) else {
            return Err(self.error(line, "expected an enum type"));
        };

        let entries = entries.clone();
        let mut resolved = Vec::with_capacity(entries.len());
        let mut next = 0u128;
        for (entry_name, expr) in entries {
            let value = match expr {
                Some(expr) => self.evaluate_expression(expr)?.to_unsigned(),
                None => next,
            };
            next = value.wrapping_add(1);
            resolved.push((value, entry_name));
        }
        Ok(resolved)
    }

    fn evaluate_enum(&mut self, ty: NodeId, name: &str, line: u32) -> Result<Pattern, Error> {
        let NodeKind::Enum {
            name: type_name,
            storage,
            ..
        } = self.ast.kind(ty)
        else {
            return Err(self.error(line, "expected an enum type"));
        };
        let (type_name, storage) = (type_name.clone(), *storage);

        let size = self.builtin_size(storage).ok_or_else(|| {
            self.error(line, format!("enum '{type_name}' needs an integral storage type"))
        })?;

        let entries = self.enum_entries(ty, line)?;
        let offset = self.offset;
        let bytes = self.read_bytes(offset, size, line)?;
        let value = unsigned_from_bytes(&bytes, self.current_endian());
        self.offset += size;

        self.make_pattern(
            offset,
            size,
            name,
            type_name,
            PatternKind::Enum { value, entries },
            line,
        )
    }

    fn evaluate_bitfield(&mut self, ty: NodeId, name: &str, line: u32) -> Result<Pattern, Error> {
        let NodeKind::Bitfield {
            name: type_name,
            storage,
            fields,
            attributes,
        } = self.ast.kind(ty)
        else {
            return Err(self.error(line, "expected a bitfield type"));
        };
        let (type_name, storage, fields, attributes) = (
            type_name.clone(),
            *storage,
            fields.clone(),
            attributes.clone(),
        );

        let mut widths = Vec::with_capacity(fields.len());
        let mut total_bits = 0u64;
        for (field_name, width_expr) in &fields {
            let bits = self.evaluate_expression(*width_expr)?.to_unsigned();
            if bits == 0 || bits > 128 {
                return Err(self.error(
                    line,
                    format!("bitfield field '{field_name}' has invalid width {bits}"),
                ));
            }
            total_bits += bits as u64;
            widths.push((field_name.clone(), bits as u32));
        }

        let size = match storage {
            Some(storage) => {
                let size = self.builtin_size(storage).ok_or_else(|| {
                    self.error(line, "bitfield storage must be an integral type")
                })?;
                if total_bits > size * 8 {
                    return Err(self.error(
                        line,
                        format!(
                            "bitfield '{type_name}' declares {total_bits} bits but its storage holds {}",
                            size * 8
                        ),
                    ));
                }
                size
            }
            None => total_bits.div_ceil(8),
        };
        // The packed storage is decoded through the 128-bit tower.
        if size > 16 {
            return Err(self.error(
                line,
                format!("bitfield '{type_name}' spans {size} bytes, more than the supported 16"),
            ));
        }

        let offset = self.offset;
        let bytes = self.read_bytes(offset, size, line)?;
        let storage_value = unsigned_from_bytes(&bytes, self.current_endian());
        self.offset += size;

        let left_to_right = self.attributes_contain(&attributes, "left_to_right");

        let mut fields_out = Vec::new();
        let mut bit_cursor = 0u32;
        for (field_name, bits) in widths {
            if field_name == "padding" {
                bit_cursor += bits;
                continue;
            }

            let shift = if left_to_right {
                size as u32 * 8 - bit_cursor - bits
            } else {
                bit_cursor
            };
            let mask = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
            let value = (storage_value >> shift) & mask;

            let field = self.make_pattern(
                offset,
                u64::from(bits) / 8,
                &field_name,
                format!("{type_name}.{field_name}"),
                PatternKind::BitfieldField {
                    bit_offset: bit_cursor,
                    bit_size: bits,
                    value,
                },
                line,
            )?;
            fields_out.push(field);
            bit_cursor += bits;
        }

        self.make_pattern(
            offset,
            size,
            name,
            type_name,
            PatternKind::Bitfield { fields: fields_out },
            line,
        )
    }

    // ---- arrays, strings, pointers ----

    fn evaluate_array(
        &mut self,
        ty: NodeId,
        name: &str,
        size: ArraySize,
        line: u32,
    ) -> Result<Pattern, Error> {
        // Character and padding arrays collapse into single patterns.
        if let Some(vt) = self.resolve_builtin(ty) {
            match vt {
                ValueType::Character => return self.evaluate_string(name, size, line),
                ValueType::Character16 => return self.evaluate_wide_string(name, size, line),
                ValueType::Padding => {
                    let ArraySize::Fixed(count) = size else {
                        return Err(self.error(line, "padding needs a fixed size"));
                    };
                    let count = self.evaluate_expression(count)?.to_unsigned() as u64;
                    let offset = self.offset;
                    self.offset = offset.checked_add(count).ok_or_else(|| {
                        self.error(line, "padding size computation overflows")
                    })?;
                    return self.make_pattern(
                        offset,
                        count,
                        name,
                        format!("padding[{count}]"),
                        PatternKind::Padding,
                        line,
                    );
                }
                _ => {}
            }
        }

        let element_type = self.type_display_name(ty);
        let start = self.offset;
        let mut entries = Vec::new();

        match size {
            ArraySize::Fixed(count_expr) => {
                let count = self.evaluate_expression(count_expr)?.to_unsigned();
                for index in 0..count {
                    self.check_interrupt(line)?;
                    let entry = self.evaluate_type(ty, &format!("[{index}]"), line)?;
                    entries.push(entry);
                    match std::mem::replace(&mut self.control_flow, ControlFlow::None) {
                        ControlFlow::Break => break,
                        flow @ ControlFlow::Return(_) => {
                            self.control_flow = flow;
                            break;
                        }
                        _ => {}
                    }
                }

                let size = self.offset - start;
                self.make_pattern(
                    start,
                    size,
                    name,
                    format!("{element_type}[{}]", entries.len()),
                    PatternKind::StaticArray { entries },
                    line,
                )
            }
            ArraySize::While(condition) => {
                loop {
                    self.check_interrupt(line)?;
                    if !self.evaluate_expression(condition)?.to_bool() {
                        break;
                    }
                    let index = entries.len();
                    let entry = self.evaluate_type(ty, &format!("[{index}]"), line)?;
                    entries.push(entry);
                    match std::mem::replace(&mut self.control_flow, ControlFlow::None) {
                        ControlFlow::Break => break,
                        flow @ ControlFlow::Return(_) => {
                            self.control_flow = flow;
                            break;
                        }
                        _ => {}
                    }
                }

                let size = self.offset - start;
                self.make_pattern(
                    start,
                    size,
                    name,
                    format!("{element_type}[]"),
                    PatternKind::DynamicArray { entries },
                    line,
                )
            }
            ArraySize::Unbounded => {
                while self.offset < self.data_size() {
                    self.check_interrupt(line)?;
                    let index = entries.len();
                    let entry = self.evaluate_type(ty, &format!("[{index}]"), line)?;
                    entries.push(entry);
                    match std::mem::replace(&mut self.control_flow, ControlFlow::None) {
                        ControlFlow::Break => break,
                        flow @ ControlFlow::Return(_) => {
                            self.control_flow = flow;
                            break;
                        }
                        _ => {}
                    }
                }

                let size = self.offset - start;
                self.make_pattern(
                    start,
                    size,
                    name,
                    format!("{element_type}[]"),
                    PatternKind::DynamicArray { entries },
                    line,
                )
            }
        }
    }

    fn evaluate_string(
        &mut self,
        name: &str,
        size: ArraySize,
        line: u32,
    ) -> Result<Pattern, Error> {
        let offset = self.offset;

        let (bytes, size) = match size {
            ArraySize::Fixed(count) => {
                let count = self.evaluate_expression(count)?.to_unsigned() as u64;
                (self.read_bytes(offset, count, line)?, count)
            }
            _ => {
                // Null-terminated; the terminator counts toward the size.
                let mut bytes = Vec::new();
                let mut cursor = offset;
                loop {
                    let byte = self.read_bytes(cursor, 1, line)?[0];
                    cursor += 1;
                    if byte == 0 {
                        break;
                    }
                    bytes.push(byte);
                }
                let size = cursor - offset;
                (bytes, size)
            }
        };
        self.offset = offset + size;

        let value: String = bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        self.make_pattern(
            offset,
            size,
            name,
            format!("char[{size}]"),
            PatternKind::String { value },
            line,
        )
    }

    fn evaluate_wide_string(
        &mut self,
        name: &str,
        size: ArraySize,
        line: u32,
    ) -> Result<Pattern, Error> {
        let offset = self.offset;
        let endian = self.current_endian();

        let (units, size) = match size {
            ArraySize::Fixed(count) => {
                let count = self.evaluate_expression(count)?.to_unsigned() as u64;
                let bytes = self.read_bytes(offset, count * 2, line)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| unsigned_from_bytes(pair, endian) as u16)
                    .collect();
                (units, count * 2)
            }
            _ => {
                let mut units = Vec::new();
                let mut cursor = offset;
                loop {
                    let bytes = self.read_bytes(cursor, 2, line)?;
                    cursor += 2;
                    let unit = unsigned_from_bytes(&bytes, endian) as u16;
                    if unit == 0 {
                        break;
                    }
                    units.push(unit);
                }
                (units, cursor - offset)
            }
        };
        self.offset = offset + size;

        let value: String = units
            .iter()
            .take_while(|&&u| u != 0)
            .map(|&u| char::from_u32(u32::from(u)).unwrap_or('\u{FFFD}'))
            .collect();
        self.make_pattern(
            offset,
            size,
            name,
            format!("char16[{}]", size / 2),
            PatternKind::WideString { value },
            line,
        )
    }

    fn evaluate_pointer(
        &mut self,
        pointee: NodeId,
        size_type: NodeId,
        name: &str,
        line: u32,
    ) -> Result<Pattern, Error> {
        let size = self.builtin_size(size_type).ok_or_else(|| {
            self.error(line, "pointer size must be a built-in integral type")
        })?;

        let offset = self.offset;
        let bytes = self.read_bytes(offset, size, line)?;
        let value = unsigned_from_bytes(&bytes, self.current_endian());
        if value > u128::from(u64::MAX) {
            return Err(self.error(line, "pointer value does not fit in 64 bits"));
        }

        let pointer_base = 0u64;
        let pointed_at = pointer_base + value as u64;

        // The cursor after a pointer advances by the pointer's own size,
        // not the pointee's.
        let after = offset + size;
        self.offset = pointed_at;
        let pointee_pattern = self.evaluate_type(pointee, &format!("*{name}"), line)?;
        self.offset = after;

        let type_name = format!("{}*", pointee_pattern.type_name);
        self.make_pattern(
            offset,
            size,
            name,
            type_name,
            PatternKind::Pointer {
                pointer_base,
                pointed_at,
                pointee: Box::new(pointee_pattern),
            },
            line,
        )
    }

    // ---- type helpers ----

    fn resolve_builtin(&self, ty: NodeId) -> Option<ValueType> {
        match self.ast.kind(ty) {
            NodeKind::BuiltinType(vt) => Some(*vt),
            NodeKind::TypeDecl { inner, .. } => self.resolve_builtin(*inner),
            _ => None,
        }
    }

    fn builtin_size(&self, ty: NodeId) -> Option<u64> {
        self.resolve_builtin(ty)
            .filter(|vt| !matches!(vt, ValueType::Auto | ValueType::String))
            .map(ValueType::size)
    }

    fn type_display_name(&self, ty: NodeId) -> String {
        match self.ast.kind(ty) {
            NodeKind::BuiltinType(vt) => vt.name().to_string(),
            NodeKind::TypeDecl {
                name: Some(name), ..
            } => name.clone(),
            NodeKind::TypeDecl { inner, .. } => self.type_display_name(*inner),
            NodeKind::Struct { name, .. }
            | NodeKind::Union { name, .. }
            | NodeKind::Enum { name, .. }
            | NodeKind::Bitfield { name, .. } => name.clone(),
            _ => String::new(),
        }
    }

    /// Attributes declared on the (resolved) type node.
    fn type_attributes(&self, ty: NodeId) -> Vec<NodeId> {
        match self.ast.kind(ty) {
            NodeKind::TypeDecl { inner, .. } => self.type_attributes(*inner),
            NodeKind::Struct { attributes, .. }
            | NodeKind::Union { attributes, .. }
            | NodeKind::Enum { attributes, .. }
            | NodeKind::Bitfield { attributes, .. } => attributes.clone(),
            _ => Vec::new(),
        }
    }

    fn attributes_contain(&self, attributes: &[NodeId], name: &str) -> bool {
        attributes.iter().any(|&attr| {
            matches!(self.ast.kind(attr), NodeKind::Attribute { name: n, .. } if n == name)
        })
    }

    // ---- attributes ----

    /// Type attributes first, then variable attributes; on a duplicate
    /// key the variable-level value wins and the shadowing is logged.
    fn apply_declaration_attributes(
        &mut self,
        pattern: &mut Pattern,
        ty: NodeId,
        declaration: NodeId,
    ) -> Result<(), Error> {
        let type_attrs = self.type_attributes(ty);
        let var_attrs = match self.ast.kind(declaration) {
            NodeKind::VariableDecl { attributes, .. }
            | NodeKind::ArrayDecl { attributes, .. }
            | NodeKind::PointerDecl { attributes, .. } => attributes.clone(),
            _ => Vec::new(),
        };

        let mut type_keys = HashSet::new();
        for &attr in &type_attrs {
            if let NodeKind::Attribute { name, .. } = self.ast.kind(attr) {
                type_keys.insert(name.clone());
            }
            self.apply_attribute(pattern, attr)?;
        }
        for &attr in &var_attrs {
            if let NodeKind::Attribute { name, .. } = self.ast.kind(attr) {
                if type_keys.contains(name) {
                    self.console.warning(format!(
                        "attribute '{name}' on '{}' overrides the type-level value",
                        pattern.name
                    ));
                }
            }
            self.apply_attribute(pattern, attr)?;
        }
        Ok(())
    }

    fn apply_attribute(&mut self, pattern: &mut Pattern, attr: NodeId) -> Result<(), Error> {
        let line = self.ast.line(attr);
        let NodeKind::Attribute { name, value } = self.ast.kind(attr) else {
            return Ok(());
        };
        let (name, value) = (name.clone(), value.clone());

        match (name.as_str(), value) {
            ("color", Some(value)) => {
                let rgb = u32::from_str_radix(&value, 16).map_err(|_| {
                    self.error(line, format!("malformed color attribute '{value}'"))
                })?;
                pattern.color = (0x50u32 << 24) | (rgb & 0x00FF_FFFF);
            }
            ("name", Some(value)) => pattern.name = value,
            ("comment", Some(value)) => pattern.comment = Some(value),
            ("hidden", None) => pattern.hidden = true,
            ("format", Some(value)) | ("visualize", Some(value)) => {
                pattern.visualizer = Some(value)
            }
            ("left_to_right", None) | ("inline", None) => {}
            (other, _) => {
                return Err(self.error(line, format!("unknown or malformed attribute '{other}'")));
            }
        }
        Ok(())
    }

    // ---- functions and local statements ----

    fn call_function(
        &mut self,
        name: &str,
        args: &[Literal],
        line: u32,
    ) -> Result<Option<Literal>, Error> {
        if let Some(&definition) = self.user_functions.get(name) {
            return self.call_user_function(definition, args, line);
        }

        let Some(function) = self.registry.get(name).cloned() else {
            return Err(self.error(line, format!("call of undefined function '{name}'")));
        };

        if !function.param_count.accepts(args.len()) {
            return Err(self.error(
                line,
                format!(
                    "function '{name}' expected {} parameter(s), got {}",
                    function.param_count,
                    args.len()
                ),
            ));
        }

        let mut context = EvalContext {
            console: &mut self.console,
            env: &self.env,
            offset: self.offset,
            line,
        };
        (function.callback)(&mut context, args)
    }

    fn call_user_function(
        &mut self,
        definition: NodeId,
        args: &[Literal],
        line: u32,
    ) -> Result<Option<Literal>, Error> {
        let NodeKind::FunctionDef { name, params, body } = self.ast.kind(definition) else {
            return Err(self.error(line, "expected a function definition"));
        };
        let (name, params, body) = (name.clone(), params.clone(), body.clone());

        let has_pack = params.last().is_some_and(|p| p.pack);
        let fixed = params.len() - usize::from(has_pack);
        let accepted = if has_pack {
            ParamCount::AtLeast(fixed)
        } else {
            ParamCount::Exact(fixed)
        };
        if !accepted.accepts(args.len()) {
            return Err(self.error(
                line,
                format!(
                    "function '{name}' expected {accepted} parameter(s), got {}",
                    args.len()
                ),
            ));
        }

        self.enter_recursion(line)?;
        self.function_depth += 1;

        let mut frame = HashMap::new();
        for (param, arg) in params.iter().zip(args) {
            if !param.pack {
                frame.insert(param.name.clone(), arg.clone());
            }
        }
        if has_pack {
            let pack: Vec<Literal> = args[fixed..].to_vec();
            if let Some(param) = params.last() {
                frame.insert(param.name.clone(), Literal::List(pack));
            }
        }
        self.locals.push(frame);

        let result = (|| {
            for &statement in &body {
                self.evaluate_function_statement(statement)?;
                match std::mem::replace(&mut self.control_flow, ControlFlow::None) {
                    ControlFlow::Return(value) => return Ok(value),
                    ControlFlow::None => {}
                    flow => {
                        // break/continue outside a loop stops the body.
                        self.control_flow = flow;
                        return Ok(None);
                    }
                }
            }
            Ok(None)
        })();

        self.locals.pop();
        self.function_depth -= 1;
        self.leave_recursion();
        self.control_flow = ControlFlow::None;
        result
    }

    fn evaluate_function_statement(&mut self, node: NodeId) -> Result<(), Error> {
        let line = self.ast.line(node);
        self.check_interrupt(line)?;

        match self.ast.kind(node) {
            NodeKind::VariableDecl {
                name,
                ty,
                initializer,
                ..
            } => {
                let (name, ty, initializer) = (name.clone(), *ty, *initializer);
                let value = match initializer {
                    Some(expr) => self.evaluate_expression(expr)?,
                    None => self.default_value(ty, line)?,
                };
                if let Some(frame) = self.locals.last_mut() {
                    frame.insert(name, value);
                }
                Ok(())
            }
            NodeKind::MultiVariableDecl(variables) => {
                for &variable in &variables.clone() {
                    self.evaluate_function_statement(variable)?;
                }
                Ok(())
            }
            NodeKind::Assignment { target, value } => {
                let (target, value) = (target.clone(), *value);
                let value = self.evaluate_expression(value)?;
                for frame in self.locals.iter_mut().rev() {
                    if let Some(slot) = frame.get_mut(&target) {
                        *slot = value;
                        return Ok(());
                    }
                }
                Err(self.error(line, format!("assignment to undeclared variable '{target}'")))
            }
            NodeKind::Conditional {
                condition,
                then_body,
                else_body,
            } => {
                let (condition, then_body, else_body) =
                    (*condition, then_body.clone(), else_body.clone());
                let taken = self.evaluate_expression(condition)?.to_bool();
                let body = if taken { then_body } else { else_body };
                for statement in body {
                    self.evaluate_function_statement(statement)?;
                    if self.control_flow != ControlFlow::None {
                        break;
                    }
                }
                Ok(())
            }
            NodeKind::WhileLoop { condition, body } => {
                let (condition, body) = (*condition, body.clone());
                loop {
                    self.check_interrupt(line)?;
                    if !self.evaluate_expression(condition)?.to_bool() {
                        break;
                    }
                    self.run_loop_body(&body)?;
                    match std::mem::replace(&mut self.control_flow, ControlFlow::None) {
                        ControlFlow::Break => break,
                        flow @ ControlFlow::Return(_) => {
                            self.control_flow = flow;
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            NodeKind::ForLoop {
                init,
                condition,
                increment,
                body,
            } => {
                let (init, condition, increment, body) =
                    (*init, *condition, *increment, body.clone());
                self.evaluate_function_statement(init)?;
                loop {
                    self.check_interrupt(line)?;
                    if !self.evaluate_expression(condition)?.to_bool() {
                        break;
                    }
                    self.run_loop_body(&body)?;
                    match std::mem::replace(&mut self.control_flow, ControlFlow::None) {
                        ControlFlow::Break => break,
                        flow @ ControlFlow::Return(_) => {
                            self.control_flow = flow;
                            break;
                        }
                        _ => {}
                    }
                    self.evaluate_function_statement(increment)?;
                }
                Ok(())
            }
            NodeKind::Compound(statements) => {
                for &statement in &statements.clone() {
                    self.evaluate_function_statement(statement)?;
                    if self.control_flow != ControlFlow::None {
                        break;
                    }
                }
                Ok(())
            }
            NodeKind::ControlFlow { kind, value } => {
                let (kind, value) = (*kind, *value);
                self.control_flow = match kind {
                    FlowKind::Break => ControlFlow::Break,
                    FlowKind::Continue => ControlFlow::Continue,
                    FlowKind::Return => {
                        let value = match value {
                            Some(expr) => Some(self.evaluate_expression(expr)?),
                            None => None,
                        };
                        ControlFlow::Return(value)
                    }
                };
                Ok(())
            }
            NodeKind::FunctionCallStatement(expression) => {
                let expression = *expression;
                self.evaluate_statement_expression(expression)?;
                Ok(())
            }
            _ => Err(self.error(line, "statement is not allowed inside a function")),
        }
    }

    /// Statements of one loop iteration; `Continue` is consumed here.
    fn run_loop_body(&mut self, body: &[NodeId]) -> Result<(), Error> {
        for &statement in body {
            self.evaluate_function_statement(statement)?;
            if self.control_flow != ControlFlow::None {
                break;
            }
        }
        if self.control_flow == ControlFlow::Continue {
            self.control_flow = ControlFlow::None;
        }
        Ok(())
    }

    fn default_value(&mut self, ty: NodeId, line: u32) -> Result<Literal, Error> {
        let Some(vt) = self.resolve_builtin(ty) else {
            return Err(self.error(line, "local variables must have a built-in type"));
        };
        Ok(match vt {
            ValueType::Float | ValueType::Double => Literal::Float(0.0),
            ValueType::Boolean => Literal::Bool(false),
            ValueType::Character => Literal::Character('\0'),
            ValueType::Character16 => Literal::Character16(0),
            ValueType::String => Literal::Str(String::new()),
            _ if vt.is_signed() => Literal::Signed(0),
            _ => Literal::Unsigned(0),
        })
    }

    // ---- expressions ----

    /// An expression in statement position: a call producing no value is
    /// fine here, anything else goes through normal evaluation.
    fn evaluate_statement_expression(&mut self, node: NodeId) -> Result<(), Error> {
        if let NodeKind::Call { name, args } = self.ast.kind(node) {
            let line = self.ast.line(node);
            let (name, args) = (name.clone(), args.clone());
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(self.evaluate_expression(arg)?);
            }
            self.call_function(&name, &evaluated, line)?;
            return Ok(());
        }
        self.evaluate_expression(node)?;
        Ok(())
    }

    pub(crate) fn evaluate_expression(&mut self, node: NodeId) -> Result<Literal, Error> {
        let line = self.ast.line(node);

        match self.ast.kind(node) {
            NodeKind::Literal(literal) => Ok(literal.clone()),
            NodeKind::CurrentOffset => Ok(Literal::Unsigned(u128::from(self.offset))),
            NodeKind::RValue(path) => {
                let path = path.clone();
                self.resolve_rvalue(&path, line)
            }
            NodeKind::ScopeResolution { type_name, member } => {
                let (type_name, member) = (type_name.clone(), member.clone());
                let ty = *self.types.get(&type_name).ok_or_else(|| {
                    self.error(line, format!("unknown type '{type_name}'"))
                })?;
                let entries = self.enum_entries(ty, line)?;
                entries
                    .iter()
                    .find(|(_, name)| *name == member)
                    .map(|(value, _)| Literal::Unsigned(*value))
                    .ok_or_else(|| {
                        self.error(line, format!("'{type_name}' has no entry '{member}'"))
                    })
            }
            NodeKind::Binary { op, left, right } => {
                let (op, left, right) = (*op, *left, *right);
                let left = self.evaluate_expression(left)?;
                let right = self.evaluate_expression(right)?;
                value::apply_binary(op, &left, &right, line)
            }
            NodeKind::Unary { op, operand } => {
                let (op, operand) = (*op, *operand);
                let operand = self.evaluate_expression(operand)?;
                value::apply_unary(op, &operand, line)
            }
            NodeKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                let (condition, then_expr, else_expr) = (*condition, *then_expr, *else_expr);
                if self.evaluate_expression(condition)?.to_bool() {
                    self.evaluate_expression(then_expr)
                } else {
                    self.evaluate_expression(else_expr)
                }
            }
            NodeKind::Call { name, args } => {
                let (name, args) = (name.clone(), args.clone());
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.evaluate_expression(arg)?);
                }
                self.call_function(&name, &evaluated, line)?
                    .ok_or_else(|| {
                        self.error(line, format!("function '{name}' returned no value"))
                    })
            }
            NodeKind::TypeOperator { op, operand } => {
                let (op, operand) = (*op, operand.clone());
                self.evaluate_type_operator(op, operand, line)
            }
            _ => Err(self.error(line, "expected an expression")),
        }
    }

    fn evaluate_type_operator(
        &mut self,
        op: TypeOp,
        operand: TypeOperand,
        line: u32,
    ) -> Result<Literal, Error> {
        match (op, operand) {
            (TypeOp::SizeOf, TypeOperand::Type(ty)) => {
                let size = self.builtin_size(ty).ok_or_else(|| {
                    self.error(line, "sizeof needs a built-in type or a placed pattern")
                })?;
                Ok(Literal::Unsigned(u128::from(size)))
            }
            (TypeOp::SizeOf, TypeOperand::Expression(expr)) => {
                let pattern = self.expression_pattern(expr, line)?;
                Ok(Literal::Unsigned(u128::from(pattern.size)))
            }
            (TypeOp::AddressOf, TypeOperand::Expression(expr)) => {
                let pattern = self.expression_pattern(expr, line)?;
                Ok(Literal::Unsigned(u128::from(pattern.offset)))
            }
            (TypeOp::AddressOf, TypeOperand::Type(_)) => {
                Err(self.error(line, "addressof needs a placed pattern"))
            }
        }
    }

    fn expression_pattern(&mut self, expr: NodeId, line: u32) -> Result<Pattern, Error> {
        let NodeKind::RValue(path) = self.ast.kind(expr) else {
            return Err(self.error(line, "expected the name of a placed pattern"));
        };
        let path = path.clone();
        self.find_pattern(&path, line)
    }

    fn resolve_rvalue(&mut self, path: &[PathSegment], line: u32) -> Result<Literal, Error> {
        // Plain names may be locals (including in/out variables).
        if let [PathSegment::Name(name)] = path {
            for frame in self.locals.iter().rev() {
                if let Some(value) = frame.get(name) {
                    return Ok(value.clone());
                }
            }
        }

        let pattern = self.find_pattern(path, line)?;
        pattern.value().ok_or_else(|| {
            self.error(
                line,
                format!("'{}' is a composite and has no scalar value", pattern.name),
            )
        })
    }

    /// Look a pattern up by path, searching the innermost scope first.
    fn find_pattern(&mut self, path: &[PathSegment], line: u32) -> Result<Pattern, Error> {
        let [PathSegment::Name(first), rest @ ..] = path else {
            return Err(self.error(line, "empty pattern path"));
        };

        // Indices inside the path are expressions; evaluate them before
        // borrowing into the scope stack.
        let mut indices = Vec::new();
        for segment in rest {
            if let PathSegment::Index(expr) = segment {
                indices.push(self.evaluate_expression(*expr)?.to_unsigned() as usize);
            }
        }

        let mut root = None;
        for scope in self.scopes.iter().rev() {
            if let Some(found) = scope.iter().rev().find(|p| p.name == *first) {
                root = Some(found);
                break;
            }
        }
        let mut current = root.ok_or_else(|| {
            Error::Evaluation {
                line,
                message: format!("no pattern named '{first}'"),
            }
        })?;

        let mut index_cursor = 0;
        for segment in rest {
            current = match segment {
                PathSegment::Name(name) => current.child(name).ok_or_else(|| Error::Evaluation {
                    line,
                    message: format!("'{}' has no member '{name}'", current.name),
                })?,
                PathSegment::Index(_) => {
                    let index = indices[index_cursor];
                    index_cursor += 1;
                    current.children().get(index).ok_or_else(|| Error::Evaluation {
                        line,
                        message: format!("index {index} is out of bounds in '{}'", current.name),
                    })?
                }
            };
        }

        Ok(current.clone())
    }
}
