//! Parser
//!
//! Recursive descent over the token stream. Matchers advance the cursor
//! only on success, so alternatives can be probed without bookkeeping.
//! Type names become visible the moment their definition starts, which
//! lets a struct refer to itself through a pointer member.

use std::collections::HashMap;

use crate::ast::{
    ArraySize, Ast, Direction, FlowKind, NodeId, NodeKind, Param, PathSegment, TypeOp,
    TypeOperand,
};
use crate::error::Error;
use crate::token::{Keyword, Operator, Separator, Token, TokenKind, ValueType};
use crate::value::{Endian, Literal};

/// Everything the parser produced: the node arena, the top-level
/// statement list and the named-type table.
#[derive(Debug)]
pub struct ParsedProgram {
    pub ast: Ast,
    pub roots: Vec<NodeId>,
    pub types: HashMap<String, NodeId>,
}

pub fn parse(tokens: &[Token]) -> Result<ParsedProgram, Error> {
    Parser::new(tokens).run()
}

/// Where a declaration appears; decides what is allowed around it.
#[derive(Clone, Copy, PartialEq)]
enum Scope {
    TopLevel,
    Member,
    Function,
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    ast: Ast,
    types: HashMap<String, NodeId>,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Parser {
            tokens,
            pos: 0,
            ast: Ast::new(),
            types: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<ParsedProgram, Error> {
        let mut roots = Vec::new();

        while !self.at_end() {
            roots.push(self.parse_top_level()?);
        }

        tracing::debug!(nodes = self.ast.len(), roots = roots.len(), "parsed program");
        Ok(ParsedProgram {
            ast: self.ast,
            roots,
            types: self.types,
        })
    }

    // ---- cursor helpers ----

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn line(&self) -> u32 {
        self.current().line
    }

    fn at_end(&self) -> bool {
        matches!(self.current().kind, TokenKind::EndOfProgram)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        self.error(format!("expected {expected}, got {}", self.current().kind))
    }

    fn peek_kind(&self, ahead: usize) -> &TokenKind {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn match_operator(&mut self, op: Operator) -> bool {
        if self.current().kind == TokenKind::Operator(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn match_separator(&mut self, sep: Separator) -> bool {
        if self.current().kind == TokenKind::Separator(sep) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn match_keyword(&mut self, keyword: Keyword) -> bool {
        if self.current().kind == TokenKind::Keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.current().kind == TokenKind::Keyword(keyword)
    }

    fn check_separator(&self, sep: Separator) -> bool {
        self.current().kind == TokenKind::Separator(sep)
    }

    fn expect_operator(&mut self, op: Operator) -> Result<(), Error> {
        if self.match_operator(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn expect_separator(&mut self, sep: Separator, what: &str) -> Result<(), Error> {
        if self.match_separator(sep) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, Error> {
        match &self.current().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn match_endian(&mut self) -> Option<Endian> {
        if self.match_keyword(Keyword::LittleEndian) {
            Some(Endian::Little)
        } else if self.match_keyword(Keyword::BigEndian) {
            Some(Endian::Big)
        } else {
            None
        }
    }

    // ---- top level ----

    fn parse_top_level(&mut self) -> Result<NodeId, Error> {
        if self.match_keyword(Keyword::Using) {
            return self.parse_using();
        }
        if self.check_keyword(Keyword::Struct)
            || self.check_keyword(Keyword::Union)
            || self.check_keyword(Keyword::Enum)
            || self.check_keyword(Keyword::Bitfield)
        {
            return self.parse_type_definition();
        }
        if self.check_keyword(Keyword::Fn) {
            return self.parse_function_definition();
        }
        if self.check_keyword(Keyword::If) {
            return self.parse_conditional(Scope::Member);
        }

        let direction = if self.match_keyword(Keyword::In) {
            Some(Direction::In)
        } else if self.match_keyword(Keyword::Out) {
            Some(Direction::Out)
        } else {
            None
        };

        // A bare `name(...)` at the top level is a function call
        // statement; `name = expr` updates an out variable.
        if direction.is_none()
            && matches!(self.current().kind, TokenKind::Identifier(_))
            && !self.types.contains_key(self.identifier_text())
            && matches!(
                self.peek_kind(1),
                TokenKind::Separator(Separator::OpenParen)
                    | TokenKind::Operator(Operator::ScopeResolution)
                    | TokenKind::Operator(Operator::Assign)
            )
        {
            let statement = self.parse_assignment_or_call()?;
            self.expect_separator(Separator::Semicolon, "';' after statement")?;
            return Ok(statement);
        }

        self.parse_declaration(Scope::TopLevel, direction)
    }

    fn identifier_text(&self) -> &str {
        match &self.current().kind {
            TokenKind::Identifier(name) => name,
            _ => "",
        }
    }

    fn parse_using(&mut self) -> Result<NodeId, Error> {
        let line = self.line();
        let name = self.expect_identifier()?;
        self.expect_operator(Operator::Assign)?;
        let endian = self.match_endian();
        let inner = self.parse_type()?;
        self.expect_separator(Separator::Semicolon, "';' after using declaration")?;

        let node = self.ast.push(
            NodeKind::TypeDecl {
                name: Some(name.clone()),
                endian,
                inner,
            },
            line,
        );
        self.types.insert(name, node);
        Ok(node)
    }

    /// A type reference: an optional endian prefix followed by a built-in
    /// type or the name of a previously declared one.
    fn parse_type(&mut self) -> Result<NodeId, Error> {
        let line = self.line();
        if let Some(endian) = self.match_endian() {
            let inner = self.parse_type()?;
            return Ok(self.ast.push(
                NodeKind::TypeDecl {
                    name: None,
                    endian: Some(endian),
                    inner,
                },
                line,
            ));
        }

        match &self.current().kind {
            TokenKind::ValueType(vt) => {
                let vt = *vt;
                self.pos += 1;
                Ok(self.ast.push(NodeKind::BuiltinType(vt), line))
            }
            TokenKind::Identifier(name) => match self.types.get(name.as_str()) {
                Some(&id) => {
                    self.pos += 1;
                    Ok(id)
                }
                None => Err(self.error(format!("unknown type '{name}'"))),
            },
            _ => Err(self.unexpected("a type name")),
        }
    }

    // ---- type definitions ----

    fn parse_type_definition(&mut self) -> Result<NodeId, Error> {
        let line = self.line();

        if self.match_keyword(Keyword::Struct) {
            return self.parse_struct(line);
        }
        if self.match_keyword(Keyword::Union) {
            return self.parse_union(line);
        }
        if self.match_keyword(Keyword::Enum) {
            return self.parse_enum(line);
        }
        if self.match_keyword(Keyword::Bitfield) {
            return self.parse_bitfield(line);
        }
        Err(self.unexpected("a type definition"))
    }

    /// Reserve the arena slot and register the name before the body
    /// parses, so members can reference the type being defined.
    fn reserve_type(&mut self, name: &str, line: u32) -> NodeId {
        let id = self.ast.push(NodeKind::Compound(Vec::new()), line);
        self.types.insert(name.to_string(), id);
        id
    }

    fn parse_struct(&mut self, line: u32) -> Result<NodeId, Error> {
        let name = self.expect_identifier()?;
        let id = self.reserve_type(&name, line);

        let mut inherits = Vec::new();
        if self.match_operator(Operator::Colon) {
            loop {
                inherits.push(self.expect_identifier()?);
                if !self.match_separator(Separator::Comma) {
                    break;
                }
            }
        }

        self.expect_separator(Separator::OpenBrace, "'{' after struct name")?;
        let mut members = Vec::new();
        while !self.match_separator(Separator::CloseBrace) {
            if self.at_end() {
                return Err(self.error(format!("unterminated struct '{name}'")));
            }
            members.push(self.parse_member()?);
        }

        let attributes = self.parse_attributes()?;
        self.expect_separator(Separator::Semicolon, "';' after struct definition")?;

        self.ast.replace(
            id,
            NodeKind::Struct {
                name,
                inherits,
                members,
                attributes,
            },
        );
        Ok(id)
    }

    fn parse_union(&mut self, line: u32) -> Result<NodeId, Error> {
        let name = self.expect_identifier()?;
        let id = self.reserve_type(&name, line);

        self.expect_separator(Separator::OpenBrace, "'{' after union name")?;
        let mut members = Vec::new();
        while !self.match_separator(Separator::CloseBrace) {
            if self.at_end() {
                return Err(self.error(format!("unterminated union '{name}'")));
            }
            members.push(self.parse_member()?);
        }

        let attributes = self.parse_attributes()?;
        self.expect_separator(Separator::Semicolon, "';' after union definition")?;

        self.ast.replace(
            id,
            NodeKind::Union {
                name,
                members,
                attributes,
            },
        );
        Ok(id)
    }

    fn parse_enum(&mut self, line: u32) -> Result<NodeId, Error> {
        let name = self.expect_identifier()?;
        let id = self.reserve_type(&name, line);

        self.expect_operator(Operator::Colon)?;
        let storage = self.parse_type()?;
        self.expect_separator(Separator::OpenBrace, "'{' after enum storage type")?;

        let mut entries = Vec::new();
        loop {
            if self.match_separator(Separator::CloseBrace) {
                break;
            }
            let entry_name = self.expect_identifier()?;
            let value = if self.match_operator(Operator::Assign) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            entries.push((entry_name, value));

            // Trailing comma before the brace is allowed.
            if !self.match_separator(Separator::Comma) {
                self.expect_separator(Separator::CloseBrace, "'}' after enum entries")?;
                break;
            }
        }

        let attributes = self.parse_attributes()?;
        self.expect_separator(Separator::Semicolon, "';' after enum definition")?;

        self.ast.replace(
            id,
            NodeKind::Enum {
                name,
                storage,
                entries,
                attributes,
            },
        );
        Ok(id)
    }

    fn parse_bitfield(&mut self, line: u32) -> Result<NodeId, Error> {
        let name = self.expect_identifier()?;
        let id = self.reserve_type(&name, line);

        let storage = if self.match_operator(Operator::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        self.expect_separator(Separator::OpenBrace, "'{' after bitfield name")?;
        let mut fields = Vec::new();
        while !self.match_separator(Separator::CloseBrace) {
            if self.at_end() {
                return Err(self.error(format!("unterminated bitfield '{name}'")));
            }

            // `padding` lexes as a type tag but names a skipped field here.
            let field_name = match &self.current().kind {
                TokenKind::ValueType(ValueType::Padding) => {
                    self.pos += 1;
                    "padding".to_string()
                }
                _ => self.expect_identifier()?,
            };
            self.expect_operator(Operator::Colon)?;
            let width = self.parse_expression()?;
            self.expect_separator(Separator::Semicolon, "';' after bitfield field")?;
            fields.push((field_name, width));
        }

        let attributes = self.parse_attributes()?;
        self.expect_separator(Separator::Semicolon, "';' after bitfield definition")?;

        self.ast.replace(
            id,
            NodeKind::Bitfield {
                name,
                storage,
                fields,
                attributes,
            },
        );
        Ok(id)
    }

    // ---- members and declarations ----

    fn parse_member(&mut self) -> Result<NodeId, Error> {
        if self.check_keyword(Keyword::If) {
            return self.parse_conditional(Scope::Member);
        }
        // `break`/`continue` inside a composite unwind the enclosing
        // array iteration.
        if self.match_keyword(Keyword::Break) {
            let line = self.line();
            self.expect_separator(Separator::Semicolon, "';' after break")?;
            return Ok(self.ast.push(
                NodeKind::ControlFlow {
                    kind: FlowKind::Break,
                    value: None,
                },
                line,
            ));
        }
        if self.match_keyword(Keyword::Continue) {
            let line = self.line();
            self.expect_separator(Separator::Semicolon, "';' after continue")?;
            return Ok(self.ast.push(
                NodeKind::ControlFlow {
                    kind: FlowKind::Continue,
                    value: None,
                },
                line,
            ));
        }
        if self.check_keyword(Keyword::Struct)
            || self.check_keyword(Keyword::Union)
            || self.check_keyword(Keyword::Enum)
            || self.check_keyword(Keyword::Bitfield)
        {
            return self.parse_type_definition();
        }

        // `padding[n];`
        if self.current().kind == TokenKind::ValueType(ValueType::Padding)
            && *self.peek_kind(1) == TokenKind::Separator(Separator::OpenBracket)
        {
            let line = self.line();
            self.pos += 2;
            let size = self.parse_expression()?;
            self.expect_separator(Separator::CloseBracket, "']' after padding size")?;
            self.expect_separator(Separator::Semicolon, "';' after padding")?;

            let ty = self.ast.push(NodeKind::BuiltinType(ValueType::Padding), line);
            return Ok(self.ast.push(
                NodeKind::ArrayDecl {
                    name: String::new(),
                    ty,
                    size: ArraySize::Fixed(size),
                    placement: None,
                    attributes: Vec::new(),
                },
                line,
            ));
        }

        self.parse_declaration(Scope::Member, None)
    }

    fn parse_declaration(
        &mut self,
        scope: Scope,
        direction: Option<Direction>,
    ) -> Result<NodeId, Error> {
        let line = self.line();
        let endian = self.match_endian();
        let mut ty = self.parse_type()?;
        if let Some(endian) = endian {
            ty = self.ast.push(
                NodeKind::TypeDecl {
                    name: None,
                    endian: Some(endian),
                    inner: ty,
                },
                line,
            );
        }

        // Pointer: `Pointee *name : SizeType [@ expr];`
        if self.match_operator(Operator::Star) {
            let name = self.expect_identifier()?;
            self.expect_operator(Operator::Colon)?;
            let size_type = self.parse_type()?;
            let placement = self.parse_placement()?;
            let attributes = self.parse_attributes()?;
            self.expect_separator(Separator::Semicolon, "';' after pointer declaration")?;

            return Ok(self.ast.push(
                NodeKind::PointerDecl {
                    name,
                    pointee: ty,
                    size_type,
                    placement,
                    attributes,
                },
                line,
            ));
        }

        let name = self.expect_identifier()?;

        // Array: `Type name[...]`
        if self.match_separator(Separator::OpenBracket) {
            let size = if self.match_separator(Separator::CloseBracket) {
                ArraySize::Unbounded
            } else if self.match_keyword(Keyword::While) {
                self.expect_separator(Separator::OpenParen, "'(' after while")?;
                let condition = self.parse_expression()?;
                self.expect_separator(Separator::CloseParen, "')' after while condition")?;
                self.expect_separator(Separator::CloseBracket, "']' after array size")?;
                ArraySize::While(condition)
            } else {
                let count = self.parse_expression()?;
                self.expect_separator(Separator::CloseBracket, "']' after array size")?;
                ArraySize::Fixed(count)
            };

            let placement = self.parse_placement()?;
            let attributes = self.parse_attributes()?;
            self.expect_separator(Separator::Semicolon, "';' after array declaration")?;

            return Ok(self.ast.push(
                NodeKind::ArrayDecl {
                    name,
                    ty,
                    size,
                    placement,
                    attributes,
                },
                line,
            ));
        }

        // Multi-variable: `Type a, b, c;`
        if self.check_separator(Separator::Comma) {
            let mut variables = vec![self.ast.push(
                NodeKind::VariableDecl {
                    name,
                    ty,
                    placement: None,
                    direction,
                    initializer: None,
                    attributes: Vec::new(),
                },
                line,
            )];
            while self.match_separator(Separator::Comma) {
                let next = self.expect_identifier()?;
                variables.push(self.ast.push(
                    NodeKind::VariableDecl {
                        name: next,
                        ty,
                        placement: None,
                        direction,
                        initializer: None,
                        attributes: Vec::new(),
                    },
                    line,
                ));
            }
            self.expect_separator(Separator::Semicolon, "';' after declaration")?;
            return Ok(self.ast.push(NodeKind::MultiVariableDecl(variables), line));
        }

        let placement = self.parse_placement()?;
        let initializer = if scope == Scope::Function && self.match_operator(Operator::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let attributes = self.parse_attributes()?;
        self.expect_separator(Separator::Semicolon, "';' after declaration")?;

        Ok(self.ast.push(
            NodeKind::VariableDecl {
                name,
                ty,
                placement,
                direction,
                initializer,
                attributes,
            },
            line,
        ))
    }

    fn parse_placement(&mut self) -> Result<Option<NodeId>, Error> {
        if self.match_operator(Operator::At) {
            Ok(Some(self.parse_expression()?))
        } else {
            Ok(None)
        }
    }

    /// `[[name, name("value"), ...]]` — empty when absent.
    fn parse_attributes(&mut self) -> Result<Vec<NodeId>, Error> {
        if !(self.check_separator(Separator::OpenBracket)
            && *self.peek_kind(1) == TokenKind::Separator(Separator::OpenBracket))
        {
            return Ok(Vec::new());
        }
        self.pos += 2;

        let mut attributes = Vec::new();
        loop {
            let line = self.line();
            let name = self.expect_identifier()?;
            let value = if self.match_separator(Separator::OpenParen) {
                let value = match &self.current().kind {
                    TokenKind::Str(s) => {
                        let s = s.clone();
                        self.pos += 1;
                        s
                    }
                    TokenKind::Integer { value, .. } => {
                        let text = value.to_string();
                        self.pos += 1;
                        text
                    }
                    _ => return Err(self.unexpected("an attribute value")),
                };
                self.expect_separator(Separator::CloseParen, "')' after attribute value")?;
                Some(value)
            } else {
                None
            };
            attributes.push(self.ast.push(NodeKind::Attribute { name, value }, line));

            if !self.match_separator(Separator::Comma) {
                break;
            }
        }

        self.expect_separator(Separator::CloseBracket, "']]' closing attributes")?;
        self.expect_separator(Separator::CloseBracket, "']]' closing attributes")?;
        Ok(attributes)
    }

    // ---- functions and statements ----

    fn parse_function_definition(&mut self) -> Result<NodeId, Error> {
        let line = self.line();
        self.match_keyword(Keyword::Fn);
        let name = self.expect_identifier()?;
        self.expect_separator(Separator::OpenParen, "'(' after function name")?;

        let mut params = Vec::new();
        if !self.match_separator(Separator::CloseParen) {
            loop {
                let ty = self.parse_type()?;

                // `auto ... rest` binds remaining arguments as a pack.
                let pack = self.current().kind == TokenKind::Operator(Operator::Dot)
                    && *self.peek_kind(1) == TokenKind::Operator(Operator::Dot)
                    && *self.peek_kind(2) == TokenKind::Operator(Operator::Dot);
                if pack {
                    self.pos += 3;
                }

                let param_name = self.expect_identifier()?;
                params.push(Param {
                    name: param_name,
                    ty: Some(ty),
                    pack,
                });
                if pack {
                    break;
                }
                if !self.match_separator(Separator::Comma) {
                    break;
                }
            }
            self.expect_separator(Separator::CloseParen, "')' after parameters")?;
        }

        let body = self.parse_block()?;
        Ok(self
            .ast
            .push(NodeKind::FunctionDef { name, params, body }, line))
    }

    fn parse_block(&mut self) -> Result<Vec<NodeId>, Error> {
        self.expect_separator(Separator::OpenBrace, "'{'")?;
        let mut statements = Vec::new();
        while !self.match_separator(Separator::CloseBrace) {
            if self.at_end() {
                return Err(self.error("unterminated block"));
            }
            statements.push(self.parse_function_statement()?);
        }
        Ok(statements)
    }

    fn parse_body(&mut self, scope: Scope) -> Result<Vec<NodeId>, Error> {
        if self.match_separator(Separator::OpenBrace) {
            let mut body = Vec::new();
            while !self.match_separator(Separator::CloseBrace) {
                if self.at_end() {
                    return Err(self.error("unterminated block"));
                }
                body.push(match scope {
                    Scope::Member => self.parse_member()?,
                    _ => self.parse_function_statement()?,
                });
            }
            Ok(body)
        } else {
            let single = match scope {
                Scope::Member => self.parse_member()?,
                _ => self.parse_function_statement()?,
            };
            Ok(vec![single])
        }
    }

    fn parse_conditional(&mut self, scope: Scope) -> Result<NodeId, Error> {
        let line = self.line();
        self.match_keyword(Keyword::If);
        self.expect_separator(Separator::OpenParen, "'(' after if")?;
        let condition = self.parse_expression()?;
        self.expect_separator(Separator::CloseParen, "')' after condition")?;

        let then_body = self.parse_body(scope)?;
        // `else` binds to the nearest unmatched `if`.
        let else_body = if self.match_keyword(Keyword::Else) {
            if self.check_keyword(Keyword::If) {
                vec![self.parse_conditional(scope)?]
            } else {
                self.parse_body(scope)?
            }
        } else {
            Vec::new()
        };

        Ok(self.ast.push(
            NodeKind::Conditional {
                condition,
                then_body,
                else_body,
            },
            line,
        ))
    }

    fn parse_function_statement(&mut self) -> Result<NodeId, Error> {
        let line = self.line();

        if self.match_keyword(Keyword::Return) {
            let value = if self.check_separator(Separator::Semicolon) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.expect_separator(Separator::Semicolon, "';' after return")?;
            return Ok(self.ast.push(
                NodeKind::ControlFlow {
                    kind: FlowKind::Return,
                    value,
                },
                line,
            ));
        }
        if self.match_keyword(Keyword::Break) {
            self.expect_separator(Separator::Semicolon, "';' after break")?;
            return Ok(self.ast.push(
                NodeKind::ControlFlow {
                    kind: FlowKind::Break,
                    value: None,
                },
                line,
            ));
        }
        if self.match_keyword(Keyword::Continue) {
            self.expect_separator(Separator::Semicolon, "';' after continue")?;
            return Ok(self.ast.push(
                NodeKind::ControlFlow {
                    kind: FlowKind::Continue,
                    value: None,
                },
                line,
            ));
        }
        if self.check_keyword(Keyword::If) {
            return self.parse_conditional(Scope::Function);
        }
        if self.match_keyword(Keyword::While) {
            self.expect_separator(Separator::OpenParen, "'(' after while")?;
            let condition = self.parse_expression()?;
            self.expect_separator(Separator::CloseParen, "')' after condition")?;
            let body = self.parse_body(Scope::Function)?;
            return Ok(self.ast.push(NodeKind::WhileLoop { condition, body }, line));
        }
        if self.match_keyword(Keyword::For) {
            self.expect_separator(Separator::OpenParen, "'(' after for")?;
            let init = self.parse_function_statement()?;
            let condition = self.parse_expression()?;
            self.expect_separator(Separator::Semicolon, "';' after for condition")?;
            let increment = self.parse_assignment_or_call()?;
            self.expect_separator(Separator::CloseParen, "')' after for header")?;
            let body = self.parse_body(Scope::Function)?;
            return Ok(self.ast.push(
                NodeKind::ForLoop {
                    init,
                    condition,
                    increment,
                    body,
                },
                line,
            ));
        }
        if self.check_separator(Separator::OpenBrace) {
            let body = self.parse_body(Scope::Function)?;
            return Ok(self.ast.push(NodeKind::Compound(body), line));
        }

        // Local declaration: built-in or registered type name.
        let is_declaration = matches!(self.current().kind, TokenKind::ValueType(_))
            || self.check_keyword(Keyword::LittleEndian)
            || self.check_keyword(Keyword::BigEndian)
            || (matches!(self.current().kind, TokenKind::Identifier(_))
                && self.types.contains_key(self.identifier_text())
                && matches!(self.peek_kind(1), TokenKind::Identifier(_)));
        if is_declaration {
            return self.parse_declaration(Scope::Function, None);
        }

        let statement = self.parse_assignment_or_call()?;
        self.expect_separator(Separator::Semicolon, "';' after statement")?;
        Ok(statement)
    }

    /// `name = expr` or a bare call; shared by statements and `for`
    /// headers (which omit the trailing semicolon).
    fn parse_assignment_or_call(&mut self) -> Result<NodeId, Error> {
        let line = self.line();

        if matches!(self.current().kind, TokenKind::Identifier(_))
            && *self.peek_kind(1) == TokenKind::Operator(Operator::Assign)
        {
            let target = self.expect_identifier()?;
            self.match_operator(Operator::Assign);
            let value = self.parse_expression()?;
            return Ok(self.ast.push(NodeKind::Assignment { target, value }, line));
        }

        let expression = self.parse_expression()?;
        Ok(self
            .ast
            .push(NodeKind::FunctionCallStatement(expression), line))
    }

    // ---- expressions ----

    fn parse_expression(&mut self) -> Result<NodeId, Error> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<NodeId, Error> {
        let line = self.line();
        let condition = self.parse_bool_or()?;
        if !self.match_operator(Operator::Question) {
            return Ok(condition);
        }

        let then_expr = self.parse_expression()?;
        self.expect_operator(Operator::Colon)?;
        let else_expr = self.parse_expression()?;
        Ok(self.ast.push(
            NodeKind::Ternary {
                condition,
                then_expr,
                else_expr,
            },
            line,
        ))
    }

    fn parse_binary(
        &mut self,
        operators: &[Operator],
        next: fn(&mut Self) -> Result<NodeId, Error>,
    ) -> Result<NodeId, Error> {
        let mut left = next(self)?;
        loop {
            let line = self.line();
            let Some(&op) = operators
                .iter()
                .find(|&&op| self.current().kind == TokenKind::Operator(op))
            else {
                return Ok(left);
            };
            self.pos += 1;
            let right = next(self)?;
            left = self.ast.push(NodeKind::Binary { op, left, right }, line);
        }
    }

    fn parse_bool_or(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::BoolOr], Self::parse_bool_xor)
    }

    fn parse_bool_xor(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::BoolXor], Self::parse_bool_and)
    }

    fn parse_bool_and(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::BoolAnd], Self::parse_bit_or)
    }

    fn parse_bit_or(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::BitOr], Self::parse_bit_xor)
    }

    fn parse_bit_xor(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::BitXor], Self::parse_bit_and)
    }

    fn parse_bit_and(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::BitAnd], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::Equal, Operator::NotEqual], Self::parse_relational)
    }

    fn parse_relational(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(
            &[
                Operator::Less,
                Operator::LessEqual,
                Operator::Greater,
                Operator::GreaterEqual,
            ],
            Self::parse_shift,
        )
    }

    fn parse_shift(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(
            &[Operator::ShiftLeft, Operator::ShiftRight],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(&[Operator::Plus, Operator::Minus], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<NodeId, Error> {
        self.parse_binary(
            &[Operator::Star, Operator::Slash, Operator::Percent],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<NodeId, Error> {
        let line = self.line();
        for op in [
            Operator::BoolNot,
            Operator::BitNot,
            Operator::Plus,
            Operator::Minus,
        ] {
            if self.match_operator(op) {
                let operand = self.parse_unary()?;
                return Ok(self.ast.push(NodeKind::Unary { op, operand }, line));
            }
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<NodeId, Error> {
        let line = self.line();
        let left = self.parse_primary()?;
        if self.match_operator(Operator::Pow) {
            // Right-associative.
            let right = self.parse_unary()?;
            return Ok(self.ast.push(
                NodeKind::Binary {
                    op: Operator::Pow,
                    left,
                    right,
                },
                line,
            ));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<NodeId, Error> {
        let line = self.line();

        if self.match_separator(Separator::OpenParen) {
            let inner = self.parse_expression()?;
            self.expect_separator(Separator::CloseParen, "')'")?;
            return Ok(inner);
        }

        if self.match_operator(Operator::Dollar) {
            return Ok(self.ast.push(NodeKind::CurrentOffset, line));
        }
        if self.match_operator(Operator::SizeOf) {
            return self.parse_type_operator(TypeOp::SizeOf, line);
        }
        if self.match_operator(Operator::AddressOf) {
            return self.parse_type_operator(TypeOp::AddressOf, line);
        }

        match self.current().kind.clone() {
            TokenKind::Integer { value, unsigned } => {
                self.pos += 1;
                let literal = if unsigned || value > i128::MAX as u128 {
                    Literal::Unsigned(value)
                } else {
                    Literal::Signed(value as i128)
                };
                Ok(self.ast.push(NodeKind::Literal(literal), line))
            }
            TokenKind::Float(value) => {
                self.pos += 1;
                Ok(self.ast.push(NodeKind::Literal(Literal::Float(value)), line))
            }
            TokenKind::Str(value) => {
                self.pos += 1;
                Ok(self.ast.push(NodeKind::Literal(Literal::Str(value)), line))
            }
            TokenKind::Character(value) => {
                self.pos += 1;
                Ok(self
                    .ast
                    .push(NodeKind::Literal(Literal::Character(value)), line))
            }
            TokenKind::Character16(value) => {
                self.pos += 1;
                Ok(self
                    .ast
                    .push(NodeKind::Literal(Literal::Character16(value)), line))
            }
            TokenKind::Identifier(name) => {
                self.pos += 1;
                self.parse_named(name, line)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_type_operator(&mut self, op: TypeOp, line: u32) -> Result<NodeId, Error> {
        self.expect_separator(Separator::OpenParen, "'('")?;

        let operand = match self.current().kind.clone() {
            TokenKind::ValueType(vt) => {
                self.pos += 1;
                TypeOperand::Type(self.ast.push(NodeKind::BuiltinType(vt), line))
            }
            TokenKind::Identifier(name)
                if self.types.contains_key(name.as_str())
                    && *self.peek_kind(1) == TokenKind::Separator(Separator::CloseParen) =>
            {
                self.pos += 1;
                TypeOperand::Type(self.types[name.as_str()])
            }
            _ => TypeOperand::Expression(self.parse_expression()?),
        };

        self.expect_separator(Separator::CloseParen, "')'")?;
        Ok(self.ast.push(NodeKind::TypeOperator { op, operand }, line))
    }

    /// An identifier already consumed: a namespaced call, an enum constant
    /// (`Type::Entry`), or an r-value path (`a.b[i].c`).
    fn parse_named(&mut self, first: String, line: u32) -> Result<NodeId, Error> {
        let mut segments = vec![first];
        while self.match_operator(Operator::ScopeResolution) {
            segments.push(self.expect_identifier()?);
        }

        if self.match_separator(Separator::OpenParen) {
            let name = segments.join("::");
            let mut args = Vec::new();
            if !self.match_separator(Separator::CloseParen) {
                loop {
                    args.push(self.parse_expression()?);
                    if !self.match_separator(Separator::Comma) {
                        break;
                    }
                }
                self.expect_separator(Separator::CloseParen, "')' after arguments")?;
            }
            return Ok(self.ast.push(NodeKind::Call { name, args }, line));
        }

        if segments.len() == 2 {
            let member = segments.pop().unwrap_or_default();
            let type_name = segments.pop().unwrap_or_default();
            return Ok(self
                .ast
                .push(NodeKind::ScopeResolution { type_name, member }, line));
        }
        if segments.len() > 2 {
            return Err(self.error("nested scope resolution is not supported"));
        }

        let mut path = vec![PathSegment::Name(segments.remove(0))];
        loop {
            if self.match_operator(Operator::Dot) {
                path.push(PathSegment::Name(self.expect_identifier()?));
            } else if self.match_separator(Separator::OpenBracket) {
                let index = self.parse_expression()?;
                self.expect_separator(Separator::CloseBracket, "']' after index")?;
                path.push(PathSegment::Index(index));
            } else {
                break;
            }
        }

        Ok(self.ast.push(NodeKind::RValue(path), line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_source(source: &str) -> ParsedProgram {
        parse(&lex(source).unwrap()).unwrap()
    }

    fn parse_error(source: &str) -> Error {
        parse(&lex(source).unwrap()).unwrap_err()
    }

    #[test]
    fn test_simple_declarations() {
        let program = parse_source("u32 a; u16 b;");
        assert_eq!(program.roots.len(), 2);
        assert!(matches!(
            program.ast.kind(program.roots[0]),
            NodeKind::VariableDecl { name, .. } if name == "a"
        ));
    }

    #[test]
    fn test_struct_definition_registers_type() {
        let program = parse_source("struct Header { u32 magic; u16 count; }; Header hdr @ 0;");
        assert!(program.types.contains_key("Header"));

        let NodeKind::Struct { members, .. } = program.ast.kind(program.types["Header"]) else {
            panic!("expected struct node");
        };
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn test_struct_can_reference_itself_through_pointer() {
        parse_source("struct Node { u32 value; Node *next : u32; };");
    }

    #[test]
    fn test_endian_prefix_binds_to_declaration() {
        let program = parse_source("be u32 x @ 0;");
        let NodeKind::VariableDecl { ty, placement, .. } = program.ast.kind(program.roots[0])
        else {
            panic!("expected variable declaration");
        };
        assert!(placement.is_some());
        assert!(matches!(
            program.ast.kind(*ty),
            NodeKind::TypeDecl { endian: Some(Endian::Big), .. }
        ));
    }

    #[test]
    fn test_array_forms() {
        let program = parse_source(
            "u8 fixed[4]; u8 dynamic[while(fixed[0] != 0)]; u8 open[]; padding[2];",
        );
        let kinds: Vec<_> = program
            .roots
            .iter()
            .map(|&id| program.ast.kind(id))
            .collect();
        assert!(matches!(kinds[0], NodeKind::ArrayDecl { size: ArraySize::Fixed(_), .. }));
        assert!(matches!(kinds[1], NodeKind::ArrayDecl { size: ArraySize::While(_), .. }));
        assert!(matches!(kinds[2], NodeKind::ArrayDecl { size: ArraySize::Unbounded, .. }));
    }

    #[test]
    fn test_enum_with_explicit_and_auto_values() {
        let program = parse_source("enum Kind : u8 { None, File = 5, Dir, };");
        let NodeKind::Enum { entries, .. } = program.ast.kind(program.types["Kind"]) else {
            panic!("expected enum node");
        };
        assert_eq!(entries.len(), 3);
        assert!(entries[0].1.is_none());
        assert!(entries[1].1.is_some());
    }

    #[test]
    fn test_bitfield_with_padding_field() {
        let program = parse_source("bitfield Flags { a : 3; padding : 5; b : 8; };");
        let NodeKind::Bitfield { fields, .. } = program.ast.kind(program.types["Flags"]) else {
            panic!("expected bitfield node");
        };
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1].0, "padding");
    }

    #[test]
    fn test_operator_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3).
        let program = parse_source("fn f() { return 1 + 2 * 3; }");
        let NodeKind::FunctionDef { body, .. } = program.ast.kind(program.roots[0]) else {
            panic!("expected function");
        };
        let NodeKind::ControlFlow { value: Some(expr), .. } = program.ast.kind(body[0]) else {
            panic!("expected return");
        };
        let NodeKind::Binary { op: Operator::Plus, right, .. } = program.ast.kind(*expr) else {
            panic!("expected addition at the top");
        };
        assert!(matches!(
            program.ast.kind(*right),
            NodeKind::Binary { op: Operator::Star, .. }
        ));
    }

    #[test]
    fn test_dangling_else_binds_to_nearest_if() {
        let program = parse_source(
            "fn f(u32 x) { if (x) if (x > 1) return 1; else return 2; return 0; }",
        );
        let NodeKind::FunctionDef { body, .. } = program.ast.kind(program.roots[0]) else {
            panic!("expected function");
        };
        // Outer if has no else; the else went to the inner if.
        let NodeKind::Conditional { then_body, else_body, .. } = program.ast.kind(body[0]) else {
            panic!("expected conditional");
        };
        assert!(else_body.is_empty());
        let NodeKind::Conditional { else_body: inner_else, .. } =
            program.ast.kind(then_body[0])
        else {
            panic!("expected nested conditional");
        };
        assert_eq!(inner_else.len(), 1);
    }

    #[test]
    fn test_unknown_type_is_a_parse_error() {
        let error = parse_error("Mystery m;");
        assert!(matches!(error, Error::Parse { line: 1, .. }));
        assert!(error.to_string().contains("unknown type"));
    }

    #[test]
    fn test_attributes_on_variables_and_types() {
        let program = parse_source(
            "struct Color { u8 r; u8 g; u8 b; } [[color(\"4080FF\")]]; \
             Color c @ 0 [[name(\"pixel\"), comment(\"first pixel\")]];",
        );
        let NodeKind::Struct { attributes, .. } = program.ast.kind(program.types["Color"]) else {
            panic!("expected struct");
        };
        assert_eq!(attributes.len(), 1);

        let NodeKind::VariableDecl { attributes, .. } = program.ast.kind(program.roots[1]) else {
            panic!("expected variable");
        };
        assert_eq!(attributes.len(), 2);
    }

    #[test]
    fn test_pointer_declaration_shape() {
        let program = parse_source("u8 *p : u16 @ 0;");
        let NodeKind::PointerDecl { pointee, size_type, .. } =
            program.ast.kind(program.roots[0])
        else {
            panic!("expected pointer declaration");
        };
        assert!(matches!(
            program.ast.kind(*pointee),
            NodeKind::BuiltinType(ValueType::Unsigned8)
        ));
        assert!(matches!(
            program.ast.kind(*size_type),
            NodeKind::BuiltinType(ValueType::Unsigned16)
        ));
    }

    #[test]
    fn test_in_out_variables() {
        let program = parse_source("in u32 offset; out u32 total;");
        assert!(matches!(
            program.ast.kind(program.roots[0]),
            NodeKind::VariableDecl { direction: Some(Direction::In), .. }
        ));
        assert!(matches!(
            program.ast.kind(program.roots[1]),
            NodeKind::VariableDecl { direction: Some(Direction::Out), .. }
        ));
    }

    #[test]
    fn test_parameter_pack() {
        let program = parse_source("fn log(auto ... values) { return; }");
        let NodeKind::FunctionDef { params, .. } = program.ast.kind(program.roots[0]) else {
            panic!("expected function");
        };
        assert!(params[0].pack);
    }
}
