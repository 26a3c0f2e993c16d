//! Lexer
//!
//! Turns preprocessed source text into a token vector. Integer literals
//! land in the 128-bit unsigned tower (overflow is an error), floats keep
//! their `f`/`d` suffix distinction, and every token records its line.

use crate::error::Error;
use crate::token::{Keyword, Operator, Separator, Token, TokenKind, ValueType};

pub struct Lexer<'s> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    source: &'s str,
}

/// Tokenize a whole program.
pub fn lex(source: &str) -> Result<Vec<Token>, Error> {
    Lexer::new(source).run()
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            source,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            if c == '\n' {
                self.line += 1;
                self.pos += 1;
                continue;
            }
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }

            let line = self.line;
            let kind = if c.is_ascii_digit() {
                self.number()?
            } else if c.is_alphabetic() || c == '_' {
                self.word()
            } else if c == '"' {
                self.string()?
            } else if c == '\'' {
                self.character()?
            } else {
                self.operator()?
            };
            tokens.push(Token::new(kind, line));
        }

        tokens.push(Token::new(TokenKind::EndOfProgram, self.line));
        tracing::debug!(tokens = tokens.len(), bytes = self.source.len(), "lexed program");
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Lex {
            line: self.line,
            message: message.into(),
        }
    }

    fn word(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if let Some(keyword) = Keyword::from_name(&word) {
            return TokenKind::Keyword(keyword);
        }
        if let Some(value_type) = ValueType::from_name(&word) {
            return TokenKind::ValueType(value_type);
        }
        match word.as_str() {
            "sizeof" => TokenKind::Operator(Operator::SizeOf),
            "addressof" => TokenKind::Operator(Operator::AddressOf),
            _ => TokenKind::Identifier(word),
        }
    }

    fn number(&mut self) -> Result<TokenKind, Error> {
        let start = self.pos;

        let radix = if self.peek() == Some('0') {
            match self.peek_at(1) {
                Some('x') | Some('X') => 16,
                Some('b') | Some('B') => 2,
                Some('o') | Some('O') => 8,
                _ => 10,
            }
        } else {
            10
        };
        if radix != 10 {
            self.pos += 2;
        }

        let digits_start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '.') {
            self.pos += 1;
        }
        let text: String = self.chars[digits_start..self.pos].iter().collect();

        if radix == 10 && (text.contains('.') || text.ends_with(['f', 'F', 'd', 'D'])) {
            let trimmed = text.trim_end_matches(['f', 'F', 'd', 'D']);
            return trimmed
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("malformed floating literal '{text}'")));
        }

        let (digits, unsigned) = match text.strip_suffix(['u', 'U']) {
            Some(stripped) => (stripped, true),
            None => (text.as_str(), false),
        };

        if digits.is_empty() {
            let all: String = self.chars[start..self.pos].iter().collect();
            return Err(self.error(format!("malformed number '{all}'")));
        }

        let value = u128::from_str_radix(digits, radix).map_err(|_| {
            let all: String = self.chars[start..self.pos].iter().collect();
            self.error(format!("malformed or overflowing number '{all}'"))
        })?;

        Ok(TokenKind::Integer { value, unsigned })
    }

    fn escape(&mut self) -> Result<char, Error> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('t') => Ok('\t'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('\'') => Ok('\''),
            Some('x') => {
                let mut value = 0u32;
                for _ in 0..2 {
                    let digit = self
                        .bump()
                        .and_then(|c| c.to_digit(16))
                        .ok_or_else(|| self.error("\\x escape needs two hex digits"))?;
                    value = value * 16 + digit;
                }
                char::from_u32(value).ok_or_else(|| self.error("invalid \\x escape"))
            }
            Some(other) => Err(self.error(format!("unknown escape sequence '\\{other}'"))),
            None => Err(self.error("unterminated escape sequence")),
        }
    }

    fn string(&mut self) -> Result<TokenKind, Error> {
        self.pos += 1; // opening quote
        let mut value = String::new();

        loop {
            match self.bump() {
                Some('"') => return Ok(TokenKind::Str(value)),
                Some('\\') => value.push(self.escape()?),
                Some('\n') | None => return Err(self.error("unterminated string literal")),
                Some(c) => value.push(c),
            }
        }
    }

    fn character(&mut self) -> Result<TokenKind, Error> {
        self.pos += 1; // opening quote
        let mut bytes = Vec::new();

        loop {
            match self.bump() {
                Some('\'') => break,
                Some('\\') => bytes.push(self.escape()?),
                Some('\n') | None => return Err(self.error("unterminated character literal")),
                Some(c) => bytes.push(c),
            }
            if bytes.len() > 2 {
                return Err(self.error("character literal holds more than two bytes"));
            }
        }

        match bytes.as_slice() {
            [c] => Ok(TokenKind::Character(*c)),
            [high, low] => {
                let value = (u16::from(*high as u8) << 8) | u16::from(*low as u8);
                Ok(TokenKind::Character16(value))
            }
            _ => Err(self.error("empty character literal")),
        }
    }

    fn operator(&mut self) -> Result<TokenKind, Error> {
        use Operator::*;
        use Separator::*;

        let c = self.bump().unwrap_or('\0');
        let next = self.peek();

        let two = |lexer: &mut Self, op: Operator| {
            lexer.pos += 1;
            Ok(TokenKind::Operator(op))
        };

        match (c, next) {
            ('*', Some('*')) => two(self, Pow),
            ('<', Some('<')) => two(self, ShiftLeft),
            ('>', Some('>')) => two(self, ShiftRight),
            ('<', Some('=')) => two(self, LessEqual),
            ('>', Some('=')) => two(self, GreaterEqual),
            ('=', Some('=')) => two(self, Equal),
            ('!', Some('=')) => two(self, NotEqual),
            ('&', Some('&')) => two(self, BoolAnd),
            ('|', Some('|')) => two(self, BoolOr),
            ('^', Some('^')) => two(self, BoolXor),
            (':', Some(':')) => two(self, ScopeResolution),
            ('=', _) => Ok(TokenKind::Operator(Assign)),
            ('+', _) => Ok(TokenKind::Operator(Plus)),
            ('-', _) => Ok(TokenKind::Operator(Minus)),
            ('*', _) => Ok(TokenKind::Operator(Star)),
            ('/', _) => Ok(TokenKind::Operator(Slash)),
            ('%', _) => Ok(TokenKind::Operator(Percent)),
            ('&', _) => Ok(TokenKind::Operator(BitAnd)),
            ('|', _) => Ok(TokenKind::Operator(BitOr)),
            ('^', _) => Ok(TokenKind::Operator(BitXor)),
            ('~', _) => Ok(TokenKind::Operator(BitNot)),
            ('!', _) => Ok(TokenKind::Operator(BoolNot)),
            ('<', _) => Ok(TokenKind::Operator(Less)),
            ('>', _) => Ok(TokenKind::Operator(Greater)),
            ('?', _) => Ok(TokenKind::Operator(Question)),
            (':', _) => Ok(TokenKind::Operator(Colon)),
            ('.', _) => Ok(TokenKind::Operator(Dot)),
            ('@', _) => Ok(TokenKind::Operator(At)),
            ('$', _) => Ok(TokenKind::Operator(Dollar)),
            ('(', _) => Ok(TokenKind::Separator(OpenParen)),
            (')', _) => Ok(TokenKind::Separator(CloseParen)),
            ('{', _) => Ok(TokenKind::Separator(OpenBrace)),
            ('}', _) => Ok(TokenKind::Separator(CloseBrace)),
            ('[', _) => Ok(TokenKind::Separator(OpenBracket)),
            (']', _) => Ok(TokenKind::Separator(CloseBracket)),
            (',', _) => Ok(TokenKind::Separator(Comma)),
            (';', _) => Ok(TokenKind::Separator(Semicolon)),
            _ => Err(self.error(format!("illegal character '{c}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_declaration_tokens() {
        let tokens = kinds("u32 length;");
        assert_eq!(
            tokens,
            vec![
                TokenKind::ValueType(ValueType::Unsigned32),
                TokenKind::Identifier("length".into()),
                TokenKind::Separator(Separator::Semicolon),
                TokenKind::EndOfProgram,
            ]
        );
    }

    #[test]
    fn test_integer_bases_and_suffix() {
        let tokens = kinds("0x2A 0b1010 0o17 42 42u");
        assert_eq!(
            tokens[..5],
            [
                TokenKind::Integer { value: 0x2A, unsigned: false },
                TokenKind::Integer { value: 0b1010, unsigned: false },
                TokenKind::Integer { value: 0o17, unsigned: false },
                TokenKind::Integer { value: 42, unsigned: false },
                TokenKind::Integer { value: 42, unsigned: true },
            ]
        );
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let result = lex("0x100000000000000000000000000000000");
        assert!(matches!(result, Err(Error::Lex { line: 1, .. })));
    }

    #[test]
    fn test_float_literals() {
        let tokens = kinds("1.5 2f 3.25d");
        assert_eq!(
            tokens[..3],
            [
                TokenKind::Float(1.5),
                TokenKind::Float(2.0),
                TokenKind::Float(3.25),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = kinds(r#""line\nwith \"quotes\" and \x41""#);
        assert_eq!(
            tokens[0],
            TokenKind::Str("line\nwith \"quotes\" and A".into())
        );
    }

    #[test]
    fn test_character_literals() {
        let tokens = kinds(r"'a' '\n' 'AB'");
        assert_eq!(tokens[0], TokenKind::Character('a'));
        assert_eq!(tokens[1], TokenKind::Character('\n'));
        assert_eq!(tokens[2], TokenKind::Character16(0x4142));
    }

    #[test]
    fn test_unterminated_string_reports_line() {
        let result = lex("u8 a;\n\"oops");
        match result {
            Err(Error::Lex { line, message }) => {
                assert_eq!(line, 2);
                assert!(message.contains("unterminated"));
            }
            other => panic!("expected lex error, got {other:?}"),
        }
    }

    #[test]
    fn test_multi_character_operators() {
        let tokens = kinds("a << 2 ** b && c::d");
        assert!(tokens.contains(&TokenKind::Operator(Operator::ShiftLeft)));
        assert!(tokens.contains(&TokenKind::Operator(Operator::Pow)));
        assert!(tokens.contains(&TokenKind::Operator(Operator::BoolAnd)));
        assert!(tokens.contains(&TokenKind::Operator(Operator::ScopeResolution)));
    }

    #[test]
    fn test_line_numbers_advance() {
        let tokens = lex("u8 a;\nu8 b;\n\nu8 c;").unwrap();
        let lines: Vec<u32> = tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Identifier(_)))
            .map(|t| t.line)
            .collect();
        assert_eq!(lines, vec![1, 2, 4]);
    }
}
