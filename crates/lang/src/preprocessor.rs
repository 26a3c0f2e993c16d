//! Preprocessor
//!
//! Textual stage ahead of the lexer: expands `#include` files, applies
//! `#define` word replacements, dispatches `#pragma` keys to registered
//! handlers and strips comments. Line numbers survive — every consumed
//! line re-emits a newline so downstream diagnostics stay accurate.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::Error;

type PragmaHandler = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct Preprocessor {
    pragma_handlers: HashMap<String, PragmaHandler>,
    include_paths: Vec<PathBuf>,
    defines: HashMap<String, String>,
    pragmas: Vec<(String, String)>,
    visited: HashSet<PathBuf>,
}

impl Preprocessor {
    pub fn new() -> Self {
        let mut preprocessor = Preprocessor {
            pragma_handlers: HashMap::new(),
            include_paths: Vec::new(),
            defines: HashMap::new(),
            pragmas: Vec::new(),
            visited: HashSet::new(),
        };

        // Pragmas every program may carry; their values are surfaced
        // through the pragma table for the runtime to act on.
        preprocessor.add_pragma_handler("MIME", |_| true);
        preprocessor.add_pragma_handler("base_address", |value| {
            parse_integer(value).is_some()
        });
        preprocessor.add_pragma_handler("eval_depth", |value| {
            parse_integer(value).is_some()
        });

        preprocessor
    }

    /// Register a handler for one pragma key. The handler returns whether
    /// the value is acceptable.
    pub fn add_pragma_handler(
        &mut self,
        key: impl Into<String>,
        handler: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) {
        self.pragma_handlers.insert(key.into(), Box::new(handler));
    }

    pub fn set_include_paths(&mut self, paths: Vec<PathBuf>) {
        self.include_paths = paths;
    }

    /// All `(key, value)` pragmas seen during the last run.
    pub fn pragmas(&self) -> &[(String, String)] {
        &self.pragmas
    }

    /// Expand directives in `source`. `origin` is the path of the file the
    /// source came from, used to resolve relative includes.
    pub fn preprocess(&mut self, source: &str, origin: Option<&Path>) -> Result<String, Error> {
        self.defines.clear();
        self.pragmas.clear();
        self.visited.clear();

        if let Some(origin) = origin {
            if let Ok(canonical) = origin.canonicalize() {
                self.visited.insert(canonical);
            }
        }

        self.run(source, origin)
    }

    fn run(&mut self, source: &str, origin: Option<&Path>) -> Result<String, Error> {
        let stripped = strip_comments(source);
        let mut output = String::with_capacity(stripped.len());

        for (index, line) in stripped.lines().enumerate() {
            let line_number = index as u32 + 1;
            let trimmed = line.trim_start();

            if let Some(rest) = trimmed.strip_prefix('#') {
                self.directive(rest.trim(), line_number, origin, &mut output)?;
                output.push('\n');
            } else {
                let _ = writeln!(output, "{}", self.substitute(line));
            }
        }

        Ok(output)
    }

    fn directive(
        &mut self,
        directive: &str,
        line: u32,
        origin: Option<&Path>,
        output: &mut String,
    ) -> Result<(), Error> {
        if let Some(rest) = directive.strip_prefix("include") {
            let path = rest.trim().trim_matches('"');
            let included = self.include(path, line, origin)?;
            output.push_str(&included);
            Ok(())
        } else if let Some(rest) = directive.strip_prefix("define") {
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or_default();
            if name.is_empty() {
                return Err(Error::Preprocessor {
                    line,
                    message: "#define requires a name".into(),
                });
            }
            let replacement = parts.next().unwrap_or_default().trim().to_string();
            self.defines.insert(name.to_string(), replacement);
            Ok(())
        } else if let Some(rest) = directive.strip_prefix("pragma") {
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts.next().unwrap_or_default().trim().to_string();

            match self.pragma_handlers.get(&key) {
                Some(handler) if handler(&value) => {
                    self.pragmas.push((key, value));
                    Ok(())
                }
                Some(_) => Err(Error::Preprocessor {
                    line,
                    message: format!("pragma '{key}' rejected value '{value}'"),
                }),
                None => Err(Error::Preprocessor {
                    line,
                    message: format!("unknown pragma '{key}'"),
                }),
            }
        } else {
            Err(Error::Preprocessor {
                line,
                message: format!("unknown directive '#{directive}'"),
            })
        }
    }

    fn include(&mut self, path: &str, line: u32, origin: Option<&Path>) -> Result<String, Error> {
        let resolved = self.resolve_include(path, origin).ok_or(Error::Preprocessor {
            line,
            message: format!("include file \"{path}\" not found"),
        })?;

        let canonical = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
        if !self.visited.insert(canonical.clone()) {
            return Err(Error::Preprocessor {
                line,
                message: format!("recursive include of \"{}\"", canonical.display()),
            });
        }

        let content = std::fs::read_to_string(&resolved).map_err(|e| Error::Preprocessor {
            line,
            message: format!("cannot read \"{}\": {e}", resolved.display()),
        })?;

        let expanded = self.run(&content, Some(&resolved))?;
        self.visited.remove(&canonical);
        Ok(expanded)
    }

    fn resolve_include(&self, path: &str, origin: Option<&Path>) -> Option<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return relative.exists().then(|| relative.to_path_buf());
        }

        if let Some(dir) = origin.and_then(Path::parent) {
            let candidate = dir.join(relative);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        self.include_paths
            .iter()
            .map(|dir| dir.join(relative))
            .find(|candidate| candidate.exists())
    }

    /// Word-boundary replacement of all active defines.
    fn substitute(&self, line: &str) -> String {
        if self.defines.is_empty() {
            return line.to_string();
        }

        let mut result = String::with_capacity(line.len());
        let mut word = String::new();

        for c in line.chars() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
            } else {
                self.flush_word(&mut result, &mut word);
                result.push(c);
            }
        }
        self.flush_word(&mut result, &mut word);
        result
    }

    fn flush_word(&self, result: &mut String, word: &mut String) {
        if word.is_empty() {
            return;
        }
        match self.defines.get(word.as_str()) {
            Some(replacement) => result.push_str(replacement),
            None => result.push_str(word),
        }
        word.clear();
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_integer(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Remove `//` and `/* */` comments, keeping string literals intact and
/// emitting a newline for every line a block comment spans.
fn strip_comments(source: &str) -> String {
    let mut output = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if !in_string => {
                in_string = true;
                output.push(c);
            }
            '"' if in_string => {
                in_string = false;
                output.push(c);
            }
            '\\' if in_string => {
                output.push(c);
                if let Some(next) = chars.next() {
                    output.push(next);
                }
            }
            '/' if !in_string && chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        output.push('\n');
                        break;
                    }
                }
            }
            '/' if !in_string && chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        output.push('\n');
                    }
                    if previous == '*' && c == '/' {
                        break;
                    }
                    previous = c;
                }
            }
            _ => output.push(c),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_comments_are_stripped_lines_preserved() {
        let source = "u32 a; // trailing\n/* block\nspanning\nlines */ u16 b;\n";
        let result = Preprocessor::new().preprocess(source, None).unwrap();
        assert_eq!(result, "u32 a; \n\n\n u16 b;\n");
    }

    #[test]
    fn test_define_replaces_whole_words_only() {
        let source = "#define SIZE 16\nu8 data[SIZE]; u8 SIZED[2];\n";
        let result = Preprocessor::new().preprocess(source, None).unwrap();
        assert!(result.contains("data[16]"));
        assert!(result.contains("SIZED[2]"));
    }

    #[test]
    fn test_endian_pragma_dispatch() {
        let mut preprocessor = Preprocessor::new();
        preprocessor
            .add_pragma_handler("endian", |v| matches!(v, "big" | "little" | "native"));

        preprocessor
            .preprocess("#pragma endian big\nu32 x;\n", None)
            .unwrap();
        assert_eq!(
            preprocessor.pragmas(),
            &[("endian".to_string(), "big".to_string())]
        );

        let error = preprocessor
            .preprocess("#pragma endian sideways\n", None)
            .unwrap_err();
        assert!(matches!(error, Error::Preprocessor { line: 1, .. }));
    }

    #[test]
    fn test_unknown_pragma_is_an_error() {
        let error = Preprocessor::new()
            .preprocess("#pragma flavour grape\n", None)
            .unwrap_err();
        assert!(error.to_string().contains("unknown pragma"));
    }

    #[test]
    fn test_include_inlines_and_detects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.pat");
        std::fs::write(&shared, "u32 magic;\n").unwrap();

        let mut preprocessor = Preprocessor::new();
        let source = format!("#include \"{}\"\nu8 rest;\n", shared.display());
        let result = preprocessor.preprocess(&source, None).unwrap();
        assert!(result.contains("u32 magic;"));
        assert!(result.contains("u8 rest;"));

        // a includes b includes a again.
        let a = dir.path().join("a.pat");
        let b = dir.path().join("b.pat");
        let mut file = std::fs::File::create(&a).unwrap();
        writeln!(file, "#include \"{}\"", b.display()).unwrap();
        let mut file = std::fs::File::create(&b).unwrap();
        writeln!(file, "#include \"{}\"", a.display()).unwrap();

        let source = format!("#include \"{}\"\n", a.display());
        let error = preprocessor.preprocess(&source, None).unwrap_err();
        assert!(error.to_string().contains("recursive include"));
    }

    #[test]
    fn test_missing_include_reports_line() {
        let error = Preprocessor::new()
            .preprocess("u8 first;\n#include \"nowhere.pat\"\n", None)
            .unwrap_err();
        assert!(matches!(error, Error::Preprocessor { line: 2, .. }));
    }
}
