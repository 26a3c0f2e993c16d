//! Evaluation console
//!
//! Non-fatal output produced while a pattern runs: `std::print` calls,
//! attribute warnings, debug traces. Entries accumulate in order and are
//! handed to the host even when evaluation ends in a hard error.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Debug => "[-]",
            Level::Info => "[i]",
            Level::Warning => "[*]",
            Level::Error => "[!]",
        }
    }
}

#[derive(Debug, Default)]
pub struct LogConsole {
    entries: Vec<(Level, String)>,
}

impl LogConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, level: Level, message: impl AsRef<str>) {
        self.entries
            .push((level, format!("{} {}", level.prefix(), message.as_ref())));
    }

    pub fn debug(&mut self, message: impl AsRef<str>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.log(Level::Info, message);
    }

    pub fn warning(&mut self, message: impl AsRef<str>) {
        self.log(Level::Warning, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.log(Level::Error, message);
    }

    pub fn entries(&self) -> &[(Level, String)] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn into_entries(self) -> Vec<(Level, String)> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_order_and_prefix() {
        let mut console = LogConsole::new();
        console.debug("lexing");
        console.info("hello");
        console.warning("shadowed attribute");
        console.error("bad read");

        let entries = console.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].1, "[-] lexing");
        assert_eq!(entries[1].1, "[i] hello");
        assert_eq!(entries[2].1, "[*] shadowed attribute");
        assert_eq!(entries[3].1, "[!] bad read");
    }
}
