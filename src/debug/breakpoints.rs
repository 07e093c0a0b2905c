//! Breakpoint table. Ids start at 1 and are never reused.

use serde::Serialize;

use crate::vfs::{combine, normalize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakLocation {
    /// `file` is a normalized guest path with a leading `/`.
    Line { file: String, line: u32 },
    Function { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: u32,
    #[serde(flatten)]
    pub location: BreakLocation,
}

#[derive(Debug, Clone)]
pub struct BreakpointTable {
    next_id: u32,
    entries: Vec<Breakpoint>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self { next_id: 1, entries: Vec::new() }
    }
}

/// `startup.lua`, `/startup.lua` and `@/startup.lua` all name `/startup.lua`.
fn canonical_file(file: &str) -> Option<String> {
    let file = file.strip_prefix('@').unwrap_or(file);
    normalize(file).map(|segments| format!("/{}", combine(&segments)))
}

impl BreakpointTable {
    /// Returns `None` if `file` escapes the root.
    pub fn add_line(&mut self, file: &str, line: u32) -> Option<u32> {
        let file = canonical_file(file)?;
        Some(self.push(BreakLocation::Line { file, line }))
    }

    pub fn add_function(&mut self, name: &str) -> u32 {
        self.push(BreakLocation::Function { name: name.to_string() })
    }

    fn push(&mut self, location: BreakLocation) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Breakpoint { id, location });
        id
    }

    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|b| b.id != id);
        self.entries.len() != before
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether executing `line` of chunk `source` should stop.
    pub fn matches_line(&self, source: &str, line: u32) -> bool {
        if self.entries.is_empty() || !source.starts_with('@') {
            return false;
        }
        let Some(file) = canonical_file(source) else {
            return false;
        };
        self.entries.iter().any(|b| {
            matches!(&b.location, BreakLocation::Line { file: f, line: l } if *l == line && *f == file)
        })
    }

    pub fn matches_function(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|b| matches!(&b.location, BreakLocation::Function { name: n } if n == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused() {
        let mut table = BreakpointTable::default();
        let a = table.add_line("a.lua", 5).unwrap();
        let b = table.add_function("tick");
        assert_eq!((a, b), (1, 2));
        assert!(table.remove(a));
        assert!(!table.remove(a));
        assert_eq!(table.add_line("a.lua", 6), Some(3));
    }

    #[test]
    fn line_breakpoints_match_chunk_names() {
        let mut table = BreakpointTable::default();
        table.add_line("/a.lua", 5);
        assert!(table.matches_line("@/a.lua", 5));
        assert!(table.matches_line("@a.lua", 5));
        assert!(!table.matches_line("@/a.lua", 6));
        assert!(!table.matches_line("@/b.lua", 5));
        assert!(!table.matches_line("=bios", 5));
    }

    #[test]
    fn escaping_paths_are_refused() {
        let mut table = BreakpointTable::default();
        assert_eq!(table.add_line("../etc/passwd", 1), None);
        assert!(table.is_empty());
    }

    #[test]
    fn function_breakpoints_match_by_name() {
        let mut table = BreakpointTable::default();
        table.add_function("os.pullEvent");
        assert!(table.matches_function("os.pullEvent"));
        assert!(!table.matches_function("print"));
    }
}
