//! Module index: fully-qualified symbol name to owning plugin id
//!
//! Populated when a plugin loads, purged when it unloads, and consulted on
//! every cross-plugin lookup and on crash attribution. Lookups are lock-free
//! reads over a sharded concurrent map; registrations for different plugins
//! may run concurrently.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

use crate::error::{PluginResult, PluginRuntimeError};

/// File name of the per-plugin symbol list inside its install directory
pub const SYMBOL_INDEX_FILENAME: &str = "symbol_index";

/// Concurrent symbol ownership table
#[derive(Debug, Default)]
pub struct ModuleIndex {
    entries: DashMap<String, String>,
}

impl ModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every symbol of `plugin_id` in one logical step.
    ///
    /// Fails with [`PluginRuntimeError::SymbolConflict`] if any symbol is
    /// owned by another plugin; in that case nothing from this call remains
    /// in the index. Blank symbols are skipped and re-registering symbols the
    /// plugin already owns is a no-op.
    pub fn register<I, S>(&self, plugin_id: &str, symbols: I) -> PluginResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inserted: Vec<String> = Vec::new();
        let mut seen = HashSet::new();

        for symbol in symbols {
            let symbol: String = symbol.into();
            let symbol = symbol.trim();
            if symbol.is_empty() || !seen.insert(symbol.to_string()) {
                continue;
            }

            // The entry guard must be released before any rollback touches
            // the same shard.
            let conflict = match self.entries.entry(symbol.to_string()) {
                Entry::Occupied(existing) if existing.get() != plugin_id => {
                    Some(existing.get().clone())
                }
                Entry::Occupied(_) => None,
                Entry::Vacant(slot) => {
                    slot.insert(plugin_id.to_string());
                    inserted.push(symbol.to_string());
                    None
                }
            };

            if let Some(owner) = conflict {
                self.rollback(plugin_id, &inserted);
                return Err(PluginRuntimeError::SymbolConflict {
                    symbol: symbol.to_string(),
                    plugin_id: plugin_id.to_string(),
                    owner,
                });
            }
        }

        debug!(plugin_id, count = inserted.len(), "registered symbols");
        Ok(inserted.len())
    }

    fn rollback(&self, plugin_id: &str, inserted: &[String]) {
        for symbol in inserted {
            self.entries.remove_if(symbol, |_, owner| owner == plugin_id);
        }
    }

    /// Remove every symbol currently owned by `plugin_id`
    pub fn unregister(&self, plugin_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, owner| owner != plugin_id);
        let removed = before.saturating_sub(self.entries.len());
        debug!(plugin_id, removed, "purged symbols");
        removed
    }

    pub fn lookup(&self, symbol: &str) -> Option<String> {
        self.entries.get(symbol).map(|owner| owner.value().clone())
    }

    /// Resolve the owner of a qualified path such as a stack frame.
    ///
    /// Tries the exact path first, then drops trailing `::segment`s so that
    /// `crate::Type::method` resolves through an indexed `crate::Type`.
    pub fn resolve_owner(&self, qualified_path: &str) -> Option<String> {
        let mut candidate = qualified_path.trim();
        loop {
            if let Some(owner) = self.lookup(candidate) {
                return Some(owner);
            }
            match candidate.rfind("::") {
                Some(pos) if pos > 0 => candidate = &candidate[..pos],
                _ => return None,
            }
        }
    }

    pub fn symbols_of(&self, plugin_id: &str) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value() == plugin_id)
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn owns_any(&self, plugin_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.value() == plugin_id)
    }

    /// Distinct plugin ids currently present in the index
    pub fn owners(&self) -> HashSet<String> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a symbol index file. A missing file yields an empty list.
pub fn read_symbol_index(path: &Path) -> PluginResult<Vec<String>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut symbols = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            symbols.push(line.to_string());
        }
    }
    Ok(symbols)
}

/// Write a symbol index file, one symbol per line
pub fn write_symbol_index(path: &Path, symbols: &[String]) -> PluginResult<()> {
    let mut contents = String::new();
    for symbol in symbols.iter().filter(|s| !s.trim().is_empty()) {
        contents.push_str(symbol.trim());
        contents.push('\n');
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let index = ModuleIndex::new();
        let count = index
            .register("p1", ["p1::Entry", "p1::Greeter", " ", "p1::Entry"])
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(index.lookup("p1::Greeter").as_deref(), Some("p1"));
        assert_eq!(index.lookup("p2::Greeter"), None);
    }

    #[test]
    fn test_conflicting_register_leaves_no_residue() {
        let index = ModuleIndex::new();
        index.register("p1", ["shared::Api"]).unwrap();

        let result = index.register("p2", ["p2::Entry", "shared::Api", "p2::Other"]);
        assert!(matches!(result, Err(PluginRuntimeError::SymbolConflict { .. })));

        assert!(!index.owns_any("p2"));
        assert_eq!(index.lookup("shared::Api").as_deref(), Some("p1"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_unregister_only_touches_owner() {
        let index = ModuleIndex::new();
        index.register("p1", ["p1::A", "p1::B"]).unwrap();
        index.register("p2", ["p2::A"]).unwrap();

        assert_eq!(index.unregister("p1"), 2);
        assert_eq!(index.unregister("p1"), 0);
        assert_eq!(index.symbols_of("p2"), vec!["p2::A".to_string()]);
    }

    #[test]
    fn test_resolve_owner_strips_segments() {
        let index = ModuleIndex::new();
        index.register("p1", ["greeter::Greeter"]).unwrap();

        assert_eq!(
            index.resolve_owner("greeter::Greeter::greet").as_deref(),
            Some("p1")
        );
        assert_eq!(index.resolve_owner("std::panicking::begin_panic"), None);
    }

    #[test]
    fn test_symbol_index_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYMBOL_INDEX_FILENAME);

        assert!(read_symbol_index(&path).unwrap().is_empty());

        write_symbol_index(&path, &["a::B".to_string(), String::new(), "a::C".to_string()]).unwrap();
        assert_eq!(read_symbol_index(&path).unwrap(), vec!["a::B", "a::C"]);
    }
}
