//! Kernel symbol lookup from a `System.map` file, used only for diagnostics.

use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    /// Sorted by address.
    entries: Vec<(u32, String)>,
}

/// A resolved symbol: name plus byte offset from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location<'a> {
    pub name: &'a str,
    pub offset: u32,
}

impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "<{}>", self.name)
        } else {
            write!(f, "<{}+0x{:x}>", self.name, self.offset)
        }
    }
}

impl SymbolMap {
    /// Parse `<hex address> <type> <name>` lines. Lines that do not match are
    /// skipped, as are absolute (`a`/`A`) symbols which do not name code.
    pub fn parse(text: &str) -> Self {
        let mut entries: Vec<(u32, String)> = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u32::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                let name = parts.next()?;
                if kind.eq_ignore_ascii_case("a") {
                    return None;
                }
                Some((addr, name.to_string()))
            })
            .collect();
        entries.sort_by_key(|(addr, _)| *addr);
        log::debug!("Parsed {} kernel symbols", entries.len());
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest symbol at or below `addr`.
    pub fn lookup(&self, addr: u32) -> Option<Location<'_>> {
        let idx = match self.entries.binary_search_by_key(&addr, |(a, _)| *a) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (start, name) = &self.entries[idx];
        Some(Location {
            name,
            offset: addr - start,
        })
    }
}
