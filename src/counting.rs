use std::collections::HashMap;
use std::io::{self, Write};
use comfy_table::Table;

/// Key → count accumulator. Keys remember when they were first seen so that
/// equal counts rank in arrival order.
#[derive(Clone, Debug, Default)]
pub struct FrequencyTable {
    index: HashMap<String, usize>,
    entries: Vec<(String, u64)>,
}

impl FrequencyTable {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, key: &str, amount: u64) {
        match self.index.get(key) {
            Some(&i) => self.entries[i].1 += amount,
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push((key.to_string(), amount));
            }
        }
    }

    pub fn increment(&mut self, key: &str) { self.add(key, 1) }

    pub fn count(&self, key: &str) -> Option<u64> { self.index.get(key).map(|&i| self.entries[i].1) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Descending by count; the sort is stable so ties keep first-seen order.
    pub fn ranked(&self) -> Vec<(&str, u64)> {
        let mut v: Vec<(&str, u64)> = self.entries.iter().map(|(k, c)| (k.as_str(), *c)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1));
        v
    }

    pub fn print(&self, out: &mut dyn Write, caption: &str, key_label: &str) -> io::Result<()> {
        let mut table = Table::new();
        table.set_header(vec![key_label, "Count"]);
        for (k, c) in self.ranked() { table.add_row(vec![k.to_string(), c.to_string()]); }
        writeln!(out, "{}", caption)?;
        writeln!(out, "{}", table)?;
        writeln!(out)
    }
}
