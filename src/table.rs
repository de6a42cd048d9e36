use std::io::{self, Write};

/// Cuts `s` to `limit` chars, ending in `...` when it had to cut.
pub fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit { return s.to_string(); }
    let mut out: String = s.chars().take(limit.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub width: usize,
}

/// Collects columns against a fixed width budget. Turning it into a [`Table`]
/// prints the header, after which the column set is frozen.
#[derive(Debug)]
pub struct TableBuilder {
    max_width: usize,
    used_width: usize,
    columns: Vec<Column>,
}

impl TableBuilder {
    pub fn new(max_width: usize) -> Self { Self { max_width, used_width: 0, columns: Vec::new() } }

    /// Admits the column if it still fits, counting one separator unit. A column
    /// that does not fit is dropped and leaves the budget untouched.
    pub fn add_column(&mut self, name: &str, width: usize) -> bool {
        if self.used_width + width + 1 > self.max_width {
            log::debug!("column {} ({} wide) does not fit in {} columns, skipped", name, width, self.max_width);
            return false;
        }
        self.used_width += width + 1;
        self.columns.push(Column { name: name.to_string(), width });
        true
    }

    pub fn print_header(self, out: &mut dyn Write) -> io::Result<Table> {
        let mut line = String::new();
        for c in &self.columns { line.push_str(&format!("{:<w$} ", truncate(&c.name, c.width), w = c.width)); }
        writeln!(out, "{}", line)?;
        writeln!(out, "{}", "-".repeat(self.used_width))?;
        Ok(Table { max_width: self.max_width, used_width: self.used_width, columns: self.columns })
    }
}

#[derive(Debug)]
pub struct Table {
    max_width: usize,
    used_width: usize,
    columns: Vec<Column>,
}

impl Table {
    pub fn columns(&self) -> &[Column] { &self.columns }

    pub fn used_width(&self) -> usize { self.used_width }

    pub fn format_row<S: AsRef<str>>(&self, values: &[S]) -> String {
        let mut line = String::new();
        let last = self.columns.len().saturating_sub(1);
        for (i, (c, v)) in self.columns.iter().zip(values).enumerate() {
            if i == last {
                // the last column takes whatever budget is left
                line.push_str(&truncate(v.as_ref(), self.max_width.saturating_sub(self.used_width)));
            } else {
                line.push_str(&format!("{:<w$} ", truncate(v.as_ref(), c.width), w = c.width));
            }
        }
        line
    }

    pub fn print_row<S: AsRef<str>>(&self, out: &mut dyn Write, values: &[S]) -> io::Result<()> { writeln!(out, "{}", self.format_row(values)) }
}
