use std::io::Write;
use std::sync::OnceLock;
use anyhow::Result;
use regex::Regex;
use crate::config::ConfigError;
use crate::counting::FrequencyTable;
use crate::event::{Event, FieldAccessor};
use crate::table::{Table, TableBuilder};

pub type Output = Box<dyn Write + Send>;

/// Sink for events that made it through the filters.
pub trait Processor {
    fn consume(&mut self, e: &Event) -> Result<()>;
    /// Same event with its raw text already rendered by the raw filter.
    fn consume_rendered(&mut self, e: &Event, raw: &str) -> Result<()>;
    /// Flushes or reports. Calling it again does nothing.
    fn finalize(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayColumn {
    pub name: String,
    pub width: usize,
}

impl DisplayColumn {
    /// `name` or `name[width]`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        if spec.trim().is_empty() { return Err(ConfigError::InvalidDisplayField(spec.to_string())); }
        static WITH_WIDTH: OnceLock<Regex> = OnceLock::new();
        let re = WITH_WIDTH.get_or_init(|| Regex::new(r"^(.*)\[(\d+)\]$").expect("static regex"));
        if let Some(caps) = re.captures(spec) {
            let width = caps[2].parse::<usize>().map_err(|_| ConfigError::InvalidDisplayField(spec.to_string()))?;
            if caps[1].trim().is_empty() { return Err(ConfigError::InvalidDisplayField(spec.to_string())); }
            return Ok(Self { name: caps[1].to_string(), width });
        }
        Ok(Self { name: spec.to_string(), width: FieldAccessor::for_name(spec).default_width() })
    }
}

pub struct RawPrinter {
    out: Output,
    finalized: bool,
}

impl RawPrinter {
    pub fn new(out: Output) -> Self { Self { out, finalized: false } }
}

impl Processor for RawPrinter {
    fn consume(&mut self, e: &Event) -> Result<()> { self.consume_rendered(e, &e.raw_string()) }

    fn consume_rendered(&mut self, _e: &Event, raw: &str) -> Result<()> {
        writeln!(self.out, "{}", raw)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized { return Ok(()); }
        self.finalized = true;
        self.out.flush()?;
        Ok(())
    }
}

pub struct TablePrinter {
    table: Table,
    accessors: Vec<FieldAccessor>,
    out: Output,
    finalized: bool,
}

impl TablePrinter {
    /// Admits the columns against `max_width` and prints the header right away.
    pub fn new(columns: &[DisplayColumn], max_width: usize, mut out: Output) -> Result<Self> {
        let mut builder = TableBuilder::new(max_width);
        for c in columns { builder.add_column(&c.name, c.width); }
        let table = builder.print_header(&mut out)?;
        let accessors = table.columns().iter().map(|c| FieldAccessor::for_name(&c.name)).collect();
        Ok(Self { table, accessors, out, finalized: false })
    }
}

impl Processor for TablePrinter {
    fn consume(&mut self, e: &Event) -> Result<()> {
        let values: Vec<String> = self.accessors.iter().map(|a| a.resolve(e)).collect();
        self.table.print_row(&mut self.out, &values)?;
        Ok(())
    }

    fn consume_rendered(&mut self, e: &Event, _raw: &str) -> Result<()> { self.consume(e) }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized { return Ok(()); }
        self.finalized = true;
        self.out.flush()?;
        Ok(())
    }
}

pub struct StatsAggregator {
    by_name: FrequencyTable,
    by_process: FrequencyTable,
    out: Output,
    finalized: bool,
}

impl StatsAggregator {
    pub fn new(out: Output) -> Self { Self { by_name: FrequencyTable::new(), by_process: FrequencyTable::new(), out, finalized: false } }
}

impl Processor for StatsAggregator {
    fn consume(&mut self, e: &Event) -> Result<()> {
        self.by_name.increment(&e.name);
        self.by_process.increment(&e.process_name);
        Ok(())
    }

    fn consume_rendered(&mut self, e: &Event, _raw: &str) -> Result<()> { self.consume(e) }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized { return Ok(()); }
        self.finalized = true;
        self.by_name.print(&mut self.out, "Events by name", "Event")?;
        self.by_process.print(&mut self.out, "Events by process", "Process")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Statistics beat an explicit field list, which beats the raw printer.
pub fn select_processor(stats_only: bool, display_fields: &[DisplayColumn], max_width: usize, out: Output) -> Result<Box<dyn Processor>> {
    if stats_only {
        log::debug!("processor: statistics");
        Ok(Box::new(StatsAggregator::new(out)))
    } else if !display_fields.is_empty() {
        log::debug!("processor: table with {} requested columns, width {}", display_fields.len(), max_width);
        Ok(Box::new(TablePrinter::new(display_fields, max_width, out)?))
    } else {
        log::debug!("processor: raw");
        Ok(Box::new(RawPrinter::new(out)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory writer so tests can read what a processor printed.
    #[derive(Clone, Default)]
    pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn text(&self) -> String { String::from_utf8(self.0.lock().unwrap().clone()).unwrap() }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.0.lock().unwrap().write(buf) }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }
}
