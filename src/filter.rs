use std::collections::HashSet;
use regex::Regex;
use crate::config::ConfigError;
use crate::event::{Event, FieldAccessor};

#[derive(Clone, Debug)]
pub struct FieldFilter {
    pub name: String,
    accessor: FieldAccessor,
    regex: Regex,
}

impl FieldFilter {
    /// Parses `Field=regex`, splitting at the first `=`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let (name, pattern) = spec.split_once('=').ok_or_else(|| ConfigError::InvalidFieldFilter(spec.to_string()))?;
        let name = name.trim();
        if name.is_empty() { return Err(ConfigError::InvalidFieldFilter(spec.to_string())); }
        Ok(Self { name: name.to_string(), accessor: FieldAccessor::for_name(name), regex: compile(pattern)? })
    }

    pub fn is_match(&self, e: &Event) -> bool { self.regex.is_match(&self.accessor.resolve(e)) }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex { pattern: pattern.to_string(), source })
}

#[derive(Clone, Debug)]
pub enum MatchMode {
    All,
    Raw(Regex),
    Fields(Vec<FieldFilter>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Drop,
    Forward,
    ForwardRendered(String),
}

#[derive(Clone, Debug)]
pub struct FilterSpec {
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub events: HashSet<String>,
    pub mode: MatchMode,
}

impl FilterSpec {
    pub fn new(pid: Option<u32>, tid: Option<u32>, events: &[String], raw_filter: Option<&str>, field_filters: &[String]) -> Result<Self, ConfigError> {
        let mode = match (raw_filter, field_filters.is_empty()) {
            (Some(_), false) => return Err(ConfigError::ConflictingFilters),
            (Some(raw), true) => MatchMode::Raw(compile(raw)?),
            (None, false) => MatchMode::Fields(field_filters.iter().map(|f| FieldFilter::parse(f)).collect::<Result<Vec<_>, _>>()?),
            (None, true) => MatchMode::All,
        };
        Ok(Self { pid, tid, events: events.iter().cloned().collect(), mode })
    }

    pub fn evaluate(&self, e: &Event) -> Decision {
        if let Some(pid) = self.pid && pid != e.pid { return Decision::Drop; }
        if let Some(tid) = self.tid && tid != e.tid { return Decision::Drop; }
        if !self.events.is_empty() && !self.events.contains(&e.name) { return Decision::Drop; }
        match &self.mode {
            MatchMode::All => Decision::Forward,
            MatchMode::Raw(re) => {
                let s = e.raw_string();
                if re.is_match(&s) { Decision::ForwardRendered(s) } else { Decision::Drop }
            }
            // first match wins, the rest are never evaluated
            MatchMode::Fields(filters) => if filters.iter().any(|f| f.is_match(e)) { Decision::Forward } else { Decision::Drop },
        }
    }
}
