use std::path::PathBuf;
use thiserror::Error;
use crate::filter::FilterSpec;
use crate::processor::DisplayColumn;

/// Problems caught before any session is opened.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("a raw filter and field filters cannot be used together")]
    ConflictingFilters,

    #[error("specifying providers is not supported when reading a capture file")]
    ProvidersWithFile,

    #[error("no events to collect: give at least one provider for a live session")]
    NoProviders,

    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid field filter {0:?}, expected Field=regex")]
    InvalidFieldFilter(String),

    #[error("invalid display field {0:?}, expected name or name[width]")]
    InvalidDisplayField(String),
}

/// Everything a run needs, already merged from the command line and config file.
#[derive(Clone, Debug, Default)]
pub struct RunConfig {
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub events: Vec<String>,
    pub raw_filter: Option<String>,
    pub filters: Vec<String>,
    pub display_fields: Vec<String>,
    pub duration_secs: u64,
    pub stats_only: bool,
    pub file: Option<PathBuf>,
    pub file_glob: Option<String>,
    pub recursive: bool,
    pub providers: Vec<String>,
    pub width: Option<usize>,
    pub progress: bool,
}

impl RunConfig {
    pub fn is_file_session(&self) -> bool { self.file.is_some() }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.raw_filter.is_some() && !self.filters.is_empty() { return Err(ConfigError::ConflictingFilters); }
        if self.is_file_session() && !self.providers.is_empty() { return Err(ConfigError::ProvidersWithFile); }
        if !self.is_file_session() && self.providers.is_empty() { return Err(ConfigError::NoProviders); }
        Ok(())
    }

    pub fn filter_spec(&self) -> Result<FilterSpec, ConfigError> {
        FilterSpec::new(self.pid, self.tid, &self.events, self.raw_filter.as_deref(), &self.filters)
    }

    pub fn display_columns(&self) -> Result<Vec<DisplayColumn>, ConfigError> {
        self.display_fields.iter().map(|f| DisplayColumn::parse(f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_run() -> RunConfig { RunConfig { file: Some(PathBuf::from("trace.ndjson")), ..Default::default() } }

    #[test]
    fn file_session_without_providers_is_fine() {
        assert!(file_run().validate().is_ok());
    }

    #[test]
    fn rejects_providers_with_file() {
        let mut c = file_run();
        c.providers = vec!["System".to_string()];
        assert!(matches!(c.validate(), Err(ConfigError::ProvidersWithFile)));
    }

    #[test]
    fn rejects_live_run_without_providers() {
        let c = RunConfig::default();
        assert!(matches!(c.validate(), Err(ConfigError::NoProviders)));
        let c = RunConfig { providers: vec!["Application".to_string()], ..Default::default() };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_raw_with_field_filters() {
        let mut c = file_run();
        c.raw_filter = Some("x".to_string());
        c.filters = vec!["Event=y".to_string()];
        assert!(matches!(c.validate(), Err(ConfigError::ConflictingFilters)));
        assert!(matches!(c.filter_spec(), Err(ConfigError::ConflictingFilters)));
    }

    #[test]
    fn display_columns_parse_all() {
        let mut c = file_run();
        c.display_fields = vec!["Event".to_string(), "Path[50]".to_string()];
        let cols = c.display_columns().unwrap();
        assert_eq!(cols[1].width, 50);
        c.display_fields.push("Bad[123456789012345678901234567890]".to_string());
        assert!(matches!(c.display_columns(), Err(ConfigError::InvalidDisplayField(_))));
    }
}
