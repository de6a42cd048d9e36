use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

pub const NULL_VALUE: &str = "<null>";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    // None when the provider could not hand the value over
    pub value: Option<String>,
}

impl Field {
    pub fn new(name: &str, value: &str) -> Self { Self { name: name.to_string(), value: Some(value.to_string()) } }
    pub fn unreadable(name: &str) -> Self { Self { name: name.to_string(), value: None } }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub task_name: String,
    pub process_name: String,
    pub pid: u32,
    pub tid: u32,
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<Field>,
}

impl Event {
    pub fn payload_names(&self) -> impl Iterator<Item = &str> { self.fields.iter().map(|f| f.name.as_str()) }

    pub fn payload_value(&self, index: usize) -> Option<&str> { self.fields.get(index).and_then(|f| f.value.as_deref()) }

    pub fn payload_by_name(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|f| f.name == name).and_then(|f| f.value.as_deref())
    }

    /// Canonical single-event text used by the raw printer and the raw regex filter.
    pub fn raw_string(&self) -> String {
        let mut s = format!("{} [PNAME={} PID={} TID={} TIME={}] TaskName={}", self.name, self.process_name, self.pid, self.tid, format_timestamp(&self.timestamp), self.task_name);
        for (i, name) in self.payload_names().enumerate() {
            if let Some(v) = self.payload_value(i) { let _ = write!(s, "\n  {:<20} = {}", name, v); }
        }
        s
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String { ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string() }

/// Resolves a display or filter field name to event data. Reserved names map to
/// event metadata, everything else is a payload lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldAccessor { Event, Pid, Tid, Time, Payload(String) }

impl FieldAccessor {
    pub fn for_name(name: &str) -> Self {
        match name {
            "Event" => FieldAccessor::Event,
            "PID" => FieldAccessor::Pid,
            "TID" => FieldAccessor::Tid,
            "Time" => FieldAccessor::Time,
            other => FieldAccessor::Payload(other.to_string()),
        }
    }

    pub fn default_width(&self) -> usize {
        match self { FieldAccessor::Event => 20, FieldAccessor::Pid => 5, FieldAccessor::Tid => 5, FieldAccessor::Time => 15, FieldAccessor::Payload(_) => 30 }
    }

    pub fn resolve(&self, e: &Event) -> String {
        match self {
            FieldAccessor::Event => e.name.clone(),
            FieldAccessor::Pid => e.pid.to_string(),
            FieldAccessor::Tid => e.tid.to_string(),
            FieldAccessor::Time => format_timestamp(&e.timestamp),
            FieldAccessor::Payload(name) => e.payload_by_name(name).unwrap_or(NULL_VALUE).to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_event(name: &str, process: &str, pid: u32, tid: u32) -> Event {
    Event {
        name: name.to_string(),
        task_name: "Task".to_string(),
        process_name: process.to_string(),
        pid,
        tid,
        timestamp: Utc::now(),
        fields: vec![Field::new("FileName", "C:\\temp\\a.txt"), Field::new("Size", "4096")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_string_has_header_and_padded_fields() {
        let e = sample_event("FileIO/Create", "notepad", 42, 7);
        let s = e.raw_string();
        let mut lines = s.lines();
        let head = lines.next().unwrap();
        assert!(head.starts_with("FileIO/Create [PNAME=notepad PID=42 TID=7 TIME="));
        assert!(head.ends_with("] TaskName=Task"));
        assert_eq!(lines.next().unwrap(), format!("  {:<20} = C:\\temp\\a.txt", "FileName"));
        assert_eq!(lines.next().unwrap(), "  Size                 = 4096");
        assert!(lines.next().is_none());
    }

    #[test]
    fn raw_string_skips_unreadable_field() {
        let mut e = sample_event("Net/Send", "svc", 1, 1);
        e.fields.push(Field::unreadable("Tail"));
        let s = e.raw_string();
        assert_eq!(s.lines().count(), 3);
        assert!(!s.contains("Tail"));
    }

    #[test]
    fn accessor_maps_reserved_names_first() {
        let e = sample_event("Proc/Start", "cmd", 100, 200);
        assert_eq!(FieldAccessor::for_name("Event").resolve(&e), "Proc/Start");
        assert_eq!(FieldAccessor::for_name("PID").resolve(&e), "100");
        assert_eq!(FieldAccessor::for_name("TID").resolve(&e), "200");
        assert_eq!(FieldAccessor::for_name("Size").resolve(&e), "4096");
        assert_eq!(FieldAccessor::for_name("Missing").resolve(&e), NULL_VALUE);
        assert_eq!(FieldAccessor::for_name("pid"), FieldAccessor::Payload("pid".to_string()));
    }

    #[test]
    fn default_widths() {
        let w: Vec<usize> = ["Event", "PID", "TID", "Time", "Other"].iter().map(|n| FieldAccessor::for_name(n).default_width()).collect();
        assert_eq!(w, vec![20, 5, 5, 15, 30]);
    }

    #[test]
    fn payload_lookup_by_position_and_name() {
        let mut e = sample_event("A", "p", 1, 1);
        e.fields.push(Field::unreadable("Broken"));
        assert_eq!(e.payload_value(1), Some("4096"));
        assert_eq!(e.payload_value(2), None);
        assert_eq!(e.payload_value(9), None);
        assert_eq!(e.payload_by_name("Broken"), None);
        assert_eq!(e.payload_names().collect::<Vec<_>>(), vec!["FileName", "Size", "Broken"]);
    }
}
