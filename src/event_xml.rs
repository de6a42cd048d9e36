use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use crate::event::{Event, Field};

const UNKNOWN_PROCESS: &str = "<unknown>";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section { None, System, EventData, UserData }

fn attr(e: &BytesStart, key: &str) -> Option<String> {
    e.attributes().flatten().find(|a| a.key.as_ref() == key.as_bytes()).and_then(|a| a.unescape_value().ok()).map(|v| v.to_string())
}

/// Maps a rendered event record (`<Event><System>..</System><EventData>..`)
/// onto an [`Event`]. Payload fields keep document order; unnamed `<Data>`
/// elements become `param1`, `param2`, ...
pub fn parse_event(xml: &str) -> Option<Event> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut section = Section::None;
    let mut cur = String::new();
    let mut pending_data: Option<String> = None;
    let mut provider = String::new();
    let mut channel = String::new();
    let mut event_id: Option<u32> = None;
    let mut task = String::new();
    let mut time: Option<DateTime<Utc>> = None;
    let (mut pid, mut tid) = (0u32, 0u32);
    let mut fields: Vec<Field> = Vec::new();
    loop {
        let ev = match reader.read_event_into(&mut buf) { Ok(ev) => ev, Err(e) => { log::debug!("event xml error: {}", e); return None } };
        match ev {
            XmlEvent::Start(e) | XmlEvent::Empty(e) if section == Section::System => {
                match e.local_name().as_ref() {
                    b"Provider" => { if let Some(n) = attr(&e, "Name") { provider = n; } }
                    b"TimeCreated" => { time = attr(&e, "SystemTime").and_then(|s| parse_system_time(&s)); }
                    b"Execution" => {
                        pid = attr(&e, "ProcessID").and_then(|s| s.parse().ok()).unwrap_or(0);
                        tid = attr(&e, "ThreadID").and_then(|s| s.parse().ok()).unwrap_or(0);
                    }
                    _ => {}
                }
                cur = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
            }
            XmlEvent::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "System" => section = Section::System,
                    "EventData" => section = Section::EventData,
                    "UserData" => section = Section::UserData,
                    "Data" if section == Section::EventData => pending_data = Some(attr(&e, "Name").unwrap_or_else(|| format!("param{}", fields.len() + 1))),
                    _ => {}
                }
                cur = name;
            }
            XmlEvent::Empty(e) => {
                if section == Section::EventData && e.local_name().as_ref() == b"Data" {
                    let name = attr(&e, "Name").unwrap_or_else(|| format!("param{}", fields.len() + 1));
                    fields.push(Field::new(&name, ""));
                }
            }
            XmlEvent::Text(t) => {
                let v = t.unescape().map(|c| c.into_owned()).unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned());
                match section {
                    Section::System => match cur.as_str() {
                        "EventID" => event_id = v.trim().parse().ok(),
                        "Task" => task = v,
                        "Channel" => channel = v,
                        _ => {}
                    },
                    Section::EventData => { if let Some(n) = pending_data.take() { fields.push(Field { name: n, value: Some(v) }); } }
                    Section::UserData => { if !cur.is_empty() { fields.push(Field { name: cur.clone(), value: Some(v) }); } }
                    Section::None => {}
                }
            }
            XmlEvent::End(e) => {
                match e.local_name().as_ref() {
                    b"System" | b"EventData" | b"UserData" => section = Section::None,
                    b"Data" => { if let Some(n) = pending_data.take() { fields.push(Field::new(&n, "")); } }
                    _ => {}
                }
                cur.clear();
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    let timestamp = time?;
    let source = if provider.is_empty() { channel } else { provider };
    let name = format!("{}/{}", source, event_id.unwrap_or(0));
    let process_name = process_name_from(&fields);
    Some(Event { name, task_name: task, process_name, pid, tid, timestamp, fields })
}

fn process_name_from(fields: &[Field]) -> String {
    for key in ["Image", "NewProcessName", "ProcessName", "Application"] {
        if let Some(v) = fields.iter().find(|f| f.name == key).and_then(|f| f.value.as_deref()) && !v.is_empty() {
            return v.rsplit(['\\', '/']).next().unwrap_or(v).to_string();
        }
    }
    UNKNOWN_PROCESS.to_string()
}

pub fn parse_system_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) { return Some(dt.with_timezone(&Utc)); }
    let mut alt = s.replace(' ', "T");
    if !alt.ends_with('Z') && !alt.contains('+') { alt.push('Z'); }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&alt) { return Some(dt.with_timezone(&Utc)); }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") { return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)); }
    None
}
