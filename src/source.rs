use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::Deserialize;
use crate::config::RunConfig;
use crate::dispatcher::ShutdownCoordinator;
use crate::event::{Event, Field};

/// Ordered stream of events from a live session or a recorded capture.
pub trait EventSource {
    fn start(&mut self) -> Result<()>;
    /// Hands every event to `on_event` in arrival order until the stream ends or
    /// shutdown is requested.
    fn process(&mut self, shutdown: &ShutdownCoordinator, on_event: &mut dyn FnMut(&Event)) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn events_lost(&self) -> u64;
}

pub fn open_source(cfg: &RunConfig) -> Result<Box<dyn EventSource>> {
    match cfg.file.as_ref() {
        Some(p) if is_evtx_path(p) => Ok(Box::new(crate::evtx_source::EvtxSource::new(p.clone(), cfg.file_glob.clone(), cfg.recursive, cfg.progress))),
        Some(p) => Ok(Box::new(CaptureSource::new(p.clone(), cfg.progress))),
        None => open_live(&cfg.providers),
    }
}

fn is_evtx_path(p: &Path) -> bool {
    p.is_dir() || p.extension().and_then(|e| e.to_str()).map(|s| s.eq_ignore_ascii_case("evtx")).unwrap_or(false)
}

#[cfg(target_os = "windows")]
fn open_live(providers: &[String]) -> Result<Box<dyn EventSource>> { Ok(Box::new(crate::windows_live::LiveSource::new(providers.to_vec()))) }

#[cfg(not(target_os = "windows"))]
fn open_live(providers: &[String]) -> Result<Box<dyn EventSource>> {
    anyhow::bail!("live sessions ({}) are only available on Windows; use --file with a recorded capture", providers.join(","))
}

pub(crate) fn spinner(enabled: bool, label: &str) -> Option<ProgressBar> {
    if !enabled { return None; }
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Reading {}", label));
    Some(pb)
}

pub(crate) fn tick(pb: &Option<ProgressBar>, seen: u64) {
    if let Some(pb) = pb && seen % 500 == 0 { pb.tick(); pb.set_message(format!("Read {} events", seen)); }
}

/// Hands `item` to a bounded queue without blocking the producer. A full
/// queue drops the item and bumps `dropped`.
#[cfg(any(target_os = "windows", test))]
pub(crate) fn offer<T>(tx: &std::sync::mpsc::SyncSender<T>, dropped: &std::sync::atomic::AtomicU64, item: T) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(std::sync::mpsc::TrySendError::Full(_)) => { dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed); false }
        Err(std::sync::mpsc::TrySendError::Disconnected(_)) => false,
    }
}

#[derive(Deserialize)]
struct CaptureRecord {
    name: String,
    #[serde(default)]
    task: String,
    #[serde(default)]
    process: String,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    tid: u32,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Vec<CaptureField>,
}

#[derive(Deserialize)]
struct CaptureField {
    name: String,
    value: Option<serde_json::Value>,
}

fn parse_capture_line(line: &str) -> serde_json::Result<Event> {
    let r: CaptureRecord = serde_json::from_str(line)?;
    let fields = r.payload.into_iter().map(|f| Field {
        name: f.name,
        value: f.value.map(|v| match v { serde_json::Value::String(s) => s, other => other.to_string() }),
    }).collect();
    Ok(Event { name: r.name, task_name: r.task, process_name: r.process, pid: r.pid, tid: r.tid, timestamp: r.timestamp, fields })
}

/// Recorded capture with one JSON event per line. `-` reads standard input.
/// A `null` payload value stands for a field the provider could not read.
pub struct CaptureSource {
    path: PathBuf,
    reader: Option<Box<dyn BufRead>>,
    progress: bool,
    lost: u64,
}

impl CaptureSource {
    pub fn new(path: PathBuf, progress: bool) -> Self { Self { path, reader: None, progress, lost: 0 } }

    #[cfg(test)]
    pub fn from_reader(reader: Box<dyn BufRead>) -> Self { Self { path: PathBuf::from("<memory>"), reader: Some(reader), progress: false, lost: 0 } }
}

impl EventSource for CaptureSource {
    fn start(&mut self) -> Result<()> {
        if self.reader.is_some() { return Ok(()); }
        let reader: Box<dyn BufRead> = if self.path.as_os_str() == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let f = File::open(&self.path).with_context(|| format!("failed to open capture {}", self.path.display()))?;
            Box::new(BufReader::new(f))
        };
        self.reader = Some(reader);
        Ok(())
    }

    fn process(&mut self, shutdown: &ShutdownCoordinator, on_event: &mut dyn FnMut(&Event)) -> Result<()> {
        let label = self.path.display().to_string();
        let reader = self.reader.as_mut().context("capture source was not started")?;
        let pb = spinner(self.progress, &label);
        let mut line = String::new();
        let mut line_no: u64 = 0;
        let mut seen: u64 = 0;
        while !shutdown.is_requested() {
            line.clear();
            if reader.read_line(&mut line).with_context(|| format!("failed to read {}", label))? == 0 { break; }
            line_no += 1;
            let text = line.trim();
            if text.is_empty() { continue; }
            match parse_capture_line(text) {
                Ok(e) => { seen += 1; tick(&pb, seen); on_event(&e); }
                Err(err) => { self.lost += 1; log::warn!("{}:{}: skipping malformed event: {}", label, line_no, err); }
            }
        }
        if let Some(pb) = pb { pb.finish_and_clear(); }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }

    fn events_lost(&self) -> u64 { self.lost }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted source for pipeline tests.
    pub struct VecSource {
        pub events: VecDeque<Event>,
        pub lost: u64,
        pub started: bool,
        pub stopped: u32,
        pub fail_stop: bool,
    }

    impl VecSource {
        pub fn new(events: Vec<Event>) -> Self { Self { events: events.into(), lost: 0, started: false, stopped: 0, fail_stop: false } }
    }

    impl EventSource for VecSource {
        fn start(&mut self) -> Result<()> { self.started = true; Ok(()) }

        fn process(&mut self, shutdown: &ShutdownCoordinator, on_event: &mut dyn FnMut(&Event)) -> Result<()> {
            while !shutdown.is_requested() {
                match self.events.pop_front() { Some(e) => on_event(&e), None => break }
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stopped += 1;
            if self.fail_stop { anyhow::bail!("session already gone"); }
            Ok(())
        }

        fn events_lost(&self) -> u64 { self.lost }
    }
}
