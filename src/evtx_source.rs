use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use evtx::EvtxParser;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use crate::dispatcher::ShutdownCoordinator;
use crate::event::Event;
use crate::event_xml::parse_event;
use crate::source::{EventSource, spinner, tick};

/// Replays one `.evtx` file, or every matching `.evtx` under a directory.
pub struct EvtxSource {
    path: PathBuf,
    glob: Option<String>,
    recursive: bool,
    progress: bool,
    files: Vec<PathBuf>,
    lost: u64,
}

impl EvtxSource {
    pub fn new(path: PathBuf, glob: Option<String>, recursive: bool, progress: bool) -> Self {
        Self { path, glob, recursive, progress, files: Vec::new(), lost: 0 }
    }
}

fn build_glob(g: &str) -> Result<GlobSet> {
    let mut gb = GlobSetBuilder::new();
    gb.add(GlobBuilder::new(g).case_insensitive(true).build().with_context(|| format!("invalid file glob {:?}", g))?);
    Ok(gb.build()?)
}

fn is_evtx(p: &Path) -> bool { p.extension().and_then(|e| e.to_str()).map(|s| s.eq_ignore_ascii_case("evtx")).unwrap_or(false) }

/// Files in walk order; directories are descended only when `recursive`.
fn discover(root: &Path, glob: Option<&str>, recursive: bool) -> Result<Vec<PathBuf>> {
    if root.is_file() { return Ok(vec![root.to_path_buf()]); }
    if !root.is_dir() { anyhow::bail!("EVTX path is neither file nor directory: {}", root.display()); }
    let set = glob.map(build_glob).transpose()?;
    let wd = if recursive { walkdir::WalkDir::new(root) } else { walkdir::WalkDir::new(root).max_depth(1) };
    let mut files: Vec<PathBuf> = wd.sort_by_file_name().into_iter().filter_map(Result::ok)
        .map(|de| de.into_path())
        .filter(|fp| fp.is_file() && is_evtx(fp))
        .filter(|fp| set.as_ref().map(|s| s.is_match(fp)).unwrap_or(true))
        .collect();
    files.dedup();
    Ok(files)
}

impl EventSource for EvtxSource {
    fn start(&mut self) -> Result<()> {
        self.files = discover(&self.path, self.glob.as_deref(), self.recursive)?;
        if self.files.is_empty() { log::warn!("no .evtx files found under {}", self.path.display()); }
        log::info!("replaying {} evtx file(s)", self.files.len());
        Ok(())
    }

    fn process(&mut self, shutdown: &ShutdownCoordinator, on_event: &mut dyn FnMut(&Event)) -> Result<()> {
        let mut seen: u64 = 0;
        'files: for fp in &self.files {
            let mut parser = match EvtxParser::from_path(fp) {
                Ok(x) => x,
                Err(e) => { log::error!("EVTX open failed for {}: {}. Reading .evtx may require Administrator privileges.", fp.display(), e); continue }
            };
            let pb = spinner(self.progress, &fp.display().to_string());
            for r in parser.records() {
                if shutdown.is_requested() {
                    if let Some(pb) = &pb { pb.finish_and_clear(); }
                    break 'files;
                }
                match r {
                    Ok(rec) => match parse_event(&rec.data) {
                        Some(e) => { seen += 1; tick(&pb, seen); on_event(&e); }
                        None => { self.lost += 1; log::debug!("{}: record {} did not map to an event", fp.display(), rec.event_record_id); }
                    },
                    Err(e) => { self.lost += 1; log::debug!("{}: unreadable record: {}", fp.display(), e); }
                }
            }
            if let Some(pb) = &pb { pb.finish_and_clear(); }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.files.clear();
        Ok(())
    }

    fn events_lost(&self) -> u64 { self.lost }
}
