use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, ValueEnum, ColorChoice, ArgAction, CommandFactory};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use is_terminal::IsTerminal;
mod config;
mod counting;
mod dispatcher;
mod event;
mod event_xml;
mod evtx_source;
mod filter;
mod processor;
mod source;
mod table;
#[cfg(target_os = "windows")]
mod windows_live;

use crate::config::RunConfig;
use crate::dispatcher::{Dispatcher, ShutdownCoordinator};

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();

const DEFAULT_CONFIG: &str = "evtrace.toml";
const DEFAULT_WIDTH: usize = 120;

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat { Text, Json }

#[derive(Parser, Debug, Default)]
#[command(
    name = "evtrace",
    about = "Streaming event trace filter and viewer",
    long_about = "Streams events from a live event log subscription or a recorded capture, filters them by process, thread, name, raw text or individual fields, and prints them raw, as a table, or as frequency statistics.",
    after_long_help = "Examples:\n  evtrace --provider System,Application --duration 60\n  evtrace --file Security.evtx --event Microsoft-Windows-Security-Auditing/4688 --field Event,PID,Time,NewProcessName\n  evtrace --file trace.ndjson --filter 'FileName=\\.dll$' --stats-only\n  evtrace --file C:\\Logs --file-glob '*sys*' --recursive --raw-filter 'cmd\\.exe'",
    color = ColorChoice::Auto
)]
struct Args {
    /// Only events from this process id
    #[arg(long)]
    pid: Option<u32>,
    /// Only events from this thread id
    #[arg(long)]
    tid: Option<u32>,
    /// Allowed event names
    #[arg(long = "event", num_args = 0.., value_delimiter = ',')]
    events: Vec<String>,
    /// Regex matched against the full raw text of each event
    #[arg(long, conflicts_with = "filters")]
    raw_filter: Option<String>,
    /// Field=regex; an event passes when any filter matches
    #[arg(long = "filter")]
    filters: Vec<String>,
    /// Table columns, each `name` or `name[width]`
    #[arg(long = "field", num_args = 0.., value_delimiter = ',')]
    fields: Vec<String>,
    /// Stop after this many seconds (0 runs until the stream ends or Ctrl+C)
    #[arg(long, short = 'd', default_value_t = 0)]
    duration: u64,
    /// Print per-event-name and per-process counts instead of events
    #[arg(long, default_value_t = false)]
    stats_only: bool,
    /// Recorded capture: .evtx file, directory of .evtx files, or JSON lines (`-` for stdin)
    #[arg(long, short = 'f')]
    file: Option<String>,
    #[arg(long, short = 'g')]
    file_glob: Option<String>,
    #[arg(long, default_value_t = false)]
    recursive: bool,
    /// Event log channels to subscribe to for a live session
    #[arg(long = "provider", short = 'p', num_args = 0.., value_delimiter = ',')]
    providers: Vec<String>,
    /// Table width budget (defaults to the terminal width)
    #[arg(long)]
    width: Option<usize>,
    #[arg(long, default_value_t = false)]
    progress: bool,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, default_value_t = false)]
    force_color: bool,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long)]
    completions_out: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AppConfig {
    pid: Option<u32>,
    tid: Option<u32>,
    events: Option<Vec<String>>,
    raw_filter: Option<String>,
    filters: Option<Vec<String>>,
    fields: Option<Vec<String>>,
    duration: Option<u64>,
    stats_only: Option<bool>,
    file: Option<String>,
    file_glob: Option<String>,
    recursive: Option<bool>,
    providers: Option<Vec<String>>,
    width: Option<usize>,
    progress: Option<bool>,
    no_color: Option<bool>,
    force_color: Option<bool>,
    log_level: Option<LogLevel>,
    log_format: Option<LogFormat>,
    log_path: Option<String>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        let mut cmd = Args::command();
        if let Some(path) = args.completions_out.as_ref()
            && let Ok(mut f) = std::fs::File::create(path) { clap_complete::generate(sh, &mut cmd, "evtrace", &mut f); }
        else { clap_complete::generate(sh, &mut cmd, "evtrace", &mut std::io::stdout()); }
        return;
    }
    match load_config(args.config.as_deref()) {
        Ok(Some(cfg)) => apply_config(&mut args, cfg),
        Ok(None) => {}
        Err(e) => bail(&format!("{:#}", e)),
    }
    init_logger(&args);
    let term = std::env::var("TERM").unwrap_or_default();
    let no_color_env = std::env::var_os("NO_COLOR").is_some();
    let color_default = std::io::stdout().is_terminal() && !no_color_env && term != "dumb";
    let enable_color = if args.force_color { true } else { color_default && !args.no_color };
    let _ = ENABLE_COLOR.set(enable_color);

    let run = run_config(&args);
    if let Err(e) = run.validate() { bail(&e.to_string()); }
    match execute(&run) {
        Ok(()) => {}
        Err(e) => {
            log::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Explicit `--config` must load; the default file is optional.
fn load_config(path: Option<&str>) -> Result<Option<AppConfig>> {
    let (p, required) = match path { Some(p) => (p, true), None => (DEFAULT_CONFIG, false) };
    let s = match std::fs::read_to_string(p) {
        Ok(s) => s,
        Err(_) if !required => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read config {}", p)),
    };
    let cfg = toml::from_str::<AppConfig>(&s).with_context(|| format!("invalid config {}", p))?;
    Ok(Some(cfg))
}

fn apply_config(args: &mut Args, cfg: AppConfig) {
    if args.pid.is_none() && let Some(v) = cfg.pid { args.pid = Some(v); }
    if args.tid.is_none() && let Some(v) = cfg.tid { args.tid = Some(v); }
    if args.events.is_empty() && let Some(v) = cfg.events { args.events = v; }
    if args.raw_filter.is_none() && args.filters.is_empty() && let Some(v) = cfg.raw_filter { args.raw_filter = Some(v); }
    if args.filters.is_empty() && args.raw_filter.is_none() && let Some(v) = cfg.filters { args.filters = v; }
    if args.fields.is_empty() && let Some(v) = cfg.fields { args.fields = v; }
    if args.duration == 0 && let Some(v) = cfg.duration { args.duration = v; }
    if let Some(v) = cfg.stats_only { args.stats_only |= v; }
    if args.file.is_none() && args.providers.is_empty() && let Some(v) = cfg.file { args.file = Some(v); }
    if args.file_glob.is_none() && let Some(v) = cfg.file_glob { args.file_glob = Some(v); }
    if let Some(v) = cfg.recursive { args.recursive |= v; }
    if args.providers.is_empty() && args.file.is_none() && let Some(v) = cfg.providers { args.providers = v; }
    if args.width.is_none() && let Some(v) = cfg.width { args.width = Some(v); }
    if let Some(v) = cfg.progress { args.progress |= v; }
    if let Some(v) = cfg.no_color { args.no_color |= v; }
    if let Some(v) = cfg.force_color { args.force_color |= v; }
    if args.log_level.is_none() && let Some(v) = cfg.log_level { args.log_level = Some(v); }
    if args.log_format.is_none() && let Some(v) = cfg.log_format { args.log_format = Some(v); }
    if args.log_path.is_none() && let Some(v) = cfg.log_path { args.log_path = Some(v); }
}

fn init_logger(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if args.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else if let Some(lvl) = args.log_level {
        let f = match lvl { LogLevel::Error => log::LevelFilter::Error, LogLevel::Warn => log::LevelFilter::Warn, LogLevel::Info => log::LevelFilter::Info, LogLevel::Debug => log::LevelFilter::Debug, LogLevel::Trace => log::LevelFilter::Trace };
        builder.filter_level(f);
    } else if args.verbose > 0 {
        let f = if args.verbose >= 3 { log::LevelFilter::Trace } else if args.verbose == 2 { log::LevelFilter::Debug } else { log::LevelFilter::Info };
        builder.filter_level(f);
    }
    match args.log_format {
        Some(LogFormat::Json) => {
            builder.format(|buf, record| {
                use std::io::Write;
                let obj = serde_json::json!({
                    "ts": Local::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{}", obj)
            });
        }
        Some(LogFormat::Text) => {
            builder.format(|buf, record| {
                use std::io::Write;
                writeln!(buf, "[{:<5} {}] {}", record.level(), Local::now().format("%H:%M:%S"), record.args())
            });
        }
        None => {}
    }
    builder.target(env_logger::Target::Stderr);
    if let Some(path) = args.log_path.as_ref() {
        match std::fs::File::create(path) {
            Ok(f) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
            Err(e) => eprintln!("Failed to open log file {}: {}", path, e),
        }
    }
    builder.init();
}

fn run_config(args: &Args) -> RunConfig {
    RunConfig {
        pid: args.pid,
        tid: args.tid,
        events: args.events.clone(),
        raw_filter: args.raw_filter.clone(),
        filters: args.filters.clone(),
        display_fields: args.fields.clone(),
        duration_secs: args.duration,
        stats_only: args.stats_only,
        file: args.file.as_ref().map(PathBuf::from),
        file_glob: args.file_glob.clone(),
        recursive: args.recursive,
        providers: args.providers.clone(),
        width: args.width,
        progress: args.progress,
    }
}

fn execute(cfg: &RunConfig) -> Result<()> {
    let filter = cfg.filter_spec().unwrap_or_else(|e| bail(&e.to_string()));
    let columns = cfg.display_columns().unwrap_or_else(|e| bail(&e.to_string()));
    let width = terminal_width(cfg.width);
    log::debug!("table width budget {}", width);
    let mut source = source::open_source(cfg)?;
    println!("Processing start time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let processor = processor::select_processor(cfg.stats_only, &columns, width, Box::new(std::io::stdout()))?;
    let shutdown = Arc::new(ShutdownCoordinator::new());
    dispatcher::install_interrupt_handler(Arc::clone(&shutdown)).context("failed to install Ctrl+C handler")?;
    if cfg.duration_secs > 0 {
        let _timer = dispatcher::spawn_timer(Arc::clone(&shutdown), cfg.duration_secs);
    }
    let mut dispatcher = Dispatcher::new(filter, processor, shutdown, Box::new(std::io::stdout()));
    let res = dispatcher.run(source.as_mut());
    if let Err(e) = &res { log::error!("event stream failed: {:#}", e); }
    dispatcher.shutdown(source.as_mut());
    res
}

fn terminal_width(override_width: Option<usize>) -> usize {
    let term = if std::io::stdout().is_terminal() { crossterm::terminal::size().ok().map(|(c, _)| c) } else { None };
    resolve_width(override_width, term, std::env::var("COLUMNS").ok().as_deref())
}

fn resolve_width(override_width: Option<usize>, term_cols: Option<u16>, columns_env: Option<&str>) -> usize {
    if let Some(w) = override_width && w > 0 { return w; }
    if let Some(c) = term_cols && c > 0 { return c as usize; }
    columns_env.and_then(|s| s.trim().parse::<usize>().ok()).filter(|&w| w > 0).unwrap_or(DEFAULT_WIDTH)
}

fn bail(msg: &str) -> ! {
    eprintln!("{}", paint(&format!("ERROR: {}", msg), "31"));
    std::process::exit(1);
}

fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&false) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}
