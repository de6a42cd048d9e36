use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use anyhow::Result;
use chrono::{DateTime, Local};
use crate::event::Event;
use crate::filter::{Decision, FilterSpec};
use crate::processor::{Output, Processor};
use crate::source::EventSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason { EndOfStream, Timeout, Interrupt }

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { ShutdownReason::EndOfStream => "end of stream", ShutdownReason::Timeout => "run duration elapsed", ShutdownReason::Interrupt => "interrupted" })
    }
}

/// Shared between the dispatcher, the run timer and the interrupt handler.
/// Triggers only ask for a stop; the close sequence runs once, on the
/// dispatcher thread, behind `begin_close`.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    reason: OnceLock<ShutdownReason>,
    closed: AtomicBool,
    interrupts: AtomicU32,
}

impl ShutdownCoordinator {
    pub fn new() -> Self { Self::default() }

    /// Returns true for the first trigger only.
    pub fn request(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.requested.store(true, Ordering::SeqCst);
        if first { log::info!("shutdown requested: {}", reason); }
        first
    }

    /// Records one Ctrl+C. Only a repeated interrupt returns true; earlier
    /// triggers from other sources do not count.
    pub fn interrupt(&self) -> bool {
        let seen = self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.request(ShutdownReason::Interrupt);
        seen > 0
    }

    pub fn is_requested(&self) -> bool { self.requested.load(Ordering::SeqCst) }

    pub fn reason(&self) -> Option<ShutdownReason> { self.reason.get().copied() }

    pub fn begin_close(&self) -> bool { self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() }
}

pub fn spawn_timer(shutdown: Arc<ShutdownCoordinator>, secs: u64) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(secs));
        shutdown.request(ShutdownReason::Timeout);
    })
}

pub fn install_interrupt_handler(shutdown: Arc<ShutdownCoordinator>) -> Result<()> {
    ctrlc::set_handler(move || {
        if shutdown.interrupt() {
            log::warn!("second interrupt, exiting without summary");
            std::process::exit(130);
        }
    })?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub processed: u64,
    pub displayed: u64,
    pub lost: u64,
}

#[derive(Clone, Debug)]
pub struct Summary {
    pub ended: DateTime<Local>,
    pub elapsed: Duration,
    pub counters: RunCounters,
    pub reason: Option<ShutdownReason>,
    pub close_errors: Vec<String>,
}

pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}.{:03}", secs / 3600, (secs / 60) % 60, secs % 60, d.subsec_millis())
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{:<30} {}", "Processing end time:", self.ended.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "{:<30} {}", "Processing duration:", format_elapsed(self.elapsed))?;
        writeln!(f, "{:<30} {}", "Processed events:", self.counters.processed)?;
        writeln!(f, "{:<30} {}", "Displayed events:", self.counters.displayed)?;
        writeln!(f, "{:<30} {}", "Events lost:", self.counters.lost)?;
        for e in &self.close_errors { writeln!(f, "{:<30} {}", "Close error:", e)?; }
        Ok(())
    }
}

pub struct Dispatcher {
    filter: FilterSpec,
    processor: Box<dyn Processor>,
    counters: RunCounters,
    shutdown: Arc<ShutdownCoordinator>,
    started: Instant,
    out: Output,
}

impl Dispatcher {
    pub fn new(filter: FilterSpec, processor: Box<dyn Processor>, shutdown: Arc<ShutdownCoordinator>, out: Output) -> Self {
        Self { filter, processor, counters: RunCounters::default(), shutdown, started: Instant::now(), out }
    }

    pub fn counters(&self) -> RunCounters { self.counters }

    /// One event, start to finish. Failures stay with the event.
    pub fn handle(&mut self, e: &Event) {
        self.counters.processed += 1;
        let res = match self.filter.evaluate(e) {
            Decision::Drop => return,
            Decision::Forward => self.processor.consume(e),
            Decision::ForwardRendered(raw) => self.processor.consume_rendered(e, &raw),
        };
        self.counters.displayed += 1;
        if let Err(err) = res { log::warn!("failed to output event {} (pid {}): {:#}", e.name, e.pid, err); }
    }

    pub fn run(&mut self, source: &mut dyn EventSource) -> Result<()> {
        let shutdown = Arc::clone(&self.shutdown);
        source.start()?;
        let res = source.process(&shutdown, &mut |e: &Event| self.handle(e));
        shutdown.request(ShutdownReason::EndOfStream);
        res
    }

    /// Finalize, close the source, print the summary. Only the first call does
    /// anything.
    pub fn shutdown(&mut self, source: &mut dyn EventSource) -> Option<Summary> {
        if !self.shutdown.begin_close() { return None; }
        let mut close_errors = Vec::new();
        if let Err(e) = self.processor.finalize() {
            log::error!("finalizing output failed: {:#}", e);
            close_errors.push(format!("{:#}", e));
        }
        if let Err(e) = source.stop() {
            log::error!("closing the event source failed: {:#}", e);
            close_errors.push(format!("{:#}", e));
        }
        self.counters.lost = source.events_lost();
        let summary = Summary { ended: Local::now(), elapsed: self.started.elapsed(), counters: self.counters, reason: self.shutdown.reason(), close_errors };
        if let Err(e) = write!(self.out, "{}", summary).and_then(|_| self.out.flush()) { log::error!("failed to print summary: {}", e); }
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::sample_event;
    use crate::processor::testing::SharedBuf;
    use crate::processor::{RawPrinter, StatsAggregator};
    use crate::source::testing::VecSource;

    fn dispatcher(filter: FilterSpec, processor: Box<dyn Processor>, out: &SharedBuf) -> Dispatcher {
        Dispatcher::new(filter, processor, Arc::new(ShutdownCoordinator::new()), Box::new(out.clone()))
    }

    fn no_filter() -> FilterSpec { FilterSpec::new(None, None, &[], None, &[]).unwrap() }

    fn headlines(text: &str) -> Vec<String> {
        text.lines().filter(|l| !l.starts_with("  ")).map(|l| l.to_string()).collect()
    }

    #[test]
    fn pid_filter_end_to_end() {
        let names = ["X", "X", "Y", "X", "Z"];
        let pids = [100, 200, 100, 100, 300];
        let events: Vec<Event> = names.iter().zip(pids).enumerate().map(|(i, (n, p))| sample_event(n, &format!("proc{}", i + 1), p, 1)).collect();
        let out = SharedBuf::default();
        let summary_out = SharedBuf::default();
        let filter = FilterSpec::new(Some(100), None, &[], None, &[]).unwrap();
        let mut d = dispatcher(filter, Box::new(RawPrinter::new(Box::new(out.clone()))), &summary_out);
        let mut src = VecSource::new(events);
        d.run(&mut src).unwrap();
        let s = d.shutdown(&mut src).unwrap();
        assert_eq!(s.counters, RunCounters { processed: 5, displayed: 3, lost: 0 });
        let heads = headlines(&out.text());
        assert_eq!(heads.len(), 3);
        assert!(heads[0].starts_with("X [PNAME=proc1 PID=100"));
        assert!(heads[1].starts_with("Y [PNAME=proc3 PID=100"));
        assert!(heads[2].starts_with("X [PNAME=proc4 PID=100"));
        assert_eq!(s.reason, Some(ShutdownReason::EndOfStream));
    }

    #[test]
    fn processed_counts_every_event() {
        let out = SharedBuf::default();
        let filter = FilterSpec::new(None, None, &["nothing-matches".to_string()], None, &[]).unwrap();
        let mut d = dispatcher(filter, Box::new(RawPrinter::new(Box::new(out.clone()))), &out);
        for i in 0..7 {
            d.handle(&sample_event("E", "p", i, 1));
            assert_eq!(d.counters().processed, i as u64 + 1);
        }
        assert_eq!(d.counters().displayed, 0);
    }

    struct FailOn { bad: &'static str, seen: Arc<std::sync::Mutex<Vec<String>>> }

    impl Processor for FailOn {
        fn consume(&mut self, e: &Event) -> Result<()> {
            if e.name == self.bad { anyhow::bail!("cannot render {}", e.name); }
            self.seen.lock().unwrap().push(e.name.clone());
            Ok(())
        }
        fn consume_rendered(&mut self, e: &Event, _raw: &str) -> Result<()> { self.consume(e) }
        fn finalize(&mut self) -> Result<()> { Ok(()) }
    }

    #[test]
    fn failing_event_does_not_stop_the_stream() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let processor = FailOn { bad: "B", seen: Arc::clone(&seen) };
        let mut d = dispatcher(no_filter(), Box::new(processor), &SharedBuf::default());
        let mut src = VecSource::new(["A", "B", "C", "D"].iter().map(|n| sample_event(n, "p", 1, 1)).collect());
        d.run(&mut src).unwrap();
        let s = d.shutdown(&mut src).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["A", "C", "D"]);
        assert_eq!(s.counters.processed, 4);
        assert_eq!(s.counters.displayed, 4);
    }

    #[test]
    fn field_filter_match_is_forwarded_once() {
        let out = SharedBuf::default();
        let filter = FilterSpec::new(None, None, &[], None, &["Event=^foo$".to_string(), "PID=^5$".to_string()]).unwrap();
        let mut d = dispatcher(filter, Box::new(RawPrinter::new(Box::new(out.clone()))), &SharedBuf::default());
        d.handle(&sample_event("foo", "p", 5, 1));
        assert_eq!(d.counters().displayed, 1);
        assert_eq!(headlines(&out.text()).len(), 1);
    }

    #[test]
    fn summary_printed_once_and_source_closed_once() {
        let out = SharedBuf::default();
        let proc_out = SharedBuf::default();
        let mut d = dispatcher(no_filter(), Box::new(StatsAggregator::new(Box::new(proc_out.clone()))), &out);
        let mut src = VecSource::new(vec![sample_event("A", "p", 1, 1)]);
        src.lost = 4;
        d.run(&mut src).unwrap();
        assert!(d.shutdown(&mut src).is_some());
        assert!(d.shutdown(&mut src).is_none());
        assert_eq!(src.stopped, 1);
        let text = out.text();
        assert_eq!(text.matches("Processed events:").count(), 1);
        assert!(text.contains(&format!("{:<30} {}", "Events lost:", 4)));
        assert_eq!(proc_out.text().matches("Events by name").count(), 1);
    }

    #[test]
    fn close_failure_still_prints_summary() {
        let out = SharedBuf::default();
        let mut d = dispatcher(no_filter(), Box::new(RawPrinter::new(Box::new(SharedBuf::default()))), &out);
        let mut src = VecSource::new(vec![]);
        src.fail_stop = true;
        d.run(&mut src).unwrap();
        let s = d.shutdown(&mut src).unwrap();
        assert_eq!(s.close_errors, vec!["session already gone".to_string()]);
        assert!(out.text().contains("Displayed events:"));
    }

    #[test]
    fn requested_shutdown_stops_intake() {
        let out = SharedBuf::default();
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let mut d = Dispatcher::new(no_filter(), Box::new(RawPrinter::new(Box::new(out.clone()))), Arc::clone(&shutdown), Box::new(SharedBuf::default()));
        shutdown.request(ShutdownReason::Timeout);
        let mut src = VecSource::new(vec![sample_event("A", "p", 1, 1)]);
        d.run(&mut src).unwrap();
        assert_eq!(d.counters().processed, 0);
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Timeout));
    }

    #[test]
    fn racing_triggers_close_exactly_once() {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let handles: Vec<_> = (0..8).map(|i| {
            let s = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let reason = if i % 2 == 0 { ShutdownReason::Timeout } else { ShutdownReason::Interrupt };
                let first = s.request(reason);
                (first, s.begin_close())
            })
        }).collect();
        let results: Vec<(bool, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.0).count(), 1);
        assert_eq!(results.iter().filter(|r| r.1).count(), 1);
        assert!(shutdown.is_requested());
        assert!(!shutdown.begin_close());
    }

    #[test]
    fn first_interrupt_after_timer_is_not_fatal() {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        spawn_timer(Arc::clone(&shutdown), 0).join().unwrap();
        assert!(!shutdown.interrupt());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Timeout));
        assert!(shutdown.begin_close());
        assert!(shutdown.interrupt());
    }

    #[test]
    fn first_interrupt_after_end_of_stream_still_closes() {
        let out = SharedBuf::default();
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let mut d = Dispatcher::new(no_filter(), Box::new(RawPrinter::new(Box::new(SharedBuf::default()))), Arc::clone(&shutdown), Box::new(out.clone()));
        let mut src = VecSource::new(vec![sample_event("A", "p", 1, 1)]);
        d.run(&mut src).unwrap();
        assert!(!shutdown.interrupt());
        assert!(d.shutdown(&mut src).is_some());
        assert!(out.text().contains("Processed events:"));
    }

    #[test]
    fn timer_requests_shutdown() {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        spawn_timer(Arc::clone(&shutdown), 0).join().unwrap();
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Timeout));
    }

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed(Duration::from_millis(3_723_045)), "01:02:03.045");
    }
}
