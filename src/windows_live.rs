use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::time::Duration as StdDuration;
use anyhow::Result;
use windows_sys::Win32::System::EventLog::*;
use windows_sys::Win32::Foundation::GetLastError;
use crate::dispatcher::ShutdownCoordinator;
use crate::event::Event;
use crate::event_xml::parse_event;
use crate::source::{EventSource, offer};

const POLL: StdDuration = StdDuration::from_millis(100);
const QUEUE_DEPTH: usize = 4096;

struct Handle(EVT_HANDLE);
impl Drop for Handle { fn drop(&mut self) { unsafe { EvtClose(self.0); } } }

fn w(s: &str) -> Vec<u16> { let mut v = s.encode_utf16().collect::<Vec<u16>>(); v.push(0); v }

/// Rendered XML, or `None` when the record could not be rendered.
type Delivery = Option<String>;

struct CallbackCtx { tx: SyncSender<Delivery>, dropped: Arc<AtomicU64> }

unsafe fn render_xml(ev: EVT_HANDLE) -> Option<String> {
    let mut used: u32 = 0;
    let mut count: u32 = 0;
    let ok = unsafe { EvtRender(0, ev, EvtRenderEventXml, 0, ptr::null_mut(), &mut used, &mut count) };
    let need = if ok == 0 { used } else { 0 };
    if need == 0 { return None; }
    let mut buf: Vec<u16> = vec![0u16; (need as usize).div_ceil(2)];
    if unsafe { EvtRender(0, ev, EvtRenderEventXml, need, buf.as_mut_ptr() as *mut _, &mut used, &mut count) } != 0 {
        let s = String::from_utf16_lossy(&buf);
        Some(s.trim_matches(char::from(0)).to_string())
    } else { None }
}

unsafe extern "system" fn callback(action: EVT_SUBSCRIBE_NOTIFY_ACTION, user: *const core::ffi::c_void, event: EVT_HANDLE) -> u32 {
    let c = unsafe { &*(user as *const CallbackCtx) };
    let delivery = if action == EvtSubscribeActionDeliver { unsafe { render_xml(event) } } else { None };
    offer(&c.tx, &c.dropped, delivery);
    0
}

/// Real-time subscription to one or more event log channels.
pub struct LiveSource {
    channels: Vec<String>,
    subs: Vec<Handle>,
    ctx_ptrs: Vec<*mut CallbackCtx>,
    rx: Option<Receiver<Delivery>>,
    lost: u64,
    // deliveries refused because the queue was full
    dropped: Arc<AtomicU64>,
}

impl LiveSource {
    pub fn new(channels: Vec<String>) -> Self { Self { channels, subs: Vec::new(), ctx_ptrs: Vec::new(), rx: None, lost: 0, dropped: Arc::new(AtomicU64::new(0)) } }
}

impl EventSource for LiveSource {
    fn start(&mut self) -> Result<()> {
        let (tx, rx) = sync_channel::<Delivery>(QUEUE_DEPTH);
        for ch in &self.channels {
            let path_w = w(ch);
            let query_w = w("*");
            let ctx = Box::into_raw(Box::new(CallbackCtx { tx: tx.clone(), dropped: Arc::clone(&self.dropped) }));
            let h = unsafe { EvtSubscribe(0, ptr::null_mut(), path_w.as_ptr(), query_w.as_ptr(), 0, ctx as *const _, Some(callback), EvtSubscribeToFutureEvents) };
            if h == 0 {
                let code = unsafe { GetLastError() };
                log::warn!("cannot subscribe to {}: error {}", ch, code);
                unsafe { drop(Box::from_raw(ctx)); }
                continue;
            }
            log::info!("subscribed to {}", ch);
            self.ctx_ptrs.push(ctx);
            self.subs.push(Handle(h));
        }
        if self.subs.is_empty() { anyhow::bail!("none of the requested channels could be subscribed: {}", self.channels.join(",")); }
        self.rx = Some(rx);
        Ok(())
    }

    fn process(&mut self, shutdown: &ShutdownCoordinator, on_event: &mut dyn FnMut(&Event)) -> Result<()> {
        let Some(rx) = self.rx.as_ref() else { anyhow::bail!("live source was not started") };
        while !shutdown.is_requested() {
            match rx.recv_timeout(POLL) {
                Ok(Some(xml)) => match parse_event(&xml) {
                    Some(e) => on_event(&e),
                    None => self.lost += 1,
                },
                Ok(None) => self.lost += 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // closing the subscriptions guarantees no callback still holds a context
        self.subs.clear();
        for ptr in self.ctx_ptrs.drain(..) { unsafe { drop(Box::from_raw(ptr)); } }
        self.rx = None;
        Ok(())
    }

    fn events_lost(&self) -> u64 { self.lost + self.dropped.load(Ordering::Relaxed) }
}

impl Drop for LiveSource {
    fn drop(&mut self) { let _ = self.stop(); }
}
