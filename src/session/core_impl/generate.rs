use std::collections::BTreeMap;

use crate::common::ThreadId;
use crate::transport::Transport;

use super::{NewlyStopped, SessionCore};
use crate::session::events::{DebugEvent, DebugEventKind};

impl<T: Transport> SessionCore<T> {
    /// Turn the stops observed since the last pass into debugger events.
    ///
    /// Runs only once event generation is armed, either by the last expected
    /// attention arriving or by the interrupt timing out. Accidental stops
    /// are resumed silently, pending interrupts are resolved, and every
    /// other new stop is reported once.
    pub fn generate_events_and_resume_stopped_threads(&self) {
        if let Some(newly_stopped) = self.take_newly_stopped() {
            self.report_newly_stopped(newly_stopped);
        }
    }

    /// Claim the stops of this pass and close the interrupt cycle.
    ///
    /// Done under one lock so attention processed while the pass runs arms
    /// the next pass instead of being lost.
    pub(super) fn take_newly_stopped(&self) -> Option<Vec<NewlyStopped>> {
        let mut attention = self.attention();
        if attention.interrupt_sent && !attention.trigger_events {
            let timed_out = attention
                .interrupt_time
                .map_or(false, |t| t.elapsed() > self.config.interrupt_timeout);
            if timed_out {
                log::debug!("interrupt timed out, generating events");
                attention.trigger_events = true;
            }
        }
        if !attention.trigger_events {
            return None;
        }

        attention.interrupt_sent = false;
        attention.trigger_events = false;
        attention.interrupt_time = None;
        attention.expected_attention_events = 0;
        Some(std::mem::take(&mut attention.newly_stopped))
    }

    pub(super) fn report_newly_stopped(&self, newly_stopped: Vec<NewlyStopped>) {
        let mut accidental = Vec::new();
        let mut report = Vec::new();
        {
            let mut threads = self.threads();
            for stop in newly_stopped {
                let thread = match threads.registry.lookup_mut(&stop.id) {
                    Ok(thread) if thread.is_stopped() && !thread.reported() => thread,
                    _ => continue,
                };
                if stop.interrupted {
                    thread.report_as_stopped();
                } else if stop.accidental {
                    accidental.push(stop.id);
                } else {
                    thread.report_as_stopped();
                    report.push(stop.id);
                }
            }
        }

        self.resume_accidentally_stopped_threads(&accidental);
        self.generate_events_for_pending_interrupts();
        self.generate_events_for_stopped_threads(report);
    }

    fn resume_accidentally_stopped_threads(&self, ids: &[ThreadId]) {
        let mut per_tile: BTreeMap<u32, Vec<ThreadId>> = BTreeMap::new();
        for id in ids {
            per_tile.entry(id.tile).or_default().push(*id);
        }

        for (tile, ids) in per_tile {
            log::debug!("resuming {} accidentally stopped thread(s) on tile {}", ids.len(), tile);
            if let Err(e) = self.resume_threads(tile, &ids) {
                log::warn!("resuming accidentally stopped threads failed: {}", e);
            }
        }
    }

    fn generate_events_for_pending_interrupts(&self) {
        let pending: Vec<_> = self.interrupts().pending.drain(..).collect();
        for p in pending {
            let kind = if p.stopped {
                DebugEventKind::ThreadStopped(p.thread)
            } else {
                DebugEventKind::ThreadUnavailable(p.thread)
            };
            self.events.push(DebugEvent::new(kind));
        }
    }

    fn generate_events_for_stopped_threads(&self, mut ids: Vec<ThreadId>) {
        ids.sort();
        ids.dedup();
        for id in ids {
            let thread = self.to_device_thread(&id);
            self.events
                .push(DebugEvent::new(DebugEventKind::ThreadStopped(thread)));
        }
    }
}
