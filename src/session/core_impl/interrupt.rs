use std::collections::BTreeSet;
use std::time::Instant;

use crate::common::DeviceThread;
use crate::transport::{EuControl, EuControlCmd, Transport};
use crate::util::lock;

use super::{PendingInterrupt, SessionCore};
use crate::session::events::{DebugEvent, DebugEventKind};
use crate::session::DebugError;

impl<T: Transport> SessionCore<T> {
    /// Queue an interrupt of `thread`. The request is sent by the worker.
    pub fn interrupt(&self, thread: DeviceThread) -> Result<(), DebugError> {
        self.check_attached()?;

        let selected: Vec<_> = {
            let threads = self.threads();
            self.topology
                .tiles_for(self.scope(), &thread)
                .into_iter()
                .flat_map(|tile| self.select_threads(&threads.registry, tile, &thread))
                .map(|id| threads.registry.lookup(&id).map(|t| t.is_stopped()))
                .collect::<Result<_, _>>()?
        };
        if selected.is_empty() {
            return Err(DebugError::InvalidArgument);
        }
        if selected.iter().all(|stopped| *stopped) {
            log::debug!("interrupt of {}: already stopped", thread);
            return Err(DebugError::NotAvailable);
        }

        let mut interrupts = self.interrupts();
        let in_flight = interrupts.requests.contains(&thread)
            || interrupts.pending.iter().any(|p| p.thread == thread);
        if in_flight {
            return Err(DebugError::NotReady);
        }

        log::debug!("interrupt of {} queued", thread);
        interrupts.requests.push(thread);
        Ok(())
    }

    /// Send queued interrupt requests to the hardware.
    pub fn send_interrupts(&self) {
        if self.attention().interrupt_sent {
            return;
        }

        let requests = {
            let mut interrupts = self.interrupts();
            if interrupts.requests.is_empty() {
                return;
            }
            let requests: Vec<_> = interrupts.requests.drain(..).collect();
            interrupts.pending.extend(requests.iter().map(|&thread| PendingInterrupt {
                thread,
                stopped: false,
            }));
            requests
        };

        let devices: BTreeSet<u32> = requests
            .iter()
            .flat_map(|thread| self.topology.tiles_for(self.scope(), thread))
            .collect();

        let mut expected = 0;
        for tile in devices {
            let result = {
                let _threads = self.threads();
                self.interrupt_imp(tile)
            };
            match result {
                Ok(()) => expected += 1,
                Err(e) => log::warn!("interrupt of tile {} failed: {}", tile, e),
            }
        }

        if expected == 0 {
            let pending: Vec<_> = self.interrupts().pending.drain(..).collect();
            for p in pending {
                self.events
                    .push(DebugEvent::new(DebugEventKind::ThreadUnavailable(p.thread)));
            }
            return;
        }

        let mut attention = self.attention();
        attention.expected_attention_events = expected;
        attention.interrupt_sent = true;
        attention.interrupt_time = Some(Instant::now());
    }

    /// Interrupt every thread of `tile`, through the root.
    fn interrupt_imp(&self, tile: u32) -> Result<(), DebugError> {
        self.with_root(|core, root| {
            let client = lock(&root.connection).client.ok_or(DebugError::Uninitialized)?;
            let request = EuControl {
                client,
                tile,
                cmd: EuControlCmd::InterruptAll,
            };
            let seqno = core.transport.eu_control(request, &mut [])?;
            log::debug!("interrupted tile {} (seqno {})", tile, seqno);

            let mut hw = lock(&root.hw);
            if let Some(last) = hw.interrupt_seqno.get_mut(tile as usize) {
                *last = seqno;
            }
            hw.interrupted_device = Some(tile);
            hw.resumed_devices.retain(|t| *t != tile);
            Ok(())
        })?
    }

    /// Whether an interrupt is outstanding on this core.
    pub fn interrupt_sent(&self) -> bool {
        self.attention().interrupt_sent
    }

    /// Count one attention event against the interrupt in flight.
    pub(super) fn new_attention_raised(&self) {
        let mut attention = self.attention();
        if attention.expected_attention_events > 0 {
            attention.expected_attention_events -= 1;
        }
    }

    /// Arm event generation once every expected attention has arrived and
    /// there is something to report.
    pub(super) fn check_trigger_events_for_attention(&self) {
        let pending = !self.interrupts().pending.is_empty();
        let mut attention = self.attention();
        if (pending || !attention.newly_stopped.is_empty())
            && attention.expected_attention_events == 0
        {
            attention.trigger_events = true;
        }
    }
}
