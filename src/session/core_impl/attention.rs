//! Attention processing: turning raised attention into thread stops.

use std::time::Instant;

use crate::arch::Arch;
use crate::common::{MemoryHandle, ThreadId};
use crate::sip::fifo::{FifoControl, FifoNode};
use crate::sip::header::FifoDesc;
use crate::transport::{AttentionEvent, PageFaultEvent, Transport};
use crate::util::{lock, log_bitmask};

use super::connection::BindInfo;
use super::{NewlyStopped, SessionCore, ThreadsState};
use crate::session::events::{DebugEvent, DebugEventKind, PageFaultReason};
use crate::session::state_save::{sr_ident, thread_stop_state};
use crate::session::DebugError;

impl<T: Transport> SessionCore<T> {
    /// Handle an attention event from the driver. Root only.
    pub(super) fn handle_attention_event(&self, event: &AttentionEvent) {
        let target = match self.core_for_tile(event.tile) {
            Some(target) => target,
            None => {
                log::warn!("attention on unknown tile {}", event.tile);
                return;
            }
        };

        if target.interrupt_sent() {
            let last = self
                .root_state()
                .and_then(|root| lock(&root.hw).interrupt_seqno.get(event.tile as usize).copied())
                .unwrap_or(0);
            if event.header.seqno <= last {
                log::debug!(
                    "attention seqno {} predates interrupt seqno {}, ignoring",
                    event.header.seqno,
                    last
                );
                return;
            }
        }

        target.new_attention_raised();

        let vm = match self.connection().and_then(|c| c.resolve_vm(event.context, event.lrc)) {
            Some(vm) => vm,
            None => {
                log::warn!(
                    "attention for unknown context {} (lrc {})",
                    event.context,
                    event.lrc
                );
                return;
            }
        };

        log_bitmask("attention", &event.bitmask);
        let threads =
            T::Arch::threads_from_attention_bitmask(&self.topology.geometry, event.tile, &event.bitmask);

        if let Err(e) = target.process_attention(vm, &threads, false) {
            log::warn!("attention processing failed: {}", e);
        }
        target.check_trigger_events_for_attention();
    }

    /// Handle a page fault reported by the driver. Root only.
    pub(super) fn handle_page_fault(&self, event: &PageFaultEvent) {
        let target = match self.core_for_tile(event.tile) {
            Some(target) => target,
            None => {
                log::warn!("page fault on unknown tile {}", event.tile);
                return;
            }
        };

        log::debug!("page fault at {:#x} on tile {}", event.address, event.tile);
        log_bitmask("page fault", &event.bitmask);
        let threads =
            T::Arch::threads_from_attention_bitmask(&self.topology.geometry, event.tile, &event.bitmask);

        target.events.push(DebugEvent::new(DebugEventKind::PageFault {
            address: event.address,
            mask: mask_of(&event.bitmask),
            reason: PageFaultReason::MappingError,
        }));

        let vm = match self.connection().and_then(|c| c.resolve_vm(event.context, event.lrc)) {
            Some(vm) => vm,
            None => {
                log::warn!("page fault for unknown context {}", event.context);
                return;
            }
        };

        if let Err(e) = target.process_attention(vm, &threads, true) {
            log::warn!("page fault processing failed: {}", e);
        }
        target.check_trigger_events_for_attention();
    }

    /// Check `threads` against the save area of `vm` and record every one
    /// that parked in SIP.
    pub(super) fn process_attention(
        &self,
        vm: MemoryHandle,
        threads: &[ThreadId],
        page_fault: bool,
    ) -> Result<(), DebugError> {
        let header = self.state_save_header().ok_or(DebugError::Uninitialized)?;
        let css = self.context_save_area(vm).ok_or(DebugError::Uninitialized)?;

        let mut guard = self.threads();
        let ThreadsState { registry, scratch } = &mut *guard;

        let candidates = registry.not_stopped(threads);
        if candidates.is_empty() {
            return Ok(());
        }

        let size = css.len as usize;
        if scratch.len() < size {
            scratch.resize(size, 0);
        }
        let area = &mut scratch[..size];
        self.transport.read_gpu_memory(vm, css.va, area)?;
        let area = &*area;

        let mut stopped = Vec::new();
        for id in candidates {
            let ident = match sr_ident(&header, area, &id) {
                Some(ident) => ident,
                None => {
                    log::debug!("{}: no system routine ident", id);
                    continue;
                }
            };
            if ident.count == 0 {
                continue;
            }

            let thread = registry.lookup_mut(&id)?;
            if !thread.verify_stopped(ident.count) {
                continue;
            }
            thread.stop_thread(vm);
            if page_fault {
                thread.set_page_fault(true);
            }

            let api = self.to_device_thread(&id);
            let interrupted = {
                let mut interrupts = self.interrupts();
                let mut matched = false;
                for p in interrupts.pending.iter_mut().filter(|p| p.thread.contains(&api)) {
                    p.stopped = true;
                    matched = true;
                }
                matched
            };

            let accidental = !interrupted
                && thread_stop_state(&header, area, &id).map_or(false, |state| {
                    self.config
                        .stop_classifier
                        .is_accidental_stop(header.version, &state)
                });

            stopped.push(NewlyStopped {
                id,
                interrupted,
                accidental,
            });
        }

        if !stopped.is_empty() {
            log::debug!("{} thread(s) stopped in vm {:#x}", stopped.len(), vm);
            self.attention().newly_stopped.extend(stopped);
        }
        Ok(())
    }

    /// Drain the attention FIFO of every context save area this core
    /// tracks. Rate limited by the configured poll interval.
    pub fn poll_fifo(&self) {
        {
            let mut last = lock(&self.last_fifo_poll);
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.config.fifo_poll_interval {
                    return;
                }
            }
            *last = Some(now);
        }

        let fifo = match self.state_save_header().and_then(|h| h.fifo) {
            Some(fifo) => fifo,
            None => return,
        };

        for (vm, css, tile) in self.context_save_areas() {
            let batch = match self.read_fifo(vm, css, &fifo, tile) {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("fifo read of vm {:#x} failed: {}", vm, e);
                    continue;
                }
            };
            if batch.threads.is_empty() {
                continue;
            }

            log::debug!("fifo reported {} thread(s) in vm {:#x}", batch.threads.len(), vm);
            // Nodes stay published until their threads are classified, so a
            // failed pass is replayed by the next poll.
            if let Err(e) = self.process_attention(vm, &batch.threads, false) {
                log::warn!("fifo attention processing failed, leaving nodes queued: {}", e);
                continue;
            }
            self.new_attention_raised();
            if let Err(e) = self.consume_fifo(vm, &batch) {
                log::warn!("fifo consume of vm {:#x} failed: {}", vm, e);
            }
            self.check_trigger_events_for_attention();
        }
    }

    /// Collect the valid nodes of one FIFO without consuming them.
    fn read_fifo(
        &self,
        vm: MemoryHandle,
        css: BindInfo,
        fifo: &FifoDesc,
        tile: u32,
    ) -> Result<FifoBatch, DebugError> {
        let base = css.va + fifo.offset as u64;
        let mut raw = [0; FifoControl::SIZE];
        self.transport.read_gpu_memory(vm, base, &mut raw)?;
        let control = FifoControl::parse(&raw).map_err(|_| DebugError::Unknown)?;

        let mut batch = FifoBatch {
            control: base,
            nodes: Vec::new(),
            threads: Vec::new(),
            tail: 0,
        };
        if control.capacity == 0 {
            return Ok(batch);
        }

        let nodes = base + FifoControl::SIZE as u64;
        let head = control.head % control.capacity;
        let mut tail = control.tail % control.capacity;
        while tail != head {
            let address = nodes + (tail as u64) * FifoNode::SIZE as u64;
            let mut raw = [0; FifoNode::SIZE];
            self.transport.read_gpu_memory(vm, address, &mut raw)?;
            let node = FifoNode::from_bytes(raw);
            if !node.is_valid() {
                log::debug!("fifo node {} not yet valid", tail);
                break;
            }

            batch.threads.push(node.thread_id(tile));
            batch.nodes.push(address);
            tail = (tail + 1) % control.capacity;
        }
        batch.tail = tail;
        Ok(batch)
    }

    /// Zero the nodes of `batch` and hand their slots back to the firmware.
    fn consume_fifo(&self, vm: MemoryHandle, batch: &FifoBatch) -> Result<(), DebugError> {
        for address in &batch.nodes {
            self.transport
                .write_gpu_memory(vm, *address, &[0; FifoNode::SIZE])?;
        }
        self.transport.write_gpu_memory(
            vm,
            batch.control + FifoControl::TAIL_OFFSET as u64,
            &batch.tail.to_le_bytes(),
        )?;
        Ok(())
    }
}

/// Valid nodes read from one FIFO, not yet consumed.
struct FifoBatch {
    /// Address of the control block.
    control: u64,
    nodes: Vec<u64>,
    threads: Vec<ThreadId>,
    /// Tail after consuming `nodes`.
    tail: u32,
}

/// Low 64 bits of a fault bitmask.
fn mask_of(bitmask: &[u8]) -> u64 {
    bitmask
        .iter()
        .take(8)
        .enumerate()
        .fold(0, |mask, (i, b)| mask | ((*b as u64) << (8 * i)))
}
