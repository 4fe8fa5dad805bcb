use std::thread;

use crate::arch::Arch;
use crate::common::{DeviceThread, MemoryHandle, ThreadId};
use crate::sip::command::{SipCommand, SipCommandKind};
use crate::sip::{RegsetType, SrIdent, StateSaveAreaHeader};
use crate::transport::{EuControl, EuControlCmd, Transport};
use crate::util::lock;

use super::access::RegisterIo;
use super::connection::DebugAreaState;
use super::SessionCore;
use crate::session::registry::ThreadRegistry;
use crate::session::state_save::regset_descriptor;
use crate::session::DebugError;

/// Bit of the saved thread state that tells version 1 firmware to resume.
const RESUME_WA_BIT: u32 = 0x4000_0000;

impl<T: Transport> SessionCore<T> {
    /// Resume the stopped threads selected by `thread`.
    ///
    /// Fails with [`DebugError::NotAvailable`] if no selected thread is
    /// stopped, or if the save area shows a selected thread outside SIP.
    pub fn resume(&self, thread: DeviceThread) -> Result<(), DebugError> {
        self.check_attached()?;

        let devices = self.topology.tiles_for(self.scope(), &thread);
        if devices.is_empty() {
            return Err(DebugError::InvalidArgument);
        }

        let mut resumed = false;
        for tile in devices {
            let targets = {
                let threads = self.threads();
                self.select_threads(&threads.registry, tile, &thread)
            };
            resumed |= self.resume_threads_verified(tile, &targets, true)?;
        }

        if !resumed {
            log::debug!("resume of {}: nothing stopped", thread);
            return Err(DebugError::NotAvailable);
        }
        Ok(())
    }

    /// Resume the stopped threads among `ids`, all on `tile`, without
    /// checking the save area first.
    pub(super) fn resume_threads(&self, tile: u32, ids: &[ThreadId]) -> Result<bool, DebugError> {
        self.resume_threads_verified(tile, ids, false)
    }

    fn resume_threads_verified(
        &self,
        tile: u32,
        ids: &[ThreadId],
        verify: bool,
    ) -> Result<bool, DebugError> {
        let header = self.state_save_header();
        let mut threads = self.threads();

        let targets: Vec<(ThreadId, MemoryHandle)> = ids
            .iter()
            .filter_map(|id| threads.registry.lookup(id).ok())
            .filter(|t| t.is_stopped())
            .map(|t| (t.id(), t.memory_handle()))
            .collect();
        if targets.is_empty() {
            return Ok(false);
        }

        if verify {
            let header = header.as_deref().ok_or(DebugError::Uninitialized)?;
            for (id, vm) in &targets {
                if !self.read_sr_ident(header, *vm, id)?.in_system_routine() {
                    log::warn!("{}: not in system routine, refusing to resume", id);
                    return Err(DebugError::NotAvailable);
                }
            }
        }

        if let Some(header) = header.as_deref() {
            self.write_resume_command(header, &targets)?;
        }

        let ids: Vec<ThreadId> = targets.iter().map(|(id, _)| *id).collect();
        self.resume_imp(tile, &ids)?;

        for (id, vm) in &targets {
            if let Some(header) = header.as_deref() {
                if !self.wait_resumed(header, &threads.registry, id, *vm) {
                    log::warn!("{}: no sign of leaving the system routine", id);
                }
            }
            threads.registry.lookup_mut(id)?.resume_thread();
        }
        Ok(true)
    }

    /// Poll the system-routine counter of `id` until it moves.
    fn wait_resumed(
        &self,
        header: &StateSaveAreaHeader,
        registry: &ThreadRegistry,
        id: &ThreadId,
        vm: MemoryHandle,
    ) -> bool {
        let thread = match registry.lookup(id) {
            Ok(thread) => thread,
            Err(_) => return false,
        };
        for attempt in 0..self.config.sip_retry_count {
            match self.read_sr_ident(header, vm, id) {
                Ok(ident) if thread.is_resumed(ident.count) => return true,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("{}: reading system routine ident failed: {}", id, e);
                    return false;
                }
            }
            if attempt + 1 < self.config.sip_retry_count {
                thread::sleep(self.config.sip_retry_backoff);
            }
        }
        false
    }

    pub(super) fn read_sr_ident(
        &self,
        header: &StateSaveAreaHeader,
        vm: MemoryHandle,
        id: &ThreadId,
    ) -> Result<SrIdent, DebugError> {
        let css = self.context_save_area(vm).ok_or(DebugError::Uninitialized)?;
        let mut raw = [0; SrIdent::SIZE];
        self.transport
            .read_gpu_memory(vm, css.va + header.sr_ident_offset(id) as u64, &mut raw)?;
        SrIdent::parse(&raw).ok_or(DebugError::Unknown)
    }

    /// Tell firmware to let the threads go on the next resume.
    fn write_resume_command(
        &self,
        header: &StateSaveAreaHeader,
        targets: &[(ThreadId, MemoryHandle)],
    ) -> Result<(), DebugError> {
        if header.version.major >= 2 {
            let desc = *header.command_window().ok_or(DebugError::UnsupportedFeature)?;
            let raw = SipCommand::new(SipCommandKind::Resume, 0, 0).encode(desc.bytes as usize);
            for (id, vm) in targets {
                self.registers_access(id, *vm, header, &desc, 0, 1, RegisterIo::Write(&raw))?;
            }
            return Ok(());
        }

        if !T::Arch::RESUME_WA_REQUIRED {
            return Ok(());
        }

        let bindless = self
            .with_root(|_, root| match lock(&root.connection).debug_area {
                DebugAreaState::Valid(area) => area.scratch_bindless,
                _ => false,
            })
            .unwrap_or(false);
        let (ty, dword) = if bindless {
            (RegsetType::Cr, 1)
        } else {
            (RegsetType::Grf, 4)
        };
        let desc = regset_descriptor(header, ty)?;

        let mut reg = vec![0; desc.bytes as usize];
        let at = dword * 4;
        if reg.len() < at + 4 {
            return Err(DebugError::Unknown);
        }
        for (id, vm) in targets {
            self.registers_access(id, *vm, header, &desc, 0, 1, RegisterIo::Read(&mut reg))?;
            let value = u32::from_le_bytes([reg[at], reg[at + 1], reg[at + 2], reg[at + 3]]);
            reg[at..at + 4].copy_from_slice(&(value | RESUME_WA_BIT).to_le_bytes());
            self.registers_access(id, *vm, header, &desc, 0, 1, RegisterIo::Write(&reg))?;
        }
        Ok(())
    }

    /// Resume `ids` on `tile`, through the root.
    pub(super) fn resume_imp(&self, tile: u32, ids: &[ThreadId]) -> Result<(), DebugError> {
        let mut bitmask = self.geometry_bitmask(ids);
        self.with_root(|core, root| {
            let client = lock(&root.connection).client.ok_or(DebugError::Uninitialized)?;
            let request = EuControl {
                client,
                tile,
                cmd: EuControlCmd::Resume,
            };
            core.transport.eu_control(request, &mut bitmask)?;
            log::debug!("resumed {} thread(s) on tile {}", ids.len(), tile);

            let mut hw = lock(&root.hw);
            if !hw.resumed_devices.contains(&tile) {
                hw.resumed_devices.push(tile);
            }
            if hw.interrupted_device == Some(tile) {
                hw.interrupted_device = None;
            }
            Ok(())
        })?
    }
}
