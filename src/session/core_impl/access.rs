//! Register and memory access of stopped threads.

use std::sync::Arc;

use crate::common::{DeviceThread, MemoryHandle, MemorySpace, MemorySpaceDesc, ThreadId, INVALID_HANDLE};
use crate::sip::command::SLM_ADDRESS_SPACE_TAG_BITS;
use crate::sip::header::{SRMAGIC, TSSAREA_MAGIC};
use crate::sip::regset::{sba, RegsetFlags, RegsetProperties, SbaTrackingBuffer, SBA_REGSET};
use crate::sip::{RegsetDesc, RegsetType, StateSaveAreaHeader};
use crate::transport::Transport;
use crate::util::{decanonize, lock};

use super::SessionCore;
use crate::session::sip_channel::{CommandRegister, SipChannel};
use crate::session::state_save::regset_descriptor;
use crate::session::DebugError;

/// Direction and buffer of a register transfer.
pub(crate) enum RegisterIo<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl RegisterIo<'_> {
    fn len(&self) -> usize {
        match self {
            RegisterIo::Read(buf) => buf.len(),
            RegisterIo::Write(buf) => buf.len(),
        }
    }
}

impl<T: Transport> SessionCore<T> {
    /// The state-save-area header, fetched on first use.
    ///
    /// The root reads it from the first bound context save area. Tile
    /// sessions copy the root's validated bytes.
    pub(crate) fn state_save_header(&self) -> Option<Arc<StateSaveAreaHeader>> {
        if let Some(header) = self.state_save.header() {
            return Some(header);
        }

        match self.scope() {
            None => self
                .state_save
                .get_or_fetch(|| self.fetch_state_save_area_header()),
            Some(_) => {
                let raw = self
                    .with_root(|root, _| {
                        root.state_save_header()?;
                        root.state_save.raw()
                    })
                    .ok()
                    .flatten()?;
                self.state_save.load(&raw)
            }
        }
    }

    fn fetch_state_save_area_header(&self) -> Result<Vec<u8>, DebugError> {
        let (vm, css) = self
            .connection()
            .and_then(|c| c.context_save_areas.iter().next().map(|(vm, b)| (*vm, *b)))
            .ok_or(DebugError::Uninitialized)?;

        let size = (css.len as usize).min(StateSaveAreaHeader::MAX_SIZE);
        let mut raw = vec![0; size];
        self.transport.read_gpu_memory(vm, css.va, &mut raw)?;
        Ok(raw)
    }

    /// Properties of every register set the firmware saves, plus SBA.
    pub fn register_set_properties(&self) -> Result<Vec<RegsetProperties>, DebugError> {
        let header = self.state_save_header().ok_or(DebugError::Uninitialized)?;
        let version = header.version.major as u32;

        Ok(RegsetType::ALL
            .iter()
            .filter_map(|&ty| {
                let desc = match ty {
                    RegsetType::Sba => SBA_REGSET,
                    _ => *header.regset(ty)?,
                };
                let mut props = RegsetProperties::new(ty, &desc);
                props.version = version;
                Some(props)
            })
            .collect())
    }

    pub fn read_registers(
        &self,
        thread: DeviceThread,
        ty: RegsetType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        self.check_attached()?;
        let id = self.single_stopped_thread(&thread)?;
        let header = self.state_save_header().ok_or(DebugError::Uninitialized)?;
        let vm = self.threads().registry.lookup(&id)?.memory_handle();

        if ty == RegsetType::Sba {
            return self.read_sba(&id, vm, &header, start, count, buf);
        }

        let desc = regset_descriptor(&header, ty)?;
        self.registers_access(&id, vm, &header, &desc, start, count, RegisterIo::Read(buf))
    }

    pub fn write_registers(
        &self,
        thread: DeviceThread,
        ty: RegsetType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        self.check_attached()?;
        let id = self.single_stopped_thread(&thread)?;
        if !ty.flags().contains(RegsetFlags::WRITEABLE) {
            return Err(DebugError::InvalidArgument);
        }
        let header = self.state_save_header().ok_or(DebugError::Uninitialized)?;
        let vm = self.threads().registry.lookup(&id)?.memory_handle();

        let desc = regset_descriptor(&header, ty)?;
        self.registers_access(&id, vm, &header, &desc, start, count, RegisterIo::Write(buf))
    }

    /// Transfer registers `start..start + count` of `desc` for `id`.
    ///
    /// Both the save area and the thread's ident magic are checked before
    /// the transfer.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn registers_access(
        &self,
        id: &ThreadId,
        vm: MemoryHandle,
        header: &StateSaveAreaHeader,
        desc: &RegsetDesc,
        start: u32,
        count: u32,
        io: RegisterIo<'_>,
    ) -> Result<(), DebugError> {
        let end = start.checked_add(count).ok_or(DebugError::InvalidArgument)?;
        if count == 0 || end > desc.num as u32 {
            return Err(DebugError::InvalidArgument);
        }
        let size = count as usize * desc.bytes as usize;
        if io.len() < size {
            return Err(DebugError::InvalidArgument);
        }

        if vm == INVALID_HANDLE {
            return Err(DebugError::Unknown);
        }
        let css = self.context_save_area(vm).ok_or(DebugError::Unknown)?;
        if css.va == 0 {
            return Err(DebugError::Unknown);
        }

        let mut magic = [0; 8];
        self.transport.read_gpu_memory(vm, css.va, &mut magic)?;
        if magic != TSSAREA_MAGIC {
            log::warn!("context save area of vm {:#x} has no header magic", vm);
            return Err(DebugError::Unknown);
        }
        self.transport
            .read_gpu_memory(vm, css.va + header.sr_ident_offset(id) as u64, &mut magic)?;
        if magic != SRMAGIC {
            log::warn!("{}: save slot has no ident magic", id);
            return Err(DebugError::Unknown);
        }

        let address = css.va
            + header.thread_slot_offset(id) as u64
            + StateSaveAreaHeader::register_offset_in_slot(desc, start) as u64;
        match io {
            RegisterIo::Read(buf) => self.transport.read_gpu_memory(vm, address, &mut buf[..size])?,
            RegisterIo::Write(buf) => self.transport.write_gpu_memory(vm, address, &buf[..size])?,
        }
        Ok(())
    }

    /// State base addresses of `id`, from the SBA tracking buffer and r0.
    fn read_sba(
        &self,
        id: &ThreadId,
        vm: MemoryHandle,
        header: &StateSaveAreaHeader,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        let end = start.checked_add(count).ok_or(DebugError::InvalidArgument)?;
        if count == 0 || end > SBA_REGSET.num as u32 {
            return Err(DebugError::InvalidArgument);
        }
        let size = count as usize * SBA_REGSET.bytes as usize;
        if buf.len() < size {
            return Err(DebugError::InvalidArgument);
        }

        let tracking = self
            .connection_of_root(|c| c.sba_buffers.get(&vm).copied())
            .ok_or(DebugError::Uninitialized)?;
        let mut raw = [0; SbaTrackingBuffer::SIZE];
        self.transport.read_gpu_memory(vm, tracking.va, &mut raw)?;
        let tracked = SbaTrackingBuffer::parse(&raw).map_err(|_| DebugError::Unknown)?;

        let grf = regset_descriptor(header, RegsetType::Grf)?;
        let mut r0 = vec![0; grf.bytes as usize];
        self.registers_access(id, vm, header, &grf, 0, 1, RegisterIo::Read(&mut r0))?;
        let r0_dword = |i: usize| {
            r0.get(i * 4..i * 4 + 4)
                .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };

        let mut values = [0u64; 9];
        values[sba::GENERAL_STATE_BASE] = tracked.general_state_base;
        values[sba::SURFACE_STATE_BASE] = tracked.surface_state_base;
        values[sba::DYNAMIC_STATE_BASE] = tracked.dynamic_state_base;
        values[sba::INDIRECT_OBJECT_BASE] = tracked.indirect_object_base;
        values[sba::INSTRUCTION_BASE] = tracked.instruction_base;
        values[sba::BINDLESS_SURFACE_STATE_BASE] = tracked.bindless_surface_state_base;
        values[sba::BINDLESS_SAMPLER_STATE_BASE] = tracked.bindless_sampler_state_base;

        let binding_table = (r0_dword(4) as u64 >> 5) << 5;
        values[sba::BINDING_TABLE] = binding_table + tracked.surface_state_base;

        let scratch_offset = (r0_dword(5) as u64 >> 10) << 10;
        if scratch_offset != 0 {
            values[sba::SCRATCH_SPACE] = tracked.general_state_base + scratch_offset;
        }

        for (i, value) in values[start as usize..end as usize].iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn connection_of_root<R>(&self, f: impl FnOnce(&super::connection::Connection) -> Option<R>) -> Option<R> {
        self.with_root(|_, root| f(&lock(&root.connection))).ok().flatten()
    }

    /// Check a memory access request. Returns the thread for single-thread
    /// accesses.
    fn check_memory_request(
        &self,
        thread: &DeviceThread,
        desc: &MemorySpaceDesc,
    ) -> Result<Option<ThreadId>, DebugError> {
        self.check_attached()?;
        self.client_handle()?;

        if thread.is_all() {
            if desc.space != MemorySpace::Default {
                return Err(DebugError::InvalidArgument);
            }
            return Ok(None);
        }
        if !thread.is_single() {
            return Err(DebugError::InvalidArgument);
        }
        self.single_stopped_thread(thread).map(Some)
    }

    pub fn read_memory(
        &self,
        thread: DeviceThread,
        desc: &MemorySpaceDesc,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        let id = self.check_memory_request(&thread, desc)?;
        if buf.is_empty() {
            return Ok(());
        }

        match (desc.space, id) {
            (MemorySpace::Slm, Some(id)) => {
                let (header, vm) = self.slm_target(&id)?;
                let window = self.command_window(&id, vm, &header)?;
                self.sip_channel()
                    .read_slm(&window, &id, slm_offset(desc.address), buf)
            }
            (MemorySpace::Slm, None) => Err(DebugError::InvalidArgument),
            (MemorySpace::Default, id) => self.read_default_memory(id, decanonize(desc.address), buf),
        }
    }

    pub fn write_memory(
        &self,
        thread: DeviceThread,
        desc: &MemorySpaceDesc,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        let id = self.check_memory_request(&thread, desc)?;
        if buf.is_empty() {
            return Ok(());
        }

        match (desc.space, id) {
            (MemorySpace::Slm, Some(id)) => {
                let (header, vm) = self.slm_target(&id)?;
                let window = self.command_window(&id, vm, &header)?;
                self.sip_channel()
                    .write_slm(&window, &id, slm_offset(desc.address), buf)
            }
            (MemorySpace::Slm, None) => Err(DebugError::InvalidArgument),
            (MemorySpace::Default, id) => self.write_default_memory(id, decanonize(desc.address), buf),
        }
    }

    fn read_default_memory(
        &self,
        id: Option<ThreadId>,
        address: u64,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        let size = buf.len() as u64;
        let target = self.with_root(|_, root| {
            let connection = lock(&root.connection);
            if let Some((payload, offset)) = connection.elf_covering(address, size) {
                buf.copy_from_slice(&payload[offset..offset + buf.len()]);
                return MemoryTarget::Served;
            }
            match connection.isa_vm_covering(address, size) {
                Some(vm) => MemoryTarget::Vm(vm),
                None => MemoryTarget::Search(connection.vms.iter().copied().collect()),
            }
        })?;

        match (target, id) {
            (MemoryTarget::Served, _) => Ok(()),
            (MemoryTarget::Vm(vm), _) => Ok(self.transport.read_gpu_memory(vm, address, buf)?),
            (MemoryTarget::Search(_), Some(id)) => {
                let vm = self.thread_vm(&id)?;
                Ok(self.transport.read_gpu_memory(vm, address, buf)?)
            }
            (MemoryTarget::Search(vms), None) => {
                let mut result = Err(DebugError::Uninitialized);
                for vm in vms {
                    result = self.transport.read_gpu_memory(vm, address, buf).map_err(Into::into);
                    if result.is_ok() {
                        break;
                    }
                }
                result
            }
        }
    }

    fn write_default_memory(
        &self,
        id: Option<ThreadId>,
        address: u64,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        let size = buf.len() as u64;
        let target = self.with_root(|_, root| {
            let connection = lock(&root.connection);
            if connection.elf_covering(address, size).is_some() {
                return Err(DebugError::InvalidArgument);
            }
            Ok(match connection.isa_vm_covering(address, size) {
                Some(vm) => MemoryTarget::Vm(vm),
                None => MemoryTarget::Search(connection.vms.iter().copied().collect()),
            })
        })??;

        match (target, id) {
            (MemoryTarget::Vm(vm), _) => Ok(self.transport.write_gpu_memory(vm, address, buf)?),
            (MemoryTarget::Search(_), Some(id)) => {
                let vm = self.thread_vm(&id)?;
                Ok(self.transport.write_gpu_memory(vm, address, buf)?)
            }
            (MemoryTarget::Search(vms), None) => {
                let mut result = Err(DebugError::Uninitialized);
                for vm in vms {
                    result = self.transport.write_gpu_memory(vm, address, buf).map_err(Into::into);
                    if result.is_ok() {
                        break;
                    }
                }
                result
            }
            (MemoryTarget::Served, _) => Err(DebugError::InvalidArgument),
        }
    }

    fn thread_vm(&self, id: &ThreadId) -> Result<MemoryHandle, DebugError> {
        match self.threads().registry.lookup(id)?.memory_handle() {
            INVALID_HANDLE => Err(DebugError::NotAvailable),
            vm => Ok(vm),
        }
    }

    fn slm_target(&self, id: &ThreadId) -> Result<(Arc<StateSaveAreaHeader>, MemoryHandle), DebugError> {
        let header = self.state_save_header().ok_or(DebugError::Uninitialized)?;
        if !header.supports_slm() {
            return Err(DebugError::UnsupportedVersion);
        }
        Ok((header, self.thread_vm(id)?))
    }

    fn command_window<'a>(
        &'a self,
        id: &ThreadId,
        vm: MemoryHandle,
        header: &'a StateSaveAreaHeader,
    ) -> Result<ThreadCommandWindow<'a, T>, DebugError> {
        let desc = *header.command_window().ok_or(DebugError::UnsupportedFeature)?;
        log::trace!("{}: command window of {} bytes", id, desc.bytes);
        Ok(ThreadCommandWindow {
            core: self,
            vm,
            header,
            desc,
        })
    }

    fn sip_channel(&self) -> SipChannel {
        SipChannel::new(self.config.sip_retry_count, self.config.sip_retry_backoff)
    }
}

enum MemoryTarget {
    /// Already copied out of a cached ELF image.
    Served,
    Vm(MemoryHandle),
    Search(Vec<MemoryHandle>),
}

fn slm_offset(address: u64) -> u64 {
    address & ((1 << SLM_ADDRESS_SPACE_TAG_BITS) - 1)
}

/// The `cmd` register window of a stopped thread.
struct ThreadCommandWindow<'a, T: Transport> {
    core: &'a SessionCore<T>,
    vm: MemoryHandle,
    header: &'a StateSaveAreaHeader,
    desc: RegsetDesc,
}

impl<T: Transport> CommandRegister for ThreadCommandWindow<'_, T> {
    fn window_size(&self) -> usize {
        self.desc.bytes as usize
    }

    fn read_command(&self, thread: &ThreadId, raw: &mut [u8]) -> Result<(), DebugError> {
        self.core
            .registers_access(thread, self.vm, self.header, &self.desc, 0, 1, RegisterIo::Read(raw))
    }

    fn write_command(&self, thread: &ThreadId, raw: &[u8]) -> Result<(), DebugError> {
        self.core
            .registers_access(thread, self.vm, self.header, &self.desc, 0, 1, RegisterIo::Write(raw))
    }

    fn resume_thread(&self, thread: &ThreadId) -> Result<(), DebugError> {
        self.core.resume_imp(thread.tile, &[*thread])
    }
}
