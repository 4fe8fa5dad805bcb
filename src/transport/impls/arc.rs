use core::time::Duration;
use std::sync::Arc;

use crate::common::{MemoryHandle, Topology};
use crate::transport::{DriverEvent, EuControl, EventAck, Transport, TransportError};

impl<T: Transport> Transport for Arc<T> {
    type Arch = T::Arch;

    fn topology(&self) -> Topology {
        (**self).topology()
    }

    fn read_gpu_memory(
        &self,
        vm: MemoryHandle,
        gpu_va: u64,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        (**self).read_gpu_memory(vm, gpu_va, buf)
    }

    fn write_gpu_memory(
        &self,
        vm: MemoryHandle,
        gpu_va: u64,
        buf: &[u8],
    ) -> Result<(), TransportError> {
        (**self).write_gpu_memory(vm, gpu_va, buf)
    }

    fn eu_control(&self, request: EuControl, bitmask: &mut [u8]) -> Result<u64, TransportError> {
        (**self).eu_control(request, bitmask)
    }

    fn read_event(&self, timeout: Duration) -> Result<Option<DriverEvent>, TransportError> {
        (**self).read_event(timeout)
    }

    fn ack_event(&self, ack: EventAck) -> Result<(), TransportError> {
        (**self).ack_event(ack)
    }
}
