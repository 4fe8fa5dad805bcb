//! Shared local memory access through the SIP command window.
//!
//! Shared local memory is not addressable from the host. Instead, a command
//! is written into a stopped thread's `cmd` register window, the thread is
//! resumed so SIP executes it, and the window is polled until firmware
//! reports [`SipCommandKind::Ready`]. For reads, a second access of the
//! window then fetches the payload.
//!
//! A transfer that fails midway leaves the target range in an undefined
//! state: commands already executed by firmware are not rolled back.

use std::thread;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::common::ThreadId;
use crate::sip::command::{SipCommand, SipCommandKind, SLM_SEND_BYTES};
use crate::util::div_ceil;

use super::DebugError;

/// The per-thread command register window.
#[cfg_attr(test, automock)]
pub(crate) trait CommandRegister {
    /// Width of the window in bytes.
    fn window_size(&self) -> usize;

    fn read_command(&self, thread: &ThreadId, raw: &mut [u8]) -> Result<(), DebugError>;

    fn write_command(&self, thread: &ThreadId, raw: &[u8]) -> Result<(), DebugError>;

    /// Let `thread` leave the system routine so it executes the pending
    /// command.
    fn resume_thread(&self, thread: &ThreadId) -> Result<(), DebugError>;
}

/// Driver of the SIP command protocol.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SipChannel {
    retry_count: u16,
    backoff: Duration,
}

impl SipChannel {
    pub fn new(retry_count: u16, backoff: Duration) -> SipChannel {
        SipChannel {
            retry_count,
            backoff,
        }
    }

    /// Poll the command window until firmware reports it idle.
    ///
    /// Reads the window at most `retry_count` times, then gives up with
    /// [`DebugError::NotAvailable`].
    pub fn wait_for_cmd_ready<R>(&self, reg: &R, thread: &ThreadId) -> Result<SipCommand, DebugError>
    where
        R: CommandRegister + ?Sized,
    {
        let mut raw = vec![0; reg.window_size()];
        for attempt in 0..self.retry_count {
            reg.read_command(thread, &mut raw)?;
            let cmd = SipCommand::decode(&raw).map_err(|_| DebugError::Unknown)?;
            if cmd.kind() == Some(SipCommandKind::Ready) {
                return Ok(cmd);
            }
            if attempt + 1 < self.retry_count {
                thread::sleep(self.backoff);
            }
        }

        log::warn!(
            "{}: SIP did not become ready after {} polls",
            thread,
            self.retry_count
        );
        Err(DebugError::NotAvailable)
    }

    fn execute<R>(&self, reg: &R, thread: &ThreadId, cmd: &SipCommand) -> Result<(), DebugError>
    where
        R: CommandRegister + ?Sized,
    {
        log::debug!(
            "{}: SIP command {:?} units {} offset {:#x}",
            thread,
            cmd.kind(),
            cmd.size,
            cmd.offset
        );
        reg.write_command(thread, &cmd.encode(reg.window_size()))?;
        reg.resume_thread(thread)?;
        self.wait_for_cmd_ready(reg, thread)?;
        Ok(())
    }

    fn units_per_batch<R>(reg: &R) -> Result<usize, DebugError>
    where
        R: CommandRegister + ?Sized,
    {
        match SipCommand::buffer_capacity(reg.window_size()) / SLM_SEND_BYTES {
            0 => Err(DebugError::UnsupportedFeature),
            n => Ok(n),
        }
    }

    /// Read `buf.len()` bytes of shared local memory at `offset`.
    pub fn read_slm<R>(
        &self,
        reg: &R,
        thread: &ThreadId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), DebugError>
    where
        R: CommandRegister + ?Sized,
    {
        if buf.is_empty() {
            return Ok(());
        }

        let front = (offset % SLM_SEND_BYTES as u64) as usize;
        let aligned = offset - front as u64;
        let total_units = div_ceil(front + buf.len(), SLM_SEND_BYTES);
        let batch_units = Self::units_per_batch(reg)?;

        self.wait_for_cmd_ready(reg, thread)?;

        let mut staging = vec![0; total_units * SLM_SEND_BYTES];
        let mut raw = vec![0; reg.window_size()];
        let mut done = 0;
        while done < total_units {
            let units = batch_units.min(total_units - done);
            let start = done * SLM_SEND_BYTES;
            let len = units * SLM_SEND_BYTES;

            let cmd = SipCommand::new(SipCommandKind::SlmRead, units as u32, aligned + start as u64);
            self.execute(reg, thread, &cmd)?;

            reg.read_command(thread, &mut raw)?;
            let result = SipCommand::decode(&raw).map_err(|_| DebugError::Unknown)?;
            let payload = result.buffer.get(..len).ok_or(DebugError::Unknown)?;
            staging[start..start + len].copy_from_slice(payload);

            done += units;
        }

        buf.copy_from_slice(&staging[front..front + buf.len()]);
        Ok(())
    }

    /// Write `data` to shared local memory at `offset`.
    ///
    /// Unaligned edges are preserved by reading the enclosing aligned range
    /// first.
    pub fn write_slm<R>(
        &self,
        reg: &R,
        thread: &ThreadId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DebugError>
    where
        R: CommandRegister + ?Sized,
    {
        if data.is_empty() {
            return Ok(());
        }

        let front = (offset % SLM_SEND_BYTES as u64) as usize;
        let aligned = offset - front as u64;
        let total_units = div_ceil(front + data.len(), SLM_SEND_BYTES);
        let batch_units = Self::units_per_batch(reg)?;

        let mut staging = vec![0; total_units * SLM_SEND_BYTES];
        if front != 0 || staging.len() != front + data.len() {
            self.read_slm(reg, thread, aligned, &mut staging)?;
        } else {
            self.wait_for_cmd_ready(reg, thread)?;
        }
        staging[front..front + data.len()].copy_from_slice(data);

        let mut done = 0;
        while done < total_units {
            let units = batch_units.min(total_units - done);
            let start = done * SLM_SEND_BYTES;
            let len = units * SLM_SEND_BYTES;

            let mut cmd =
                SipCommand::new(SipCommandKind::SlmWrite, units as u32, aligned + start as u64);
            cmd.buffer = staging[start..start + len].to_vec();
            self.execute(reg, thread, &cmd)?;

            done += units;
        }
        Ok(())
    }
}
