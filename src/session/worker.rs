//! Background threads driving a session.

use std::ops::ControlFlow;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::transport::{Transport, TransportError};

use super::core_impl::SessionCore;

/// Observed by a worker to learn that it should stop.
///
/// Cancellation is signalled by dropping the paired sender; nothing is ever
/// sent on the channel.
#[derive(Debug, Clone)]
pub(crate) struct CancellationToken {
    rx: Receiver<()>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep for up to `timeout`. Returns `true` if cancelled meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// A running worker thread. Stopped and joined on drop.
#[derive(Debug)]
pub(crate) struct Worker {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a thread calling `cycle` until it breaks or the worker is
    /// stopped.
    pub fn spawn<F>(name: impl Into<String>, mut cycle: F) -> std::io::Result<Worker>
    where
        F: FnMut(&CancellationToken) -> ControlFlow<()> + Send + 'static,
    {
        let name = name.into();
        let (stop, rx) = crossbeam_channel::bounded(0);
        let token = CancellationToken { rx };

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            log::debug!("worker started");
            while !token.is_cancelled() {
                if cycle(&token).is_break() {
                    break;
                }
            }
            log::debug!("worker exiting");
        })?;

        Ok(Worker {
            name,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker {} panicked", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One iteration of the root worker: consume a driver event, then run the
/// attention pipeline unless tile workers own it.
pub(crate) fn root_cycle<T: Transport>(
    core: &SessionCore<T>,
    token: &CancellationToken,
) -> ControlFlow<()> {
    match core.transport().read_event(core.config().event_poll_timeout) {
        Ok(Some(event)) => core.handle_event(event),
        Ok(None) => {}
        Err(TransportError::Disconnected) => {
            core.handle_fatal();
            return ControlFlow::Break(());
        }
        Err(e) => {
            log::warn!("reading driver event failed: {}", e);
            if token.wait(core.config().event_poll_timeout) {
                return ControlFlow::Break(());
            }
        }
    }

    if !core.has_tiles() {
        run_attention_pipeline(core);
    }
    ControlFlow::Continue(())
}

/// One iteration of a tile worker.
pub(crate) fn tile_cycle<T: Transport>(
    core: &SessionCore<T>,
    token: &CancellationToken,
) -> ControlFlow<()> {
    if token.wait(core.config().fifo_poll_interval) {
        return ControlFlow::Break(());
    }
    run_attention_pipeline(core);
    ControlFlow::Continue(())
}

fn run_attention_pipeline<T: Transport>(core: &SessionCore<T>) {
    core.poll_fifo();
    core.generate_events_and_resume_stopped_threads();
    core.send_interrupts();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn stop_interrupts_wait() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        let mut worker = Worker::spawn("test-worker", move |token| {
            counter.fetch_add(1, Ordering::SeqCst);
            if token.wait(Duration::from_secs(30)) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();

        while cycles.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }

        let start = Instant::now();
        worker.stop();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn break_ends_worker() {
        let mut worker = Worker::spawn("test-worker", |_| ControlFlow::Break(())).unwrap();
        worker.stop();
        assert!(worker.handle.is_none());
    }
}
