use core::fmt::{self, Display};
use std::time::{Duration, Instant};

use crate::transport::Transport;

use super::classify::{ForcedExceptionAtStartIp, StopClassifier};
use super::core_impl::SessionCore;
use super::{DebugError, DebugSession};

/// An error which may occur when building a [`DebugSession`].
#[derive(Debug)]
#[non_exhaustive]
pub enum DebugSessionBuilderError {
    /// `sip_retry_count` must be at least 1.
    ZeroRetryCount,
    /// The named timeout or interval must be non-zero.
    ZeroDuration(&'static str),
    /// The transport reported a topology without tiles.
    NoTiles,
    /// The attach handshake with the driver failed.
    Attach(DebugError),
    /// A worker thread could not be spawned.
    Spawn(std::io::Error),
}

impl Display for DebugSessionBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::DebugSessionBuilderError::*;
        match self {
            ZeroRetryCount => write!(f, "`sip_retry_count` must be at least 1"),
            ZeroDuration(name) => write!(f, "`{}` must be non-zero", name),
            NoTiles => write!(f, "device topology has no tiles"),
            Attach(e) => write!(f, "attach failed: {}", e),
            Spawn(e) => write!(f, "could not spawn session worker: {}", e),
        }
    }
}

impl std::error::Error for DebugSessionBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DebugSessionBuilderError::Attach(e) => Some(e),
            DebugSessionBuilderError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Validated session settings, shared by the root and every tile core.
pub(crate) struct SessionConfig {
    pub interrupt_timeout: Duration,
    pub event_poll_timeout: Duration,
    pub fifo_poll_interval: Duration,
    pub sip_retry_count: u16,
    pub sip_retry_backoff: Duration,
    pub tile_attach: bool,
    pub block_on_fence: bool,
    pub attach_timeout: Duration,
    pub stop_classifier: Box<dyn StopClassifier>,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            interrupt_timeout: Duration::from_millis(2000),
            event_poll_timeout: Duration::from_millis(100),
            fifo_poll_interval: Duration::from_millis(10),
            sip_retry_count: 10,
            sip_retry_backoff: Duration::from_micros(100),
            tile_attach: false,
            block_on_fence: false,
            attach_timeout: Duration::from_secs(5),
            stop_classifier: Box::new(ForcedExceptionAtStartIp),
        }
    }
}

/// Helper to construct and customize [`DebugSession`].
pub struct DebugSessionBuilder<T: Transport> {
    transport: T,
    interrupt_timeout: Option<Duration>,
    event_poll_timeout: Option<Duration>,
    fifo_poll_interval: Option<Duration>,
    sip_retry_count: Option<u16>,
    sip_retry_backoff: Option<Duration>,
    tile_attach: Option<bool>,
    block_on_fence: Option<bool>,
    attach_timeout: Option<Duration>,
    stop_classifier: Option<Box<dyn StopClassifier>>,
}

impl<T: Transport> DebugSessionBuilder<T> {
    /// Create a new `DebugSessionBuilder` using the provided transport.
    pub fn new(transport: T) -> DebugSessionBuilder<T> {
        DebugSessionBuilder {
            transport,
            interrupt_timeout: None,
            event_poll_timeout: None,
            fifo_poll_interval: None,
            sip_retry_count: None,
            sip_retry_backoff: None,
            tile_attach: None,
            block_on_fence: None,
            attach_timeout: None,
            stop_classifier: None,
        }
    }

    /// How long an interrupt may go without a stop before its threads are
    /// reported unavailable. Defaults to 2 seconds.
    pub fn interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.interrupt_timeout = Some(timeout);
        self
    }

    /// How long the worker waits for each driver event. Defaults to 100 ms.
    pub fn event_poll_timeout(mut self, timeout: Duration) -> Self {
        self.event_poll_timeout = Some(timeout);
        self
    }

    /// Minimum interval between attention FIFO drains. Defaults to 10 ms.
    pub fn fifo_poll_interval(mut self, interval: Duration) -> Self {
        self.fifo_poll_interval = Some(interval);
        self
    }

    /// Number of times the SIP command window is polled before giving up.
    /// Defaults to 10.
    pub fn sip_retry_count(mut self, count: u16) -> Self {
        self.sip_retry_count = Some(count);
        self
    }

    /// Delay between SIP command window polls. Defaults to 100 µs.
    pub fn sip_retry_backoff(mut self, backoff: Duration) -> Self {
        self.sip_retry_backoff = Some(backoff);
        self
    }

    /// Create a [`TileSession`](super::TileSession) slot per tile, instead
    /// of tracking every thread on the root session. Defaults to `false`.
    pub fn tile_attach(mut self, enabled: bool) -> Self {
        self.tile_attach = Some(enabled);
        self
    }

    /// Hold every acknowledgement-requiring bind of a module until its
    /// `ModuleLoad` event is acknowledged. Defaults to `false`.
    pub fn block_on_fence(mut self, enabled: bool) -> Self {
        self.block_on_fence = Some(enabled);
        self
    }

    /// Bound on the attach handshake. Defaults to 5 seconds.
    pub fn attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = Some(timeout);
        self
    }

    /// Replace the predicate deciding which stops are resumed without being
    /// reported. Defaults to [`ForcedExceptionAtStartIp`].
    pub fn stop_classifier(mut self, classifier: impl StopClassifier + 'static) -> Self {
        self.stop_classifier = Some(Box::new(classifier));
        self
    }

    fn config(&mut self) -> Result<SessionConfig, DebugSessionBuilderError> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            interrupt_timeout: self.interrupt_timeout.unwrap_or(defaults.interrupt_timeout),
            event_poll_timeout: self.event_poll_timeout.unwrap_or(defaults.event_poll_timeout),
            fifo_poll_interval: self.fifo_poll_interval.unwrap_or(defaults.fifo_poll_interval),
            sip_retry_count: self.sip_retry_count.unwrap_or(defaults.sip_retry_count),
            sip_retry_backoff: self.sip_retry_backoff.unwrap_or(defaults.sip_retry_backoff),
            tile_attach: self.tile_attach.unwrap_or(defaults.tile_attach),
            block_on_fence: self.block_on_fence.unwrap_or(defaults.block_on_fence),
            attach_timeout: self.attach_timeout.unwrap_or(defaults.attach_timeout),
            stop_classifier: self.stop_classifier.take().unwrap_or(defaults.stop_classifier),
        };

        if config.sip_retry_count == 0 {
            return Err(DebugSessionBuilderError::ZeroRetryCount);
        }
        let durations = [
            ("interrupt_timeout", config.interrupt_timeout),
            ("event_poll_timeout", config.event_poll_timeout),
            ("fifo_poll_interval", config.fifo_poll_interval),
            ("attach_timeout", config.attach_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(DebugSessionBuilderError::ZeroDuration(name));
        }
        Ok(config)
    }

    /// Attach to the device, returning an error if something went wrong.
    ///
    /// Driver events are consumed until a client is known and its module
    /// debug area is bound, after which the session workers start.
    pub fn build(mut self) -> Result<DebugSession<T>, DebugSessionBuilderError> {
        let config = self.config()?;
        let core = SessionCore::new_root(self.transport, config);
        if core.topology().tile_count() == 0 {
            return Err(DebugSessionBuilderError::NoTiles);
        }

        attach_handshake(&core).map_err(DebugSessionBuilderError::Attach)?;
        DebugSession::start(core).map_err(DebugSessionBuilderError::Spawn)
    }
}

fn attach_handshake<T: Transport>(core: &SessionCore<T>) -> Result<(), DebugError> {
    let config = core.config();
    let deadline = Instant::now() + config.attach_timeout;

    loop {
        if core.attach_ready()? {
            log::debug!("attach handshake complete");
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::warn!("attach handshake timed out");
            return Err(DebugError::NotReady);
        }

        match core.transport().read_event(remaining.min(config.event_poll_timeout)) {
            Ok(Some(event)) => core.handle_event(event),
            Ok(None) => {}
            Err(e) => {
                log::error!("reading driver event during attach failed: {}", e);
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeTransport, Scenario};

    #[test]
    fn zero_settings_are_rejected() {
        let err = DebugSessionBuilder::new(FakeTransport::new(Scenario::default()))
            .sip_retry_count(0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DebugSessionBuilderError::ZeroRetryCount));

        let err = DebugSessionBuilder::new(FakeTransport::new(Scenario::default()))
            .interrupt_timeout(Duration::ZERO)
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DebugSessionBuilderError::ZeroDuration("interrupt_timeout")
        ));
    }

    #[test]
    fn empty_topology_is_rejected() {
        let scenario = Scenario {
            tiles: 0,
            ..Scenario::default()
        };
        let err = DebugSessionBuilder::new(FakeTransport::new(scenario))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DebugSessionBuilderError::NoTiles));
    }

    #[test]
    fn handshake_waits_for_debug_area() {
        let transport = FakeTransport::new(Scenario::default());
        transport.push_attach_events();
        let session = DebugSessionBuilder::new(transport)
            .attach_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        assert!(!session.is_detached());
    }

    #[test]
    fn handshake_times_out_without_client() {
        let err = DebugSessionBuilder::new(FakeTransport::new(Scenario::default()))
            .attach_timeout(Duration::from_millis(20))
            .event_poll_timeout(Duration::from_millis(5))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DebugSessionBuilderError::Attach(DebugError::NotReady)
        ));
    }

    #[test]
    fn bad_debug_area_magic_fails_attach() {
        let transport = FakeTransport::new(Scenario::default());
        transport.corrupt_debug_area();
        transport.push_attach_events();
        let err = DebugSessionBuilder::new(transport).build().err().unwrap();
        assert!(matches!(
            err,
            DebugSessionBuilderError::Attach(DebugError::Unknown)
        ));
    }
}
