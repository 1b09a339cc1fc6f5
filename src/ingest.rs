//! The frame processing loop.

use crate::discovery::Registrar;
use crate::protocol::CanFrame;
use crate::publisher::{Publish, StatePublisher, Topics};
use crate::store::ModuleStore;
use crate::Error;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single receive call.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// A source of CAN frames, usually a bus interface.
pub trait FrameSource {
    /// Blocks for at most `timeout`.
    ///
    /// Returns [`Error::TransportTimeout`] when no frame arrived in time and
    /// [`Error::Transport`] when the source cannot continue.
    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, Error>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, Error> {
        (**self).recv(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Listening,
    Draining,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub frames_received: u64,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    pub timeouts: u64,
    pub modules_discovered: u64,
}

/// Receives frames one at a time and turns each accepted frame into
/// discovery (first frame of a module only) and state publishes.
pub struct IngestLoop<S, P> {
    source: S,
    publisher: P,
    store: ModuleStore,
    registrar: Registrar,
    state_publisher: StatePublisher,
    recv_timeout: Duration,
    stop: Arc<AtomicBool>,
    state: LoopState,
    stats: Statistics,
}

impl<S: FrameSource, P: Publish> IngestLoop<S, P> {
    pub fn new(source: S, publisher: P, topics: Topics) -> Self {
        Self {
            source,
            publisher,
            store: ModuleStore::new(),
            registrar: Registrar::new(topics.clone()),
            state_publisher: StatePublisher::new(topics),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            stop: Arc::new(AtomicBool::new(false)),
            state: LoopState::Listening,
            stats: Statistics::default(),
        }
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Uses `stop` as the shutdown signal; setting it makes [`run`](Self::run) drain and return.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Decodes and applies one frame, then publishes.
    ///
    /// Decode failures are returned without touching the store. Publish
    /// failures are logged and do not fail the frame.
    pub fn handle_frame(&mut self, frame: &CanFrame) -> Result<u32, Error> {
        let update = frame.decode().inspect_err(|_| self.stats.frames_dropped += 1)?;
        let module_id = update.module_id();
        trace!("Decoded {frame:?} into {update:?}");

        let (_, first_time_seen) = self.store.apply(&update);
        if first_time_seen {
            self.registrar.publish(&mut self.publisher, module_id);
            self.store.mark_discovery_published(module_id);
            self.stats.modules_discovered += 1;
        }

        if let Some(aggregate) = self.store.get(module_id) {
            if let Err(e) = self
                .state_publisher
                .publish(&mut self.publisher, module_id, aggregate)
            {
                error!("Failed to publish state of module {module_id}: {e}");
            }
        }
        self.stats.frames_accepted += 1;
        Ok(module_id)
    }

    /// Runs until the stop flag is set or the source fails, then drains.
    pub fn run(&mut self) -> Result<Statistics, Error> {
        self.state = LoopState::Listening;
        info!("Listening for frames (receive timeout {:?})", self.recv_timeout);

        let result = loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested");
                break Ok(());
            }
            match self.source.recv(self.recv_timeout) {
                Ok(frame) => {
                    self.stats.frames_received += 1;
                    if let Err(e) = self.handle_frame(&frame) {
                        warn!("Dropping frame {frame:?}: {e}");
                    }
                }
                Err(Error::TransportTimeout) => {
                    self.stats.timeouts += 1;
                    trace!("No frame within {:?}", self.recv_timeout);
                }
                Err(e) if e.is_fatal() => {
                    error!("{e}");
                    break Err(e);
                }
                Err(e) => warn!("Ignoring transport error: {e}"),
            }
        };

        self.drain();
        result.map(|()| self.stats.clone())
    }

    fn drain(&mut self) {
        self.state = LoopState::Draining;
        debug!("Draining, closing publisher");
        if let Err(e) = self.publisher.close() {
            error!("Failed to close publisher: {e}");
        }
        info!(
            "Stopped: {} frames received, {} accepted, {} dropped, {} modules",
            self.stats.frames_received,
            self.stats.frames_accepted,
            self.stats.frames_dropped,
            self.store.len()
        );
    }
}
