//! Completion handles for enqueued commands.
//!
//! An [`Event`] is cheap to clone and keeps whatever the device needs to
//! report completion alive, so it stays valid after the session that
//! produced it moves on. Start/end timestamps come from the device clock in
//! nanoseconds.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::status;
use crate::kernels::KernelName;
use crate::{ComputeError, ComputeResult, Pixel};

/// Kind of command an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Host-to-device copy.
    Write,
    /// Device-to-host copy.
    Read,
    /// Kernel dispatch.
    Kernel(KernelName),
}

/// Device-side completion state behind an [`Event`].
pub(crate) trait Signal: Send + Sync {
    /// Blocks until the command has completed.
    fn wait(&self) -> ComputeResult<()>;

    /// Non-blocking completion check.
    fn is_complete(&self) -> bool;

    /// `(start, end)` in device clock nanoseconds, once complete.
    fn timestamps(&self) -> Option<(u64, u64)>;
}

/// Monotonic device clock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the device was opened.
    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// A command that completed at enqueue time.
struct Completed {
    start: u64,
    end: u64,
}

impl Signal for Completed {
    fn wait(&self) -> ComputeResult<()> {
        Ok(())
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn timestamps(&self) -> Option<(u64, u64)> {
        Some((self.start, self.end))
    }
}

/// Completion handle for one enqueued command.
#[derive(Clone)]
pub struct Event {
    command: Command,
    signal: Arc<dyn Signal>,
}

impl Event {
    /// Event for a command that already ran between `start` and `end`.
    pub(crate) fn completed(command: Command, start: u64, end: u64) -> Self {
        Self {
            command,
            signal: Arc::new(Completed { start, end }),
        }
    }

    pub(crate) fn from_signal(command: Command, signal: Arc<dyn Signal>) -> Self {
        Self { command, signal }
    }

    /// Command this event tracks.
    #[inline]
    pub fn command(&self) -> Command {
        self.command
    }

    /// Blocks until the command has completed.
    pub fn wait(&self) -> ComputeResult<()> {
        self.signal.wait()
    }

    /// True once the command has completed.
    pub fn is_complete(&self) -> bool {
        self.signal.is_complete()
    }

    /// Raw `(start, end)` device timestamps, if the command has completed.
    pub fn profile(&self) -> Option<(u64, u64)> {
        self.signal.timestamps()
    }

    /// Device time between command start and end.
    ///
    /// Waits for completion first.
    pub fn elapsed(&self) -> ComputeResult<Duration> {
        self.wait()?;
        let (start, end) = self.profile().ok_or_else(|| {
            ComputeError::device(status::PROFILING_INFO_NOT_AVAILABLE, "no timestamps recorded")
        })?;
        Ok(Duration::from_nanos(end.saturating_sub(start)))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("command", &self.command)
            .field("complete", &self.is_complete())
            .finish()
    }
}

type Resolver = Box<dyn FnOnce() -> ComputeResult<Vec<Pixel>> + Send>;

enum ReadState {
    Ready(Vec<Pixel>),
    Deferred(Resolver),
}

/// An enqueued device-to-host copy.
///
/// The data becomes available through [`PendingRead::complete`], which
/// blocks until the copy has finished.
pub struct PendingRead {
    event: Event,
    state: ReadState,
}

impl PendingRead {
    /// Read whose data is already on the host.
    pub(crate) fn ready(event: Event, data: Vec<Pixel>) -> Self {
        Self {
            event,
            state: ReadState::Ready(data),
        }
    }

    /// Read resolved later by `resolve`.
    pub(crate) fn deferred(event: Event, resolve: Resolver) -> Self {
        Self {
            event,
            state: ReadState::Deferred(resolve),
        }
    }

    /// Completion event of the copy.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Waits for the copy and returns the pixels.
    pub fn complete(self) -> ComputeResult<Vec<Pixel>> {
        match self.state {
            ReadState::Ready(data) => Ok(data),
            ReadState::Deferred(resolve) => resolve(),
        }
    }
}

impl fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("event", &self.event)
            .field("ready", &matches!(self.state, ReadState::Ready(_)))
            .finish()
    }
}
