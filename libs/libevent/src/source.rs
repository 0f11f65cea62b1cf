use std::os::unix::io::RawFd;

use crate::{Error, Events};

/// what kind of readiness a [`Source`] is registered for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventType {
    /// a readable/writable file descriptor, dispatched through epoll
    Io,
    /// a monotonic-clock timer; `time_relative()` gives the delay in microseconds
    TimerMonotonic,
}

/// whether a source is currently armed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventState {
    /// disabled: never dispatched until re-enabled
    Off,
    /// enabled: dispatched every time it becomes ready (timers: every period)
    On,
    /// enabled for exactly one dispatch, then reverts to `Off`
    OneShot,
}

/// a thing [`Events`] can wait on and dispatch
pub trait Source {
    /// the fd to poll for `EventType::Io`; ignored (use 0) for timers
    fn fd(&self) -> RawFd;

    /// which kind of readiness this source waits for
    fn event_type(&self) -> EventType;

    /// the epoll interest mask (e.g. `libc::EPOLLIN`), for `EventType::Io`
    fn epoll_event(&self) -> u32;

    /// dispatch priority: smaller runs first among sources ready in the same pass.
    /// Range -127..=128.
    fn priority(&self) -> i8 {
        0
    }

    /// for `EventType::TimerMonotonic`: microseconds until next fire
    fn time_relative(&self) -> u64 {
        0
    }

    /// run the source's work; return value is informational (0 = ok)
    fn dispatch(&self, events: &Events) -> Result<i32, Error>;

    /// a stable identifier distinguishing this source from all others
    /// registered in the same [`Events`] instance.
    fn token(&self) -> u64;
}
