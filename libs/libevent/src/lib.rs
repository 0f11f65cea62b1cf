//! small epoll-based reactor shared by the devmaster daemon components.
//!
//! A [`Source`] registers either an I/O fd or a monotonic timer; [`Events`]
//! multiplexes all registered sources through a single `epoll_wait` and
//! dispatches the highest-priority ready source first.
mod error;
mod events;
mod poll;
mod source;

pub use error::Error;
pub use events::Events;
pub use source::{EventState, EventType, Source};
