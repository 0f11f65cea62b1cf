use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::poll::Poll;
use crate::source::{EventState, EventType, Source};
use crate::Error;

struct TimerEntry {
    source: Rc<dyn Source>,
    state: EventState,
    deadline: Instant,
}

struct IoEntry {
    source: Rc<dyn Source>,
    state: EventState,
}

/// the reactor: multiplexes I/O sources and monotonic timers through one
/// `epoll_wait` and dispatches ready sources in priority order.
pub struct Events {
    poll: Poll,
    io_sources: RefCell<HashMap<u64, IoEntry>>,
    timer_sources: RefCell<HashMap<u64, TimerEntry>>,
    exiting: Cell<bool>,
}

impl Events {
    /// create a new, empty reactor
    pub fn new() -> Result<Rc<Events>, Error> {
        let poll = Poll::new().map_err(|source| Error::Epoll {
            msg: "epoll_create1 failed".to_string(),
            source,
        })?;
        Ok(Rc::new(Events {
            poll,
            io_sources: RefCell::new(HashMap::new()),
            timer_sources: RefCell::new(HashMap::new()),
            exiting: Cell::new(false),
        }))
    }

    /// register a source. I/O sources start enabled; timers start disabled
    /// until [`Events::set_enabled`] arms them.
    pub fn add_source(&self, source: Rc<dyn Source>) -> Result<(), Error> {
        let token = source.token();
        match source.event_type() {
            EventType::Io => {
                if self.io_sources.borrow().contains_key(&token) {
                    return Err(Error::AlreadyRegistered(token));
                }
                let mut ev = libc::epoll_event {
                    events: source.epoll_event(),
                    u64: token,
                };
                self.poll
                    .register(source.fd(), &mut ev)
                    .map_err(|e| Error::Epoll {
                        msg: "epoll_ctl(ADD) failed".to_string(),
                        source: e,
                    })?;
                self.io_sources.borrow_mut().insert(
                    token,
                    IoEntry {
                        source,
                        state: EventState::On,
                    },
                );
            }
            EventType::TimerMonotonic => {
                if self.timer_sources.borrow().contains_key(&token) {
                    return Err(Error::AlreadyRegistered(token));
                }
                self.timer_sources.borrow_mut().insert(
                    token,
                    TimerEntry {
                        deadline: Instant::now(),
                        state: EventState::Off,
                        source,
                    },
                );
            }
        }
        Ok(())
    }

    /// unregister a source entirely
    pub fn del_source(&self, source: Rc<dyn Source>) -> Result<(), Error> {
        let token = source.token();
        match source.event_type() {
            EventType::Io => {
                if self.io_sources.borrow_mut().remove(&token).is_none() {
                    return Err(Error::NotFound(token));
                }
                self.poll.unregister(source.fd()).map_err(|e| Error::Epoll {
                    msg: "epoll_ctl(DEL) failed".to_string(),
                    source: e,
                })?;
            }
            EventType::TimerMonotonic => {
                if self.timer_sources.borrow_mut().remove(&token).is_none() {
                    return Err(Error::NotFound(token));
                }
            }
        }
        Ok(())
    }

    /// enable, disable, or arm-once a registered source
    pub fn set_enabled(&self, source: Rc<dyn Source>, state: EventState) -> Result<(), Error> {
        let token = source.token();
        match source.event_type() {
            EventType::Io => {
                let mut sources = self.io_sources.borrow_mut();
                let entry = sources.get_mut(&token).ok_or(Error::NotFound(token))?;
                entry.state = state;
            }
            EventType::TimerMonotonic => {
                let mut timers = self.timer_sources.borrow_mut();
                let entry = timers.get_mut(&token).ok_or(Error::NotFound(token))?;
                entry.state = state;
                if state != EventState::Off {
                    entry.deadline =
                        Instant::now() + Duration::from_micros(entry.source.time_relative());
                }
            }
        }
        Ok(())
    }

    /// ask the reactor to stop after the current dispatch pass
    pub fn exit(&self) {
        self.exiting.set(true);
    }

    fn next_timeout_ms(&self) -> i32 {
        let now = Instant::now();
        let mut timeout: Option<Duration> = None;
        for entry in self.timer_sources.borrow().values() {
            if entry.state == EventState::Off {
                continue;
            }
            let remaining = entry.deadline.saturating_duration_since(now);
            timeout = Some(match timeout {
                Some(t) if t <= remaining => t,
                _ => remaining,
            });
        }
        match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        }
    }

    /// run exactly one wait+dispatch pass
    pub fn run_once(&self) -> Result<(), Error> {
        let timeout_ms = self.next_timeout_ms();
        let ready = self.poll.poll(timeout_ms).map_err(|source| Error::Epoll {
            msg: "epoll_wait failed".to_string(),
            source,
        })?;

        let mut due: Vec<Rc<dyn Source>> = Vec::new();

        {
            let io_sources = self.io_sources.borrow();
            for ev in &ready {
                if let Some(entry) = io_sources.get(&ev.u64) {
                    if entry.state != EventState::Off {
                        due.push(entry.source.clone());
                    }
                }
            }
        }

        let now = Instant::now();
        let mut fired_oneshot: Vec<u64> = Vec::new();
        let mut to_reschedule: Vec<u64> = Vec::new();
        {
            let timers = self.timer_sources.borrow();
            for (token, entry) in timers.iter() {
                if entry.state == EventState::Off {
                    continue;
                }
                if entry.deadline <= now {
                    due.push(entry.source.clone());
                    match entry.state {
                        EventState::OneShot => fired_oneshot.push(*token),
                        EventState::On => to_reschedule.push(*token),
                        EventState::Off => {}
                    }
                }
            }
        }

        due.sort_by_key(|s| s.priority());

        for source in due {
            if let Err(e) = source.dispatch(self) {
                log::error!("source dispatch failed: {e}");
            }
        }

        if !fired_oneshot.is_empty() || !to_reschedule.is_empty() {
            let mut timers = self.timer_sources.borrow_mut();
            for token in fired_oneshot {
                if let Some(entry) = timers.get_mut(&token) {
                    entry.state = EventState::Off;
                }
            }
            for token in to_reschedule {
                if let Some(entry) = timers.get_mut(&token) {
                    entry.deadline =
                        Instant::now() + Duration::from_micros(entry.source.time_relative());
                }
            }
        }

        Ok(())
    }

    /// run the reactor until [`Events::exit`] is called
    pub fn rloop(&self) -> Result<(), Error> {
        self.exiting.set(false);
        while !self.exiting.get() {
            self.run_once()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("io_sources", &self.io_sources.borrow().len())
            .field("timer_sources", &self.timer_sources.borrow().len())
            .finish()
    }
}
