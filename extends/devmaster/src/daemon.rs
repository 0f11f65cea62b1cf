//! daemon loop (spec module J): wires the helper socket, the netlink
//! uevent socket and a self-pipe signal source into a single-threaded
//! [`libevent::Events`] reactor.
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use libevent::{EventState, EventType, Events, Source};
use log::{debug, info, warn};
use nix::sys::socket::{bind, recvfrom, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use signal_hook::consts::{SIGALRM, SIGCHLD, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::config::DaemonConfig;
use crate::control;
use crate::error::Error;
use crate::event::Event;
use crate::event_queue::EventQueue;
use crate::exec_queue::{ExecQueue, ProcfsLoad};

const NETLINK_KOBJECT_UEVENT: i32 = 15;
const MAX_DATAGRAM: usize = 8192;

/// peer credentials (uid/gid/pid) read off a `SCM_CREDENTIALS` ancillary
/// message. Only datagrams from uid 0 are honoured.
fn peer_is_root(fd: RawFd) -> bool {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    match getsockopt(fd, PeerCredentials) {
        Ok(creds) => creds.uid() == 0,
        Err(_) => false,
    }
}

/// the abstract-namespace datagram socket helpers submit events and
/// control messages on.
pub struct HelperSocket {
    fd: RawFd,
}

impl HelperSocket {
    /// bind an `AF_UNIX` datagram socket at an abstract address (no
    /// filesystem entry, survives the daemon's own crash-restart).
    pub fn bind(name: &str) -> Result<HelperSocket, Error> {
        // CLOEXEC keeps this fd from leaking into forked worker processes;
        // spec §4.I requires the child to start with the daemon's sockets closed.
        let flags = SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC;
        let fd = socket(AddressFamily::Unix, SockType::Datagram, flags, None).map_err(|e| {
            Error::Fatal {
                msg: format!("failed to create helper socket: {e}"),
            }
        })?;
        let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(|e| Error::Fatal {
            msg: format!("bad abstract socket name: {e}"),
        })?;
        bind(fd, &nix::sys::socket::SockAddr::Unix(addr)).map_err(|e| Error::Fatal {
            msg: format!("failed to bind helper socket: {e}"),
        })?;
        Ok(HelperSocket { fd })
    }

    fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match recvfrom::<UnixAddr>(self.fd, &mut buf) {
            Ok((n, _)) => {
                if !peer_is_root(self.fd) {
                    warn!("helper socket: rejecting datagram from non-root peer");
                    return None;
                }
                Some(buf[..n].to_vec())
            }
            Err(_) => None,
        }
    }
}

/// the kernel uevent netlink socket, joined to all multicast groups.
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// open and bind `NETLINK_KOBJECT_UEVENT` with `nl_groups = !0` (all groups).
    ///
    /// nix's typed `SockProtocol` only covers a handful of address families
    /// and has no netlink variants, so the socket and bind go through raw
    /// `libc` calls with a manually built `sockaddr_nl`, same as any other
    /// netlink user has to.
    pub fn open() -> Result<NetlinkSocket, Error> {
        // CLOEXEC here for the same reason as the helper socket: forked
        // worker processes must not inherit the daemon's netlink socket.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(Error::Fatal {
                msg: format!("failed to create netlink socket: {}", std::io::Error::last_os_error()),
            });
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = !0u32;

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Fatal {
                msg: format!("failed to bind netlink socket: {err}"),
            });
        }

        Ok(NetlinkSocket { fd })
    }

    fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            None
        } else {
            Some(buf[..n as usize].to_vec())
        }
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// the pending-wakeup flags a signal handler can only set, never act on;
/// the main loop reads and clears them between readiness wakes.
#[derive(Default)]
struct SignalFlags {
    exit: Cell<bool>,
    run_ordering_pass: Cell<bool>,
    reap: Cell<bool>,
}

/// the running daemon: owns every queue and socket, and is itself not a
/// `Source` — its sources are the three structs above, each dispatching
/// back into shared state via `Rc<RefCell<_>>`.
pub struct Daemon {
    config: DaemonConfig,
    event_queue: EventQueue,
    exec_queue: Rc<ExecQueue>,
    helper: HelperSocket,
    netlink: NetlinkSocket,
    /// self-pipe: converts SIGINT/SIGTERM/SIGALRM/SIGCHLD into an ordinary
    /// readable fd, per the design's self-pipe requirement
    signals: RefCell<Signals>,
    flags: Rc<SignalFlags>,
    seen_netlink: Cell<bool>,
    events: Rc<Events>,
    /// microseconds the ordering timer is next armed for; written by
    /// [`Daemon::arm_ordering_timer`], read by [`OrderingTimer::time_relative`]
    ordering_delay: Rc<Cell<u64>>,
    /// the registered ordering-recheck timer, once `run()` has added it
    ordering_timer: RefCell<Option<Rc<dyn Source>>>,
}

impl Daemon {
    /// bind sockets, install the self-pipe signal handlers, and build the
    /// daemon. Does not yet register sources or run the loop.
    pub fn bootstrap(config: DaemonConfig) -> Result<Daemon, Error> {
        let helper = HelperSocket::bind("devmasterd")?;
        let netlink = NetlinkSocket::open()?;

        let signals = Signals::new([SIGINT, SIGTERM, SIGALRM, SIGCHLD]).map_err(|e| Error::Fatal {
            msg: format!("failed to install signal self-pipe: {e}"),
        })?;

        let exec_queue = Rc::new(ExecQueue::new(
            config.udev_bin.clone(),
            config.max_childs,
            config.max_childs_running,
        ));

        Ok(Daemon {
            event_queue: EventQueue::new(config.expected_seqnum, config.event_timeout),
            exec_queue,
            helper,
            netlink,
            signals: RefCell::new(signals),
            flags: Rc::new(SignalFlags::default()),
            seen_netlink: Cell::new(false),
            events: Events::new().map_err(Error::Event)?,
            ordering_delay: Rc::new(Cell::new(0)),
            ordering_timer: RefCell::new(None),
            config,
        })
    }

    fn now(&self) -> u64 {
        nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map(|ts| ts.tv_sec() as u64)
            .unwrap_or(0)
    }

    /// drain a helper datagram: either a control message, or an event
    /// (subject to the "netlink is authoritative once seen" rule).
    fn handle_helper_datagram(&self, buf: Vec<u8>) {
        match control::parse(&buf) {
            Ok(Some(message)) => control::apply(&message, &self.exec_queue),
            Ok(None) => self.handle_helper_event(&buf),
            Err(e) => debug!("helper socket: malformed datagram {e:?}"),
        }
    }

    fn handle_helper_event(&self, buf: &[u8]) {
        let now = self.now();
        match Event::parse_helper(buf, now) {
            Ok(event) => {
                if self.seen_netlink.get() && event.seqnum != 0 {
                    debug!("helper event {} superseded by netlink, dropping", event.seqnum);
                    return;
                }
                self.insert_event(event, now);
            }
            Err(e) => debug!("helper socket: malformed event {e:?}"),
        }
    }

    fn handle_netlink_datagram(&self, buf: Vec<u8>) {
        self.seen_netlink.set(true);
        let now = self.now();
        match Event::parse_netlink(&buf, now) {
            Ok(event) => self.insert_event(event, now),
            Err(e) => debug!("netlink socket: malformed event {e:?}"),
        }
    }

    fn insert_event(&self, event: Event, now: u64) {
        let exec_queue = self.exec_queue.clone();
        self.event_queue.insert(event, now, &mut |event| exec_queue.push(event));
        // a fresh insertion can itself satisfy the expected seqnum, or
        // change when the next hole times out, so re-run ordering now
        // rather than waiting for the timer or an unrelated wakeup.
        self.run_ordering_pass();
    }

    /// release whatever the ordering queue will give up right now, then
    /// re-arm the one-shot timer to the microseconds it reports remain
    /// until the next hole times out (spec §4.H).
    fn run_ordering_pass(&self) {
        let now = self.now();
        let exec_queue = self.exec_queue.clone();
        let next_deadline = self.event_queue.run_pass(now, |event| exec_queue.push(event));
        self.arm_ordering_timer(next_deadline);
    }

    fn arm_ordering_timer(&self, next_deadline_micros: Option<u64>) {
        let micros = match next_deadline_micros {
            Some(micros) => micros,
            None => return,
        };
        let timer = match self.ordering_timer.borrow().clone() {
            Some(timer) => timer,
            None => return,
        };
        self.ordering_delay.set(micros);
        if let Err(e) = self.events.set_enabled(timer, EventState::OneShot) {
            warn!("failed to arm ordering-queue timer: {e}");
        }
    }

    fn run_execution_pass(&self) {
        let now = self.now();
        let load = ProcfsLoad;
        let worker_bin = self.config.udev_bin.clone();
        let _ = self.exec_queue.run_pass(now, &load, &mut |event| {
            crate::exec_queue::ExecQueue::spawn_worker(&worker_bin, event)
        });
    }

    fn handle_signal_wakeup(&self) {
        for signal in self.signals.borrow_mut().pending() {
            match signal {
                SIGINT | SIGTERM => {
                    info!("received signal {signal}, shutting down");
                    self.flags.exit.set(true);
                    self.events.exit();
                }
                SIGALRM => self.flags.run_ordering_pass.set(true),
                SIGCHLD => self.flags.reap.set(true),
                _ => {}
            }
        }
    }

    /// register all three sources and run the readiness loop until
    /// `SIGINT`/`SIGTERM`.
    pub fn run(self: Rc<Self>) -> Result<(), Error> {
        info!("devmasterd starting, record store at {:?}", self.config.record_store_path);

        let helper_source: Rc<dyn Source> = Rc::new(HelperDispatch { daemon: self.clone() });
        let netlink_source: Rc<dyn Source> = Rc::new(NetlinkDispatch { daemon: self.clone() });
        let signal_source: Rc<dyn Source> = Rc::new(SignalDispatch { daemon: self.clone() });
        let ordering_timer: Rc<dyn Source> = Rc::new(OrderingTimer {
            daemon: self.clone(),
            delay: self.ordering_delay.clone(),
        });

        self.events.add_source(helper_source)?;
        self.events.add_source(netlink_source)?;
        self.events.add_source(signal_source)?;
        self.events.add_source(ordering_timer.clone())?;
        *self.ordering_timer.borrow_mut() = Some(ordering_timer);

        while !self.flags.exit.get() {
            self.events.run_once()?;

            if self.flags.run_ordering_pass.replace(false) {
                self.run_ordering_pass();
            }
            if self.flags.reap.replace(false) {
                let now = self.now();
                if self.exec_queue.reap(now) {
                    self.run_execution_pass();
                }
            }
            self.run_execution_pass();
        }

        info!("devmasterd exiting cleanly");
        Ok(())
    }
}

struct HelperDispatch {
    daemon: Rc<Daemon>,
}

impl Source for HelperDispatch {
    fn fd(&self) -> RawFd {
        self.daemon.helper.fd
    }
    fn event_type(&self) -> EventType {
        EventType::Io
    }
    fn epoll_event(&self) -> u32 {
        libc::EPOLLIN as u32
    }
    fn priority(&self) -> i8 {
        0
    }
    fn dispatch(&self, _events: &Events) -> Result<i32, libevent::Error> {
        if let Some(buf) = self.daemon.helper.recv() {
            self.daemon.handle_helper_datagram(buf);
        }
        Ok(0)
    }
    fn token(&self) -> u64 {
        self as *const Self as u64
    }
}

struct NetlinkDispatch {
    daemon: Rc<Daemon>,
}

impl Source for NetlinkDispatch {
    fn fd(&self) -> RawFd {
        self.daemon.netlink.fd
    }
    fn event_type(&self) -> EventType {
        EventType::Io
    }
    fn epoll_event(&self) -> u32 {
        libc::EPOLLIN as u32
    }
    fn priority(&self) -> i8 {
        -10
    }
    fn dispatch(&self, _events: &Events) -> Result<i32, libevent::Error> {
        if let Some(buf) = self.daemon.netlink.recv() {
            self.daemon.handle_netlink_datagram(buf);
        }
        Ok(0)
    }
    fn token(&self) -> u64 {
        self as *const Self as u64
    }
}

struct SignalDispatch {
    daemon: Rc<Daemon>,
}

impl Source for SignalDispatch {
    fn fd(&self) -> RawFd {
        self.daemon.signals.borrow().as_raw_fd()
    }
    fn event_type(&self) -> EventType {
        EventType::Io
    }
    fn epoll_event(&self) -> u32 {
        libc::EPOLLIN as u32
    }
    fn priority(&self) -> i8 {
        -100
    }
    fn dispatch(&self, _events: &Events) -> Result<i32, libevent::Error> {
        self.daemon.handle_signal_wakeup();
        Ok(0)
    }
    fn token(&self) -> u64 {
        self as *const Self as u64
    }
}

/// one-shot monotonic timer that re-checks the ordering queue once a held
/// event's timeout elapses, per spec §4.H. `delay` is updated by
/// [`Daemon::arm_ordering_timer`] just before each re-arm.
struct OrderingTimer {
    daemon: Rc<Daemon>,
    delay: Rc<Cell<u64>>,
}

impl Source for OrderingTimer {
    fn fd(&self) -> RawFd {
        0
    }
    fn event_type(&self) -> EventType {
        EventType::TimerMonotonic
    }
    fn epoll_event(&self) -> u32 {
        0
    }
    fn priority(&self) -> i8 {
        -5
    }
    fn time_relative(&self) -> u64 {
        self.delay.get()
    }
    fn dispatch(&self, _events: &Events) -> Result<i32, libevent::Error> {
        self.daemon.run_ordering_pass();
        Ok(0)
    }
    fn token(&self) -> u64 {
        self as *const Self as u64
    }
}
