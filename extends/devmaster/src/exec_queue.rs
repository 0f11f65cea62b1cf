//! execution queue (spec module I): load gate, devpath collision gate,
//! fork/exec of worker processes and `SIGCHLD` reaping.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::CString;

use log::{debug, info, warn};

use crate::error::Error;
use crate::event::Event;

/// how the daemon learns the operating system's current task load.
/// Abstracted so the collision/load gate logic is testable without a real
/// `/proc`.
pub trait SystemLoad {
    /// count of processes in the "running" state, system-wide
    fn global_running(&self) -> u32;
    /// count of processes in the "running" state within the daemon's own
    /// session (bounded lookup, never needs to exceed `cap + 10`)
    fn session_running(&self, cap: u32) -> u32;
}

/// reads `/proc/stat`'s `procs_running` and the daemon's own session via `procfs`
pub struct ProcfsLoad;

impl SystemLoad for ProcfsLoad {
    fn global_running(&self) -> u32 {
        procfs::KernelStats::new()
            .map(|stats| stats.procs_running.unwrap_or(0))
            .unwrap_or(0)
    }

    fn session_running(&self, cap: u32) -> u32 {
        let sid = nix::unistd::getsid(None).map(|s| s.as_raw()).unwrap_or(-1);
        let limit = cap.saturating_add(10);
        let mut count = 0u32;
        if let Ok(procs) = procfs::process::all_processes() {
            for proc in procs.flatten() {
                if count >= limit {
                    break;
                }
                if let Ok(stat) = proc.stat() {
                    if stat.session == sid && stat.state == 'R' {
                        count += 1;
                    }
                }
            }
        }
        count
    }
}

/// a worker currently forked and running for a devpath
#[derive(Debug, Clone)]
pub struct RunningWorker {
    pub pid: i32,
    pub devpath: String,
    pub physdevpath: Option<String>,
    pub action: String,
    pub started_at: u64,
}

/// whether two devpaths collide per the spec's identical/ancestor/descendant rule
fn devpaths_collide(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let a_prefix = format!("{a}/");
    let b_prefix = format!("{b}/");
    b.starts_with(&a_prefix) || a.starts_with(&b_prefix)
}

/// the execution queue: runnable events waiting on the load/collision
/// gates, plus the set of currently-forked workers.
pub struct ExecQueue {
    runnable: RefCell<VecDeque<Event>>,
    running: RefCell<Vec<RunningWorker>>,
    max_childs: Cell<u32>,
    max_childs_running: Cell<u32>,
    worker_bin: String,
    stopped: Cell<bool>,
}

impl ExecQueue {
    /// a fresh queue. `max_childs` bounds running workers per devpath,
    /// `max_childs_running` bounds the global running-task gate.
    pub fn new(worker_bin: String, max_childs: u32, max_childs_running: u32) -> ExecQueue {
        ExecQueue {
            runnable: RefCell::new(VecDeque::new()),
            running: RefCell::new(Vec::new()),
            max_childs: Cell::new(max_childs),
            max_childs_running: Cell::new(max_childs_running),
            worker_bin,
            stopped: Cell::new(false),
        }
    }

    /// append an event released by the ordering queue (or bypassing it)
    pub fn push(&self, event: Event) {
        self.runnable.borrow_mut().push_back(event);
    }

    /// `SET_MAX_CHILDS` control message
    pub fn set_max_childs(&self, n: u32) {
        self.max_childs.set(n);
    }

    /// `STOP_EXEC_QUEUE` control message
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// `START_EXEC_QUEUE` control message
    pub fn start(&self) {
        self.stopped.set(false);
    }

    /// number of workers currently running
    pub fn running_count(&self) -> usize {
        self.running.borrow().len()
    }

    /// run one pass: gate and fork-release as many head events as currently
    /// qualify. `load` supplies OS task counts, `fork_worker` performs the
    /// actual fork+exec (injected so tests don't fork real processes).
    pub fn run_pass(
        &self,
        now: u64,
        load: &dyn SystemLoad,
        fork_worker: &mut dyn FnMut(&Event) -> Result<i32, Error>,
    ) -> Result<(), Error> {
        if self.stopped.get() {
            return Ok(());
        }

        loop {
            let event = {
                let runnable = self.runnable.borrow();
                match runnable.front() {
                    Some(event) => event.clone(),
                    None => return Ok(()),
                }
            };

            if event.timeout_override.is_none() {
                if load.global_running() >= self.max_childs_running.get()
                    && load.session_running(self.max_childs_running.get()) >= self.max_childs_running.get()
                {
                    debug!("execution queue: stalled on system load gate");
                    return Ok(());
                }

                if self.collides_with_running(&event) {
                    debug!("execution queue: deferring {} on collision", event.devpath);
                    return Ok(());
                }

                let per_devpath = self
                    .running
                    .borrow()
                    .iter()
                    .filter(|w| w.devpath == event.devpath)
                    .count() as u32;
                if per_devpath >= self.max_childs.get() {
                    debug!("execution queue: deferring {} on max_childs", event.devpath);
                    return Ok(());
                }
            }

            let event = self.runnable.borrow_mut().pop_front().unwrap();
            let pid = fork_worker(&event)?;
            info!("execution queue: forked worker {pid} for {}", event.devpath);
            self.running.borrow_mut().push(RunningWorker {
                pid,
                devpath: event.devpath,
                physdevpath: event.physdevpath,
                action: event.action,
                started_at: now,
            });
        }
    }

    fn collides_with_running(&self, event: &Event) -> bool {
        let running = self.running.borrow();
        for worker in running.iter() {
            if devpaths_collide(&event.devpath, &worker.devpath) {
                return true;
            }
            if event.action == "add" {
                if let (Some(a), Some(b)) = (&event.physdevpath, &worker.physdevpath) {
                    if devpaths_collide(a, b) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// reap exited children with a non-blocking wait loop. `now` is used to
    /// log each worker's age. Returns `true` if anything was reaped (the
    /// caller should re-run the execution pass, since a finishing ancestor
    /// may unblock descendants).
    pub fn reap(&self, now: u64) -> bool {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        let mut reaped_any = false;
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    self.drop_running(pid.as_raw(), now, status);
                    reaped_any = true;
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    warn!("worker {pid} killed by signal {signal:?}");
                    self.drop_running(pid.as_raw(), now, -1);
                    reaped_any = true;
                }
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        reaped_any
    }

    fn drop_running(&self, pid: i32, now: u64, status: i32) {
        let mut running = self.running.borrow_mut();
        if let Some(idx) = running.iter().position(|w| w.pid == pid) {
            let worker = running.remove(idx);
            let age = now.saturating_sub(worker.started_at);
            info!(
                "worker {pid} for {} exited status={status} age={age}s",
                worker.devpath
            );
        }
    }

    /// fork the calling process, lower scheduling priority, and exec the
    /// worker binary in the child with `argv = [bin, subsystem]` and the
    /// event's environment. Never returns in the child on success.
    pub fn spawn_worker(worker_bin: &str, event: &Event) -> Result<i32, Error> {
        use nix::unistd::{fork, ForkResult};

        match unsafe { fork() }.map_err(|e| Error::Fatal {
            msg: format!("fork failed: {e}"),
        })? {
            ForkResult::Parent { child } => Ok(child.as_raw()),
            ForkResult::Child => {
                let _ = nix::sys::resource::setpriority(nix::sys::resource::PriorityWhich::Process, 0, 10);
                exec_worker(worker_bin, event);
                std::process::exit(127);
            }
        }
    }
}

fn exec_worker(worker_bin: &str, event: &Event) -> ! {
    let bin = CString::new(worker_bin).unwrap();
    let subsystem = CString::new(event.subsystem.as_str()).unwrap();
    let argv = [bin.as_c_str(), subsystem.as_c_str()];
    let envp: Vec<CString> = event
        .env
        .iter()
        .filter_map(|kv| CString::new(kv.as_str()).ok())
        .collect();
    let envp_refs: Vec<&std::ffi::CStr> = envp.iter().map(|c| c.as_c_str()).collect();

    let _ = nix::unistd::execve(&bin, &argv, &envp_refs);
    // execve only returns on failure
    std::process::exit(127)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Source;

    fn event(devpath: &str, action: &str, physdevpath: Option<&str>) -> Event {
        Event {
            seqnum: 1,
            action: action.to_string(),
            devpath: devpath.to_string(),
            subsystem: "block".to_string(),
            physdevpath: physdevpath.map(|s| s.to_string()),
            major: None,
            minor: None,
            timeout_override: None,
            env: Vec::new(),
            source: Source::Netlink,
            queue_time: 0,
            worker_pid: None,
        }
    }

    struct UnlimitedLoad;
    impl SystemLoad for UnlimitedLoad {
        fn global_running(&self) -> u32 {
            0
        }
        fn session_running(&self, _cap: u32) -> u32 {
            0
        }
    }

    struct SaturatedLoad;
    impl SystemLoad for SaturatedLoad {
        fn global_running(&self) -> u32 {
            1000
        }
        fn session_running(&self, _cap: u32) -> u32 {
            1000
        }
    }

    #[test]
    fn devpath_collision_detects_identical_ancestor_descendant() {
        assert!(devpaths_collide("/devices/a", "/devices/a"));
        assert!(devpaths_collide("/devices/a", "/devices/a/b"));
        assert!(devpaths_collide("/devices/a/b", "/devices/a"));
        assert!(!devpaths_collide("/devices/a", "/devices/ab"));
    }

    #[test]
    fn releases_when_nothing_running() {
        let q = ExecQueue::new("worker".to_string(), 8, 8);
        q.push(event("/devices/sda", "add", None));
        let mut forked = Vec::new();
        q.run_pass(0, &UnlimitedLoad, &mut |e| {
            forked.push(e.devpath.clone());
            Ok(42)
        })
        .unwrap();
        assert_eq!(forked, vec!["/devices/sda"]);
        assert_eq!(q.running_count(), 1);
    }

    #[test]
    fn defers_on_devpath_collision() {
        let q = ExecQueue::new("worker".to_string(), 8, 8);
        q.running.borrow_mut().push(RunningWorker {
            pid: 1,
            devpath: "/devices/sda".to_string(),
            physdevpath: None,
            action: "add".to_string(),
            started_at: 0,
        });
        q.push(event("/devices/sda/sda1", "add", None));
        let mut forked = Vec::new();
        q.run_pass(0, &UnlimitedLoad, &mut |e| {
            forked.push(e.devpath.clone());
            Ok(99)
        })
        .unwrap();
        assert!(forked.is_empty());
        assert_eq!(q.running.borrow().len(), 1);
    }

    #[test]
    fn stalls_entire_queue_on_load_gate() {
        let q = ExecQueue::new("worker".to_string(), 8, 8);
        q.push(event("/devices/sda", "add", None));
        let mut forked = Vec::new();
        q.run_pass(0, &SaturatedLoad, &mut |e| {
            forked.push(e.devpath.clone());
            Ok(1)
        })
        .unwrap();
        assert!(forked.is_empty());
    }

    #[test]
    fn timeout_override_bypasses_collision_gate() {
        let q = ExecQueue::new("worker".to_string(), 8, 8);
        q.running.borrow_mut().push(RunningWorker {
            pid: 1,
            devpath: "/devices/sda".to_string(),
            physdevpath: None,
            action: "add".to_string(),
            started_at: 0,
        });
        let mut urgent = event("/devices/sda", "change", None);
        urgent.timeout_override = Some(std::time::Duration::from_secs(1));
        q.push(urgent);
        let mut forked = Vec::new();
        q.run_pass(0, &SaturatedLoad, &mut |e| {
            forked.push(e.devpath.clone());
            Ok(2)
        })
        .unwrap();
        assert_eq!(forked, vec!["/devices/sda"]);
    }

    #[test]
    fn reap_removes_from_running_set() {
        let q = ExecQueue::new("worker".to_string(), 8, 8);
        q.running.borrow_mut().push(RunningWorker {
            pid: std::process::id() as i32,
            devpath: "/devices/sda".to_string(),
            physdevpath: None,
            action: "add".to_string(),
            started_at: 0,
        });
        // directly exercise drop_running since waitpid on our own pid isn't meaningful here
        q.drop_running(std::process::id() as i32, 10, 0);
        assert!(q.running.borrow().is_empty());
    }
}
