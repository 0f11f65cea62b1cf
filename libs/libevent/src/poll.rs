//! thin safe wrapper around `epoll_create1`/`epoll_ctl`/`epoll_wait`
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::epoll_event;

#[derive(Debug)]
pub(crate) struct Poll {
    epfd: RawFd,
}

impl Poll {
    pub(crate) fn new() -> io::Result<Poll> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poll { epfd })
    }

    pub(crate) fn register(&self, fd: RawFd, event: &mut epoll_event) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// block for at most `timeout_ms` (-1 = forever, 0 = don't block)
    pub(crate) fn poll(&self, timeout_ms: i32) -> io::Result<Vec<epoll_event>> {
        let mut events: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; 64];
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(vec![]);
            }
            return Err(err);
        }
        events.truncate(n as usize);
        Ok(events)
    }
}

impl AsRawFd for Poll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Poll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
