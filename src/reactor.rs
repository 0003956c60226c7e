/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Reactor: a thin wrapper over `epoll`, delivering events that carry an
//! opaque per-connection handle. Ported from `original_source/src/epoll.c`,
//! keeping its edge-triggered, one-shot registration discipline.

use std::io;
use std::os::unix::io::RawFd;

use crate::arena::ConnId;

/// What the caller asked the reactor to watch a descriptor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// One readiness notification. `conn` is the opaque per-connection handle
/// registered alongside the descriptor; `None` identifies the listening
/// socket, which is registered without one. The reactor deliberately does
/// not report the raw fd: the listener's fd is already known to the caller,
/// and every other event's fd is `Connection::fd` behind `conn`.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub conn: Option<ConnId>,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Thin `epoll` wrapper. Edge-triggered (`EPOLLET`) everywhere; one-shot
/// (`EPOLLONESHOT`) is requested per-registration by the caller via
/// [`Reactor::register`]'s `oneshot` flag, since the listening socket is
/// registered without it to let the accept handler drain the backlog to
/// `EAGAIN` in one notification.
pub struct Reactor {
    epfd: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Reactor { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: data };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers `fd` for `interest`, edge-triggered, carrying `conn` as the
    /// opaque handle (packed via [`ConnId::to_raw`]). `oneshot` adds
    /// `EPOLLONESHOT`: required for every connection fd, not used for the
    /// listener.
    pub fn register(&self, fd: RawFd, interest: Interest, conn: Option<ConnId>, oneshot: bool) -> io::Result<()> {
        let mut events = libc::EPOLLET as u32;
        events |= match interest {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        };
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        let data = conn.map(|c| c.to_raw()).unwrap_or(u64::MAX);
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, data)
    }

    /// Re-arms an existing one-shot registration for a (possibly new)
    /// interest. Used by the read- and write-handlers when they hand a
    /// connection back to the reactor.
    pub fn reregister(&self, fd: RawFd, interest: Interest, conn: ConnId, oneshot: bool) -> io::Result<()> {
        let mut events = libc::EPOLLET as u32;
        events |= match interest {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        };
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, conn.to_raw())
    }

    /// Deregisters `fd`. Happens on handler entry, before the handler
    /// mutates connection state, so the fd is never concurrently queued
    /// while a handler runs. Deregistering an fd that was already removed
    /// is tolerated: the kernel returns `ENOENT`, which this treats as
    /// success.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Blocks for up to `timeout_ms` (`None` = forever, per
    /// [`crate::timer::INFINITE_TIMEOUT`]) and returns the ready events.
    /// `capacity` bounds how many events are fetched in one call (mirrors
    /// `original_source`'s `MAXEVENTS`).
    pub fn wait(&self, timeout_ms: Option<u64>, capacity: usize) -> io::Result<Vec<Event>> {
        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];
        let timeout = match timeout_ms {
            None => -1,
            Some(ms) => ms.min(i32::MAX as u64) as i32,
        };
        let n = unsafe { libc::epoll_wait(self.epfd, buf.as_mut_ptr(), capacity as i32, timeout) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut events = Vec::with_capacity(n as usize);
        for ev in &buf[..n as usize] {
            let conn = if ev.u64 == u64::MAX { None } else { Some(ConnId::from_raw(ev.u64)) };
            events.push(Event {
                conn,
                readable: ev.events & (libc::EPOLLIN as u32) != 0,
                writable: ev.events & (libc::EPOLLOUT as u32) != 0,
                error: ev.events & ((libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0,
            });
        }
        Ok(events)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

// SAFETY: the epoll fd is only ever accessed through the syscalls above,
// all of which are individually thread-safe per epoll(7) ("a single epoll
// fd can be used by multiple threads").
unsafe impl Send for Reactor {}
unsafe impl Sync for Reactor {}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readable_event_carries_the_registered_handle() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        let id = ConnId::from_raw(42);
        reactor.register(b, Interest::Read, Some(id), true).unwrap();

        unsafe {
            libc::write(a, b"x".as_ptr() as *const _, 1);
        }

        let events = reactor.wait(Some(1000), 8).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
        assert_eq!(events[0].conn, Some(id));

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn oneshot_registration_does_not_fire_twice_without_rearm() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        reactor.register(b, Interest::Read, None, true).unwrap();
        unsafe {
            libc::write(a, b"x".as_ptr() as *const _, 1);
        }
        let first = reactor.wait(Some(1000), 8).unwrap();
        assert_eq!(first.len(), 1);

        unsafe {
            libc::write(a, b"y".as_ptr() as *const _, 1);
        }
        let second = reactor.wait(Some(200), 8).unwrap();
        assert!(second.is_empty(), "one-shot registration must not re-fire before rearm");

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn deregistering_an_already_removed_fd_is_tolerated() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        reactor.register(b, Interest::Read, None, true).unwrap();
        reactor.deregister(b).unwrap();
        assert!(reactor.deregister(b).is_ok());
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
