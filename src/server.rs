/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! The server aggregate: owns the listening socket, the reactor, the
//! connection arena, the timer index and the thread pool, and implements
//! the accept/read/write handlers plus the main dispatch loop. This is the
//! "how the handlers cooperate" half of the connection engine;
//! [`crate::conn`] owns "what a connection is".

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::arena::{Arena, ConnId, SharedArena};
use crate::conn::{self, Connection, ParsePhase, ResponseDescriptor};
use crate::parser::Step;
use crate::pool::ThreadPool;
use crate::reactor::{Event, Interest, Reactor};
use crate::timer::{self, TimerIndex};

/// Matches `original_source/include/epoll.h`'s `MAXEVENTS`: how many ready
/// events [`Reactor::wait`] fetches in one call.
const MAX_EVENTS: usize = 1024;
/// Idle connection timeout.
const IDLE_TIMEOUT_MS: u64 = timer::DEFAULT_TIMEOUT_MS;
/// Backlog handed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Everything a handler needs, shared behind `Arc` across the reactor
/// thread and every thread-pool worker.
pub struct Server {
    listener_fd: RawFd,
    reactor: Reactor,
    arena: SharedArena<Connection>,
    timers: TimerIndex,
    pool: ThreadPool,
    root: Arc<PathBuf>,
}

impl Server {
    /// Binds `ip_addr:port`, spawns `thread_num` workers, and registers the
    /// listening socket with the reactor. No one-shot here: the accept
    /// handler drains the listener level by level across edges until
    /// `EAGAIN`, and concurrent `accept()` calls on the same fd are safe
    /// per `accept(2)`.
    pub fn bind(ip_addr: &str, port: u16, root: PathBuf, thread_num: usize) -> io::Result<Server> {
        let listener_fd = open_listenfd(ip_addr, port)?;

        let reactor = Reactor::new()?;
        if let Err(err) = reactor.register(listener_fd, Interest::Read, None, false) {
            unsafe {
                libc::close(listener_fd);
            }
            return Err(err);
        }

        Ok(Server {
            listener_fd,
            reactor,
            arena: SharedArena::new(Arena::new()),
            timers: TimerIndex::new(),
            pool: ThreadPool::new(thread_num, "swiftd-worker"),
            root: Arc::new(root),
        })
    }

    /// The main reactor loop: wait for events, hand each ready descriptor
    /// to the thread pool, then sweep expired timers. Runs forever;
    /// returns only on an unrecoverable `epoll_wait` error.
    pub fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            let timeout = self.timers.next_deadline_ms();
            let events = self.reactor.wait(timeout, MAX_EVENTS)?;

            for ev in events {
                self.dispatch(ev);
            }

            for id in self.timers.expire_due() {
                let server = Arc::clone(&self);
                if self.pool.submit(move || server.close_connection(id)).is_err() {
                    log::warn!("worker queue full, expiring connection on reactor thread");
                    self.close_connection(id);
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, ev: Event) {
        match ev.conn {
            None => {
                let server = Arc::clone(self);
                if server.pool.submit(move || server.accept_handler()).is_err() {
                    log::warn!("worker queue full, dropping an accept notification");
                }
            }
            Some(id) => {
                let server = Arc::clone(self);
                if ev.writable {
                    if server.pool.submit(move || server.write_handler(id)).is_err() {
                        log::warn!("worker queue full, dropping a write-ready notification for {id:?}");
                    }
                } else {
                    // readable, error/hangup, or both: the read handler
                    // treats a zero-byte read (which an EPOLLERR/HUP fd
                    // will produce) as EOF and closes the connection.
                    if server.pool.submit(move || server.read_handler(id)).is_err() {
                        log::warn!("worker queue full, dropping a read-ready notification for {id:?}");
                    }
                }
            }
        }
    }

    /// Accepts every pending connection until `accept4` returns `EAGAIN`.
    /// The original only ever accepts one connection per notification,
    /// which under edge-triggering can leave connections stranded in the
    /// backlog; draining to `EAGAIN` fixes that.
    fn accept_handler(&self) {
        loop {
            let accepted = unsafe {
                libc::accept4(self.listener_fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK)
            };
            if accepted < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    log::warn!("accept4 failed: {err}");
                }
                return;
            }
            self.admit(accepted);
        }
    }

    fn admit(&self, fd: RawFd) {
        let conn = Connection::new(fd, Arc::clone(&self.root));
        let id = {
            let mut arena = self.arena.lock().unwrap();
            arena.insert(conn)
        };
        if let Err(err) = self.reactor.register(fd, Interest::Read, Some(id), true) {
            log::warn!("failed to register accepted connection: {err}");
            self.close_connection(id);
            return;
        }
        self.arm_timer(id, IDLE_TIMEOUT_MS);
    }

    fn arm_timer(&self, id: ConnId, delay_ms: u64) {
        let deadline = self.timers.add(id, delay_ms);
        let mut arena = self.arena.lock().unwrap();
        if let Some(conn) = arena.get_mut(id) {
            conn.timerset = true;
            conn.timer_deadline = deadline;
        } else {
            // lost the race with a close that already tore down the slot;
            // undo the timer we just armed for a connection that no longer
            // exists.
            drop(arena);
            self.timers.del(id, deadline);
        }
    }

    /// Deregisters `id`'s current reactor interest and deletes its timer.
    /// A handler takes exclusive ownership of a connection before touching
    /// it, so no other thread can be woken for the same fd while this
    /// handler runs.
    fn take_ownership(&self, id: ConnId) -> Option<RawFd> {
        let mut arena = self.arena.lock().unwrap();
        let conn = arena.get_mut(id)?;
        let fd = conn.fd;
        if conn.timerset {
            conn.timerset = false;
            let deadline = conn.timer_deadline;
            drop(arena);
            self.timers.del(id, deadline);
        }
        let _ = self.reactor.deregister(fd);
        Some(fd)
    }

    /// Reads as much as is currently available, feeding the resumable
    /// request parser whatever bytes came in on each pass.
    fn read_handler(&self, id: ConnId) {
        let Some(fd) = self.take_ownership(id) else { return };

        loop {
            let parsed = {
                let mut arena = self.arena.lock().unwrap();
                let Some(conn) = arena.get_mut(id) else { return };
                if conn.ring.is_full() {
                    // the request line or headers exceed the receive
                    // buffer's capacity; close rather than grow the buffer.
                    None
                } else {
                    let n = match read_once(fd, conn.ring.writable_slice()) {
                        Ok(0) => {
                            drop(arena);
                            self.close_connection(id);
                            return;
                        }
                        Ok(n) => n,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            drop(arena);
                            self.reactor_rearm_read(id, fd);
                            return;
                        }
                        Err(err) => {
                            log::debug!("read failed on fd {fd}: {err}");
                            drop(arena);
                            self.close_connection(id);
                            return;
                        }
                    };
                    conn.ring.record_filled(n);
                    Some(conn.parse_step())
                }
            };

            match parsed {
                None => {
                    self.close_connection(id);
                    return;
                }
                Some(Ok(Step::Again)) => continue,
                Some(Ok(Step::Done)) => {
                    if let Err(err) = self.reactor.reregister(fd, Interest::Write, id, true) {
                        log::warn!("failed to arm write interest for fd {fd}: {err}");
                        self.close_connection(id);
                    }
                    return;
                }
                Some(Err(err)) => {
                    log::debug!("request parse failed on fd {fd}: {err}");
                    self.close_connection(id);
                    return;
                }
            }
        }
    }

    fn reactor_rearm_read(&self, id: ConnId, fd: RawFd) {
        if let Err(err) = self.reactor.reregister(fd, Interest::Read, id, true) {
            log::warn!("failed to re-arm read interest for fd {fd}: {err}");
            self.close_connection(id);
            return;
        }
        self.arm_timer(id, IDLE_TIMEOUT_MS);
    }

    /// Resolves the request to a file, emits the status line, headers and
    /// (unless `modified` is false, i.e. a 304) the body, then either resets
    /// the connection for keep-alive reuse or closes it.
    fn write_handler(&self, id: ConnId) {
        let Some(fd) = self.take_ownership(id) else { return };

        let (root, raw_uri, headers) = {
            let mut arena = self.arena.lock().unwrap();
            let Some(conn) = arena.get_mut(id) else { return };
            (Arc::clone(&conn.root), conn.raw_uri(), std::mem::take(&mut conn.headers.headers))
        };

        // An over-long URI closes without a response (`original_source/
        // src/http.c`'s `parse_uri` just logs and returns); path traversal
        // is rejected the same way.
        let path = match conn::resolve_path(&root, &raw_uri) {
            Ok(path) => path,
            Err(err) => {
                log::debug!("rejecting {raw_uri:?}: {err}");
                self.close_connection(id);
                return;
            }
        };

        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                self.send_error(fd, 403, "Forbidden", &raw_uri);
                self.close_connection(id);
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.send_error(fd, 404, "Not Found", &raw_uri);
                self.close_connection(id);
                return;
            }
            Err(_) => {
                self.send_error(fd, 403, "Forbidden", &raw_uri);
                self.close_connection(id);
                return;
            }
        };

        let mtime: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::<Utc>::from);
        let mut resp = ResponseDescriptor::new(fd);
        resp.mtime = mtime;
        resp.status = 200;
        conn::apply_headers(&headers, &mut resp);

        let body_len = meta.len();
        let content_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(crate::mime::lookup)
            .unwrap_or("text/plain");

        // Header order and omissions follow `original_source/src/http.c`'s
        // `serve_static` exactly: keep-alive headers only when keep-alive,
        // content headers only when `modified` (a 304 gets neither), no
        // `Connection: close` line in the non-keep-alive case (the original
        // sends none, relying on the peer to notice the close).
        let mut head = String::with_capacity(256);
        use std::fmt::Write as _;
        let reason = if resp.status == 304 { "Not Modified" } else { "OK" };
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", resp.status, reason);
        if resp.keep_alive {
            head.push_str("Connection: keep-alive\r\n");
            let _ = write!(head, "Keep-Alive: timeout={}\r\n", IDLE_TIMEOUT_MS / 1000);
        }
        if resp.modified {
            let _ = write!(head, "Content-Type: {content_type}\r\n");
            let _ = write!(head, "Content-Length: {body_len}\r\n");
            if let Some(mtime) = resp.mtime {
                let _ = write!(head, "Last-Modified: {}\r\n", conn::format_http_date(mtime));
            }
        }
        head.push_str("Server: Swift\r\n");
        head.push_str("\r\n");

        if write_all_retrying(fd, head.as_bytes()).is_err() {
            self.close_connection(id);
            return;
        }

        // `original_source/src/http.c`'s `serve_static` never branches on
        // method: GET, HEAD and POST are all served identically for static
        // files, so the body is sent whenever `modified` is true, full
        // stop.
        if resp.modified && body_len > 0 {
            if let Err(err) = send_mapped_file(fd, &path, body_len) {
                log::debug!("failed sending body for {path:?}: {err}");
                self.close_connection(id);
                return;
            }
        }

        if resp.keep_alive {
            self.reset_for_keep_alive(id, fd);
        } else {
            self.close_connection(id);
        }
    }

    fn send_error(&self, fd: RawFd, status: u16, reason: &str, cause: &str) {
        let body = crate::error_page::render(status, reason, cause);
        let mut head = String::with_capacity(128);
        use std::fmt::Write as _;
        let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");
        head.push_str("Server: Swift\r\nConnection: close\r\n");
        let _ = write!(head, "Content-Type: text/html\r\nContent-Length: {}\r\n\r\n", body.len());
        head.push_str(&body);
        let _ = write_all_retrying(fd, head.as_bytes());
    }

    /// Hands a keep-alive connection back to the reactor with fresh parser
    /// state. The receive ring is reused as-is since its cursors already
    /// point past the consumed request.
    fn reset_for_keep_alive(&self, id: ConnId, fd: RawFd) {
        {
            let mut arena = self.arena.lock().unwrap();
            let Some(conn) = arena.get_mut(id) else { return };
            conn.phase = ParsePhase::RequestLine;
            conn.line = crate::parser::RequestLineParser::new();
            conn.headers = crate::parser::HeaderParser::new();
        }
        self.reactor_rearm_read(id, fd);
    }

    /// Removes `id` from the arena (idempotent: a connection is destroyed
    /// exactly once, whichever of a handler or the timer sweep gets there
    /// first) and closes its fd.
    fn close_connection(&self, id: ConnId) {
        let removed = {
            let mut arena = self.arena.lock().unwrap();
            arena.remove(id)
        };
        let Some(conn) = removed else { return };
        if conn.timerset {
            self.timers.del(id, conn.timer_deadline);
        }
        let _ = self.reactor.deregister(conn.fd);
        unsafe {
            libc::close(conn.fd);
        }
    }
}

/// Opens and binds a non-blocking listening socket, ported from
/// `original_source/src/util.c`'s `open_listenfd`: `SO_REUSEADDR`, bind,
/// `listen(fd, LISTENQ)`. Unlike the original (which always binds
/// `INADDR_ANY`), this honors the configured `ip_addr`, a dotted-quad
/// address or `"0.0.0.0"` for any address.
fn open_listenfd(ip_addr: &str, port: u16) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let optval: libc::c_int = 1;
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = parse_ipv4(ip_addr).unwrap_or(0);
        addr.sin_port = port.to_be();

        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let rc = libc::listen(fd, LISTEN_BACKLOG);
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Packs a dotted-quad address into network-byte-order `in_addr_t`. `None`
/// (an empty string, `"0.0.0.0"`, or anything `inet_addr` rejects) means
/// "any address", the original's hardcoded behavior.
fn parse_ipv4(addr: &str) -> Option<u32> {
    if addr.is_empty() || addr == "0.0.0.0" {
        return None;
    }
    let cstr = CString::new(addr).ok()?;
    let packed = unsafe { libc::inet_addr(cstr.as_ptr()) };
    if packed == libc::INADDR_NONE {
        None
    } else {
        Some(packed as u32)
    }
}

/// A single non-blocking `read(2)`, retrying only on `EINTR` (never on
/// `EAGAIN`), matching `original_source/src/util.c`'s `Read` wrapper's
/// retry discipline minus the `exit()` on hard failure.
fn read_once(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Writes the whole buffer, retrying on `EINTR` and looping on a genuine
/// short write against the non-blocking socket, in place of the original's
/// single `write()` call, which silently truncated the response under
/// backpressure. A `WouldBlock` is treated as "keep trying" rather than
/// rearming through the reactor: bodies are bounded by the file on disk, so
/// this is a bounded spin rather than an unbounded block.
fn write_all_retrying(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n > 0 {
            buf = &buf[n as usize..];
            continue;
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                std::thread::yield_now();
                continue;
            }
            _ => return Err(err),
        }
    }
    Ok(())
}

/// Maps the file read-only and writes it out with the same short-write
/// retry loop as the headers.
fn send_mapped_file(fd: RawFd, path: &std::path::Path, len: u64) -> io::Result<()> {
    let file = File::open(path)?;
    // SAFETY: `file` outlives the mapping; the file is opened read-only and
    // not written to concurrently by this process.
    let map = unsafe { memmap2::MmapOptions::new().len(len as usize).map(&file)? };
    write_all_retrying(fd, &map)
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.reactor.deregister(self.listener_fd);
        unsafe {
            libc::close(self.listener_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn spawn_server(root: PathBuf) -> (Arc<Server>, u16) {
        let port = free_port();
        let server = Arc::new(Server::bind("127.0.0.1", port, root, 2).unwrap());
        let run_server = Arc::clone(&server);
        std::thread::spawn(move || {
            let _ = run_server.run();
        });
        // give the reactor thread a moment to start waiting on epoll.
        std::thread::sleep(std::time::Duration::from_millis(50));
        (server, port)
    }

    #[test]
    fn simple_get_returns_the_file_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hello world").unwrap();
        let (_server, port) = spawn_server(dir.path().to_path_buf());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        stream.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("hello world"));
    }

    #[test]
    fn missing_file_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, port) = spawn_server(dir.path().to_path_buf());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"GET /nope.html HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        stream.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn keep_alive_connection_serves_a_second_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.html"), b"AAA").unwrap();
        std::fs::write(dir.path().join("b.html"), b"BBBB").unwrap();
        let (_server, port) = spawn_server(dir.path().to_path_buf());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        stream.write_all(b"GET /a.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();

        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).unwrap();
        let first = String::from_utf8_lossy(&buf[..n]);
        assert!(first.starts_with("HTTP/1.1 200 OK"));
        assert!(first.contains("Connection: keep-alive"));
        assert!(first.ends_with("AAA"));

        stream.write_all(b"GET /b.html HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        let second = String::from_utf8_lossy(&response);
        assert!(second.starts_with("HTTP/1.1 200 OK"));
        assert!(second.ends_with("BBBB"));
    }
}
