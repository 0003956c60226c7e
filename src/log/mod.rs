/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Async log pipeline: a `log::Log` backend so every other subsystem can
//! log through the ordinary `log::debug!` / `info!` / `warn!` / `error!`
//! macros instead of a bespoke macro.

mod ring;
mod time;
mod writer;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};

pub use writer::FileSelector;

use ring::{AppendResult, Ring};
use time::CachedClock;

/// Cell size for each buffer in the log ring.
const CELL_CAPACITY: usize = 30 * 1024 * 1024;
/// Total ring memory ceiling; splicing in a new cell beyond this is refused.
const MAX_RING_BYTES: u64 = 3 * 1024 * 1024 * 1024;
/// After a failed append, further lines within this window are dropped
/// silently.
const RELOG_THRESHOLD_SECS: u64 = 5;
/// A formatted line longer than this is truncated.
const LINE_LEN_LIMIT: usize = 4096;
/// Rotate the active log file once it exceeds this size.
const ROTATE_AT_BYTES: u64 = 1024 * 1024 * 1024;

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The log pipeline: a `log::Log` implementation backed by a cell ring.
/// Construct once at startup with [`LogPipeline::install`].
pub struct LogPipeline {
    ring: Arc<Mutex<Ring>>,
    clock: Mutex<CachedClock>,
    cond: Arc<Condvar>,
    /// 0 means "no coalescing window active"; otherwise the unix-seconds
    /// timestamp of the last failed append.
    log_err_sec: AtomicU64,
    shutdown: Arc<AtomicBool>,
    level: LevelFilter,
}

impl LogPipeline {
    /// Builds the pipeline, spawns its writer thread, and installs it as
    /// the global `log` facade backend. `prog` and `pid` feed the
    /// `{dir}/{prog}.{date}.{pid}.log` filename. Only one pipeline may be
    /// installed per process, matching `log::set_boxed_logger`'s one-shot
    /// contract.
    pub fn install(dir: PathBuf, prog: String, level: LevelFilter) -> Result<Arc<LogPipeline>, log::SetLoggerError> {
        let pid = std::process::id();
        let selector = FileSelector::new(dir, prog, pid, ROTATE_AT_BYTES);
        let ring = Arc::new(Mutex::new(Ring::new(CELL_CAPACITY, MAX_RING_BYTES)));
        let cond = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        // Dropping the `JoinHandle` does not stop the thread; it keeps
        // running detached. The pipeline is installed once for the whole
        // process and is never torn down, so there is no `shutdown()` path
        // wired into `Drop` here.
        let _writer_handle = writer::spawn(Arc::clone(&ring), Arc::clone(&cond), Arc::clone(&shutdown), selector);

        let pipeline = Arc::new(LogPipeline {
            ring,
            clock: Mutex::new(CachedClock::new()),
            cond,
            log_err_sec: AtomicU64::new(0),
            shutdown,
            level,
        });

        log::set_boxed_logger(Box::new(ArcLogger(Arc::clone(&pipeline))))?;
        log::set_max_level(level);
        Ok(pipeline)
    }

    fn append_line(&self, record_level: Level, target: &str, line_no: u32, args: std::fmt::Arguments<'_>) {
        let now = unix_seconds();
        let err_sec = self.log_err_sec.load(Ordering::Relaxed);
        if err_sec != 0 && now.saturating_sub(err_sec) < RELOG_THRESHOLD_SECS {
            return;
        }

        let (timestamp, millis) = {
            let mut clock = self.clock.lock().unwrap();
            clock.format_now()
        };
        let tid = thread_id();

        let mut line = String::with_capacity(256);
        let _ = write!(
            line,
            "[{level}][{ts}.{ms:03}][{tid}] {target}:{line_no}: {args}",
            level = level_tag(record_level),
            ts = timestamp,
            ms = millis,
            tid = tid,
            target = target,
            line_no = line_no,
            args = args,
        );
        line.push('\n');
        if line.len() > LINE_LEN_LIMIT {
            line.truncate(LINE_LEN_LIMIT);
        }

        self.log_err_sec.store(0, Ordering::Relaxed);

        let (signal_writer, dropped) = {
            let mut ring = self.ring.lock().unwrap();
            match ring.append(line.as_bytes()) {
                AppendResult::Appended { signal_writer } => (signal_writer, false),
                AppendResult::Dropped => (false, true),
            }
        };
        if dropped {
            self.log_err_sec.store(now, Ordering::Relaxed);
            return;
        }
        if signal_writer {
            self.cond.notify_one();
        }
    }

    /// Signals the writer thread to drain and exit. Exposed for tests and
    /// for a future graceful-shutdown path; the installed global instance
    /// is never torn down during the process's normal lifetime.
    #[cfg(test)]
    fn shutdown_and_join(self: Arc<Self>) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

/// One-line level tag, e.g. `"INFO"`, used in the `[LEVEL][...]` log-line
/// layout.
fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

#[cfg(target_os = "linux")]
fn thread_id() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) }
}

#[cfg(not(target_os = "linux"))]
fn thread_id() -> u64 {
    // Fallback for non-Linux dev builds; no numeric tid is available from
    // `std`, so hash the opaque `ThreadId` instead.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

/// Adapter so `Arc<LogPipeline>` can be handed to `log::set_boxed_logger`,
/// which wants an owned `Box<dyn Log>`.
struct ArcLogger(Arc<LogPipeline>);

impl Log for ArcLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.0.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.0.append_line(
            record.level(),
            record.target(),
            record.line().unwrap_or(0),
            *record.args(),
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn pipeline_for_test(dir: &std::path::Path) -> Arc<LogPipeline> {
        let ring = Arc::new(Mutex::new(Ring::new(4096, 16 * 4096)));
        let cond = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let selector = FileSelector::new(dir.to_path_buf(), "test".to_string(), 1, ROTATE_AT_BYTES);
        let handle = writer::spawn(Arc::clone(&ring), Arc::clone(&cond), Arc::clone(&shutdown), selector);
        let pipeline = Arc::new(LogPipeline {
            ring,
            clock: Mutex::new(CachedClock::new()),
            cond,
            log_err_sec: AtomicU64::new(0),
            shutdown,
            level: LevelFilter::Trace,
        });
        // stash the handle so the test can join it after shutdown.
        WRITER_HANDLES.lock().unwrap().push(handle);
        pipeline
    }

    static WRITER_HANDLES: Mutex<Vec<std::thread::JoinHandle<()>>> = Mutex::new(Vec::new());

    #[test]
    fn append_line_writes_to_disk_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_for_test(dir.path());
        pipeline.append_line(Level::Info, "swiftd::test", 42, format_args!("hello {}", "world"));
        Arc::clone(&pipeline).shutdown_and_join();
        for h in WRITER_HANDLES.lock().unwrap().drain(..) {
            h.join().unwrap();
        }

        let mut found = false;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            let contents = std::fs::read_to_string(entry.path()).unwrap();
            if contents.contains("hello world") && contents.contains("[INFO]") {
                found = true;
            }
        }
        assert!(found, "expected a log file containing the appended line");
    }

    #[test]
    fn relog_threshold_coalesces_after_a_drop() {
        let ring = Arc::new(Mutex::new(Ring::new(8, 8))); // one 8-byte cell, no splice room
        let cond = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let pipeline = LogPipeline {
            ring,
            clock: Mutex::new(CachedClock::new()),
            cond,
            log_err_sec: AtomicU64::new(0),
            shutdown,
            level: LevelFilter::Trace,
        };
        // fill the only cell so every subsequent append is dropped.
        pipeline.append_line(Level::Info, "t", 1, format_args!("0123456789abcdef"));
        assert_ne!(pipeline.log_err_sec.load(Ordering::Relaxed), 0);
        let first_err_sec = pipeline.log_err_sec.load(Ordering::Relaxed);
        // a second append within the coalescing window must not touch the
        // ring again (it returns before taking the lock at all).
        pipeline.append_line(Level::Info, "t", 2, format_args!("short"));
        assert_eq!(pipeline.log_err_sec.load(Ordering::Relaxed), first_err_sec);
    }
}
