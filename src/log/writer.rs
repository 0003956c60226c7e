/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! File selection, rotation, and the writer thread's drain loop.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};

use super::ring::Ring;

/// Opens, rotates, and (on failure) falls back to `/dev/null` for the log
/// pipeline's destination file. Owned exclusively by the writer thread, so
/// it needs no synchronization of its own.
pub struct FileSelector {
    dir: PathBuf,
    prog: String,
    pid: u32,
    rotate_at_bytes: u64,
    current_date: Option<NaiveDate>,
    file: Option<File>,
    bytes_written: u64,
    degraded_to_devnull: bool,
}

impl FileSelector {
    pub fn new(dir: PathBuf, prog: String, pid: u32, rotate_at_bytes: u64) -> Self {
        FileSelector {
            dir,
            prog,
            pid,
            rotate_at_bytes,
            current_date: None,
            file: None,
            bytes_written: 0,
            degraded_to_devnull: false,
        }
    }

    fn base_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.{}.{}.log", self.prog, date.format("%Y%m%d"), self.pid))
    }

    fn open_fresh(&mut self, date: NaiveDate) {
        let path = self.base_path(date);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                self.bytes_written = f.metadata().map(|m| m.len()).unwrap_or(0);
                self.file = Some(f);
                self.degraded_to_devnull = false;
            }
            Err(e) => {
                log_to_stderr_only(&format!(
                    "log directory {:?} not writable ({}), falling back to /dev/null",
                    self.dir, e
                ));
                self.file = OpenOptions::new().write(true).open("/dev/null").ok();
                self.bytes_written = 0;
                self.degraded_to_devnull = true;
            }
        }
        self.current_date = Some(date);
    }

    /// Renames `base`, `base.1`, `base.2`, ... up one slot (descending, so
    /// no file is clobbered), then reopens `base` fresh.
    fn rotate(&mut self) {
        if self.degraded_to_devnull {
            return;
        }
        let Some(date) = self.current_date else { return };
        let base = self.base_path(date);

        let mut highest = 0u32;
        while rotated_name(&base, highest + 1).exists() {
            highest += 1;
        }

        for n in (1..=highest).rev() {
            let from = rotated_name(&base, n);
            let to = rotated_name(&base, n + 1);
            let _ = fs::rename(&from, &to);
        }
        if base.exists() {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        }
        self.file = None;
        self.open_fresh(date);
    }

    fn ensure_ready_for(&mut self, today: NaiveDate) {
        if self.current_date != Some(today) || self.file.is_none() {
            self.open_fresh(today);
        }
        if self.bytes_written > self.rotate_at_bytes {
            self.rotate();
        }
    }

    pub fn write_and_sync(&mut self, data: &[u8]) -> io::Result<()> {
        let today = Utc::now().date_naive();
        self.ensure_ready_for(today);
        let file = self.file.as_mut().expect("ensure_ready_for always installs a file");
        file.write_all(data)?;
        file.flush()?;
        let _ = file.sync_data();
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}

fn rotated_name(base: &Path, n: u32) -> PathBuf {
    base.with_file_name(format!("{}.{}", base.file_name().unwrap().to_string_lossy(), n))
}

/// `/dev/null` fallback means producers never learn about the I/O failure;
/// the only trace is this one-line stderr notice at the moment the writer
/// thread degrades.
fn log_to_stderr_only(msg: &str) {
    eprintln!("swiftd: {}", msg);
}

/// Spawns the writer thread: waits on `cond` with a 1 s timeout, drains the
/// persist cell whenever it has anything, and exits once `shutdown` is set
/// and the ring has nothing left to drain.
pub fn spawn(
    ring: std::sync::Arc<Mutex<Ring>>,
    cond: std::sync::Arc<Condvar>,
    shutdown: std::sync::Arc<AtomicBool>,
    mut selector: FileSelector,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("swiftd-log-writer".into())
        .spawn(move || loop {
            let guard = ring.lock().unwrap();
            let (guard, _timeout) = cond
                .wait_timeout(guard, Duration::from_secs(1))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            drop(guard);

            drain_all_ready(&ring, &mut selector);

            if shutdown.load(Ordering::Acquire) {
                // final drain: the shutdown flag may have been set while we
                // were mid-write above, so sweep once more before exiting.
                drain_all_ready(&ring, &mut selector);
                break;
            }
        })
        .expect("failed to spawn log writer thread")
}

/// Drains every cell that currently has something to persist, in ring
/// order, stopping only once the persist cursor catches up to an empty
/// cell.
fn drain_all_ready(ring: &Mutex<Ring>, selector: &mut FileSelector) {
    loop {
        let mut guard = ring.lock().unwrap();
        let Some((used, buf)) = guard.take_persist_cell() else {
            break;
        };
        guard.advance_persist();
        drop(guard);
        if let Err(e) = selector.write_and_sync(&buf[..used]) {
            log_to_stderr_only(&format!("log write failed: {}", e));
        }
    }
}
