// SPDX-License-Identifier: MIT

//! Buffered trace logging
//!
//! Callbacks fire on the instrumented program's hottest paths, so the
//! logger never touches the filesystem on the fast path: lines accumulate
//! in a mutex-guarded buffer and hit disk in batches. A write failure
//! drops the batch instead of unwinding into the host.

use crate::vclock;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Lines buffered before a batch write.
const FLUSH_THRESHOLD: usize = 10_000;

#[derive(Debug, Default)]
struct LoggerState {
    buffer: Vec<String>,
    file: Option<BufWriter<File>>,
}

/// Thread-safe append-only trace log.
#[derive(Debug)]
pub struct TraceLogger {
    path: PathBuf,
    disabled: bool,
    state: Mutex<LoggerState>,
}

impl TraceLogger {
    pub fn new(path: &Path, disabled: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            disabled,
            state: Mutex::new(LoggerState::default()),
        }
    }

    /// Buffers one record, prefixing it with the caller's timestamp, thread
    /// ident, task ident and logical clock.
    pub fn log(&self, ticks: u64, body: &str) {
        if self.disabled {
            return;
        }
        let line = format!(
            "{}\t{}\t{}\t{}\t{}",
            ticks,
            vclock::thread_ident(),
            vclock::task_ident(),
            vclock::current(),
            body
        );

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.buffer.push(line);
        if state.buffer.len() >= FLUSH_THRESHOLD {
            Self::drain(&self.path, &mut state);
        }
    }

    /// Forces buffered lines to disk. Called from shutdown.
    pub fn flush(&self) {
        if self.disabled {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::drain(&self.path, &mut state);
    }

    fn drain(path: &Path, state: &mut LoggerState) {
        if state.buffer.is_empty() {
            return;
        }
        if state.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => state.file = Some(BufWriter::new(file)),
                Err(_) => {
                    // Unwritable log directory; discard rather than grow.
                    state.buffer.clear();
                    return;
                }
            }
        }
        if let Some(file) = state.file.as_mut() {
            for line in &state.buffer {
                if writeln!(file, "{line}").is_err() {
                    break;
                }
            }
            let _ = file.flush();
        }
        state.buffer.clear();
    }
}
