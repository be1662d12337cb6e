//! Async log sink
//!
//! `LogSink::write` is callable from any thread and never blocks: it
//! pushes a formatted line onto a [`BoundedMpsc`], and a dedicated
//! consumer thread drains it in batches to the underlying file. When the
//! queue is full, the record is dropped and `dropped_count` increments —
//! the sink must never apply backpressure to its caller.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::mpsc::BoundedMpsc;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Fine-grained diagnostic detail, e.g. per-byte parser transitions.
    Trace,
    /// Diagnostic detail useful while developing against the framework.
    Debug,
    /// Routine operational events: accept, close, handshake complete.
    Info,
    /// Recoverable anomalies: protocol errors, dropped frames.
    Warn,
    /// Failures that end a connection or the process.
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

struct Appender {
    writer: BufWriter<File>,
}

impl Appender {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn append_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }
}

struct Shared {
    queue: BoundedMpsc<String>,
    dropped: AtomicUsize,
    stop: AtomicBool,
    signal: Condvar,
    signal_lock: Mutex<()>,
}

/// A thread-safe, non-blocking log sink.
///
/// Clone freely; all clones share the underlying queue and consumer
/// thread.
#[derive(Clone)]
pub struct LogSink {
    shared: Arc<Shared>,
    min_level: Level,
}

/// Owns the consumer thread; dropping it requests shutdown and joins.
pub struct LogHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

/// Default queue capacity (power of two), per spec.
pub const DEFAULT_CAPACITY: usize = 8192;

impl LogSink {
    /// Opens `path` for append and spawns the consumer thread. Returns
    /// the sink (clone to share with other threads) and a handle whose
    /// drop joins the consumer.
    pub fn open(path: impl AsRef<Path>, min_level: Level) -> io::Result<(LogSink, LogHandle)> {
        Self::with_capacity(path, min_level, DEFAULT_CAPACITY)
    }

    /// Like [`open`](Self::open) with an explicit queue capacity.
    pub fn with_capacity(
        path: impl AsRef<Path>,
        min_level: Level,
        capacity: usize,
    ) -> io::Result<(LogSink, LogHandle)> {
        let mut appender = Appender::open(path.as_ref())?;

        let shared = Arc::new(Shared {
            queue: BoundedMpsc::new(capacity),
            dropped: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            signal: Condvar::new(),
            signal_lock: Mutex::new(()),
        });

        let consumer_shared = shared.clone();
        let join = thread::spawn(move || {
            let shared = consumer_shared;
            loop {
                let mut drained_any = false;
                while let Some(line) = shared.queue.pop() {
                    let _ = appender.append_line(&line);
                    drained_any = true;
                }
                let _ = appender.writer.flush();

                if shared.stop.load(Ordering::Acquire) {
                    while let Some(line) = shared.queue.pop() {
                        let _ = appender.append_line(&line);
                    }
                    let _ = appender.writer.flush();
                    return;
                }

                if !drained_any {
                    let guard = shared.signal_lock.lock().unwrap();
                    let _ = shared
                        .signal
                        .wait_timeout(guard, Duration::from_millis(50))
                        .unwrap();
                }
            }
        });

        Ok((
            LogSink {
                shared: shared.clone(),
                min_level,
            },
            LogHandle {
                shared,
                join: Some(join),
            },
        ))
    }

    /// Pushes a formatted line if `level` meets the configured minimum.
    /// Never blocks; on a full queue the record is dropped and the
    /// dropped-count counter increments.
    pub fn write(&self, level: Level, line: impl Into<String>) {
        if level < self.min_level {
            return;
        }

        let formatted = format!("[{}] {}", level.as_str(), line.into());
        if self.shared.queue.push(formatted).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.shared.signal.notify_one();
    }

    /// Number of records dropped because the queue was full.
    pub fn dropped_count(&self) -> usize {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.signal.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn write_does_not_block_when_queue_is_full() {
        let dir = std::env::temp_dir().join(format!("emberweb-log-test-{}", std::process::id()));
        let (sink, _handle) = LogSink::with_capacity(&dir, Level::Trace, 2).unwrap();

        // fill faster than the consumer can drain by writing a burst
        for i in 0..1000 {
            sink.write(Level::Info, format!("line {i}"));
        }

        // never panics/blocks regardless of drops
        sleep(Duration::from_millis(20));
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn level_filtering_drops_below_minimum() {
        let dir = std::env::temp_dir().join(format!("emberweb-log-test2-{}", std::process::id()));
        let (sink, handle) = LogSink::with_capacity(&dir, Level::Warn, 64).unwrap();
        sink.write(Level::Debug, "should not appear");
        sink.write(Level::Error, "should appear");
        drop(handle);

        let contents = std::fs::read_to_string(&dir).unwrap();
        assert!(!contents.contains("should not appear"));
        assert!(contents.contains("should appear"));
        let _ = std::fs::remove_file(&dir);
    }
}
