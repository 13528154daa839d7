//! Buffered diagnostics file with a background flush task.
//!
//! Writers append to an in-memory buffer and return immediately. The flush
//! task persists the buffer every `flush_interval`, or sooner once the
//! unflushed byte count reaches `buffer_size`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::{DiagEvent, DiagnosticsSink, LogLevel};

/// Append-only log file fed through an in-memory buffer.
pub struct BufferedLogFile {
    path: PathBuf,
    buffer: Mutex<Vec<u8>>,
    file: Mutex<File>,
    unflushed: AtomicUsize,
    buffer_size: usize,
    flush_needed: Notify,
}

impl BufferedLogFile {
    /// Open (or create) `path` for appending.
    pub fn open(path: impl AsRef<Path>, buffer_size: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            buffer: Mutex::new(Vec::with_capacity(buffer_size)),
            file: Mutex::new(file),
            unflushed: AtomicUsize::new(0),
            buffer_size,
            flush_needed: Notify::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written but not yet persisted
    pub fn unflushed_bytes(&self) -> usize {
        self.unflushed.load(Ordering::Relaxed)
    }

    /// Buffer one line. Never touches the disk.
    pub fn write_line(&self, line: &str) {
        // Counter moves under the buffer lock so it always matches the buffer
        let total = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.extend_from_slice(line.as_bytes());
            buffer.push(b'\n');
            self.unflushed.store(buffer.len(), Ordering::Relaxed);
            buffer.len()
        };
        if total >= self.buffer_size {
            self.flush_needed.notify_one();
        }
    }

    /// Persist everything buffered so far.
    pub fn flush(&self) -> io::Result<()> {
        let pending = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            self.unflushed.store(0, Ordering::Relaxed);
            std::mem::take(&mut *buffer)
        };
        if pending.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&pending)?;
        file.flush()
    }
}

/// Handle to a running flush task.
pub struct FlushTaskHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FlushTaskHandle {
    /// Stop the task after a final flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!("Flush task ended abnormally: {}", e);
        }
    }
}

/// Start the periodic flush task for `file`.
pub fn spawn_flush_task(file: Arc<BufferedLogFile>, flush_interval: Duration) -> FlushTaskHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    info!(
        path = %file.path().display(),
        interval_ms = flush_interval.as_millis() as u64,
        buffer_size = file.buffer_size,
        "Starting diagnostics flush task"
    );

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = file.flush_needed.notified() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if let Err(e) = file.flush() {
                warn!(path = %file.path().display(), "Diagnostics flush failed: {}", e);
            }
        }

        if let Err(e) = file.flush() {
            warn!(path = %file.path().display(), "Final diagnostics flush failed: {}", e);
        }
        info!("Diagnostics flush task stopped");
    });

    FlushTaskHandle { shutdown_tx, join }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Diagnostics sink writing formatted lines into a [`BufferedLogFile`].
pub struct FileSink {
    file: Arc<BufferedLogFile>,
}

impl FileSink {
    pub fn new(file: Arc<BufferedLogFile>) -> Self {
        Self { file }
    }

    fn write(&self, stream: &str, event: &DiagEvent<'_>) {
        let fields = event.render_fields();
        let line = if fields.is_empty() {
            format!(
                "[{}] {} {} {}: {}",
                timestamp(),
                stream,
                event.level.as_number(),
                event.func,
                event.message
            )
        } else {
            format!(
                "[{}] {} {} {}: {} {}",
                timestamp(),
                stream,
                event.level.as_number(),
                event.func,
                event.message,
                fields
            )
        };
        self.file.write_line(&line);
    }
}

impl DiagnosticsSink for FileSink {
    fn debug(&self, event: &DiagEvent<'_>) {
        self.write("DEBUG", event);
    }

    fn error(&self, event: &DiagEvent<'_>) {
        self.write("ERROR", event);
    }

    fn debug_buffer(&self, level: LogLevel, func: &str, prefix: &str, buf: &[u8]) {
        let body = if level == LogLevel::AllDataInPdu {
            hex::encode_upper(buf)
        } else {
            format!("<{} bytes>", buf.len())
        };
        self.file.write_line(&format!(
            "[{}] DEBUG {} {}: {}{}",
            timestamp(),
            level.as_number(),
            func,
            prefix,
            body
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_line_buffers_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let file = BufferedLogFile::open(&path, 4096).unwrap();

        file.write_line("hello");
        assert_eq!(file.unflushed_bytes(), 6);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        file.flush().unwrap();
        assert_eq!(file.unflushed_bytes(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn test_unflushed_count_survives_concurrent_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let file = Arc::new(BufferedLogFile::open(&path, 1 << 20).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let file = Arc::clone(&file);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        file.write_line("0123456789");
                    }
                })
            })
            .collect();
        let flusher = {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    file.flush().unwrap();
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        flusher.join().unwrap();

        let on_disk = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(on_disk + file.unflushed_bytes(), 4 * 500 * 11);
        file.flush().unwrap();
        assert_eq!(file.unflushed_bytes(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 500 * 11);
    }

    #[tokio::test]
    async fn test_byte_threshold_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let file = Arc::new(BufferedLogFile::open(&path, 16).unwrap());
        // Long interval so only the byte threshold can fire
        let handle = spawn_flush_task(file.clone(), Duration::from_secs(3600));

        file.write_line("0123456789abcdefXYZ");
        for _ in 0..50 {
            if file.unflushed_bytes() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0123456789abcdefXYZ\n");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let file = Arc::new(BufferedLogFile::open(&path, 1 << 20).unwrap());
        let handle = spawn_flush_task(file.clone(), Duration::from_secs(3600));

        FileSink::new(file.clone()).debug(&DiagEvent {
            level: LogLevel::PerServer,
            func: "main",
            message: "shutting down",
            fields: &[],
        });
        handle.shutdown().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("DEBUG 4 main: shutting down"));
    }
}
