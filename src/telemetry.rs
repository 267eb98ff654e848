//! Append-only observation log.
//!
//! Each completed request is written as one JSON line to a file with
//! size-based rotation.  The request path only formats the line and hands it
//! to a bounded channel; a background task owns the file and does the I/O on
//! the blocking pool.  A full channel drops the line and counts it as a write
//! error, so a slow disk never holds up a response.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, oneshot};

use crate::metrics::{MetricsRecorder, Observation};

/// Lines buffered between the request path and the writer task.
pub const CHANNEL_CAPACITY: usize = 4096;
const WRITE_BATCH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Size-based rotating writer.  Backups are `<path>.1` (newest) through
/// `<path>.<keep>`, each optionally gzipped to `<path>.<n>.gz`.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    size: u64,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            size,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.size >= limit {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)?;
        self.size += line.len() as u64 + 1;
        Ok(())
    }

    fn backup_path(&self, idx: usize, gz: bool) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", idx));
        if gz {
            name.push(".gz");
        }
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        let keep = self.rotation.keep;
        if keep == 0 {
            self.file = fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        for gz in [false, true] {
            remove_if_exists(&self.backup_path(keep, gz))?;
        }
        for idx in (1..keep).rev() {
            for gz in [false, true] {
                let from = self.backup_path(idx, gz);
                if from.exists() {
                    fs::rename(&from, self.backup_path(idx + 1, gz))?;
                }
            }
        }

        let newest = self.backup_path(1, false);
        fs::rename(&self.path, &newest)?;
        self.file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = 0;

        if self.rotation.compress {
            gzip_file(&newest, &self.backup_path(1, true))?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = fs::File::open(src)?;
    let mut gz = GzEncoder::new(fs::File::create(dst)?, Compression::default());
    io::copy(&mut input, &mut gz)?;
    gz.finish()?;
    fs::remove_file(src)
}

enum Record {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to the observation log.  Clones share the channel and counters.
#[derive(Clone)]
pub struct ObservationLog {
    tx: Option<mpsc::Sender<Record>>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl ObservationLog {
    /// A log that discards every observation.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the writer task on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(writer: RotatingWriter, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let log = Self {
            tx: Some(tx),
            ..Self::disabled()
        };
        tokio::spawn(drain(
            writer,
            rx,
            log.lines_total.clone(),
            log.write_errors_total.clone(),
        ));
        log
    }

    /// Open `path` if given.  A file that cannot be opened, or a missing
    /// runtime, disables the log with a warning rather than failing startup.
    pub fn from_path(path: Option<&str>, rotation: RotationConfig) -> Self {
        let Some(path) = path else {
            return Self::disabled();
        };
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(path = %path, "No tokio runtime; observation log disabled");
            return Self::disabled();
        }
        match RotatingWriter::open(path, rotation) {
            Ok(writer) => Self::spawn(writer, CHANNEL_CAPACITY),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE; observation log disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    /// Wait until every line queued before this call has been written.
    pub async fn flush(&self) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if tx.send(Record::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

async fn drain(
    mut writer: RotatingWriter,
    mut rx: mpsc::Receiver<Record>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
) {
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    while rx.recv_many(&mut batch, WRITE_BATCH).await > 0 {
        let records = std::mem::take(&mut batch);
        let lines = lines_total.clone();
        let errors = write_errors_total.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut acks = Vec::new();
            for record in records {
                match record {
                    Record::Line(line) => match writer.write_line(&line) {
                        Ok(()) => {
                            lines.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to write observation line");
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    Record::Flush(ack) => acks.push(ack),
                }
            }
            (writer, acks)
        })
        .await;
        match written {
            Ok((w, acks)) => {
                writer = w;
                for ack in acks {
                    let _ = ack.send(());
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Observation writer stopped");
                return;
            }
        }
    }
}

impl MetricsRecorder for ObservationLog {
    fn observe(&self, observation: &Observation<'_>) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let record = serde_json::json!({
            "schemaVersion": 1,
            "ts": observation.received.to_rfc3339(),
            "transport": observation.transport.as_str(),
            "method": observation.method,
            "outcome": observation.outcome,
            "latencyMs": observation.latency.as_millis() as u64,
        });
        if tx.try_send(Record::Line(record.to_string())).is_err() {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Transport;
    use crate::outcome::OutcomeClass;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;

    fn observation(method: &str) -> Observation<'_> {
        Observation {
            transport: Transport::Rpc,
            method,
            outcome: OutcomeClass::PermissionDenied,
            latency: Duration::from_millis(7),
            received: chrono::Utc::now(),
        }
    }

    fn line(n: usize) -> String {
        format!("{{\"seq\":{:04},\"pad\":\"{}\"}}", n, "x".repeat(40))
    }

    fn gz_lines(path: &Path) -> usize {
        let mut text = String::new();
        GzDecoder::new(fs::File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        text.lines().count()
    }

    #[tokio::test]
    async fn writes_one_json_line_per_observation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations.jsonl");
        let log = ObservationLog::from_path(path.to_str(), RotationConfig::default());
        log.observe(&observation("/adhoc.v1.AdhocService/Hello"));
        log.observe(&observation("/adhoc.v1.AdhocService/Hello"));
        log.flush().await;
        assert_eq!(log.lines_total(), 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["transport"], "rpc");
        assert_eq!(first["outcome"], "permission_denied");
        assert_eq!(first["latencyMs"], 7);
    }

    #[tokio::test]
    async fn observe_only_queues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queued.jsonl");
        let log = ObservationLog::from_path(path.to_str(), RotationConfig::default());
        // Current-thread runtime: the writer task cannot run until we yield.
        log.observe(&observation("/svc/Method"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(log.lines_total(), 0);
        log.flush().await;
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn full_channel_counts_dropped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.jsonl");
        let writer = RotatingWriter::open(&path, RotationConfig::default()).unwrap();
        let log = ObservationLog::spawn(writer, 2);
        for _ in 0..5 {
            log.observe(&observation("/svc/Method"));
        }
        assert_eq!(log.write_errors_total(), 3);
        log.flush().await;
        assert_eq!(log.lines_total(), 2);
    }

    #[test]
    fn rotation_keeps_every_compressed_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.log");
        let rotation = RotationConfig {
            max_bytes: Some(100),
            keep: 3,
            compress: true,
        };
        let mut writer = RotatingWriter::open(&path, rotation).unwrap();
        for n in 0..60 {
            writer.write_line(&line(n)).unwrap();
        }

        let backup = |n: usize| dir.path().join(format!("obs.log.{}.gz", n));
        for n in 1..=3 {
            assert!(backup(n).exists(), "missing backup {n}");
            assert_eq!(gz_lines(&backup(n)), 2);
        }
        assert!(!backup(4).exists());
        assert!(!dir.path().join("obs.log.1").exists());

        // Newest backup holds the lines just before the live file.
        let live = fs::read_to_string(&path).unwrap();
        assert!(live.contains("\"seq\":0058") && live.contains("\"seq\":0059"));
        let mut newest = String::new();
        GzDecoder::new(fs::File::open(backup(1)).unwrap())
            .read_to_string(&mut newest)
            .unwrap();
        assert!(newest.contains("\"seq\":0056") && newest.contains("\"seq\":0057"));
    }

    #[test]
    fn rotation_without_compression_shifts_plain_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.log");
        let rotation = RotationConfig {
            max_bytes: Some(100),
            keep: 2,
            compress: false,
        };
        let mut writer = RotatingWriter::open(&path, rotation).unwrap();
        for n in 0..20 {
            writer.write_line(&line(n)).unwrap();
        }
        assert!(dir.path().join("obs.log.1").exists());
        assert!(dir.path().join("obs.log.2").exists());
        assert!(!dir.path().join("obs.log.3").exists());
        let newer = fs::read_to_string(dir.path().join("obs.log.1")).unwrap();
        assert!(newer.contains("\"seq\":0016"));
        let older = fs::read_to_string(dir.path().join("obs.log.2")).unwrap();
        assert!(older.contains("\"seq\":0014"));
    }

    #[test]
    fn keep_zero_truncates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.log");
        let rotation = RotationConfig {
            max_bytes: Some(100),
            keep: 0,
            compress: true,
        };
        let mut writer = RotatingWriter::open(&path, rotation).unwrap();
        for n in 0..10 {
            writer.write_line(&line(n)).unwrap();
        }
        assert!(!dir.path().join("obs.log.1").exists());
        assert!(!dir.path().join("obs.log.1.gz").exists());
        assert!(fs::read_to_string(&path).unwrap().lines().count() <= 2);
    }

    #[test]
    fn missing_file_sink_is_silent() {
        let log = ObservationLog::from_path(None, RotationConfig::default());
        assert!(!log.is_enabled());
        log.observe(&observation("/svc/Method"));
        assert_eq!(log.lines_total(), 0);
        assert_eq!(log.write_errors_total(), 0);
    }
}
