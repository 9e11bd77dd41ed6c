use crate::audit::AuditError;
use crate::audit::entry::AuditEntry;
use crate::config::AuditConfig;
use crate::util::background::BackgroundTask;
use chrono::{Days, NaiveDate, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

static LOG_FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^query_history_(\d{8})_(\d{6})\.jsonl$").expect("valid regex"));

const DATE_FORMAT: &str = "%Y%m%d";

/// Full buffers kept in memory while flushes keep failing.
const MAX_BUFFERED_BATCHES: usize = 10;

fn file_name(date: &str, sequence: u32) -> String {
    format!("query_history_{}_{:06}.jsonl", date, sequence)
}

/// Date and sequence parsed from a history file name.
fn parse_file_name(name: &str) -> Option<(NaiveDate, u32)> {
    let captures = LOG_FILE_NAME.captures(name)?;
    let date = NaiveDate::parse_from_str(&captures[1], DATE_FORMAT).ok()?;
    let sequence = captures[2].parse().ok()?;
    Some((date, sequence))
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub directory: PathBuf,
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub max_file_bytes: u64,
    /// Zero keeps files forever.
    pub retention_days: u32,
}

impl From<&AuditConfig> for AuditSettings {
    fn from(config: &AuditConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            buffer_size: config.buffer_size.max(1),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            max_file_bytes: config.max_file_size_mb.saturating_mul(1024 * 1024).max(1),
            retention_days: config.retention_days,
        }
    }
}

/// Active file position. Guarded by an async lock that also serializes writes.
#[derive(Debug, Default)]
struct FileCursor {
    date: String,
    sequence: u32,
}

/// Buffered JSONL writer for the query history.
///
/// `write` only touches the in-memory buffer. File I/O happens in `flush`,
/// which the background task calls on a timer and whenever the buffer fills.
pub struct AuditLogWriter {
    settings: AuditSettings,
    buffer: Mutex<Vec<AuditEntry>>,
    flush_signal: Notify,
    cursor: tokio::sync::Mutex<FileCursor>,
    task: Mutex<Option<BackgroundTask>>,
}

impl AuditLogWriter {
    pub fn new(settings: AuditSettings) -> Self {
        Self {
            settings,
            buffer: Mutex::new(Vec::new()),
            flush_signal: Notify::new(),
            cursor: tokio::sync::Mutex::new(FileCursor::default()),
            task: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.settings.directory
    }

    /// Creates the directory, removes expired files and starts the flush loop.
    pub async fn start(self: &std::sync::Arc<Self>) -> Result<(), AuditError> {
        let directory = &self.settings.directory;
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|e| AuditError::io(directory, e))?;

        let removed = self.remove_expired_files().await?;
        if removed > 0 {
            info!(removed, retention_days = self.settings.retention_days, "Removed expired audit logs");
        }

        let writer = std::sync::Arc::clone(self);
        let task = BackgroundTask::spawn_with("audit-flush", move |cancel| async move {
            let period = writer.settings.flush_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = writer.flush_signal.notified() => {}
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, "Audit flush failed, entries kept for the next attempt");
                }
            }
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        info!(directory = %directory.display(), "Audit log writer started");
        Ok(())
    }

    /// Queues an entry. Never waits on disk.
    pub fn write(&self, entry: AuditEntry) {
        let pending = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(entry);
            buffer.len()
        };
        if pending >= self.settings.buffer_size {
            self.flush_signal.notify_one();
        }
    }

    /// Entries accepted but not yet on disk.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Writes every buffered entry. On failure the batch goes back to the
    /// front of the buffer so ordering is kept, up to `MAX_BUFFERED_BATCHES`
    /// full buffers; beyond that the oldest entries are dropped.
    pub async fn flush(&self) -> Result<usize, AuditError> {
        let mut cursor = self.cursor.lock().await;

        let batch = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            return Ok(0);
        }

        match self.append_batch(&mut cursor, &batch).await {
            Ok(()) => {
                debug!(entries = batch.len(), sequence = cursor.sequence, "Audit buffer flushed");
                Ok(batch.len())
            }
            Err(e) => {
                let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);

                let cap = self.settings.buffer_size.saturating_mul(MAX_BUFFERED_BATCHES).max(1);
                if buffer.len() > cap {
                    let dropped = buffer.len() - cap;
                    buffer.drain(..dropped);
                    error!(dropped, kept = cap, error = %e, "Audit flush keeps failing, dropped oldest entries");
                }
                Err(e)
            }
        }
    }

    /// Stops the flush loop and writes whatever is still buffered.
    pub async fn stop(&self) -> Result<usize, AuditError> {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.stop().await;
        }

        let flushed = self.flush().await?;
        info!(flushed, "Audit log writer stopped");
        Ok(flushed)
    }

    async fn append_batch(&self, cursor: &mut FileCursor, batch: &[AuditEntry]) -> Result<(), AuditError> {
        let today = Utc::now().format(DATE_FORMAT).to_string();
        if cursor.date != today {
            cursor.sequence = self.resume_sequence(&today).await?;
            cursor.date = today;
        }

        let mut lines = String::new();
        for entry in batch {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => warn!(request_id = %entry.request_id, error = %e, "Dropping unserializable audit entry"),
            }
        }

        let path = self.settings.directory.join(file_name(&cursor.date, cursor.sequence));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditError::io(&path, e))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| AuditError::io(&path, e))?;
        file.flush().await.map_err(|e| AuditError::io(&path, e))?;

        let size = file.metadata().await.map_err(|e| AuditError::io(&path, e))?.len();
        if size >= self.settings.max_file_bytes {
            cursor.sequence += 1;
            info!(file = %path.display(), size, next_sequence = cursor.sequence, "Audit log rotated");
        }
        Ok(())
    }

    /// Continues after the highest existing file for `date`, starting a new
    /// one if that file is already full.
    async fn resume_sequence(&self, date: &str) -> Result<u32, AuditError> {
        let Some(date) = NaiveDate::parse_from_str(date, DATE_FORMAT).ok() else {
            return Ok(1);
        };

        let highest = self
            .history_files()
            .await?
            .into_iter()
            .filter(|(_, file_date, _)| *file_date == date)
            .max_by_key(|(_, _, sequence)| *sequence);

        let Some((path, _, sequence)) = highest else {
            return Ok(1);
        };
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| AuditError::io(&path, e))?
            .len();
        Ok(if size >= self.settings.max_file_bytes { sequence + 1 } else { sequence })
    }

    async fn history_files(&self) -> Result<Vec<(PathBuf, NaiveDate, u32)>, AuditError> {
        let directory = &self.settings.directory;
        let mut entries = match tokio::fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::io(directory, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| AuditError::io(directory, e))? {
            let name = entry.file_name();
            if let Some((date, sequence)) = name.to_str().and_then(parse_file_name) {
                files.push((entry.path(), date, sequence));
            }
        }
        Ok(files)
    }

    async fn remove_expired_files(&self) -> Result<usize, AuditError> {
        if self.settings.retention_days == 0 {
            return Ok(0);
        }
        let Some(cutoff) = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(u64::from(self.settings.retention_days)))
        else {
            return Ok(0);
        };

        let mut removed = 0;
        for (path, date, _) in self.history_files().await? {
            if date < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(file = %path.display(), "Removed expired audit log");
                        removed += 1;
                    }
                    Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove expired audit log"),
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::AuditStatus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn settings(dir: &Path) -> AuditSettings {
        AuditSettings {
            directory: dir.to_path_buf(),
            buffer_size: 100,
            flush_interval: Duration::from_secs(3600),
            max_file_bytes: 1024 * 1024,
            retention_days: 30,
        }
    }

    fn entry(n: usize) -> AuditEntry {
        let mut entry = AuditEntry::new(Uuid::new_v4(), "shop", &format!("question {n}"), AuditStatus::Success);
        entry.row_count = Some(n);
        entry
    }

    fn today() -> String {
        Utc::now().format(DATE_FORMAT).to_string()
    }

    fn read_lines(path: &Path) -> Vec<AuditEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(file_name("20240131", 7), "query_history_20240131_000007.jsonl");
        assert_eq!(
            parse_file_name("query_history_20240131_000007.jsonl"),
            Some((NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(), 7))
        );
        assert_eq!(parse_file_name("query_history_2024013_000007.jsonl"), None);
        assert_eq!(parse_file_name("notes.txt"), None);
    }

    #[tokio::test]
    async fn flush_appends_json_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditLogWriter::new(settings(dir.path()));
        for n in 0..3 {
            writer.write(entry(n));
        }
        assert_eq!(writer.pending(), 3);

        assert_eq!(writer.flush().await.unwrap(), 3);
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.flush().await.unwrap(), 0);

        let lines = read_lines(&dir.path().join(file_name(&today(), 1)));
        let rows: Vec<_> = lines.iter().map(|e| e.row_count).collect();
        assert_eq!(rows, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn rotates_when_file_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditLogWriter::new(AuditSettings { max_file_bytes: 10, ..settings(dir.path()) });

        writer.write(entry(1));
        writer.flush().await.unwrap();
        writer.write(entry(2));
        writer.flush().await.unwrap();

        assert_eq!(read_lines(&dir.path().join(file_name(&today(), 1))).len(), 1);
        assert_eq!(read_lines(&dir.path().join(file_name(&today(), 2))).len(), 1);
    }

    #[tokio::test]
    async fn resumes_after_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(file_name(&today(), 3)), "").unwrap();
        std::fs::write(dir.path().join(file_name("20000101", 9)), "").unwrap();

        let writer = AuditLogWriter::new(AuditSettings { retention_days: 0, ..settings(dir.path()) });
        writer.write(entry(1));
        writer.flush().await.unwrap();

        assert_eq!(read_lines(&dir.path().join(file_name(&today(), 3))).len(), 1);
    }

    #[tokio::test]
    async fn start_removes_expired_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join(file_name("20000101", 1));
        let current = dir.path().join(file_name(&today(), 1));
        let unrelated = dir.path().join("README.txt");
        for path in [&old, &current, &unrelated] {
            std::fs::write(path, "").unwrap();
        }

        let writer = Arc::new(AuditLogWriter::new(settings(dir.path())));
        writer.start().await.unwrap();
        writer.stop().await.unwrap();

        assert!(!old.exists());
        assert!(current.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn full_buffer_triggers_background_flush() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(AuditLogWriter::new(AuditSettings { buffer_size: 2, ..settings(dir.path()) }));
        writer.start().await.unwrap();

        writer.write(entry(1));
        writer.write(entry(2));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while writer.pending() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(writer.pending(), 0);
        writer.stop().await.unwrap();
        assert_eq!(read_lines(&dir.path().join(file_name(&today(), 1))).len(), 2);
    }

    #[tokio::test]
    async fn stop_flushes_remaining_entries() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(AuditLogWriter::new(settings(dir.path())));
        writer.start().await.unwrap();
        writer.write(entry(1));

        assert_eq!(writer.stop().await.unwrap(), 1);
        assert_eq!(read_lines(&dir.path().join(file_name(&today(), 1))).len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("blocker");
        std::fs::write(&not_a_dir, "").unwrap();

        let writer = AuditLogWriter::new(settings(&not_a_dir));
        writer.write(entry(1));
        assert!(writer.flush().await.is_err());
        writer.write(entry(2));
        assert_eq!(writer.pending(), 2);
    }

    #[tokio::test]
    async fn repeated_flush_failures_drop_oldest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("blocker");
        std::fs::write(&not_a_dir, "").unwrap();

        let writer = AuditLogWriter::new(AuditSettings {
            buffer_size: 2,
            ..settings(&not_a_dir)
        });
        for n in 0..15 {
            writer.write(entry(n));
        }
        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending(), 15);

        for n in 15..25 {
            writer.write(entry(n));
        }
        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending(), 2 * MAX_BUFFERED_BATCHES);

        let kept: Vec<Option<usize>> = writer.buffer.lock().unwrap().iter().map(|e| e.row_count).collect();
        assert_eq!(kept.first(), Some(&Some(5)));
        assert_eq!(kept.last(), Some(&Some(24)));
    }
}
