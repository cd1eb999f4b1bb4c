//! Dedicated call-outcome log files
//!
//! Besides the application log, a handful of outcomes are appended to
//! dedicated files for offline campaign review: caller hangups, callers
//! who dropped while queued, and transcripts split by classified intent.
//! Each file rotates at 5 MB keeping 5 numbered backups.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use tracing::warn;

const MAX_BYTES: u64 = 5 * 1024 * 1024;
const MAX_BACKUPS: u32 = 5;

/// Which outcome file a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeFile {
    Hangups,
    UserDrop,
    PositiveStt,
    NegativeStt,
    UnknownStt,
}

impl OutcomeFile {
    fn file_name(&self) -> &'static str {
        match self {
            OutcomeFile::Hangups => "hangups.log",
            OutcomeFile::UserDrop => "userdrop.log",
            OutcomeFile::PositiveStt => "positive_stt.log",
            OutcomeFile::NegativeStt => "negative_stt.log",
            OutcomeFile::UnknownStt => "unknown_stt.log",
        }
    }
}

/// Append-only writer for the outcome files.
///
/// Writing is best-effort: a failed append is logged and swallowed so an
/// unwritable disk never interferes with call handling.
pub struct OutcomeLogs {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl OutcomeLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create outcome log dir");
        }
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    /// Append one record, stamped with local time.
    pub fn append(&self, file: OutcomeFile, phone_number: &str, detail: &str) {
        let _guard = self.lock.lock();
        let path = self.dir.join(file.file_name());
        if let Err(e) = self.rotate_if_needed(&path) {
            warn!(path = %path.display(), error = %e, "outcome log rotation failed");
        }
        let line = format!(
            "{} {} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            phone_number,
            detail
        );
        if let Err(e) = Self::append_line(&path, &line) {
            warn!(path = %path.display(), error = %e, "outcome log append failed");
        }
    }

    fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())
    }

    /// Rename chain: file → file.1 → ... → file.5, dropping the oldest.
    fn rotate_if_needed(&self, path: &Path) -> std::io::Result<()> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < MAX_BYTES {
            return Ok(());
        }
        let backup = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));
        let oldest = backup(MAX_BACKUPS);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..MAX_BACKUPS).rev() {
            let from = backup(n);
            if from.exists() {
                fs::rename(&from, backup(n + 1))?;
            }
        }
        fs::rename(path, backup(1))?;
        File::create(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_to_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs = OutcomeLogs::new(dir.path());
        logs.append(OutcomeFile::Hangups, "09123456789", "hangup during record");
        logs.append(OutcomeFile::PositiveStt, "09123456789", "بله حتما");
        let hangups = fs::read_to_string(dir.path().join("hangups.log")).unwrap();
        assert!(hangups.contains("09123456789"));
        assert!(dir.path().join("positive_stt.log").exists());
    }

    #[test]
    fn rotates_when_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let logs = OutcomeLogs::new(dir.path());
        let path = dir.path().join("hangups.log");
        // Pre-fill beyond the limit, then append once to trigger rotation.
        let big = vec![b'x'; (MAX_BYTES + 1) as usize];
        fs::write(&path, big).unwrap();
        logs.append(OutcomeFile::Hangups, "0912", "x");
        assert!(dir.path().join("hangups.log.1").exists());
        let fresh = fs::metadata(&path).unwrap().len();
        assert!(fresh < 1024, "fresh file should be near-empty, got {fresh}");
    }
}
