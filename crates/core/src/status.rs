//! Status reporter (spec §4.6): an append-only, human-readable log of
//! mount lifecycle and expansion-failure events, independent of `tracing`
//! output so a user can `tail -f` it without turning on debug logging.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

impl StatusLevel {
    fn as_str(self) -> &'static str {
        match self {
            StatusLevel::Info => "INFO",
            StatusLevel::Warn => "WARN",
            StatusLevel::Error => "ERROR",
        }
    }
}

/// Appends `<ISO-8601-UTC> <level> <message>` lines to a file, creating it
/// (and its parent directory) on first use.
pub struct StatusReporter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatusReporter {
    pub fn new(path: PathBuf) -> Self {
        StatusReporter { path, lock: Mutex::new(()) }
    }

    pub async fn log(&self, level: StatusLevel, message: impl AsRef<str>) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = format!(
            "{} {} {}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            level.as_str(),
            message.as_ref()
        );
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn info(&self, message: impl AsRef<str>) -> std::io::Result<()> {
        self.log(StatusLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl AsRef<str>) -> std::io::Result<()> {
        self.log(StatusLevel::Warn, message).await
    }

    pub async fn error(&self, message: impl AsRef<str>) -> std::io::Result<()> {
        self.log(StatusLevel::Error, message).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_lines_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = StatusReporter::new(tmp.path().join("status.txt"));
        reporter.info("mount started").await.unwrap();
        reporter.warn("slow response from remote").await.unwrap();

        let contents = tokio::fs::read_to_string(reporter.path()).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO mount started"));
        assert!(lines[1].ends_with("WARN slow response from remote"));
    }

    #[tokio::test]
    async fn creates_parent_directory_on_first_write() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("nested").join("dir").join("status.txt");
        let reporter = StatusReporter::new(nested.clone());
        reporter.info("hello").await.unwrap();
        assert!(nested.exists());
    }
}
