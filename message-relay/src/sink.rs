use std::{
    io,
    net::IpAddr,
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::config::ServerConfig;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
#[error("failed to append to {}: {source}", path.display())]
pub struct LogWriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Append-only writer for the activity and message logs.
///
/// Each stream has its own lock, so activity records never wait on message
/// records. Within one stream every append (write, flush, sync) happens under
/// the lock, which keeps records whole when many handlers write at once.
pub struct LogSink {
    activity: AppendLog,
    messages: AppendLog,
}

impl LogSink {
    pub fn new(activity_path: impl Into<PathBuf>, message_path: impl Into<PathBuf>) -> Self {
        Self {
            activity: AppendLog::new(activity_path.into()),
            messages: AppendLog::new(message_path.into()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.activity_log_path.clone(),
            config.message_log_path.clone(),
        )
    }

    pub fn activity_path(&self) -> &Path {
        &self.activity.path
    }

    pub fn message_path(&self) -> &Path {
        &self.messages.path
    }

    pub async fn record_activity(&self, text: &str) -> Result<(), LogWriteError> {
        let line = format_activity(Local::now().naive_local(), text);
        self.activity.append(line).await
    }

    pub async fn record_message(&self, source: IpAddr, text: &str) -> Result<(), LogWriteError> {
        let line = format_message(Local::now().naive_local(), source, text);
        self.messages.append(line).await
    }
}

struct AppendLog {
    path: PathBuf,
    // Opened on first use; dropped after a failed write so the next record reopens it.
    file: Mutex<Option<File>>,
}

impl AppendLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    async fn append(&self, line: String) -> Result<(), LogWriteError> {
        let mut slot = self.file.lock().await;
        let file = match slot.take() {
            Some(file) => file,
            None => open_append(&self.path).await.map_err(|source| self.error(source))?,
        };
        let file = slot.insert(file);

        if let Err(source) = write_durably(file, line.as_bytes()).await {
            *slot = None;
            return Err(self.error(source));
        }
        Ok(())
    }

    fn error(&self, source: io::Error) -> LogWriteError {
        LogWriteError {
            path: self.path.clone(),
            source,
        }
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn write_durably(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

pub(crate) fn format_activity(at: NaiveDateTime, text: &str) -> String {
    format!("[{}] {text}\n", at.format(TIMESTAMP_FORMAT))
}

pub(crate) fn format_message(at: NaiveDateTime, source: IpAddr, text: &str) -> String {
    format!("{} | {source} | {text}\n", at.format(TIMESTAMP_FORMAT))
}
