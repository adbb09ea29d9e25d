//! Sync cursor
//!
//! Start time of the last fully successful cycle. The next cycle pulls
//! attestations created since then; without a cursor it does a full pull.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CursorError;
use crate::fsutil::write_atomic;

/// Default cursor file name inside the data directory
pub const CURSOR_FILE: &str = "HubSchedulerRun.txt";

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn read_cursor(&self) -> Result<Option<DateTime<Utc>>, CursorError>;
    async fn write_cursor(&self, at: DateTime<Utc>) -> Result<(), CursorError>;
}

/// RFC 3339 text in a single file
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn format_cursor(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse stored cursor text; blank means no cursor
pub fn parse_cursor(raw: &str) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw).map(|dt| Some(dt.with_timezone(&Utc)))
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn read_cursor(&self) -> Result<Option<DateTime<Utc>>, CursorError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cursor file, first cycle will do a full pull");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match parse_cursor(&raw) {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    value = %raw.trim(),
                    error = %e,
                    "Unreadable cursor, falling back to a full pull"
                );
                Ok(None)
            }
        }
    }

    async fn write_cursor(&self, at: DateTime<Utc>) -> Result<(), CursorError> {
        let path = self.path.clone();
        let text = format_cursor(at);
        tokio::task::spawn_blocking(move || write_atomic(&path, text.as_bytes()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        debug!(path = %self.path.display(), cursor = %format_cursor(at), "Cursor advanced");
        Ok(())
    }
}

/// Process-local cursor
#[derive(Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryCursorStore {
    pub fn new(initial: Option<DateTime<Utc>>) -> Self {
        Self {
            cursor: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        *self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn read_cursor(&self) -> Result<Option<DateTime<Utc>>, CursorError> {
        Ok(self.current())
    }

    async fn write_cursor(&self, at: DateTime<Utc>) -> Result<(), CursorError> {
        *self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(at);
        Ok(())
    }
}
