//! Append-only JSONL event files, one per session.
//!
//! Appends write one complete line per `write()` call with the file opened
//! `O_APPEND`, so concurrent readers never observe a torn line boundary —
//! at worst a partial final line from a crash mid-write, which the tail
//! reader skips.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::models::event::AgentEvent;
use crate::{AppError, Result};

/// Chunk size for the backwards tail scan.
const TAIL_CHUNK_BYTES: u64 = 64 * 1024;

/// Per-session append-only event files under one directory.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    /// Create a log rooted at `dir`; the directory is created on demand.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Path of the event file for `session_id`.
    ///
    /// Session ids are agent-assigned strings; characters that are not
    /// filename-safe are replaced so an id can never escape the directory.
    #[must_use]
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Append one event as a single newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the directory cannot be created or the
    /// write fails.
    pub async fn append(&self, event: &AgentEvent) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::Io(format!("failed to create events dir: {e}")))?;

        let mut line = serde_json::to_vec(event)
            .map_err(|e| AppError::Io(format!("failed to serialize event: {e}")))?;
        line.push(b'\n');

        let path = self.path_for(&event.session_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
        file.write_all(&line)
            .await
            .map_err(|e| AppError::Io(format!("failed to append to {}: {e}", path.display())))?;

        Ok(())
    }

    /// Read the last `max_n` events in chronological order.
    ///
    /// Scans the file backwards in [`TAIL_CHUNK_BYTES`] chunks looking for
    /// line separators, so resident memory stays proportional to the
    /// requested tail rather than the file size. Unparseable lines —
    /// including a partial final line left by a crash — are skipped with a
    /// warning; a corrupt tail never hides older valid events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the file exists but cannot be read.
    pub async fn tail(&self, session_id: &str, max_n: usize) -> Result<Vec<AgentEvent>> {
        let path = self.path_for(session_id);
        if max_n == 0 || !path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&path)
            .await
            .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| AppError::Io(format!("failed to stat {}: {e}", path.display())))?
            .len();

        // Accumulate bytes from the end until the buffer holds more than
        // `max_n` newlines (so the oldest line in it is complete) or the
        // whole file is buffered.
        let mut buf: Vec<u8> = Vec::new();
        let mut pos = len;
        while pos > 0 && count_newlines(&buf) <= max_n {
            let take = TAIL_CHUNK_BYTES.min(pos);
            pos -= take;
            file.seek(SeekFrom::Start(pos))
                .await
                .map_err(|e| AppError::Io(format!("seek failed: {e}")))?;
            let mut chunk = vec![0_u8; usize::try_from(take).unwrap_or_default()];
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| AppError::Io(format!("read failed: {e}")))?;
            chunk.extend_from_slice(&buf);
            buf = chunk;
        }

        let mut segments: Vec<&[u8]> = buf.split(|&b| b == b'\n').collect();
        if pos > 0 && !segments.is_empty() {
            // The first segment continues into an unread chunk; it is not a
            // whole line.
            segments.remove(0);
        }

        let mut events: Vec<AgentEvent> = Vec::new();
        for segment in segments {
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<AgentEvent>(segment) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        session_id,
                        error = %e,
                        "skipping unparseable event line"
                    );
                }
            }
        }

        if events.len() > max_n {
            events.drain(..events.len() - max_n);
        }
        Ok(events)
    }

    /// Remove the event file for `session_id`, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on any failure other than the file already
    /// being gone.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(format!(
                "failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// The directory event files live under.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn count_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}
