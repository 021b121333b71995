use crate::{debounce::FlushTarget, hub::InsightHub};
use aoc_core::insight_contracts::{ServerEnvelope, Topic};
use std::{
    io::{self, SeekFrom},
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: u64 = 1024 * 1024;
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Byte cursor over an append-only text file.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    warned_missing: bool,
    /// Set when the last read stopped short of the file size.
    behind: bool,
    chunk_bytes: u64,
    max_line_bytes: usize,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
            warned_missing: false,
            behind: false,
            chunk_bytes: READ_CHUNK_BYTES,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn is_behind(&self) -> bool {
        self.behind
    }

    /// Skips existing history so only lines appended from now on are emitted.
    pub async fn prime(&mut self) {
        match fs::metadata(&self.path).await {
            Ok(meta) => {
                self.offset = meta.len();
                info!(event = "log_tail_primed", path = %self.path.display(), offset = self.offset);
            }
            Err(err) => {
                self.offset = 0;
                self.note_missing(&err);
            }
        }
    }

    /// Reads at most one chunk of the bytes appended since the last call and
    /// returns every complete line. A trailing fragment waits for its
    /// terminator unless it outgrows the line cap.
    pub async fn read_new_lines(&mut self) -> Vec<String> {
        self.behind = false;
        let size = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                self.note_missing(&err);
                self.offset = 0;
                self.partial.clear();
                return Vec::new();
            }
        };
        if self.warned_missing {
            info!(event = "log_file_found", path = %self.path.display());
            self.warned_missing = false;
        }

        if size < self.offset {
            info!(event = "log_truncated", path = %self.path.display(), offset = self.offset, size = size);
            self.offset = 0;
            self.partial.clear();
        }
        if size == self.offset {
            return Vec::new();
        }

        let available = size - self.offset;
        let len = available.min(self.chunk_bytes);
        match self.read_from_offset(len).await {
            Ok(bytes) => {
                self.offset += bytes.len() as u64;
                self.behind = !bytes.is_empty() && available > bytes.len() as u64;
                self.partial.extend_from_slice(&bytes);
            }
            Err(err) => {
                warn!(event = "log_read_error", path = %self.path.display(), error = %err);
                return Vec::new();
            }
        }
        self.drain_complete_lines()
    }

    async fn read_from_offset(&self, len: u64) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    fn drain_complete_lines(&mut self) -> Vec<String> {
        let mut lines = match self.partial.iter().rposition(|byte| *byte == b'\n') {
            Some(last_newline) => {
                let rest = self.partial.split_off(last_newline + 1);
                let complete = std::mem::replace(&mut self.partial, rest);
                complete[..last_newline]
                    .split(|byte| *byte == b'\n')
                    .map(|line| {
                        let line = line.strip_suffix(b"\r").unwrap_or(line);
                        String::from_utf8_lossy(line).into_owned()
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        if self.partial.len() >= self.max_line_bytes {
            warn!(
                event = "log_line_split",
                path = %self.path.display(),
                bytes = self.partial.len()
            );
            let oversized = std::mem::take(&mut self.partial);
            lines.push(String::from_utf8_lossy(&oversized).into_owned());
        }
        lines
    }

    fn note_missing(&mut self, err: &io::Error) {
        if self.warned_missing {
            return;
        }
        self.warned_missing = true;
        if err.kind() == io::ErrorKind::NotFound {
            warn!(event = "log_missing", path = %self.path.display());
        } else {
            warn!(event = "log_stat_error", path = %self.path.display(), error = %err);
        }
    }
}

/// Forwards appended log lines to `logs` subscribers.
pub struct LogDispatcher {
    hub: Arc<InsightHub>,
    tail: LogTail,
}

impl LogDispatcher {
    pub fn new(hub: Arc<InsightHub>, tail: LogTail) -> Self {
        Self { hub, tail }
    }
}

impl FlushTarget for LogDispatcher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn flush(&mut self) {
        let mut total = 0;
        let mut delivered = 0;
        loop {
            let lines = self.tail.read_new_lines().await;
            total += lines.len();
            for line in lines {
                let envelope = ServerEnvelope::AgentLog { log: line };
                delivered += self.hub.broadcast_to_topic(&Topic::Logs, &envelope).await;
            }
            if !self.tail.is_behind() {
                break;
            }
        }
        if total > 0 {
            debug!(event = "log_flush", lines = total, delivered = delivered);
        }
    }
}
