//! JSON-lines file source.
//!
//! Tails a file where every line is one event payload. The line index is
//! the offset; the committed cursor (index of the next line to process)
//! lives in a sidecar file `<path>.cursor`, replaced atomically on commit.
//! A line without its trailing newline is treated as still being written.
//! Lines are handed out as raw bytes; validating them is the decoder's job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::source::{EventSource, SourceRecord};

pub struct JsonLinesSource {
    name: String,
    cursor_path: PathBuf,
    reader: BufReader<File>,
    /// Bytes of a line whose newline has not arrived yet.
    partial: Vec<u8>,
    /// Offset the next complete line will get.
    next_offset: u64,
    /// Record handed out by `poll` and not yet committed.
    inflight: Option<SourceRecord>,
}

impl JsonLinesSource {
    /// Open `path` and position just after the last committed line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let cursor_path = cursor_path_for(path);

        let committed = read_cursor(&name, &cursor_path).await?;

        let file = File::open(path).await.map_err(|e| SourceError::Io {
            name: name.clone(),
            reason: format!("open: {e}"),
        })?;

        let mut source = Self {
            name,
            cursor_path,
            reader: BufReader::new(file),
            partial: Vec::new(),
            next_offset: 0,
            inflight: None,
        };

        while source.next_offset < committed {
            match source.read_complete_line().await? {
                Some(_) => source.next_offset += 1,
                None => {
                    warn!(
                        source = %source.name,
                        cursor = committed,
                        lines = source.next_offset,
                        "Cursor is past the end of the file; resuming at end"
                    );
                    break;
                }
            }
        }

        info!(source = %source.name, offset = source.next_offset, "Event source opened");
        Ok(source)
    }

    /// Offset of the next line to be read.
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Read one full line, or `None` if only a partial line (or nothing)
    /// is available yet.
    async fn read_complete_line(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let read = self
            .reader
            .read_until(b'\n', &mut self.partial)
            .await
            .map_err(|e| SourceError::Io {
                name: self.name.clone(),
                reason: format!("read: {e}"),
            })?;

        if read == 0 || self.partial.last() != Some(&b'\n') {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.partial);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }
}

fn cursor_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".cursor");
    PathBuf::from(os)
}

async fn read_cursor(name: &str, cursor_path: &Path) -> Result<u64, SourceError> {
    match tokio::fs::read_to_string(cursor_path).await {
        Ok(contents) => contents.trim().parse().map_err(|e| SourceError::Cursor {
            name: name.to_string(),
            reason: format!("{}: {e}", cursor_path.display()),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(SourceError::Cursor {
            name: name.to_string(),
            reason: format!("{}: {e}", cursor_path.display()),
        }),
    }
}

#[async_trait]
impl EventSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceRecord>, SourceError> {
        if let Some(record) = &self.inflight {
            return Ok(Some(record.clone()));
        }

        loop {
            let Some(line) = self.read_complete_line().await? else {
                tokio::time::sleep(timeout).await;
                return Ok(None);
            };

            let offset = self.next_offset;
            self.next_offset += 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                debug!(source = %self.name, offset, "Skipping blank line");
                continue;
            }

            let record = SourceRecord {
                offset,
                payload: line,
            };
            self.inflight = Some(record.clone());
            return Ok(Some(record));
        }
    }

    async fn commit(&mut self, record: &SourceRecord) -> Result<(), SourceError> {
        let inflight = self.inflight.as_ref().map(|r| r.offset);
        if inflight != Some(record.offset) {
            return Err(SourceError::CommitMismatch {
                offset: record.offset,
                inflight,
            });
        }

        let tmp = self.cursor_path.with_extension("cursor.tmp");
        let io_err = |e: std::io::Error| SourceError::Io {
            name: self.name.clone(),
            reason: format!("cursor write: {e}"),
        };
        tokio::fs::write(&tmp, (record.offset + 1).to_string())
            .await
            .map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.cursor_path)
            .await
            .map_err(io_err)?;

        self.inflight = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(1);

    async fn drain(source: &mut JsonLinesSource) -> Vec<(u64, String)> {
        let mut seen = Vec::new();
        while let Some(record) = source.poll(NO_WAIT).await.unwrap() {
            source.commit(&record).await.unwrap();
            seen.push((record.offset, String::from_utf8(record.payload).unwrap()));
        }
        seen
    }

    #[tokio::test]
    async fn reads_lines_and_persists_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, "{\"a\":1}\n\n{\"b\":2}\r\n").await.unwrap();

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        let seen = drain(&mut source).await;
        assert_eq!(
            seen,
            vec![(0, "{\"a\":1}".to_string()), (2, "{\"b\":2}".to_string())]
        );

        let cursor = tokio::fs::read_to_string(cursor_path_for(&path)).await.unwrap();
        assert_eq!(cursor, "3");
    }

    #[tokio::test]
    async fn resumes_after_last_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, "one\ntwo\nthree\n").await.unwrap();

        {
            let mut source = JsonLinesSource::open(&path).await.unwrap();
            let first = source.poll(NO_WAIT).await.unwrap().unwrap();
            source.commit(&first).await.unwrap();
            // Second record polled but never committed.
            let second = source.poll(NO_WAIT).await.unwrap().unwrap();
            assert_eq!(second.offset, 1);
        }

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        assert_eq!(source.position(), 1);
        let seen = drain(&mut source).await;
        assert_eq!(
            seen,
            vec![(1, "two".to_string()), (2, "three".to_string())]
        );
    }

    #[tokio::test]
    async fn uncommitted_record_is_redelivered() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, "one\ntwo\n").await.unwrap();

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        let first = source.poll(NO_WAIT).await.unwrap().unwrap();
        let again = source.poll(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn partial_line_waits_for_newline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, "done\npart").await.unwrap();

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        let first = source.poll(NO_WAIT).await.unwrap().unwrap();
        source.commit(&first).await.unwrap();
        assert!(source.poll(NO_WAIT).await.unwrap().is_none());

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"ial\n").await.unwrap();
        file.flush().await.unwrap();

        let record = source.poll(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(record.offset, 1);
        assert_eq!(record.payload, b"partial");
    }

    #[tokio::test]
    async fn invalid_utf8_line_keeps_its_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, b"good0\n\xff\xfe\ngood2\n").await.unwrap();

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        let mut seen = Vec::new();
        while let Some(record) = source.poll(NO_WAIT).await.unwrap() {
            source.commit(&record).await.unwrap();
            seen.push((record.offset, record.payload));
        }
        assert_eq!(
            seen,
            vec![
                (0, b"good0".to_vec()),
                (1, vec![0xff, 0xfe]),
                (2, b"good2".to_vec()),
            ]
        );
        let cursor = tokio::fs::read_to_string(cursor_path_for(&path)).await.unwrap();
        assert_eq!(cursor, "3");
    }

    #[tokio::test]
    async fn reopens_past_committed_invalid_utf8_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, b"good0\n\xff\xfe\ngood2\n").await.unwrap();

        {
            let mut source = JsonLinesSource::open(&path).await.unwrap();
            for _ in 0..2 {
                let record = source.poll(NO_WAIT).await.unwrap().unwrap();
                source.commit(&record).await.unwrap();
            }
        }

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        assert_eq!(source.position(), 2);
        let record = source.poll(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(record.offset, 2);
        assert_eq!(record.payload, b"good2");
    }

    #[tokio::test]
    async fn corrupt_cursor_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, "one\n").await.unwrap();
        tokio::fs::write(cursor_path_for(&path), "not-a-number").await.unwrap();

        let err = JsonLinesSource::open(&path).await.err().unwrap();
        assert!(matches!(err, SourceError::Cursor { .. }));
    }

    #[tokio::test]
    async fn commit_must_match_inflight() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        tokio::fs::write(&path, "one\n").await.unwrap();

        let mut source = JsonLinesSource::open(&path).await.unwrap();
        let stray = SourceRecord {
            offset: 5,
            payload: Vec::new(),
        };
        assert!(source.commit(&stray).await.is_err());
    }
}
