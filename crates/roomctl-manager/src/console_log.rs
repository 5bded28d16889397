//! Drains client stdout/stderr so the pipes never fill up, and keeps the lines
//! around for diagnostics.

use std::path::{Path, PathBuf};

use roomctl_process::RoomId;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::mpsc,
};

use crate::config::ManagerConfig;

const CONSOLE_FILE: &str = "console.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum ConsoleSink {
    File(mpsc::UnboundedSender<(Stream, String)>),
    Trace,
}

impl ConsoleSink {
    /// Opens the per-room sink. Only the registered owner of a room may call
    /// this; the file writer task lives until every clone is dropped.
    pub(crate) fn open(cfg: &ManagerConfig, room_id: &RoomId) -> Self {
        let Some(dir) = cfg.console_log_dir.as_ref() else {
            return ConsoleSink::Trace;
        };

        let room_dir = dir.join(room_id.as_str());
        let (max_bytes, max_files) = (cfg.console_log_max_bytes, cfg.console_log_max_files);
        let (tx, mut rx) = mpsc::unbounded_channel::<(Stream, String)>();
        let room = room_id.clone();
        tokio::spawn(async move {
            let mut console = match ConsoleFile::create(&room_dir, max_bytes, max_files).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(
                        room_id = %room,
                        dir = %room_dir.display(),
                        %err,
                        "console log unavailable"
                    );
                    return;
                }
            };
            while let Some((stream, line)) = rx.recv().await {
                if let Err(err) = console.append(stream, &line).await {
                    tracing::debug!(room_id = %room, %err, "console write failed");
                }
            }
            let _ = console.file.flush().await;
        });
        ConsoleSink::File(tx)
    }

    fn emit(&self, room_id: &RoomId, stream: Stream, line: String) {
        match self {
            ConsoleSink::File(tx) => {
                let _ = tx.send((stream, line));
            }
            ConsoleSink::Trace => {
                tracing::debug!(room_id = %room_id, stream = stream.as_str(), "{line}");
            }
        }
    }
}

/// Forwards every line of `reader` to `sink` until EOF.
pub(crate) fn drain<R>(reader: R, stream: Stream, room_id: RoomId, sink: ConsoleSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.emit(&room_id, stream, line),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(
                        room_id = %room_id,
                        stream = stream.as_str(),
                        %err,
                        "console read failed"
                    );
                    break;
                }
            }
        }
    });
}

/// `<room dir>/console.log` plus up to `keep` older generations
/// (`console.log.1` is the newest).
struct ConsoleFile {
    path: PathBuf,
    limit: u64,
    keep: usize,
    written: u64,
    file: tokio::fs::File,
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl ConsoleFile {
    async fn create(room_dir: &Path, limit: u64, keep: usize) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(room_dir).await?;
        let path = room_dir.join(CONSOLE_FILE);
        // A restarted room keeps appending to its previous console.
        let written = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let file = open_append(&path).await?;
        Ok(Self {
            path,
            limit,
            keep,
            written,
            file,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        self.path.with_file_name(format!("{CONSOLE_FILE}.{n}"))
    }

    async fn shift_generations(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        for n in (1..self.keep).rev() {
            let older = self.generation(n);
            if tokio::fs::try_exists(&older).await.unwrap_or(false) {
                tokio::fs::rename(&older, self.generation(n + 1)).await?;
            }
        }
        tokio::fs::rename(&self.path, self.generation(1)).await?;
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    /// Writes `[stream] line`, starting a new generation first if the line
    /// would push the current file past `limit`.
    async fn append(&mut self, stream: Stream, line: &str) -> std::io::Result<()> {
        let record = format!("[{}] {}\n", stream.as_str(), line.trim_end_matches('\n'));
        let len = record.len() as u64;
        if self.limit > 0 && self.written > 0 && self.written.saturating_add(len) > self.limit {
            if let Err(err) = self.shift_generations().await {
                tracing::debug!(path = %self.path.display(), %err, "console rotation failed");
            }
        }
        self.file.write_all(record.as_bytes()).await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_file_keeps_bounded_generations() {
        let dir = tempfile::tempdir().unwrap();
        let room_dir = dir.path().join("room");
        let mut console = ConsoleFile::create(&room_dir, 32, 2).await.unwrap();

        for i in 0..10 {
            console.append(Stream::Stdout, &format!("line {i}")).await.unwrap();
        }
        console.file.flush().await.unwrap();

        let current = tokio::fs::read_to_string(room_dir.join("console.log"))
            .await
            .unwrap();
        assert!(current.contains("[stdout] line 9"));
        assert!(current.len() <= 32);
        assert!(room_dir.join("console.log.1").exists());
        assert!(room_dir.join("console.log.2").exists());
        assert!(!room_dir.join("console.log.3").exists());
    }

    #[tokio::test]
    async fn oversized_line_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = ConsoleFile::create(dir.path(), 8, 1).await.unwrap();
        console.append(Stream::Stderr, "far longer than eight").await.unwrap();
        console.file.flush().await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("console.log"))
            .await
            .unwrap();
        assert_eq!(text, "[stderr] far longer than eight\n");
        assert!(!dir.path().join("console.log.1").exists());
    }

    #[tokio::test]
    async fn drain_forwards_tagged_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let room = RoomId::parse("55").unwrap();
        drain(&b"hello\nworld\n"[..], Stream::Stdout, room, ConsoleSink::File(tx));

        assert_eq!(rx.recv().await.unwrap(), (Stream::Stdout, "hello".to_string()));
        assert_eq!(rx.recv().await.unwrap(), (Stream::Stdout, "world".to_string()));
        assert!(rx.recv().await.is_none());
    }
}
