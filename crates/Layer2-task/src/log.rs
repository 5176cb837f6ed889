//! Task Log System - append-only capture and labelled reading
//!
//! Provides:
//! - Append-mode handles on the `stdout`/`stderr` artifacts for the shim
//! - Tail reading of both streams into a [`LogView`]
//! - Following both streams as they grow ([`LogFollower`])
//!
//! Streams are kept separate; no cross-stream ordering is reconstructed.

use crate::artifact::Artifact;
use crate::store::TaskStore;
use crate::task::TaskId;
use mult_foundation::{Error, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Re-read interval when no watch event arrives
const FOLLOW_POLL: Duration = Duration::from_millis(500);

/// Which standard stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn label(&self) -> &'static str {
        match self {
            LogStream::Stdout => "[STDOUT]",
            LogStream::Stderr => "[STDERR]",
        }
    }

    pub fn artifact(&self) -> Artifact {
        match self {
            LogStream::Stdout => Artifact::Stdout,
            LogStream::Stderr => Artifact::Stderr,
        }
    }
}

/// Opens the capture files for a task
pub struct LogCapture;

impl LogCapture {
    /// Append-only handle, created if missing
    pub fn open(store: &TaskStore, id: TaskId, stream: LogStream) -> Result<File> {
        let path = store.artifact_path(id, stream.artifact());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::artifact(stream.artifact().file_name(), e))
    }

    /// Last `lines` lines of both streams; `0` reads everything
    pub fn read(store: &TaskStore, id: TaskId, lines: usize) -> Result<LogView> {
        let (view, _) = Self::read_with_offsets(store, id, lines)?;
        Ok(view)
    }

    /// Like [`LogCapture::read`], then keep delivering what is appended
    /// after the returned tail
    pub fn follow(store: &TaskStore, id: TaskId, lines: usize) -> Result<(LogView, LogFollower)> {
        // watch first so nothing written while the tail is read goes unseen
        let (tx, events) = mpsc::channel(1);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => warn!("Log watch error: {}", e),
            },
            Config::default(),
        )
        .map_err(watch_error)?;
        watcher
            .watch(&store.task_dir(id), RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        let (view, [stdout, stderr]) = Self::read_with_offsets(store, id, lines)?;
        let cursor = |stream: LogStream, offset| StreamCursor {
            stream,
            path: store.artifact_path(id, stream.artifact()),
            offset,
            pending: Vec::new(),
        };
        let follower = LogFollower {
            cursors: [cursor(LogStream::Stdout, stdout), cursor(LogStream::Stderr, stderr)],
            events,
            _watcher: watcher,
        };
        Ok((view, follower))
    }

    fn read_with_offsets(store: &TaskStore, id: TaskId, lines: usize) -> Result<(LogView, [u64; 2])> {
        let (stdout, stdout_end) = tail(&store.artifact_path(id, Artifact::Stdout), lines)
            .map_err(|e| Error::artifact(Artifact::Stdout.file_name(), e))?;
        let (stderr, stderr_end) = tail(&store.artifact_path(id, Artifact::Stderr), lines)
            .map_err(|e| Error::artifact(Artifact::Stderr.file_name(), e))?;
        debug!(
            "Read {} stdout / {} stderr lines of task {}",
            stdout.len(),
            stderr.len(),
            id
        );
        Ok((LogView { stdout, stderr }, [stdout_end, stderr_end]))
    }
}

fn watch_error(e: notify::Error) -> Error {
    Error::Io(std::io::Error::other(format!("cannot watch task logs: {}", e)))
}

/// Bounded tail of a file and the offset it ends at; a missing file reads
/// as empty
fn tail(path: &Path, lines: usize) -> std::io::Result<(Vec<String>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };

    let mut reader = BufReader::new(file);
    let mut buffer: VecDeque<String> = VecDeque::new();
    let mut raw = Vec::new();
    let mut offset = 0;
    loop {
        raw.clear();
        let read = reader.read_until(b'\n', &mut raw)?;
        if read == 0 {
            break;
        }
        offset += read as u64;
        if lines > 0 && buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(decode_line(&raw));
    }
    Ok((buffer.into(), offset))
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

// ============================================================================
// Following
// ============================================================================

/// A complete line appended to one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

/// Read position in one stream; an unterminated last line waits in
/// `pending` until its newline arrives
#[derive(Debug)]
struct StreamCursor {
    stream: LogStream,
    path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
}

impl StreamCursor {
    fn read_new(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() < self.offset {
            // truncated or replaced: start over
            self.offset = 0;
            self.pending.clear();
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let read = file.read_to_end(&mut self.pending)?;
        self.offset += read as u64;

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(decode_line(&raw));
        }
        Ok(lines)
    }
}

/// Delivers lines appended to a task's logs; keeps its file watch alive
#[derive(Debug)]
pub struct LogFollower {
    cursors: [StreamCursor; 2],
    events: mpsc::Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl LogFollower {
    /// Whatever complete lines arrived since the last call, stdout first
    pub fn poll(&mut self) -> Result<Vec<LogLine>> {
        let mut lines = Vec::new();
        for cursor in &mut self.cursors {
            let stream = cursor.stream;
            let new = cursor
                .read_new()
                .map_err(|e| Error::artifact(stream.artifact().file_name(), e))?;
            lines.extend(new.into_iter().map(|text| LogLine { stream, text }));
        }
        Ok(lines)
    }

    /// Wait until at least one new line is available
    pub async fn next(&mut self) -> Result<Vec<LogLine>> {
        loop {
            let lines = self.poll()?;
            if !lines.is_empty() {
                return Ok(lines);
            }
            // a coalesced or missed event is covered by the timeout
            let _ = tokio::time::timeout(FOLLOW_POLL, self.events.recv()).await;
        }
    }
}

/// One labelled block of a [`LogView`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSection<'a> {
    pub stream: LogStream,
    pub lines: &'a [String],
}

/// Both streams of a task, separated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogView {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl LogView {
    /// Non-empty streams only, stdout first
    pub fn sections(&self) -> Vec<LogSection<'_>> {
        [
            (LogStream::Stdout, &self.stdout),
            (LogStream::Stderr, &self.stderr),
        ]
        .into_iter()
        .filter(|(_, lines)| !lines.is_empty())
        .map(|(stream, lines)| LogSection {
            stream,
            lines: lines.as_slice(),
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Plain-text rendering with a label line per section
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in self.sections() {
            out.push_str(section.stream.label());
            out.push('\n');
            for line in section.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}
