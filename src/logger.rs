// src/logger.rs

//! Task output capture.
//!
//! [`OutputSink`] is the cloneable writer handed to executors and script
//! engines. [`TaskLogger`] is the launcher-side sink target: it splits the
//! stream into lines, prefixes them with task identity and time, keeps a
//! bounded buffer and optionally forwards to a live [`LogAppender`] and a
//! log file.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::task::{TaskId, TaskLogs};

/// Shared, thread-safe byte sink.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputSink")
    }
}

impl OutputSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    pub fn discard() -> Self {
        Self::new(io::sink())
    }

    /// A sink whose bytes can be read back through the returned handle.
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (Self::new(captured.clone()), captured)
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Box<dyn Write + Send>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("output sink lock poisoned"))
    }

    /// Write and flush in one step so readers see output live.
    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.lock()?;
        w.write_all(bytes)?;
        w.flush()
    }

    pub fn write_str(&self, s: &str) -> io::Result<()> {
        self.write_bytes(s.as_bytes())
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

/// In-memory buffer behind [`OutputSink::capture`].
#[derive(Clone, Default)]
pub struct CapturedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .buf
            .lock()
            .map_err(|_| io::Error::other("capture buffer lock poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn index(self) -> usize {
        match self {
            LogStream::Stdout => 0,
            LogStream::Stderr => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: LogStream,
    pub timestamp: DateTime<Local>,
    /// Without the trailing newline.
    pub text: String,
}

/// Receiver of live task log lines, typically a remote log collector.
pub trait LogAppender: Send + Sync {
    fn append(&self, formatted: &str, line: &LogLine);
}

/// Echoes task lines to this process's stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleAppender;

impl LogAppender for ConsoleAppender {
    fn append(&self, formatted: &str, line: &LogLine) {
        match line.stream {
            LogStream::Stdout => {
                let mut out = io::stdout().lock();
                if let Err(e) = out.write_all(formatted.as_bytes()).and_then(|_| out.flush()) {
                    debug!(error = %e, "cannot echo task output");
                }
            }
            LogStream::Stderr => {
                if let Err(e) = io::stderr().lock().write_all(formatted.as_bytes()) {
                    debug!(error = %e, "cannot echo task errors");
                }
            }
        }
    }
}

struct LoggerState {
    lines: VecDeque<LogLine>,
    dropped: usize,
    partial: [Vec<u8>; 2],
    appender: Option<Arc<dyn LogAppender>>,
    file: Option<BufWriter<File>>,
    closed: bool,
}

struct LoggerInner {
    prefix: String,
    prefixed: bool,
    max_lines: usize,
    state: Mutex<LoggerState>,
}

/// Line-oriented capture of a task's stdout and stderr.
#[derive(Clone)]
pub struct TaskLogger {
    inner: Arc<LoggerInner>,
}

impl fmt::Debug for TaskLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLogger")
            .field("prefix", &self.inner.prefix)
            .field("max_lines", &self.inner.max_lines)
            .finish()
    }
}

/// Log file name used for precious logs.
pub fn log_file_name(task_id: &TaskId) -> String {
    format!("TaskLogs-{}-{}.log", task_id.job_id, task_id.task_id)
}

impl TaskLogger {
    pub fn new(task_id: &TaskId, host: &str, max_lines: usize, prefixed: bool) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                prefix: format!("{task_id}@{host}"),
                prefixed,
                max_lines: max_lines.max(1),
                state: Mutex::new(LoggerState {
                    lines: VecDeque::new(),
                    dropped: 0,
                    partial: [Vec::new(), Vec::new()],
                    appender: None,
                    file: None,
                    closed: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoggerState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn output_sink(&self) -> OutputSink {
        OutputSink::new(LoggerWriter {
            logger: self.clone(),
            stream: LogStream::Stdout,
        })
    }

    pub fn error_sink(&self) -> OutputSink {
        OutputSink::new(LoggerWriter {
            logger: self.clone(),
            stream: LogStream::Stderr,
        })
    }

    fn format(&self, line: &LogLine) -> String {
        if self.inner.prefixed {
            format!(
                "[{};{}] {}\n",
                self.inner.prefix,
                line.timestamp.format("%H:%M:%S"),
                line.text
            )
        } else {
            format!("{}\n", line.text)
        }
    }

    fn push(&self, stream: LogStream, bytes: &[u8]) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        let idx = stream.index();
        state.partial[idx].extend_from_slice(bytes);
        while let Some(pos) = state.partial[idx].iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = state.partial[idx].drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            self.record(&mut state, stream, text);
        }
    }

    fn record(&self, state: &mut LoggerState, stream: LogStream, text: String) {
        let line = LogLine {
            stream,
            timestamp: Local::now(),
            text,
        };
        let formatted = self.format(&line);
        if let Some(file) = state.file.as_mut() {
            if let Err(e) = file.write_all(formatted.as_bytes()) {
                warn!(error = %e, "failed to write task log file; detaching it");
                state.file = None;
            }
        }
        if let Some(appender) = &state.appender {
            appender.append(&formatted, &line);
        }
        state.lines.push_back(line);
        while state.lines.len() > self.inner.max_lines {
            state.lines.pop_front();
            state.dropped += 1;
        }
    }

    /// Start streaming to `appender`, replaying what is already stored.
    pub fn activate(&self, appender: Arc<dyn LogAppender>) {
        let mut state = self.state();
        for line in &state.lines {
            appender.append(&self.format(line), line);
        }
        state.appender = Some(appender);
    }

    pub fn deactivate(&self) {
        self.state().appender = None;
    }

    /// Mirror every stored and future line into `path`.
    pub fn attach_file(&self, path: &Path) -> io::Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        let mut state = self.state();
        for line in &state.lines {
            file.write_all(self.format(line).as_bytes())?;
        }
        state.file = Some(file);
        Ok(())
    }

    /// Flush pending partial lines; later writes are dropped.
    pub fn close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        for stream in [LogStream::Stdout, LogStream::Stderr] {
            let rest = std::mem::take(&mut state.partial[stream.index()]);
            if !rest.is_empty() {
                let text = String::from_utf8_lossy(&rest).into_owned();
                self.record(&mut state, stream, text);
            }
        }
        if let Some(mut file) = state.file.take() {
            if let Err(e) = file.flush() {
                warn!(error = %e, "failed to flush task log file");
            }
        }
        state.closed = true;
    }

    pub fn dropped_lines(&self) -> usize {
        self.state().dropped
    }

    /// Stored lines, formatted and split per stream.
    pub fn logs(&self) -> TaskLogs {
        let state = self.state();
        let mut logs = TaskLogs::default();
        for line in &state.lines {
            let target = match line.stream {
                LogStream::Stdout => &mut logs.stdout,
                LogStream::Stderr => &mut logs.stderr,
            };
            target.push_str(&self.format(line));
        }
        logs.stdout.push_str(&String::from_utf8_lossy(&state.partial[0]));
        logs.stderr.push_str(&String::from_utf8_lossy(&state.partial[1]));
        logs
    }
}

struct LoggerWriter {
    logger: TaskLogger,
    stream: LogStream,
}

impl Write for LoggerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.logger.push(self.stream, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
