//! External command execution.
//!
//! Every long-running tool the build drives (debootstrap, apt-get, dpkg,
//! mksquashfs, grub-mkrescue, the kernel build) goes through [`CommandRunner`].
//! The system implementation streams output through pump threads so that a
//! command is never subject to a wall-clock timeout: "hung" is only ever a
//! suspicion raised when no output and no I/O activity were observed for the
//! configured idle window, and it is reported, not acted upon.
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_forge::process::{CommandRunner, CommandSpec, SystemRunner};
//! use std::time::Duration;
//!
//! let runner = SystemRunner::new(Duration::from_secs(1800));
//! let output = runner.run(&CommandSpec::new("mksquashfs").args(["root", "fs.squashfs"]))?;
//! assert!(output.success());
//! ```

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often the runner wakes up to check the child and the idle window.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bytes of trailing output kept in memory per stream.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// How long to keep draining pipes after the child exited. Grandchildren
/// (daemons started by maintainer scripts) may hold the pipes open forever.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Mark the process as interrupted. No new context commands start afterwards.
pub fn mark_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Whether an operator interrupt was received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mounting {what} at '{target}' failed: {reason}")]
    Mount {
        what: String,
        target: PathBuf,
        reason: String,
    },

    #[error("unmounting '{target}' failed: {reason}")]
    Unmount { target: PathBuf, reason: String },

    #[error("build interrupted; refusing to start '{program}'")]
    Interrupted { program: String },
}

/// A command to run, built in the same chained style as the rest of the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Short name used in progress logging (defaults to the program name).
    pub label: String,
    /// File that receives a copy of every output line.
    pub log_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            log_path: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn log_to(mut self, path: &Path) -> Self {
        self.log_path = Some(path.to_path_buf());
        self
    }

    /// Program and arguments as one shell-like string, for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        text.push_str(self.stdout.trim_end());
        if !self.stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(self.stderr.trim_end());
        }
        text
    }
}

/// Runs external commands. Fakes implement this in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Runs commands on the host with progress-based hang detection.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    idle_window: Duration,
}

impl SystemRunner {
    pub fn new(idle_window: Duration) -> Self {
        Self { idle_window }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        run_observed(command, self.idle_window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Run a command to completion, however long it takes.
///
/// Output is streamed line by line; each line counts as progress. On Linux the
/// child's `/proc/<pid>/io` counters count as progress too, so a compressor
/// that writes without printing is not reported as stuck.
pub fn run_observed(spec: &CommandSpec, idle_window: Duration) -> Result<CommandOutput, ExecError> {
    if interrupted() {
        return Err(ExecError::Interrupted {
            program: spec.program.clone(),
        });
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    tracing::debug!(command = %spec.display_line(), "spawning");
    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    if let Some(stdout) = child.stdout.take() {
        spawn_pump(stdout, Stream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_pump(stderr, Stream::Stderr, tx.clone());
    }
    drop(tx);

    let mut log = match &spec.log_path {
        Some(path) => Some(open_log(path).map_err(|source| ExecError::Io {
            program: spec.program.clone(),
            source,
        })?),
        None => None,
    };

    let mut stdout = TailBuffer::new(MAX_CAPTURE_BYTES);
    let mut stderr = TailBuffer::new(MAX_CAPTURE_BYTES);
    let mut watch = ProgressWatch::new(idle_window, child.id());
    let io_err = |source| ExecError::Io {
        program: spec.program.clone(),
        source,
    };

    let status = loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((stream, line)) => {
                watch.saw_output();
                record_line(stream, line, &mut stdout, &mut stderr, log.as_mut());
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break child.wait().map_err(io_err)?,
        }

        if let Some(status) = child.try_wait().map_err(io_err)? {
            let deadline = Instant::now() + DRAIN_GRACE;
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                match rx.recv_timeout(left) {
                    Ok((stream, line)) => {
                        record_line(stream, line, &mut stdout, &mut stderr, log.as_mut())
                    }
                    Err(_) => break,
                }
            }
            break status;
        }

        watch.check(&spec.label);
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: stdout.into_string(),
        stderr: stderr.into_string(),
    })
}

fn spawn_pump<R: Read + Send + 'static>(pipe: R, stream: Stream, tx: Sender<(Stream, String)>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn record_line(
    stream: Stream,
    line: String,
    stdout: &mut TailBuffer,
    stderr: &mut TailBuffer,
    log: Option<&mut File>,
) {
    if let Some(file) = log {
        // Logging is best-effort; the capture buffers still hold the tail.
        let _ = file.write_all(line.as_bytes());
    }
    match stream {
        Stream::Stdout => stdout.push(line),
        Stream::Stderr => stderr.push(line),
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Keeps the last `limit` bytes of output, in whole lines.
struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
            }
        }
    }

    fn into_string(self) -> String {
        self.lines.into_iter().collect()
    }
}

/// Tracks the last time a command showed signs of life.
struct ProgressWatch {
    idle_window: Duration,
    pid: u32,
    last_activity: Instant,
    last_io: Option<u64>,
    warned_at: Option<Instant>,
}

impl ProgressWatch {
    fn new(idle_window: Duration, pid: u32) -> Self {
        Self {
            idle_window,
            pid,
            last_activity: Instant::now(),
            last_io: None,
            warned_at: None,
        }
    }

    fn saw_output(&mut self) {
        self.last_activity = Instant::now();
        self.warned_at = None;
    }

    fn check(&mut self, label: &str) {
        if let Some(io) = read_proc_io(self.pid) {
            if self.last_io != Some(io) {
                self.last_io = Some(io);
                self.saw_output();
            }
        }

        let idle = self.last_activity.elapsed();
        if idle < self.idle_window {
            return;
        }
        let due = self
            .warned_at
            .map_or(true, |at| at.elapsed() >= self.idle_window);
        if due {
            tracing::warn!(
                event = "no_progress",
                command = label,
                idle_secs = idle.as_secs(),
                "no output or I/O activity observed; operator attention needed (command left running)"
            );
            self.warned_at = Some(Instant::now());
        }
    }
}

/// Sum of `rchar` and `wchar` from `/proc/<pid>/io`.
fn read_proc_io(pid: u32) -> Option<u64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/io")).ok()?;
    parse_proc_io(&content)
}

fn parse_proc_io(content: &str) -> Option<u64> {
    let mut total = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key == "rchar" || key == "wchar" {
            let value: u64 = value.trim().parse().ok()?;
            total = Some(total.unwrap_or(0) + value);
        }
    }
    total
}
