use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::env::ProcessEnv;
use crate::error::{HarnessError, HarnessResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Bound on draining the pipes once the process has exited; a grandchild may hold them open.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Origin stream for captured log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Single captured log line with its source.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// How the child's stdin is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinMode {
    /// Connect stdin to the null device.
    #[default]
    Null,
    /// Keep a pipe open until the process is terminated; an IOC shell exits on EOF.
    KeepOpen,
}

/// Everything needed to launch one external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Short name used in logs and errors (`simulator`, `controller`, `caget`).
    pub label: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: ProcessEnv,
    pub working_directory: Option<PathBuf>,
    pub stdin: StdinMode,
}

impl ProcessSpec {
    /// Spec with no arguments, an empty environment overlay and null stdin.
    pub fn new(label: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: ProcessEnv::default(),
            working_directory: None,
            stdin: StdinMode::Null,
        }
    }

    /// Append one argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments in order.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Variables set on top of the inherited environment.
    pub fn with_env(mut self, env: ProcessEnv) -> Self {
        self.env = env;
        self
    }

    /// Directory the process starts in.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// How stdin is wired, see [`StdinMode`].
    pub fn with_stdin(mut self, stdin: StdinMode) -> Self {
        self.stdin = stdin;
        self
    }
}

/// Liveness of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitStatus),
}

/// How to ask a process to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Close stdin and send `SIGTERM`.
    Graceful,
    /// Kill outright.
    Forced,
}

/// Stdout and stderr of a process that has exited.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapturedOutput {
    /// Exit code, absent when the process died from a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => writeln!(f, "exit code: {code}")?,
            None => writeln!(f, "terminated by signal")?,
        }
        if !self.stdout.is_empty() {
            writeln!(f, "--- stdout ---")?;
            writeln!(f, "{}", self.stdout.trim_end())?;
        }
        if !self.stderr.is_empty() {
            writeln!(f, "--- stderr ---")?;
            writeln!(f, "{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

/// One launched external process, exclusively owned by whoever launched it.
pub struct ProcessHandle {
    spec: ProcessSpec,
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    state: ProcessState,
    log_buffer: Arc<Mutex<Vec<LogLine>>>,
    readers: Vec<thread::JoinHandle<()>>,
    /// Disconnects once every reader thread has hit end of stream.
    readers_done: mpsc::Receiver<()>,
}

impl ProcessHandle {
    /// Start the process without waiting for it to become ready.
    pub fn launch(spec: ProcessSpec) -> HarnessResult<Self> {
        if has_directory_part(&spec.executable) && !spec.executable.exists() {
            return Err(HarnessError::launch(
                &spec.label,
                format!("executable {} does not exist", spec.executable.display()),
            ));
        }

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args);
        cmd.envs(spec.env.iter());
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(match spec.stdin {
            StdinMode::Null => Stdio::null(),
            StdinMode::KeepOpen => Stdio::piped(),
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            HarnessError::launch(
                &spec.label,
                format!("{}: {err}", spec.executable.display()),
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::launch(&spec.label, "failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::launch(&spec.label, "failed to capture stderr"))?;

        let log_buffer = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, readers_done) = mpsc::channel();
        let readers = vec![
            spawn_log_reader(stdout, LogStream::Stdout, log_buffer.clone(), done_tx.clone()),
            spawn_log_reader(stderr, LogStream::Stderr, log_buffer.clone(), done_tx),
        ];

        let pid = child.id();
        let stdin = child.stdin.take();
        info!(process = %spec.label, pid, executable = %spec.executable.display(), "launched");

        Ok(Self {
            spec,
            child,
            pid,
            stdin,
            state: ProcessState::Running,
            log_buffer,
            readers,
            readers_done,
        })
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Last observed state; call [`ProcessHandle::is_running`] to refresh it.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Query liveness without blocking.
    pub fn is_running(&mut self) -> bool {
        if let ProcessState::Exited(_) = self.state {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.mark_exited(status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(process = %self.spec.label, error = %err, "liveness query failed");
                true
            }
        }
    }

    /// Request termination and wait up to `timeout` for the process to exit.
    pub fn terminate(&mut self, mode: Termination, timeout: Duration) -> HarnessResult<()> {
        if !self.is_running() {
            return Err(HarnessError::AlreadyStopped(self.spec.label.clone()));
        }

        debug!(process = %self.spec.label, pid = self.pid, ?mode, "terminating");
        match mode {
            Termination::Graceful => {
                self.stdin.take();
                self.signal_terminate()?;
            }
            Termination::Forced => {
                if let Err(err) = self.child.kill() {
                    // InvalidInput means the child was already reaped.
                    if err.kind() != io::ErrorKind::InvalidInput {
                        return Err(err.into());
                    }
                }
            }
        }

        match self.wait_timeout(timeout)? {
            Some(_) => Ok(()),
            None => Err(HarnessError::ShutdownTimeout {
                process: self.spec.label.clone(),
                timeout,
            }),
        }
    }

    /// Graceful termination first, forced kill once `grace` elapses.
    pub fn stop(&mut self, grace: Duration, timeout: Duration) -> HarnessResult<()> {
        match self.terminate(Termination::Graceful, grace) {
            Ok(()) => Ok(()),
            Err(HarnessError::ShutdownTimeout { .. }) => {
                warn!(process = %self.spec.label, ?grace, "graceful shutdown timed out, killing");
                match self.terminate(Termination::Forced, timeout) {
                    Err(HarnessError::AlreadyStopped(_)) => Ok(()),
                    other => other,
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> HarnessResult<Option<ExitStatus>> {
        if let ProcessState::Exited(status) = self.state {
            return Ok(Some(status));
        }
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.mark_exited(status);
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Collected stdout and stderr; only available once the process has exited.
    ///
    /// Output still held open by a surviving grandchild is cut off after a short drain.
    pub fn capture_output(&mut self) -> HarnessResult<CapturedOutput> {
        if self.is_running() {
            return Err(HarnessError::NotExited(self.spec.label.clone()));
        }
        self.join_readers();

        let exit_code = match self.state {
            ProcessState::Exited(status) => status.code(),
            ProcessState::Running => None,
        };
        let mut output = CapturedOutput {
            exit_code,
            ..CapturedOutput::default()
        };
        for line in self.logs() {
            let target = match line.stream {
                LogStream::Stdout => &mut output.stdout,
                LogStream::Stderr => &mut output.stderr,
            };
            target.push_str(&line.line);
            target.push('\n');
        }
        Ok(output)
    }

    /// Snapshot of every line captured so far, across both streams.
    pub fn logs(&self) -> Vec<LogLine> {
        self.log_buffer
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.state = ProcessState::Exited(status);
        self.stdin.take();
        info!(process = %self.spec.label, pid = self.pid, %status, "exited");
    }

    fn join_readers(&mut self) {
        if self.readers.is_empty() {
            return;
        }
        match self.readers_done.recv_timeout(READER_DRAIN) {
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                for handle in self.readers.drain(..) {
                    let _ = handle.join();
                }
            }
            _ => {
                warn!(
                    process = %self.spec.label,
                    pid = self.pid,
                    "output pipes still open after exit, detaching readers"
                );
                self.readers.clear();
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) -> HarnessResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(self.pid)
            .map_err(|_| HarnessError::precondition(format!("pid {} out of range", self.pid)))?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno).into()),
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) -> HarnessResult<()> {
        self.child.kill().map_err(Into::into)
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.spec.label)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(process = %self.spec.label, pid = self.pid, "dropped while running, killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn has_directory_part(path: &Path) -> bool {
    path.components().count() > 1
}

fn spawn_log_reader<R: io::Read + Send + 'static>(
    reader: R,
    stream: LogStream,
    buffer: Arc<Mutex<Vec<LogLine>>>,
    done: mpsc::Sender<()>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let buf_reader = BufReader::new(reader);
        // `lines` strips the terminator; anything else is part of the value.
        for line in buf_reader.lines().map_while(Result::ok) {
            if let Ok(mut guard) = buffer.lock() {
                guard.push(LogLine { stream, line });
            }
        }
        drop(done);
    })
}
