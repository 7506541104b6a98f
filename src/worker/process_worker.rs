//! One inference child process and its prompt/response exchange.
//!
//! The child gets two pipes: one for stdin, one shared by stdout and stderr.
//! A prompt is the text plus a newline; the response is everything the child
//! prints until a stop marker shows up or the pipe closes.

use std::io::{self, PipeReader, PipeWriter, Write};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};

use super::args::{build_args, display_command};
use super::markers::{MarkerMatcher, StopMarker};
use super::reader::{spawn_reader, ReadEvent};
use crate::config::WorkerConfig;
use crate::error::{LaunchError, WorkerError};

/// How often a waiting prompt re-checks its deadline and cancel flag.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared reference to a worker, for callers that fan prompts out across
/// threads. The mutex is what keeps calls on one worker sequential.
pub type SharedWorker = Arc<Mutex<ProcessWorker>>;

/// Set to `true` to abandon an in-flight prompt.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Child launched, reader not yet attached.
    Starting,
    Ready,
    /// A prompt exchange is running.
    Busy,
    /// Terminal. Handles released, child terminated.
    Closed,
}

/// Why a prompt exchange stopped reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Sentinel(StopMarker),
    /// End of stream or broken pipe.
    ChildExited,
    TimedOut,
    Cancelled,
    ReadFailed(String),
}

/// Text gathered by one exchange, with the reason it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutput {
    /// Everything read before the stop marker. The marker itself and
    /// anything after it are not included.
    pub text: String,
    pub termination: Termination,
}

impl PromptOutput {
    /// `true` when the child signalled the end of its answer.
    pub fn is_complete(&self) -> bool {
        matches!(self.termination, Termination::Sentinel(_))
    }
}

/// Per-call knobs for [`ProcessWorker::prompt_with`].
#[derive(Default)]
pub struct PromptOptions<'a> {
    sink: Option<&'a mut dyn Write>,
    timeout: Option<Duration>,
    cancel: Option<CancelFlag>,
}

impl<'a> PromptOptions<'a> {
    /// Forward output to `sink` as it arrives.
    pub fn stream_to(mut self, sink: &'a mut dyn Write) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Overrides `WorkerConfig::prompt_timeout_ms` for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// Owns one child process, its stdin pipe and the reader of its output.
#[derive(Debug)]
pub struct ProcessWorker {
    config: WorkerConfig,
    state: WorkerState,
    pid: u32,
    child: Option<Child>,
    stdin: Option<PipeWriter>,
    events: Option<Receiver<ReadEvent>>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessWorker {
    /// Launch the child and bind its pipes.
    ///
    /// Nothing leaks on failure: pipe ends are dropped with the error, and a
    /// child that was already running is killed and reaped.
    pub fn spawn(config: WorkerConfig) -> Result<Self, LaunchError> {
        check_executable(&config)?;

        let (child_stdin, parent_stdin) = io::pipe().map_err(|source| LaunchError::Pipe {
            which: "stdin",
            source,
        })?;
        let (parent_stdout, child_stdout) = io::pipe().map_err(|source| LaunchError::Pipe {
            which: "stdout",
            source,
        })?;
        let child_stderr = child_stdout
            .try_clone()
            .map_err(|source| LaunchError::Pipe {
                which: "stderr",
                source,
            })?;

        info!("[PROCESS_WORKER] Spawning: {}", display_command(&config));
        let child = launch(&config, child_stdin, child_stdout, child_stderr)?;
        let pid = child.id();

        // From here on, dropping `worker` tears the child down.
        let mut worker = Self {
            config,
            state: WorkerState::Starting,
            pid,
            child: Some(child),
            stdin: Some(parent_stdin),
            events: None,
            reader: None,
        };

        let (events, reader) =
            spawn_reader(parent_stdout, pid.to_string()).map_err(LaunchError::ReaderThread)?;
        worker.events = Some(events);
        worker.reader = Some(reader);
        worker.state = WorkerState::Ready;

        info!("[PROCESS_WORKER] Worker ready (pid={pid})");
        Ok(worker)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Non-blocking check whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Send `text` and return the reply, echoing it to stdout when
    /// `stream_output` is set.
    ///
    /// Blocks until a stop marker or end of stream, or until the configured
    /// prompt timeout. The text gathered so far is returned in every case;
    /// use [`prompt_with`](Self::prompt_with) to learn why reading stopped.
    pub fn prompt(&mut self, text: &str, stream_output: bool) -> Result<String, WorkerError> {
        let mut stdout = io::stdout();
        let options = if stream_output {
            PromptOptions::default().stream_to(&mut stdout)
        } else {
            PromptOptions::default()
        };
        self.prompt_with(text, options).map(|output| output.text)
    }

    /// Send `text` and collect the reply, honouring the sink, deadline and
    /// cancel flag in `options`.
    ///
    /// Errors only when the prompt could not be delivered. Anything that
    /// goes wrong while reading ends the exchange and is reported through
    /// [`PromptOutput::termination`].
    pub fn prompt_with(
        &mut self,
        text: &str,
        mut options: PromptOptions<'_>,
    ) -> Result<PromptOutput, WorkerError> {
        if self.state == WorkerState::Closed {
            return Err(WorkerError::Closed);
        }
        let deadline = options
            .timeout
            .or_else(|| self.config.prompt_timeout())
            .map(|t| Instant::now() + t);

        self.discard_stale_output();
        self.state = WorkerState::Busy;

        if let Err(e) = self.send_line(text) {
            warn!("[PROCESS_WORKER] pid={}: {e}", self.pid);
            self.state = WorkerState::Ready;
            return Err(e);
        }

        let output = self.read_response(deadline, options.sink.take(), options.cancel.as_ref());
        self.state = WorkerState::Ready;

        debug!(
            "[PROCESS_WORKER] pid={}: exchange ended with {:?} ({} bytes)",
            self.pid,
            output.termination,
            output.text.len()
        );
        Ok(output)
    }

    /// Read the start-up banner up to the child's first prompt.
    ///
    /// `llama-cli` prints model loading logs before it accepts input. Call
    /// this once after [`spawn`](Self::spawn) so that the banner does not
    /// end up in the first reply.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<PromptOutput, WorkerError> {
        if self.state == WorkerState::Closed {
            return Err(WorkerError::Closed);
        }
        self.state = WorkerState::Busy;
        let output = self.read_response(Some(Instant::now() + timeout), None, None);
        self.state = WorkerState::Ready;
        Ok(output)
    }

    /// Release the pipes and terminate the child. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == WorkerState::Closed {
            return;
        }
        self.state = WorkerState::Closed;

        // Closing stdin first gives the child a chance to see EOF.
        drop(self.stdin.take());

        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("[PROCESS_WORKER] pid={} already exited: {status}", self.pid);
                }
                _ => {
                    if let Err(e) = child.kill() {
                        debug!("[PROCESS_WORKER] pid={} kill: {e}", self.pid);
                    }
                }
            }
            if let Err(e) = child.wait() {
                warn!("[PROCESS_WORKER] pid={} wait failed: {e}", self.pid);
            }
        }

        // The reader sees EOF once the child is gone.
        self.events = None;
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("[PROCESS_WORKER] pid={} reader thread panicked", self.pid);
            }
        }

        info!("[PROCESS_WORKER] Worker closed (pid={})", self.pid);
    }

    fn send_line(&mut self, text: &str) -> Result<(), WorkerError> {
        let stdin = self.stdin.as_mut().ok_or(WorkerError::Closed)?;
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(WorkerError::Write)
    }

    /// Drop output that arrived after the previous exchange ended, such as
    /// the tail following a stop marker or the rest of a timed-out reply.
    fn discard_stale_output(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let mut discarded = 0usize;
        let mut reader_done = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ReadEvent::Chunk(bytes) => discarded += bytes.len(),
                ReadEvent::Closed | ReadEvent::Failed(_) => {
                    reader_done = true;
                    break;
                }
            }
        }
        if reader_done {
            // Nothing more will arrive; later reads report the child as gone.
            self.events = None;
        }
        if discarded > 0 {
            debug!("[PROCESS_WORKER] pid={}: discarded {discarded} stale bytes", self.pid);
        }
    }

    fn read_response(
        &mut self,
        deadline: Option<Instant>,
        sink: Option<&mut dyn Write>,
        cancel: Option<&CancelFlag>,
    ) -> PromptOutput {
        let mut matcher = MarkerMatcher::new(&self.config.stop_markers);
        let mut forwarder = Forwarder::new(sink);
        let mut buffer: Vec<u8> = Vec::new();

        let termination = match self.events.as_ref() {
            None => Termination::ChildExited,
            Some(events) => loop {
                if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                    break Termination::Cancelled;
                }
                let wait = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break Termination::TimedOut;
                        }
                        (deadline - now).min(POLL_INTERVAL)
                    }
                    None => POLL_INTERVAL,
                };

                match events.recv_timeout(wait) {
                    Ok(ReadEvent::Chunk(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        if let Some(found) = matcher.scan(&buffer) {
                            buffer.truncate(found.position);
                            break Termination::Sentinel(found.marker);
                        }
                        forwarder.forward(&buffer, matcher.safe_len(buffer.len()));
                    }
                    Ok(ReadEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                        break Termination::ChildExited;
                    }
                    Ok(ReadEvent::Failed(e)) => break Termination::ReadFailed(e.to_string()),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            },
        };

        match &termination {
            Termination::ChildExited => self.events = None,
            Termination::ReadFailed(e) => {
                // The reader thread is gone; nothing will read this child again.
                warn!(
                    "[PROCESS_WORKER] pid={}: output unreadable, worker degraded: {e}",
                    self.pid
                );
                self.events = None;
            }
            _ => {}
        }
        forwarder.finish(&buffer);

        PromptOutput {
            text: String::from_utf8_lossy(&buffer).into_owned(),
            termination,
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pushes the not-yet-forwarded part of the buffer to the sink.
///
/// Bytes go through the same lossy UTF-8 decode as the returned text, and a
/// character split across reads is held back until it is complete, so the
/// sink receives exactly the bytes of [`PromptOutput::text`].
struct Forwarder<'a> {
    sink: Option<&'a mut dyn Write>,
    sent: usize,
}

impl<'a> Forwarder<'a> {
    fn new(sink: Option<&'a mut dyn Write>) -> Self {
        Self { sink, sent: 0 }
    }

    /// Forward up to `upto`, minus any incomplete trailing character.
    fn forward(&mut self, buffer: &[u8], upto: usize) {
        if upto <= self.sent {
            return;
        }
        let end = self.sent + complete_prefix_len(&buffer[self.sent..upto]);
        self.write_upto(buffer, end);
    }

    /// Forward everything left, decoding a dangling partial character as
    /// U+FFFD the way the returned text does.
    fn finish(&mut self, buffer: &[u8]) {
        self.write_upto(buffer, buffer.len());
    }

    fn write_upto(&mut self, buffer: &[u8], end: usize) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if end <= self.sent {
            return;
        }
        let text = String::from_utf8_lossy(&buffer[self.sent..end]);
        let result = sink
            .write_all(text.as_bytes())
            .and_then(|()| sink.flush());
        match result {
            Ok(()) => self.sent = end,
            Err(e) => {
                warn!("[PROCESS_WORKER] Output sink failed, streaming disabled: {e}");
                self.sink = None;
            }
        }
    }
}

/// Length of `bytes` without a trailing UTF-8 sequence that more input could
/// still complete.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A sequence is at most four bytes, so its lead byte is among the last four.
    let lead = (len.saturating_sub(4)..len)
        .rev()
        .find(|&i| bytes[i] & 0b1100_0000 != 0b1000_0000);
    match lead {
        Some(i) => match std::str::from_utf8(&bytes[i..]) {
            Err(e) if e.valid_up_to() == 0 && e.error_len().is_none() => i,
            _ => len,
        },
        None => len,
    }
}

/// Catch an obviously wrong path before creating any pipes. Bare program
/// names are left for the OS to resolve through `PATH`.
fn check_executable(config: &WorkerConfig) -> Result<(), LaunchError> {
    let exe = &config.executable;
    let has_dir = exe.parent().is_some_and(|p| !p.as_os_str().is_empty());
    if has_dir && !exe.exists() {
        return Err(LaunchError::MissingExecutable(exe.clone()));
    }
    Ok(())
}

/// Start the child with the given pipe ends. The `Command`, and with it the
/// parent's copies of the child-side ends, is dropped before returning.
fn launch(
    config: &WorkerConfig,
    stdin: PipeReader,
    stdout: PipeWriter,
    stderr: PipeWriter,
) -> Result<Child, LaunchError> {
    let mut command = Command::new(&config.executable);
    command
        .args(build_args(config))
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    command.spawn().map_err(|source| LaunchError::Spawn {
        program: config.executable.display().to_string(),
        source,
    })
}
