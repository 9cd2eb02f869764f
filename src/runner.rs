//! Subprocess execution with streamed, crash-safe output.
//!
//! Every non-blank stdout line of the child is appended to the output file and
//! flushed before the next one is read, so whatever a tool printed before a
//! timeout or crash is still on disk afterwards.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Exit code reported when a tool was killed for exceeding its time budget.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a tool could not be started or its output not written.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;
/// Default multiple of the stall window after which a tool is killed regardless
/// of output. Zero leaves tools that keep writing running indefinitely.
pub const DEFAULT_HARD_LIMIT_FACTOR: u32 = 0;

const PROGRESS_EVERY: u64 = 10;

/// Program plus argument vector. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build a command from a whitespace-separated template such as
    /// `"subfinder -d {domain} -silent"`.
    ///
    /// The template is split before placeholders are substituted, so a value
    /// containing spaces stays a single argument. Returns `None` for an empty
    /// template.
    pub fn from_template(template: &str, vars: &[(&str, &str)]) -> Option<Self> {
        let mut parts = template.split_whitespace().map(|token| {
            vars.iter().fold(token.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        });
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Processed-line counter of a running tool. Cloning shares the counter.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    lines: Arc<AtomicU64>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    fn tick(&self) -> u64 {
        self.lines.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Time budget of one tool invocation.
///
/// `idle` is the stall window: the tool is killed once no output line has
/// arrived for that long. `hard`, when set, bounds the whole run from the
/// moment of spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub idle: Duration,
    pub hard: Option<Duration>,
}

impl RunLimits {
    pub fn new(timeout: Duration) -> Self {
        Self::with_hard_limit_factor(timeout, DEFAULT_HARD_LIMIT_FACTOR)
    }

    pub fn with_hard_limit_factor(timeout: Duration, factor: u32) -> Self {
        Self {
            idle: timeout,
            hard: (factor > 0).then(|| timeout.saturating_mul(factor)),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    pub tool: String,
    pub exit_code: i32,
    pub lines: u64,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ToolRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command`, streaming its non-blank stdout lines into `output`.
///
/// Never fails: start-up problems, I/O errors and timeouts are all reported
/// through [`ToolRun::exit_code`].
pub async fn run_tool(
    tool: &str,
    command: &ToolCommand,
    output: &Path,
    limits: RunLimits,
) -> ToolRun {
    run_tool_with_progress(tool, command, output, limits, Progress::new()).await
}

/// Same as [`run_tool`] but ticks a caller-provided [`Progress`] counter.
pub async fn run_tool_with_progress(
    tool: &str,
    command: &ToolCommand,
    output: &Path,
    limits: RunLimits,
    progress: Progress,
) -> ToolRun {
    let start = Instant::now();
    let finish = |exit_code: i32, timed_out: bool, progress: &Progress| ToolRun {
        tool: tool.to_string(),
        exit_code,
        lines: progress.lines(),
        timed_out,
        elapsed: start.elapsed(),
    };

    info!(tool, command = %command, "starting tool");

    let mut sink = match open_sink(output).await {
        Ok(f) => f,
        Err(e) => {
            warn!(tool, path = %output.display(), error = %e, "cannot open tool output file");
            return finish(SPAWN_FAILURE_EXIT_CODE, false, &progress);
        }
    };

    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(tool, error = %e, "failed to start tool");
            return finish(SPAWN_FAILURE_EXIT_CODE, false, &progress);
        }
    };

    let Some(stdout) = child.stdout.take() else {
        terminate(&mut child).await;
        return finish(SPAWN_FAILURE_EXIT_CODE, false, &progress);
    };

    let hard_deadline = limits.hard.map(|hard| start + hard);
    let mut idle_deadline = start + limits.idle;
    let mut segments = BufReader::new(stdout).split(b'\n');
    let mut timed_out = false;

    loop {
        let deadline = earliest(idle_deadline, hard_deadline);
        tokio::select! {
            next = segments.next_segment() => match next {
                Ok(Some(raw)) => {
                    let text = String::from_utf8_lossy(&raw);
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = append_line(&mut sink, line).await {
                        warn!(tool, error = %e, "failed to write tool output");
                        terminate(&mut child).await;
                        return finish(SPAWN_FAILURE_EXIT_CODE, false, &progress);
                    }
                    let n = progress.tick();
                    idle_deadline = Instant::now() + limits.idle;
                    if n % PROGRESS_EVERY == 0 {
                        debug!(tool, lines = n, "tool progress");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(tool, error = %e, "error reading tool output");
                    break;
                }
            },
            _ = time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
        }
    }

    if !timed_out {
        // stdout closed; the child may still linger
        let deadline = earliest(idle_deadline, hard_deadline);
        match time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                let run = finish(status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE), false, &progress);
                info!(
                    tool,
                    exit_code = run.exit_code,
                    lines = run.lines,
                    elapsed_ms = run.elapsed.as_millis() as u64,
                    "tool completed"
                );
                return run;
            }
            Ok(Err(e)) => {
                warn!(tool, error = %e, "failed to wait for tool");
                return finish(SPAWN_FAILURE_EXIT_CODE, false, &progress);
            }
            Err(_) => {}
        }
    }

    terminate(&mut child).await;
    let run = finish(TIMEOUT_EXIT_CODE, true, &progress);
    warn!(
        tool,
        lines = run.lines,
        elapsed_ms = run.elapsed.as_millis() as u64,
        "tool timed out and was killed; partial output kept"
    );
    run
}

fn earliest(idle: Instant, hard: Option<Instant>) -> Instant {
    hard.map_or(idle, |hard| idle.min(hard))
}

async fn open_sink(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
}

async fn append_line(sink: &mut File, line: &str) -> std::io::Result<()> {
    sink.write_all(line.as_bytes()).await?;
    sink.write_all(b"\n").await?;
    sink.flush().await
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill failed; child already gone");
    }
}
