//! Frame capture coordinator.
//!
//! After user code finishes, a run may grab one frame from the virtual
//! display: wait for the grace period so the scene can render, invoke the
//! external frame-grab tool against a scratch file, and base64-encode what
//! it wrote. Capture is best effort. Every failure yields a `None` payload
//! plus diagnostic lines, never an error, and the scratch directory is
//! removed on every path.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::sandbox::config::CaptureConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const LOG_PREFIX: &str = "[capture]";

/// Result of one capture attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureOutcome {
    /// Base64 of the grabbed image, `None` when anything went wrong.
    pub payload: Option<String>,
    /// One line per step, surfaced in the run's stdout.
    pub log: Vec<String>,
}

impl CaptureOutcome {
    pub fn is_success(&self) -> bool {
        self.payload.is_some()
    }

    /// Diagnostic lines joined with trailing newlines.
    pub fn log_text(&self) -> String {
        self.log.iter().map(|line| format!("{line}\n")).collect()
    }
}

#[derive(Default)]
struct CaptureLog {
    lines: Vec<String>,
}

impl CaptureLog {
    fn step(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "script_sandbox::capture", "{message}");
        self.lines.push(format!("{LOG_PREFIX} {message}"));
    }

    fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "script_sandbox::capture", "{message}");
        self.lines.push(format!("{LOG_PREFIX} ERROR: {message}"));
    }
}

enum ToolFailure {
    NotInstalled,
    TimedOut,
    Io(std::io::Error),
}

struct ToolOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stream.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle.and_then(|h| h.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Runs the tool, killing it once `timeout` elapses.
fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<ToolOutput, ToolFailure> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolFailure::NotInstalled,
            _ => ToolFailure::Io(e),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let started = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(ToolOutput {
                    status,
                    stdout: collect(stdout),
                    stderr: collect(stderr),
                })
            }
            Ok(None) if started.elapsed() >= timeout => {
                kill(&mut child);
                return Err(ToolFailure::TimedOut);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill(&mut child);
                return Err(ToolFailure::Io(e));
            }
        }
    }
}

fn grab(config: &CaptureConfig, path: &Path, log: &mut CaptureLog) -> Option<String> {
    let target = path.display().to_string();
    let args = config.args(&target);
    log.step(format!("Running command: {} {}", config.program, args.join(" ")));

    let output = match run_tool(&config.program, &args, config.timeout) {
        Ok(output) => output,
        Err(ToolFailure::NotInstalled) => {
            log.error(format!("Command not found: {}", config.program));
            log.step(format!(
                "Make sure the frame-grab tool '{}' is installed",
                config.program
            ));
            return None;
        }
        Err(ToolFailure::TimedOut) => {
            log.error(format!("Frame capture timed out after {:?}", config.timeout));
            return None;
        }
        Err(ToolFailure::Io(e)) => {
            log.error(format!("Unexpected error running capture tool: {e}"));
            return None;
        }
    };

    let or_none = |text: &str, what: &str| {
        if text.is_empty() {
            format!("No {what}")
        } else {
            text.to_string()
        }
    };
    if !output.status.success() {
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        log.error(format!("Frame capture failed with exit code {code}"));
        log.step(format!("stdout: {}", or_none(&output.stdout, "stdout")));
        log.step(format!("stderr: {}", or_none(&output.stderr, "stderr")));
        return None;
    }
    log.step("Command completed successfully");
    if !output.stdout.is_empty() {
        log.step(format!("stdout: {}", output.stdout));
    }
    if !output.stderr.is_empty() {
        log.step(format!("stderr: {}", output.stderr));
    }

    if !path.exists() {
        log.error("Frame file was not created");
        return None;
    }
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log.error(format!("Could not read frame file: {e}"));
            return None;
        }
    };
    log.step(format!("Frame file size: {} bytes", bytes.len()));
    if bytes.is_empty() {
        log.error("Frame file is empty");
        return None;
    }

    let encoded = STANDARD.encode(&bytes);
    log.step(format!(
        "Frame captured: {} bytes image, {} bytes base64",
        bytes.len(),
        encoded.len()
    ));
    Some(encoded)
}

/// Grabs one frame without waiting for the grace period.
pub fn attempt_capture(config: &CaptureConfig) -> CaptureOutcome {
    let mut log = CaptureLog::default();
    log.step(format!("Starting frame capture for display {}", config.display));

    if !config.enabled {
        log.error("Frame capture is disabled in this sandbox");
        return CaptureOutcome {
            payload: None,
            log: log.lines,
        };
    }

    let dir = match tempfile::Builder::new().prefix("frame-capture-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            log.error(format!("Could not create scratch directory: {e}"));
            return CaptureOutcome {
                payload: None,
                log: log.lines,
            };
        }
    };
    let path = dir.path().join("frame.png");
    log.step(format!("Scratch file: {}", path.display()));

    let payload = grab(config, &path, &mut log);

    let dir_path = dir.path().display().to_string();
    match dir.close() {
        Ok(()) => log.step(format!("Cleaned up scratch directory: {dir_path}")),
        Err(e) => log.step(format!("WARNING: Failed to clean up {dir_path}: {e}")),
    }

    CaptureOutcome {
        payload,
        log: log.lines,
    }
}

/// The deferred capture step appended to a run: waits for `grace_period`
/// so the display can finish rendering, then grabs a frame.
pub fn capture_after_grace(config: &CaptureConfig, grace_period: Duration) -> CaptureOutcome {
    let mut outcome = CaptureOutcome::default();
    outcome.log.push(format!(
        "{LOG_PREFIX} Waiting {:.3}s for rendering",
        grace_period.as_secs_f64()
    ));
    debug!(target: "script_sandbox::capture", grace_ms = grace_period.as_millis() as u64, "waiting before frame capture");
    thread::sleep(grace_period);
    let grabbed = attempt_capture(config);
    outcome.log.extend(grabbed.log);
    outcome.payload = grabbed.payload;
    match &outcome.payload {
        Some(payload) => outcome
            .log
            .push(format!("[Frame captured: {} bytes base64]", payload.len())),
        None => outcome.log.push("[Frame capture failed]".to_string()),
    }
    outcome
}
