//! Output capture for the stdout and stderr channels of a run.
//!
//! Each channel has exactly one sink per run. Everything a script writes,
//! whether through `print`, `print(..., file=...)` or a direct `write` on
//! the stream object, lands in that sink once.

/// Appended once when a channel exceeds its byte cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Captured text of one channel, up to a byte cap.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    text: String,
    truncated: bool,
    limit: usize,
}

impl CapturedOutput {
    /// Create a new captured output buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            truncated: false,
            limit,
        }
    }

    /// Appends text, cutting it at the cap on a character boundary.
    pub fn push_str(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if text.len() <= room {
            self.text.push_str(text);
            return;
        }
        let mut cut = room;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&text[..cut]);
        self.truncated = true;
    }

    /// The captured text, with the truncation marker if the cap was hit.
    pub fn contents(&self) -> String {
        let mut text = self.text.clone();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }

    /// Whether output was dropped because of the cap.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.text.clear();
        self.truncated = false;
    }

    /// Get the length of captured data.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Which channel a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

/// The two output channels of a run.
#[derive(Clone, Debug)]
pub struct SandboxIo {
    /// Captured stdout.
    pub stdout: CapturedOutput,
    /// Captured stderr.
    pub stderr: CapturedOutput,
}

impl SandboxIo {
    /// Create both channels with the same byte cap.
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: CapturedOutput::new(limit),
            stderr: CapturedOutput::new(limit),
        }
    }

    pub fn write(&mut self, channel: Channel, text: &str) {
        match channel {
            Channel::Stdout => self.stdout.push_str(text),
            Channel::Stderr => self.stderr.push_str(text),
        }
    }

    /// Get the captured stdout as a string.
    pub fn stdout_str(&self) -> String {
        self.stdout.contents()
    }

    /// Get the captured stderr as a string.
    pub fn stderr_str(&self) -> String {
        self.stderr.contents()
    }
}
