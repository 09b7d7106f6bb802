//! Session controller: the lifecycle around one namespace and one backend.
//!
//! ```text
//! uninitialized --create()--> ready --submit()--> ready
//!       ^                       |
//!       +------teardown()-------+        reset() = teardown() + create()
//! ```
//!
//! Script values live on the namespace's interpreter thread, so a `Session`
//! itself is `Send` and only needs `&mut` access to submit.
//! [`SessionManager`](crate::sandbox::manager::SessionManager) gives each
//! session a worker thread for async callers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::{BackendKind, SandboxConfig};
use crate::sandbox::context::RunSettings;
use crate::sandbox::executor::{Backend, ErrorKind, ExecResult, ExecutorBackend};
use crate::sandbox::namespace::Namespace;
use crate::sandbox::policy::ImportPolicy;
use crate::sandbox::registry::{global_registry, ModuleRegistry};

/// One code submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Source text to run.
    pub code: String,
    /// Grab a frame of the display after the code finishes.
    #[serde(default, alias = "capture_screenshot")]
    pub capture_frame: bool,
    /// Overrides the configured wait before the grab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_ms: Option<u64>,
}

impl Submission {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            capture_frame: false,
            grace_period_ms: None,
        }
    }

    /// Request a frame capture after the code runs.
    pub fn with_capture(mut self) -> Self {
        self.capture_frame = true;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = Some(grace.as_millis() as u64);
        self
    }

    /// Decodes a JSON submission. Anything that is not an object with a
    /// string `code` is refused before it reaches a backend.
    pub fn from_json(json: &str) -> Result<Self> {
        let submission: Submission = serde_json::from_str(json)
            .map_err(|e| SandboxError::InvalidSubmission(e.to_string()))?;
        Ok(submission)
    }

    fn requested_grace(&self) -> Option<Duration> {
        self.grace_period_ms.map(Duration::from_millis)
    }
}

/// Extra fields reported with an observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationMetadata {
    /// Source of the submission that produced the observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_code: Option<String>,
}

/// What a caller sees after `create`, `reset` or `submit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Base64 PNG, present only when a capture was requested and succeeded.
    pub frame: Option<String>,
    #[serde(default)]
    pub metadata: ObservationMetadata,
    #[serde(skip)]
    pub error: Option<ErrorKind>,
}

impl Observation {
    /// The observation of a fresh session: no output, exit code 0.
    pub fn initial() -> Self {
        Self::default()
    }

    fn from_result(result: ExecResult, frame: Option<String>, code: String) -> Self {
        Self {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            frame,
            metadata: ObservationMetadata {
                last_code: Some(code),
            },
            error: result.error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Bookkeeping of the current episode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Fresh uuid v4 on every `create`/`reset`; `None` before the first.
    pub episode_id: Option<String>,
    pub step_count: u64,
    pub last_exit_code: i32,
}

struct Active {
    namespace: Namespace,
    backend: Backend,
}

pub struct Session {
    settings: RunSettings,
    active: Option<Active>,
    state: SessionState,
}

impl Session {
    /// A session over the process-wide module registry.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_registry(config, Arc::clone(global_registry()))
    }

    /// A session resolving third-party imports from `registry`.
    pub fn with_registry(config: SandboxConfig, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            settings: RunSettings::new(config, registry),
            active: None,
            state: SessionState::default(),
        }
    }

    /// Shorthand for `new` followed by `create`.
    pub fn start(config: SandboxConfig) -> Self {
        let mut session = Self::new(config);
        session.create();
        session
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.settings.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.settings.config.backend
    }

    pub fn policy(&self) -> &ImportPolicy {
        &self.settings.policy
    }

    pub fn is_ready(&self) -> bool {
        self.active.is_some()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The live namespace, if the session is ready.
    pub fn namespace(&self) -> Option<&Namespace> {
        self.active.as_ref().map(|active| &active.namespace)
    }

    /// Binds a fresh namespace to a new backend and starts a new episode.
    pub fn create(&mut self) -> Observation {
        let episode_id = Uuid::new_v4().to_string();
        self.active = Some(Active {
            namespace: Namespace::with_stack_size(self.settings.config.worker_stack_size),
            backend: Backend::new(self.settings.clone()),
        });
        self.state = SessionState {
            episode_id: Some(episode_id.clone()),
            step_count: 0,
            last_exit_code: 0,
        };
        info!(
            episode = %episode_id,
            backend = %self.settings.config.backend,
            "session created"
        );
        Observation::initial()
    }

    /// Runs one submission against the live namespace.
    pub fn submit(&mut self, submission: Submission) -> Result<Observation> {
        let grace = self
            .settings
            .config
            .capture
            .grace_for(submission.requested_grace());
        let active = self.active.as_mut().ok_or(SandboxError::SessionNotReady)?;

        let span = info_span!(
            "submit",
            episode = self.state.episode_id.as_deref().unwrap_or_default(),
            step = self.state.step_count + 1
        );
        let _guard = span.enter();

        let result = active.backend.run(
            &active.namespace,
            &submission.code,
            submission.capture_frame,
            grace,
        );

        self.state.step_count += 1;
        self.state.last_exit_code = result.exit_code;

        let frame = if submission.capture_frame {
            let frame = active.backend.captured_frame().map(str::to_string);
            if frame.is_none() {
                warn!(
                    display = %self.settings.config.capture.display,
                    "frame capture was requested but no frame was captured"
                );
            }
            frame
        } else {
            None
        };

        debug!(exit_code = result.exit_code, error = ?result.error, "submission finished");
        Ok(Observation::from_result(result, frame, submission.code))
    }

    /// Decodes a JSON submission and runs it.
    pub fn submit_json(&mut self, json: &str) -> Result<Observation> {
        if !self.is_ready() {
            return Err(SandboxError::SessionNotReady);
        }
        self.submit(Submission::from_json(json)?)
    }

    /// Runs `code` with no capture.
    pub fn run(&mut self, code: &str) -> Result<Observation> {
        self.submit(Submission::new(code))
    }

    /// Throws away the namespace and backend and starts over with the same
    /// whitelist and backend kind.
    pub fn reset(&mut self) -> Observation {
        self.teardown();
        self.create()
    }

    /// Drops the namespace and backend. Submissions fail until the next
    /// `create`.
    pub fn teardown(&mut self) {
        if self.active.take().is_some() {
            debug!(
                episode = self.state.episode_id.as_deref().unwrap_or_default(),
                steps = self.state.step_count,
                "session torn down"
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.settings.config.backend)
            .field("ready", &self.is_ready())
            .field("state", &self.state)
            .finish()
    }
}
