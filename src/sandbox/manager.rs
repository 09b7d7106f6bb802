//! Async front door over many sessions.
//!
//! Every session lives on its own worker thread and is driven through a
//! command channel. Callers await a
//! `oneshot` reply, bounded by a timeout derived from the session's
//! execution and capture limits. Commands for one session run in arrival
//! order; different sessions run in parallel.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::{BackendKind, SandboxConfig};
use crate::sandbox::registry::{global_registry, ModuleRegistry};
use crate::sandbox::session::{Observation, Session, SessionState, Submission};

/// Slack added on top of the run and capture limits before a reply is
/// given up on.
const REPLY_MARGIN: Duration = Duration::from_secs(5);

enum Command {
    Submit(Submission, oneshot::Sender<Result<Observation>>),
    SubmitJson(String, oneshot::Sender<Result<Observation>>),
    Reset(oneshot::Sender<Observation>),
    State(oneshot::Sender<SessionState>),
    Close(oneshot::Sender<SessionState>),
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    backend: BackendKind,
    reply_timeout: Duration,
}

/// Registry of live sessions keyed by id.
pub struct SessionManager {
    base: SandboxConfig,
    registry: Arc<ModuleRegistry>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    /// A manager whose sessions start from `base` and import third-party
    /// modules from the process-wide registry.
    pub fn new(base: SandboxConfig) -> Self {
        Self::with_registry(base, Arc::clone(global_registry()))
    }

    pub fn with_registry(base: SandboxConfig, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            base,
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_config(&self) -> &SandboxConfig {
        &self.base
    }

    /// Starts a session with its own whitelist and backend and returns its id.
    pub fn create_session<I, S>(&self, whitelist: I, backend: BackendKind) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = self.base.clone();
        config.additional_imports = whitelist.into_iter().map(Into::into).collect();
        config.backend = backend;
        self.spawn(config)
    }

    /// Starts a session with the base configuration unchanged.
    pub fn create_default_session(&self) -> Result<String> {
        self.spawn(self.base.clone())
    }

    fn spawn(&self, config: SandboxConfig) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let (commands, inbox) = mpsc::channel();
        let backend = config.backend;
        // A grace override is clamped by the session, so the worst case
        // covers every submission.
        let reply_timeout = config.timeout + config.capture.worst_case() + REPLY_MARGIN;
        let registry = Arc::clone(&self.registry);

        thread::Builder::new()
            .name(format!("session-{}", &id[..8]))
            .spawn(move || worker(Session::with_registry(config, registry), inbox))?;

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.clone(),
                SessionHandle {
                    commands,
                    backend,
                    reply_timeout,
                },
            );
        info!(session = %id, %backend, "session started");
        Ok(id)
    }

    /// Runs `code` in the session.
    pub async fn submit(&self, id: &str, code: impl Into<String>, capture_frame: bool) -> Result<Observation> {
        let mut submission = Submission::new(code);
        submission.capture_frame = capture_frame;
        self.submit_with(id, submission).await
    }

    pub async fn submit_with(&self, id: &str, submission: Submission) -> Result<Observation> {
        self.request(id, |reply| Command::Submit(submission, reply))
            .await?
    }

    /// Decodes and runs a JSON submission.
    pub async fn submit_json(&self, id: &str, json: impl Into<String>) -> Result<Observation> {
        let json = json.into();
        self.request(id, |reply| Command::SubmitJson(json, reply))
            .await?
    }

    /// Replaces the session's namespace and backend; the id stays valid.
    pub async fn reset(&self, id: &str) -> Result<Observation> {
        self.request(id, Command::Reset).await
    }

    pub async fn get_state(&self, id: &str) -> Result<SessionState> {
        self.request(id, Command::State).await
    }

    /// Tears the session down and forgets the id. Returns its final state.
    pub async fn close_session(&self, id: &str) -> Result<SessionState> {
        let handle = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        let (reply, rx) = oneshot::channel();
        handle
            .commands
            .send(Command::Close(reply))
            .map_err(|_| SandboxError::WorkerGone(id.to_string()))?;
        let state = await_reply(id, handle.reply_timeout, rx).await?;
        info!(session = %id, steps = state.step_count, "session closed");
        Ok(state)
    }

    pub fn backend_of(&self, id: &str) -> Option<BackendKind> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|handle| handle.backend)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backend_of(id).is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn request<T>(&self, id: &str, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        // The lock guard must be gone before the first await.
        let reply_timeout = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            let handle = sessions
                .get(id)
                .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
            handle
                .commands
                .send(command(reply))
                .map_err(|_| SandboxError::WorkerGone(id.to_string()))?;
            handle.reply_timeout
        };
        await_reply(id, reply_timeout, rx).await
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.base.backend)
            .field("sessions", &self.len())
            .finish()
    }
}

async fn await_reply<T>(id: &str, limit: Duration, rx: oneshot::Receiver<T>) -> Result<T> {
    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(SandboxError::WorkerGone(id.to_string())),
        Err(_) => {
            warn!(session = %id, ?limit, "session worker did not reply");
            Err(SandboxError::ReplyTimeout(limit))
        }
    }
}

fn worker(mut session: Session, inbox: mpsc::Receiver<Command>) {
    session.create();
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Submit(submission, reply) => {
                let _ = reply.send(session.submit(submission));
            }
            Command::SubmitJson(json, reply) => {
                let _ = reply.send(session.submit_json(&json));
            }
            Command::Reset(reply) => {
                let _ = reply.send(session.reset());
            }
            Command::State(reply) => {
                let _ = reply.send(session.state().clone());
            }
            Command::Close(reply) => {
                session.teardown();
                let _ = reply.send(session.state().clone());
                return;
            }
        }
    }
    debug!("session manager dropped; worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::config::CaptureConfig;

    fn manager() -> SessionManager {
        SessionManager::new(SandboxConfig::builder().timeout(Duration::from_secs(5)).build())
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let manager = manager();
        let id = manager
            .create_session(Vec::<String>::new(), BackendKind::Restricted)
            .unwrap();
        assert_eq!(manager.backend_of(&id), Some(BackendKind::Restricted));

        manager.submit(&id, "x = 10", false).await.unwrap();
        let observation = manager.submit(&id, "print(x)", false).await.unwrap();
        assert_eq!(observation.stdout, "10\n");

        let state = manager.get_state(&id).await.unwrap();
        assert_eq!(state.step_count, 2);
        assert_eq!(state.last_exit_code, 0);
    }

    #[tokio::test]
    async fn test_reset_keeps_id() {
        let manager = manager();
        let id = manager.create_default_session().unwrap();
        manager.submit(&id, "y = 1", false).await.unwrap();

        let observation = manager.reset(&id).await.unwrap();
        assert_eq!(observation, Observation::initial());
        let observation = manager.submit(&id, "print(y)", false).await.unwrap();
        assert_eq!(observation.exit_code, 1);
        assert!(observation.stderr.contains("NameError"));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let manager = manager();
        let a = manager.create_default_session().unwrap();
        let b = manager.create_default_session().unwrap();
        manager.submit(&a, "shared = 'a'", false).await.unwrap();

        let observation = manager.submit(&b, "print(shared)", false).await.unwrap();
        assert_eq!(observation.exit_code, 1);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_close_session() {
        let manager = manager();
        let id = manager.create_default_session().unwrap();
        manager.submit(&id, "print(1)", false).await.unwrap();

        let state = manager.close_session(&id).await.unwrap();
        assert_eq!(state.step_count, 1);
        assert!(manager.is_empty());

        let err = manager.get_state(&id).await.unwrap_err();
        assert!(err.is_session_not_found());
        assert!(manager.close_session(&id).await.unwrap_err().is_session_not_found());
    }

    #[tokio::test]
    async fn test_submit_json_through_manager() {
        let manager = manager();
        let id = manager.create_default_session().unwrap();
        let observation = manager
            .submit_json(&id, r#"{"code": "print(2 + 2)"}"#)
            .await
            .unwrap();
        assert_eq!(observation.stdout, "4\n");

        let err = manager.submit_json(&id, "not json").await.unwrap_err();
        assert!(err.is_invalid_submission());
    }

    #[tokio::test]
    async fn test_whitelist_is_per_session() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register_source("plotkit", "def plot(xs):\n    return len(xs)\n");
        let manager = SessionManager::with_registry(SandboxConfig::default(), registry);

        let open = manager
            .create_session(["plotkit"], BackendKind::Interpreted)
            .unwrap();
        let closed = manager
            .create_session(Vec::<String>::new(), BackendKind::Interpreted)
            .unwrap();

        let observation = manager
            .submit(&open, "import plotkit\nprint(plotkit.plot([1, 2]))", false)
            .await
            .unwrap();
        assert_eq!(observation.exit_code, 0, "stderr: {}", observation.stderr);
        assert_eq!(observation.stdout, "2\n");
        let observation = manager.submit(&closed, "import plotkit", false).await.unwrap();
        assert_eq!(observation.exit_code, 1);
        assert!(observation.stderr.contains("plotkit"));
    }

    #[tokio::test]
    async fn test_grace_override_fits_reply_timeout() {
        let capture = CaptureConfig {
            program: "no-such-frame-tool".into(),
            timeout: Duration::from_secs(1),
            ..CaptureConfig::default()
        };
        let config = SandboxConfig::builder()
            .timeout(Duration::from_secs(1))
            .capture(capture)
            .build();
        let manager = SessionManager::new(config);
        let id = manager.create_default_session().unwrap();

        let submission = Submission::new("print('late')")
            .with_grace_period(Duration::from_secs(12))
            .with_capture();
        let observation = manager.submit_with(&id, submission).await.unwrap();
        assert_eq!(observation.stdout.lines().next(), Some("late"));
        assert!(observation.frame.is_none());
    }
}
