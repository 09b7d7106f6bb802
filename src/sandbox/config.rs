//! Sandbox configuration with builder pattern.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::sandbox::policy::ImportPolicy;

/// Which executor backend a session runs its submissions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Tree-walking interpreter over a whitelist of syntax nodes.
    #[default]
    Interpreted,
    /// Guard-rewriting compiler with full language semantics.
    Restricted,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Interpreted => "interpreted",
            BackendKind::Restricted => "restricted",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SandboxError;

    /// Accepts the backend names and the legacy `EXECUTOR_BACKEND` values
    /// (`smolagents`, `restrictedpython`), case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpreted" | "smolagents" => Ok(BackendKind::Interpreted),
            "restricted" | "restrictedpython" => Ok(BackendKind::Restricted),
            other => Err(SandboxError::UnknownBackend(other.to_string())),
        }
    }
}

/// Settings of the frame capture step.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Frame-grab executable.
    pub program: String,
    /// Display the frame is grabbed from.
    pub display: String,
    /// Kill the tool after this long.
    pub timeout: Duration,
    /// Default wait before grabbing, overridable per submission.
    pub grace_period: Duration,
    /// Upper bound on a per-submission grace override.
    pub max_grace_period: Duration,
    /// When false every capture attempt reports the tool as unavailable.
    pub enabled: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "import".to_string(),
            display: ":99".to_string(),
            timeout: Duration::from_secs(5),
            grace_period: Duration::from_millis(500),
            max_grace_period: Duration::from_secs(2),
            enabled: true,
        }
    }
}

impl CaptureConfig {
    /// The wait before a grab: `requested` when given, capped at
    /// [`max_grace_period`](Self::max_grace_period).
    pub fn grace_for(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.grace_period)
            .min(self.max_grace_period.max(self.grace_period))
    }

    /// Longest a capture step can block: the largest grace plus the tool
    /// timeout.
    pub fn worst_case(&self) -> Duration {
        self.max_grace_period.max(self.grace_period) + self.timeout
    }

    /// Arguments passed to [`program`](Self::program) for one grab.
    pub fn args(&self, output: &str) -> Vec<String> {
        vec![
            "-window".to_string(),
            "root".to_string(),
            "-display".to_string(),
            self.display.clone(),
            output.to_string(),
        ]
    }
}

/// Configuration for a sandbox session.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Backend used by new sessions.
    pub backend: BackendKind,
    /// Caller-declared third-party modules, on top of the bundled stdlib.
    pub additional_imports: Vec<String>,
    /// Wall-clock limit of one submission.
    pub timeout: Duration,
    /// Maximum evaluation steps of one submission.
    pub max_fuel: Option<u64>,
    /// Maximum nesting of script-level calls.
    pub recursion_limit: usize,
    /// Per-channel output cap in bytes.
    pub max_output_bytes: usize,
    /// Largest string, bytes or sequence a script may build in one step;
    /// larger requests raise `MemoryError`.
    pub max_allocation_bytes: usize,
    /// Stack size of the thread that owns a namespace's interpreter.
    pub worker_stack_size: usize,
    pub capture: CaptureConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            additional_imports: Vec::new(),
            timeout: Duration::from_secs(30),
            max_fuel: None,
            recursion_limit: 200,
            max_output_bytes: 1024 * 1024, // 1MB
            max_allocation_bytes: 64 * 1024 * 1024,
            worker_stack_size: 256 * 1024 * 1024,
            capture: CaptureConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Reads the container knobs from the process environment.
    ///
    /// `ADDITIONAL_IMPORTS`, `EXECUTOR_BACKEND`, `SANDBOX_TIMEOUT_SECS`,
    /// `SANDBOX_CAPTURE_DISPLAY` and `SANDBOX_CAPTURE_TOOL`; unset knobs keep
    /// their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(imports) = lookup("ADDITIONAL_IMPORTS") {
            builder = builder.additional_imports(ImportPolicy::parse_list(&imports));
        }
        if let Some(backend) = lookup("EXECUTOR_BACKEND").filter(|b| !b.trim().is_empty()) {
            builder = builder.backend(backend.parse()?);
        }
        if let Some(secs) = lookup("SANDBOX_TIMEOUT_SECS") {
            let secs: f64 = secs.trim().parse().map_err(|_| {
                SandboxError::Config(format!("SANDBOX_TIMEOUT_SECS is not a number: '{secs}'"))
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(SandboxError::Config(format!(
                    "SANDBOX_TIMEOUT_SECS must be positive, got {secs}"
                )));
            }
            builder = builder.timeout(Duration::from_secs_f64(secs));
        }
        let mut capture = CaptureConfig::default();
        if let Some(display) = lookup("SANDBOX_CAPTURE_DISPLAY").filter(|d| !d.trim().is_empty()) {
            capture.display = display.trim().to_string();
        }
        if let Some(tool) = lookup("SANDBOX_CAPTURE_TOOL").filter(|t| !t.trim().is_empty()) {
            capture.program = tool.trim().to_string();
        }
        Ok(builder.capture(capture).build())
    }

    /// Import policy derived from the configured whitelist.
    pub fn import_policy(&self) -> ImportPolicy {
        ImportPolicy::new(self.additional_imports.iter().cloned())
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    backend: Option<BackendKind>,
    additional_imports: Option<Vec<String>>,
    timeout: Option<Duration>,
    max_fuel: Option<u64>,
    recursion_limit: Option<usize>,
    max_output_bytes: Option<usize>,
    max_allocation_bytes: Option<usize>,
    worker_stack_size: Option<usize>,
    capture: Option<CaptureConfig>,
}

impl SandboxConfigBuilder {
    /// Set the executor backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the third-party import whitelist.
    pub fn additional_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.additional_imports = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    /// Set the maximum execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the maximum fuel (evaluation steps).
    pub fn max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    pub fn recursion_limit(mut self, depth: usize) -> Self {
        self.recursion_limit = Some(depth);
        self
    }

    /// Set the per-channel output cap in bytes.
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set the largest single allocation a script may request.
    pub fn max_allocation_bytes(mut self, bytes: usize) -> Self {
        self.max_allocation_bytes = Some(bytes);
        self
    }

    pub fn worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }

    /// Set the frame capture settings.
    pub fn capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            backend: self.backend.unwrap_or(default.backend),
            additional_imports: self.additional_imports.unwrap_or(default.additional_imports),
            timeout: self.timeout.unwrap_or(default.timeout),
            max_fuel: self.max_fuel.or(default.max_fuel),
            recursion_limit: self.recursion_limit.unwrap_or(default.recursion_limit),
            max_output_bytes: self.max_output_bytes.unwrap_or(default.max_output_bytes),
            max_allocation_bytes: self
                .max_allocation_bytes
                .unwrap_or(default.max_allocation_bytes),
            worker_stack_size: self.worker_stack_size.unwrap_or(default.worker_stack_size),
            capture: self.capture.unwrap_or(default.capture),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.backend, BackendKind::Interpreted);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.capture.display, ":99");
        assert_eq!(config.capture.grace_period, Duration::from_millis(500));
        assert!(config.additional_imports.is_empty());
        assert_eq!(config.worker_stack_size, 256 * 1024 * 1024);
    }

    #[test]
    fn test_builder() {
        let config = SandboxConfig::builder()
            .backend(BackendKind::Restricted)
            .timeout(Duration::from_secs(5))
            .max_fuel(1_000_000)
            .additional_imports(["numpy", "pandas"])
            .build();

        assert_eq!(config.backend, BackendKind::Restricted);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_fuel, Some(1_000_000));
        assert_eq!(config.additional_imports, vec!["numpy", "pandas"]);
    }

    #[test]
    fn test_backend_aliases() {
        assert_eq!("smolagents".parse::<BackendKind>().unwrap(), BackendKind::Interpreted);
        assert_eq!(" RestrictedPython ".parse::<BackendKind>().unwrap(), BackendKind::Restricted);
        assert!(matches!(
            "pyodide".parse::<BackendKind>(),
            Err(SandboxError::UnknownBackend(name)) if name == "pyodide"
        ));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ADDITIONAL_IMPORTS", "numpy, pandas,,scipy"),
            ("EXECUTOR_BACKEND", "restrictedpython"),
            ("SANDBOX_TIMEOUT_SECS", "2.5"),
            ("SANDBOX_CAPTURE_DISPLAY", ":1"),
        ]);
        let config = SandboxConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.additional_imports, vec!["numpy", "pandas", "scipy"]);
        assert_eq!(config.backend, BackendKind::Restricted);
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.capture.display, ":1");
        assert_eq!(config.capture.program, "import");
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let bad_backend = SandboxConfig::from_lookup(|k| (k == "EXECUTOR_BACKEND").then(|| "wasm".into()));
        assert!(matches!(bad_backend, Err(SandboxError::UnknownBackend(_))));

        let bad_timeout = SandboxConfig::from_lookup(|k| (k == "SANDBOX_TIMEOUT_SECS").then(|| "soon".into()));
        assert!(matches!(bad_timeout, Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_grace_override_is_clamped() {
        let capture = CaptureConfig::default();
        assert_eq!(capture.grace_for(None), Duration::from_millis(500));
        assert_eq!(capture.grace_for(Some(Duration::ZERO)), Duration::ZERO);
        assert_eq!(capture.grace_for(Some(Duration::from_secs(12))), Duration::from_secs(2));
        assert_eq!(capture.worst_case(), Duration::from_secs(7));
    }

    #[test]
    fn test_capture_args() {
        let capture = CaptureConfig::default();
        assert_eq!(
            capture.args("/tmp/frame.png"),
            vec!["-window", "root", "-display", ":99", "/tmp/frame.png"]
        );
    }
}
