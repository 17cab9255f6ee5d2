//! Harness configuration (`patchgate.toml`).
//!
//! Defines the typed configuration for the harness: cache and scratch
//! locations, concurrency and timeout budgets, per-runner grader settings,
//! and the `[[task]]` catalog entries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::TaskEntry;
use crate::model::types::GraderVariant;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level patchgate configuration.
///
/// Parsed from `patchgate.toml`. Missing fields use sensible defaults.
/// Missing file → all defaults (no error, empty catalog).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchgateConfig {
    /// Harness-wide settings.
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Per-variant grader settings.
    #[serde(default)]
    pub graders: GradersConfig,

    /// Task catalog entries, in file order.
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
}

// ---------------------------------------------------------------------------
// HarnessConfig
// ---------------------------------------------------------------------------

/// `[harness]` settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Where repository mirrors are cached.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Parent directory for task-scoped working trees.
    /// `None` → `<system temp>/patchgate`.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Maximum number of tasks processed concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Budget for the agent-active step.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_seconds: u64,

    /// When cached mirrors are refreshed.
    #[serde(default)]
    pub fetch: FetchPolicy,

    /// How a hidden-test patch that conflicts with an agent's edits is scored.
    #[serde(default)]
    pub on_test_patch_conflict: ConflictPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            scratch_dir: None,
            max_parallel: default_max_parallel(),
            agent_timeout_seconds: default_agent_timeout(),
            fetch: FetchPolicy::default(),
            on_test_patch_conflict: ConflictPolicy::default(),
        }
    }
}

impl HarnessConfig {
    /// The directory task-scoped working trees are created in.
    #[must_use]
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("patchgate"))
    }

    /// Agent budget as a [`Duration`].
    #[must_use]
    pub const fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_seconds)
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".patchgate/cache")
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_agent_timeout() -> u64 {
    1800
}

/// When the repository cache talks to the remote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Fetch each repository at most once per harness process.
    #[default]
    Once,
    /// Fetch before every fixture preparation.
    Always,
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Scoring of a hidden-test patch that does not apply to the agent's tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The agent did not solve the task: record the failure with reward 0.
    #[default]
    ScoreZero,
    /// Treat it as a harness fault: record the failure without a reward.
    Infrastructure,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScoreZero => write!(f, "score-zero"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

// ---------------------------------------------------------------------------
// GradersConfig
// ---------------------------------------------------------------------------

/// `[graders.*]` sections, one per variant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GradersConfig {
    /// `[graders.django]`.
    #[serde(default)]
    pub django: GraderConfig,

    /// `[graders.forge]`.
    #[serde(default)]
    pub forge: GraderConfig,

    /// `[graders.exit-status]`.
    #[serde(default, rename = "exit-status")]
    pub exit_status: GraderConfig,
}

/// Settings for one grader variant. Unset fields fall back to the
/// variant's defaults.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraderConfig {
    /// Shell command template. `{test_files}` expands to the task's test
    /// files, `{test_labels}` to their dotted module labels.
    pub command: Option<String>,

    /// Wall-clock budget for one run.
    #[serde(default = "default_grader_timeout")]
    pub timeout_seconds: u64,

    /// Whether a run that discovers no test cases counts as a failure.
    pub require_tests: Option<bool>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_seconds: default_grader_timeout(),
            require_tests: None,
        }
    }
}

const fn default_grader_timeout() -> u64 {
    600
}

/// Fully resolved settings for one grader run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraderSettings {
    /// Which adapter.
    pub variant: GraderVariant,
    /// Command template.
    pub command: String,
    /// Run budget.
    pub timeout: Duration,
    /// Zero discovered tests is a failure.
    pub require_tests: bool,
}

impl GradersConfig {
    /// Resolve the settings for `variant`, filling in defaults.
    #[must_use]
    pub fn settings(&self, variant: GraderVariant) -> GraderSettings {
        let (section, default_command, default_require) = match variant {
            GraderVariant::Django => (
                &self.django,
                "python manage.py test {test_labels} --verbosity=2",
                true,
            ),
            GraderVariant::Forge => (&self.forge, "forge test -vvv", true),
            GraderVariant::ExitStatus => (&self.exit_status, "uv run pytest {test_files}", false),
        };
        GraderSettings {
            variant,
            command: section
                .command
                .clone()
                .unwrap_or_else(|| default_command.to_owned()),
            timeout: Duration::from_secs(section.timeout_seconds),
            require_tests: section.require_tests.unwrap_or(default_require),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a patchgate configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl PatchgateConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - Relative paths (cache, scratch, local repository locators) are
    ///   resolved against the file's directory.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found), parse
    /// errors, or out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        let mut config = Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_relative_to(base);
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or
    /// out-of-range values.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.check_ranges()?;
        Ok(config)
    }

    fn check_ranges(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| {
            Err(ConfigError {
                path: None,
                message: message.to_owned(),
            })
        };
        if self.harness.max_parallel == 0 {
            return fail("harness.max_parallel must be at least 1");
        }
        if self.harness.agent_timeout_seconds == 0 {
            return fail("harness.agent_timeout_seconds must be at least 1");
        }
        for (name, section) in [
            ("django", &self.graders.django),
            ("forge", &self.graders.forge),
            ("exit-status", &self.graders.exit_status),
        ] {
            if section.timeout_seconds == 0 {
                return Err(ConfigError {
                    path: None,
                    message: format!("graders.{name}.timeout_seconds must be at least 1"),
                });
            }
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.harness.cache_dir.is_relative() {
            self.harness.cache_dir = base.join(&self.harness.cache_dir);
        }
        if let Some(dir) = &self.harness.scratch_dir
            && dir.is_relative()
        {
            self.harness.scratch_dir = Some(base.join(dir));
        }
        for task in &mut self.tasks {
            if is_local_locator(&task.repo) && Path::new(&task.repo).is_relative() {
                task.repo = base.join(&task.repo).display().to_string();
            }
        }
    }
}

/// True for plain filesystem paths; false for URLs and scp-style
/// `host:path` locators.
fn is_local_locator(locator: &str) -> bool {
    if locator.contains("://") {
        return false;
    }
    match (locator.find(':'), locator.find('/')) {
        (Some(colon), Some(slash)) => slash < colon,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
