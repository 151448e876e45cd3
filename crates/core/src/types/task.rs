//! Compile requests and the tasks created from them

use super::{CompileResult, TaskId, TaskStatus};
use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Scheduling tier. Declaration order is the dispatch order, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(Error::validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Compiler optimization level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizationLevel {
    #[default]
    O0,
    O1,
    O2,
    O3,
    Os,
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::O0 => "O0",
            Self::O1 => "O1",
            Self::O2 => "O2",
            Self::O3 => "O3",
            Self::Os => "Os",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OptimizationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches('-') {
            "O0" | "0" => Ok(Self::O0),
            "O1" | "1" => Ok(Self::O1),
            "O2" | "2" => Ok(Self::O2),
            "O3" | "3" => Ok(Self::O3),
            "Os" | "s" => Ok(Self::Os),
            other => Err(Error::validation(format!(
                "unknown optimization level '{other}'"
            ))),
        }
    }
}

/// How to invoke the compiler for a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub optimization: OptimizationLevel,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub warnings: bool,
    /// Artifacts the compile is expected to produce
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
}

impl CompilerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization = level;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_warnings(mut self, warnings: bool) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }
}

/// A caller's request to compile something. Becomes a [`CompileTask`] on admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub project_path: PathBuf,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CompileRequest {
    pub fn new(project_path: impl Into<PathBuf>, compiler: CompilerConfig) -> Self {
        Self {
            project_path: project_path.into(),
            sources: Vec::new(),
            compiler,
            priority: Priority::Normal,
            env: HashMap::new(),
        }
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(path.into());
        self
    }

    pub fn with_sources<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Reject requests that can never run
    pub fn validate(&self) -> Result<()> {
        let command = self.compiler.command.trim();
        if command.is_empty() {
            return Err(Error::validation("compiler command must not be empty"));
        }
        if self.compiler.command.contains('\0') {
            return Err(Error::validation("compiler command contains a NUL byte"));
        }
        if self.project_path.as_os_str().is_empty() {
            return Err(Error::validation("project path must not be empty"));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(Error::validation(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        Ok(())
    }
}

/// A unit of compile work tracked through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileTask {
    pub id: TaskId,
    pub project_path: PathBuf,
    pub sources: Vec<PathBuf>,
    pub compiler: CompilerConfig,
    pub priority: Priority,
    pub env: HashMap<String, String>,
    pub cache_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    pub result: Option<Arc<CompileResult>>,
    pub cancel_reason: Option<String>,
    /// Satisfied by a stored or shared result instead of its own run
    pub from_cache: bool,
}

impl CompileTask {
    /// Admit a request: assign an id and the creation timestamp
    pub fn admit(request: CompileRequest) -> Self {
        let CompileRequest {
            project_path,
            sources,
            compiler,
            priority,
            env,
        } = request;

        Self {
            id: TaskId::new(),
            project_path,
            sources,
            compiler,
            priority,
            env,
            cache_key: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: TaskStatus::Queued,
            output: String::new(),
            error_output: String::new(),
            exit_code: None,
            result: None,
            cancel_reason: None,
            from_cache: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change, rejecting anything the lifecycle does not allow
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)
    }

    /// Finish successfully with the outcome of this task's own run
    pub fn succeed(
        &mut self,
        result: Arc<CompileResult>,
        output: String,
        exit_code: Option<i32>,
    ) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.output = output;
        self.exit_code = exit_code;
        self.result = Some(result);
        Ok(())
    }

    /// Finish successfully with a result produced elsewhere
    pub fn succeed_from_cache(&mut self, result: Arc<CompileResult>) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.exit_code = Some(0);
        self.result = Some(result);
        self.from_cache = true;
        Ok(())
    }

    pub fn fail(
        &mut self,
        error_output: String,
        exit_code: Option<i32>,
        result: Option<Arc<CompileResult>>,
    ) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error_output = error_output;
        self.exit_code = exit_code;
        self.result = result;
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.cancel_reason = Some(reason.into());
        Ok(())
    }

    /// Wall time between start and end, when both are known
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    /// Time spent so far in `Running`
    pub fn running_for(&self) -> Option<Duration> {
        if self.status != TaskStatus::Running {
            return None;
        }
        (Utc::now() - self.started_at?).to_std().ok()
    }
}
