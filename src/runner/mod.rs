//! Runner module - Test Runner contract
//!
//! A runner executes one submission against its test cases and streams
//! [`RunnerEvent`]s back to the owning session:
//! - each test is reported at most once
//! - hidden tests never carry expected/actual output
//! - a finished run ends with exactly one `Summary`
//! - a fault ends with `Crashed` (or an `Err` from [`TestRunner::run`])
//!
//! The session aborts a runner by dropping its task, so implementations must
//! release their resources on drop (e.g. `kill_on_drop` for processes).
//!
//! The runner module does NOT:
//! - Classify the run into PASSED/FAILED/PARTIAL
//! - Enforce the session deadline

pub mod process;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::catalog::TestCase;
use crate::languages::Language;
use crate::protocol::{RunSummary, TestOutcome};

/// Everything a runner needs for one invocation
#[derive(Debug, Clone)]
pub struct RunJob {
    pub task_id: String,
    pub language: Language,
    pub code: String,
    pub tests: Vec<TestCase>,
}

/// Event streamed from a runner to its session
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Status(String),
    Test(TestOutcome),
    Summary(RunSummary),
    Crashed(String),
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run `job`, sending progress to `events`. Returning an error is a crash.
    async fn run(&self, job: &RunJob, events: mpsc::Sender<RunnerEvent>) -> anyhow::Result<()>;
}

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self {
            program,
            args: iter.cloned().collect(),
            work_dir: None,
        }
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

/// Compare program output with expected output
pub fn compare_output(actual: &str, expected: &str) -> bool {
    // Trailing whitespace on each line and trailing blank lines are ignored
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}
