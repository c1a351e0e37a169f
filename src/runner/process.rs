//! Process runner implementation
//!
//! Compiles and runs submissions as local child processes inside a temporary
//! directory, one process per test. Children are killed when the invocation
//! is dropped, which is how session cancellation and deadlines reclaim them.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{compare_output, CommandSpec, RunJob, RunnerEvent, TestRunner};
use crate::catalog::TestCase;
use crate::languages;
use crate::protocol::{truncate_output, RunSummary, TestOutcome};

/// Default compile timeout (30s)
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a child process ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExitStatus {
    Exited(i32),
    /// Killed by a signal
    Signaled,
    /// Killed after exceeding its wall-clock limit
    TimedOut,
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: u64,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExitStatus::Exited(0)
    }
}

/// Runner that executes code directly as child processes
pub struct ProcessRunner {
    compile_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(compile_timeout: Duration) -> Self {
        Self { compile_timeout }
    }

    /// Run one command to completion or until `timeout`
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        stdin_content: Option<&str>,
        timeout: Duration,
    ) -> Result<ProcessOutcome> {
        debug!("Running {} with args {:?}", cmd.program, cmd.args);

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd.program))?;

        // Feed stdin from its own task so a chatty program cannot deadlock us
        if let Some(mut pipe) = child.stdin.take() {
            let input = stdin_content.unwrap_or_default().to_string();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!("Stdin write ended early: {}", e);
                }
            });
        }

        let (status, stdout, stderr) =
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(output) => {
                    let output = output.context("Failed to wait for child process")?;
                    let status = match output.status.code() {
                        Some(code) => ExitStatus::Exited(code),
                        None => ExitStatus::Signaled,
                    };
                    (
                        status,
                        String::from_utf8_lossy(&output.stdout).to_string(),
                        String::from_utf8_lossy(&output.stderr).to_string(),
                    )
                }
                // The child was moved into the dropped future and is killed with it
                Err(_) => (ExitStatus::TimedOut, String::new(), String::new()),
            };

        Ok(ProcessOutcome {
            status,
            stdout,
            stderr,
            time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMPILE_TIMEOUT)
    }
}

#[async_trait]
impl TestRunner for ProcessRunner {
    async fn run(&self, job: &RunJob, events: mpsc::Sender<RunnerEvent>) -> Result<()> {
        let lang_config = languages::get_language_config(job.language)
            .ok_or_else(|| anyhow::anyhow!("Unsupported language: {}", job.language))?;

        let temp_dir = tempfile::tempdir()?;
        let source_path = temp_dir.path().join(&lang_config.source_file);
        tokio::fs::write(&source_path, &job.code).await?;

        // Compile if needed
        if let Some(compile_cmd) = &lang_config.compile_command {
            send(&events, RunnerEvent::Status("Compiling...".into())).await?;

            let spec = CommandSpec::from_vec(compile_cmd).with_work_dir(temp_dir.path());
            let compiled = self.execute(&spec, None, self.compile_timeout).await?;
            if !compiled.is_success() {
                let message = match compiled.status {
                    ExitStatus::TimedOut => "Compilation timed out".to_string(),
                    _ => format!("Compilation failed: {}", truncate_output(compiled.stderr.trim())),
                };
                warn!("[{}] {}", job.task_id, message);
                send(&events, RunnerEvent::Crashed(message)).await?;
                return Ok(());
            }
        }

        let run_cmd = CommandSpec::from_vec(&lang_config.run_command).with_work_dir(temp_dir.path());
        let test_timeout = Duration::from_millis(lang_config.test_timeout_ms);
        let started = Instant::now();
        let mut passed_tests = 0u32;

        for (idx, test) in job.tests.iter().enumerate() {
            let name = if test.name.is_empty() {
                format!("Test {}", idx + 1)
            } else {
                test.name.clone()
            };
            send(&events, RunnerEvent::Status(format!("Running {}...", name))).await?;

            let outcome = self.execute(&run_cmd, Some(&test.input), test_timeout).await?;
            let result = judge_test(name, test, &outcome, test_timeout);
            if result.passed {
                passed_tests += 1;
            }
            send(&events, RunnerEvent::Test(result.redacted())).await?;
        }

        let total_tests = job.tests.len() as u32;
        send(
            &events,
            RunnerEvent::Summary(RunSummary {
                success: passed_tests == total_tests,
                passed_tests,
                total_tests,
                execution_time_ms: Some(started.elapsed().as_millis() as u64),
            }),
        )
        .await
    }
}

async fn send(events: &mpsc::Sender<RunnerEvent>, event: RunnerEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| anyhow::anyhow!("Session stopped listening"))
}

/// Turn one process outcome into a test result
fn judge_test(
    name: String,
    test: &TestCase,
    outcome: &ProcessOutcome,
    timeout: Duration,
) -> TestOutcome {
    let (passed, error_message) = match outcome.status {
        ExitStatus::Exited(0) => (compare_output(&outcome.stdout, &test.expected_output), None),
        ExitStatus::Exited(code) => {
            let stderr = outcome.stderr.trim();
            let message = if stderr.is_empty() {
                format!("Process exited with code {}", code)
            } else {
                truncate_output(stderr)
            };
            (false, Some(message))
        }
        ExitStatus::Signaled => (false, Some("Process killed by signal".to_string())),
        ExitStatus::TimedOut => (
            false,
            Some(format!("Execution timeout (> {}ms)", timeout.as_millis())),
        ),
    };

    TestOutcome {
        name,
        passed,
        expected_output: Some(test.expected_output.trim_end().to_string()),
        actual_output: Some(truncate_output(outcome.stdout.trim_end())),
        error_message,
        is_hidden: test.is_hidden,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::from_vec(&["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    fn case(expected: &str, hidden: bool) -> TestCase {
        TestCase {
            name: "Test 1".into(),
            input: String::new(),
            expected_output: expected.into(),
            is_hidden: hidden,
        }
    }

    fn outcome(status: ExitStatus, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome {
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
            time_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_execute_pipes_stdin_to_stdout() {
        let runner = ProcessRunner::default();
        let result = runner
            .execute(&sh("cat"), Some("1 2\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout, "1 2\n");
    }

    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let runner = ProcessRunner::default();
        let result = runner
            .execute(&sh("echo oops >&2; exit 3"), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.status, ExitStatus::Exited(3));
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let runner = ProcessRunner::default();
        let result = runner
            .execute(&sh("sleep 5"), None, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(result.status, ExitStatus::TimedOut);
        assert!(result.time_ms < 5000);
    }

    #[tokio::test]
    async fn test_execute_missing_program_is_an_error() {
        let runner = ProcessRunner::default();
        let cmd = CommandSpec::from_vec(&["definitely-not-a-real-binary".to_string()]);
        assert!(runner
            .execute(&cmd, None, Duration::from_secs(1))
            .await
            .is_err());
    }

    #[test]
    fn test_judge_accepts_matching_output() {
        let result = judge_test(
            "Test 1".into(),
            &case("3", false),
            &outcome(ExitStatus::Exited(0), "3\n", ""),
            Duration::from_secs(1),
        );
        assert!(result.passed);
        assert_eq!(result.actual_output.as_deref(), Some("3"));
        assert!(result.error_message.is_none());
    }

    #[test]
    fn test_judge_wrong_answer_has_no_error_message() {
        let result = judge_test(
            "Test 1".into(),
            &case("3", false),
            &outcome(ExitStatus::Exited(0), "4\n", ""),
            Duration::from_secs(1),
        );
        assert!(!result.passed);
        assert!(result.error_message.is_none());
    }

    #[test]
    fn test_judge_runtime_error_and_timeout() {
        let crashed = judge_test(
            "Test 1".into(),
            &case("3", false),
            &outcome(ExitStatus::Exited(1), "", "Traceback: ZeroDivisionError"),
            Duration::from_secs(1),
        );
        assert!(!crashed.passed);
        assert_eq!(
            crashed.error_message.as_deref(),
            Some("Traceback: ZeroDivisionError")
        );

        let slow = judge_test(
            "Test 1".into(),
            &case("3", false),
            &outcome(ExitStatus::TimedOut, "", ""),
            Duration::from_millis(500),
        );
        assert_eq!(
            slow.error_message.as_deref(),
            Some("Execution timeout (> 500ms)")
        );
    }

    #[test]
    fn test_hidden_test_outputs_are_redacted_before_emit() {
        let result = judge_test(
            "Hidden 1".into(),
            &case("42", true),
            &outcome(ExitStatus::Exited(0), "41", ""),
            Duration::from_secs(1),
        )
        .redacted();
        assert!(!result.passed);
        assert!(result.is_hidden);
        assert!(result.expected_output.is_none());
        assert!(result.actual_output.is_none());
    }
}
