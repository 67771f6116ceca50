//! Process-backed worker executor.
//!
//! Spawns the configured worker command once per stage invocation, feeds
//! the role instructions and stage context through stdin, and reads the
//! structured result from stdout: the unit prints a single JSON line with
//! at least a `success` field, e.g.
//!
//! ```text
//! {"success": true, "summary": "added login endpoint", "artifacts": ["src/auth.rs"]}
//! ```
//!
//! Units that exit without a result line fall back to exit-status
//! interpretation. The child is spawned with kill-on-drop, so dropping the
//! execute future (timeout, abort) tears the process down.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::WorkerError;
use crate::settings::WorkerSettings;
use crate::worker::{WorkerExecutor, WorkerOutput, WorkerSpec};

pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultLine {
    pub(crate) success: bool,
    #[serde(default)]
    pub(crate) summary: String,
    #[serde(default)]
    pub(crate) artifacts: Vec<String>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

/// Find the structured result in the unit's output: the last line that
/// parses as a JSON object with a `success` field.
pub(crate) fn parse_result_line(raw: &str) -> Option<ResultLine> {
    raw.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

#[async_trait]
impl WorkerExecutor for ProcessExecutor {
    async fn execute(&self, spec: &WorkerSpec) -> Result<WorkerOutput, WorkerError> {
        let prompt = format!("{}\n\n{}", spec.instructions, spec.context);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("VANGUARD_RUN_ID", &spec.run_id)
            .env("VANGUARD_ROLE", spec.role.to_string())
            .env("VANGUARD_STAGE", spec.stage.to_string())
            .env("VANGUARD_WORKSPACE", &spec.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if spec.workspace.is_dir() {
            cmd.current_dir(&spec.workspace);
        }

        let mut child = cmd.spawn().map_err(|e| WorkerError::SpawnFailed {
            role: spec.role.to_string(),
            reason: format!("{}: {e}", self.command),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let collected = child.wait_with_output().await?;
        let raw_output = String::from_utf8_lossy(&collected.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&collected.stderr);
        debug!(
            run = %spec.run_id,
            exit = collected.status.code().unwrap_or(-1),
            bytes = raw_output.len(),
            "worker process finished"
        );

        if let Some(result) = parse_result_line(&raw_output) {
            return Ok(WorkerOutput {
                success: result.success,
                summary: result.summary,
                artifacts: result.artifacts,
                error: result.error,
                raw_output,
            });
        }

        // No structured result; fall back to the exit status.
        let success = collected.status.success();
        let summary = raw_output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string();
        Ok(WorkerOutput {
            success,
            summary,
            artifacts: Vec::new(),
            error: if success {
                None
            } else {
                Some(format!(
                    "exit {}: {}",
                    collected.status.code().unwrap_or(-1),
                    stderr.trim().chars().take(500).collect::<String>()
                ))
            },
            raw_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec() -> WorkerSpec {
        WorkerSpec {
            run_id: "run_test".into(),
            role: Stage::Execute.role(),
            stage: Stage::Execute,
            instructions: "do the thing".into(),
            context: "with this context".into(),
            workspace: PathBuf::from("/nonexistent"),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn result_line_parses_from_mixed_output() {
        let raw = "progress: working\nsome log line\n{\"success\": true, \"summary\": \"done\", \"artifacts\": [\"a.rs\"]}\n";
        let parsed = parse_result_line(raw).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.summary, "done");
        assert_eq!(parsed.artifacts, vec!["a.rs"]);
    }

    #[test]
    fn last_result_line_wins() {
        let raw = "{\"success\": false, \"summary\": \"first\"}\n{\"success\": true, \"summary\": \"second\"}";
        let parsed = parse_result_line(raw).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.summary, "second");
    }

    #[test]
    fn non_result_json_is_ignored() {
        assert!(parse_result_line("{\"progress\": 50}").is_none());
        assert!(parse_result_line("no json here").is_none());
    }

    #[tokio::test]
    async fn unknown_command_is_a_spawn_failure() {
        let executor = ProcessExecutor {
            command: "vanguard-test-no-such-binary".into(),
            args: vec![],
        };
        let err = executor.execute(&spec()).await.unwrap_err();
        assert!(matches!(err, WorkerError::SpawnFailed { .. }));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn structured_result_is_read_from_stdout() {
        let executor = ProcessExecutor {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                // Consume the prompt, then emit a result line.
                r#"cat > /dev/null; echo '{"success": true, "summary": "from sh", "artifacts": ["x.rs"]}'"#.into(),
            ],
        };
        let output = executor.execute(&spec()).await.unwrap();
        assert!(output.success);
        assert_eq!(output.summary, "from sh");
        assert_eq!(output.artifacts, vec!["x.rs"]);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn nonzero_exit_without_result_line_is_a_failure() {
        let executor = ProcessExecutor {
            command: "sh".into(),
            args: vec!["-c".into(), "cat > /dev/null; echo oops >&2; exit 3".into()],
        };
        let output = executor.execute(&spec()).await.unwrap();
        assert!(!output.success);
        assert!(output.error.as_deref().unwrap_or("").contains("exit 3"));
    }
}
