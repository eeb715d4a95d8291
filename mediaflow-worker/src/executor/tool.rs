use super::NodeError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keep this much of the tail of a failing tool's stderr in the error text.
const STDERR_TAIL_CHARS: usize = 2048;

#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Split a configured command line into program + leading args, so entries
/// like `python3 -m tools.paddleocr_cli` work as single config values.
fn split_command(command_line: &str) -> Result<(String, Vec<String>), NodeError> {
    let mut parts = command_line.split_whitespace().map(str::to_string);
    let program = parts.next().ok_or_else(|| {
        NodeError::InvalidInput("tool command is empty; check the worker config".to_string())
    })?;
    Ok((program, parts.collect()))
}

/// Run an external tool with a hard timeout and cooperative cancellation.
/// Non-zero exits become compute errors carrying the stderr tail.
pub async fn run_tool(
    command_line: &str,
    args: &[String],
    working_dir: Option<&Path>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput, NodeError> {
    let (program, mut full_args) = split_command(command_line)?;
    full_args.extend(args.iter().cloned());

    debug!("Running tool: {program} {}", full_args.join(" "));

    let mut command = Command::new(&program);
    command
        .args(&full_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(|err| {
        NodeError::Compute(format!("failed to spawn {program}: {err}"))
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => {
            output.map_err(|err| NodeError::Compute(format!("{program} failed: {err}")))?
        }
        _ = tokio::time::sleep(timeout) => {
            return Err(NodeError::Compute(format!(
                "{program} exceeded the {timeout:?} timeout"
            )));
        }
        _ = cancel.cancelled() => {
            return Err(NodeError::Cancelled(format!(
                "{program} interrupted by cancellation"
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        let char_count = stderr.chars().count();
        let tail: String = stderr
            .chars()
            .skip(char_count.saturating_sub(STDERR_TAIL_CHARS))
            .collect();
        return Err(NodeError::Compute(format!(
            "{program} exited with {}: {}",
            output
                .status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            tail.trim()
        )));
    }

    Ok(ToolOutput { stdout, stderr })
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn successful_tool_output_is_captured() {
        let cancel = CancellationToken::new();
        let output = run_tool(
            "echo",
            &["hello".to_string()],
            None,
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    async fn non_zero_exit_is_a_compute_error_with_stderr() {
        let cancel = CancellationToken::new();
        let error = run_tool(
            "sh",
            &[
                "-c".to_string(),
                "echo boom >&2; exit 3".to_string(),
            ],
            None,
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("Compute error"));
        assert!(message.contains("exited with 3"));
        assert!(message.contains("boom"));
    }

    #[test]
    async fn timeouts_are_reported() {
        let cancel = CancellationToken::new();
        let error = run_tool(
            "sleep",
            &["5".to_string()],
            None,
            Duration::from_millis(50),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(error.to_string().contains("timeout"));
    }

    #[test]
    async fn cancellation_interrupts_the_tool() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let error = run_tool(
            "sleep",
            &["5".to_string()],
            None,
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, NodeError::Cancelled(_)));
    }

    #[test]
    async fn command_lines_split_into_program_and_args() {
        let (program, args) = split_command("python3 -m tools.paddleocr_cli").unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["-m", "tools.paddleocr_cli"]);
    }
}
