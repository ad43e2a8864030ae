//! Running external tools and hook commands.

use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;

use crate::error::{AppError, Result};

/// Run `cmd` to completion, capturing output.
///
/// A spawn failure with "not found" becomes `DependencyMissing(tool)`.
pub async fn run_tool(cmd: &mut Command, tool: &str) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.output().await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::dependency_missing(tool),
        std::io::ErrorKind::PermissionDenied => {
            AppError::permission_denied(format!("Cannot execute {}: {}", tool, e))
        }
        _ => AppError::io(format!("Failed to run {}: {}", tool, e)),
    })
}

/// Build a `sh -c <script>` command.
pub fn shell(script: &str, cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

/// Trimmed stdout of a successful run.
pub fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Most useful diagnostic of a failed run: stderr, else stdout.
pub fn failure_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = stderr.trim();
    let detail = if detail.is_empty() {
        stdout.trim()
    } else {
        detail
    };
    let detail = if detail.is_empty() {
        "(no output)"
    } else {
        detail
    };
    match output.status.code() {
        Some(code) => format!("exit status {}: {}", code, detail),
        None => format!("terminated by signal: {}", detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_is_dependency_missing() {
        let mut cmd = Command::new("gsm-definitely-not-installed-tool");
        let err = run_tool(&mut cmd, "gsm-definitely-not-installed-tool")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyMissing);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_detail_prefers_stderr() {
        let output = run_tool(&mut shell("echo out; echo err >&2; exit 3", None), "sh")
            .await
            .unwrap();
        assert!(!output.status.success());
        assert_eq!(failure_detail(&output), "exit status 3: err");

        let output = run_tool(&mut shell("echo 1.2.3", None), "sh").await.unwrap();
        assert_eq!(stdout_text(&output), "1.2.3");
    }
}
