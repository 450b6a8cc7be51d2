//! Blocking subprocess helper shared by the store and engine backends.

use std::path::Path;
use std::process::{Command, Stdio};

/// Run `program args...` to completion.
///
/// Returns stdout on success. On failure the error message carries the exit
/// status and stderr. When `stdin` is given the file is streamed to the child.
pub fn run(program: &str, args: &[&str], stdin: Option<&Path>) -> Result<String, String> {
    tracing::debug!(program = %program, args = ?args, "Executing command");

    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    match stdin {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
            cmd.stdin(Stdio::from(file));
        }
        None => {
            cmd.stdin(Stdio::null());
        }
    }

    let output = cmd
        .output()
        .map_err(|e| format!("failed to execute {}: {}", program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        tracing::warn!(
            program = %program,
            args = ?args,
            status = output.status.code().unwrap_or(-1),
            stdout = %stdout.trim(),
            stderr = %stderr.trim(),
            "Command failed"
        );
        return Err(format!(
            "{} exited with status {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ));
    }

    if !stdout.trim().is_empty() {
        tracing::debug!(program = %program, stdout = %stdout.trim(), "Command output");
    }
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_success_returns_stdout() {
        let out = run("sh", &["-c", "echo hello"], None).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_failure_reports_stderr() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"], None).unwrap_err();
        assert!(err.contains("status 3"));
        assert!(err.contains("boom"));
    }

    #[test]
    fn test_run_missing_program() {
        assert!(run("definitely-not-a-real-binary-xyz", &[], None).is_err());
    }

    #[test]
    fn test_run_with_stdin() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "piped").unwrap();
        let out = run("cat", &[], Some(&input)).unwrap();
        assert_eq!(out, "piped");
    }
}
