//! Shell execution backend.
//!
//! Every operation runs in its own working directory under the configured
//! root. The command's auxiliary files are written there before the script
//! starts, and the directory is removed once the command finished. A
//! `{name}` placeholder in the script expands to the full path of file `name`.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cheops_core::{Execution, Executor, Operation};
use tokio::process::Command;

/// Runs command scripts through a shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
    work_dir: PathBuf,
}

impl ShellExecutor {
    /// Create an executor running scripts with `shell -c` below `work_dir`.
    pub fn new(shell: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Root of the per-request working directories.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn prepare(&self, dir: &Path, operation: &Operation) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        for (name, contents) in &operation.command.files {
            if !is_plain_file_name(name) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("refusing to write file '{}'", name),
                ));
            }
            tokio::fs::write(dir.join(name), contents).await?;
        }
        Ok(())
    }

    async fn run(&self, operation: &Operation, dir: &Path, deadline: Duration) -> Execution {
        let script = expand_files(&operation.command.script, operation, dir);
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Execution::ko(format!(
                    "failed to spawn {}: {}",
                    self.shell.display(),
                    e
                ))
            }
        };

        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Execution::ko(format!("failed to wait for command: {}", e)),
            Err(_) => {
                return Execution::ko(format!(
                    "command exceeded its deadline of {} ms",
                    deadline.as_millis()
                ))
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Execution::ok(text)
        } else {
            tracing::debug!(
                request_id = %operation.request_id,
                status = %output.status,
                "command failed"
            );
            Execution::ko(text)
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, operation: &Operation, deadline: Duration) -> Execution {
        let dir = self.work_dir.join(dir_name(&operation.request_id));
        let execution = match self.prepare(&dir, operation).await {
            Ok(()) => self.run(operation, &dir, deadline).await,
            Err(e) => Execution::ko(format!("failed to prepare working directory: {}", e)),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to clean working directory");
        }
        execution
    }
}

fn expand_files(script: &str, operation: &Operation, dir: &Path) -> String {
    operation
        .command
        .files
        .keys()
        .fold(script.to_string(), |script, name| {
            script.replace(
                &format!("{{{}}}", name),
                &dir.join(name).display().to_string(),
            )
        })
}

/// Directory name for a request id, keeping only filesystem-safe characters.
fn dir_name(request_id: &str) -> String {
    let name: String = request_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "request".to_string()
    } else {
        name
    }
}

/// Whether `name` names a file directly inside the working directory.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheops_core::{Command as OpCommand, OperationClass, ReplyStatus};

    fn op(request_id: &str, command: OpCommand) -> Operation {
        Operation::new(request_id, OperationClass::Commutative, "a", "vm", command)
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("main.tf"));
        assert!(!is_plain_file_name("../escape"));
        assert!(!is_plain_file_name("/etc/passwd"));
        assert!(!is_plain_file_name("nested/file"));
        assert!(!is_plain_file_name(""));
        assert_eq!(dir_name("ab/../cd"), "ab____cd");
    }

    #[tokio::test]
    async fn test_successful_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/bin/sh", dir.path());

        let execution = executor
            .execute(&op("r1", OpCommand::shell("echo hello")), Duration::from_secs(5))
            .await;
        assert_eq!(execution.status, ReplyStatus::Ok);
        assert_eq!(execution.output, "hello\n");
        assert!(!dir.path().join("r1").exists());
    }

    #[tokio::test]
    async fn test_files_are_available() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/bin/sh", dir.path());

        let command = OpCommand::shell("cat vars.env").with_file("vars.env", "SIZE=2");
        let execution = executor.execute(&op("r2", command), Duration::from_secs(5)).await;
        assert_eq!(execution.status, ReplyStatus::Ok);
        assert_eq!(execution.output, "SIZE=2");
    }

    #[tokio::test]
    async fn test_file_placeholders_expand() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/bin/sh", dir.path());

        let command = OpCommand::shell("cd / && cat {app.yaml} && echo {other}")
            .with_file("app.yaml", "kind: Pod\n");
        let execution = executor.execute(&op("r7", command), Duration::from_secs(5)).await;
        assert_eq!(execution.status, ReplyStatus::Ok);
        assert_eq!(execution.output, "kind: Pod\n{other}\n");
    }

    #[tokio::test]
    async fn test_failing_command_is_ko() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/bin/sh", dir.path());

        let execution = executor
            .execute(&op("r3", OpCommand::shell("echo broken >&2; exit 3")), Duration::from_secs(5))
            .await;
        assert_eq!(execution.status, ReplyStatus::Ko);
        assert_eq!(execution.output, "broken\n");
    }

    #[tokio::test]
    async fn test_deadline_is_ko() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/bin/sh", dir.path());

        let execution = executor
            .execute(&op("r4", OpCommand::shell("sleep 5")), Duration::from_millis(100))
            .await;
        assert_eq!(execution.status, ReplyStatus::Ko);
        assert!(execution.output.contains("deadline"));
    }

    #[tokio::test]
    async fn test_missing_shell_is_ko() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/nonexistent/shell", dir.path());

        let execution = executor
            .execute(&op("r5", OpCommand::shell("true")), Duration::from_secs(1))
            .await;
        assert_eq!(execution.status, ReplyStatus::Ko);
        assert!(execution.output.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_unsafe_file_name_is_ko() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new("/bin/sh", dir.path());

        let command = OpCommand::shell("true").with_file("../outside", "x");
        let execution = executor.execute(&op("r6", command), Duration::from_secs(1)).await;
        assert_eq!(execution.status, ReplyStatus::Ko);
        assert!(!dir.path().join("outside").exists());
    }
}
