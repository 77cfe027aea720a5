//! External command execution
//!
//! Every cluster CLI call and every in-pod tool invocation goes through a
//! [`CommandRunner`]. [`ShellRunner`] spawns real processes;
//! [`ScriptedRunner`] answers from canned rules and records what was asked.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

/// Extra inputs for one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Written to the child's stdin, then stdin is closed
    pub input: Option<String>,
    /// Added to the inherited environment
    pub env: Vec<(String, String)>,
}

/// Runs external programs and returns their stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; non-zero exit is an error carrying stderr.
    async fn run(&self, program: &str, args: &[String], options: &CommandOptions)
        -> Result<String>;

    async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
        self.run(program, args, &CommandOptions::default()).await
    }

    async fn execute_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<String> {
        let options = CommandOptions {
            input: Some(input.to_string()),
            ..Default::default()
        };
        self.run(program, args, &options).await
    }

    async fn execute_with_env(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<String> {
        let options = CommandOptions {
            env: env.to_vec(),
            ..Default::default()
        };
        self.run(program, args, &options).await
    }
}

/// Spawns processes with tokio
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        options: &CommandOptions,
    ) -> Result<String> {
        let start = Instant::now();
        debug!(program, args = %args.join(" "), "Executing command");

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| MigrateError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if let Some(input) = &options.input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                // dropping stdin closes the pipe
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            warn!(
                program,
                status = ?output.status.code(),
                duration_ms = start.elapsed().as_millis() as u64,
                stderr = %stderr,
                "Command failed"
            );
            return Err(MigrateError::CommandFailed {
                program: program.to_string(),
                args: args.join(" "),
                status: output.status.code(),
                stderr: if stderr.is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr
                },
            });
        }

        debug!(
            program,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command completed"
        );
        Ok(stdout)
    }
}

// ===== Scripted runner for tests =====

/// One recorded call made against a [`ScriptedRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub options: CommandOptions,
}

impl Invocation {
    /// `program arg1 arg2 ...`
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone)]
struct Rule {
    fragments: Vec<String>,
    reply: std::result::Result<String, String>,
    once: bool,
}

/// Command runner answering from rules instead of spawning processes
///
/// A rule matches when every fragment occurs in the call's command line.
/// Rules are checked in insertion order; `once` rules are consumed on use.
/// Unmatched calls succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply `stdout` to every call matching `fragments`.
    pub fn respond(&self, fragments: &[&str], stdout: &str) -> &Self {
        self.push(fragments, Ok(stdout.to_string()), false)
    }

    /// Reply `stdout` to the next call matching `fragments` only.
    pub fn respond_once(&self, fragments: &[&str], stdout: &str) -> &Self {
        self.push(fragments, Ok(stdout.to_string()), true)
    }

    /// Fail every call matching `fragments` with `stderr`.
    pub fn fail(&self, fragments: &[&str], stderr: &str) -> &Self {
        self.push(fragments, Err(stderr.to_string()), false)
    }

    /// Fail the next call matching `fragments` only.
    pub fn fail_once(&self, fragments: &[&str], stderr: &str) -> &Self {
        self.push(fragments, Err(stderr.to_string()), true)
    }

    fn push(
        &self,
        fragments: &[&str],
        reply: std::result::Result<String, String>,
        once: bool,
    ) -> &Self {
        self.rules.lock().push(Rule {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            reply,
            once,
        });
        self
    }

    /// All calls made so far
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Command lines of calls containing every fragment
    pub fn calls_matching(&self, fragments: &[&str]) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(Invocation::command_line)
            .filter(|line| fragments.iter().all(|f| line.contains(f)))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        options: &CommandOptions,
    ) -> Result<String> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
            options: options.clone(),
        };
        let line = invocation.command_line();
        self.calls.lock().push(invocation);

        let reply = {
            let mut rules = self.rules.lock();
            let position = rules
                .iter()
                .position(|rule| rule.fragments.iter().all(|f| line.contains(f.as_str())));
            match position {
                Some(index) if rules[index].once => Some(rules.remove(index).reply),
                Some(index) => Some(rules[index].reply.clone()),
                None => None,
            }
        };

        match reply {
            None => Ok(String::new()),
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => Err(MigrateError::CommandFailed {
                program: program.to_string(),
                args: args.join(" "),
                status: Some(1),
                stderr,
            }),
        }
    }
}

/// Build an owned argument list from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_captures_stdout() {
        let runner = ShellRunner::new();
        let out = runner.execute("echo", &args(["hello"])).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_shell_runner_error_carries_stderr() {
        let runner = ShellRunner::new();
        let err = runner
            .execute("sh", &args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            MigrateError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shell_runner_input_and_env() {
        let runner = ShellRunner::new();
        let out = runner
            .execute_with_input("cat", &[], "piped text")
            .await
            .unwrap();
        assert_eq!(out, "piped text");

        let env = vec![("VIRTMIGRATE_TEST_VALUE".to_string(), "42".to_string())];
        let out = runner
            .execute_with_env("sh", &args(["-c", "echo $VIRTMIGRATE_TEST_VALUE"]), &env)
            .await
            .unwrap();
        assert_eq!(out.trim(), "42");
    }

    #[tokio::test]
    async fn test_shell_runner_missing_binary() {
        let runner = ShellRunner::new();
        let err = runner
            .execute("virtmigrate-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_scripted_rules_in_order() {
        let runner = ScriptedRunner::new();
        runner
            .respond_once(&["get", "vm"], "Stopped")
            .respond(&["get", "vm"], "Running")
            .fail(&["delete"], "forbidden");

        let first = runner.execute("oc", &args(["get", "vm", "a"])).await.unwrap();
        let second = runner.execute("oc", &args(["get", "vm", "a"])).await.unwrap();
        let third = runner.execute("oc", &args(["get", "vm", "a"])).await.unwrap();
        assert_eq!(
            (first.as_str(), second.as_str(), third.as_str()),
            ("Stopped", "Running", "Running")
        );

        let err = runner.execute("oc", &args(["delete", "pod", "x"])).await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));

        let unmatched = runner.execute("oc", &args(["version"])).await.unwrap();
        assert!(unmatched.is_empty());

        assert_eq!(runner.calls().len(), 5);
        assert_eq!(runner.calls_matching(&["get vm a"]).len(), 3);
    }
}
