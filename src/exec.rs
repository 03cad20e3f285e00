//! External tool invocation.
//!
//! Everything this tool does to the outside world goes through `gcloud`,
//! `kubectl`, or `asmcli`. The [`CommandRunner`] trait is the seam between
//! the pipeline and those vendor binaries: production code uses
//! [`ShellRunner`]; tests substitute a mock and assert on the exact
//! command lines the phases build.

use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Executes external commands.
///
/// Non-zero exit status is always an error carrying the command line and
/// the tool's stderr, so failures read the way the vendor tool wrote them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and return its stdout.
    async fn run<'a>(&self, cmd: &str, args: &[&'a str]) -> Result<String>;

    /// Run a long-lived command, forwarding its stdout line by line to the
    /// console. Used for vendor tools that narrate their own progress
    /// (`gcloud container clusters create`, `asmcli install`).
    async fn run_streaming<'a>(
        &self,
        cmd: &str,
        args: &[&'a str],
        env: &[(&'a str, &'a str)],
    ) -> Result<()>;
}

/// [`CommandRunner`] backed by real subprocesses
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    /// Create a new shell runner
    pub fn new() -> Self {
        Self
    }
}

fn command_line(cmd: &str, args: &[&str]) -> String {
    format!("{} {}", cmd, args.join(" "))
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run<'a>(&self, cmd: &str, args: &[&'a str]) -> Result<String> {
        debug!(command = %command_line(cmd, args), "Running command");
        let output = Command::new(cmd).args(args).output().await?;

        if !output.status.success() {
            return Err(Error::command(
                command_line(cmd, args),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_streaming<'a>(
        &self,
        cmd: &str,
        args: &[&'a str],
        env: &[(&'a str, &'a str)],
    ) -> Result<()> {
        debug!(command = %command_line(cmd, args), "Running command (streaming)");
        let mut command = Command::new(cmd);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let stderr_handle = child.stderr.take();

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                println!("    {}", line);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let stderr_msg = match stderr_handle {
                Some(stderr) => {
                    let mut lines = BufReader::new(stderr).lines();
                    let mut collected = Vec::new();
                    while let Some(line) = lines.next_line().await.ok().flatten() {
                        collected.push(line);
                    }
                    collected.join("\n")
                }
                None => "command failed".to_string(),
            };
            return Err(Error::command(command_line(cmd, args), stderr_msg));
        }

        Ok(())
    }
}

/// A tool the pipeline needs on PATH before it starts
#[derive(Clone, Copy, Debug)]
pub struct ToolSpec {
    /// Binary name
    pub name: &'static str,
    /// Arguments that print its version
    pub version_args: &'static [&'static str],
    /// Install hint shown when the tool is missing
    pub hint: &'static str,
}

/// The tools every pipeline run requires
pub const REQUIRED_TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "gcloud",
        version_args: &["version"],
        hint: "Install the Google Cloud SDK: https://cloud.google.com/sdk/docs/install",
    },
    ToolSpec {
        name: "kubectl",
        version_args: &["version", "--client"],
        hint: "Install kubectl: https://kubernetes.io/docs/tasks/tools/",
    },
    ToolSpec {
        name: "asmcli",
        version_args: &["--version"],
        hint: "Download asmcli: https://cloud.google.com/service-mesh/docs/unified-install/install-dependent-tools",
    },
];

/// Check that every required tool is installed and answers a version probe.
///
/// A tool that is on PATH but fails its version command is reported as a
/// command failure (broken installation), not as missing.
pub async fn check_prerequisites(runner: &dyn CommandRunner, tools: &[ToolSpec]) -> Result<()> {
    println!("=== Checking prerequisites ===\n");

    for tool in tools {
        print!("  Checking {}... ", tool.name);
        if runner.run("which", &[tool.name]).await.is_err() {
            println!("NOT FOUND");
            return Err(Error::PrerequisiteNotFound {
                tool: tool.name.to_string(),
                hint: tool.hint.to_string(),
            });
        }

        let version = runner.run(tool.name, tool.version_args).await?;
        let first_line = version.lines().next().unwrap_or("").trim();
        println!("OK ({})", first_line);
    }

    println!();
    Ok(())
}
