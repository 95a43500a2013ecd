//! Helpers intended for [`std::process::Command`].
//!
//! Arguments are always passed as a discrete argument vector; the shell is
//! never involved.  The quoted rendering from [`CommandRunExt::to_string_pretty`]
//! is for humans only.

use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

/// Extension trait for running external tools.
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Render the program and its arguments as a single shell-quoted string.
    fn to_string_pretty(&self) -> String;

    /// Execute the child process, capturing stdout and stderr.  A non-zero
    /// exit status is turned into an error which includes the captured stderr.
    fn run_capture_output(&mut self) -> Result<Output>;

    /// Execute the child process, discarding stdout; stderr is only used
    /// for the error message.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout, which must be UTF-8.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and parse its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                match shlex::try_quote(&arg) {
                    Ok(quoted) => quoted.into_owned(),
                    // Only fails on interior NUL, which can't reach a child anyway
                    Err(_) => arg.into_owned(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn run_capture_output(&mut self) -> Result<Output> {
        let output = self
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} failed: {}: {}",
                self.to_string_pretty(),
                output.status,
                stderr.trim()
            );
        }
        Ok(output)
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        self.run_capture_output().map(|_| ())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let output = self.run_capture_output()?;
        String::from_utf8(output.stdout)
            .with_context(|| format!("Parsing output of {}", self.to_string_pretty()))
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let output = self.run_capture_output()?;
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Parsing JSON output of {}", self.to_string_pretty()))
    }
}
