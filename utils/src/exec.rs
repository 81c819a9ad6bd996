// Copyright 2020 Ant Financial. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Host command execution behind a capability trait so tests can substitute
//! a scripted runner.

use std::fmt;
use std::io;
use std::process::{Command, Stdio};

/// A host command failed. Carries the combined stdout/stderr of the tool so
/// callers can surface the diagnostic.
#[derive(Debug)]
pub struct ExecError {
    pub status: Option<i32>,
    pub output: String,
    pub source: Option<io::Error>,
}

impl ExecError {
    pub fn spawn(err: io::Error) -> Self {
        ExecError {
            status: None,
            output: String::new(),
            source: Some(err),
        }
    }

    pub fn failed(status: Option<i32>, output: String) -> Self {
        ExecError {
            status,
            output,
            source: None,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.source, self.status) {
            (Some(e), _) => write!(f, "failed to spawn command: {}", e),
            (None, Some(code)) => write!(f, "exit status {}: {}", code, self.output.trim_end()),
            (None, None) => write!(f, "killed by signal: {}", self.output.trim_end()),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as _)
    }
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Capability for running host tools (`mount`, `mkfs.ext4`, `cp`, ...).
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` through the shell, returning combined stdout+stderr.
    fn run(&self, cmd: &str) -> ExecResult<String>;
}

/// Production runner: `sh -c <cmd>` with captured output.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &str) -> ExecResult<String> {
        info!("exec `{}`", cmd);

        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(ExecError::spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr);

        if !output.status.success() {
            return Err(ExecError::failed(output.status.code(), combined));
        }

        Ok(combined)
    }
}
