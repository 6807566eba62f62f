//! Child process runner
//!
//! One-shot commands run with a hard deadline; exceeding it kills the child
//! (kill-on-drop) and converts to a `timeout` error. Long-running children
//! (video streams, recorders, log followers) are handed back to an owning
//! task that reaps them.

use crate::error::{Error, Result};
use log::debug;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status: i32,
    pub duration: Duration,
}

impl CmdOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run a command to completion under a deadline.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<CmdOutput> {
    let start = Instant::now();
    debug!("exec: {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(Error::Io(e)),
        // Dropping the in-flight future drops the child; kill_on_drop reaps it.
        Err(_) => {
            return Err(Error::Timeout(format!(
                "{} {} exceeded {:?}",
                program,
                args.join(" "),
                timeout
            )))
        }
    };

    Ok(CmdOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status.code().unwrap_or(-1),
        duration: start.elapsed(),
    })
}

/// Run a command and require a zero exit status.
pub async fn run_ok(program: &str, args: &[&str], timeout: Duration) -> Result<CmdOutput> {
    let out = run(program, args, timeout).await?;
    if out.status != 0 {
        return Err(Error::Driver(format!(
            "{} {} exited {}: {}",
            program,
            args.join(" "),
            out.status,
            out.stderr.trim()
        )));
    }
    Ok(out)
}

/// Spawn a long-running child with piped stdout. The caller owns the child
/// and must reap it; kill-on-drop guarantees it cannot outlive its owner.
pub fn spawn_streaming(program: &str, args: &[&str]) -> Result<Child> {
    debug!("spawn: {} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))
}

fn spawn_error(program: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::Driver(format!("{} not found on host", program))
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_is_a_driver_error() {
        let err = run("simbridge-no-such-tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "host-driver");
    }

    #[tokio::test]
    async fn deadline_converts_to_timeout() {
        let err = run("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn nonzero_exit_is_rejected_by_run_ok() {
        let err = run_ok("sh", &["-c", "exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "host-driver");
    }

    #[tokio::test]
    async fn stdout_is_captured() {
        let out = run_ok("sh", &["-c", "printf hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout_str(), "hello");
        assert_eq!(out.status, 0);
    }
}
