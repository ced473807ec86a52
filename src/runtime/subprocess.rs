//! Deadline-bounded subprocess execution
//!
//! ctags and git are external collaborators with their own failure modes;
//! every invocation goes through [`run_with_deadline`], which kills the
//! child on timeout or cancellation and never blocks on a full pipe.

use crate::runtime::cancel::CancelToken;
use crate::{SporaError, SporaResult};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured output of a finished subprocess.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, enforcing the wall-clock deadline and the
/// cancellation token. Non-zero exit maps to [`SporaError::SubprocessFailed`].
pub fn run_with_deadline(
    mut cmd: Command,
    tool: &str,
    deadline: Duration,
    cancel: &CancelToken,
) -> SporaResult<ToolOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| SporaError::SubprocessFailed {
        tool: tool.to_string(),
        detail: format!("spawn: {e}"),
    })?;

    // Drain both pipes on their own threads so a chatty child cannot
    // deadlock against the deadline poll below.
    let stdout_reader = spawn_drain(child.stdout.take());
    let stderr_reader = spawn_drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SporaError::SubprocessFailed {
                    tool: tool.to_string(),
                    detail: format!("wait: {e}"),
                });
            }
        }

        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SporaError::Cancelled);
        }
        if started.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SporaError::SubprocessFailed {
                tool: tool.to_string(),
                detail: format!("deadline of {}s exceeded", deadline.as_secs()),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        return Err(SporaError::SubprocessFailed {
            tool: tool.to_string(),
            detail: format!(
                "exit {}: {}",
                status.code().unwrap_or(-1),
                String::from_utf8_lossy(&stderr).trim()
            ),
        });
    }

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn spawn_drain<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}
