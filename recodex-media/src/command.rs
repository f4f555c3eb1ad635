//! Cancellable runner for the external binaries the pipeline depends on.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::MediaError;

/// One external command invocation. The child is killed when the
/// cancellation token fires or the returned future is dropped.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: PathBuf,
    args: Vec<String>,
    work_dir: Option<PathBuf>,
    allowed_exit_codes: Vec<i32>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            allowed_exit_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Exit codes treated as success (mkvextract reports warnings as 1).
    pub fn allow_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.allowed_exit_codes = codes.into_iter().collect();
        self
    }

    /// Run to completion, capturing stdout. Stderr is buffered and attached
    /// to the error on a disallowed exit code.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Vec<u8>, MediaError> {
        let mut stderr_log = String::new();
        let (stdout, code) = self
            .run_inner(cancel, |chunk| stderr_log.push_str(chunk))
            .await?;
        self.check_exit(code, &stderr_log)?;
        Ok(stdout)
    }

    /// Run to completion, feeding raw stderr chunks to `on_stderr` as they
    /// arrive (ffmpeg reports progress on stderr with carriage returns, so
    /// chunks, not lines).
    pub async fn run_with_stderr<F>(
        &self,
        cancel: &CancellationToken,
        mut on_stderr: F,
    ) -> Result<(), MediaError>
    where
        F: FnMut(&str),
    {
        let mut tail = String::new();
        let (_, code) = self
            .run_inner(cancel, |chunk| {
                on_stderr(chunk);
                push_tail(&mut tail, chunk);
            })
            .await?;
        self.check_exit(code, &tail)
    }

    async fn run_inner<F>(
        &self,
        cancel: &CancellationToken,
        mut on_stderr: F,
    ) -> Result<(Vec<u8>, i32), MediaError>
    where
        F: FnMut(&str),
    {
        debug!(program = %self.program.display(), args = ?self.args, "running external command");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| MediaError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::Io(std::io::Error::other("child stderr unavailable")))?;
        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Io(std::io::Error::other("child stdout unavailable")))?;

        let mut stdout = Vec::new();
        let mut stderr_buf = [0u8; 8192];
        let mut stdout_buf = [0u8; 8192];
        let mut stderr_done = false;
        let mut stdout_done = false;

        while !(stderr_done && stdout_done) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(MediaError::Canceled);
                }
                read = stderr.read(&mut stderr_buf), if !stderr_done => {
                    match read? {
                        0 => stderr_done = true,
                        n => on_stderr(&String::from_utf8_lossy(&stderr_buf[..n])),
                    }
                }
                read = stdout_pipe.read(&mut stdout_buf), if !stdout_done => {
                    match read? {
                        0 => stdout_done = true,
                        n => stdout.extend_from_slice(&stdout_buf[..n]),
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            return Err(MediaError::Canceled);
        };

        Ok((stdout, status.code().unwrap_or(-1)))
    }

    fn check_exit(&self, code: i32, stderr: &str) -> Result<(), MediaError> {
        if self.allowed_exit_codes.contains(&code) {
            return Ok(());
        }
        Err(MediaError::ExitStatus {
            program: self.program.clone(),
            code,
            stderr: stderr.to_string(),
        })
    }
}

/// Keep the last few KiB of stderr for error reporting.
fn push_tail(tail: &mut String, chunk: &str) {
    const TAIL_LIMIT: usize = 8 * 1024;
    tail.push_str(chunk);
    if tail.len() > TAIL_LIMIT {
        let cut = tail.len() - TAIL_LIMIT;
        let boundary = (cut..tail.len())
            .find(|i| tail.is_char_boundary(*i))
            .unwrap_or(tail.len());
        tail.drain(..boundary);
    }
}
