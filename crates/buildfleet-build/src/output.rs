//! Streaming build output
//!
//! A [`BuildOutput`] yields the combined stdout/stderr of a running build one
//! line at a time. Only the last non-blank line is kept around, so memory use
//! does not grow with the length of the build log.

use crate::error::{BuildError, BuildResult};
use futures_util::stream::{self, Stream};
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

/// Lines buffered between the pipe reader and the consumer
const LINE_BUFFER: usize = 256;

/// Reported as the last line of a failed build that printed nothing
pub const NO_OUTPUT: &str = "<no output!>";

type LineStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

enum ExitSource {
    Process(JoinHandle<io::Result<i32>>),
    Fixed(i32),
}

/// Lazy, single-pass sequence of build output lines
///
/// The sequence ends with `Ok(None)` when the build exited with 0. A non-zero
/// exit surfaces as [`BuildError::BuildProcess`] carrying the exit code and
/// the last non-blank line. A failed read of the output pipe surfaces as
/// [`BuildError::Io`].
pub struct BuildOutput {
    lines: mpsc::Receiver<io::Result<String>>,
    exit: Option<ExitSource>,
    last_line: Option<String>,
    finished: bool,
}

impl BuildOutput {
    /// Spawn `command` and stream its combined output
    ///
    /// stdout and stderr share one pipe, so lines arrive in the order the
    /// process wrote them. The child is killed when the output is dropped.
    #[cfg(unix)]
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        use std::os::fd::OwnedFd;
        use tokio::net::unix::pipe;

        let (reader, writer) = io::pipe()?;
        command
            .stdout(Stdio::from(writer.try_clone()?))
            .stderr(Stdio::from(writer))
            .kill_on_drop(true);
        let child = command.spawn()?;
        // the write ends held by `command` must close before EOF can arrive
        drop(command);

        let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        Ok(Self::from_parts(
            lossy_lines(reader),
            ExitSource::Process(wait_for(child)),
        ))
    }

    /// Spawn `command` and stream its combined output
    ///
    /// stdout and stderr are read from separate pipes; lines of the two
    /// streams may interleave differently than the process wrote them.
    #[cfg(not(unix))]
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("build process stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("build process stderr is not piped"))?;

        Ok(Self::from_parts(
            Box::pin(lossy_lines(stdout).merge(lossy_lines(stderr))),
            ExitSource::Process(wait_for(child)),
        ))
    }

    fn from_parts(mut lines: LineStream, exit: ExitSource) -> Self {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        Self {
            lines: rx,
            exit: Some(exit),
            last_line: None,
            finished: false,
        }
    }

    /// Output with predetermined lines and exit code
    pub fn from_lines(lines: Vec<String>, exit_code: i32) -> Self {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // capacity covers every line
            let _ = tx.try_send(Ok(line));
        }

        Self {
            lines: rx,
            exit: Some(ExitSource::Fixed(exit_code)),
            last_line: None,
            finished: false,
        }
    }

    /// Last non-blank line seen so far
    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    /// Next output line, or `Ok(None)` once the build exited successfully
    pub async fn next_line(&mut self) -> BuildResult<Option<String>> {
        if self.finished {
            return Ok(None);
        }

        match self.lines.recv().await {
            Some(Ok(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.trim_start().is_empty() {
                    self.last_line = Some(trimmed.to_string());
                }
                return Ok(Some(line));
            }
            Some(Err(e)) => {
                self.finished = true;
                // the exit code no longer matters; stop waiting for the child
                if let Some(ExitSource::Process(handle)) = self.exit.take() {
                    handle.abort();
                }
                return Err(BuildError::Io(e));
            }
            None => {}
        }

        self.finished = true;
        let code = match self.exit.take() {
            Some(ExitSource::Process(handle)) => handle.await.map_err(io::Error::other)??,
            Some(ExitSource::Fixed(code)) => code,
            None => 0,
        };

        if code != 0 {
            return Err(BuildError::BuildProcess {
                code,
                last_line: self
                    .last_line
                    .take()
                    .unwrap_or_else(|| NO_OUTPUT.to_string()),
            });
        }
        Ok(None)
    }

    /// Adapt into a [`Stream`]; a failed build ends the stream with its error
    pub fn into_stream(self) -> impl Stream<Item = BuildResult<String>> + Send {
        stream::unfold(self, |mut output| async move {
            match output.next_line().await {
                Ok(Some(line)) => Some((Ok(line), output)),
                Ok(None) => None,
                Err(e) => Some((Err(e), output)),
            }
        })
    }
}

impl std::fmt::Debug for BuildOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOutput")
            .field("last_line", &self.last_line)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for BuildOutput {
    fn drop(&mut self) {
        // dropping the waiter drops the child, which is killed on drop
        if let Some(ExitSource::Process(handle)) = self.exit.take() {
            handle.abort();
        }
    }
}

fn wait_for(mut child: Child) -> JoinHandle<io::Result<i32>> {
    tokio::spawn(async move {
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    })
}

/// Lines of `reader`, decoded lossily and stripped of line terminators
///
/// A read error is yielded once and ends the stream.
fn lossy_lines<R>(reader: R) -> LineStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(stream::unfold(
        Some(BufReader::new(reader)),
        |state| async move {
            let mut reader = state?;
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => None,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    Some((Ok(String::from_utf8_lossy(&buf).into_owned()), Some(reader)))
                }
                Err(e) => Some((Err(e), None)),
            }
        },
    ))
}
