use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DetectionBackend, DetectionRequest, RawRun};
use crate::error::{AnalysisError, Stage};

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Per-argument limit (MAX_ARG_STRLEN), including the trailing NUL
#[cfg(target_os = "linux")]
const MAX_ARGUMENT_BYTES: usize = 128 * 1024;

/// How the encoded image reaches the child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageTransport {
    /// Base64 image as the first positional argument
    #[default]
    Argument,
    /// `-` as the first positional argument, base64 image on stdin.
    /// Linux limits one argument to 128 KiB, so large images need this.
    Stdin,
}

impl FromStr for ImageTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "argument" | "arg" | "argv" => Ok(Self::Argument),
            "stdin" => Ok(Self::Stdin),
            other => Err(format!("unknown image transport `{}`", other)),
        }
    }
}

/// Runs the detection routine as a child process.
///
/// The child is started as `program [args..] <image|-> <lat> <lng>`. Stdout and
/// stderr are drained by two separate tasks so neither pipe can fill up and
/// stall the child, and both readers are joined before the exit status is
/// collected.
///
/// On unix the child leads its own process group. Cancelling the run, or
/// dropping it half way, kills the whole group so helpers the routine forked
/// do not outlive it.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    transport: ImageTransport,
    kill_grace: Duration,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            transport: ImageTransport::default(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Arguments placed before the image and coordinates, e.g. the script path
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_transport(mut self, transport: ImageTransport) -> Self {
        self.transport = transport;
        self
    }

    /// How long a cancelled child gets to exit after being killed
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn command(&self, request: &DetectionRequest) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);

        match self.transport {
            ImageTransport::Argument => {
                command.arg(&request.encoded_image).stdin(Stdio::null());
            }
            ImageTransport::Stdin => {
                command.arg("-").stdin(Stdio::piped());
            }
        }

        command
            .arg(request.latitude.to_string())
            .arg(request.longitude.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        command.process_group(0);

        command
    }

    #[cfg(target_os = "linux")]
    fn check_argument_size(&self, request: &DetectionRequest) -> Result<(), AnalysisError> {
        let len = request.encoded_image.len();
        if self.transport == ImageTransport::Argument && len >= MAX_ARGUMENT_BYTES {
            warn!(
                encoded_bytes = len,
                "Encoded image is too large to pass as an argument"
            );
            return Err(AnalysisError::ProcessLaunch {
                program: self.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "encoded image is {} bytes, over the {} byte argument limit; \
                         set DETECTOR_IMAGE_TRANSPORT=stdin",
                        len,
                        MAX_ARGUMENT_BYTES - 1
                    ),
                ),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn check_argument_size(&self, _request: &DetectionRequest) -> Result<(), AnalysisError> {
        Ok(())
    }

    async fn terminate(&self, child: &mut Child, group: GroupKill) {
        group.kill();
        group.disarm();
        if let Err(e) = child.start_kill() {
            debug!("Kill request failed (process may have exited): {}", e);
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Cancelled detection process terminated"),
            Ok(Err(e)) => warn!("Failed to reap cancelled detection process: {}", e),
            Err(_) => warn!(
                grace_ms = self.kill_grace.as_millis() as u64,
                "Cancelled detection process did not exit within grace period"
            ),
        }
    }
}

/// Kills the child's process group when dropped, unless disarmed
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Killed detection process group"),
        // Everyone in the group already exited
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, "Failed to kill detection process group: {}", e),
    }
}

async fn drain<R>(reader: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

fn capture_failure(what: &str, e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::ProcessExecution {
        exit_code: -1,
        stderr: format!("failed to {}: {}", what, e),
        stdout: String::new(),
    }
}

fn stream_text(
    joined: Result<std::io::Result<Vec<u8>>, JoinError>,
    stream: &str,
) -> Result<String, AnalysisError> {
    let bytes = joined
        .map_err(|e| capture_failure(&format!("collect {}", stream), e))?
        .map_err(|e| capture_failure(&format!("read {}", stream), e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl DetectionBackend for ProcessBackend {
    async fn run(
        &self,
        request: &DetectionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawRun, AnalysisError> {
        self.check_argument_size(request)?;

        let mut child = self.command(request).spawn().map_err(|source| {
            warn!(program = %self.program, "Failed to spawn detection process: {}", source);
            AnalysisError::ProcessLaunch {
                program: self.program.clone(),
                source,
            }
        })?;

        debug!(pid = ?child.id(), program = %self.program, "Detection process spawned");
        let group = GroupKill { pgid: child.id() };

        let mut stdin_writer: Option<JoinHandle<std::io::Result<()>>> =
            child.stdin.take().map(|mut stdin| {
                let payload = request.encoded_image.clone();
                tokio::spawn(async move {
                    stdin.write_all(payload.as_bytes()).await?;
                    stdin.shutdown().await
                })
            });
        let mut stdout_reader = tokio::spawn(drain(child.stdout.take()));
        let mut stderr_reader = tokio::spawn(drain(child.stderr.take()));

        let finished = tokio::select! {
            finished = async {
                let (stdout, stderr) = tokio::join!(&mut stdout_reader, &mut stderr_reader);
                let status = child.wait().await;
                (stdout, stderr, status)
            } => Some(finished),
            _ = cancel.cancelled() => None,
        };

        let Some((stdout, stderr, status)) = finished else {
            stdout_reader.abort();
            stderr_reader.abort();
            if let Some(writer) = stdin_writer.take() {
                writer.abort();
            }
            self.terminate(&mut child, group).await;
            return Err(AnalysisError::Cancelled {
                stage: Stage::Detection,
            });
        };
        group.disarm();

        if let Some(writer) = stdin_writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The child may exit without reading all of stdin
                Ok(Err(e)) => debug!("Writing image to detection stdin failed: {}", e),
                Err(e) => debug!("Stdin writer task failed: {}", e),
            }
        }

        let status = status.map_err(|e| capture_failure("wait for detection process", e))?;
        let stdout = stream_text(stdout, "stdout")?;
        let stderr = stream_text(stderr, "stderr")?;

        if !stderr.is_empty() {
            debug!(stderr = %stderr.trim_end(), "Detection process stderr");
        }

        // Killed by a signal when there is no exit code
        let exit_code = status.code().unwrap_or(-1);

        Ok(RawRun {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}
