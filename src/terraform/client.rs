use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TerraformSection;
use crate::errors::TerraformError;
use crate::jobs::OutputHandler;
use crate::models::JobInfo;

/// One line of process output, or the terminal error of the run.
pub type Line = Result<String, TerraformError>;

/// Lines buffered toward the caller before the copiers wait on it.
const LINE_BUFFER: usize = 256;

/// How long a cancelled run waits for its output pipes to drain.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A single Terraform invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub job_id: String,
    pub job_info: JobInfo,
    /// Working directory.
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Terraform version; `None` uses the configured default.
    pub version: Option<String>,
}

/// Runs Terraform subprocesses and streams their output.
///
/// Every stdout and stderr line goes to the returned channel and to the
/// [`OutputHandler`] under the request's job id as soon as it is read.
/// The channel always closes when the process is done; a failed spawn,
/// non-zero exit or cancellation is delivered as a final `Err` line.
#[derive(Clone)]
pub struct AsyncClient {
    bin_dir: Option<PathBuf>,
    default_version: Option<String>,
    plugin_cache_dir: Option<PathBuf>,
    binary_override: Option<PathBuf>,
    output: OutputHandler,
}

impl AsyncClient {
    pub fn new(config: &TerraformSection, output: OutputHandler) -> Self {
        Self {
            bin_dir: config.bin_dir.clone(),
            default_version: config.default_version.clone(),
            plugin_cache_dir: config.plugin_cache_dir.clone(),
            binary_override: None,
            output,
        }
    }

    /// Run `binary` for every request regardless of version.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary_override = Some(binary.into());
        self
    }

    pub fn output(&self) -> &OutputHandler {
        &self.output
    }

    /// Binary used for `version`: `<bin_dir>/terraform<version>` when a
    /// version is known, else `terraform` from `bin_dir` or `PATH`.
    pub fn binary_for(&self, version: Option<&str>) -> PathBuf {
        if let Some(binary) = &self.binary_override {
            return binary.clone();
        }
        let version = version.or(self.default_version.as_deref());
        match (&self.bin_dir, version) {
            (Some(dir), Some(v)) => dir.join(format!("terraform{}", v)),
            (Some(dir), None) => dir.join("terraform"),
            (None, _) => PathBuf::from("terraform"),
        }
    }

    /// Start the command and return its output channel.
    pub fn run_command(&self, cancel: CancellationToken, req: CommandRequest) -> mpsc::Receiver<Line> {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let binary = self.binary_for(req.version.as_deref());
        let plugin_cache_dir = self.plugin_cache_dir.clone();
        let output = self.output.clone();
        tokio::spawn(async move {
            run(binary, plugin_cache_dir, req, output, tx, cancel).await;
        });
        rx
    }

    /// Run the command and collect its output, failing on the terminal error.
    pub async fn run_to_completion(
        &self,
        cancel: CancellationToken,
        req: CommandRequest,
    ) -> Result<String, TerraformError> {
        let mut rx = self.run_command(cancel, req);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line?);
        }
        Ok(lines.join("\n"))
    }
}

async fn run(
    binary: PathBuf,
    plugin_cache_dir: Option<PathBuf>,
    req: CommandRequest,
    output: OutputHandler,
    tx: mpsc::Sender<Line>,
    cancel: CancellationToken,
) {
    let command = std::iter::once(binary.display().to_string())
        .chain(req.args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");

    let mut cmd = Command::new(&binary);
    cmd.args(&req.args)
        .current_dir(&req.path)
        .envs(&req.env)
        .env("TF_IN_AUTOMATION", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &plugin_cache_dir {
        cmd.env("TF_PLUGIN_CACHE_DIR", dir);
    }

    tracing::info!(job_id = %req.job_id, path = %req.path.display(), command = %command, "starting terraform");

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = TerraformError::Spawn { binary, source };
            tracing::error!(job_id = %req.job_id, error = %err, "terraform spawn failed");
            let _ = tx.send(Err(err)).await;
            return;
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        let _ = tx
            .send(Err(TerraformError::Build("child output was not piped".into())))
            .await;
        return;
    };

    let stdout_task = tokio::spawn(copy_lines(
        stdout,
        tx.clone(),
        output.clone(),
        req.job_id.clone(),
        req.job_info.clone(),
        cancel.clone(),
    ));
    let stderr_task = tokio::spawn(copy_lines(
        stderr,
        tx.clone(),
        output,
        req.job_id.clone(),
        req.job_info.clone(),
        cancel.clone(),
    ));

    let aborts = [stdout_task.abort_handle(), stderr_task.abort_handle()];

    // Both pipes must be drained before waiting on the child.
    let copiers = async move {
        let (out, err) = tokio::join!(stdout_task, stderr_task);
        [out, err]
            .into_iter()
            .find_map(|joined| match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(TerraformError::Io(e)),
                Err(e) => Some(TerraformError::Io(std::io::Error::other(e))),
            })
    };
    tokio::pin!(copiers);

    let (cancelled, copy_error) = tokio::select! {
        copy_error = &mut copiers => (false, copy_error),
        _ = cancel.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(job_id = %req.job_id, error = %e, "failed to kill terraform");
            }
            // A descendant may still hold the pipes open after the kill.
            if tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, &mut copiers).await.is_err() {
                tracing::warn!(job_id = %req.job_id, "output pipes still open after kill; abandoning them");
                aborts.iter().for_each(|a| a.abort());
            }
            (true, None)
        }
    };

    let status = child.wait().await;

    let terminal = if cancelled {
        Some(TerraformError::Cancelled { command })
    } else if let Some(e) = copy_error {
        Some(e)
    } else {
        match status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(TerraformError::NonZeroExit {
                command,
                path: req.path.clone(),
                code: status.code(),
            }),
            Err(e) => Some(TerraformError::Io(e)),
        }
    };

    match terminal {
        Some(err) => {
            tracing::warn!(job_id = %req.job_id, error = %err, "terraform command failed");
            if cancelled {
                // A cancelled caller may no longer be reading.
                let _ = tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, tx.send(Err(err))).await;
            } else {
                let _ = tx.send(Err(err)).await;
            }
        }
        None => tracing::info!(job_id = %req.job_id, "terraform command finished"),
    }
}

/// Forward every line of `reader` to the job and to the caller until EOF.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the copy,
/// so the pipe is always drained. Once `cancel` fires the caller is no
/// longer waited on; the job still gets every line.
async fn copy_lines<R>(
    reader: R,
    tx: mpsc::Sender<Line>,
    output: OutputHandler,
    job_id: String,
    job_info: JobInfo,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = decode_line(&buf);
        output.send(&job_id, &job_info, line.clone());
        if cancel.is_cancelled() {
            continue;
        }
        // The caller may have stopped listening; the job still gets the line.
        tokio::select! {
            _ = tx.send(Ok(line)) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::jobs::NoopStorageBackend;
    use crate::models::PullInfo;

    fn job_info() -> JobInfo {
        JobInfo {
            pull: PullInfo {
                repo_full_name: "owner/repo".into(),
                pull_num: 1,
            },
            project_path: ".".into(),
            workspace: "default".into(),
            head_commit: "abc123".into(),
        }
    }

    fn shell_client() -> (AsyncClient, CancellationToken) {
        let output = OutputHandler::new(Arc::new(NoopStorageBackend), 100);
        let cancel = CancellationToken::new();
        let h = output.clone();
        let c = cancel.clone();
        tokio::spawn(async move { h.handle(c).await });
        let client = AsyncClient::new(&TerraformSection::default(), output).with_binary("sh");
        (client, cancel)
    }

    fn script(job_id: &str, body: &str) -> CommandRequest {
        CommandRequest {
            job_id: job_id.to_string(),
            job_info: job_info(),
            path: std::env::temp_dir(),
            args: vec!["-c".into(), body.into()],
            env: HashMap::new(),
            version: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Line>) -> (Vec<String>, Option<TerraformError>) {
        let mut lines = Vec::new();
        let mut terminal = None;
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(line) = rx.recv().await {
                match line {
                    Ok(l) => lines.push(l),
                    Err(e) => terminal = Some(e),
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "output channel must close");
        (lines, terminal)
    }

    #[test]
    fn test_binary_for_versions() {
        let output = OutputHandler::new(Arc::new(NoopStorageBackend), 1);
        let config = TerraformSection {
            bin_dir: Some(PathBuf::from("/opt/tf")),
            default_version: Some("1.7.5".into()),
            ..Default::default()
        };
        let client = AsyncClient::new(&config, output.clone());
        assert_eq!(client.binary_for(None), PathBuf::from("/opt/tf/terraform1.7.5"));
        assert_eq!(client.binary_for(Some("1.5.0")), PathBuf::from("/opt/tf/terraform1.5.0"));

        let bare = AsyncClient::new(&TerraformSection::default(), output);
        assert_eq!(bare.binary_for(Some("1.5.0")), PathBuf::from("terraform"));
    }

    #[tokio::test]
    async fn test_streams_stdout_and_stderr_to_caller_and_job() {
        let (client, _cancel) = shell_client();
        let rx = client.run_command(
            CancellationToken::new(),
            script("job-1", "echo out1; echo err1 1>&2; echo out2"),
        );
        let (mut lines, terminal) = collect(rx).await;
        assert!(terminal.is_none());
        lines.sort();
        assert_eq!(lines, vec!["err1", "out1", "out2"]);

        client.output().flush().await;
        let (mut job_lines, _) = client.output().job_output("job-1").await.unwrap();
        job_lines.sort();
        assert_eq!(job_lines, lines);
    }

    #[tokio::test]
    async fn test_stdout_order_is_preserved() {
        let (client, _cancel) = shell_client();
        let rx = client.run_command(CancellationToken::new(), script("job", "for i in 1 2 3 4 5; do echo $i; done"));
        let (lines, _) = collect(rx).await;
        assert_eq!(lines, vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_terminal_error() {
        let (client, _cancel) = shell_client();
        let rx = client.run_command(CancellationToken::new(), script("job", "echo partial; exit 3"));
        let (lines, terminal) = collect(rx).await;
        assert_eq!(lines, vec!["partial"]);
        match terminal {
            Some(TerraformError::NonZeroExit { code, .. }) => assert_eq!(code, Some(3)),
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal_error() {
        let (client, _cancel) = shell_client();
        let client = client.with_binary("/nonexistent/terraform-binary");
        let rx = client.run_command(CancellationToken::new(), script("job", "true"));
        let (lines, terminal) = collect(rx).await;
        assert!(lines.is_empty());
        assert!(matches!(terminal, Some(TerraformError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let (client, _cancel) = shell_client();
        let cancel = CancellationToken::new();
        let rx = client.run_command(cancel.clone(), script("job", "echo started; exec sleep 30"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let (_, terminal) = collect(rx).await;
        assert!(matches!(terminal, Some(TerraformError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_the_stream() {
        let (client, _cancel) = shell_client();
        let rx = client.run_command(
            CancellationToken::new(),
            script("job-bytes", "printf 'caf\\377\\n'; printf 'crlf\\r\\n'; for i in 1 2 3; do echo after$i; done; exit 0"),
        );
        let (lines, terminal) = collect(rx).await;
        assert!(terminal.is_none(), "unexpected terminal error: {:?}", terminal);
        assert_eq!(lines, vec!["caf\u{FFFD}", "crlf", "after1", "after2", "after3"]);

        client.output().flush().await;
        let (job_lines, _) = client.output().job_output("job-bytes").await.unwrap();
        assert_eq!(job_lines, lines);
    }

    #[test]
    fn test_decode_line_trims_line_endings() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"windows\r\n"), "windows");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\xffx\n"), "\u{FFFD}x");
    }

    #[tokio::test]
    async fn test_cancelled_copier_does_not_wait_on_caller() {
        let (client, _cancel) = shell_client();
        let (tx, _undrained) = mpsc::channel(1);
        tx.send(Ok("fills the channel".to_string())).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let input: &[u8] = b"one\ntwo\nthree\n";
        tokio::time::timeout(
            Duration::from_secs(5),
            copy_lines(input, tx, client.output().clone(), "job-c".into(), job_info(), cancel),
        )
        .await
        .expect("copier must finish without a reader")
        .unwrap();

        client.output().flush().await;
        let (job_lines, _) = client.output().job_output("job-c").await.unwrap();
        assert_eq!(job_lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_automation_env_is_set() {
        let (client, _cancel) = shell_client();
        let mut req = script("job", "echo $TF_IN_AUTOMATION $EXTRA");
        req.env.insert("EXTRA".into(), "yes".into());
        let out = client
            .run_to_completion(CancellationToken::new(), req)
            .await
            .unwrap();
        assert_eq!(out, "true yes");
    }

    #[tokio::test]
    async fn test_run_to_completion_returns_error() {
        let (client, _cancel) = shell_client();
        let err = client
            .run_to_completion(CancellationToken::new(), script("job", "exit 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TerraformError::NonZeroExit { .. }));
    }
}
