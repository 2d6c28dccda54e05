//! One runner invocation and its framed stdout session.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use process_utils::{ProcessGroupExt, kill_tree, tokio_command};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::framing::LineFramer;
use crate::locator::ScriptLocator;
use crate::message::{ProgressUpdate, ScriptMessage, parse_line, parse_untagged_object};
use crate::{Result, SidecarError};

/// Upper bound on the raw stdout kept for diagnostics. The tail is kept.
const RAW_BUFFER_LIMIT: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Arguments for one runner call.
#[derive(Debug, Clone)]
pub struct SidecarRequest {
    /// Script file name relative to the locator's scripts directory.
    pub script: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Accept a bare JSON object as the result when the runner prints no
    /// tagged result line.
    pub untagged_result: bool,
}

impl SidecarRequest {
    pub fn new(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            timeout,
            untagged_result: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn untagged_result(mut self, enabled: bool) -> Self {
        self.untagged_result = enabled;
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
}

/// Spawns a runner, streams its progress and returns its final result.
///
/// A channel holds no per-call state, so one value can serve many calls, but
/// the supervisor creates a fresh one per call anyway.
#[derive(Debug, Clone)]
pub struct SidecarChannel {
    locator: ScriptLocator,
}

impl SidecarChannel {
    pub fn new(locator: ScriptLocator) -> Self {
        Self { locator }
    }

    pub fn locator(&self) -> &ScriptLocator {
        &self.locator
    }

    /// Run the request to completion.
    ///
    /// Progress messages are forwarded to `progress` with `try_send`; a full
    /// or closed receiver drops them. Result and error messages only count
    /// once the process has exited.
    pub async fn invoke(
        &self,
        request: SidecarRequest,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<Value> {
        let runtime = self.locator.resolve_runtime()?;
        let script = self.locator.resolve_script(&request.script)?;

        let mut command = tokio_command(&runtime);
        command
            .arg(&script)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .own_process_group();

        let started = Instant::now();
        let mut child = command.spawn().map_err(SidecarError::Spawn)?;
        let pid = child.id();
        debug!(script = %request.script, ?pid, args = ?request.args, "Spawned runner");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SidecarError::Spawn(std::io::Error::other("stdout not captured")))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(request.script.clone(), stderr));
        }

        let mut session = Session::new(progress).accept_untagged(request.untagged_result);
        let outcome =
            tokio::time::timeout(request.timeout, drive(&mut child, stdout, &mut session)).await;

        match outcome {
            Ok(Ok(status)) => {
                let result = session.into_outcome(status);
                match &result {
                    Ok(_) => info!(
                        script = %request.script,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Runner finished"
                    ),
                    Err(e) => warn!(script = %request.script, error = %e, "Runner failed"),
                }
                result
            }
            Ok(Err(e)) => {
                kill_tree(&mut child).await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    script = %request.script,
                    ?pid,
                    timeout_secs = request.timeout.as_secs(),
                    "Runner timed out, killing process tree"
                );
                kill_tree(&mut child).await;
                Err(SidecarError::Timeout {
                    after: request.timeout,
                })
            }
        }
    }
}

async fn drive<R>(child: &mut Child, mut stdout: R, session: &mut Session) -> Result<ExitStatus>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = stdout.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        session.feed(&chunk[..n]);
    }
    session.finish();
    Ok(child.wait().await?)
}

async fn log_stderr<R>(script: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.to_lowercase().contains("error") {
            warn!(script = %script, "stderr: {}", line);
        } else {
            debug!(script = %script, "stderr: {}", line);
        }
    }
}

/// Per-call state: framer, terminal candidates, and the raw tail.
struct Session {
    framer: LineFramer,
    terminal: Vec<ScriptMessage>,
    /// Last bare JSON object, kept only when untagged results are accepted.
    untagged: Option<Value>,
    accept_untagged: bool,
    raw: String,
    progress: Option<mpsc::Sender<ProgressUpdate>>,
}

impl Session {
    fn new(progress: Option<mpsc::Sender<ProgressUpdate>>) -> Self {
        Self {
            framer: LineFramer::new(),
            terminal: Vec::new(),
            untagged: None,
            accept_untagged: false,
            raw: String::new(),
            progress,
        }
    }

    fn accept_untagged(mut self, enabled: bool) -> Self {
        self.accept_untagged = enabled;
        self
    }

    fn feed(&mut self, chunk: &[u8]) {
        for line in self.framer.push(chunk) {
            self.handle_line(line);
        }
    }

    fn finish(&mut self) {
        if let Some(line) = self.framer.finish() {
            self.handle_line(line);
        }
    }

    fn handle_line(&mut self, line: String) {
        let message = parse_line(&line);
        self.record_raw(&line);

        match message {
            ScriptMessage::Progress(update) => {
                if let Some(tx) = &self.progress
                    && tx.try_send(update).is_err()
                {
                    trace!("Dropped progress update");
                }
            }
            ScriptMessage::Result(_) | ScriptMessage::Error { .. } => {
                self.terminal.push(message);
            }
            ScriptMessage::Unrecognized(line) => {
                if self.accept_untagged
                    && let Some(value) = parse_untagged_object(&line)
                {
                    self.untagged = Some(value);
                } else if !line.trim().is_empty() {
                    debug!("Ignoring runner output: {}", line);
                }
            }
        }
    }

    fn record_raw(&mut self, line: &str) {
        self.raw.push_str(line);
        self.raw.push('\n');
        if self.raw.len() > RAW_BUFFER_LIMIT {
            let mut cut = self.raw.len() - RAW_BUFFER_LIMIT;
            while !self.raw.is_char_boundary(cut) {
                cut += 1;
            }
            self.raw.drain(..cut);
        }
    }

    fn into_outcome(self, status: ExitStatus) -> Result<Value> {
        let Session {
            terminal,
            untagged,
            raw,
            ..
        } = self;

        if status.success() {
            terminal
                .into_iter()
                .rev()
                .find_map(|message| match message {
                    ScriptMessage::Result(value) => Some(value),
                    _ => None,
                })
                .or(untagged)
                .ok_or(SidecarError::Parse { raw })
        } else {
            let script_error = terminal.into_iter().rev().find_map(|message| match message {
                ScriptMessage::Error { message, .. } => Some(message),
                _ => None,
            });
            match script_error {
                Some(message) => Err(SidecarError::Script { message }),
                None => Err(SidecarError::ExitCode {
                    code: status.code(),
                    raw,
                }),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exit(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn test_success_takes_last_result() {
        let mut session = Session::new(None);
        session.feed(b"{\"type\":\"result\",\"n\":1}\n{\"type\":\"result\",\"n\":2}\n");
        let value = session.into_outcome(exit(0)).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn test_success_without_result_is_parse_error() {
        let mut session = Session::new(None);
        session.feed(b"hello\n{\"type\":\"error\",\"message\":\"ignored\"}\n");
        match session.into_outcome(exit(0)) {
            Err(SidecarError::Parse { raw }) => assert!(raw.contains("hello")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_failure_takes_last_error() {
        let mut session = Session::new(None);
        session.feed(b"{\"type\":\"error\",\"message\":\"first\"}\n");
        session.feed(b"{\"type\":\"result\",\"n\":1}\n{\"type\":\"error\",\"message\":\"second\"}");
        session.finish();
        match session.into_outcome(exit(1)) {
            Err(SidecarError::Script { message }) => assert_eq!(message, "second"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_failure_without_error_reports_exit_code() {
        let mut session = Session::new(None);
        session.feed(b"Traceback (most recent call last):\n");
        match session.into_outcome(exit(3)) {
            Err(SidecarError::ExitCode { code, raw }) => {
                assert_eq!(code, Some(3));
                assert!(raw.starts_with("Traceback"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_untagged_object_is_ignored_by_default() {
        let mut session = Session::new(None);
        session.feed(b"{\"tempo\": 120.5, \"key\": \"A minor\"}\n");
        assert!(matches!(
            session.into_outcome(exit(0)),
            Err(SidecarError::Parse { .. })
        ));
    }

    #[test]
    fn test_untagged_object_accepted_when_enabled() {
        let mut session = Session::new(None).accept_untagged(true);
        session.feed(b"loading model\n{\"tempo\": 120.5, \"key\": \"A minor\"}\n");
        let value = session.into_outcome(exit(0)).unwrap();
        assert_eq!(value["tempo"], 120.5);
        assert_eq!(value["key"], "A minor");
    }

    #[test]
    fn test_tagged_result_wins_over_untagged() {
        let mut session = Session::new(None).accept_untagged(true);
        session.feed(b"{\"type\":\"result\",\"n\":1}\n{\"n\":2}\n");
        assert_eq!(session.into_outcome(exit(0)).unwrap()["n"], 1);
    }

    #[test]
    fn test_untagged_object_not_a_result_on_failure() {
        let mut session = Session::new(None).accept_untagged(true);
        session.feed(b"{\"path\": \"/tmp/a.mp3\"}\n");
        assert!(matches!(
            session.into_outcome(exit(1)),
            Err(SidecarError::ExitCode { code: Some(1), .. })
        ));
    }

    #[test]
    fn test_raw_buffer_is_bounded() {
        let mut session = Session::new(None);
        let line = "x".repeat(1000);
        for _ in 0..200 {
            session.record_raw(&line);
        }
        assert!(session.raw.len() <= RAW_BUFFER_LIMIT);
    }

    #[test]
    fn test_progress_forwarded_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut session = Session::new(Some(tx));
        session.feed(b"{\"type\":\"progress\",\"percent\":10}\n{\"type\":\"progress\",\"percent\":20}\n");
        assert_eq!(rx.try_recv().unwrap().percent, 10);
        assert!(rx.try_recv().is_err());
    }
}
