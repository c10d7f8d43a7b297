//! Tokio-based command execution with guaranteed kill.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::command::{CommandRecord, CommandSink, CommandSpec, ProcessOutput};

/// Default bound on captured combined output.
pub const DEFAULT_MAX_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command exceeded its budget and was killed.
    #[error("{program} timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        program: String,
        timeout: Duration,
        /// Whatever the process wrote before it was killed.
        output: String,
    },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }
}

/// Boxed future returned by [`CommandRunner`] methods.
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<ProcessOutput, ProcessError>> + Send + 'a>>;

/// Runs external commands. Implemented by [`ProcessRunner`] and by test
/// doubles that script command results.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, cmd: &'a CommandSpec) -> RunFuture<'a>;

    /// Run `cmd` and report the outcome to `sink`, whatever it is.
    fn run_logged<'a>(&'a self, cmd: &'a CommandSpec, sink: &'a dyn CommandSink) -> RunFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.run(cmd).await;
            sink.record(&record_for(cmd, &result, started.elapsed()));
            result
        })
    }
}

fn record_for(
    cmd: &CommandSpec,
    result: &Result<ProcessOutput, ProcessError>,
    elapsed: Duration,
) -> CommandRecord {
    let command_line = cmd.display_line();
    match result {
        Ok(out) => CommandRecord {
            command_line,
            exit_code: out.exit_code,
            timed_out: false,
            output: out.output.clone(),
            elapsed: out.elapsed,
        },
        Err(ProcessError::Timeout { output, .. }) => CommandRecord {
            command_line,
            exit_code: None,
            timed_out: true,
            output: output.clone(),
            elapsed,
        },
        Err(err) => CommandRecord {
            command_line,
            exit_code: None,
            timed_out: false,
            output: err.to_string(),
            elapsed,
        },
    }
}

/// Production runner on `tokio::process`.
///
/// `tokio::time::timeout` around `wait()` would only drop the future and
/// leave the process running, so the timeout branch kills the child
/// explicitly. `kill_on_drop` covers cancellation of the whole future.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }

    async fn execute(&self, cmd: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let started = Instant::now();
        let mut child = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        debug!(command = %cmd.display_line(), pid = ?child.id(), "process spawned");

        let buffer = Mutex::new(OutputBuffer::new(self.max_output));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdin = child.stdin.take();

        let status = tokio::select! {
            result = async {
                let (status, (), (), ()) = tokio::join!(
                    child.wait(),
                    drain(stdout, &buffer),
                    drain(stderr, &buffer),
                    async {
                        if let (Some(pipe), Some(input)) = (stdin.as_mut(), cmd.stdin.as_deref()) {
                            let _ = pipe.write_all(input).await;
                        }
                        // Close stdin so the child sees EOF.
                        drop(stdin.take());
                    },
                );
                status
            } => result.map_err(|source| ProcessError::Wait {
                program: cmd.program.clone(),
                source,
            })?,
            () = tokio::time::sleep(cmd.timeout) => {
                let _ = child.kill().await;
                let output = buffer
                    .into_inner()
                    .map(OutputBuffer::into_string)
                    .unwrap_or_default();
                warn!(
                    command = %cmd.display_line(),
                    timeout_secs = cmd.timeout.as_secs_f64(),
                    "process timed out and was killed"
                );
                return Err(ProcessError::Timeout {
                    program: cmd.program.clone(),
                    timeout: cmd.timeout,
                    output,
                });
            }
        };

        let (output, truncated) = buffer
            .into_inner()
            .map(|b| {
                let truncated = b.truncated;
                (b.into_string(), truncated)
            })
            .unwrap_or_default();
        let elapsed = started.elapsed();
        debug!(
            command = %cmd.display_line(),
            exit_code = ?status.code(),
            elapsed_ms = elapsed.as_millis() as u64,
            truncated,
            "process exited"
        );

        Ok(ProcessOutput {
            exit_code: status.code(),
            output,
            truncated,
            elapsed,
        })
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, cmd: &'a CommandSpec) -> RunFuture<'a> {
        Box::pin(self.execute(cmd))
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, buffer: &Mutex<OutputBuffer>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buffer.lock() {
                    buf.push(&chunk[..n]);
                }
            }
        }
    }
}

/// Keeps the most recent `cap` bytes of output.
struct OutputBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
            self.truncated = true;
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new("sh", timeout).arg("-c").arg(script)
    }

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<CommandRecord>>,
    }

    impl CommandSink for CollectingSink {
        fn record(&self, record: &CommandRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let runner = ProcessRunner::new();
        let out = runner
            .run(&sh("echo out; echo err 1>&2", Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let runner = ProcessRunner::new();
        let out = runner
            .run(&sh("echo nope; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.trimmed(), "nope");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let runner = ProcessRunner::new();
        let started = Instant::now();
        let err = runner
            .run(&sh("echo started; sleep 30", Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ProcessError::Timeout { output, .. } => assert!(output.contains("started")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn output_is_bounded_to_the_tail() {
        let runner = ProcessRunner::new().with_max_output(16);
        let out = runner
            .run(&sh(
                "for i in 1 2 3 4 5 6 7 8 9; do echo line$i; done",
                Duration::from_secs(10),
            ))
            .await
            .unwrap();
        assert!(out.truncated);
        assert!(out.output.len() <= 16);
        assert!(out.output.ends_with("line9\n"));
    }

    #[tokio::test]
    async fn stdin_is_piped_and_closed() {
        let runner = ProcessRunner::new();
        let cmd = CommandSpec::new("cat", Duration::from_secs(10)).stdin("hello from stdin");
        let out = runner.run(&cmd).await.unwrap();
        assert_eq!(out.output, "hello from stdin");
    }

    #[tokio::test]
    async fn env_is_passed_to_child() {
        let runner = ProcessRunner::new();
        let cmd = sh("echo $BERTH_TEST_VALUE", Duration::from_secs(10)).env("BERTH_TEST_VALUE", "42");
        let out = runner.run(&cmd).await.unwrap();
        assert_eq!(out.trimmed(), "42");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = ProcessRunner::new();
        let cmd = CommandSpec::new("/nonexistent/berth-binary", Duration::from_secs(1));
        let err = runner.run(&cmd).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn run_logged_records_every_outcome() {
        let runner = ProcessRunner::new();
        let sink = Arc::new(CollectingSink::default());

        runner
            .run_logged(&sh("echo ok", Duration::from_secs(10)), sink.as_ref())
            .await
            .unwrap();
        let _ = runner
            .run_logged(&sh("sleep 30", Duration::from_millis(200)), sink.as_ref())
            .await;
        let _ = runner
            .run_logged(
                &CommandSpec::new("/nonexistent/berth-binary", Duration::from_secs(1)),
                sink.as_ref(),
            )
            .await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].success());
        assert_eq!(records[0].command_line, "sh -c 'echo ok'");
        assert!(records[1].timed_out);
        assert!(!records[2].success());
        assert!(records[2].output.contains("failed to spawn"));
    }
}
