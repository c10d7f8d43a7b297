//! Command description, captured output, and audit records.

use std::fmt;
use std::time::Duration;

/// An external command to run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Argument positions whose values are replaced by `***` in logs.
    pub redacted_args: Vec<usize>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout,
            redacted_args: Vec::new(),
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

    /// Add an argument that must not appear in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.redacted_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child. Values never appear in logs.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Command line suitable for logs, with secret arguments masked.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for (i, arg) in self.args.iter().enumerate() {
            line.push(' ');
            if self.redacted_args.contains(&i) {
                line.push_str("***");
            } else if arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Interleaved stdout and stderr, keeping the most recent bytes.
    pub output: String,
    /// True if older output was dropped to respect the buffer bound.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Output with surrounding whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

/// Audit entry for one command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub command_line: String,
    /// `None` when the command timed out or failed to spawn.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
    pub elapsed: Duration,
}

impl CommandRecord {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$ {}", self.command_line)?;
        if self.timed_out {
            write!(f, " [timed out after {:.1}s]", self.elapsed.as_secs_f64())?;
        } else {
            match self.exit_code {
                Some(code) => write!(f, " [exit {code}]")?,
                None => write!(f, " [killed]")?,
            }
        }
        let output = self.output.trim_end();
        if !output.is_empty() {
            write!(f, "\n{output}")?;
        }
        Ok(())
    }
}

/// Receives an audit record for every command a runner executes.
pub trait CommandSink: Send + Sync {
    fn record(&self, record: &CommandRecord);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_line_masks_secrets_and_quotes_spaces() {
        let spec = CommandSpec::new("openstack", Duration::from_secs(5))
            .args(["server", "create"])
            .arg("--password")
            .secret_arg("hunter2")
            .arg("my server");
        assert_eq!(
            spec.display_line(),
            "openstack server create --password *** 'my server'"
        );
    }

    #[test]
    fn record_display_shows_status() {
        let record = CommandRecord {
            command_line: "docker ps".to_string(),
            exit_code: Some(1),
            timed_out: false,
            output: "boom\n".to_string(),
            elapsed: Duration::from_millis(20),
        };
        assert_eq!(record.to_string(), "$ docker ps [exit 1]\nboom");
        assert!(!record.success());

        let timed_out = CommandRecord {
            timed_out: true,
            exit_code: None,
            output: String::new(),
            ..record
        };
        assert_eq!(timed_out.to_string(), "$ docker ps [timed out after 0.0s]");
    }
}
