//! External tool invocation with line-by-line output streaming.
//!
//! Commands are built argv-style; nothing is ever passed through a shell.
//! Both pipes are drained concurrently so a chatty tool cannot block on a
//! full pipe, and every line goes to the caller's sink as it arrives.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::progress::OutputStream;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code}")]
    NonZeroExit { program: String, code: i32 },

    #[error("'{program}' reported a failure: {line}")]
    FailurePattern { program: String, line: String },

    #[error("'{program}' did not produce {path}")]
    MissingOutput { program: String, path: PathBuf },
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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
}

impl std::fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Result of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub program: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// First output line matching a failure pattern.
    pub failure_line: Option<String>,
    /// Last captured output lines, oldest first.
    pub tail: Vec<String>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.failure_line.is_none()
    }

    /// The error describing why this run failed, if it did.
    pub fn failure(&self) -> Option<ToolError> {
        if let Some(line) = &self.failure_line {
            return Some(ToolError::FailurePattern {
                program: self.program.clone(),
                line: line.clone(),
            });
        }
        match self.exit_code {
            Some(0) => None,
            code => Some(ToolError::NonZeroExit {
                program: self.program.clone(),
                code: code.unwrap_or(-1),
            }),
        }
    }

    pub fn tail_text(&self) -> Option<String> {
        if self.tail.is_empty() {
            None
        } else {
            Some(self.tail.join("\n"))
        }
    }
}

/// Keeps the last `capacity` lines.
#[derive(Debug)]
struct LineTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Runs `command` to completion, feeding each output line to `on_line`.
///
/// A non-zero exit is not an error here; inspect [`ToolOutput::failure`].
/// Errors are reserved for a tool that cannot be started or awaited.
pub async fn run_tool<F>(
    command: &ToolCommand,
    failure_patterns: &[Regex],
    tail_lines: usize,
    mut on_line: F,
) -> Result<ToolOutput, ToolError>
where
    F: FnMut(OutputStream, &str),
{
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let (tx, mut rx) = mpsc::channel::<(OutputStream, String)>(64);
    let stdout = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(forward_lines(pipe, OutputStream::Stdout, tx.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(forward_lines(pipe, OutputStream::Stderr, tx.clone())));
    drop(tx);

    let mut tail = LineTail::new(tail_lines);
    let mut failure_line = None;
    while let Some((stream, line)) = rx.recv().await {
        on_line(stream, &line);
        if failure_line.is_none() && failure_patterns.iter().any(|p| p.is_match(&line)) {
            failure_line = Some(line.clone());
        }
        tail.push(line);
    }

    for reader in [stdout, stderr].into_iter().flatten() {
        if let Err(e) = reader.await {
            tracing::warn!(program = %command.program, "Output reader ended abnormally: {}", e);
        }
    }

    let status = child.wait().await.map_err(|source| ToolError::Wait {
        program: command.program.clone(),
        source,
    })?;

    Ok(ToolOutput {
        program: command.program.clone(),
        exit_code: status.code(),
        failure_line,
        tail: tail.into_vec(),
    })
}

async fn forward_lines<R>(pipe: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string();
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?stream, "Stopped reading tool output: {}", e);
                break;
            }
        }
    }
}

/// Compiles the configured failure patterns.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, crate::error::ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| crate::error::ConfigError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}
