//! Processes started through a command router.

use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::proto::exec_exit_status::ExitStatus as ProtoExitStatus;
use crate::proto::{PtyInfo, PtyType, TaskExecStartRequest, TaskExecStderrConfig, TaskExecStdoutConfig};
use crate::router::{CommandRouterClient, OutputFd};
use crate::stream::{InputStream, OutputStream};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Largest total size of exec arguments, in bytes.
pub const ARG_MAX_BYTES: usize = 1 << 16;

/// What to do with a process's stdout or stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioBehavior {
    /// Make the output readable through an [`OutputStream`].
    #[default]
    Pipe,
    /// Discard the output.
    Ignore,
}

/// Options for starting a process.
#[derive(Debug, Clone, Default)]
pub struct ExecParams {
    pub stdout: StdioBehavior,
    pub stderr: StdioBehavior,
    /// Working directory inside the task.
    pub workdir: Option<String>,
    /// Kill the process after this long. Must be a whole number of seconds.
    pub timeout: Option<Duration>,
    /// Secrets to inject as environment variables.
    pub secret_ids: Vec<String>,
    /// Run inside a pseudo-terminal.
    pub pty: bool,
}

/// How a process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this code.
    Code(i32),
    /// Killed by this signal.
    Signal(i32),
}

impl ExitStatus {
    /// Shell-style exit code: signals map to `128 + signal`.
    pub fn code(&self) -> i32 {
        match *self {
            Self::Code(code) => code,
            Self::Signal(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        *self == Self::Code(0)
    }
}

impl From<ProtoExitStatus> for ExitStatus {
    fn from(status: ProtoExitStatus) -> Self {
        match status {
            ProtoExitStatus::Code(code) => Self::Code(code),
            ProtoExitStatus::Signal(signal) => Self::Signal(signal),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Reject argument lists the remote `exec` would refuse.
pub fn validate_exec_args(args: &[String]) -> Result<()> {
    let total: usize = args.iter().map(String::len).sum();
    if total > ARG_MAX_BYTES {
        return Err(TransportError::InvalidArgument(format!(
            "total length of command arguments must be at most {ARG_MAX_BYTES} bytes, got {total} bytes"
        )));
    }
    Ok(())
}

fn default_pty_info() -> PtyInfo {
    PtyInfo {
        enabled: true,
        winsz_rows: 24,
        winsz_cols: 80,
        env_term: "xterm-256color".into(),
        env_colorterm: "truecolor".into(),
        env_term_program: String::new(),
        pty_type: PtyType::Shell as i32,
        no_terminate_on_idle_stdin: true,
    }
}

/// Build the `TaskExecStart` request for `command`.
pub fn build_exec_start_request(
    task_id: &str,
    exec_id: &str,
    command: &[String],
    params: &ExecParams,
) -> Result<TaskExecStartRequest> {
    let timeout_secs = match params.timeout {
        None => None,
        Some(timeout) if timeout.is_zero() => None,
        Some(timeout) if timeout.subsec_nanos() != 0 => {
            return Err(TransportError::InvalidArgument(format!(
                "timeout must be a whole number of seconds, got {timeout:?}"
            )));
        }
        Some(timeout) => Some(u32::try_from(timeout.as_secs()).map_err(|_| {
            TransportError::InvalidArgument(format!("timeout too large: {timeout:?}"))
        })?),
    };

    let stdout_config = match params.stdout {
        StdioBehavior::Pipe => TaskExecStdoutConfig::Pipe,
        StdioBehavior::Ignore => TaskExecStdoutConfig::Devnull,
    };
    let stderr_config = match params.stderr {
        StdioBehavior::Pipe => TaskExecStderrConfig::Pipe,
        StdioBehavior::Ignore => TaskExecStderrConfig::Devnull,
    };

    Ok(TaskExecStartRequest {
        task_id: task_id.to_string(),
        exec_id: exec_id.to_string(),
        command_args: command.to_vec(),
        stdout_config: stdout_config as i32,
        stderr_config: stderr_config as i32,
        timeout_secs,
        workdir: params.workdir.clone().filter(|w| !w.is_empty()),
        secret_ids: params.secret_ids.clone(),
        pty_info: params.pty.then(default_pty_info),
        runtime_debug: false,
    })
}

/// A process running inside a task.
///
/// Output streams start lazily; a stream that is never read never opens an RPC.
#[derive(Debug)]
pub struct ContainerProcess {
    pub stdin: InputStream,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    client: Arc<CommandRouterClient>,
    exec_id: String,
    deadline: Option<Instant>,
}

impl ContainerProcess {
    /// Validate `command`, start it, and wire up its stdio.
    pub async fn start(
        client: Arc<CommandRouterClient>,
        ctx: &CallContext,
        command: &[String],
        params: &ExecParams,
    ) -> Result<Self> {
        validate_exec_args(command)?;
        let exec_id = Uuid::new_v4().to_string();
        let request = build_exec_start_request(client.task_id(), &exec_id, command, params)?;

        client.exec_start(ctx, request).await?;
        tracing::debug!(task_id = %client.task_id(), exec_id = %exec_id, "Exec started");

        let deadline = params
            .timeout
            .filter(|t| !t.is_zero())
            .and_then(|timeout| Instant::now().checked_add(timeout));

        let output = |behavior: StdioBehavior, fd: OutputFd| match behavior {
            StdioBehavior::Pipe => OutputStream::new(Arc::clone(&client), exec_id.clone(), fd, deadline),
            StdioBehavior::Ignore => OutputStream::empty(),
        };
        let stdout = output(params.stdout, OutputFd::Stdout);
        let stderr = output(params.stderr, OutputFd::Stderr);

        Ok(Self {
            stdin: InputStream::new(Arc::clone(&client), exec_id.clone()),
            stdout,
            stderr,
            client,
            exec_id,
            deadline,
        })
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Absolute deadline derived from the exec timeout, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the process to exit.
    pub async fn wait(&self, ctx: &CallContext) -> Result<ExitStatus> {
        let response = self.client.exec_wait(ctx, &self.exec_id, self.deadline).await?;
        response
            .exit_status
            .map(ExitStatus::from)
            .ok_or_else(|| TransportError::Stream(format!("exec {} finished without an exit status", self.exec_id)))
    }

    /// Exit status if the process has finished, `None` while it is running.
    pub async fn poll(&self, ctx: &CallContext) -> Result<Option<ExitStatus>> {
        let response = self.client.exec_poll(ctx, &self.exec_id, self.deadline).await?;
        Ok(response.exit_status.map(ExitStatus::from))
    }
}
