//! Launching the external backend process that produces or consumes the
//! tunneled bytes.
//!
//! The backend is opaque to the coordinator: it is invoked by name with a
//! tunnel event as its argument and the assigned TCP port in the `PORT`
//! environment variable, and it inherits stdout/stderr. Whether it listens on
//! the port (inbound tunnels) or connects out to it (outbound tunnels) is the
//! event's contract, not ours.

use std::process::Stdio;

use stitch_tasks::TaskExecutor;
use tokio::process::Command;
use tracing::{debug, error};

/// The tunnel event a backend invocation reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// A remote peer opened a tunnel to this node; the backend must listen
    /// on the assigned port.
    IncomingConnection,
    /// A tunnel listener is up for a remote peer; the backend must connect
    /// to the assigned port.
    OutgoingConnection,
}

impl BackendEvent {
    /// The argument passed to the backend command.
    pub const fn as_arg(&self) -> &'static str {
        match self {
            Self::IncomingConnection => "incoming-connection",
            Self::OutgoingConnection => "outgoing-connection",
        }
    }
}

impl std::fmt::Display for BackendEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Failure to run the backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The process could not be started at all.
    #[error("failed to launch backend `{program} {event}`: {source}")]
    Launch {
        /// The configured program.
        program: String,
        /// The event argument.
        event: BackendEvent,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },
    /// The process started but exited unsuccessfully.
    #[error("backend `{program} {event}` exited with {status}")]
    Failed {
        /// The configured program.
        program: String,
        /// The event argument.
        event: BackendEvent,
        /// The child's exit status.
        status: std::process::ExitStatus,
    },
}

/// Invokes the configured backend command for tunnel events.
#[derive(Debug, Clone)]
pub struct BackendLauncher {
    program: String,
}

impl BackendLauncher {
    /// Create a launcher for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The configured program.
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, event: BackendEvent, port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(event.as_arg())
            .env("PORT", port.to_string())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Run the backend and wait for it to exit.
    ///
    /// Used for outgoing tunnels, where the local listener is already up and
    /// the backend is the side that connects to it. A non-zero exit status is
    /// an error.
    pub async fn run(&self, event: BackendEvent, port: u16) -> Result<(), BackendError> {
        debug!(program = %self.program, %event, port, "running backend");
        let status = self
            .command(event, port)
            .status()
            .await
            .map_err(|source| BackendError::Launch {
                program: self.program.clone(),
                event,
                source,
            })?;
        if !status.success() {
            return Err(BackendError::Failed {
                program: self.program.clone(),
                event,
                status,
            });
        }
        Ok(())
    }

    /// Launch the backend without waiting for it.
    ///
    /// Used for incoming tunnels, where the backend opens the listening
    /// socket the forwarder dials into; a launch failure is only observable
    /// as an undialable port, so it is logged here and nowhere else.
    pub fn spawn(&self, executor: &TaskExecutor, event: BackendEvent, port: u16) {
        let launcher = self.clone();
        executor.spawn(async move {
            if let Err(error) = launcher.run(event, port).await {
                error!(%error, "backend launch failed");
            }
        });
    }
}
