//! Remote shell transport used by the provisioning runner.
//!
//! The runner needs exactly two operations: attempt a connection, and run a
//! command over an open session. Both sit behind traits so the reconnect
//! state machine can be driven against an in-memory endpoint.
//!
//! A command's non-zero exit status is not an error at this layer; callers
//! read [`ExecOutput`] and decide. Transport failures are: during
//! `connect`, "guest not reachable yet"; during `exec`, a [`SessionError`],
//! where [`SessionError::ConnectionClosed`] is the structured signal that
//! the peer went away (e.g. the guest powered off).

use std::fmt;

use anyhow::Result;

mod ssh;

pub use ssh::{SshConnector, SshSession};

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// Transport failure on an open session.
#[derive(Debug)]
pub enum SessionError {
    /// The peer closed the connection.
    ConnectionClosed,
    /// Any other transport failure.
    Transport(anyhow::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ConnectionClosed => write!(f, "connection closed by peer"),
            SessionError::Transport(err) => write!(f, "transport failure: {err:#}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// A live command session with the guest.
pub trait Session {
    /// Execute a command and collect its output. Remote command failure is
    /// reported through [`ExecOutput::exit_status`], not as an `Err`.
    fn exec(&mut self, command: &str) -> Result<ExecOutput, SessionError>;
}

/// Connection factory; one successful `connect` yields one [`Session`].
pub trait Connector {
    type Session: Session;

    /// Attempt a connection. Failure means "guest not reachable yet" to the
    /// provisioning runner, which retries indefinitely.
    fn connect(&self) -> Result<Self::Session>;
}
