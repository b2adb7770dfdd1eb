//! SSH transport backed by libssh2, password-authenticated.

use std::io::Read;
use std::net::TcpStream;

use anyhow::{Context, Result};

use super::{Connector, ExecOutput, Session, SessionError};

/// Connects to the guest's forwarded SSH port with password authentication.
#[derive(Debug, Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl SshConnector {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self) -> Result<SshSession> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .with_context(|| format!("connecting to {}:{}", self.host, self.port))?;
        let mut session = ssh2::Session::new().context("creating SSH session")?;
        session.set_tcp_stream(stream);
        session.handshake().context("SSH handshake")?;
        session
            .userauth_password(&self.user, &self.password)
            .with_context(|| format!("authenticating as '{}'", self.user))?;
        Ok(SshSession { session })
    }
}

/// One authenticated SSH session; each command runs on its own channel with
/// a pty, matching an interactive login shell.
pub struct SshSession {
    session: ssh2::Session,
}

impl Session for SshSession {
    fn exec(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
        let mut channel = self.session.channel_session().map_err(ssh_error)?;
        channel.request_pty("xterm", None, None).map_err(ssh_error)?;
        channel.exec(command).map_err(ssh_error)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(io_error)?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(io_error)?;

        channel.wait_close().map_err(ssh_error)?;
        let exit_status = channel.exit_status().map_err(ssh_error)?;
        Ok(ExecOutput {
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
            exit_status,
        })
    }
}

fn ssh_error(err: ssh2::Error) -> SessionError {
    // libssh2 socket send/disconnect/recv codes: the transport is gone.
    match err.code() {
        ssh2::ErrorCode::Session(-7) | ssh2::ErrorCode::Session(-13)
        | ssh2::ErrorCode::Session(-43) => SessionError::ConnectionClosed,
        _ => SessionError::Transport(anyhow::Error::new(err)),
    }
}

fn io_error(err: std::io::Error) -> SessionError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => SessionError::ConnectionClosed,
        _ => SessionError::Transport(anyhow::Error::new(err)),
    }
}
