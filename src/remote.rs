// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote host access.
//!
//! Spread never speaks the SSH protocol itself. Everything it needs from a
//! remote host boils down to four primitives: open a session with a private
//! key, open a session with a password, run a command, and upload a byte
//! stream to a path. The [`Transport`] and [`RemoteSession`] traits describe
//! exactly that, and [`ssh::Ssh2Transport`] implements them through libssh2.
//!
//! # Modules
//!
//! - [`auth`]: credential fallback that turns a server profile into a session.
//! - [`commit`]: upload to a temporary path followed by a privileged rename.
//! - [`ssh`]: libssh2 backed transport.

pub mod auth;
pub mod commit;
pub mod ssh;

use crate::remote::auth::KeyMaterial;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::Read,
    path::Path,
};

/// Address and login of a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,

    /// SSH port.
    pub port: u16,

    /// Login user.
    pub user: String,
}

impl Display for Endpoint {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote host.
    pub exit_status: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Check if command exited with zero status.
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Live authenticated connection to one remote host.
///
/// A session is exclusively owned by the push sequence that opened it.
pub trait RemoteSession: Send {
    /// Run a command, optionally feeding `stdin` to it.
    fn run_command(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;

    /// Upload byte stream to remote path, returning number of bytes written.
    fn upload(&mut self, content: &mut dyn Read, remote_path: &Path) -> Result<u64>;

    /// Tear down session.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory for authenticated sessions.
pub trait Transport: Send + Sync + 'static {
    /// Session type produced by this transport.
    type Session: RemoteSession + 'static;

    /// Open session authenticated with private key.
    fn open_with_key(
        &self,
        endpoint: &Endpoint,
        key: &KeyMaterial,
    ) -> std::result::Result<Self::Session, AttemptError>;

    /// Open session authenticated with password.
    fn open_with_password(
        &self,
        endpoint: &Endpoint,
        password: &str,
    ) -> std::result::Result<Self::Session, AttemptError>;
}

/// Outcome of a single failed authentication attempt.
///
/// Keeps server side rejection apart from local key problems, so the
/// credential fallback can decide on typed outcomes.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// Server refused the credential.
    #[error("server rejected credential: {0}")]
    Rejected(String),

    /// Key material is malformed, or passphrase is wrong.
    #[error("cannot load private key: {0}")]
    KeyLoad(String),

    /// Transport level failure.
    #[error(transparent)]
    Protocol(#[from] TransportError),
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: impl AsRef<str>) -> String {
    format!("'{}'", arg.as_ref().replace('\'', "'\\''"))
}

/// Quote and join arguments into one POSIX shell command line.
pub fn shell_join(args: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    args.into_iter()
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Host name did not resolve to any address.
    #[error("cannot resolve address of {endpoint}")]
    Resolve { endpoint: String },

    /// TCP connection could not be established.
    #[error("cannot connect to {endpoint}")]
    Connect {
        #[source]
        source: std::io::Error,
        endpoint: String,
    },

    /// Session was already closed.
    #[error("session is closed")]
    Closed,

    /// Failure reported by libssh2.
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    /// Failure while streaming data over a channel.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
