// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! SSH transport through libssh2.

use crate::remote::{
    auth::KeyMaterial, AttemptError, CommandOutput, Endpoint, RemoteSession, Result, Transport,
    TransportError,
};

use ssh2::{ErrorCode, Session};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    path::Path,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

// Raw libssh2 error codes, see `libssh2.h`.
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

/// Pause between polls of a channel that has no data ready.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Transport that opens libssh2 sessions over plain TCP.
#[derive(Debug, Default, Clone)]
pub struct Ssh2Transport {
    timeout: Option<Duration>,
}

impl Ssh2Transport {
    /// Construct new transport.
    ///
    /// The optional `timeout` bounds the TCP connect to each resolved
    /// address, and every blocking libssh2 call. Without it the operating
    /// system defaults apply.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    #[instrument(skip(self), level = "debug")]
    fn handshake(&self, endpoint: &Endpoint) -> Result<Session> {
        let addresses = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Connect {
                source,
                endpoint: endpoint.to_string(),
            })?;
        let stream = connect_any(addresses, self.timeout, endpoint)?;

        let mut session = Session::new()?;
        if let Some(timeout) = self.timeout {
            session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        }
        session.set_tcp_stream(stream);
        session.handshake()?;
        debug!("handshake with {endpoint} complete");

        Ok(session)
    }
}

/// Connect to the first address that accepts, in resolver order.
///
/// # Errors
///
/// - Return [`TransportError::Resolve`] if there are no addresses.
/// - Return [`TransportError::Connect`] with the last failure if every
///   address refused.
fn connect_any(
    addresses: impl IntoIterator<Item = SocketAddr>,
    timeout: Option<Duration>,
    endpoint: &Endpoint,
) -> Result<TcpStream> {
    let mut last_error = None;
    for address in addresses {
        let result = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&address, timeout),
            None => TcpStream::connect(address),
        };

        match result {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!("cannot connect to {address} for {endpoint}: {error}");
                last_error = Some(error);
            }
        }
    }

    Err(match last_error {
        Some(source) => TransportError::Connect {
            source,
            endpoint: endpoint.to_string(),
        },
        None => TransportError::Resolve {
            endpoint: endpoint.to_string(),
        },
    })
}

impl Transport for Ssh2Transport {
    type Session = Ssh2Session;

    fn open_with_key(
        &self,
        endpoint: &Endpoint,
        key: &KeyMaterial,
    ) -> std::result::Result<Self::Session, AttemptError> {
        let session = self.handshake(endpoint)?;
        session
            .userauth_pubkey_memory(&endpoint.user, None, key.private_key(), key.passphrase())
            .map_err(classify)?;

        authenticated(session)
    }

    fn open_with_password(
        &self,
        endpoint: &Endpoint,
        password: &str,
    ) -> std::result::Result<Self::Session, AttemptError> {
        let session = self.handshake(endpoint)?;
        session
            .userauth_password(&endpoint.user, password)
            .map_err(classify)?;

        authenticated(session)
    }
}

fn authenticated(session: Session) -> std::result::Result<Ssh2Session, AttemptError> {
    if !session.authenticated() {
        return Err(AttemptError::Rejected("session not authenticated".into()));
    }

    Ok(Ssh2Session {
        session: Some(session),
    })
}

fn classify(error: ssh2::Error) -> AttemptError {
    match error.code() {
        ErrorCode::Session(LIBSSH2_ERROR_FILE) => AttemptError::KeyLoad(error.message().into()),
        ErrorCode::Session(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED
            | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
            | LIBSSH2_ERROR_PASSWORD_EXPIRED,
        ) => AttemptError::Rejected(error.message().into()),
        _ => AttemptError::Protocol(error.into()),
    }
}

/// Authenticated libssh2 session.
pub struct Ssh2Session {
    session: Option<Session>,
}

impl Ssh2Session {
    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(TransportError::Closed)
    }
}

impl RemoteSession for Ssh2Session {
    fn run_command(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let session = self.session()?;
        let mut channel = session.channel_session()?;
        channel.exec(command)?;
        if let Some(input) = stdin {
            channel.write_all(input)?;
        }
        channel.send_eof()?;

        let timeout = match session.timeout() {
            0 => None,
            millis => Some(Duration::from_millis(millis.into())),
        };

        // INVARIANT: Drain stdout and stderr together, the remote side stalls
        // once either stream fills its channel window.
        session.set_blocking(false);
        let drained = drain_streams(
            &mut channel.stream(0),
            &mut channel.stderr(),
            || channel.eof(),
            timeout,
        );
        session.set_blocking(true);
        let (stdout, stderr) = drained?;
        channel.wait_close()?;

        let signal = channel.exit_signal()?.exit_signal;
        let (exit_status, stderr) = exit_outcome(
            channel.exit_status()?,
            signal.as_deref(),
            String::from_utf8_lossy(&stderr).into_owned(),
        );

        Ok(CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
        })
    }

    fn upload(&mut self, content: &mut dyn Read, remote_path: &Path) -> Result<u64> {
        let sftp = self.session()?.sftp()?;
        let mut file = sftp.create(remote_path)?;
        let written = io::copy(content, &mut file)?;
        file.flush()?;

        Ok(written)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.disconnect(None, "deployment finished", None)?;
        }

        Ok(())
    }
}

/// Read two non-blocking streams in turn until `eof` reports the end.
///
/// Fails with [`ErrorKind::TimedOut`] if neither stream makes progress for
/// `timeout`.
fn drain_streams<O, E>(
    stdout: &mut O,
    stderr: &mut E,
    mut eof: impl FnMut() -> bool,
    timeout: Option<Duration>,
) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    O: Read,
    E: Read,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buffer = [0u8; 16 * 1024];
    let mut idle_since = Instant::now();

    loop {
        let progressed = read_chunk(stdout, &mut buffer, &mut out)?
            | read_chunk(stderr, &mut buffer, &mut err)?;
        if progressed {
            idle_since = Instant::now();
            continue;
        }

        if eof() {
            return Ok((out, err));
        }

        if timeout.is_some_and(|timeout| idle_since.elapsed() >= timeout) {
            return Err(io::Error::new(
                ErrorKind::TimedOut,
                "remote command stalled without output",
            ));
        }

        thread::sleep(IDLE_POLL);
    }
}

fn read_chunk(reader: &mut impl Read, buffer: &mut [u8], sink: &mut Vec<u8>) -> io::Result<bool> {
    match reader.read(buffer) {
        Ok(0) => Ok(false),
        Ok(read) => {
            sink.extend_from_slice(&buffer[..read]);
            Ok(true)
        }
        Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

/// Fold a terminating signal into exit status and stderr.
///
/// libssh2 reports status 0 when the remote process died from a signal, so
/// a signal always maps to a non-zero status: `128 + signo` for signals
/// named in RFC 4254, `-1` for anything else.
fn exit_outcome(exit_status: i32, signal: Option<&str>, mut stderr: String) -> (i32, String) {
    let Some(signal) = signal.filter(|signal| !signal.is_empty()) else {
        return (exit_status, stderr);
    };

    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&format!("killed by signal SIG{signal}"));

    (signal_number(signal).map_or(-1, |signo| 128 + signo), stderr)
}

fn signal_number(name: &str) -> Option<i32> {
    let signo = match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => return None,
    };

    Some(signo)
}
