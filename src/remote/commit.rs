// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Atomic configuration commit.
//!
//! New configuration content is first uploaded, unprivileged, to a temporary
//! file in a shared temporary directory. A privileged `mv` then renames that
//! file onto the destination path. The rename is the atomicity boundary: a
//! reader of the destination sees either the complete previous version or the
//! complete new version, never a partial write.
//!
//! If the rename fails the temporary file is left behind and reported. Spread
//! does not attempt a privileged cleanup on its own.

use crate::remote::{shell_join, RemoteSession, TransportError};

use rand::{distr::Alphanumeric, Rng};
use std::{
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Default shared temporary directory on remote hosts.
pub const DEFAULT_TEMP_DIR: &str = "/tmp";

/// Length of the random suffix of temporary file names.
pub const SUFFIX_LEN: usize = 6;

/// How the final rename gets its privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elevation {
    /// Plain `mv` as the login user.
    None,

    /// Non-interactive `sudo`, relying on passwordless sudo rules.
    Sudo,

    /// `sudo` reading the given password from standard input.
    SudoWithPassword(String),
}

/// Upload to temporary path, then rename onto destination.
#[derive(Debug, Clone)]
pub struct AtomicPusher {
    temp_dir: PathBuf,
}

impl Default for AtomicPusher {
    fn default() -> Self {
        Self::new(DEFAULT_TEMP_DIR)
    }
}

impl AtomicPusher {
    /// Construct new pusher staging files in `temp_dir`.
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    /// Push content to destination path over an established session.
    ///
    /// Returns the temporary path that was renamed onto the destination.
    ///
    /// # Errors
    ///
    /// - Return [`CommitError::NoFileName`] if destination has no file name.
    /// - Return [`CommitError::Upload`] if upload to temporary path fails.
    /// - Return [`CommitError::Rename`] if the privileged rename fails.
    #[instrument(skip(self, session, content, elevation), level = "debug")]
    pub fn push<S>(
        &self,
        session: &mut S,
        content: &mut dyn Read,
        destination: &Path,
        elevation: &Elevation,
    ) -> Result<PathBuf>
    where
        S: RemoteSession + ?Sized,
    {
        let temp_path = self.temp_path(destination, &random_suffix())?;

        debug!("upload to temporary path {:?}", temp_path.display());
        let written = session
            .upload(content, &temp_path)
            .map_err(|source| CommitError::Upload {
                source,
                temp_path: temp_path.clone(),
            })?;

        let (command, stdin) = rename_command(&temp_path, destination, elevation);
        debug!("commit with {command}");
        let output = session
            .run_command(&command, stdin.as_deref())
            .map_err(|source| CommitError::RenameTransport {
                source,
                temp_path: temp_path.clone(),
            })?;

        if !output.success() {
            return Err(CommitError::Rename {
                temp_path,
                exit_status: output.exit_status,
                stderr: output.stderr.trim_end().to_string(),
            });
        }

        info!("committed {written} bytes to {:?}", destination.display());
        Ok(temp_path)
    }

    /// Temporary path for destination with given suffix.
    ///
    /// # Errors
    ///
    /// - Return [`CommitError::NoFileName`] if destination has no file name.
    pub fn temp_path(&self, destination: &Path, suffix: &str) -> Result<PathBuf> {
        let name = destination
            .file_name()
            .ok_or_else(|| CommitError::NoFileName {
                destination: destination.to_path_buf(),
            })?;

        Ok(self
            .temp_dir
            .join(format!("{}.tmp{suffix}", name.to_string_lossy())))
    }
}

fn random_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

fn rename_command(
    temp_path: &Path,
    destination: &Path,
    elevation: &Elevation,
) -> (String, Option<Vec<u8>>) {
    let temp_path = temp_path.to_string_lossy();
    let destination = destination.to_string_lossy();
    let mv = ["mv", "--", temp_path.as_ref(), destination.as_ref()];

    match elevation {
        Elevation::None => (shell_join(mv), None),
        Elevation::Sudo => (shell_join(["sudo", "-n"].into_iter().chain(mv)), None),
        Elevation::SudoWithPassword(password) => (
            shell_join(["sudo", "-S", "-p", ""].into_iter().chain(mv)),
            Some(format!("{password}\n").into_bytes()),
        ),
    }
}

/// Commit error types.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Destination path has no file name component.
    #[error("destination {:?} has no file name", destination.display())]
    NoFileName { destination: PathBuf },

    /// Upload to temporary path failed.
    #[error("cannot upload to temporary path {:?}", temp_path.display())]
    Upload {
        #[source]
        source: TransportError,
        temp_path: PathBuf,
    },

    /// Rename command could not be issued.
    #[error("cannot issue rename of {:?}", temp_path.display())]
    RenameTransport {
        #[source]
        source: TransportError,
        temp_path: PathBuf,
    },

    /// Rename command exited with non-zero status.
    #[error(
        "cannot move {:?} onto destination (status {exit_status}): {stderr}",
        temp_path.display()
    )]
    Rename {
        temp_path: PathBuf,
        exit_status: i32,
        stderr: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CommitError> = std::result::Result<T, E>;
