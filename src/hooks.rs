// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment hook handling.
//!
//! A __hook__ is a local script whose text is shipped to the remote host and
//! executed there either right before the new configuration is uploaded, or
//! right after it has been committed to its destination.
//!
//! # Hook Sets
//!
//! Hooks are grouped into a [`HookSet`]. The settings file may declare one
//! global hook set, and each server may declare its own. The two are merged
//! field by field when settings are loaded, where the server's fields win and
//! missing fields are inherited from the global hook set. Thus, a server can
//! override its "before" script while still inheriting the global "after"
//! script.
//!
//! # Variants
//!
//! A __variant__ is a name prefixed onto the file name of each hook script.
//! Selecting variant "staging" turns `/etc/hooks/before.sh` into
//! `/etc/hooks/staging-before.sh`. This keeps environment specific hooks next
//! to each other without maintaining separate settings files.
//!
//! # Execution
//!
//! Scripts are never copied to the remote host. The executor argument list is
//! joined with the script text as one extra argument, so the default executor
//! of `/bin/sh -c` runs the script inline.

use crate::remote::{shell_join, RemoteSession, TransportError};

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Executor used when a hook set does not specify one.
pub const DEFAULT_EXECUTOR: [&str; 2] = ["/bin/sh", "-c"];

/// Optional pre and post deployment scripts.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct HookSet {
    /// Local path to script run before the configuration is uploaded.
    #[serde(alias = "before_push", skip_serializing_if = "Option::is_none")]
    pub before_path: Option<PathBuf>,

    /// Local path to script run after the configuration is committed.
    #[serde(alias = "after_push", skip_serializing_if = "Option::is_none")]
    pub after_path: Option<PathBuf>,

    /// Argument list used to interpret script text on the remote host.
    #[serde(alias = "script_executor", skip_serializing_if = "Option::is_none")]
    pub executor: Option<Vec<String>>,
}

impl HookSet {
    /// Merge a server specific hook set into the global hook set.
    ///
    /// Each field is picked independently: the local value if present,
    /// otherwise the global value. Empty paths and empty executors count as
    /// absent. If `local` is absent entirely, the global hook set is returned
    /// unchanged.
    pub fn merge(global: &HookSet, local: Option<&HookSet>) -> HookSet {
        let Some(local) = local else {
            return global.clone();
        };

        HookSet {
            before_path: pick(local.before_path(), global.before_path()).map(Path::to_path_buf),
            after_path: pick(local.after_path(), global.after_path()).map(Path::to_path_buf),
            executor: pick(local.custom_executor(), global.custom_executor()).map(<[String]>::to_vec),
        }
    }

    /// Copy hook set with variant name prefixed onto each script file name.
    ///
    /// Only the file name component changes. Unset paths, and paths without
    /// a file name component, are left alone.
    pub fn apply_variant(&self, variant: &str) -> HookSet {
        let rename = |path: &PathBuf| match path.file_name() {
            Some(name) => {
                let mut renamed = OsString::from(variant);
                renamed.push("-");
                renamed.push(name);
                path.with_file_name(renamed)
            }
            None => path.clone(),
        };

        HookSet {
            before_path: self.before_path.as_ref().map(rename),
            after_path: self.after_path.as_ref().map(rename),
            executor: self.executor.clone(),
        }
    }

    /// Check if hook set has no scripts to run at all.
    pub fn is_empty(&self) -> bool {
        self.before_path().is_none() && self.after_path().is_none()
    }

    /// Script path configured for given phase.
    pub fn script(&self, phase: Phase) -> Option<&Path> {
        match phase {
            Phase::Before => self.before_path(),
            Phase::After => self.after_path(),
        }
    }

    /// Effective executor argument list.
    pub fn executor(&self) -> Vec<&str> {
        match self.custom_executor() {
            Some(executor) => executor.iter().map(String::as_str).collect(),
            None => DEFAULT_EXECUTOR.to_vec(),
        }
    }

    fn before_path(&self) -> Option<&Path> {
        non_empty_path(self.before_path.as_deref())
    }

    fn after_path(&self) -> Option<&Path> {
        non_empty_path(self.after_path.as_deref())
    }

    fn custom_executor(&self) -> Option<&[String]> {
        self.executor.as_deref().filter(|executor| !executor.is_empty())
    }
}

fn pick<'a, T: ?Sized>(local: Option<&'a T>, global: Option<&'a T>) -> Option<&'a T> {
    local.or(global)
}

fn non_empty_path(path: Option<&Path>) -> Option<&Path> {
    path.filter(|path| !path.as_os_str().is_empty())
}

/// Point in the push sequence where a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before any data is transferred.
    Before,

    /// After the configuration has been committed.
    After,
}

impl Display for Phase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Before => fmt.write_str("before"),
            Self::After => fmt.write_str("after"),
        }
    }
}

/// Run hook for given phase over an established session.
///
/// No-op if there is no hook set, or the hook set has no script for `phase`.
/// Returns `true` if a script actually ran.
///
/// # Errors
///
/// - Return [`HookError::ReadScript`] if the local script cannot be read.
/// - Return [`HookError::Transport`] if the remote command cannot be issued.
/// - Return [`HookError::Failed`] if the script exits with non-zero status.
#[instrument(skip(session, hooks), level = "debug")]
pub fn run_hook<S>(session: &mut S, hooks: Option<&HookSet>, phase: Phase) -> Result<bool>
where
    S: RemoteSession + ?Sized,
{
    let Some(hooks) = hooks else {
        return Ok(false);
    };
    let Some(script_path) = hooks.script(phase) else {
        return Ok(false);
    };

    let script = read_to_string(script_path).map_err(|source| HookError::ReadScript {
        source,
        phase,
        path: script_path.to_path_buf(),
    })?;

    let mut args = hooks.executor();
    args.push(script.as_str());
    let command = shell_join(args);

    info!("run {phase} hook {:?}", script_path.display());
    let output = session.run_command(&command, None)?;
    debug!("{phase} hook exited with {}", output.exit_status);

    if !output.success() {
        return Err(HookError::Failed {
            phase,
            exit_status: output.exit_status,
            stderr: output.stderr.trim_end().to_string(),
        });
    }

    Ok(true)
}

/// Hook execution error types.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Local script file cannot be read.
    #[error("cannot read {phase} hook script at {:?}", path.display())]
    ReadScript {
        #[source]
        source: std::io::Error,
        phase: Phase,
        path: PathBuf,
    },

    /// Remote script exited with non-zero status.
    #[error("{phase} hook exited with status {exit_status}: {stderr}")]
    Failed {
        phase: Phase,
        exit_status: i32,
        stderr: String,
    },

    /// Remote command could not be issued.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Friendly result alias :3
pub type Result<T, E = HookError> = std::result::Result<T, E>;
