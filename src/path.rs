// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where the settings file lives, and expand user supplied paths
//! before they are handed to anything that touches the file system.

use std::{
    env,
    path::{Path, PathBuf},
};

/// Environment variable that points at the settings file.
pub const SETTINGS_ENV: &str = "SPREAD_SETTINGS";

/// Settings file name looked up in the current directory and config dir.
pub const SETTINGS_FILE: &str = "config.toml";

/// Determine path to the settings file.
///
/// Lookup order is `$SPREAD_SETTINGS`, then `config.toml` in the current
/// directory, then `$XDG_CONFIG_HOME/spread/config.toml`. Only the current
/// directory candidate is checked for existence, the last candidate is
/// returned as-is so the caller can report a useful missing file error.
///
/// # Errors
///
/// - Return [`PathError::NoConfigDir`] if the user config directory cannot
///   be determined.
pub fn default_settings_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(SETTINGS_ENV).filter(|path| !path.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let local = PathBuf::from(SETTINGS_FILE);
    if local.is_file() {
        return Ok(local);
    }

    dirs::config_dir()
        .map(|path| path.join("spread").join(SETTINGS_FILE))
        .ok_or(PathError::NoConfigDir)
}

/// Perform shell expansion on a path.
///
/// Expands a leading `~` and any `$VAR` or `${VAR}` references.
///
/// # Errors
///
/// - Return [`PathError::Expansion`] if a referenced variable is undefined.
pub fn expand(path: impl AsRef<Path>) -> Result<PathBuf> {
    let raw = path.as_ref().to_string_lossy();
    let expanded = shellexpand::full(raw.as_ref()).map_err(|source| PathError::Expansion {
        path: path.as_ref().to_path_buf(),
        source,
    })?;

    Ok(PathBuf::from(expanded.into_owned()))
}

/// Path resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// No way to determine the user's configuration directory.
    #[error("cannot determine absolute path to user's configuration directory")]
    NoConfigDir,

    /// Shell expansion failed.
    #[error("cannot expand path {:?}", path.display())]
    Expansion {
        #[source]
        source: shellexpand::LookupError<env::VarError>,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("DEPLOY_ROOT", "/srv/deploy")])]
    fn expand_substitutes_variables() {
        let result = expand("$DEPLOY_ROOT/hooks/before.sh").unwrap();
        assert_eq!(result, PathBuf::from("/srv/deploy/hooks/before.sh"));
    }

    #[sealed_test]
    fn expand_rejects_undefined_variable() {
        env::remove_var("SPREAD_UNDEFINED_VAR");
        let result = expand("$SPREAD_UNDEFINED_VAR/key");
        assert!(matches!(result, Err(PathError::Expansion { .. })));
    }

    #[sealed_test(env = [("SPREAD_SETTINGS", "/opt/spread/settings.toml")])]
    fn settings_path_prefers_environment() {
        let result = default_settings_path().unwrap();
        assert_eq!(result, PathBuf::from("/opt/spread/settings.toml"));
    }
}
