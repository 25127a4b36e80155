// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the settings file that Spread reads once at startup.
//! Parsing a settings file produces [`RunSettings`], an immutable registry of
//! [`ServerProfile`]s whose hook sets have already been merged with the
//! global hook set.
//!
//! # General Layout
//!
//! ```toml
//! target_path = "/etc/nginx/nginx.conf"
//! config_path = "nginx.conf"
//!
//! [hooks]
//! after_path = "hooks/reload.sh"
//!
//! [servers.edge1]
//! host = "10.0.0.1"
//! user = "deploy"
//! private_key_path = "~/.ssh/id_ed25519"
//!
//! [servers.edge1.hooks]
//! before_path = "hooks/edge-check.sh"
//! ```
//!
//! Local paths (keys, content files, hook scripts) go through shell expansion.
//! Remote paths are taken literally.

use crate::{
    hooks::HookSet,
    path::{expand, PathError},
    remote::{commit::Elevation, Endpoint},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Debug, Formatter, Result as FmtResult},
    fs::read_to_string,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

/// Lowest port accepted in the settings file.
pub const MIN_PORT: u16 = 100;

/// Highest port accepted in the settings file.
pub const MAX_PORT: u16 = 25565;

/// Number of targets pushed concurrently unless configured otherwise.
pub const DEFAULT_PARALLEL: usize = 4;

/// Process wide settings.
///
/// Constructed once, then shared read-only by every push sequence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunSettings {
    /// Registry of server profiles keyed by name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerProfile>,

    /// Default remote destination path.
    pub target_path: Option<PathBuf>,

    /// Default local configuration file to push.
    pub config_path: Option<PathBuf>,

    /// Global hook set.
    #[serde(alias = "scripts")]
    pub hooks: Option<HookSet>,

    /// Number of targets pushed concurrently.
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Timeout for network operations in seconds.
    pub connect_timeout: Option<u64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            target_path: None,
            config_path: None,
            hooks: None,
            parallel: DEFAULT_PARALLEL,
            connect_timeout: None,
        }
    }
}

impl RunSettings {
    /// Load settings from file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadSettings`] if the file cannot be read.
    /// - Return any error of [`RunSettings::from_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_to_string(path.as_ref()).map_err(|source| ConfigError::ReadSettings {
            source,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Select target profiles by name.
    ///
    /// An empty selection means every configured server. Duplicate names are
    /// selected once.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownServer`] if a name is not configured.
    pub fn select(&self, names: &[String]) -> Result<Vec<&ServerProfile>> {
        if names.is_empty() {
            return Ok(self.servers.values().collect());
        }

        let mut seen = BTreeSet::new();
        let mut selected = Vec::new();
        for name in names {
            let profile = self
                .servers
                .get(name)
                .ok_or_else(|| ConfigError::UnknownServer { name: name.clone() })?;
            if seen.insert(name.as_str()) {
                selected.push(profile);
            }
        }

        Ok(selected)
    }

    /// Remote destination for given profile.
    pub fn destination_for<'a>(&'a self, profile: &'a ServerProfile) -> Option<&'a Path> {
        profile
            .target_path
            .as_deref()
            .or(self.target_path.as_deref())
    }

    /// Network timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.connect_timeout.map(Duration::from_secs)
    }
}

impl FromStr for RunSettings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: RunSettings = toml::from_str(data).map_err(ConfigError::Deserialize)?;

        if settings.parallel == 0 {
            return Err(ConfigError::Parallel);
        }

        // INVARIANT: Shell expansion on local paths only.
        settings.config_path = expand_opt(settings.config_path)?;
        settings.hooks = settings.hooks.map(expand_hooks).transpose()?;

        // INVARIANT: Merge global hook set into each server exactly once.
        let global = settings.hooks.clone().unwrap_or_default();
        for (name, server) in settings.servers.iter_mut() {
            server.name = name.clone();
            server.private_key_path = expand_opt(server.private_key_path.take())?;
            server.config_path = expand_opt(server.config_path.take())?;

            let local = server.hooks.take().map(expand_hooks).transpose()?;
            let merged = HookSet::merge(&global, local.as_ref());
            server.hooks = (!merged.is_empty()).then_some(merged);

            if server.password.is_none() && server.private_key_path.is_none() {
                warn!("server `{name}` has neither password nor private key configured");
            }
        }

        Ok(settings)
    }
}

fn default_parallel() -> usize {
    DEFAULT_PARALLEL
}

fn expand_opt(path: Option<PathBuf>) -> Result<Option<PathBuf>> {
    Ok(path.map(expand).transpose()?)
}

fn expand_hooks(hooks: HookSet) -> Result<HookSet> {
    Ok(HookSet {
        before_path: expand_opt(hooks.before_path)?,
        after_path: expand_opt(hooks.after_path)?,
        executor: hooks.executor,
    })
}

/// Static description of one remote target.
///
/// Identity is `(name, host, user)`: two profiles with the same identity are
/// equal even if their credentials differ.
#[derive(Clone, Deserialize, Serialize)]
pub struct ServerProfile {
    /// Unique name, defaults to registry key.
    #[serde(default)]
    pub name: String,

    /// Host name or address.
    pub host: String,

    /// SSH port.
    #[serde(default)]
    pub port: Port,

    /// Login user.
    pub user: String,

    /// Login password, also used for sudo.
    pub password: Option<String>,

    /// Path to private key file.
    #[serde(alias = "key_path")]
    pub private_key_path: Option<PathBuf>,

    /// Passphrase protecting the private key.
    #[serde(alias = "key_passphrase")]
    pub private_key_passphrase: Option<String>,

    /// Remote destination overriding the run-wide default.
    pub target_path: Option<PathBuf>,

    /// Local file overriding the run-wide configuration file.
    pub config_path: Option<PathBuf>,

    /// Perform final rename through sudo.
    #[serde(default = "default_sudo")]
    pub sudo: bool,

    /// Effective hook set, already merged with the global hook set.
    #[serde(alias = "scripts")]
    pub hooks: Option<HookSet>,
}

impl ServerProfile {
    /// Address and login of server.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port.get(),
            user: self.user.clone(),
        }
    }

    /// Privileges used for the final rename.
    pub fn elevation(&self) -> Elevation {
        match (self.sudo, &self.password) {
            (false, _) => Elevation::None,
            (true, Some(password)) => Elevation::SudoWithPassword(password.clone()),
            (true, None) => Elevation::Sudo,
        }
    }
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: Port::default(),
            user: String::new(),
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            target_path: None,
            config_path: None,
            sudo: true,
            hooks: None,
        }
    }
}

fn default_sudo() -> bool {
    true
}

impl PartialEq for ServerProfile {
    fn eq(&self, other: &Self) -> bool {
        (&self.name, &self.host, &self.user) == (&other.name, &other.host, &other.user)
    }
}

impl Eq for ServerProfile {}

impl Hash for ServerProfile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (&self.name, &self.host, &self.user).hash(state);
    }
}

impl Debug for ServerProfile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        fmt.debug_struct("ServerProfile")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .field("private_key_path", &self.private_key_path)
            .field("private_key_passphrase", &redact(&self.private_key_passphrase))
            .field("target_path", &self.target_path)
            .field("config_path", &self.config_path)
            .field("sudo", &self.sudo)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// SSH port bounded to the accepted range.
///
/// The default of 22 is the standard SSH port and is accepted even though
/// explicit values must lie within [`MIN_PORT`] and [`MAX_PORT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(u16);

impl Port {
    /// Raw port number.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl Default for Port {
    fn default() -> Self {
        Self(22)
    }
}

impl TryFrom<u16> for Port {
    type Error = ConfigError;

    fn try_from(port: u16) -> Result<Self, Self::Error> {
        if !(MIN_PORT..=MAX_PORT).contains(&port) {
            return Err(ConfigError::PortRange { port });
        }

        Ok(Self(port))
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file cannot be read.
    #[error("cannot read settings file at {:?}", path.display())]
    ReadSettings {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize settings.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Port is outside the accepted range.
    #[error("port {port} is outside of {MIN_PORT}..={MAX_PORT}")]
    PortRange { port: u16 },

    /// Parallelism must allow at least one target.
    #[error("parallel must be at least 1")]
    Parallel,

    /// Selected server is not configured.
    #[error("server `{name}` does not exist in settings")]
    UnknownServer { name: String },

    /// Failed to perform shell expansion on a path.
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
