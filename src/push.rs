// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Push orchestration.
//!
//! A push run takes a set of targets, resolves where each target's content
//! comes from and where it goes, then drives every target through the same
//! strict sequence:
//!
//! 1. Resolve effective hooks, applying the selected variant to a copy.
//! 2. Connect, trying private key then password.
//! 3. Run the "before" hook.
//! 4. Upload to a temporary path and rename onto the destination.
//! 5. Run the "after" hook.
//!
//! Targets are independent of each other. They run concurrently on blocking
//! worker threads, and a failure in one target never stops the others. The
//! only thing that aborts a whole run is a configuration problem found while
//! planning, i.e., before any target has been attempted.
//!
//! # Outcomes
//!
//! Every target ends up in exactly one [`TargetOutcome`]. An "after" hook
//! failure is not a failed push, because the configuration was already
//! committed. It is kept apart from a clean push as
//! [`TargetOutcome::PushedWithWarning`] so the caller can tell the two apart.

use crate::{
    config::{ConfigError, RunSettings, ServerProfile},
    hooks::{run_hook, HookError, Phase},
    remote::{
        auth::{AuthError, AuthMethod, RemoteTarget},
        commit::{AtomicPusher, CommitError},
        Transport,
    },
};

use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Everything one target needs to run its push sequence.
#[derive(Debug, Clone)]
pub struct TargetPlan {
    /// Profile of the target.
    pub profile: ServerProfile,

    /// Resolved remote destination.
    pub destination: PathBuf,

    /// Content pushed to destination.
    pub content: Arc<[u8]>,
}

/// Shared flag that stops a run from dispatching further targets.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Handle an operator interrupt.
    ///
    /// The first interrupt cancels dispatch. Any later one asks for an
    /// immediate abort.
    pub fn interrupt(&self) -> Interrupt {
        match self.0.swap(true, Ordering::SeqCst) {
            false => Interrupt::Cancel,
            true => Interrupt::Abort,
        }
    }
}

/// Reaction to an operator interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Stop dispatching, let in-flight targets finish.
    Cancel,

    /// Stop the process now.
    Abort,
}

/// Drives push sequences across a set of targets.
pub struct PushOrchestrator<T>
where
    T: Transport,
{
    transport: Arc<T>,
    settings: Arc<RunSettings>,
    pusher: AtomicPusher,
    cancel: CancelHandle,
    progress: Option<MultiProgress>,
}

impl<T> PushOrchestrator<T>
where
    T: Transport,
{
    /// Construct new orchestrator over immutable settings.
    pub fn new(transport: T, settings: Arc<RunSettings>) -> Self {
        Self {
            transport: Arc::new(transport),
            settings,
            pusher: AtomicPusher::default(),
            cancel: CancelHandle::default(),
            progress: None,
        }
    }

    /// Use custom atomic pusher.
    pub fn with_pusher(mut self, pusher: AtomicPusher) -> Self {
        self.pusher = pusher;
        self
    }

    /// Display one spinner per in-flight target.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Handle to cancel dispatching of further targets.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Plan a run without touching the network.
    ///
    /// Resolves targets, destinations, and content. Content of each distinct
    /// local file is read once.
    ///
    /// # Errors
    ///
    /// - Return [`PlanError::Config`] if a selected server does not exist.
    /// - Return [`PlanError::NoContent`] if no local file can be resolved.
    /// - Return [`PlanError::ReadContent`] if a local file cannot be read.
    /// - Return [`PlanError::NoDestination`] if a target has no destination.
    /// - Return [`PlanError::InvalidDestination`] if a destination has no
    ///   file name.
    pub fn plan(&self, targets: &[String], content: Option<&Path>) -> Result<Vec<TargetPlan>> {
        let profiles = self.settings.select(targets)?;
        let default_content = content.or(self.settings.config_path.as_deref());
        let mut cache: BTreeMap<PathBuf, Arc<[u8]>> = BTreeMap::new();
        let mut plans = Vec::with_capacity(profiles.len());

        for profile in profiles {
            let destination = self.settings.destination_for(profile).ok_or_else(|| {
                PlanError::NoDestination {
                    server: profile.name.clone(),
                }
            })?;
            if destination.file_name().is_none() {
                return Err(PlanError::InvalidDestination {
                    server: profile.name.clone(),
                    destination: destination.to_path_buf(),
                });
            }

            let source = profile
                .config_path
                .as_deref()
                .or(default_content)
                .ok_or(PlanError::NoContent)?;
            let content = match cache.get(source) {
                Some(content) => Arc::clone(content),
                None => {
                    let data = read(source).map_err(|err| PlanError::ReadContent {
                        source: err,
                        path: source.to_path_buf(),
                    })?;
                    let data: Arc<[u8]> = Arc::from(data);
                    cache.insert(source.to_path_buf(), Arc::clone(&data));
                    data
                }
            };

            plans.push(TargetPlan {
                profile: profile.clone(),
                destination: destination.to_path_buf(),
                content,
            });
        }

        Ok(plans)
    }

    /// Push content to every selected target.
    ///
    /// An empty `targets` list selects every configured server. `content`
    /// overrides the run-wide local file. `variant` selects alternate hook
    /// scripts by name.
    ///
    /// # Errors
    ///
    /// - Return [`PlanError`] if planning fails. Per-target failures never
    ///   surface here, they are recorded in the returned [`PushReport`].
    pub async fn run(
        &self,
        targets: &[String],
        content: Option<&Path>,
        variant: Option<&str>,
    ) -> Result<PushReport> {
        let plans = self.plan(targets, content)?;
        let semaphore = Arc::new(Semaphore::new(self.settings.parallel.max(1)));
        let mut report = PushReport::default();
        let mut handles = Vec::with_capacity(plans.len());

        for plan in plans {
            let name = plan.profile.name.clone();
            if self.cancel.is_cancelled() {
                info!("skip `{name}`, run was cancelled");
                report.record(name, TargetOutcome::Skipped);
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                report.record(name, TargetOutcome::Skipped);
                continue;
            };
            if self.cancel.is_cancelled() {
                info!("skip `{name}`, run was cancelled");
                report.record(name, TargetOutcome::Skipped);
                continue;
            }

            let transport = Arc::clone(&self.transport);
            let pusher = self.pusher.clone();
            let variant = variant.map(ToOwned::to_owned);
            let spinner = self.spinner(&name);

            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let outcome = push_target(transport.as_ref(), &pusher, &plan, variant.as_deref());
                if let Some(spinner) = spinner {
                    spinner.finish_and_clear();
                }
                outcome
            });
            handles.push(async move { (name, handle.await) });
        }

        for (name, result) in join_all(handles).await {
            let outcome = result.unwrap_or_else(|err| {
                TargetOutcome::Failed(PushError::Task {
                    server: name.clone(),
                    reason: err.to_string(),
                })
            });
            report.record(name, outcome);
        }

        Ok(report)
    }

    fn spinner(&self, name: &str) -> Option<ProgressBar> {
        self.progress.as_ref().map(|progress| {
            let spinner = progress.add(ProgressBar::new_spinner());
            spinner.set_message(format!("pushing to {name}..."));
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        })
    }
}

/// Run the full push sequence for one target.
#[instrument(skip_all, fields(server = %plan.profile.name))]
pub fn push_target<T>(
    transport: &T,
    pusher: &AtomicPusher,
    plan: &TargetPlan,
    variant: Option<&str>,
) -> TargetOutcome
where
    T: Transport,
{
    match try_push_target(transport, pusher, plan, variant) {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!("cannot push to `{}`: {error}", plan.profile.name);
            TargetOutcome::Failed(error)
        }
    }
}

fn try_push_target<T>(
    transport: &T,
    pusher: &AtomicPusher,
    plan: &TargetPlan,
    variant: Option<&str>,
) -> std::result::Result<TargetOutcome, PushError>
where
    T: Transport,
{
    let profile = &plan.profile;

    // INVARIANT: Variants apply to a copy, never the shared profile.
    let hooks = profile.hooks.as_ref().map(|hooks| match variant {
        Some(variant) => hooks.apply_variant(variant),
        None => hooks.clone(),
    });

    info!("connecting to server `{}`", profile.name);
    let mut target = RemoteTarget::new(transport, profile);
    let method = target.connect()?;
    let session = target.session_mut()?;

    run_hook(session, hooks.as_ref(), Phase::Before)?;

    info!("pushing config to server `{}`", profile.name);
    pusher.push(
        session,
        &mut Cursor::new(&plan.content[..]),
        &plan.destination,
        &profile.elevation(),
    )?;

    let outcome = match run_hook(session, hooks.as_ref(), Phase::After) {
        Ok(_) => TargetOutcome::Pushed { method },
        Err(error) => {
            warn!("config committed to `{}` but {error}", profile.name);
            TargetOutcome::PushedWithWarning {
                method,
                warning: error.into(),
            }
        }
    };

    if let Err(error) = target.close() {
        debug!("ignore error while closing session: {error}");
    }

    Ok(outcome)
}

/// Final state of one target.
#[derive(Debug)]
pub enum TargetOutcome {
    /// Configuration committed, every hook succeeded.
    Pushed { method: AuthMethod },

    /// Configuration committed, but the "after" hook failed.
    PushedWithWarning {
        method: AuthMethod,
        warning: PushError,
    },

    /// Configuration not committed.
    Failed(PushError),

    /// Target was never dispatched because the run was cancelled.
    Skipped,
}

impl TargetOutcome {
    /// Check if configuration was committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Pushed { .. } | Self::PushedWithWarning { .. })
    }

    /// Error attached to outcome, if any.
    pub fn error(&self) -> Option<&PushError> {
        match self {
            Self::PushedWithWarning { warning, .. } => Some(warning),
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Aggregate result of a push run.
#[derive(Debug, Default)]
pub struct PushReport {
    outcomes: BTreeMap<String, TargetOutcome>,
}

impl PushReport {
    /// Record outcome of a target.
    pub fn record(&mut self, name: impl Into<String>, outcome: TargetOutcome) {
        self.outcomes.insert(name.into(), outcome);
    }

    /// Outcome of a target.
    pub fn outcome(&self, name: &str) -> Option<&TargetOutcome> {
        self.outcomes.get(name)
    }

    /// Targets whose configuration was committed.
    pub fn succeeded(&self) -> BTreeSet<&str> {
        self.names(TargetOutcome::is_committed)
    }

    /// Targets whose configuration was not committed.
    pub fn failed(&self) -> BTreeSet<&str> {
        self.names(|outcome| matches!(outcome, TargetOutcome::Failed(_)))
    }

    /// Targets never dispatched.
    pub fn skipped(&self) -> BTreeSet<&str> {
        self.names(|outcome| matches!(outcome, TargetOutcome::Skipped))
    }

    /// Committed targets whose "after" hook failed.
    pub fn warnings(&self) -> impl Iterator<Item = (&str, &PushError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            TargetOutcome::PushedWithWarning { warning, .. } => Some((name.as_str(), warning)),
            _ => None,
        })
    }

    /// Failed targets with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &PushError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            TargetOutcome::Failed(error) => Some((name.as_str(), error)),
            _ => None,
        })
    }

    /// Check if every target committed its configuration.
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(TargetOutcome::is_committed)
    }

    fn names(&self, filter: impl Fn(&TargetOutcome) -> bool) -> BTreeSet<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| filter(outcome))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl Display for PushReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "pushed to {:?}", self.succeeded())?;
        for (name, warning) in self.warnings() {
            writeln!(fmt, "  warning `{name}` [{}]: {warning}", warning.kind())?;
        }
        if !self.failed().is_empty() {
            writeln!(fmt, "failed to push to {:?}", self.failed())?;
            for (name, error) in self.failures() {
                writeln!(fmt, "  error `{name}` [{}]: {error}", error.kind())?;
            }
        }
        if !self.skipped().is_empty() {
            writeln!(fmt, "skipped {:?}", self.skipped())?;
        }

        Ok(())
    }
}

/// Coarse classification of per-target errors for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Key material is malformed, unreadable, or wrongly protected.
    KeyLoad,

    /// Every configured credential was rejected.
    Authentication,

    /// Transport, handshake, or unreachable host.
    Protocol,

    /// Hook script exited with non-zero status.
    Hook { phase: Phase, exit_status: i32 },

    /// Privileged rename failed.
    Commit,

    /// Local file could not be read.
    LocalIo,

    /// Target went through connect twice.
    AlreadyConnected,

    /// Worker did not complete.
    Internal,
}

impl Display for FailureKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::KeyLoad => fmt.write_str("key load failure"),
            Self::Authentication => fmt.write_str("authentication failure"),
            Self::Protocol => fmt.write_str("protocol failure"),
            Self::Hook { phase, exit_status } => {
                write!(fmt, "{phase} hook failure, status {exit_status}")
            }
            Self::Commit => fmt.write_str("commit failure"),
            Self::LocalIo => fmt.write_str("local i/o failure"),
            Self::AlreadyConnected => fmt.write_str("already connected"),
            Self::Internal => fmt.write_str("internal failure"),
        }
    }
}

/// Per-target error types.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Connecting to target failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Running a hook failed.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Committing configuration failed.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// Worker running the target did not complete.
    #[error("push task for `{server}` did not complete: {reason}")]
    Task { server: String, reason: String },
}

impl PushError {
    /// Classify error for display.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth(AuthError::KeyLoad { .. }) => FailureKind::KeyLoad,
            Self::Auth(AuthError::Exhausted { .. } | AuthError::Rejected(_)) => {
                FailureKind::Authentication
            }
            Self::Auth(AuthError::Protocol(_)) => FailureKind::Protocol,
            Self::Auth(AuthError::AlreadyConnected { .. }) => FailureKind::AlreadyConnected,
            Self::Auth(AuthError::NotConnected { .. }) => FailureKind::Internal,
            Self::Hook(HookError::Failed {
                phase, exit_status, ..
            }) => FailureKind::Hook {
                phase: *phase,
                exit_status: *exit_status,
            },
            Self::Hook(HookError::ReadScript { .. }) => FailureKind::LocalIo,
            Self::Hook(HookError::Transport(_)) => FailureKind::Protocol,
            Self::Commit(CommitError::Upload { .. } | CommitError::RenameTransport { .. }) => {
                FailureKind::Protocol
            }
            Self::Commit(CommitError::Rename { .. } | CommitError::NoFileName { .. }) => {
                FailureKind::Commit
            }
            Self::Task { .. } => FailureKind::Internal,
        }
    }
}

/// Run level error types.
///
/// These abort a run before any target is attempted.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Target selection failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No local configuration file given or configured.
    #[error("no configuration file provided")]
    NoContent,

    /// Local configuration file cannot be read.
    #[error("cannot read configuration file at {:?}", path.display())]
    ReadContent {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Neither server nor settings provide a destination.
    #[error("no target path resolvable for server `{server}`")]
    NoDestination { server: String },

    /// Destination has no file name component.
    #[error("target path {:?} of server `{server}` has no file name", destination.display())]
    InvalidDestination {
        server: String,
        destination: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PlanError> = std::result::Result<T, E>;
