// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deploy one local configuration file to many hosts over SSH.
//!
//! Spread connects to each configured server, optionally runs a "before" hook
//! script, uploads the configuration to a temporary path, renames it onto the
//! destination with elevated privileges, and optionally runs an "after" hook
//! script. Every server is handled independently of the others, so one broken
//! host never holds back the rest of a run.
//!
//! # Layout
//!
//! - [`config`]: settings file and server profiles.
//! - [`hooks`]: hook sets, merging, variants, and execution.
//! - [`remote`]: transport seam, authentication, and atomic commit.
//! - [`push`]: orchestration of a push run and its report.
//! - [`path`]: settings file discovery and local path expansion.

pub mod config;
pub mod hooks;
pub mod path;
pub mod push;
pub mod remote;
