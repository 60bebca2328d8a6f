/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Structured logging setup.
//!
//! The source printed audit-trail lines with `println!`/`eprintln!`
//! directly from the state manager (see the TODO left in the teacher's
//! `manager.rs`: "Replace println! with structured logging (tracing
//! crate) for production"). This module is that follow-through: every
//! binary in the workspace calls [`init`] once at startup and then uses
//! `tracing::{info,warn,error}!` with `instance_id`/`request_id` fields so
//! log lines for one instance's lifecycle can be filtered and correlated.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber. Safe to call more than once;
/// subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
