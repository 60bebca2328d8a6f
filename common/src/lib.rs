/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Ambient stack shared by every crate in this workspace: configuration,
//! logging setup, and the identifier newtypes used throughout the instance
//! lifecycle core.

pub mod config;
pub mod ids;
pub mod logging;

pub use config::get_config;
pub use ids::{InstanceId, RequestId};
