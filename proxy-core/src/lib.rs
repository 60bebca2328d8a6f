/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The instance-lifecycle control-plane core: one `InstanceStateMachine`
//! per instance, a node-local `InstanceControlView` registry, the
//! `InstanceController` pipelines that drive transitions, a
//! `SubscriptionManager` for cross-instance event delivery and an
//! `AbnormalProcessor` for rate limiting and failure-budget bookkeeping.
//!
//! This crate owns none of its own transport, storage or scheduling
//! algorithm: every external dependency is a trait in [`collaborators`],
//! satisfied in production by `proxy-agent` and in tests by [`fakes`].

pub mod abnormal;
pub mod collaborators;
pub mod control_view;
pub mod controller;
pub mod errors;
#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
pub mod ratelimit;
pub mod state;
pub mod state_machine;
pub mod subscription;
pub mod types;

pub use control_view::InstanceControlView;
pub use controller::InstanceController;
pub use errors::{CoreError, CoreResult};
pub use state::InstanceState;
pub use state_machine::InstanceStateMachine;
pub use subscription::SubscriptionManager;
