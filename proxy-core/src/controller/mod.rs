/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Instance Controller (`spec.md` §4.3): the orchestration engine. Six
//! pipelines live in the sibling modules; this module holds the shared
//! struct, the in-memory resource ledger and the request-dedup maps they
//! all draw on.
//!
//! Grounded on `player/actioncontroller/src/manager.rs` for the
//! "one manager struct, one `impl` block per concern, heavy doc comments
//! on every public pipeline entry point" shape, and on
//! `player/actioncontroller/src/runtime/nodeagent/mod.rs` for the
//! per-step sequential pipeline style the schedule pipeline in particular
//! follows.

pub mod call_result;
pub mod eviction;
pub mod heartbeat;
pub mod kill;
pub mod reschedule;
pub mod schedule;

use crate::collaborators::{FunctionAgentMgr, LocalSchedService, MetaStore, Observer, Scheduler, WorkerClientFactory};
use crate::control_view::InstanceControlView;
use crate::ratelimit::CreateRateLimiter;
use crate::subscription::SubscriptionManager;
use crate::types::Resources;
use common::InstanceId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// In-memory allocation ledger (`spec.md` §5 "Resource view"): mutated
/// only by the schedule pipeline on `CREATING` (add) and by any pipeline
/// that drives an instance to a terminal state (delete).
#[derive(Default)]
pub struct ResourceView {
    allocations: Mutex<HashMap<InstanceId, Resources>>,
}

impl ResourceView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, instance_id: InstanceId, resources: Resources) {
        self.allocations.lock().await.insert(instance_id, resources);
    }

    pub async fn release(&self, instance_id: InstanceId) {
        self.allocations.lock().await.remove(&instance_id);
    }

    pub async fn is_allocated(&self, instance_id: InstanceId) -> bool {
        self.allocations.lock().await.contains_key(&instance_id)
    }

    pub async fn allocation_count(&self) -> usize {
        self.allocations.lock().await.len()
    }
}

/// Distinguishes a reschedule driven by an explicit pipeline failure from
/// one driven by node-startup reconciliation (`spec.md` §9 Open Question,
/// Decision D1 in DESIGN.md): only the former increments `schedule_round`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleTrigger {
    PipelineFailure,
    StartupSync,
}

/// The orchestration engine: one instance per node, shared by every
/// per-instance actor task. Holds no instance state of its own — that
/// lives in the `InstanceStateMachine`s owned by `control_view` — only
/// the collaborators and the cross-instance bookkeeping the six
/// pipelines need (rate limiting, resource accounting, in-flight-request
/// dedup).
pub struct InstanceController {
    pub(crate) node_id: String,
    pub(crate) control_view: Arc<InstanceControlView>,
    pub(crate) meta_store: Arc<dyn MetaStore>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) agent_mgr: Arc<dyn FunctionAgentMgr>,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) local_sched: Arc<dyn LocalSchedService>,
    pub(crate) worker_clients: Arc<dyn WorkerClientFactory>,
    pub(crate) rate_limiter: Arc<CreateRateLimiter>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) resource_view: Arc<ResourceView>,
    pub(crate) abnormal: AtomicBool,
    /// Dedups concurrent `ForwardKill`/`Kill` retries for the same
    /// `(request_id, target)` pair (`spec.md` §4.3.3 "Local vs remote").
    pub(crate) kill_inflight: Mutex<HashMap<String, broadcast::Sender<crate::errors::CoreResult<()>>>>,
    /// Dedups concurrent call-result forwards keyed by `request_id`
    /// (`spec.md` §4.3.6).
    pub(crate) call_result_inflight: Mutex<HashMap<String, broadcast::Sender<crate::errors::CoreResult<()>>>>,
}

#[allow(clippy::too_many_arguments)]
impl InstanceController {
    pub fn new(
        node_id: impl Into<String>,
        control_view: Arc<InstanceControlView>,
        meta_store: Arc<dyn MetaStore>,
        scheduler: Arc<dyn Scheduler>,
        agent_mgr: Arc<dyn FunctionAgentMgr>,
        observer: Arc<dyn Observer>,
        local_sched: Arc<dyn LocalSchedService>,
        worker_clients: Arc<dyn WorkerClientFactory>,
        rate_limiter: Arc<CreateRateLimiter>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            control_view,
            meta_store,
            scheduler,
            agent_mgr,
            observer,
            local_sched,
            worker_clients,
            rate_limiter,
            subscriptions,
            resource_view: ResourceView::new(),
            abnormal: AtomicBool::new(false),
            kill_inflight: Mutex::new(HashMap::new()),
            call_result_inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Marks this node abnormal: the schedule pipeline's identity step
    /// refuses every new request with `ERR_INNER_SYSTEM_ERROR` until the
    /// abnormal processor's drain completes (`spec.md` §4.5).
    pub fn mark_abnormal(&self) {
        self.abnormal.store(true, Ordering::SeqCst);
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal.load(Ordering::SeqCst)
    }
}

impl crate::abnormal::AbnormalSink for InstanceController {
    fn mark_abnormal(&self) {
        InstanceController::mark_abnormal(self);
    }
}
