/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Instance Control View (`spec.md` §4.2): the node-local registry of
//! live `InstanceStateMachine`s, keyed by `instance_id`, plus the
//! `request_id` → `instance_id` index used to detect duplicate and
//! rescheduled requests.
//!
//! Grounded on `player/statemanager/src/manager.rs`'s `Arc<Mutex<_>>`
//! wrapped registries, generalized from "one shared map of named
//! resources" to "one map of instances plus a secondary request index",
//! since `spec.md` §4.2 needs both directions of lookup that the
//! source's single-key map doesn't.

use crate::collaborators::MetaStore;
use crate::errors::{CoreError, CoreResult};
use crate::state_machine::InstanceStateMachine;
use crate::types::Instance;
use common::{InstanceId, RequestId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Outcome of a fresh schedule attempt shared with every caller racing on
/// the same `request_id` (`spec.md` §4.2 "Duplicate requests", Decision
/// D4 in DESIGN.md: fan out via a broadcast channel rather than making
/// late arrivals block on a oneshot).
#[derive(Debug, Clone)]
pub struct ScheduleFanOut(pub CoreResult<InstanceId>);

enum RequestSlot {
    /// The instance exists; further requests with this id are duplicates.
    Resolved(InstanceId),
    /// A schedule for this request is in flight; late arrivals subscribe.
    InFlight(broadcast::Sender<ScheduleFanOut>),
}

/// The node-local registry of live instances (`spec.md` §4.2). Holds no
/// business logic of its own beyond lookup, dedup and cleanup; the
/// controller pipelines own every transition decision.
pub struct InstanceControlView {
    instances: RwLock<HashMap<InstanceId, Arc<InstanceStateMachine>>>,
    requests: RwLock<HashMap<RequestId, RequestSlot>>,
    meta_store: Arc<dyn MetaStore>,
}

impl InstanceControlView {
    pub fn new(meta_store: Arc<dyn MetaStore>) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            requests: RwLock::new(HashMap::new()),
            meta_store,
        })
    }

    /// Registers the in-flight marker for a fresh `request_id` before the
    /// schedule pipeline starts, returning a receiver other callers with
    /// the same `request_id` can subscribe to (`spec.md` §4.3.1 step 2).
    /// Returns `None` if the request is already known (resolved or
    /// in-flight): the caller should use `try_get_instance_id_by_request`
    /// or `subscribe_in_flight` instead.
    pub async fn begin_in_flight_request(
        &self,
        request_id: RequestId,
    ) -> Option<broadcast::Receiver<ScheduleFanOut>> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request_id) {
            return None;
        }
        let (tx, rx) = broadcast::channel(16);
        requests.insert(request_id, RequestSlot::InFlight(tx));
        Some(rx)
    }

    /// `spec.md` §4.2 `IsDuplicateRequest`: true once the request has
    /// resolved to a concrete instance or is currently in flight.
    pub async fn is_duplicate_request(&self, request_id: &RequestId) -> bool {
        self.requests.read().await.contains_key(request_id)
    }

    /// `spec.md` §4.2 `TryGetInstanceIDByReq`.
    pub async fn try_get_instance_id_by_request(&self, request_id: &RequestId) -> Option<InstanceId> {
        match self.requests.read().await.get(request_id)? {
            RequestSlot::Resolved(id) => Some(*id),
            RequestSlot::InFlight(_) => None,
        }
    }

    /// Subscribe to the fan-out of an already in-flight request. Returns
    /// `None` if the request has already resolved (caller should read via
    /// `try_get_instance_id_by_request` instead) or doesn't exist.
    pub async fn subscribe_in_flight(&self, request_id: &RequestId) -> Option<broadcast::Receiver<ScheduleFanOut>> {
        match self.requests.read().await.get(request_id)? {
            RequestSlot::InFlight(tx) => Some(tx.subscribe()),
            RequestSlot::Resolved(_) => None,
        }
    }

    /// Resolves an in-flight request, waking every subscriber with the
    /// same fan-out result. A successful outcome leaves the request
    /// permanently resolved to that instance; a failed one clears the
    /// request entirely so a caller may retry it from scratch.
    pub async fn resolve_in_flight_request(&self, request_id: RequestId, outcome: ScheduleFanOut) {
        let mut requests = self.requests.write().await;
        if let Some(RequestSlot::InFlight(tx)) = requests.remove(&request_id) {
            let _ = tx.send(outcome.clone());
        }
        if let ScheduleFanOut(Ok(instance_id)) = outcome {
            requests.insert(request_id, RequestSlot::Resolved(instance_id));
        }
    }

    /// `spec.md` §4.2 `NewInstance`: registers a freshly constructed
    /// state machine. Errors if `instance_id` is already present — callers
    /// must allocate a new id per attempt.
    ///
    /// Also wires the terminal-state cleanup callback that `del_instance`
    /// relies on (`spec.md` §3 "SM destroyed after terminal-state
    /// persistence", "CV entry erased on terminal state"): once the SM
    /// reaches `EXITED`/`EVICTED`/`FATAL` it removes itself from the
    /// registry and erases its `request_id` mapping.
    pub async fn new_instance(self: &Arc<Self>, instance: Instance) -> CoreResult<Arc<InstanceStateMachine>> {
        let id = instance.instance_id;
        let mut instances = self.instances.write().await;
        if instances.contains_key(&id) {
            return Err(CoreError::InstanceDuplicated);
        }
        let sm = InstanceStateMachine::new(instance, self.meta_store.clone());
        instances.insert(id, sm.clone());
        drop(instances);

        let view = self.clone();
        sm.add_state_change_callback(
            vec![
                crate::state::InstanceState::Exited,
                crate::state::InstanceState::Evicted,
                crate::state::InstanceState::Fatal,
            ],
            "control_view_cleanup",
            Arc::new(move |_snap| {
                let view = view.clone();
                Box::pin(async move {
                    let _ = view.del_instance(id).await;
                })
            }),
        )
        .await;

        Ok(sm)
    }

    /// `spec.md` §4.2 `GetInstance`.
    pub async fn get_instance(&self, instance_id: InstanceId) -> Option<Arc<InstanceStateMachine>> {
        self.instances.read().await.get(&instance_id).cloned()
    }

    /// `spec.md` §4.2 `DelInstance`: removes the instance from the
    /// registry once its SM has reached a terminal state, and erases its
    /// `request_id → instance_id` mapping (`spec.md` §3 "once an instance
    /// reaches a terminal state the mapping is removed"). Does not touch
    /// the metadata store; that's the controller's eviction/reschedule
    /// pipelines' job. Called automatically by the terminal-state cleanup
    /// callback `new_instance` registers, so callers never need to invoke
    /// this directly.
    pub async fn del_instance(&self, instance_id: InstanceId) -> CoreResult<()> {
        let mut instances = self.instances.write().await;
        let Some(sm) = instances.get(&instance_id).cloned() else {
            return Err(CoreError::InstanceNotFound(instance_id.to_string()));
        };
        if !sm.get_instance_state().await.is_terminal() {
            return Err(CoreError::StateMachineError);
        }
        instances.remove(&instance_id);
        drop(instances);

        let request_id = sm.get_request_id().await;
        self.requests.write().await.remove(&request_id);
        Ok(())
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn all_instance_ids(&self) -> Vec<InstanceId> {
        self.instances.read().await.keys().copied().collect()
    }

    /// `spec.md` §4.2 `IsRescheduledRequest`: true when `request_id`
    /// already resolved to an instance that has since left `RUNNING`
    /// (i.e. this is a recovery-driven re-schedule, not a fresh request).
    pub async fn is_rescheduled_request(&self, request_id: &RequestId) -> bool {
        let Some(instance_id) = self.try_get_instance_id_by_request(request_id).await else {
            return false;
        };
        let Some(sm) = self.get_instance(instance_id).await else {
            return true;
        };
        sm.get_instance_state().await != crate::state::InstanceState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::InMemoryMetaStore;
    use crate::state::InstanceState;
    use crate::types::{CreateOptions, Resources, ScheduleOption};
    use crate::types::InstanceStatus;

    fn sample_instance(request_id: &str) -> Instance {
        Instance {
            instance_id: InstanceId::new(),
            request_id: RequestId::new(request_id),
            function: "0/sys.fn".into(),
            tenant_id: "tenant-a".into(),
            parent_id: None,
            parent_proxy_address: None,
            owner_proxy_id: "node-0".into(),
            resources: Resources::default(),
            schedule_option: ScheduleOption::default(),
            create_options: CreateOptions::default(),
            state: InstanceState::New,
            status: InstanceStatus::default(),
            version: 0,
            runtime_id: None,
            runtime_address: None,
            function_agent_id: None,
            schedule_round: 0,
            schedule_times: 0,
            deploy_times: 0,
            is_low_reliability: false,
        }
    }

    #[tokio::test]
    async fn registering_the_same_instance_id_twice_is_rejected() {
        let view = InstanceControlView::new(Arc::new(InMemoryMetaStore::new()));
        let instance = sample_instance("r1");
        let dup = instance.clone();
        view.new_instance(instance).await.unwrap();
        let err = view.new_instance(dup).await.unwrap_err();
        assert_eq!(err, CoreError::InstanceDuplicated);
    }

    #[tokio::test]
    async fn second_begin_in_flight_for_same_request_returns_none() {
        let view = InstanceControlView::new(Arc::new(InMemoryMetaStore::new()));
        let rid = RequestId::new("r2");
        assert!(view.begin_in_flight_request(rid.clone()).await.is_some());
        assert!(view.begin_in_flight_request(rid).await.is_none());
    }

    #[tokio::test]
    async fn resolving_in_flight_request_wakes_subscribers() {
        let view = InstanceControlView::new(Arc::new(InMemoryMetaStore::new()));
        let rid = RequestId::new("r3");
        let mut rx = view.begin_in_flight_request(rid.clone()).await.unwrap();
        let mut late_rx = view.subscribe_in_flight(&rid).await.unwrap();

        let instance_id = InstanceId::new();
        view.resolve_in_flight_request(rid.clone(), ScheduleFanOut(Ok(instance_id)))
            .await;

        assert_eq!(rx.recv().await.unwrap().0.unwrap(), instance_id);
        assert_eq!(late_rx.recv().await.unwrap().0.unwrap(), instance_id);
        assert_eq!(view.try_get_instance_id_by_request(&rid).await, Some(instance_id));
    }

    #[tokio::test]
    async fn del_instance_refuses_non_terminal_state() {
        let view = InstanceControlView::new(Arc::new(InMemoryMetaStore::new()));
        let instance = sample_instance("r4");
        let id = instance.instance_id;
        view.new_instance(instance).await.unwrap();
        let err = view.del_instance(id).await.unwrap_err();
        assert_eq!(err, CoreError::StateMachineError);
        assert!(view.get_instance(id).await.is_some());
    }
}
