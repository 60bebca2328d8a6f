/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Call-result forwarding (`spec.md` §4.3.6): a worker's call result for
//! an instance this node doesn't own gets relayed to the owning peer,
//! deduped on `request_id` exactly like `kill` (`spec.md` §4.3.3).

use super::InstanceController;
use crate::errors::{CoreError, CoreResult};
use common::InstanceId;
use std::sync::Arc;
use tokio::sync::broadcast;

impl InstanceController {
    pub async fn forward_call_result(
        self: &Arc<Self>,
        request_id: String,
        instance_id: InstanceId,
        ready_instance: bool,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        if request_id.is_empty() {
            return self.deliver_call_result(instance_id, ready_instance, payload).await;
        }

        let existing = {
            let inflight = self.call_result_inflight.lock().await;
            inflight.get(&request_id).cloned()
        };
        if let Some(tx) = existing {
            let mut rx = tx.subscribe();
            return rx
                .recv()
                .await
                .map_err(|_| CoreError::InnerCommunication("call-result dedup channel closed".into()))?;
        }

        let tx = {
            let mut inflight = self.call_result_inflight.lock().await;
            match inflight.get(&request_id) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, _rx) = broadcast::channel(4);
                    inflight.insert(request_id.clone(), tx.clone());
                    tx
                }
            }
        };

        let result = self.deliver_call_result(instance_id, ready_instance, payload).await;
        self.call_result_inflight.lock().await.remove(&request_id);
        let _ = tx.send(result.clone());
        result
    }

    async fn deliver_call_result(&self, instance_id: InstanceId, ready_instance: bool, payload: Vec<u8>) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(instance_id).await else {
            return Err(CoreError::InstanceNotFound(instance_id.to_string()));
        };
        let owner = sm.get_owner().await;
        if owner != self.node_id {
            return self.local_sched.forward_call_result(&owner, instance_id, ready_instance, payload).await;
        }
        let Some(client) = self.worker_clients.get(instance_id).await else {
            return Err(CoreError::InstanceNotFound(instance_id.to_string()));
        };
        client.notify_result(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LocalSchedService, WorkerClient, WorkerClientFactory};
    use crate::control_view::InstanceControlView;
    use crate::fakes::{AlwaysScheduleFake, InMemoryFunctionAgentMgr, InMemoryLocalSchedService, InMemoryMetaStore, InMemoryObserver};
    use crate::ratelimit::CreateRateLimiter;
    use crate::state::InstanceState;
    use crate::subscription::SubscriptionManager;
    use crate::types::{CreateOptions, Instance, InstanceStatus, Resources, ScheduleOption};
    use common::RequestId;
    use std::sync::Mutex as StdMutex;

    fn running_instance(owner: &str) -> Instance {
        Instance {
            instance_id: InstanceId::new(),
            request_id: RequestId::new("r"),
            function: "0/sys.fn".into(),
            tenant_id: "tenant-a".into(),
            parent_id: None,
            parent_proxy_address: None,
            owner_proxy_id: owner.into(),
            resources: Resources::default(),
            schedule_option: ScheduleOption::default(),
            create_options: CreateOptions::default(),
            state: InstanceState::Running,
            status: InstanceStatus::default(),
            version: 0,
            runtime_id: Some("rt-1".into()),
            runtime_address: Some("127.0.0.1:7000".into()),
            function_agent_id: Some("agent-1".into()),
            schedule_round: 0,
            schedule_times: 0,
            deploy_times: 0,
            is_low_reliability: false,
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        results: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl WorkerClient for RecordingClient {
        async fn readiness(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn init_call(&self, _payload: Vec<u8>, _timeout_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn heartbeat(&self, _timeout_ms: u64) -> CoreResult<crate::collaborators::HeartbeatOutcome> {
            Ok(crate::collaborators::HeartbeatOutcome::Ok)
        }
        async fn shutdown(&self, _deadline_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn signal(&self, _signal: i32, _payload: Vec<u8>) -> CoreResult<()> {
            Ok(())
        }
        async fn notify_result(&self, payload: Vec<u8>) -> CoreResult<()> {
            self.results.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FixedFactory {
        client: Arc<RecordingClient>,
    }

    #[async_trait::async_trait]
    impl WorkerClientFactory for FixedFactory {
        async fn connect(&self, _instance: &Instance) -> CoreResult<Arc<dyn WorkerClient>> {
            Ok(self.client.clone())
        }
        async fn get(&self, _instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>> {
            Some(self.client.clone())
        }
        async fn remove(&self, _instance_id: InstanceId) {}
    }

    async fn controller_with(
        instance: Instance,
        local_sched: Arc<dyn LocalSchedService>,
    ) -> (Arc<InstanceController>, InstanceId, Arc<RecordingClient>) {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store.clone());
        let sm = view.new_instance(instance).await.unwrap();
        let instance_id = sm.get_instance_context_copy().await.instance_id;

        let worker_clients = Arc::new(FixedFactory::default());
        let client = worker_clients.client.clone();
        let rate_limiter = Arc::new(CreateRateLimiter::new(10, 1));
        let subscriptions = SubscriptionManager::new(view.clone(), worker_clients.clone());
        let controller = InstanceController::new(
            "node-0",
            view,
            store,
            Arc::new(AlwaysScheduleFake { agent_id: "agent-2".into() }),
            Arc::new(InMemoryFunctionAgentMgr::default()),
            Arc::new(InMemoryObserver::default()),
            local_sched,
            worker_clients,
            rate_limiter,
            subscriptions,
        );
        (controller, instance_id, client)
    }

    #[tokio::test]
    async fn local_target_delivers_to_worker_client() {
        let (controller, instance_id, client) =
            controller_with(running_instance("node-0"), Arc::new(InMemoryLocalSchedService::default())).await;

        controller
            .forward_call_result("r1".into(), instance_id, true, b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(client.results.lock().unwrap().as_slice(), [b"payload".to_vec()]);
    }

    #[tokio::test]
    async fn remote_owner_forwards_through_local_sched() {
        let local_sched = Arc::new(InMemoryLocalSchedService::default());
        let (controller, instance_id, _client) = controller_with(running_instance("node-1"), local_sched.clone()).await;

        controller
            .forward_call_result("r1".into(), instance_id, false, b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(local_sched.forwarded_call_results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_request_id_is_served_once() {
        let (controller, instance_id, client) =
            controller_with(running_instance("node-0"), Arc::new(InMemoryLocalSchedService::default())).await;

        let (a, b) = tokio::join!(
            controller.forward_call_result("dup".into(), instance_id, true, b"x".to_vec()),
            controller.forward_call_result("dup".into(), instance_id, true, b"x".to_vec())
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(client.results.lock().unwrap().len(), 1);
    }
}
