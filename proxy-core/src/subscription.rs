/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Subscription Manager (`spec.md` §4.4): lets an instance subscribe to
//! another instance's termination, or to master-address changes, with
//! at-least-once delivery and automatic orphan cleanup.
//!
//! Grounded on `player/statemanager/src/state_machine.rs`'s callback
//! registration (`AddStateChangeCallback`-equivalent hooks fired on state
//! entry), reused here as the delivery mechanism: a subscription is
//! literally a one-shot state-change callback registered on the target
//! SM, keyed so duplicate subscribes are idempotent, with a matching
//! cleanup callback registered on the source SM for orphan prevention.

use crate::collaborators::{WorkerClient, WorkerClientFactory};
use crate::control_view::InstanceControlView;
use crate::errors::{CoreError, CoreResult};
use crate::state::InstanceState;
use crate::state_machine::InstanceSnapshot;
use api::proto::functionproxy::{
    FunctionMasterEventPayload, InstanceTerminationPayload, NotificationPayload,
};
use common::InstanceId;
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Signal number used to deliver subscription notifications over the
/// target's runtime channel (`spec.md` §4.4 "Notification"); mirrors the
/// source's `signal.h` `NOTIFY_SIGNAL`.
pub const NOTIFY_SIGNAL: i32 = 10;

fn termination_callback_key(src: InstanceId) -> String {
    format!("subscribe_instance_termination_{src}")
}

fn orphan_cleanup_key(src: InstanceId, target: InstanceId) -> String {
    format!("unsubscribe_on_exit_{src}_{target}")
}

/// Per-node subscription bookkeeping: the master-IP subscriber set plus
/// the current master address (`spec.md` §4.4 `FunctionMaster`
/// subscriptions).
pub struct SubscriptionManager {
    control_view: Arc<InstanceControlView>,
    worker_clients: Arc<dyn WorkerClientFactory>,
    master_subscribers: RwLock<HashMap<InstanceId, ()>>,
    current_master_ip: RwLock<Option<String>>,
}

impl SubscriptionManager {
    pub fn new(control_view: Arc<InstanceControlView>, worker_clients: Arc<dyn WorkerClientFactory>) -> Arc<Self> {
        Arc::new(Self {
            control_view,
            worker_clients,
            master_subscribers: RwLock::new(HashMap::new()),
            current_master_ip: RwLock::new(None),
        })
    }

    /// `spec.md` §4.4 `Subscribe` for the `InstanceTermination` kind.
    /// Peer-owned targets are out of scope here: the caller (the gRPC
    /// handler) is responsible for forwarding to the owning peer before
    /// reaching this local path.
    pub async fn subscribe_termination(&self, src: InstanceId, target: InstanceId) -> CoreResult<()> {
        let Some(target_sm) = self.control_view.get_instance(target).await else {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        };
        if target_sm.get_instance_state().await.is_terminal() {
            return Err(CoreError::SubStateInvalid);
        }

        let key = termination_callback_key(src);
        if target_sm.has_state_change_callback(&key).await {
            return Ok(());
        }

        let worker_clients = self.worker_clients.clone();
        target_sm
            .add_state_change_callback(
                vec![
                    InstanceState::Exited,
                    InstanceState::Evicted,
                    InstanceState::Fatal,
                    InstanceState::Failed,
                ],
                key,
                Arc::new(move |snap: InstanceSnapshot| {
                    let worker_clients = worker_clients.clone();
                    Box::pin(async move {
                        deliver_termination(&*worker_clients, src, snap.instance_id).await;
                    })
                }),
            )
            .await;

        // Orphan prevention: if src itself terminates first, unsubscribe.
        if let Some(src_sm) = self.control_view.get_instance(src).await {
            let control_view = self.control_view.clone();
            let cleanup_key = orphan_cleanup_key(src, target);
            if !src_sm.has_state_change_callback(&cleanup_key).await {
                src_sm
                    .add_state_change_callback(
                        vec![
                            InstanceState::Exited,
                            InstanceState::Evicted,
                            InstanceState::Fatal,
                            InstanceState::Failed,
                        ],
                        cleanup_key,
                        Arc::new(move |_snap| {
                            let control_view = control_view.clone();
                            Box::pin(async move {
                                if let Some(target_sm) = control_view.get_instance(target).await {
                                    target_sm
                                        .remove_state_change_callback(&termination_callback_key(src))
                                        .await;
                                }
                            })
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// `spec.md` §4.4 `Unsubscribe`, `InstanceTermination` kind.
    /// Idempotent: unsubscribing a target that is already gone, or a
    /// subscription that was never registered, both return `Ok(())`.
    pub async fn unsubscribe_termination(&self, src: InstanceId, target: InstanceId) -> CoreResult<()> {
        let Some(target_sm) = self.control_view.get_instance(target).await else {
            return Ok(());
        };
        target_sm
            .remove_state_change_callback(&termination_callback_key(src))
            .await;
        Ok(())
    }

    /// `spec.md` §4.4 `FunctionMaster` subscribe: register and deliver
    /// the current address immediately, then again on every subsequent
    /// change via `notify_master_ip_to_subscribers`.
    pub async fn subscribe_master(&self, src: InstanceId) -> CoreResult<()> {
        self.master_subscribers.write().await.insert(src, ());
        if let Some(address) = self.current_master_ip.read().await.clone() {
            if let Some(client) = self.worker_clients.get(src).await {
                let _ = client
                    .signal(NOTIFY_SIGNAL, encode_master_event(&address))
                    .await;
            }
        }
        Ok(())
    }

    pub async fn unsubscribe_master(&self, src: InstanceId) -> CoreResult<()> {
        self.master_subscribers.write().await.remove(&src);
        Ok(())
    }

    /// Pushed by the peer-discovery layer whenever the cluster's master
    /// address changes; fans the new address out to every subscriber.
    pub async fn notify_master_ip_to_subscribers(&self, address: String) {
        *self.current_master_ip.write().await = Some(address.clone());
        let subscribers: Vec<InstanceId> = self.master_subscribers.read().await.keys().copied().collect();
        for src in subscribers {
            if let Some(client) = self.worker_clients.get(src).await {
                if let Err(e) = client.signal(NOTIFY_SIGNAL, encode_master_event(&address)).await {
                    warn!(%src, error = %e, "master-ip notification delivery failed, subscriber's own terminal transition will clean this up");
                }
            }
        }
    }
}

async fn deliver_termination(worker_clients: &dyn WorkerClientFactory, src: InstanceId, target: InstanceId) {
    if let Some(client) = worker_clients.get(src).await {
        let payload = encode_termination_event(target);
        if let Err(e) = client.signal(NOTIFY_SIGNAL, payload).await {
            warn!(%src, %target, error = %e, "termination notification delivery failed, relies on at-least-once retry or subscriber's own terminal cleanup");
        }
    }
}

fn encode_termination_event(instance_id: InstanceId) -> Vec<u8> {
    NotificationPayload {
        kind: Some(api::proto::functionproxy::notification_payload::Kind::InstanceTermination(
            InstanceTerminationPayload {
                instance_id: instance_id.to_string(),
            },
        )),
    }
    .encode_to_vec()
}

fn encode_master_event(address: &str) -> Vec<u8> {
    NotificationPayload {
        kind: Some(api::proto::functionproxy::notification_payload::Kind::FunctionMasterEvent(
            FunctionMasterEventPayload {
                address: address.to_string(),
            },
        )),
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::HeartbeatOutcome;
    use crate::errors::CoreResult;
    use crate::fakes::InMemoryMetaStore;
    use crate::state_machine::TransitionCtx;
    use crate::types::{CreateOptions, Instance, InstanceStatus, Resources, ScheduleOption};
    use common::RequestId;
    use std::sync::Mutex;

    fn sample_instance() -> Instance {
        Instance {
            instance_id: InstanceId::new(),
            request_id: RequestId::new("r"),
            function: "0/sys.fn".into(),
            tenant_id: "tenant-a".into(),
            parent_id: None,
            parent_proxy_address: None,
            owner_proxy_id: "node-0".into(),
            resources: Resources::default(),
            schedule_option: ScheduleOption::default(),
            create_options: CreateOptions::default(),
            state: InstanceState::Running,
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

    #[derive(Default)]
    struct RecordingWorkerClient {
        signals: Mutex<Vec<(i32, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl WorkerClient for RecordingWorkerClient {
        async fn readiness(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn init_call(&self, _payload: Vec<u8>, _timeout_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn heartbeat(&self, _timeout_ms: u64) -> CoreResult<HeartbeatOutcome> {
            Ok(HeartbeatOutcome::Ok)
        }
        async fn shutdown(&self, _deadline_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn signal(&self, signal: i32, payload: Vec<u8>) -> CoreResult<()> {
            self.signals.lock().unwrap().push((signal, payload));
            Ok(())
        }
        async fn notify_result(&self, _payload: Vec<u8>) -> CoreResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct SingleClientRegistry {
        for_id: Mutex<Option<InstanceId>>,
        client: Arc<RecordingWorkerClient>,
    }

    #[async_trait::async_trait]
    impl WorkerClientFactory for SingleClientRegistry {
        async fn connect(&self, _instance: &crate::types::Instance) -> CoreResult<Arc<dyn WorkerClient>> {
            Ok(self.client.clone() as Arc<dyn WorkerClient>)
        }

        async fn get(&self, instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>> {
            if *self.for_id.lock().unwrap() == Some(instance_id) {
                Some(self.client.clone() as Arc<dyn WorkerClient>)
            } else {
                None
            }
        }

        async fn remove(&self, _instance_id: InstanceId) {}
    }

    #[tokio::test]
    async fn subscribing_to_terminal_target_is_rejected() {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store);
        let mut target = sample_instance();
        target.state = InstanceState::Fatal;
        let target_id = target.instance_id;
        view.new_instance(target).await.unwrap();

        let registry = Arc::new(SingleClientRegistry::default());
        let submgr = SubscriptionManager::new(view, registry);
        let err = submgr
            .subscribe_termination(InstanceId::new(), target_id)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::SubStateInvalid);
    }

    #[tokio::test]
    async fn termination_delivers_notify_signal_to_subscriber() {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store);
        let target = sample_instance();
        let target_id = target.instance_id;
        let target_sm = view.new_instance(target).await.unwrap();

        let src_id = InstanceId::new();
        let client = Arc::new(RecordingWorkerClient::default());
        let registry = Arc::new(SingleClientRegistry {
            for_id: Mutex::new(Some(src_id)),
            client: client.clone(),
        });

        let submgr = SubscriptionManager::new(view, registry);
        submgr.subscribe_termination(src_id, target_id).await.unwrap();

        target_sm
            .transition_to(TransitionCtx::to(InstanceState::Exiting))
            .await
            .unwrap();
        target_sm
            .transition_to(TransitionCtx::to(InstanceState::Exited))
            .await
            .unwrap();

        let signals = client.signals.lock().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].0, NOTIFY_SIGNAL);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store);
        let target = sample_instance();
        let target_id = target.instance_id;
        view.new_instance(target).await.unwrap();

        let src_id = InstanceId::new();
        let registry = Arc::new(SingleClientRegistry::default());
        let submgr = SubscriptionManager::new(view, registry);
        submgr.subscribe_termination(src_id, target_id).await.unwrap();
        submgr.subscribe_termination(src_id, target_id).await.unwrap();

        let target_sm = submgr.control_view.get_instance(target_id).await.unwrap();
        assert!(
            target_sm
                .has_state_change_callback(&termination_callback_key(src_id))
                .await
        );
    }
}
