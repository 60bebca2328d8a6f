/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-memory fakes for the six consumed interfaces, gated behind the
//! `test-support` feature. Grounded on `oj-core`'s `test-support`-feature
//! fakes in the `alfredjeanlab-oddjobs` example pack, which follows the
//! same "real trait, in-memory impl, feature-gated module" shape for unit
//! and scenario tests without standing up etcd or a worker process.

use crate::collaborators::{
    Decision, DecisionStatus, DeployOutcome, FunctionAgentMgr, FunctionMeta, HeartbeatOutcome,
    LocalSchedService, MetaStore, Observer, PutOp, Scheduler, StatusHint, TxnRequest, TxnResult,
    WorkerClient,
};
use crate::errors::{CoreError, CoreResult};
use crate::types::Instance;
use async_trait::async_trait;
use common::InstanceId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Single-node in-memory store with compare-and-swap semantics equivalent
/// to `MetaStore::commit`'s contract. Not linearizable across instances,
/// which is fine: it only ever backs one test process.
#[derive(Default)]
pub struct InMemoryMetaStore {
    data: Mutex<HashMap<String, (Vec<u8>, u64)>>,
    revision: AtomicU64,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn commit(&self, txn: TxnRequest) -> CoreResult<TxnResult> {
        let mut data = self.data.lock().unwrap();
        if let Some((key, expected_rev)) = &txn.compare_mod_revision {
            let actual = data.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if actual != *expected_rev {
                return Ok(TxnResult {
                    success: false,
                    new_mod_revision: actual,
                });
            }
        }
        let new_rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        for PutOp { key, value } in txn.puts {
            data.insert(key, (value, new_rev));
        }
        Ok(TxnResult {
            success: true,
            new_mod_revision: new_rev,
        })
    }

    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Always schedules onto a fixed agent id; never reports resource
/// exhaustion. Good enough to exercise the schedule pipeline's happy path
/// and persistence without a real placement algorithm.
pub struct AlwaysScheduleFake {
    pub agent_id: String,
}

#[async_trait]
impl Scheduler for AlwaysScheduleFake {
    async fn decide(&self, _instance: &Instance) -> CoreResult<Decision> {
        Ok(Decision {
            status: DecisionStatus::Success,
            agent_id: Some(self.agent_id.clone()),
            message: String::new(),
        })
    }

    async fn confirm(&self, _instance: &Instance) -> CoreResult<()> {
        Ok(())
    }
}

pub struct ResourceExhaustedFake;

#[async_trait]
impl Scheduler for ResourceExhaustedFake {
    async fn decide(&self, _instance: &Instance) -> CoreResult<Decision> {
        Ok(Decision {
            status: DecisionStatus::ResourceNotEnough,
            agent_id: None,
            message: "no agent has capacity".into(),
        })
    }

    async fn confirm(&self, _instance: &Instance) -> CoreResult<()> {
        Err(CoreError::ResourceNotEnough("no agent has capacity".into()))
    }
}

#[derive(Default)]
pub struct InMemoryFunctionAgentMgr {
    pub fail_deploy: Mutex<bool>,
    pub recovering: Mutex<Vec<String>>,
    /// Records every `kill_instance` call for assertions, e.g. the
    /// monopoly-flag expectation in `spec.md` §8 scenario 4.
    pub killed: Mutex<Vec<(InstanceId, String, bool)>>,
}

#[async_trait]
impl FunctionAgentMgr for InMemoryFunctionAgentMgr {
    async fn deploy_instance(&self, instance: &Instance, agent_id: &str) -> CoreResult<DeployOutcome> {
        if *self.fail_deploy.lock().unwrap() {
            return Err(CoreError::InnerCommunication("deploy refused".into()));
        }
        Ok(DeployOutcome {
            runtime_id: format!("rt-{}", instance.instance_id),
            runtime_address: format!("{agent_id}:7000"),
        })
    }

    async fn kill_instance(&self, instance_id: InstanceId, agent_id: &str, is_monopoly: bool) -> CoreResult<()> {
        self.killed.lock().unwrap().push((instance_id, agent_id.to_string(), is_monopoly));
        Ok(())
    }

    async fn query_instance_status_info(
        &self,
        _agent_id: &str,
        _instance_id: InstanceId,
        _runtime_id: &str,
    ) -> CoreResult<StatusHint> {
        Ok(StatusHint::NoHint)
    }

    async fn is_func_agent_recovering(&self, agent_id: &str) -> bool {
        self.recovering.lock().unwrap().iter().any(|a| a == agent_id)
    }
}

#[derive(Default)]
pub struct InMemoryWorkerClient {
    pub heartbeat_outcome: Mutex<HeartbeatOutcome>,
    pub fail_shutdown: Mutex<bool>,
}

#[async_trait]
impl WorkerClient for InMemoryWorkerClient {
    async fn readiness(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn init_call(&self, _payload: Vec<u8>, _timeout_ms: u64) -> CoreResult<()> {
        Ok(())
    }

    async fn heartbeat(&self, _timeout_ms: u64) -> CoreResult<HeartbeatOutcome> {
        Ok(self.heartbeat_outcome.lock().unwrap().clone())
    }

    async fn shutdown(&self, _deadline_ms: u64) -> CoreResult<()> {
        if *self.fail_shutdown.lock().unwrap() {
            return Err(CoreError::RequestBetweenRuntimeBus("shutdown timed out".into()));
        }
        Ok(())
    }

    async fn signal(&self, _signal: i32, _payload: Vec<u8>) -> CoreResult<()> {
        Ok(())
    }

    async fn notify_result(&self, _payload: Vec<u8>) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryObserver {
    pub functions: Mutex<HashMap<String, FunctionMeta>>,
    pub local_instances: Mutex<Vec<InstanceId>>,
}

#[async_trait]
impl Observer for InMemoryObserver {
    async fn lookup_function_meta(&self, function: &str) -> CoreResult<Option<FunctionMeta>> {
        Ok(self.functions.lock().unwrap().get(function).cloned())
    }

    async fn enumerate_local_instances(&self) -> CoreResult<Vec<InstanceId>> {
        Ok(self.local_instances.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct InMemoryLocalSchedService {
    pub forwarded_kills: Mutex<Vec<(InstanceId, i32)>>,
    pub forwarded_call_results: Mutex<Vec<(InstanceId, Vec<u8>)>>,
    /// Overrides `forward_schedule`'s default `RESOURCE_NOT_ENOUGH` reply;
    /// set to exercise the "remote succeeds" branch of `spec.md` §8
    /// scenario 3.
    pub forward_schedule_decision: Mutex<Option<Decision>>,
}

#[async_trait]
impl LocalSchedService for InMemoryLocalSchedService {
    async fn forward_schedule(&self, _instance: &Instance) -> CoreResult<Decision> {
        if let Some(decision) = self.forward_schedule_decision.lock().unwrap().clone() {
            return Ok(decision);
        }
        Ok(Decision {
            status: DecisionStatus::ResourceNotEnough,
            agent_id: None,
            message: "no peer reachable in test fake".into(),
        })
    }

    async fn forward_kill_to_instance_manager(
        &self,
        _owner_proxy_id: &str,
        _request_id: &str,
        _src_instance: InstanceId,
        target: InstanceId,
        signal: i32,
        _payload: Vec<u8>,
    ) -> CoreResult<()> {
        self.forwarded_kills.lock().unwrap().push((target, signal));
        Ok(())
    }

    async fn kill_group(&self, _group_id: &str, _signal: i32) -> CoreResult<()> {
        Ok(())
    }

    async fn query_master_ip(&self) -> CoreResult<String> {
        Ok("127.0.0.1".into())
    }

    async fn forward_call_result(
        &self,
        _owner_proxy_id: &str,
        instance_id: InstanceId,
        _ready_instance: bool,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        self.forwarded_call_results.lock().unwrap().push((instance_id, payload));
        Ok(())
    }
}
