/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Consumed interfaces (`spec.md` §6). The core treats the metadata store,
//! the scheduling decision, the worker-facing agent manager, the per
//! instance runtime channel, the function-meta/instance observer and the
//! peer local-scheduler-service purely as trait collaborators: this crate
//! owns no etcd client, no gRPC transport and no scheduling algorithm.

use crate::errors::CoreResult;
use crate::types::Instance;
use async_trait::async_trait;
use common::InstanceId;
use std::sync::Arc;

/// A single transactional write: one or more key/expected-mod-revision
/// compares, committed atomically (`spec.md` §4.1 persistence protocol).
#[derive(Debug, Clone)]
pub struct PutOp {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TxnRequest {
    /// `None` means "key must not yet exist"; `Some(rev)` means
    /// `mod_revision(key) == rev`.
    pub compare_mod_revision: Option<(String, u64)>,
    pub puts: Vec<PutOp>,
}

#[derive(Debug, Clone)]
pub struct TxnResult {
    pub success: bool,
    pub new_mod_revision: u64,
}

/// Strongly-consistent KV store with transactional compare-and-swap
/// (`spec.md` §6 `MetaStore`).
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn commit(&self, txn: TxnRequest) -> CoreResult<TxnResult>;
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> CoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionStatus {
    Success,
    ResourceNotEnough,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub status: DecisionStatus,
    pub agent_id: Option<String>,
    pub message: String,
}

/// Pluggable scheduling decision (`spec.md` §6 `Scheduler`). The core
/// consumes a decision; it never implements the placement algorithm.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn decide(&self, instance: &Instance) -> CoreResult<Decision>;
    async fn confirm(&self, instance: &Instance) -> CoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub runtime_id: String,
    pub runtime_address: String,
}

#[derive(Debug, Clone)]
pub enum StatusHint {
    ExceptionInfo { message: String },
    NoHint,
}

/// Worker-facing agent manager (`spec.md` §6 `FunctionAgentMgr`).
#[async_trait]
pub trait FunctionAgentMgr: Send + Sync {
    async fn deploy_instance(&self, instance: &Instance, agent_id: &str) -> CoreResult<DeployOutcome>;
    async fn kill_instance(&self, instance_id: InstanceId, agent_id: &str, is_monopoly: bool) -> CoreResult<()>;
    async fn query_instance_status_info(
        &self,
        agent_id: &str,
        instance_id: InstanceId,
        runtime_id: &str,
    ) -> CoreResult<StatusHint>;
    async fn is_func_agent_recovering(&self, agent_id: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HeartbeatOutcome {
    #[default]
    Ok,
    SubHealth,
    CheckError,
}

/// Per-instance runtime control/data channel (`spec.md` §6 `WorkerClient`).
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn readiness(&self) -> CoreResult<()>;
    async fn init_call(&self, payload: Vec<u8>, timeout_ms: u64) -> CoreResult<()>;
    async fn heartbeat(&self, timeout_ms: u64) -> CoreResult<HeartbeatOutcome>;
    async fn shutdown(&self, deadline_ms: u64) -> CoreResult<()>;
    async fn signal(&self, signal: i32, payload: Vec<u8>) -> CoreResult<()>;
    async fn notify_result(&self, payload: Vec<u8>) -> CoreResult<()>;
}

/// Opens and remembers one `WorkerClient` per instance (`spec.md` §4.3.1
/// step 9 "Runtime connect", §5 "one per instance, single writer").
/// Kept as its own collaborator rather than folded into
/// `FunctionAgentMgr` because the lifetime of a worker channel tracks the
/// instance, not the agent that deployed it.
#[async_trait]
pub trait WorkerClientFactory: Send + Sync {
    async fn connect(&self, instance: &Instance) -> CoreResult<Arc<dyn WorkerClient>>;
    async fn get(&self, instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>>;
    async fn remove(&self, instance_id: InstanceId);
}

#[derive(Debug, Clone)]
pub struct FunctionMeta {
    pub function: String,
    pub code_layers: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Put/del instance events, function-meta lookup, local-instance
/// enumeration (`spec.md` §6 `Observer`).
#[async_trait]
pub trait Observer: Send + Sync {
    async fn lookup_function_meta(&self, function: &str) -> CoreResult<Option<FunctionMeta>>;
    async fn enumerate_local_instances(&self) -> CoreResult<Vec<InstanceId>>;
}

/// Peer RPC surface used to forward requests this node cannot satisfy
/// locally (`spec.md` §6 `LocalSchedService`).
#[async_trait]
pub trait LocalSchedService: Send + Sync {
    async fn forward_schedule(&self, instance: &Instance) -> CoreResult<Decision>;
    async fn forward_kill_to_instance_manager(
        &self,
        owner_proxy_id: &str,
        request_id: &str,
        src_instance: InstanceId,
        target: InstanceId,
        signal: i32,
        payload: Vec<u8>,
    ) -> CoreResult<()>;
    async fn kill_group(&self, group_id: &str, signal: i32) -> CoreResult<()>;
    async fn query_master_ip(&self) -> CoreResult<String>;
    /// Forwards a call-result that arrived on this node for an instance
    /// owned by a peer (`spec.md` §4.3.6, `ForwardCallResultRequest`).
    async fn forward_call_result(
        &self,
        owner_proxy_id: &str,
        instance_id: InstanceId,
        ready_instance: bool,
        payload: Vec<u8>,
    ) -> CoreResult<()>;
}
