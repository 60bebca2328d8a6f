/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Boundary stand-ins for the collaborators the instance-lifecycle core
//! treats as pure interfaces and explicitly keeps out of its own scope:
//! the placement algorithm, the worker-facing function-agent process and
//! its per-instance runtime channel, and the function-meta/local-instance
//! observer. None of those have a wire contract in `functionproxy.proto`
//! or anywhere else in this workspace, so this binary can't stand up a
//! real client for them; it wires up these stand-ins instead and reports
//! a clear boundary error rather than silently fabricating a decision.
//! A real deployment replaces this module with adapters for whatever
//! scheduler and function-agent processes the cluster actually runs.

use async_trait::async_trait;
use common::InstanceId;
use proxy_core::collaborators::{
    Decision, DeployOutcome, FunctionAgentMgr, FunctionMeta, HeartbeatOutcome, Observer, Scheduler, StatusHint,
    WorkerClient, WorkerClientFactory,
};
use proxy_core::types::Instance;
use proxy_core::{CoreError, CoreResult};
use std::sync::Arc;

pub struct UnconfiguredScheduler;

#[async_trait]
impl Scheduler for UnconfiguredScheduler {
    async fn decide(&self, _instance: &Instance) -> CoreResult<Decision> {
        Err(CoreError::InnerSystemError("no scheduler backend configured".into()))
    }

    async fn confirm(&self, _instance: &Instance) -> CoreResult<()> {
        Err(CoreError::InnerSystemError("no scheduler backend configured".into()))
    }
}

pub struct UnconfiguredFunctionAgentMgr;

#[async_trait]
impl FunctionAgentMgr for UnconfiguredFunctionAgentMgr {
    async fn deploy_instance(&self, _instance: &Instance, agent_id: &str) -> CoreResult<DeployOutcome> {
        Err(CoreError::InnerCommunication(format!("no function-agent client configured for {agent_id}")))
    }

    async fn kill_instance(&self, _instance_id: InstanceId, agent_id: &str, _is_monopoly: bool) -> CoreResult<()> {
        Err(CoreError::InnerCommunication(format!("no function-agent client configured for {agent_id}")))
    }

    async fn query_instance_status_info(
        &self,
        agent_id: &str,
        _instance_id: InstanceId,
        _runtime_id: &str,
    ) -> CoreResult<StatusHint> {
        Err(CoreError::InnerCommunication(format!("no function-agent client configured for {agent_id}")))
    }

    async fn is_func_agent_recovering(&self, _agent_id: &str) -> bool {
        false
    }
}

pub struct UnconfiguredWorkerClient;

#[async_trait]
impl WorkerClient for UnconfiguredWorkerClient {
    async fn readiness(&self) -> CoreResult<()> {
        Err(CoreError::RequestBetweenRuntimeBus("no runtime channel configured".into()))
    }

    async fn init_call(&self, _payload: Vec<u8>, _timeout_ms: u64) -> CoreResult<()> {
        Err(CoreError::RequestBetweenRuntimeBus("no runtime channel configured".into()))
    }

    async fn heartbeat(&self, _timeout_ms: u64) -> CoreResult<HeartbeatOutcome> {
        Err(CoreError::RequestBetweenRuntimeBus("no runtime channel configured".into()))
    }

    async fn shutdown(&self, _deadline_ms: u64) -> CoreResult<()> {
        Err(CoreError::RequestBetweenRuntimeBus("no runtime channel configured".into()))
    }

    async fn signal(&self, _signal: i32, _payload: Vec<u8>) -> CoreResult<()> {
        Err(CoreError::RequestBetweenRuntimeBus("no runtime channel configured".into()))
    }

    async fn notify_result(&self, _payload: Vec<u8>) -> CoreResult<()> {
        Err(CoreError::RequestBetweenRuntimeBus("no runtime channel configured".into()))
    }
}

#[derive(Default)]
pub struct UnconfiguredWorkerClientFactory;

#[async_trait]
impl WorkerClientFactory for UnconfiguredWorkerClientFactory {
    async fn connect(&self, _instance: &Instance) -> CoreResult<Arc<dyn WorkerClient>> {
        Ok(Arc::new(UnconfiguredWorkerClient))
    }

    async fn get(&self, _instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>> {
        Some(Arc::new(UnconfiguredWorkerClient))
    }

    async fn remove(&self, _instance_id: InstanceId) {}
}

#[derive(Default)]
pub struct UnconfiguredObserver;

#[async_trait]
impl Observer for UnconfiguredObserver {
    async fn lookup_function_meta(&self, _function: &str) -> CoreResult<Option<FunctionMeta>> {
        Ok(None)
    }

    async fn enumerate_local_instances(&self) -> CoreResult<Vec<InstanceId>> {
        Ok(Vec::new())
    }
}
