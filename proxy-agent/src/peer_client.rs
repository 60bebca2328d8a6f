/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! `LocalSchedService` over real peer `FunctionProxy` connections.
//!
//! Only the two RPCs this crate's own proto actually carries —
//! `ForwardKill` and `ForwardCallResult` — get a live implementation.
//! `forward_schedule`, `kill_group` and `query_master_ip` address an
//! external local-scheduler / function-master service with no wire
//! contract in `functionproxy.proto`; they return
//! `ERR_INNER_COMMUNICATION` until that peer surface exists.

use api::proto::functionproxy::{
    function_proxy_client::FunctionProxyClient, CallResult, ErrorCode, ForwardCallResultRequest, ForwardKillRequest,
    KillRequest,
};
use async_trait::async_trait;
use common::InstanceId;
use proxy_core::collaborators::{Decision, LocalSchedService, MetaStore};
use proxy_core::types::Instance;
use proxy_core::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::transport::Channel;

fn peer_addr_key(cluster: &str, owner_proxy_id: &str) -> String {
    format!("/{cluster}/nodes/{owner_proxy_id}/addr")
}

/// Caches one connected channel per peer node address, the same
/// lazy-connect-then-reuse shape as the source's per-service gRPC
/// senders (`grpc/sender/statemanager.rs`), generalized from "one fixed
/// peer" to "one peer per `owner_proxy_id`".
pub struct GrpcLocalSchedService {
    cluster: String,
    meta_store: Arc<dyn MetaStore>,
    clients: Mutex<HashMap<String, FunctionProxyClient<Channel>>>,
}

impl GrpcLocalSchedService {
    pub fn new(cluster: impl Into<String>, meta_store: Arc<dyn MetaStore>) -> Self {
        Self {
            cluster: cluster.into(),
            meta_store,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve_addr(&self, owner_proxy_id: &str) -> CoreResult<String> {
        let key = peer_addr_key(&self.cluster, owner_proxy_id);
        let raw = self
            .meta_store
            .get(&key)
            .await?
            .ok_or_else(|| CoreError::InnerCommunication(format!("no known address for peer {owner_proxy_id}")))?;
        String::from_utf8(raw).map_err(|e| CoreError::InnerCommunication(format!("invalid peer address: {e}")))
    }

    async fn client_for(&self, owner_proxy_id: &str) -> CoreResult<FunctionProxyClient<Channel>> {
        if let Some(client) = self.clients.lock().await.get(owner_proxy_id) {
            return Ok(client.clone());
        }
        let addr = self.resolve_addr(owner_proxy_id).await?;
        let endpoint = format!("http://{addr}");
        let client = FunctionProxyClient::connect(endpoint)
            .await
            .map_err(|e| CoreError::InnerCommunication(format!("connect to peer {owner_proxy_id} failed: {e}")))?;
        self.clients.lock().await.insert(owner_proxy_id.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl LocalSchedService for GrpcLocalSchedService {
    async fn forward_schedule(&self, _instance: &Instance) -> CoreResult<Decision> {
        Err(CoreError::InnerCommunication(
            "forward_schedule has no peer surface in this proto; the local-scheduler service is external".into(),
        ))
    }

    async fn forward_kill_to_instance_manager(
        &self,
        owner_proxy_id: &str,
        request_id: &str,
        src_instance: InstanceId,
        target: InstanceId,
        signal: i32,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        let mut client = self.client_for(owner_proxy_id).await?;
        let resp = client
            .forward_kill(ForwardKillRequest {
                request_id: request_id.to_string(),
                src_instance: src_instance.to_string(),
                instance_request_id: request_id.to_string(),
                req: Some(KillRequest {
                    instance_id: target.to_string(),
                    signal,
                    payload,
                }),
            })
            .await
            .map_err(|e| CoreError::InnerCommunication(format!("ForwardKill to {owner_proxy_id} failed: {e}")))?
            .into_inner();

        if resp.code() == ErrorCode::Success {
            Ok(())
        } else {
            Err(CoreError::InnerCommunication(resp.message))
        }
    }

    async fn kill_group(&self, _group_id: &str, _signal: i32) -> CoreResult<()> {
        Err(CoreError::InnerCommunication("kill_group has no peer surface in this proto".into()))
    }

    async fn query_master_ip(&self) -> CoreResult<String> {
        Err(CoreError::InnerCommunication("function-master discovery is not wired up".into()))
    }

    async fn forward_call_result(
        &self,
        owner_proxy_id: &str,
        instance_id: InstanceId,
        ready_instance: bool,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        let mut client = self.client_for(owner_proxy_id).await?;
        let resp = client
            .forward_call_result(ForwardCallResultRequest {
                req: Some(CallResult {
                    request_id: String::new(),
                    code: ErrorCode::Success as i32,
                    message: String::new(),
                    payload,
                }),
                instance_id: instance_id.to_string(),
                ready_instance,
            })
            .await
            .map_err(|e| CoreError::InnerCommunication(format!("ForwardCallResult to {owner_proxy_id} failed: {e}")))?
            .into_inner();

        if resp.code() == ErrorCode::Success {
            Ok(())
        } else {
            Err(CoreError::InnerCommunication("peer rejected forwarded call result".into()))
        }
    }
}
